//! Typed failures raised at the network and storage boundaries.

use thiserror::Error;

/// Failure of a single profile lookup.
///
/// Only `RateLimited` feeds the rate controller; the other variants count as
/// an unknown outcome for that attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("remote service rejected the lookup with a rate limit")]
    RateLimited,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("could not decode response: {0}")]
    Decode(String),
}

/// Failure of the durable key-value store or of its record codec.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("record codec: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("store io: {0}")]
    Io(#[from] std::io::Error),
}

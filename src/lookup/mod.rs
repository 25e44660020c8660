//! Profile lookup abstraction and concrete implementations.

pub mod http;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::protocol::ProfileLocation;

/// Privileged call that fetches one handle's declared account region.
///
/// A profile without region data is a successful lookup with
/// `raw_location: None`, not an error.
#[async_trait(?Send)]
pub trait ProfileFetcher {
    async fn fetch_location(&self, handle: &str) -> Result<ProfileLocation, FetchError>;
}

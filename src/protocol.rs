//! Data model shared by all pipeline components.
//!
//! This module defines the values that flow between discovery, the queue,
//! the rate controller, both caches, the projector and the diagnostics panel.

/// Opaque identifier of a timeline author, compared by exact string equality.
pub type Handle = String;

/// Label shown when a region could not be derived.
pub const UNKNOWN_LABEL: &str = "Unknown";

/// Returns `true` when a label may be cached, persisted or rendered.
pub fn is_valid_label(label: &str) -> bool {
    !label.trim().is_empty() && label != UNKNOWN_LABEL
}

/// A resolved label for one handle. Never mutated, only superseded.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct EnrichmentResult {
    pub handle: Handle,
    pub label: String,
    /// Unix milliseconds at which the lookup completed.
    pub resolved_at: i64,
}

impl EnrichmentResult {
    pub fn new(handle: impl Into<Handle>, label: impl Into<String>, resolved_at: i64) -> Self {
        Self {
            handle: handle.into(),
            label: label.into(),
            resolved_at,
        }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_label(&self.label)
    }
}

/// Pending interest in one handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub handle: Handle,
    /// Unix milliseconds at which the interest was registered.
    pub enqueued_at: i64,
}

/// Successful profile lookup decoded at the network boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileLocation {
    /// Canonical screen name reported by the remote service.
    pub handle: Handle,
    /// Free-text declared account region; `None` when the profile has none.
    pub raw_location: Option<String>,
}

/// Remaining per-handle backoff, as shown by the diagnostics panel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffReport {
    pub handle: Handle,
    pub seconds_remaining: u64,
}

/// Read-only counters published for the diagnostics panel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub queue_depth: usize,
    pub cache_entries: usize,
    pub active_backoffs: Vec<BackoffReport>,
    pub global_pause_seconds_remaining: u64,
    /// Durable store footprint, when the store could report it.
    pub store_bytes: Option<u64>,
    pub lookups_dispatched: u64,
    pub lookups_rejected: u64,
    pub lookups_failed: u64,
    pub stale_evictions: u64,
}

//! Session-lived handle → result map consulted before any queuing or lookup.

use std::collections::{HashMap, HashSet};

use crate::protocol::{EnrichmentResult, Handle};

/// In-memory results for the current page session.
///
/// Callers only `put` valid results. Handles whose lookup produced no usable
/// label are tracked apart so `get` can never hand one back.
#[derive(Debug, Default)]
pub struct EnrichmentCache {
    results: HashMap<Handle, EnrichmentResult>,
    known_unknown: HashSet<Handle>,
}

impl EnrichmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: &str) -> Option<&EnrichmentResult> {
        self.results.get(handle)
    }

    pub fn put(&mut self, handle: impl Into<Handle>, result: EnrichmentResult) {
        let handle = handle.into();
        self.known_unknown.remove(&handle);
        self.results.insert(handle, result);
    }

    pub fn remember_unknown(&mut self, handle: impl Into<Handle>) {
        self.known_unknown.insert(handle.into());
    }

    pub fn is_known_unknown(&self, handle: &str) -> bool {
        self.known_unknown.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Drops everything, including known-unknown handles, on session teardown.
    pub fn clear(&mut self) {
        self.results.clear();
        self.known_unknown.clear();
    }
}

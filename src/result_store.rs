//! Durable handle → label cache with lazy expiry.
//!
//! All records live in one serialized mapping under a single storage key.
//! Reads sweep expired records before answering; writes are last-write-wins.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};

use crate::durable_store::DurableStore;
use crate::error::StoreError;
use crate::protocol::{EnrichmentResult, Handle};

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
struct StoredRecord {
    label: String,
    resolved_at: i64,
}

type StoredMapping = HashMap<Handle, StoredRecord>;

/// Best-effort persistence of valid results across reloads.
pub struct ResultStore {
    backend: Rc<dyn DurableStore>,
    storage_key: String,
    expiry_horizon_ms: i64,
}

impl ResultStore {
    pub fn new(
        backend: Rc<dyn DurableStore>,
        storage_key: impl Into<String>,
        expiry_horizon: Duration,
    ) -> Self {
        Self {
            backend,
            storage_key: storage_key.into(),
            expiry_horizon_ms: i64::try_from(expiry_horizon.as_millis()).unwrap_or(i64::MAX),
        }
    }

    fn is_expired(&self, record: &StoredRecord, now_unix_ms: i64) -> bool {
        now_unix_ms.saturating_sub(record.resolved_at) > self.expiry_horizon_ms
    }

    async fn read_mapping(&self) -> Result<StoredMapping, StoreError> {
        let Some(bytes) = self.backend.get(&self.storage_key).await? else {
            return Ok(StoredMapping::new());
        };
        match serde_json::from_slice::<StoredMapping>(&bytes) {
            Ok(mapping) => Ok(mapping),
            Err(error) => {
                // A corrupt blob would otherwise block every future write.
                warn!("Discarding unreadable result store mapping: {}", error);
                Ok(StoredMapping::new())
            }
        }
    }

    async fn write_mapping(&self, mapping: &StoredMapping) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(mapping)?;
        self.backend.set(&self.storage_key, &bytes).await
    }

    /// Returns the stored result for `handle`, purging every expired record first.
    pub async fn load(
        &self,
        handle: &str,
        now_unix_ms: i64,
    ) -> Result<Option<EnrichmentResult>, StoreError> {
        let mut mapping = self.read_mapping().await?;
        let removed = self.retain_fresh(&mut mapping, now_unix_ms);
        if removed > 0 {
            debug!("Result store purged {} expired records on load", removed);
            self.write_mapping(&mapping).await?;
        }
        Ok(mapping.get(handle).map(|record| {
            EnrichmentResult::new(handle, record.label.clone(), record.resolved_at)
        }))
    }

    /// Persists a valid result. Invalid results are ignored.
    pub async fn save(&self, handle: &str, result: &EnrichmentResult) -> Result<(), StoreError> {
        if !result.is_valid() {
            return Ok(());
        }
        let mut mapping = self.read_mapping().await?;
        mapping.insert(
            handle.to_string(),
            StoredRecord {
                label: result.label.clone(),
                resolved_at: result.resolved_at,
            },
        );
        self.write_mapping(&mapping).await
    }

    /// Sweeps records older than the expiry horizon and returns how many were removed.
    pub async fn purge_expired(&self, now_unix_ms: i64) -> Result<usize, StoreError> {
        let mut mapping = self.read_mapping().await?;
        let removed = self.retain_fresh(&mut mapping, now_unix_ms);
        if removed > 0 {
            self.write_mapping(&mapping).await?;
        }
        Ok(removed)
    }

    pub async fn size_estimate(&self) -> Result<u64, StoreError> {
        self.backend.size_estimate().await
    }

    fn retain_fresh(&self, mapping: &mut StoredMapping, now_unix_ms: i64) -> usize {
        let before = mapping.len();
        mapping.retain(|_, record| !self.is_expired(record, now_unix_ms));
        before - mapping.len()
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::time::Duration;

    use super::ResultStore;
    use crate::durable_store::{DurableStore, MemoryKvStore};
    use crate::protocol::{EnrichmentResult, UNKNOWN_LABEL};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn store_with_backend() -> (ResultStore, Rc<MemoryKvStore>) {
        let backend = Rc::new(MemoryKvStore::new());
        let store = ResultStore::new(
            backend.clone(),
            "handle_label_cache",
            Duration::from_secs(10 * 24 * 60 * 60),
        );
        (store, backend)
    }

    #[tokio::test]
    async fn test_save_then_load_returns_result() {
        let (store, _) = store_with_backend();
        let result = EnrichmentResult::new("alice", "Japan", 1_000);

        store.save("alice", &result).await.expect("save should succeed");

        let loaded = store.load("alice", 2_000).await.expect("load should succeed");
        assert_eq!(loaded, Some(result));
        assert_eq!(store.load("bob", 2_000).await.expect("load should succeed"), None);
    }

    #[tokio::test]
    async fn test_load_purges_expired_records_for_other_handles() {
        let (store, _) = store_with_backend();
        store
            .save("old", &EnrichmentResult::new("old", "France", 0))
            .await
            .expect("save should succeed");
        store
            .save("fresh", &EnrichmentResult::new("fresh", "Canada", 10 * DAY_MS))
            .await
            .expect("save should succeed");

        // Loading an unrelated handle still sweeps the expired record.
        let now = 11 * DAY_MS;
        assert!(store.load("fresh", now).await.expect("load").is_some());
        assert_eq!(store.purge_expired(now).await.expect("purge"), 0);
        assert!(store.load("old", now).await.expect("load").is_none());
    }

    #[tokio::test]
    async fn test_save_ignores_invalid_labels() {
        let (store, backend) = store_with_backend();
        store
            .save("bob", &EnrichmentResult::new("bob", UNKNOWN_LABEL, 0))
            .await
            .expect("save should succeed");

        assert!(backend
            .get("handle_label_cache")
            .await
            .expect("backend get")
            .is_none());
    }

    #[tokio::test]
    async fn test_corrupt_mapping_is_replaced_on_next_save() {
        let (store, backend) = store_with_backend();
        backend
            .set("handle_label_cache", b"not json")
            .await
            .expect("backend set");

        assert_eq!(store.load("alice", 0).await.expect("load"), None);
        store
            .save("alice", &EnrichmentResult::new("alice", "Germany", 0))
            .await
            .expect("save should succeed");
        assert!(store.load("alice", 0).await.expect("load").is_some());
    }
}

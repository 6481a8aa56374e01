//! In-memory [`StatusStore`] keeping per-key records ordered by timestamp.

use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StreamError;
use crate::model::{StatusRecord, VehicleKey};

use super::StatusStore;

/// Append-only in-memory store, suitable for tests and demos.
///
/// Records are kept sorted by timestamp per key; out-of-order saves are
/// inserted at the right position so `find_latest` stays correct.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<VehicleKey, Vec<StatusRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStore {
    async fn find_latest(&self, key: &str) -> Result<Option<StatusRecord>, StreamError> {
        let records = self.records.read().await;
        Ok(records.get(key).and_then(|v| v.last().cloned()))
    }

    async fn find_in_range(
        &self,
        key: &str,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<StatusRecord>, StreamError> {
        let records = self.records.read().await;
        Ok(records
            .get(key)
            .map(|v| {
                v.iter()
                    .filter(|r| r.timestamp >= start && r.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save(&self, record: StatusRecord) -> Result<StatusRecord, StreamError> {
        let mut records = self.records.write().await;
        let list = records.entry(record.key.clone()).or_default();
        let pos = list.partition_point(|r| r.timestamp <= record.timestamp);
        list.insert(pos, record.clone());
        Ok(record)
    }

    async fn exists(&self, key: &str) -> Result<bool, StreamError> {
        let records = self.records.read().await;
        Ok(records.get(key).is_some_and(|v| !v.is_empty()))
    }
}

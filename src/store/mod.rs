//! # Persistence collaborator.
//!
//! The engine never owns durable storage; it consumes a [`StatusStore`] and
//! only ever asks for the latest record, a time-bounded list, an existence
//! check, or a save. [`MemoryStore`] is the in-process implementation used
//! by tests and demos.

mod memory;

use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::StreamError;
use crate::model::StatusRecord;

pub use memory::MemoryStore;

/// Storage seam for status records.
///
/// Implementations must uphold record immutability: `save` appends, never
/// rewrites, so `find_latest` is always the newest record by timestamp.
#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
    /// Returns the newest record for `key`, if any.
    async fn find_latest(&self, key: &str) -> Result<Option<StatusRecord>, StreamError>;

    /// Returns all records for `key` with `start <= timestamp <= end`,
    /// oldest first.
    async fn find_in_range(
        &self,
        key: &str,
        start: SystemTime,
        end: SystemTime,
    ) -> Result<Vec<StatusRecord>, StreamError>;

    /// Appends a record and returns the stored value.
    async fn save(&self, record: StatusRecord) -> Result<StatusRecord, StreamError>;

    /// True if at least one record exists for `key`.
    async fn exists(&self, key: &str) -> Result<bool, StreamError>;
}

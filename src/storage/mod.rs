//! Durable storage for acquired samples and user presets
//!
//! - `history`: sled-backed `modbus_data` store with the historical query engine
//! - `writer`: persistence writer that batches samples off the poll path
//! - `presets`: named register configs and custom functions
//!
//! The writer only sees the `SampleStore` trait, so a session can persist to
//! sled or, in tests, to `InMemoryStore`.

pub mod history;
pub mod presets;
pub mod writer;

pub use history::{group_by_address, DeletionPlan, HistoryStats, HistoryStore, RecordFilter};
pub use presets::{CustomFunction, PresetStore, RegisterPreset};
pub use writer::{PersistenceWriter, QueueStats, SampleQueue, WriterStats};

use std::sync::RwLock;

use crate::types::{PersistedRecord, Sample};

/// Storage errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Batch sink for the persistence writer.
///
/// `append_batch` must be all-or-nothing: on `Err` no row of the batch is
/// visible to readers.
pub trait SampleStore: Send + Sync {
    /// Persist a batch in order, returning the assigned ids.
    fn append_batch(&self, batch: &[Sample]) -> Result<Vec<u64>, StorageError>;

    /// Force written data to disk.
    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Non-durable store for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<Vec<PersistedRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PersistedRecord> {
        self.records.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleStore for InMemoryStore {
    fn append_batch(&self, batch: &[Sample]) -> Result<Vec<u64>, StorageError> {
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let first = records.last().map_or(1, |r| r.id + 1);
        let ids: Vec<u64> = (first..).take(batch.len()).collect();
        records.extend(
            batch
                .iter()
                .zip(&ids)
                .map(|(sample, id)| PersistedRecord::from_sample(*id, sample)),
        );
        Ok(ids)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

//! Storage adapters implementing the domain ports.

pub mod in_memory;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;

use crate::domain::ports::{AnomalyStoreRef, JobQueueRef, LedgerStoreRef, RawEventStoreRef};
use std::sync::Arc;

/// The durable tables one deployment runs against.
#[derive(Clone)]
pub struct Stores {
    pub raw_events: RawEventStoreRef,
    pub queue: JobQueueRef,
    pub ledger: LedgerStoreRef,
    pub anomalies: AnomalyStoreRef,
}

impl Stores {
    pub fn in_memory() -> Self {
        Self {
            raw_events: Arc::new(in_memory::InMemoryRawEventStore::new()),
            queue: Arc::new(in_memory::InMemoryJobQueue::new()),
            ledger: Arc::new(in_memory::InMemoryLedgerStore::new()),
            anomalies: Arc::new(in_memory::InMemoryAnomalyStore::new()),
        }
    }

    /// Every table lives in column families of the same database.
    #[cfg(feature = "storage-rocksdb")]
    pub fn rocksdb<P: AsRef<std::path::Path>>(path: P) -> crate::error::Result<Self> {
        let store = rocksdb::RocksDbStore::open(path)?;
        Ok(Self {
            raw_events: Arc::new(store.clone()),
            queue: Arc::new(store.clone()),
            ledger: Arc::new(store.clone()),
            anomalies: Arc::new(store),
        })
    }
}

//! Embedded ordered key-value backend.
//!
//! Records are CBOR blobs under `/<table>/<key>`. Field queries are a prefix
//! scan followed by an in-memory filter.

mod memory;
mod repo;
#[cfg(feature = "rocksdb")]
mod rocks;
mod state_store;

pub use memory::MemoryKv;
pub use repo::KvRepo;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksKv;
pub use state_store::StateStore;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered byte store. Implementations serialize concurrent writes to the same key.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn delete(&self, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply every operation or none.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

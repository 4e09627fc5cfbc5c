use super::{BatchOp, KvStore};
use crate::error::{Result, StoreError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

pub struct RocksKv {
    db: Arc<DB>,
}

impl RocksKv {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        // Deal records are small and written often.
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_max_background_jobs(2);
        opts.set_level_compaction_dynamic_level_bytes(true);

        Self::with_options(path, opts)
    }

    pub fn with_options<P: AsRef<Path>>(path: P, opts: Options) -> Result<Self> {
        let db = DB::open(&opts, path)
            .map_err(|e| StoreError::Backend(format!("Failed to open RocksDB: {}", e)))?;

        Ok(Self { db: Arc::new(db) })
    }
}

impl KvStore for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Backend(format!("RocksDB get error: {}", e)))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| StoreError::Backend(format!("RocksDB put error: {}", e)))
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.db
            .delete(key)
            .map_err(|e| StoreError::Backend(format!("RocksDB delete error: {}", e)))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let iter = self.db.iterator(IteratorMode::From(prefix, Direction::Forward));
        let mut entries = Vec::new();

        for item in iter {
            let (key, value) =
                item.map_err(|e| StoreError::Backend(format!("Iterator error: {}", e)))?;

            if !key.starts_with(prefix) {
                break;
            }

            entries.push((key.to_vec(), value.to_vec()));
        }

        Ok(entries)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                BatchOp::Put(k, v) => batch.put(k, v),
                BatchOp::Delete(k) => batch.delete(k),
            }
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Backend(format!("RocksDB batch write error: {}", e)))
    }

    fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(format!("RocksDB flush error: {}", e)))
    }
}

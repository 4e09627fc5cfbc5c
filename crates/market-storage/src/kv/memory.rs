use super::{BatchOp, KvStore};
use crate::error::{Result, StoreError};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-process ordered store, used for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.entries
            .read()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>> {
        self.entries
            .write()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".to_string()))
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.read()?.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.write()?.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        self.write()?.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.read()?;
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut entries = self.write()?;
        for op in ops {
            match op {
                BatchOp::Put(k, v) => {
                    entries.insert(k, v);
                }
                BatchOp::Delete(k) => {
                    entries.remove(&k);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_prefix_is_bounded() {
        let kv = MemoryKv::new();
        kv.put(b"/a/1", b"x").unwrap();
        kv.put(b"/a/2", b"y").unwrap();
        kv.put(b"/b/1", b"z").unwrap();

        let hits = kv.scan_prefix(b"/a/").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, b"/a/1".to_vec());
    }

    #[test]
    fn test_batch() {
        let kv = MemoryKv::new();
        kv.put(b"k1", b"old").unwrap();
        kv.write_batch(vec![
            BatchOp::Put(b"k2".to_vec(), b"new".to_vec()),
            BatchOp::Delete(b"k1".to_vec()),
        ])
        .unwrap();
        assert!(!kv.has(b"k1").unwrap());
        assert_eq!(kv.get(b"k2").unwrap(), Some(b"new".to_vec()));
    }
}

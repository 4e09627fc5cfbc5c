use super::{BatchOp, KvStore};
use crate::error::{DecodeFailure, Result, ScanResult, StoreError};
use crate::key::{StoreKey, Table};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

/// Typed view of one table over a [`KvStore`].
pub struct StateStore<T> {
    kv: Arc<dyn KvStore>,
    table: Table,
    prefix: Vec<u8>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for StateStore<T> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            table: self.table,
            prefix: self.prefix.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> StateStore<T> {
    pub fn new(kv: Arc<dyn KvStore>, table: Table) -> Self {
        let prefix = format!("/{}/", table.name()).into_bytes();
        Self {
            kv,
            table,
            prefix,
            _record: PhantomData,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn key_bytes(&self, key: &StoreKey) -> Vec<u8> {
        let mut bytes = self.prefix.clone();
        bytes.extend_from_slice(key.encode().as_bytes());
        bytes
    }

    pub fn encode(value: &T) -> Result<Vec<u8>> {
        serde_cbor::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
    }

    pub fn decode(key: &str, bytes: &[u8]) -> Result<T> {
        serde_cbor::from_slice(bytes).map_err(|e| StoreError::Decode {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn save(&self, key: &StoreKey, value: &T) -> Result<()> {
        let bytes = Self::encode(value)?;
        self.kv.put(&self.key_bytes(key), &bytes)
    }

    pub fn get(&self, key: &StoreKey) -> Result<T> {
        match self.kv.get(&self.key_bytes(key))? {
            Some(bytes) => Self::decode(&key.to_string(), &bytes),
            None => Err(StoreError::not_found(self.table.name(), key)),
        }
    }

    pub fn has(&self, key: &StoreKey) -> Result<bool> {
        self.kv.has(&self.key_bytes(key))
    }

    pub fn delete(&self, key: &StoreKey) -> Result<()> {
        self.kv.delete(&self.key_bytes(key))
    }

    /// Decode every record in the table, collecting the ones that fail.
    pub fn list(&self) -> Result<ScanResult<T>> {
        let mut result = ScanResult::new();
        for (key, value) in self.kv.scan_prefix(&self.prefix)? {
            let key = self.strip_prefix(&key);
            match Self::decode(&key, &value) {
                Ok(item) => result.items.push(item),
                Err(e) => result.failures.push(DecodeFailure {
                    key,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(result)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .kv
            .scan_prefix(&self.prefix)?
            .into_iter()
            .map(|(k, _)| self.strip_prefix(&k))
            .collect())
    }

    pub fn put_op(&self, key: &StoreKey, value: &T) -> Result<BatchOp> {
        Ok(BatchOp::Put(self.key_bytes(key), Self::encode(value)?))
    }

    fn strip_prefix(&self, key: &[u8]) -> String {
        String::from_utf8_lossy(&key[self.prefix.len().min(key.len())..]).into_owned()
    }
}

//! Deal state repository.
//!
//! One contract ([`Repo`]) over two interchangeable backends: an embedded
//! ordered key-value store ([`KvRepo`] on RocksDB or memory) and a relational
//! store ([`SqliteRepo`]). Backends are picked at startup through a
//! [`BackendRegistry`].

pub mod error;
pub mod export;
pub mod key;
pub mod kv;
pub mod registry;
pub mod repo;
pub mod sqlite;

pub use error::{DecodeFailure, Result, ScanResult, StoreError};
pub use export::export_json;
pub use key::{StoreKey, Table};
pub use kv::{KvRepo, KvStore, MemoryKv, StateStore};
#[cfg(feature = "rocksdb")]
pub use kv::RocksKv;
pub use registry::{BackendCtor, BackendRegistry};
pub use repo::{
    AskRepo, FundRepo, PaychRepo, Repo, RetrievalDealRepo, StorageDealRepo, StorageDealTx, TxFn,
};
pub use sqlite::SqliteRepo;

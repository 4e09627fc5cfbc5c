//! Storage provider side of the deal market: sector commitment tracking,
//! periodic deal reconciliation, transfer and retrieval event handlers, and
//! the node surface handed to the deal state machines.

pub mod adapter;
pub mod deal_info;
pub mod error;
pub mod handlers;
pub mod sector_committed;
pub mod tracker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use adapter::{
    DealEnd, DealEndCallback, MessageOutcome, ProviderNodeAdapter, ProviderNodeConfig,
    PublishResult, StorageProviderNode,
};
pub use deal_info::{CurrentDealInfo, DealInfoResolver};
pub use error::{ProviderError, Result};
pub use handlers::{DealProcess, RetrievalDealHandler, RetrievalEnvironment, StorageTransferHandler};
pub use sector_committed::{CommitCallback, PreCommitCallback, PreCommitted, SectorCommittedManager};
pub use tracker::{DealTracker, SweepReport, DEFAULT_POLL_INTERVAL};

//! Collaborator interfaces of the market node (chain oracle, wallet, data
//! transfer) and the chain event matcher built on top of the chain oracle.

pub mod api;
pub mod error;
pub mod events;
pub mod mock;

pub use api::{ChainApi, HeadChanges, TransferApi, WalletApi};
pub use error::{ChainError, Result};
pub use events::{Check, Events, StateWatch, WatchControl, WatchEvent, NO_TIMEOUT};

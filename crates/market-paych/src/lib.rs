//! Payment side of the market node: escrow reservations for storage deals
//! and the payment channel ledger used for retrieval payments.

pub mod error;
pub mod fund;
pub mod listeners;
pub mod manager;

pub use error::{PaychError, Result};
pub use fund::FundManager;
pub use listeners::{MsgListeners, MsgOutcome};
pub use manager::{ChannelAvailableFunds, PaychManager};

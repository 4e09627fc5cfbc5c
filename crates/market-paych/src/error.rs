use market_chain::ChainError;
use market_storage::StoreError;
use market_types::{Address, Cid, TokenAmount, TypesError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaychError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds {
        required: TokenAmount,
        available: TokenAmount,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Message {cid} failed: {reason}")]
    MessageFailed { cid: Cid, reason: String },

    #[error("Channel not ready: {0}")]
    NotReady(String),

    #[error("Wallet has no key for {0}")]
    NoKey(Address),

    #[error("Invalid voucher: {0}")]
    InvalidVoucher(String),

    #[error("Wrong channel direction: {0}")]
    WrongDirection(String),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Types error: {0}")]
    Types(#[from] TypesError),
}

pub type Result<T> = std::result::Result<T, PaychError>;

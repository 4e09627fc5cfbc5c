use market_types::{ChainEpoch, Cid, TypesError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    #[error("{what} not found: {key}")]
    NotFound { what: &'static str, key: String },

    #[error("Message {cid} failed with exit code {exit_code}")]
    MessageFailed { cid: Cid, exit_code: i64 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Reverted at height {0}")]
    Reverted(ChainEpoch),

    #[error("Chain RPC error: {0}")]
    Rpc(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Transfer channel {0} already terminated")]
    Terminated(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Cancelled")]
    Cancelled,

    #[error(transparent)]
    Types(#[from] TypesError),
}

impl ChainError {
    pub fn not_found(what: &'static str, key: impl ToString) -> Self {
        ChainError::NotFound {
            what,
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ChainError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

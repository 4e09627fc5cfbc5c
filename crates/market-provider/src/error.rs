use market_chain::ChainError;
use market_paych::PaychError;
use market_storage::StoreError;
use market_types::{Cid, TypesError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Payment error: {0}")]
    Paych(#[from] PaychError),

    #[error("Types error: {0}")]
    Types(#[from] TypesError),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Publish message {cid} failed with exit code {exit_code}")]
    PublishFailed { cid: Cid, exit_code: i64 },

    #[error("Deal info: {0}")]
    DealInfo(String),

    #[error("Unsupported sector size {0}")]
    UnsupportedSectorSize(u64),

    #[error("Retrieval environment error: {0}")]
    Environment(String),
}

impl ProviderError {
    pub fn invalid_transition(from: impl ToString, to: impl ToString) -> Self {
        ProviderError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

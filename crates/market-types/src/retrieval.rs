use crate::amount::TokenAmount;
use crate::cid::Cid;
use crate::error::{Result, TypesError};
use crate::transfer::{ChannelId, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type RetrievalDealId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum RetrievalDealStatus {
    New = 0,
    Unsealing = 1,
    Unsealed = 2,
    Accepted = 3,
    Ongoing = 4,
    FundsNeeded = 5,
    FundsNeededLastPayment = 6,
    BlocksComplete = 7,
    Finalizing = 8,
    Completed = 9,
    Cancelling = 10,
    Cancelled = 11,
    Errored = 12,
    Failing = 13,
    Rejected = 14,
    DealNotFound = 15,
}

impl RetrievalDealStatus {
    pub const ALL: [RetrievalDealStatus; 16] = [
        Self::New,
        Self::Unsealing,
        Self::Unsealed,
        Self::Accepted,
        Self::Ongoing,
        Self::FundsNeeded,
        Self::FundsNeededLastPayment,
        Self::BlocksComplete,
        Self::Finalizing,
        Self::Completed,
        Self::Cancelling,
        Self::Cancelled,
        Self::Errored,
        Self::Failing,
        Self::Rejected,
        Self::DealNotFound,
    ];

    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.code() == code)
            .ok_or_else(|| TypesError::UnknownStatus(format!("retrieval deal status {}", code)))
    }

    pub fn rank(&self) -> Option<u8> {
        use RetrievalDealStatus::*;
        let rank = match self {
            New => 0,
            Unsealing => 1,
            Unsealed => 2,
            Accepted => 3,
            Ongoing | FundsNeeded => 4,
            FundsNeededLastPayment => 5,
            BlocksComplete => 6,
            Finalizing => 7,
            Completed => 8,
            Cancelling | Cancelled | Errored | Failing | Rejected | DealNotFound => return None,
        };
        Some(rank)
    }

    pub fn is_terminal(&self) -> bool {
        use RetrievalDealStatus::*;
        matches!(self, Completed | Cancelled | Errored | Rejected | DealNotFound)
    }

    /// `Errored` is reachable from every status, including terminal ones.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next || *next == Self::Errored {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(from), Some(to)) => to >= from,
        }
    }
}

impl fmt::Display for RetrievalDealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DealStatus{:?}", self)
    }
}

/// Retrieval deals are keyed by the receiving peer and the deal id it chose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProviderDealIdentifier {
    pub receiver: PeerId,
    pub deal_id: RetrievalDealId,
}

impl fmt::Display for ProviderDealIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.receiver, self.deal_id)
    }
}

/// Terms a client asked for when opening a retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalParams {
    pub payload_cid: Cid,
    pub piece_cid: Option<Cid>,
    pub price_per_byte: TokenAmount,
    pub unseal_price: TokenAmount,
    pub payment_interval: u64,
    pub payment_interval_increase: u64,
}

/// Provider-side record of a retrieval deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDealState {
    pub receiver: PeerId,
    pub deal_id: RetrievalDealId,
    pub params: RetrievalParams,
    pub status: RetrievalDealStatus,
    pub channel_id: Option<ChannelId>,
    pub store_id: Option<u64>,
    pub funds_received: TokenAmount,
    pub total_sent: u64,
    pub current_interval: u64,
    pub message: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ProviderDealState {
    pub fn new(receiver: PeerId, deal_id: RetrievalDealId, params: RetrievalParams) -> Self {
        let now = chrono::Utc::now().timestamp();
        let current_interval = params.payment_interval;
        Self {
            receiver,
            deal_id,
            params,
            status: RetrievalDealStatus::New,
            channel_id: None,
            store_id: None,
            funds_received: TokenAmount::ZERO,
            total_sent: 0,
            current_interval,
            message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn identifier(&self) -> ProviderDealIdentifier {
        ProviderDealIdentifier {
            receiver: self.receiver.clone(),
            deal_id: self.deal_id,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

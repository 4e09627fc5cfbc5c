use crate::address::Address;
use crate::amount::TokenAmount;
use crate::cid::Cid;
use crate::crypto::Signature;
use crate::error::{Result, TypesError};
use crate::tipset::ChainEpoch;
use crate::transfer::{ChannelId, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type DealId = u64;
pub type SectorNumber = u64;

/// Market deal terms as published on chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealProposal {
    pub piece_cid: Cid,
    pub piece_size: u64,
    pub verified_deal: bool,
    pub client: Address,
    pub provider: Address,
    pub label: String,
    pub start_epoch: ChainEpoch,
    pub end_epoch: ChainEpoch,
    pub storage_price_per_epoch: TokenAmount,
    pub provider_collateral: TokenAmount,
    pub client_collateral: TokenAmount,
}

impl DealProposal {
    pub fn cid(&self) -> Result<Cid> {
        Cid::of_serialized(self)
    }

    pub fn duration(&self) -> ChainEpoch {
        self.end_epoch - self.start_epoch
    }

    pub fn total_storage_fee(&self) -> TokenAmount {
        self.storage_price_per_epoch
            .saturating_mul(self.duration().max(0) as u64)
    }
}

/// A proposal signed by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDealProposal {
    pub proposal: DealProposal,
    pub client_signature: Signature,
}

impl ClientDealProposal {
    pub fn cid(&self) -> Result<Cid> {
        Cid::of_serialized(self)
    }
}

/// Market actor bookkeeping for a deal. Epochs are -1 until the event happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealState {
    pub sector_start_epoch: ChainEpoch,
    pub last_updated_epoch: ChainEpoch,
    pub slash_epoch: ChainEpoch,
}

impl DealState {
    pub const EMPTY: DealState = DealState {
        sector_start_epoch: -1,
        last_updated_epoch: -1,
        slash_epoch: -1,
    };

    pub fn is_active(&self) -> bool {
        self.sector_start_epoch > -1
    }

    pub fn is_slashed(&self) -> bool {
        self.slash_epoch > -1
    }
}

impl Default for DealState {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// A deal as read from the market actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketDeal {
    pub proposal: DealProposal,
    pub state: DealState,
}

/// Provider-side storage deal status.
///
/// Codes are stable and used by the relational backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum StorageDealStatus {
    Unknown = 0,
    ProposalAccepted = 3,
    Staged = 4,
    Sealing = 5,
    Finalizing = 6,
    Active = 7,
    Expired = 8,
    Slashed = 9,
    Rejecting = 10,
    Failing = 11,
    Validating = 14,
    AcceptWait = 15,
    Transferring = 17,
    WaitingForData = 18,
    VerifyData = 19,
    ReserveProviderFunds = 20,
    ProviderFunding = 22,
    Publish = 24,
    Publishing = 25,
    Error = 26,
    ProviderTransferAwaitRestart = 27,
    AwaitingPreCommit = 29,
}

impl StorageDealStatus {
    pub const ALL: [StorageDealStatus; 22] = [
        Self::Unknown,
        Self::ProposalAccepted,
        Self::Staged,
        Self::Sealing,
        Self::Finalizing,
        Self::Active,
        Self::Expired,
        Self::Slashed,
        Self::Rejecting,
        Self::Failing,
        Self::Validating,
        Self::AcceptWait,
        Self::Transferring,
        Self::WaitingForData,
        Self::VerifyData,
        Self::ReserveProviderFunds,
        Self::ProviderFunding,
        Self::Publish,
        Self::Publishing,
        Self::Error,
        Self::ProviderTransferAwaitRestart,
        Self::AwaitingPreCommit,
    ];

    pub fn code(&self) -> u32 {
        *self as u32
    }

    pub fn from_code(code: u32) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|s| s.code() == code)
            .ok_or_else(|| TypesError::UnknownStatus(format!("storage deal status {}", code)))
    }

    /// Position in the forward lifecycle. Failure states have no rank.
    pub fn rank(&self) -> Option<u8> {
        use StorageDealStatus::*;
        let rank = match self {
            Unknown => 0,
            Validating => 1,
            AcceptWait => 2,
            ProposalAccepted => 3,
            WaitingForData => 4,
            // Restart parks the deal inside the transfer phase.
            Transferring | ProviderTransferAwaitRestart => 5,
            VerifyData => 6,
            ReserveProviderFunds => 7,
            ProviderFunding => 8,
            Publish => 9,
            Publishing => 10,
            Staged => 11,
            AwaitingPreCommit => 12,
            Sealing => 13,
            Finalizing => 14,
            Active => 15,
            Expired => 16,
            Slashed | Rejecting | Failing | Error => return None,
        };
        Some(rank)
    }

    pub fn is_failure(&self) -> bool {
        self.rank().is_none()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Slashed | Self::Error)
    }

    /// Forward moves are allowed, as is any move into a failure state.
    /// Skipping intermediate statuses (for example straight to `Active`) is valid.
    pub fn can_transition_to(&self, next: &Self) -> bool {
        if self == next {
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

impl fmt::Display for StorageDealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageDeal{:?}", self)
    }
}

/// Provider-side record of a storage deal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerDeal {
    pub proposal_cid: Cid,
    pub client_deal_proposal: ClientDealProposal,
    pub client: PeerId,
    pub miner: PeerId,
    pub state: StorageDealStatus,
    pub message: String,
    pub ref_payload_root: Cid,
    pub piece_path: Option<String>,
    pub funds_reserved: TokenAmount,
    pub publish_cid: Option<Cid>,
    pub deal_id: Option<DealId>,
    pub sector_number: Option<SectorNumber>,
    pub offset: Option<u64>,
    pub transfer_channel_id: Option<ChannelId>,
    pub available_for_retrieval: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl MinerDeal {
    /// Build a fresh record; the proposal cid is derived from the signed proposal.
    pub fn new(
        client_deal_proposal: ClientDealProposal,
        client: PeerId,
        miner: PeerId,
        ref_payload_root: Cid,
    ) -> Result<Self> {
        let proposal_cid = client_deal_proposal.cid()?;
        let now = chrono::Utc::now().timestamp();
        Ok(Self {
            proposal_cid,
            client_deal_proposal,
            client,
            miner,
            state: StorageDealStatus::Unknown,
            message: String::new(),
            ref_payload_root,
            piece_path: None,
            funds_reserved: TokenAmount::ZERO,
            publish_cid: None,
            deal_id: None,
            sector_number: None,
            offset: None,
            transfer_channel_id: None,
            available_for_retrieval: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn proposal(&self) -> &DealProposal {
        &self.client_deal_proposal.proposal
    }

    pub fn provider(&self) -> Address {
        self.client_deal_proposal.proposal.provider
    }

    pub fn piece_cid(&self) -> Cid {
        self.client_deal_proposal.proposal.piece_cid
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
    }
}

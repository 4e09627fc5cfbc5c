use crate::address::Address;
use crate::amount::TokenAmount;
use crate::deal::{DealId, SectorNumber};
use crate::tipset::ChainEpoch;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisteredSealProof {
    StackedDrg2KiBV1_1,
    StackedDrg512MiBV1_1,
    StackedDrg32GiBV1_1,
    StackedDrg64GiBV1_1,
}

impl RegisteredSealProof {
    pub fn from_sector_size(size: u64) -> Option<Self> {
        match size {
            2048 => Some(Self::StackedDrg2KiBV1_1),
            536_870_912 => Some(Self::StackedDrg512MiBV1_1),
            34_359_738_368 => Some(Self::StackedDrg32GiBV1_1),
            68_719_476_736 => Some(Self::StackedDrg64GiBV1_1),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorPreCommitInfo {
    pub seal_proof: RegisteredSealProof,
    pub sector_number: SectorNumber,
    pub deal_ids: Vec<DealId>,
    pub expiration: ChainEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorPreCommitOnChainInfo {
    pub info: SectorPreCommitInfo,
    pub pre_commit_deposit: TokenAmount,
    pub pre_commit_epoch: ChainEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectorOnChainInfo {
    pub sector_number: SectorNumber,
    pub seal_proof: RegisteredSealProof,
    pub deal_ids: Vec<DealId>,
    pub activation: ChainEpoch,
    pub expiration: ChainEpoch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerInfo {
    pub owner: Address,
    pub worker: Address,
    pub control_addresses: Vec<Address>,
    pub sector_size: u64,
}

/// Market escrow and the locked portion of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MarketBalance {
    pub escrow: TokenAmount,
    pub locked: TokenAmount,
}

impl MarketBalance {
    pub fn available(&self) -> TokenAmount {
        self.escrow.saturating_sub(self.locked)
    }
}

/// Collateral range the market actor accepts for a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollateralBounds {
    pub min: TokenAmount,
    pub max: TokenAmount,
}

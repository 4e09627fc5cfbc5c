//! Domain types shared by every crate of the deal market node: addresses,
//! content ids, token amounts, tipsets, deal records and their status graphs,
//! payment-channel bookkeeping and chain message payloads.

pub mod address;
pub mod amount;
pub mod ask;
pub mod cid;
pub mod crypto;
pub mod deal;
pub mod error;
pub mod message;
pub mod miner;
pub mod paych;
pub mod retrieval;
pub mod tipset;
pub mod transfer;

pub use address::Address;
pub use amount::TokenAmount;
pub use ask::{RetrievalAsk, SignedStorageAsk, StorageAsk};
pub use cid::Cid;
pub use crypto::{KeyPair, SigType, Signature};
pub use deal::{
    ClientDealProposal, DealId, DealProposal, DealState, MarketDeal, MinerDeal, SectorNumber,
    StorageDealStatus,
};
pub use error::{Result, TypesError};
pub use message::{
    Message, MessageReceipt, Method, MsgLookup, PaychCreateParams, PaychCreateReturn,
};
pub use miner::{
    CollateralBounds, MarketBalance, MinerInfo, RegisteredSealProof, SectorOnChainInfo,
    SectorPreCommitInfo, SectorPreCommitOnChainInfo,
};
pub use paych::{
    ChannelDirection, ChannelInfo, FundedAddressState, LaneState, MsgInfo, SignedVoucher,
    VoucherInfo,
};
pub use retrieval::{
    ProviderDealIdentifier, ProviderDealState, RetrievalDealId, RetrievalDealStatus,
    RetrievalParams,
};
pub use tipset::{ChainEpoch, HeadChange, TipSet, TipSetKey};
pub use transfer::{ChannelId, PeerId};

use crate::error::Result;
use async_trait::async_trait;
use market_types::{
    Address, ChainEpoch, ChannelId, Cid, CollateralBounds, DealId, HeadChange, MarketBalance,
    MarketDeal, Message, MinerInfo, MsgLookup, SectorNumber, SectorOnChainInfo,
    SectorPreCommitOnChainInfo, Signature, TipSet, TipSetKey, TokenAmount,
};
use tokio::sync::mpsc;

/// Batches of head changes. The first batch holds a single `Current` entry.
pub type HeadChanges = mpsc::UnboundedReceiver<Vec<HeadChange>>;

/// The full node, seen as an oracle. An empty `TipSetKey` means the current head.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn chain_head(&self) -> Result<TipSet>;

    /// The tipset at `height` on the chain ending at `tsk`. Null rounds
    /// resolve to the nearest lower tipset.
    async fn chain_get_tipset_by_height(&self, height: ChainEpoch, tsk: &TipSetKey) -> Result<TipSet>;

    async fn chain_notify(&self) -> Result<HeadChanges>;

    async fn chain_get_message(&self, cid: &Cid) -> Result<Message>;

    async fn state_market_storage_deal(&self, deal_id: DealId, tsk: &TipSetKey) -> Result<MarketDeal>;

    async fn state_market_balance(&self, addr: &Address, tsk: &TipSetKey) -> Result<MarketBalance>;

    async fn state_deal_provider_collateral_bounds(
        &self,
        piece_size: u64,
        verified: bool,
        tsk: &TipSetKey,
    ) -> Result<CollateralBounds>;

    /// Remaining data cap of a verified client, `None` if the client is not verified.
    async fn state_verified_client_status(&self, addr: &Address, tsk: &TipSetKey) -> Result<Option<u64>>;

    async fn state_sector_precommit_info(
        &self,
        miner: &Address,
        sector: SectorNumber,
        tsk: &TipSetKey,
    ) -> Result<Option<SectorPreCommitOnChainInfo>>;

    async fn state_sector_get_info(
        &self,
        miner: &Address,
        sector: SectorNumber,
        tsk: &TipSetKey,
    ) -> Result<Option<SectorOnChainInfo>>;

    async fn state_miner_info(&self, miner: &Address, tsk: &TipSetKey) -> Result<MinerInfo>;

    async fn state_account_key(&self, addr: &Address, tsk: &TipSetKey) -> Result<Address>;

    /// Sign and push a message, returning the cid the chain will know it by.
    async fn mpool_push_message(&self, msg: Message, max_fee: Option<TokenAmount>) -> Result<Cid>;

    /// Block until `cid` is executed and buried under `confidence` tipsets.
    async fn state_wait_msg(&self, cid: &Cid, confidence: u64) -> Result<MsgLookup>;

    async fn state_search_msg(&self, cid: &Cid) -> Result<Option<MsgLookup>>;
}

#[async_trait]
pub trait WalletApi: Send + Sync {
    async fn wallet_sign(&self, addr: &Address, data: &[u8]) -> Result<Signature>;

    async fn wallet_has(&self, addr: &Address) -> Result<bool>;
}

/// Outbound control of the data-transfer layer.
#[async_trait]
pub trait TransferApi: Send + Sync {
    async fn restart_transfer(&self, channel: &ChannelId) -> Result<()>;

    /// Returns `ChainError::Terminated` when the channel is already closed.
    async fn close_transfer(&self, channel: &ChannelId) -> Result<()>;
}

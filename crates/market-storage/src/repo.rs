use crate::error::{Result, ScanResult};
use crate::key::Table;
use async_trait::async_trait;
use market_types::{
    Address, ChannelInfo, Cid, DealId, FundedAddressState, MinerDeal, MsgInfo,
    ProviderDealIdentifier, ProviderDealState, RetrievalAsk, SignedStorageAsk, StorageDealStatus,
};

/// Provider-side storage deals, keyed by proposal cid.
#[async_trait]
pub trait StorageDealRepo: Send + Sync {
    /// Insert or replace. Last write wins.
    async fn save_deal(&self, deal: &MinerDeal) -> Result<()>;

    async fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal>;

    async fn has_deal(&self, proposal_cid: &Cid) -> Result<bool>;

    async fn list_deals(&self) -> Result<ScanResult<MinerDeal>>;

    /// Deals of `provider` whose status is one of `statuses` (any status when empty).
    async fn list_deals_by_provider(
        &self,
        provider: &Address,
        statuses: &[StorageDealStatus],
    ) -> Result<ScanResult<MinerDeal>>;

    /// Deals storing `piece` whose status is one of `statuses` (any status when empty).
    async fn get_deals_by_piece(
        &self,
        piece: &Cid,
        statuses: &[StorageDealStatus],
    ) -> Result<ScanResult<MinerDeal>>;

    async fn get_deal_by_deal_id(&self, provider: &Address, deal_id: DealId) -> Result<MinerDeal>;

    /// A page of deals ordered by creation time, oldest first.
    async fn list_deals_page(&self, offset: usize, limit: usize) -> Result<ScanResult<MinerDeal>>;

    /// Set the status and bump `updated_at`.
    async fn update_deal_status(&self, proposal_cid: &Cid, status: StorageDealStatus) -> Result<()>;
}

#[async_trait]
pub trait RetrievalDealRepo: Send + Sync {
    async fn save_retrieval_deal(&self, deal: &ProviderDealState) -> Result<()>;

    async fn get_retrieval_deal(&self, id: &ProviderDealIdentifier) -> Result<ProviderDealState>;

    async fn has_retrieval_deal(&self, id: &ProviderDealIdentifier) -> Result<bool>;

    async fn list_retrieval_deals(&self) -> Result<ScanResult<ProviderDealState>>;
}

#[async_trait]
pub trait FundRepo: Send + Sync {
    async fn save_fund_state(&self, state: &FundedAddressState) -> Result<()>;

    async fn get_fund_state(&self, addr: &Address) -> Result<FundedAddressState>;

    async fn list_fund_states(&self) -> Result<ScanResult<FundedAddressState>>;
}

#[async_trait]
pub trait PaychRepo: Send + Sync {
    async fn save_channel_info(&self, info: &ChannelInfo) -> Result<()>;

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo>;

    async fn get_channel_by_address(&self, channel: &Address) -> Result<ChannelInfo>;

    /// The outbound, non-settling channel from `from` to `to`.
    async fn outbound_active_by_from_to(&self, from: &Address, to: &Address) -> Result<ChannelInfo>;

    async fn list_channels(&self) -> Result<ScanResult<ChannelInfo>>;

    async fn remove_channel(&self, channel_id: &str) -> Result<()>;

    async fn save_msg_info(&self, info: &MsgInfo) -> Result<()>;

    async fn get_msg_info(&self, msg_cid: &Cid) -> Result<MsgInfo>;

    async fn list_msg_infos(&self) -> Result<ScanResult<MsgInfo>>;
}

#[async_trait]
pub trait AskRepo: Send + Sync {
    async fn set_storage_ask(&self, ask: &SignedStorageAsk) -> Result<()>;

    async fn get_storage_ask(&self, miner: &Address) -> Result<SignedStorageAsk>;

    async fn list_storage_asks(&self) -> Result<ScanResult<SignedStorageAsk>>;

    async fn set_retrieval_ask(&self, ask: &RetrievalAsk) -> Result<()>;

    async fn get_retrieval_ask(&self, miner: &Address) -> Result<RetrievalAsk>;

    async fn list_retrieval_asks(&self) -> Result<ScanResult<RetrievalAsk>>;
}

/// View of the storage deal table inside a transaction.
pub trait StorageDealTx {
    fn get_deal(&mut self, proposal_cid: &Cid) -> Result<MinerDeal>;

    fn save_deal(&mut self, deal: &MinerDeal) -> Result<()>;
}

/// Closure run inside [`Repo::transaction`]; returning an error aborts it.
pub type TxFn<'a> = dyn FnMut(&mut dyn StorageDealTx) -> Result<()> + Send + 'a;

/// The whole repository behind one backend.
#[async_trait]
pub trait Repo: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn storage_deals(&self) -> &dyn StorageDealRepo;

    fn retrieval_deals(&self) -> &dyn RetrievalDealRepo;

    fn funds(&self) -> &dyn FundRepo;

    fn paych(&self) -> &dyn PaychRepo;

    fn asks(&self) -> &dyn AskRepo;

    /// Run `f` atomically. The relational backend gives full ACID semantics;
    /// the key-value backend applies all buffered writes as one batch.
    async fn transaction(&self, f: &mut TxFn<'_>) -> Result<()>;

    /// Every key stored in `table`, in backend order.
    async fn raw_keys(&self, table: Table) -> Result<Vec<String>>;

    async fn flush(&self) -> Result<()>;
}

use super::{BatchOp, KvStore, MemoryKv, StateStore};
use crate::error::{Result, ScanResult, StoreError};
use crate::key::{StoreKey, Table};
use crate::repo::{
    AskRepo, FundRepo, PaychRepo, Repo, RetrievalDealRepo, StorageDealRepo, StorageDealTx, TxFn,
};
use async_trait::async_trait;
use market_types::{
    Address, ChannelDirection, ChannelInfo, Cid, DealId, FundedAddressState, MinerDeal, MsgInfo,
    ProviderDealIdentifier, ProviderDealState, RetrievalAsk, SignedStorageAsk, StorageDealStatus,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

fn deal_key(proposal_cid: &Cid) -> StoreKey {
    StoreKey::stringer(proposal_cid)
}

fn status_matches(statuses: &[StorageDealStatus], status: StorageDealStatus) -> bool {
    statuses.is_empty() || statuses.contains(&status)
}

/// Repository over any [`KvStore`].
pub struct KvRepo {
    kv: Arc<dyn KvStore>,
    name: &'static str,
    storage_deals: StateStore<MinerDeal>,
    retrieval_deals: StateStore<ProviderDealState>,
    funds: StateStore<FundedAddressState>,
    channels: StateStore<ChannelInfo>,
    msgs: StateStore<MsgInfo>,
    storage_asks: StateStore<SignedStorageAsk>,
    retrieval_asks: StateStore<RetrievalAsk>,
}

impl KvRepo {
    pub fn new(kv: Arc<dyn KvStore>, name: &'static str) -> Self {
        Self {
            storage_deals: StateStore::new(kv.clone(), Table::StorageDeals),
            retrieval_deals: StateStore::new(kv.clone(), Table::RetrievalDeals),
            funds: StateStore::new(kv.clone(), Table::FundedAddresses),
            channels: StateStore::new(kv.clone(), Table::ChannelInfos),
            msgs: StateStore::new(kv.clone(), Table::MsgInfos),
            storage_asks: StateStore::new(kv.clone(), Table::StorageAsks),
            retrieval_asks: StateStore::new(kv.clone(), Table::RetrievalAsks),
            kv,
            name,
        }
    }

    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryKv::new()), "memory")
    }

    #[cfg(feature = "rocksdb")]
    pub fn open_rocks<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let kv = super::RocksKv::new(path)?;
        Ok(Self::new(Arc::new(kv), "rocks"))
    }
}

#[async_trait]
impl StorageDealRepo for KvRepo {
    async fn save_deal(&self, deal: &MinerDeal) -> Result<()> {
        self.storage_deals.save(&deal_key(&deal.proposal_cid), deal)
    }

    async fn get_deal(&self, proposal_cid: &Cid) -> Result<MinerDeal> {
        self.storage_deals.get(&deal_key(proposal_cid))
    }

    async fn has_deal(&self, proposal_cid: &Cid) -> Result<bool> {
        self.storage_deals.has(&deal_key(proposal_cid))
    }

    async fn list_deals(&self) -> Result<ScanResult<MinerDeal>> {
        self.storage_deals.list()
    }

    async fn list_deals_by_provider(
        &self,
        provider: &Address,
        statuses: &[StorageDealStatus],
    ) -> Result<ScanResult<MinerDeal>> {
        Ok(self
            .storage_deals
            .list()?
            .filter(|d| d.provider() == *provider && status_matches(statuses, d.state)))
    }

    async fn get_deals_by_piece(
        &self,
        piece: &Cid,
        statuses: &[StorageDealStatus],
    ) -> Result<ScanResult<MinerDeal>> {
        Ok(self
            .storage_deals
            .list()?
            .filter(|d| d.piece_cid() == *piece && status_matches(statuses, d.state)))
    }

    async fn get_deal_by_deal_id(&self, provider: &Address, deal_id: DealId) -> Result<MinerDeal> {
        self.storage_deals
            .list()?
            .items
            .into_iter()
            .find(|d| d.provider() == *provider && d.deal_id == Some(deal_id))
            .ok_or_else(|| StoreError::not_found(Table::StorageDeals.name(), deal_id))
    }

    async fn list_deals_page(&self, offset: usize, limit: usize) -> Result<ScanResult<MinerDeal>> {
        let mut all = self.storage_deals.list()?;
        all.items
            .sort_by(|a, b| (a.created_at, a.proposal_cid).cmp(&(b.created_at, b.proposal_cid)));
        all.items = all.items.into_iter().skip(offset).take(limit).collect();
        Ok(all)
    }

    async fn update_deal_status(&self, proposal_cid: &Cid, status: StorageDealStatus) -> Result<()> {
        let key = deal_key(proposal_cid);
        let mut deal = self.storage_deals.get(&key)?;
        deal.state = status;
        deal.touch();
        self.storage_deals.save(&key, &deal)
    }
}

#[async_trait]
impl RetrievalDealRepo for KvRepo {
    async fn save_retrieval_deal(&self, deal: &ProviderDealState) -> Result<()> {
        self.retrieval_deals
            .save(&StoreKey::stringer(&deal.identifier()), deal)
    }

    async fn get_retrieval_deal(&self, id: &ProviderDealIdentifier) -> Result<ProviderDealState> {
        self.retrieval_deals.get(&StoreKey::stringer(id))
    }

    async fn has_retrieval_deal(&self, id: &ProviderDealIdentifier) -> Result<bool> {
        self.retrieval_deals.has(&StoreKey::stringer(id))
    }

    async fn list_retrieval_deals(&self) -> Result<ScanResult<ProviderDealState>> {
        self.retrieval_deals.list()
    }
}

#[async_trait]
impl FundRepo for KvRepo {
    async fn save_fund_state(&self, state: &FundedAddressState) -> Result<()> {
        self.funds.save(&StoreKey::stringer(&state.addr), state)
    }

    async fn get_fund_state(&self, addr: &Address) -> Result<FundedAddressState> {
        self.funds.get(&StoreKey::stringer(addr))
    }

    async fn list_fund_states(&self) -> Result<ScanResult<FundedAddressState>> {
        self.funds.list()
    }
}

#[async_trait]
impl PaychRepo for KvRepo {
    async fn save_channel_info(&self, info: &ChannelInfo) -> Result<()> {
        self.channels
            .save(&StoreKey::from(info.channel_id.as_str()), info)
    }

    async fn get_channel_info(&self, channel_id: &str) -> Result<ChannelInfo> {
        self.channels.get(&StoreKey::from(channel_id))
    }

    async fn get_channel_by_address(&self, channel: &Address) -> Result<ChannelInfo> {
        self.channels
            .list()?
            .items
            .into_iter()
            .find(|ci| ci.channel.as_ref() == Some(channel))
            .ok_or_else(|| StoreError::not_found(Table::ChannelInfos.name(), channel))
    }

    async fn outbound_active_by_from_to(&self, from: &Address, to: &Address) -> Result<ChannelInfo> {
        self.channels
            .list()?
            .items
            .into_iter()
            .find(|ci| {
                ci.direction == ChannelDirection::Outbound
                    && !ci.settling
                    && ci.control == *from
                    && ci.target == *to
            })
            .ok_or_else(|| StoreError::not_found(Table::ChannelInfos.name(), format!("{}->{}", from, to)))
    }

    async fn list_channels(&self) -> Result<ScanResult<ChannelInfo>> {
        self.channels.list()
    }

    async fn remove_channel(&self, channel_id: &str) -> Result<()> {
        let key = StoreKey::from(channel_id);
        if !self.channels.has(&key)? {
            return Err(StoreError::not_found(Table::ChannelInfos.name(), channel_id));
        }
        self.channels.delete(&key)
    }

    async fn save_msg_info(&self, info: &MsgInfo) -> Result<()> {
        self.msgs.save(&StoreKey::stringer(&info.msg_cid), info)
    }

    async fn get_msg_info(&self, msg_cid: &Cid) -> Result<MsgInfo> {
        self.msgs.get(&StoreKey::stringer(msg_cid))
    }

    async fn list_msg_infos(&self) -> Result<ScanResult<MsgInfo>> {
        self.msgs.list()
    }
}

#[async_trait]
impl AskRepo for KvRepo {
    async fn set_storage_ask(&self, ask: &SignedStorageAsk) -> Result<()> {
        self.storage_asks.save(&StoreKey::stringer(&ask.ask.miner), ask)
    }

    async fn get_storage_ask(&self, miner: &Address) -> Result<SignedStorageAsk> {
        self.storage_asks.get(&StoreKey::stringer(miner))
    }

    async fn list_storage_asks(&self) -> Result<ScanResult<SignedStorageAsk>> {
        self.storage_asks.list()
    }

    async fn set_retrieval_ask(&self, ask: &RetrievalAsk) -> Result<()> {
        self.retrieval_asks.save(&StoreKey::stringer(&ask.miner), ask)
    }

    async fn get_retrieval_ask(&self, miner: &Address) -> Result<RetrievalAsk> {
        self.retrieval_asks.get(&StoreKey::stringer(miner))
    }

    async fn list_retrieval_asks(&self) -> Result<ScanResult<RetrievalAsk>> {
        self.retrieval_asks.list()
    }
}

/// Buffers deal writes until the closure returns; reads see the buffer first.
struct KvTx<'a> {
    deals: &'a StateStore<MinerDeal>,
    pending: BTreeMap<Vec<u8>, MinerDeal>,
}

impl StorageDealTx for KvTx<'_> {
    fn get_deal(&mut self, proposal_cid: &Cid) -> Result<MinerDeal> {
        let key = deal_key(proposal_cid);
        if let Some(deal) = self.pending.get(&self.deals.key_bytes(&key)) {
            return Ok(deal.clone());
        }
        self.deals.get(&key)
    }

    fn save_deal(&mut self, deal: &MinerDeal) -> Result<()> {
        let key = self.deals.key_bytes(&deal_key(&deal.proposal_cid));
        self.pending.insert(key, deal.clone());
        Ok(())
    }
}

#[async_trait]
impl Repo for KvRepo {
    fn backend_name(&self) -> &'static str {
        self.name
    }

    fn storage_deals(&self) -> &dyn StorageDealRepo {
        self
    }

    fn retrieval_deals(&self) -> &dyn RetrievalDealRepo {
        self
    }

    fn funds(&self) -> &dyn FundRepo {
        self
    }

    fn paych(&self) -> &dyn PaychRepo {
        self
    }

    fn asks(&self) -> &dyn AskRepo {
        self
    }

    async fn transaction(&self, f: &mut TxFn<'_>) -> Result<()> {
        let mut tx = KvTx {
            deals: &self.storage_deals,
            pending: BTreeMap::new(),
        };
        {
            let view: &mut dyn StorageDealTx = &mut tx;
            f(view)?;
        }

        let ops = tx
            .pending
            .into_iter()
            .map(|(key, deal)| Ok(BatchOp::Put(key, StateStore::encode(&deal)?)))
            .collect::<Result<Vec<_>>>()?;
        debug!(backend = self.name, writes = ops.len(), "Committing batched transaction");
        self.kv.write_batch(ops)
    }

    async fn raw_keys(&self, table: Table) -> Result<Vec<String>> {
        match table {
            Table::StorageDeals => self.storage_deals.keys(),
            Table::RetrievalDeals => self.retrieval_deals.keys(),
            Table::FundedAddresses => self.funds.keys(),
            Table::ChannelInfos => self.channels.keys(),
            Table::MsgInfos => self.msgs.keys(),
            Table::StorageAsks => self.storage_asks.keys(),
            Table::RetrievalAsks => self.retrieval_asks.keys(),
        }
    }

    async fn flush(&self) -> Result<()> {
        self.kv.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvStore;

    #[tokio::test]
    async fn test_corrupt_record_is_reported_not_skipped() {
        let kv = Arc::new(MemoryKv::new());
        let repo = KvRepo::new(kv.clone(), "memory");

        let state = FundedAddressState::new(Address::new_id(10));
        repo.save_fund_state(&state).await.unwrap();
        kv.put(b"/funded_addresses/f099", b"\xff\x00garbage").unwrap();

        let scan = repo.list_fund_states().await.unwrap();
        assert_eq!(scan.items, vec![state]);
        assert_eq!(scan.failures.len(), 1);
        assert_eq!(scan.failures[0].key, "f099");
        assert!(scan.into_strict().is_err());
    }

    #[tokio::test]
    async fn test_namespaces_do_not_collide() {
        let repo = KvRepo::memory();
        let addr = Address::new_id(7);
        repo.save_fund_state(&FundedAddressState::new(addr)).await.unwrap();
        assert!(repo.get_storage_ask(&addr).await.unwrap_err().is_not_found());
        assert_eq!(repo.raw_keys(Table::FundedAddresses).await.unwrap(), vec!["f07".to_string()]);
        assert!(repo.raw_keys(Table::StorageAsks).await.unwrap().is_empty());
    }
}

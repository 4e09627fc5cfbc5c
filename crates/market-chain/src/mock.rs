//! Scripted in-process collaborators for tests.
//!
//! `MockChain` keeps one set of actor state for every tipset; tests move the
//! head and change state explicitly. Message receipts are delivered with
//! [`MockChain::resolve_message`], and a wait registered before the receipt
//! arrives is woken when it does.

use crate::api::{ChainApi, HeadChanges, TransferApi, WalletApi};
use crate::error::{ChainError, Result};
use async_trait::async_trait;
use market_types::{
    Address, ChainEpoch, ChannelId, Cid, CollateralBounds, DealId, HeadChange, KeyPair,
    MarketBalance, MarketDeal, Message, MessageReceipt, MinerInfo, MsgLookup, SectorNumber,
    SectorOnChainInfo, SectorPreCommitOnChainInfo, Signature, TipSet, TipSetKey, TokenAmount,
};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct MockState {
    genesis: TipSet,
    tail: Vec<TipSet>,
    tipsets: HashMap<TipSetKey, TipSet>,
    minted: u64,
    subscribers: Vec<mpsc::UnboundedSender<Vec<HeadChange>>>,
    market_deals: HashMap<DealId, MarketDeal>,
    balances: HashMap<Address, MarketBalance>,
    collateral: CollateralBounds,
    verified: HashMap<Address, u64>,
    precommits: HashMap<(Address, SectorNumber), SectorPreCommitOnChainInfo>,
    sectors: HashMap<(Address, SectorNumber), SectorOnChainInfo>,
    miners: HashMap<Address, MinerInfo>,
    account_keys: HashMap<Address, Address>,
    messages: Vec<(Cid, Message)>,
    nonces: HashMap<Address, u64>,
    lookups: HashMap<Cid, MsgLookup>,
    waiters: HashMap<Cid, Vec<oneshot::Sender<MsgLookup>>>,
    failing: bool,
}

impl MockState {
    fn head(&self) -> &TipSet {
        self.tail.last().unwrap_or(&self.genesis)
    }

    fn mint(&mut self, height: ChainEpoch, parents: TipSetKey) -> TipSet {
        self.minted += 1;
        let key = TipSetKey::new(vec![Cid::of(
            format!("tipset/{}/{}", height, self.minted).as_bytes(),
        )]);
        let ts = TipSet::new(height, key, parents);
        self.tipsets.insert(ts.key.clone(), ts.clone());
        ts
    }

    fn notify(&mut self, batch: Vec<HeadChange>) {
        self.subscribers.retain(|tx| tx.send(batch.clone()).is_ok());
    }
}

pub struct MockChain {
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        let genesis = TipSet::new(
            0,
            TipSetKey::new(vec![Cid::of(b"tipset/genesis")]),
            TipSetKey::default(),
        );
        let mut tipsets = HashMap::new();
        tipsets.insert(genesis.key.clone(), genesis.clone());
        Self {
            state: Mutex::new(MockState {
                genesis,
                tail: Vec::new(),
                tipsets,
                minted: 0,
                subscribers: Vec::new(),
                market_deals: HashMap::new(),
                balances: HashMap::new(),
                collateral: CollateralBounds {
                    min: TokenAmount::ZERO,
                    max: TokenAmount::ZERO,
                },
                verified: HashMap::new(),
                precommits: HashMap::new(),
                sectors: HashMap::new(),
                miners: HashMap::new(),
                account_keys: HashMap::new(),
                messages: Vec::new(),
                nonces: HashMap::new(),
                lookups: HashMap::new(),
                waiters: HashMap::new(),
                failing: false,
            }),
        }
    }

    fn query(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = lock(&self.state);
        if state.failing {
            return Err(ChainError::Rpc("injected chain failure".to_string()));
        }
        Ok(state)
    }

    pub fn head(&self) -> TipSet {
        lock(&self.state).head().clone()
    }

    /// Apply one new tipset on top of the head and notify subscribers.
    pub fn advance(&self) -> TipSet {
        let mut state = lock(&self.state);
        let parent = state.head().clone();
        let ts = state.mint(parent.height + 1, parent.key);
        state.tail.push(ts.clone());
        state.notify(vec![HeadChange::Apply(ts.clone())]);
        ts
    }

    pub fn advance_by(&self, n: usize) -> TipSet {
        for _ in 1..n {
            self.advance();
        }
        self.advance()
    }

    /// Revert up to `n` tipsets, newest first. Genesis is never reverted.
    pub fn revert(&self, n: usize) -> Vec<TipSet> {
        let mut state = lock(&self.state);
        let mut reverted = Vec::new();
        for _ in 0..n {
            match state.tail.pop() {
                Some(ts) => reverted.push(ts),
                None => break,
            }
        }
        if !reverted.is_empty() {
            let batch = reverted.iter().cloned().map(HeadChange::Revert).collect();
            state.notify(batch);
        }
        reverted
    }

    /// Make every query and push fail with an RPC error.
    pub fn set_failing(&self, failing: bool) {
        lock(&self.state).failing = failing;
    }

    pub fn set_market_deal(&self, deal_id: DealId, deal: MarketDeal) {
        lock(&self.state).market_deals.insert(deal_id, deal);
    }

    pub fn remove_market_deal(&self, deal_id: DealId) {
        lock(&self.state).market_deals.remove(&deal_id);
    }

    pub fn set_balance(&self, addr: Address, balance: MarketBalance) {
        lock(&self.state).balances.insert(addr, balance);
    }

    pub fn set_collateral_bounds(&self, bounds: CollateralBounds) {
        lock(&self.state).collateral = bounds;
    }

    pub fn set_verified_client(&self, addr: Address, data_cap: u64) {
        lock(&self.state).verified.insert(addr, data_cap);
    }

    pub fn set_precommit(&self, miner: Address, info: SectorPreCommitOnChainInfo) {
        lock(&self.state)
            .precommits
            .insert((miner, info.info.sector_number), info);
    }

    pub fn set_sector(&self, miner: Address, info: SectorOnChainInfo) {
        lock(&self.state)
            .sectors
            .insert((miner, info.sector_number), info);
    }

    pub fn set_miner_info(&self, miner: Address, info: MinerInfo) {
        lock(&self.state).miners.insert(miner, info);
    }

    pub fn set_account_key(&self, addr: Address, key: Address) {
        lock(&self.state).account_keys.insert(addr, key);
    }

    pub fn pushed_messages(&self) -> Vec<(Cid, Message)> {
        lock(&self.state).messages.clone()
    }

    pub fn last_pushed(&self) -> Option<(Cid, Message)> {
        lock(&self.state).messages.last().cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.state).subscribers.len()
    }

    /// Number of callers still blocked in `state_wait_msg` for `cid`.
    pub fn pending_waits(&self, cid: &Cid) -> usize {
        lock(&self.state)
            .waiters
            .get(cid)
            .map_or(0, |waiters| waiters.iter().filter(|tx| !tx.is_closed()).count())
    }

    /// Record the receipt of `cid` at the current head and wake its waiters.
    pub fn resolve_message(&self, cid: Cid, receipt: MessageReceipt) {
        let mut state = lock(&self.state);
        let head = state.head().clone();
        let lookup = MsgLookup {
            message: cid,
            receipt,
            tipset: head.key,
            height: head.height,
        };
        for waiter in state.waiters.remove(&cid).unwrap_or_default() {
            let _ = waiter.send(lookup.clone());
        }
        state.lookups.insert(cid, lookup);
    }
}

#[async_trait]
impl ChainApi for MockChain {
    async fn chain_head(&self) -> Result<TipSet> {
        Ok(self.query()?.head().clone())
    }

    async fn chain_get_tipset_by_height(&self, height: ChainEpoch, tsk: &TipSetKey) -> Result<TipSet> {
        let state = self.query()?;
        let mut ts = if tsk.is_empty() {
            state.head().clone()
        } else {
            state
                .tipsets
                .get(tsk)
                .cloned()
                .ok_or_else(|| ChainError::not_found("tipset", tsk))?
        };
        while ts.height > height {
            ts = state
                .tipsets
                .get(&ts.parents)
                .cloned()
                .ok_or_else(|| ChainError::not_found("tipset", &ts.parents))?;
        }
        Ok(ts)
    }

    async fn chain_notify(&self) -> Result<HeadChanges> {
        let mut state = self.query()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(vec![HeadChange::Current(state.head().clone())]);
        state.subscribers.push(tx);
        Ok(rx)
    }

    async fn chain_get_message(&self, cid: &Cid) -> Result<Message> {
        self.query()?
            .messages
            .iter()
            .find(|(c, _)| c == cid)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| ChainError::not_found("message", cid))
    }

    async fn state_market_storage_deal(&self, deal_id: DealId, _tsk: &TipSetKey) -> Result<MarketDeal> {
        self.query()?
            .market_deals
            .get(&deal_id)
            .cloned()
            .ok_or_else(|| ChainError::not_found("market deal", deal_id))
    }

    async fn state_market_balance(&self, addr: &Address, _tsk: &TipSetKey) -> Result<MarketBalance> {
        Ok(self.query()?.balances.get(addr).copied().unwrap_or_default())
    }

    async fn state_deal_provider_collateral_bounds(
        &self,
        _piece_size: u64,
        _verified: bool,
        _tsk: &TipSetKey,
    ) -> Result<CollateralBounds> {
        Ok(self.query()?.collateral)
    }

    async fn state_verified_client_status(&self, addr: &Address, _tsk: &TipSetKey) -> Result<Option<u64>> {
        Ok(self.query()?.verified.get(addr).copied())
    }

    async fn state_sector_precommit_info(
        &self,
        miner: &Address,
        sector: SectorNumber,
        _tsk: &TipSetKey,
    ) -> Result<Option<SectorPreCommitOnChainInfo>> {
        Ok(self.query()?.precommits.get(&(*miner, sector)).cloned())
    }

    async fn state_sector_get_info(
        &self,
        miner: &Address,
        sector: SectorNumber,
        _tsk: &TipSetKey,
    ) -> Result<Option<SectorOnChainInfo>> {
        Ok(self.query()?.sectors.get(&(*miner, sector)).cloned())
    }

    async fn state_miner_info(&self, miner: &Address, _tsk: &TipSetKey) -> Result<MinerInfo> {
        self.query()?
            .miners
            .get(miner)
            .cloned()
            .ok_or_else(|| ChainError::not_found("miner", miner))
    }

    async fn state_account_key(&self, addr: &Address, _tsk: &TipSetKey) -> Result<Address> {
        if let Address::Key(_) = addr {
            return Ok(*addr);
        }
        self.query()?
            .account_keys
            .get(addr)
            .copied()
            .ok_or_else(|| ChainError::not_found("account key", addr))
    }

    async fn mpool_push_message(&self, mut msg: Message, _max_fee: Option<TokenAmount>) -> Result<Cid> {
        let mut state = self.query()?;
        let nonce = state.nonces.entry(msg.from).or_insert(0);
        msg.nonce = *nonce;
        *nonce += 1;
        let cid = msg.cid()?;
        state.messages.push((cid, msg));
        Ok(cid)
    }

    async fn state_wait_msg(&self, cid: &Cid, _confidence: u64) -> Result<MsgLookup> {
        let rx = {
            let mut state = self.query()?;
            if let Some(lookup) = state.lookups.get(cid) {
                return Ok(lookup.clone());
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(*cid).or_default().push(tx);
            rx
        };
        rx.await
            .map_err(|_| ChainError::Rpc(format!("wait for {} abandoned", cid)))
    }

    async fn state_search_msg(&self, cid: &Cid) -> Result<Option<MsgLookup>> {
        Ok(self.query()?.lookups.get(cid).cloned())
    }
}

/// In-memory ed25519 wallet.
#[derive(Default)]
pub struct MockWallet {
    keys: Mutex<HashMap<Address, KeyPair>>,
}

impl MockWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate(&self) -> Address {
        self.import(KeyPair::generate())
    }

    pub fn import(&self, key: KeyPair) -> Address {
        let addr = key.address();
        lock(&self.keys).insert(addr, key);
        addr
    }
}

#[async_trait]
impl WalletApi for MockWallet {
    async fn wallet_sign(&self, addr: &Address, data: &[u8]) -> Result<Signature> {
        lock(&self.keys)
            .get(addr)
            .map(|key| key.sign(data))
            .ok_or_else(|| ChainError::Wallet(format!("no key for {}", addr)))
    }

    async fn wallet_has(&self, addr: &Address) -> Result<bool> {
        Ok(lock(&self.keys).contains_key(addr))
    }
}

/// Records transfer-layer calls.
#[derive(Default)]
pub struct MockTransfer {
    restarted: Mutex<Vec<ChannelId>>,
    closed: Mutex<Vec<ChannelId>>,
    close_error: Mutex<Option<ChainError>>,
    restart_error: Mutex<Option<ChainError>>,
}

impl MockTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restarted(&self) -> Vec<ChannelId> {
        lock(&self.restarted).clone()
    }

    pub fn closed(&self) -> Vec<ChannelId> {
        lock(&self.closed).clone()
    }

    pub fn fail_close_with(&self, err: ChainError) {
        *lock(&self.close_error) = Some(err);
    }

    pub fn fail_restart_with(&self, err: ChainError) {
        *lock(&self.restart_error) = Some(err);
    }
}

#[async_trait]
impl TransferApi for MockTransfer {
    async fn restart_transfer(&self, channel: &ChannelId) -> Result<()> {
        if let Some(err) = lock(&self.restart_error).clone() {
            return Err(err);
        }
        lock(&self.restarted).push(channel.clone());
        Ok(())
    }

    async fn close_transfer(&self, channel: &ChannelId) -> Result<()> {
        if let Some(err) = lock(&self.close_error).clone() {
            return Err(err);
        }
        lock(&self.closed).push(channel.clone());
        Ok(())
    }
}

//! The provider node surface used by the storage deal state machine.

use crate::deal_info::DealInfoResolver;
use crate::error::{ProviderError, Result};
use crate::sector_committed::{CommitCallback, FireOnce, PreCommitCallback, SectorCommittedManager};
use async_trait::async_trait;
use market_chain::{ChainApi, Check, Events, StateWatch, WalletApi, WatchControl, WatchEvent};
use market_paych::FundManager;
use market_types::message::{actors, encode_params, PublishStorageDealsParams};
use market_types::{
    Address, ChainEpoch, Cid, DealId, DealProposal, MarketBalance, Message, Method, MinerDeal,
    RegisteredSealProof, SectorNumber, Signature, TipSet, TipSetKey, TokenAmount,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ProviderNodeConfig {
    pub message_confidence: u64,
    pub deal_publish_confidence: u64,
    pub collateral_multiplier: u64,
    pub max_publish_fee: Option<TokenAmount>,
}

impl Default for ProviderNodeConfig {
    fn default() -> Self {
        Self {
            message_confidence: 5,
            deal_publish_confidence: 5,
            collateral_multiplier: 2,
            max_publish_fee: None,
        }
    }
}

/// Receipt of a message once it is buried deep enough.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOutcome {
    pub exit_code: i64,
    pub return_data: Vec<u8>,
    pub final_cid: Cid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishResult {
    pub deal_id: DealId,
    pub final_cid: Cid,
}

/// How an active deal ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealEnd {
    Expired,
    Slashed(ChainEpoch),
}

pub type DealEndCallback = Box<dyn FnOnce(Result<DealEnd>) + Send>;

#[async_trait]
pub trait StorageProviderNode: Send + Sync {
    async fn sign(&self, signer: &Address, data: &[u8]) -> Result<Signature>;

    async fn get_chain_head(&self) -> Result<(TipSetKey, ChainEpoch)>;

    /// Move `amount` from `addr` into its own market escrow.
    async fn add_funds(&self, addr: Address, amount: TokenAmount) -> Result<Cid>;

    /// Returns the total now reserved for `addr`.
    async fn reserve_funds(&self, wallet: Address, addr: Address, amount: TokenAmount) -> Result<TokenAmount>;

    async fn release_funds(&self, addr: Address, amount: TokenAmount) -> Result<()>;

    async fn get_balance(&self, addr: &Address, tsk: &TipSetKey) -> Result<MarketBalance>;

    async fn verify_signature(
        &self,
        sig: &Signature,
        addr: &Address,
        input: &[u8],
        tsk: &TipSetKey,
    ) -> Result<bool>;

    async fn publish_deals(&self, deal: &MinerDeal) -> Result<Cid>;

    async fn wait_for_message(&self, cid: &Cid) -> Result<MessageOutcome>;

    async fn wait_for_publish_deals(&self, publish_cid: &Cid, proposal: &DealProposal) -> Result<PublishResult>;

    async fn deal_provider_collateral_bounds(
        &self,
        piece_size: u64,
        verified: bool,
    ) -> Result<(TokenAmount, TokenAmount)>;

    async fn get_data_cap(&self, addr: &Address, tsk: &TipSetKey) -> Result<Option<u64>>;

    async fn get_proof_type(&self, miner: &Address, tsk: &TipSetKey) -> Result<RegisteredSealProof>;

    async fn get_miner_worker_address(&self, miner: &Address, tsk: &TipSetKey) -> Result<Address>;

    async fn on_deal_sector_pre_committed(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: PreCommitCallback,
    ) -> Result<()>;

    async fn on_deal_sector_committed(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: CommitCallback,
    ) -> Result<()>;

    async fn on_deal_expired_or_slashed(
        &self,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: DealEndCallback,
    ) -> Result<()>;
}

pub struct ProviderNodeAdapter {
    chain: Arc<dyn ChainApi>,
    wallet: Arc<dyn WalletApi>,
    funds: Arc<FundManager>,
    events: Events,
    sectors: SectorCommittedManager,
    resolver: DealInfoResolver,
    config: ProviderNodeConfig,
}

impl ProviderNodeAdapter {
    pub fn new(
        wallet: Arc<dyn WalletApi>,
        funds: Arc<FundManager>,
        events: Events,
        config: ProviderNodeConfig,
    ) -> Self {
        let chain = events.api().clone();
        Self {
            sectors: SectorCommittedManager::new(events.clone(), config.message_confidence),
            resolver: DealInfoResolver::new(chain.clone()),
            chain,
            wallet,
            funds,
            events,
            config,
        }
    }
}

#[async_trait]
impl StorageProviderNode for ProviderNodeAdapter {
    async fn sign(&self, signer: &Address, data: &[u8]) -> Result<Signature> {
        Ok(self.wallet.wallet_sign(signer, data).await?)
    }

    async fn get_chain_head(&self) -> Result<(TipSetKey, ChainEpoch)> {
        let head = self.chain.chain_head().await?;
        Ok((head.key, head.height))
    }

    async fn add_funds(&self, addr: Address, amount: TokenAmount) -> Result<Cid> {
        Ok(self.funds.add_funds(addr, addr, amount).await?)
    }

    async fn reserve_funds(&self, wallet: Address, addr: Address, amount: TokenAmount) -> Result<TokenAmount> {
        Ok(self.funds.reserve_funds(wallet, addr, amount).await?)
    }

    async fn release_funds(&self, addr: Address, amount: TokenAmount) -> Result<()> {
        self.funds.release_funds(addr, amount).await?;
        Ok(())
    }

    async fn get_balance(&self, addr: &Address, tsk: &TipSetKey) -> Result<MarketBalance> {
        Ok(self.chain.state_market_balance(addr, tsk).await?)
    }

    async fn verify_signature(
        &self,
        sig: &Signature,
        addr: &Address,
        input: &[u8],
        tsk: &TipSetKey,
    ) -> Result<bool> {
        let key = self.chain.state_account_key(addr, tsk).await?;
        Ok(sig.verify(&key, input).is_ok())
    }

    async fn publish_deals(&self, deal: &MinerDeal) -> Result<Cid> {
        let provider = deal.provider();
        let head = self.chain.chain_head().await?;
        let worker = self.chain.state_miner_info(&provider, &head.key).await?.worker;
        let params = encode_params(&PublishStorageDealsParams {
            deals: vec![deal.client_deal_proposal.clone()],
        })?;
        let msg = Message::new(
            worker,
            actors::MARKET_ACTOR,
            TokenAmount::ZERO,
            Method::PublishStorageDeals,
            params,
        );
        let cid = self
            .chain
            .mpool_push_message(msg, self.config.max_publish_fee)
            .await?;
        info!(proposal = %deal.proposal_cid, worker = %worker, msg = %cid, "📣 Publishing deal");
        Ok(cid)
    }

    async fn wait_for_message(&self, cid: &Cid) -> Result<MessageOutcome> {
        let lookup = self
            .chain
            .state_wait_msg(cid, 2 * self.config.message_confidence)
            .await?;
        Ok(MessageOutcome {
            exit_code: lookup.receipt.exit_code,
            return_data: lookup.receipt.return_data,
            final_cid: lookup.message,
        })
    }

    async fn wait_for_publish_deals(&self, publish_cid: &Cid, proposal: &DealProposal) -> Result<PublishResult> {
        let lookup = self
            .chain
            .state_wait_msg(publish_cid, self.config.deal_publish_confidence)
            .await?;
        if !lookup.receipt.is_success() {
            warn!(msg = %publish_cid, exit_code = lookup.receipt.exit_code, "publish deals message failed");
            return Err(ProviderError::PublishFailed {
                cid: *publish_cid,
                exit_code: lookup.receipt.exit_code,
            });
        }
        let info = self
            .resolver
            .get_current_deal_info(&lookup.tipset, proposal, publish_cid)
            .await?;
        info!(msg = %publish_cid, deal_id = info.deal_id, "✅ Deal published");
        Ok(PublishResult {
            deal_id: info.deal_id,
            final_cid: lookup.message,
        })
    }

    async fn deal_provider_collateral_bounds(
        &self,
        piece_size: u64,
        verified: bool,
    ) -> Result<(TokenAmount, TokenAmount)> {
        let head = self.chain.chain_head().await?;
        let bounds = self
            .chain
            .state_deal_provider_collateral_bounds(piece_size, verified, &head.key)
            .await?;
        Ok((
            bounds.min,
            bounds.min.saturating_mul(self.config.collateral_multiplier),
        ))
    }

    async fn get_data_cap(&self, addr: &Address, tsk: &TipSetKey) -> Result<Option<u64>> {
        Ok(self.chain.state_verified_client_status(addr, tsk).await?)
    }

    async fn get_proof_type(&self, miner: &Address, tsk: &TipSetKey) -> Result<RegisteredSealProof> {
        let info = self.chain.state_miner_info(miner, tsk).await?;
        RegisteredSealProof::from_sector_size(info.sector_size)
            .ok_or(ProviderError::UnsupportedSectorSize(info.sector_size))
    }

    async fn get_miner_worker_address(&self, miner: &Address, tsk: &TipSetKey) -> Result<Address> {
        Ok(self.chain.state_miner_info(miner, tsk).await?.worker)
    }

    async fn on_deal_sector_pre_committed(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: PreCommitCallback,
    ) -> Result<()> {
        self.sectors
            .on_deal_sector_pre_committed(provider, sector_number, proposal, publish_cid, cb)
            .await
    }

    async fn on_deal_sector_committed(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: CommitCallback,
    ) -> Result<()> {
        self.sectors
            .on_deal_sector_committed(provider, sector_number, proposal, publish_cid, cb)
            .await
    }

    async fn on_deal_expired_or_slashed(
        &self,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: DealEndCallback,
    ) -> Result<()> {
        // the deal may already be gone from the market actor, so only the id is resolved here
        let (deal_id, _) = self
            .resolver
            .deal_id_from_publish_msg(&proposal, &publish_cid)
            .await?;
        let timeout_height = proposal.end_epoch + 1;
        let watch = DealEndWatch {
            chain: self.chain.clone(),
            deal_id,
            end_epoch: proposal.end_epoch,
            cb: FireOnce::new(cb),
        };
        debug!(deal_id, end_epoch = proposal.end_epoch, timeout_height, "watching deal for expiry or slashing");
        self.events
            .state_changed_until(watch, self.config.message_confidence + 1, timeout_height)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DealChange {
    Removed,
    Slashed(ChainEpoch),
}

struct DealEndWatch {
    chain: Arc<dyn ChainApi>,
    deal_id: DealId,
    end_epoch: ChainEpoch,
    cb: FireOnce<DealEnd>,
}

impl DealEndWatch {
    fn finish(&mut self, end: DealEnd) -> WatchControl {
        match end {
            DealEnd::Expired => info!(deal_id = self.deal_id, "⌛ Deal expired"),
            DealEnd::Slashed(epoch) => warn!(deal_id = self.deal_id, slash_epoch = epoch, "⚠️ Deal slashed"),
        }
        self.cb.fire(Ok(end));
        WatchControl::Done
    }
}

#[async_trait]
impl StateWatch for DealEndWatch {
    type Change = DealChange;

    async fn check(&mut self, head: &TipSet) -> market_chain::Result<Check> {
        if self.end_epoch <= head.height {
            self.finish(DealEnd::Expired);
            return Ok(Check::Done);
        }
        match self.chain.state_market_storage_deal(self.deal_id, &head.key).await {
            Ok(deal) if deal.state.is_slashed() => {
                self.finish(DealEnd::Slashed(deal.state.slash_epoch));
                Ok(Check::Done)
            }
            Ok(_) => Ok(Check::Pending),
            Err(e) if e.is_not_found() => {
                self.finish(DealEnd::Slashed(head.height));
                Ok(Check::Done)
            }
            Err(e) => Err(e),
        }
    }

    async fn matches(&mut self, _prev: &TipSet, next: &TipSet) -> market_chain::Result<Option<DealChange>> {
        match self.chain.state_market_storage_deal(self.deal_id, &next.key).await {
            Ok(deal) if deal.state.is_slashed() => Ok(Some(DealChange::Slashed(deal.state.slash_epoch))),
            Ok(_) => Ok(None),
            Err(e) if e.is_not_found() => Ok(Some(DealChange::Removed)),
            Err(e) => Err(e),
        }
    }

    async fn on_event(&mut self, event: WatchEvent<DealChange>) -> WatchControl {
        match event {
            WatchEvent::Matched { change, matched_at, .. } => match change {
                // removal once the deal has run its term is a normal expiry
                DealChange::Removed if self.end_epoch <= matched_at => self.finish(DealEnd::Expired),
                DealChange::Removed => self.finish(DealEnd::Slashed(matched_at)),
                DealChange::Slashed(epoch) => self.finish(DealEnd::Slashed(epoch)),
            },
            WatchEvent::Reverted { .. } => WatchControl::Continue,
            WatchEvent::TimedOut { .. } => self.finish(DealEnd::Expired),
            WatchEvent::Failed(e) => {
                self.cb.fire(Err(ProviderError::Chain(e)));
                WatchControl::Done
            }
        }
    }
}

//! Sector commitment tracking for published deals.
//!
//! Each registration places one watch on the chain event matcher. The
//! caller's callback fires at most once: with the outcome on a confirmed
//! match, or with the error if a chain query fails while the deal is being
//! resolved. Retrying is left to the reconciliation poller.

use crate::deal_info::DealInfoResolver;
use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use market_chain::{ChainApi, ChainError, Check, Events, StateWatch, WatchControl, WatchEvent, NO_TIMEOUT};
use market_types::{Address, Cid, DealId, DealProposal, SectorNumber, TipSet, TipSetKey};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reported when a deal's sector is pre-committed. `is_active` is set when
/// the deal turned out to be active already.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreCommitted {
    pub sector_number: SectorNumber,
    pub is_active: bool,
}

pub type PreCommitCallback = Box<dyn FnOnce(Result<PreCommitted>) + Send>;
pub type CommitCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// A callback that can be fired once; later calls are ignored.
pub(crate) struct FireOnce<T> {
    cb: Option<Box<dyn FnOnce(Result<T>) + Send>>,
}

impl<T> FireOnce<T> {
    pub(crate) fn new(cb: Box<dyn FnOnce(Result<T>) + Send>) -> Self {
        Self { cb: Some(cb) }
    }

    pub(crate) fn fire(&mut self, result: Result<T>) {
        match self.cb.take() {
            Some(cb) => cb(result),
            None => debug!("callback already fired, ignoring"),
        }
    }
}

/// What both sector watches need to know about the deal they follow.
struct DealTarget {
    chain: Arc<dyn ChainApi>,
    resolver: DealInfoResolver,
    provider: Address,
    sector_number: SectorNumber,
    proposal: DealProposal,
    publish_cid: Cid,
    deal_id: Option<DealId>,
}

impl DealTarget {
    /// Resolve the deal at `tsk`, remembering its id. Returns whether it is active.
    async fn resolve(&mut self, tsk: &TipSetKey) -> Result<bool> {
        let info = self
            .resolver
            .get_current_deal_info(tsk, &self.proposal, &self.publish_cid)
            .await?;
        self.deal_id = Some(info.deal_id);
        Ok(info.market_deal.state.is_active())
    }

    fn deal_id(&self) -> market_chain::Result<DealId> {
        self.deal_id
            .ok_or_else(|| ChainError::not_found("deal id", &self.publish_cid))
    }

    async fn precommitted(&self, tsk: &TipSetKey) -> market_chain::Result<bool> {
        let deal_id = self.deal_id()?;
        let precommit = self
            .chain
            .state_sector_precommit_info(&self.provider, self.sector_number, tsk)
            .await?;
        Ok(precommit.is_some_and(|p| p.info.deal_ids.contains(&deal_id)))
    }

    async fn active(&self, tsk: &TipSetKey) -> market_chain::Result<bool> {
        let deal_id = self.deal_id()?;
        let deal = self.chain.state_market_storage_deal(deal_id, tsk).await?;
        Ok(deal.state.is_active())
    }
}

fn watch_error<T>(event: &WatchEvent<T>) -> Option<ProviderError> {
    match event {
        WatchEvent::Failed(e) => Some(ProviderError::Chain(e.clone())),
        WatchEvent::TimedOut { height } => Some(ProviderError::Chain(ChainError::Timeout(format!(
            "sector watch timed out at height {}",
            height
        )))),
        _ => None,
    }
}

struct PreCommitWatch {
    target: DealTarget,
    cb: FireOnce<PreCommitted>,
}

#[async_trait]
impl StateWatch for PreCommitWatch {
    type Change = bool;

    async fn check(&mut self, head: &TipSet) -> market_chain::Result<Check> {
        let sector_number = self.target.sector_number;
        let is_active = match self.target.resolve(&head.key).await {
            Ok(active) => active,
            Err(e) => {
                warn!(sector = sector_number, error = %e, "failed to resolve deal for pre-commit watch");
                self.cb.fire(Err(e));
                return Ok(Check::Done);
            }
        };
        if is_active {
            self.cb.fire(Ok(PreCommitted { sector_number, is_active: true }));
            return Ok(Check::Done);
        }
        match self.target.precommitted(&head.key).await {
            Ok(true) => {
                self.cb.fire(Ok(PreCommitted { sector_number, is_active: false }));
                Ok(Check::Done)
            }
            Ok(false) => Ok(Check::Pending),
            Err(e) => {
                self.cb.fire(Err(e.into()));
                Ok(Check::Done)
            }
        }
    }

    async fn matches(&mut self, _prev: &TipSet, next: &TipSet) -> market_chain::Result<Option<bool>> {
        if self.target.active(&next.key).await? {
            return Ok(Some(true));
        }
        Ok(self.target.precommitted(&next.key).await?.then_some(false))
    }

    async fn on_event(&mut self, event: WatchEvent<bool>) -> WatchControl {
        if let Some(e) = watch_error(&event) {
            self.cb.fire(Err(e));
            return WatchControl::Done;
        }
        match event {
            WatchEvent::Matched { change, confirmed, .. } => {
                info!(
                    sector = self.target.sector_number,
                    deal_id = ?self.target.deal_id,
                    height = confirmed.height,
                    "📦 Deal sector pre-committed"
                );
                self.cb.fire(Ok(PreCommitted {
                    sector_number: self.target.sector_number,
                    is_active: change,
                }));
                WatchControl::Done
            }
            WatchEvent::Reverted { tipset } => {
                debug!(sector = self.target.sector_number, height = tipset.height, "pre-commit reverted");
                WatchControl::Continue
            }
            _ => WatchControl::Done,
        }
    }
}

struct CommitWatch {
    target: DealTarget,
    cb: FireOnce<()>,
}

#[async_trait]
impl StateWatch for CommitWatch {
    type Change = ();

    async fn check(&mut self, head: &TipSet) -> market_chain::Result<Check> {
        match self.target.resolve(&head.key).await {
            Ok(true) => {
                self.cb.fire(Ok(()));
                Ok(Check::Done)
            }
            Ok(false) => Ok(Check::Pending),
            Err(e) => {
                warn!(sector = self.target.sector_number, error = %e, "failed to resolve deal for commit watch");
                self.cb.fire(Err(e));
                Ok(Check::Done)
            }
        }
    }

    async fn matches(&mut self, _prev: &TipSet, next: &TipSet) -> market_chain::Result<Option<()>> {
        let deal_id = self.target.deal_id()?;
        let sector = self
            .target
            .chain
            .state_sector_get_info(&self.target.provider, self.target.sector_number, &next.key)
            .await?;
        if sector.is_some_and(|s| s.deal_ids.contains(&deal_id)) {
            return Ok(Some(()));
        }
        Ok(self.target.active(&next.key).await?.then_some(()))
    }

    async fn on_event(&mut self, event: WatchEvent<()>) -> WatchControl {
        if let Some(e) = watch_error(&event) {
            self.cb.fire(Err(e));
            return WatchControl::Done;
        }
        match event {
            WatchEvent::Matched { confirmed, .. } => {
                info!(
                    sector = self.target.sector_number,
                    deal_id = ?self.target.deal_id,
                    height = confirmed.height,
                    "🔒 Deal sector committed"
                );
                self.cb.fire(Ok(()));
                WatchControl::Done
            }
            WatchEvent::Reverted { .. } => WatchControl::Continue,
            _ => WatchControl::Done,
        }
    }
}

/// Registers sector pre-commit and commit watches for deals.
#[derive(Clone)]
pub struct SectorCommittedManager {
    events: Events,
    resolver: DealInfoResolver,
    confidence: u64,
}

impl SectorCommittedManager {
    /// `message_confidence` is the node's confidence for messages; watches
    /// wait one tipset more than that.
    pub fn new(events: Events, message_confidence: u64) -> Self {
        let resolver = DealInfoResolver::new(events.api().clone());
        Self {
            events,
            resolver,
            confidence: message_confidence + 1,
        }
    }

    fn target(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
    ) -> DealTarget {
        DealTarget {
            chain: self.events.api().clone(),
            resolver: self.resolver.clone(),
            provider,
            sector_number,
            proposal,
            publish_cid,
            deal_id: None,
        }
    }

    pub async fn on_deal_sector_pre_committed(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: PreCommitCallback,
    ) -> Result<()> {
        let watch = PreCommitWatch {
            target: self.target(provider, sector_number, proposal, publish_cid),
            cb: FireOnce::new(cb),
        };
        self.events
            .state_changed(watch, self.confidence, NO_TIMEOUT)
            .await
            .map_err(ProviderError::from)
    }

    pub async fn on_deal_sector_committed(
        &self,
        provider: Address,
        sector_number: SectorNumber,
        proposal: DealProposal,
        publish_cid: Cid,
        cb: CommitCallback,
    ) -> Result<()> {
        let watch = CommitWatch {
            target: self.target(provider, sector_number, proposal, publish_cid),
            cb: FireOnce::new(cb),
        };
        self.events
            .state_changed(watch, self.confidence, NO_TIMEOUT)
            .await
            .map_err(ProviderError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{client_deal, market_deal, publish, step, PROVIDER};
    use market_chain::mock::MockChain;
    use market_types::{
        DealState, RegisteredSealProof, SectorOnChainInfo, SectorPreCommitInfo,
        SectorPreCommitOnChainInfo, TokenAmount,
    };
    use std::sync::Mutex;

    type Seen<T> = Arc<Mutex<Vec<std::result::Result<T, String>>>>;

    fn recorder<T: Send + 'static>() -> (Seen<T>, Box<dyn FnOnce(Result<T>) + Send>) {
        let seen: Seen<T> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb = Box::new(move |r: Result<T>| sink.lock().unwrap().push(r.map_err(|e| e.to_string())));
        (seen, cb)
    }

    fn precommit(sector: SectorNumber, deal_ids: Vec<DealId>) -> SectorPreCommitOnChainInfo {
        SectorPreCommitOnChainInfo {
            info: SectorPreCommitInfo {
                seal_proof: RegisteredSealProof::StackedDrg2KiBV1_1,
                sector_number: sector,
                deal_ids,
                expiration: 1000,
            },
            pre_commit_deposit: TokenAmount::ZERO,
            pre_commit_epoch: 1,
        }
    }

    async fn setup() -> (Arc<MockChain>, Events, SectorCommittedManager, DealProposal, Cid) {
        let chain = Arc::new(MockChain::new());
        let deal = client_deal(1);
        let publish_cid = publish(&chain, vec![deal.clone()], vec![5]).await;
        chain.set_market_deal(5, market_deal(&deal.proposal, DealState::EMPTY));
        let events = Events::new(chain.clone());
        let manager = SectorCommittedManager::new(events.clone(), 1);
        (chain, events, manager, deal.proposal, publish_cid)
    }

    #[tokio::test]
    async fn test_pre_commit_fires_once_after_confidence() {
        let (chain, events, manager, proposal, publish_cid) = setup().await;
        let (seen, cb) = recorder();
        manager
            .on_deal_sector_pre_committed(PROVIDER, 9, proposal, publish_cid, cb)
            .await
            .unwrap();
        assert_eq!(events.active_watches().await, 1);

        step(&chain, &events).await;
        chain.set_precommit(PROVIDER, precommit(9, vec![5]));
        step(&chain, &events).await; // matched
        step(&chain, &events).await;
        assert!(seen.lock().unwrap().is_empty());
        step(&chain, &events).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(PreCommitted { sector_number: 9, is_active: false })]
        );

        step(&chain, &events).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(events.active_watches().await, 0);
    }

    #[tokio::test]
    async fn test_pre_commit_for_other_deal_is_ignored() {
        let (chain, events, manager, proposal, publish_cid) = setup().await;
        let (seen, cb) = recorder();
        manager
            .on_deal_sector_pre_committed(PROVIDER, 9, proposal, publish_cid, cb)
            .await
            .unwrap();
        chain.set_precommit(PROVIDER, precommit(9, vec![6]));
        for _ in 0..4 {
            step(&chain, &events).await;
        }
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_active_deal_short_circuits() {
        let (chain, events, manager, proposal, publish_cid) = setup().await;
        chain.set_market_deal(
            5,
            market_deal(
                &proposal,
                DealState {
                    sector_start_epoch: 3,
                    ..DealState::EMPTY
                },
            ),
        );

        let (pre, cb) = recorder();
        manager
            .on_deal_sector_pre_committed(PROVIDER, 9, proposal.clone(), publish_cid, cb)
            .await
            .unwrap();
        let (committed, cb) = recorder();
        manager
            .on_deal_sector_committed(PROVIDER, 9, proposal, publish_cid, cb)
            .await
            .unwrap();

        assert_eq!(
            *pre.lock().unwrap(),
            vec![Ok(PreCommitted { sector_number: 9, is_active: true })]
        );
        assert_eq!(*committed.lock().unwrap(), vec![Ok(())]);
        assert_eq!(events.active_watches().await, 0);
    }

    #[tokio::test]
    async fn test_commit_matches_proven_sector() {
        let (chain, events, manager, proposal, publish_cid) = setup().await;
        let (seen, cb) = recorder();
        manager
            .on_deal_sector_committed(PROVIDER, 9, proposal, publish_cid, cb)
            .await
            .unwrap();
        chain.set_sector(
            PROVIDER,
            SectorOnChainInfo {
                sector_number: 9,
                seal_proof: RegisteredSealProof::StackedDrg2KiBV1_1,
                deal_ids: vec![5],
                activation: 2,
                expiration: 1000,
            },
        );
        for _ in 0..3 {
            step(&chain, &events).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec![Ok(())]);
    }

    #[tokio::test]
    async fn test_resolution_error_reaches_callback() {
        let (_chain, events, manager, proposal, _) = setup().await;
        let (seen, cb) = recorder::<()>();
        manager
            .on_deal_sector_committed(PROVIDER, 9, proposal, Cid::of(b"not published"), cb)
            .await
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_err());
        assert_eq!(events.active_watches().await, 0);
    }

    #[tokio::test]
    async fn test_chain_failure_while_waiting_reaches_callback() {
        let (chain, events, manager, proposal, publish_cid) = setup().await;
        let (seen, cb) = recorder();
        manager
            .on_deal_sector_pre_committed(PROVIDER, 9, proposal, publish_cid, cb)
            .await
            .unwrap();
        chain.set_failing(true);
        let head = chain.head();
        let next = market_types::TipSet::new(head.height + 1, TipSetKey::default(), head.key.clone());
        events.process(vec![market_types::HeadChange::Apply(next)]).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].as_ref().unwrap_err().contains("injected chain failure"));
    }
}

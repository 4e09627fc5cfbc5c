use crate::error::Result;
use market_chain::ChainApi;
use market_storage::{Repo, StorageDealTx};
use market_types::{Address, Cid, MinerDeal, StorageDealStatus, TipSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Counters of one reconciliation sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub advanced: usize,
    pub failed: usize,
}

/// Periodically reconciles sealing and active deals with the market actor.
///
/// The sector tracker may move the same deals concurrently. Every move is
/// re-derived from the persisted status inside a transaction and skipped
/// when the deal is already there, so running a sweep twice against the
/// same chain state changes nothing the second time.
pub struct DealTracker {
    chain: Arc<dyn ChainApi>,
    repo: Arc<dyn Repo>,
    providers: Vec<Address>,
    period: Duration,
}

impl DealTracker {
    pub fn new(chain: Arc<dyn ChainApi>, repo: Arc<dyn Repo>, providers: Vec<Address>) -> Self {
        Self {
            chain,
            repo,
            providers,
            period: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Sweep now and then once per period until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(providers = self.providers.len(), period_secs = self.period.as_secs(), "🔎 Deal tracker started");
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.scan_deals(&cancel).await;
                }
            }
        }
        info!("🔎 Deal tracker stopped");
    }

    /// One sweep over every provider. Per-deal failures are logged and
    /// counted; they never stop the sweep.
    pub async fn scan_deals(&self, cancel: &CancellationToken) -> SweepReport {
        let start = Instant::now();
        let mut report = SweepReport::default();
        let head = match self.chain.chain_head().await {
            Ok(head) => head,
            Err(e) => {
                warn!(error = %e, "deal tracker could not load chain head");
                report.failed += 1;
                return report;
            }
        };

        for provider in &self.providers {
            if cancel.is_cancelled() {
                break;
            }
            // slashing first so a slashed deal never reads as progressing
            self.check_slash(provider, &head, cancel, &mut report).await;
            self.check_precommit_and_commit(provider, &head, cancel, &mut report)
                .await;
        }

        debug!(
            height = head.height,
            examined = report.examined,
            advanced = report.advanced,
            failed = report.failed,
            duration_ms = start.elapsed().as_millis() as u64,
            "deal tracker sweep finished"
        );
        report
    }

    async fn deals(&self, provider: &Address, statuses: &[StorageDealStatus]) -> Vec<MinerDeal> {
        match self
            .repo
            .storage_deals()
            .list_deals_by_provider(provider, statuses)
            .await
        {
            Ok(scan) => {
                for failure in &scan.failures {
                    warn!(provider = %provider, key = %failure.key, reason = %failure.reason, "undecodable deal record");
                }
                scan.items
            }
            Err(e) => {
                warn!(provider = %provider, error = %e, "failed to list deals");
                Vec::new()
            }
        }
    }

    async fn check_precommit_and_commit(
        &self,
        provider: &Address,
        head: &TipSet,
        cancel: &CancellationToken,
        report: &mut SweepReport,
    ) {
        let deals = self
            .deals(
                provider,
                &[StorageDealStatus::AwaitingPreCommit, StorageDealStatus::Sealing],
            )
            .await;
        for deal in deals {
            if cancel.is_cancelled() {
                return;
            }
            report.examined += 1;
            match self.reconcile_sealing(provider, head, &deal).await {
                Ok(true) => report.advanced += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(proposal = %deal.proposal_cid, error = %e, "failed to check deal sealing state");
                }
            }
        }
    }

    async fn reconcile_sealing(&self, provider: &Address, head: &TipSet, deal: &MinerDeal) -> Result<bool> {
        let Some(deal_id) = deal.deal_id else {
            warn!(proposal = %deal.proposal_cid, status = ?deal.state, "sealing deal has no deal id");
            return Ok(false);
        };

        let market_deal = self.chain.state_market_storage_deal(deal_id, &head.key).await?;
        if market_deal.state.is_slashed() {
            return self.advance(&deal.proposal_cid, StorageDealStatus::Slashed).await;
        }
        if market_deal.state.is_active() {
            // a deal can go active before the pre-commit was ever observed
            return self.advance(&deal.proposal_cid, StorageDealStatus::Active).await;
        }

        if deal.state == StorageDealStatus::AwaitingPreCommit {
            let Some(sector) = deal.sector_number else {
                return Ok(false);
            };
            let precommit = self
                .chain
                .state_sector_precommit_info(provider, sector, &head.key)
                .await?;
            if precommit.is_some() {
                return self.advance(&deal.proposal_cid, StorageDealStatus::Sealing).await;
            }
        }
        Ok(false)
    }

    async fn check_slash(
        &self,
        provider: &Address,
        head: &TipSet,
        cancel: &CancellationToken,
        report: &mut SweepReport,
    ) {
        for deal in self.deals(provider, &[StorageDealStatus::Active]).await {
            if cancel.is_cancelled() {
                return;
            }
            report.examined += 1;
            let Some(deal_id) = deal.deal_id else {
                warn!(proposal = %deal.proposal_cid, "active deal has no deal id");
                continue;
            };
            let outcome = match self.chain.state_market_storage_deal(deal_id, &head.key).await {
                Ok(market_deal) if market_deal.state.is_slashed() => {
                    self.advance(&deal.proposal_cid, StorageDealStatus::Slashed).await
                }
                Ok(_) => Ok(false),
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(true) => report.advanced += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    warn!(proposal = %deal.proposal_cid, deal_id, error = %e, "failed to check deal slashing");
                }
            }
        }
    }

    /// Move the deal to `target` from its persisted status. Returns false
    /// when it is already there or cannot move there.
    async fn advance(&self, proposal_cid: &Cid, target: StorageDealStatus) -> Result<bool> {
        let mut moved = None;
        self.repo
            .transaction(&mut |tx: &mut dyn StorageDealTx| {
                moved = None;
                let mut deal = tx.get_deal(proposal_cid)?;
                if deal.state == target || !deal.state.can_transition_to(&target) {
                    return Ok(());
                }
                moved = Some(deal.state);
                deal.state = target;
                deal.touch();
                tx.save_deal(&deal)
            })
            .await?;

        match moved {
            Some(from) => {
                info!(proposal = %proposal_cid, from = ?from, to = ?target, "🔄 Deal status reconciled");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{market_deal, tracked_deal as tracked, PROVIDER};
    use market_chain::mock::MockChain;
    use market_storage::KvRepo;
    use market_types::DealState;

    #[tokio::test]
    async fn test_slash_is_detected_once() {
        let chain = Arc::new(MockChain::new());
        let repo: Arc<dyn Repo> = Arc::new(KvRepo::memory());
        let deal = tracked(repo.as_ref(), 3, StorageDealStatus::Active).await;
        chain.set_market_deal(
            3,
            market_deal(
                deal.proposal(),
                DealState {
                    sector_start_epoch: 1,
                    last_updated_epoch: 2,
                    slash_epoch: 4,
                },
            ),
        );

        let tracker = DealTracker::new(chain, repo.clone(), vec![PROVIDER]);
        let report = tracker.scan_deals(&CancellationToken::new()).await;
        assert_eq!(report, SweepReport { examined: 1, advanced: 1, failed: 0 });
        let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
        assert_eq!(stored.state, StorageDealStatus::Slashed);

        let report = tracker.scan_deals(&CancellationToken::new()).await;
        assert_eq!(report.examined, 0);
    }

    #[tokio::test]
    async fn test_advance_refuses_backwards_move() {
        let chain = Arc::new(MockChain::new());
        let repo: Arc<dyn Repo> = Arc::new(KvRepo::memory());
        let deal = tracked(repo.as_ref(), 1, StorageDealStatus::Active).await;
        let tracker = DealTracker::new(chain, repo.clone(), vec![PROVIDER]);

        assert!(!tracker.advance(&deal.proposal_cid, StorageDealStatus::Sealing).await.unwrap());
        assert!(!tracker.advance(&deal.proposal_cid, StorageDealStatus::Active).await.unwrap());
        let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
        assert_eq!(stored, deal);
    }
}

use market_chain::mock::MockChain;
use market_provider::{DealTracker, SweepReport};
use market_provider::testutil::{active, market_deal, tracked_deal, PROVIDER};
use market_storage::{KvRepo, Repo, SqliteRepo};
use market_types::{
    DealState, RegisteredSealProof, SectorPreCommitInfo, SectorPreCommitOnChainInfo,
    StorageDealStatus, TokenAmount,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn precommit(sector: u64, deal_id: u64) -> SectorPreCommitOnChainInfo {
    SectorPreCommitOnChainInfo {
        info: SectorPreCommitInfo {
            seal_proof: RegisteredSealProof::StackedDrg2KiBV1_1,
            sector_number: sector,
            deal_ids: vec![deal_id],
            expiration: 10_000,
        },
        pre_commit_deposit: TokenAmount::ZERO,
        pre_commit_epoch: 1,
    }
}

fn setup() -> (Arc<MockChain>, Arc<dyn Repo>, DealTracker) {
    let chain = Arc::new(MockChain::new());
    let repo: Arc<dyn Repo> = Arc::new(KvRepo::memory());
    let tracker = DealTracker::new(chain.clone(), repo.clone(), vec![PROVIDER]);
    (chain, repo, tracker)
}

#[tokio::test]
async fn test_precommit_moves_to_sealing_idempotently() {
    let (chain, repo, tracker) = setup();
    let deal = tracked_deal(repo.as_ref(), 1, StorageDealStatus::AwaitingPreCommit).await;
    chain.set_market_deal(1, market_deal(deal.proposal(), DealState::EMPTY));

    // nothing on chain yet
    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report, SweepReport { examined: 1, advanced: 0, failed: 0 });

    chain.set_precommit(PROVIDER, precommit(1, 1));
    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report.advanced, 1);
    let sealing = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
    assert_eq!(sealing.state, StorageDealStatus::Sealing);

    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report, SweepReport { examined: 1, advanced: 0, failed: 0 });
    let again = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
    assert_eq!(again, sealing);
}

#[tokio::test]
async fn test_sealing_deal_goes_active() {
    let (chain, repo, tracker) = setup();
    let deal = tracked_deal(repo.as_ref(), 2, StorageDealStatus::Sealing).await;
    chain.set_market_deal(2, market_deal(deal.proposal(), active(5)));

    tracker.scan_deals(&CancellationToken::new()).await;
    let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
    assert_eq!(stored.state, StorageDealStatus::Active);
}

#[tokio::test]
async fn test_awaiting_precommit_may_skip_sealing() {
    let (chain, repo, tracker) = setup();
    let deal = tracked_deal(repo.as_ref(), 3, StorageDealStatus::AwaitingPreCommit).await;
    chain.set_market_deal(3, market_deal(deal.proposal(), active(5)));
    chain.set_precommit(PROVIDER, precommit(3, 3));

    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report.advanced, 1);
    let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
    assert_eq!(stored.state, StorageDealStatus::Active);
}

#[tokio::test]
async fn test_slashed_sealing_deal_goes_straight_to_slashed() {
    let (chain, repo, tracker) = setup();
    let awaiting = tracked_deal(repo.as_ref(), 9, StorageDealStatus::AwaitingPreCommit).await;
    let sealing = tracked_deal(repo.as_ref(), 10, StorageDealStatus::Sealing).await;
    let slashed = DealState {
        sector_start_epoch: 2,
        last_updated_epoch: 4,
        slash_epoch: 4,
    };
    chain.set_market_deal(9, market_deal(awaiting.proposal(), slashed));
    chain.set_market_deal(10, market_deal(sealing.proposal(), slashed));
    chain.set_precommit(PROVIDER, precommit(9, 9));

    // one move per deal, never through Sealing or Active
    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report, SweepReport { examined: 2, advanced: 2, failed: 0 });
    for deal in [&awaiting, &sealing] {
        let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
        assert_eq!(stored.state, StorageDealStatus::Slashed);
    }

    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report, SweepReport::default());
}

#[tokio::test]
async fn test_failing_deal_does_not_stop_sweep() {
    let (chain, repo, tracker) = setup();
    // deal 4 is unknown to the market actor
    let missing = tracked_deal(repo.as_ref(), 4, StorageDealStatus::Sealing).await;
    let ok = tracked_deal(repo.as_ref(), 5, StorageDealStatus::Sealing).await;
    chain.set_market_deal(5, market_deal(ok.proposal(), active(2)));

    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report, SweepReport { examined: 2, advanced: 1, failed: 1 });
    let stored = repo.storage_deals().get_deal(&missing.proposal_cid).await.unwrap();
    assert_eq!(stored.state, StorageDealStatus::Sealing);
    let stored = repo.storage_deals().get_deal(&ok.proposal_cid).await.unwrap();
    assert_eq!(stored.state, StorageDealStatus::Active);
}

#[tokio::test]
async fn test_chain_outage_fails_sweep_without_writes() {
    let (chain, repo, tracker) = setup();
    let deal = tracked_deal(repo.as_ref(), 6, StorageDealStatus::Active).await;
    chain.set_failing(true);

    let report = tracker.scan_deals(&CancellationToken::new()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap(), deal);
}

#[tokio::test]
async fn test_cancelled_sweep_examines_nothing() {
    let (chain, repo, tracker) = setup();
    let deal = tracked_deal(repo.as_ref(), 7, StorageDealStatus::Sealing).await;
    chain.set_market_deal(7, market_deal(deal.proposal(), active(2)));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = tracker.scan_deals(&cancel).await;
    assert_eq!(report.examined, 0);
    let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
    assert_eq!(stored.state, StorageDealStatus::Sealing);
}

#[tokio::test]
async fn test_run_sweeps_immediately_and_stops_on_cancel() {
    let dir = TempDir::new().unwrap();
    let chain = Arc::new(MockChain::new());
    let repo: Arc<dyn Repo> = Arc::new(SqliteRepo::open(dir.path().join("market.db")).unwrap());
    let deal = tracked_deal(repo.as_ref(), 8, StorageDealStatus::Active).await;
    chain.set_market_deal(
        8,
        market_deal(
            deal.proposal(),
            DealState {
                sector_start_epoch: 1,
                last_updated_epoch: 3,
                slash_epoch: 3,
            },
        ),
    );

    let tracker = Arc::new(
        DealTracker::new(chain.clone(), repo.clone(), vec![PROVIDER]).with_period(Duration::from_secs(3600)),
    );
    let cancel = CancellationToken::new();
    let handle = {
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tracker.run(cancel).await })
    };

    let slashed = async {
        loop {
            let stored = repo.storage_deals().get_deal(&deal.proposal_cid).await.unwrap();
            if stored.state == StorageDealStatus::Slashed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), slashed).await.unwrap();

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

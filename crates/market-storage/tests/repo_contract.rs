//! The same behaviour checks run against every backend.

use market_storage::{KvRepo, Repo, SqliteRepo, StorageDealTx, StoreError, Table};
use market_types::{
    Address, ChannelInfo, ClientDealProposal, Cid, DealProposal, FundedAddressState, MinerDeal,
    MsgInfo, PeerId, ProviderDealState, RetrievalDealStatus, RetrievalParams, Signature,
    SignedStorageAsk, StorageAsk, StorageDealStatus, TokenAmount,
};
use std::sync::Arc;

fn make_deal(provider: Address, piece: &[u8], label: &str, created_at: i64) -> MinerDeal {
    let proposal = DealProposal {
        piece_cid: Cid::of(piece),
        piece_size: 2048,
        verified_deal: false,
        client: Address::new_id(500),
        provider,
        label: label.to_string(),
        start_epoch: 100,
        end_epoch: 10_000,
        storage_price_per_epoch: TokenAmount::from_atto(10),
        provider_collateral: TokenAmount::from_atto(1_000),
        client_collateral: TokenAmount::ZERO,
    };
    let signed = ClientDealProposal {
        proposal,
        client_signature: Signature::new_ed25519(vec![7; 64]),
    };
    let mut deal = MinerDeal::new(
        signed,
        PeerId::new("12D3KooWClient"),
        PeerId::new("12D3KooWMiner"),
        Cid::of(b"payload"),
    )
    .unwrap();
    deal.created_at = created_at;
    deal
}

async fn save_get_has(repo: &dyn Repo) {
    let deals = repo.storage_deals();
    let mut deal = make_deal(Address::new_id(1000), b"piece-a", "a", 1);
    deal.state = StorageDealStatus::AwaitingPreCommit;
    deal.deal_id = Some(77);
    deal.publish_cid = Some(Cid::of(b"publish"));

    assert!(!deals.has_deal(&deal.proposal_cid).await.unwrap());
    deals.save_deal(&deal).await.unwrap();
    assert!(deals.has_deal(&deal.proposal_cid).await.unwrap());
    assert_eq!(deals.get_deal(&deal.proposal_cid).await.unwrap(), deal);

    // last write wins
    deal.message = "updated".into();
    deals.save_deal(&deal).await.unwrap();
    assert_eq!(deals.get_deal(&deal.proposal_cid).await.unwrap().message, "updated");
    assert_eq!(deals.list_deals().await.unwrap().len(), 1);
}

async fn not_found_is_typed(repo: &dyn Repo) {
    let err = repo
        .storage_deals()
        .get_deal(&Cid::of(b"missing"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err, StoreError::NotFound { table: "storage_deals", .. }));

    let err = repo.funds().get_fund_state(&Address::new_id(1)).await.unwrap_err();
    assert!(err.is_not_found());
}

async fn field_queries(repo: &dyn Repo) {
    let deals = repo.storage_deals();
    let p1 = Address::new_id(1000);
    let p2 = Address::new_id(2000);

    let mut a = make_deal(p1, b"piece-a", "a", 3);
    a.state = StorageDealStatus::AwaitingPreCommit;
    a.deal_id = Some(1);
    let mut b = make_deal(p1, b"piece-b", "b", 1);
    b.state = StorageDealStatus::Sealing;
    b.deal_id = Some(2);
    let mut c = make_deal(p1, b"piece-a", "c", 2);
    c.state = StorageDealStatus::Active;
    c.deal_id = Some(3);
    let mut d = make_deal(p2, b"piece-a", "d", 4);
    d.state = StorageDealStatus::Sealing;
    d.deal_id = Some(1);
    for deal in [&a, &b, &c, &d] {
        deals.save_deal(deal).await.unwrap();
    }

    let in_flight = deals
        .list_deals_by_provider(
            &p1,
            &[StorageDealStatus::AwaitingPreCommit, StorageDealStatus::Sealing],
        )
        .await
        .unwrap();
    let mut labels: Vec<_> = in_flight.items.iter().map(|d| d.proposal().label.clone()).collect();
    labels.sort();
    assert_eq!(labels, vec!["a", "b"]);

    assert_eq!(deals.list_deals_by_provider(&p1, &[]).await.unwrap().len(), 3);
    assert_eq!(deals.get_deals_by_piece(&Cid::of(b"piece-a"), &[]).await.unwrap().len(), 3);
    assert_eq!(
        deals
            .get_deals_by_piece(&Cid::of(b"piece-a"), &[StorageDealStatus::Active])
            .await
            .unwrap()
            .items,
        vec![c.clone()]
    );

    assert_eq!(deals.get_deal_by_deal_id(&p2, 1).await.unwrap(), d);
    assert!(deals.get_deal_by_deal_id(&p2, 3).await.unwrap_err().is_not_found());

    let page: Vec<_> = deals
        .list_deals_page(1, 2)
        .await
        .unwrap()
        .items
        .into_iter()
        .map(|d| d.proposal().label.clone())
        .collect();
    assert_eq!(page, vec!["c", "a"]);

    deals
        .update_deal_status(&b.proposal_cid, StorageDealStatus::Active)
        .await
        .unwrap();
    assert_eq!(deals.get_deal(&b.proposal_cid).await.unwrap().state, StorageDealStatus::Active);
    assert!(deals
        .update_deal_status(&Cid::of(b"nope"), StorageDealStatus::Active)
        .await
        .unwrap_err()
        .is_not_found());
}

async fn transaction_commit_and_rollback(repo: &dyn Repo) {
    let deal = make_deal(Address::new_id(1000), b"piece-tx", "tx", 1);
    repo.storage_deals().save_deal(&deal).await.unwrap();
    let cid = deal.proposal_cid;

    let second = make_deal(Address::new_id(1000), b"piece-tx2", "tx2", 2);
    let second_cid = second.proposal_cid;
    repo.transaction(&mut |tx: &mut dyn StorageDealTx| {
        let mut d = tx.get_deal(&cid)?;
        d.state = StorageDealStatus::Sealing;
        tx.save_deal(&d)?;
        // reads inside the transaction see its own writes
        assert_eq!(tx.get_deal(&cid)?.state, StorageDealStatus::Sealing);
        tx.save_deal(&second)
    })
    .await
    .unwrap();
    assert_eq!(repo.storage_deals().get_deal(&cid).await.unwrap().state, StorageDealStatus::Sealing);
    assert!(repo.storage_deals().has_deal(&second_cid).await.unwrap());

    let result = repo
        .transaction(&mut |tx: &mut dyn StorageDealTx| {
            let mut d = tx.get_deal(&cid)?;
            d.state = StorageDealStatus::Active;
            tx.save_deal(&d)?;
            Err(StoreError::Aborted("changed my mind".into()))
        })
        .await;
    assert!(matches!(result, Err(StoreError::Aborted(_))));
    assert_eq!(repo.storage_deals().get_deal(&cid).await.unwrap().state, StorageDealStatus::Sealing);
}

async fn fund_states(repo: &dyn Repo) {
    let funds = repo.funds();
    let mut first = FundedAddressState {
        addr: Address::new_id(101),
        wallet: Some(Address::new_id(900)),
        amt_reserved: TokenAmount::from_atto(100),
        msg_cid: None,
    };
    let second = FundedAddressState {
        addr: Address::new_id(102),
        wallet: None,
        amt_reserved: TokenAmount::from_atto(200),
        msg_cid: Some(Cid::of(b"add-balance")),
    };
    funds.save_fund_state(&first).await.unwrap();
    funds.save_fund_state(&second).await.unwrap();
    assert_eq!(funds.get_fund_state(&first.addr).await.unwrap(), first);
    assert_eq!(funds.get_fund_state(&second.addr).await.unwrap(), second);

    first.amt_reserved = TokenAmount::from_atto(150);
    first.msg_cid = Some(Cid::of(b"top-up"));
    funds.save_fund_state(&first).await.unwrap();
    assert_eq!(funds.get_fund_state(&first.addr).await.unwrap(), first);

    assert!(funds.list_fund_states().await.unwrap().len() >= 2);
}

async fn retrieval_deals(repo: &dyn Repo) {
    let params = RetrievalParams {
        payload_cid: Cid::of(b"payload"),
        piece_cid: Some(Cid::of(b"piece")),
        price_per_byte: TokenAmount::from_atto(1),
        unseal_price: TokenAmount::ZERO,
        payment_interval: 1024,
        payment_interval_increase: 1024,
    };
    let mut deal = ProviderDealState::new(PeerId::new("peer-r"), 4, params);
    deal.status = RetrievalDealStatus::Unsealing;
    let rd = repo.retrieval_deals();
    rd.save_retrieval_deal(&deal).await.unwrap();
    assert!(rd.has_retrieval_deal(&deal.identifier()).await.unwrap());
    assert_eq!(rd.get_retrieval_deal(&deal.identifier()).await.unwrap(), deal);

    let mut other = deal.clone();
    other.deal_id = 5;
    rd.save_retrieval_deal(&other).await.unwrap();
    assert_eq!(rd.list_retrieval_deals().await.unwrap().len(), 2);
    assert_eq!(
        repo.raw_keys(Table::RetrievalDeals).await.unwrap(),
        vec!["peer-r/4".to_string(), "peer-r/5".to_string()]
    );
}

async fn channels_and_messages(repo: &dyn Repo) {
    let paych = repo.paych();
    let from = Address::new_id(1);
    let to = Address::new_id(2);
    let mut ci = ChannelInfo::new_outbound("chan-1".into(), from, to);
    paych.save_channel_info(&ci).await.unwrap();
    assert_eq!(paych.outbound_active_by_from_to(&from, &to).await.unwrap(), ci);
    assert!(paych.get_channel_by_address(&Address::new_id(77)).await.unwrap_err().is_not_found());

    ci.channel = Some(Address::new_id(77));
    ci.amount = TokenAmount::from_atto(500);
    paych.save_channel_info(&ci).await.unwrap();
    assert_eq!(paych.get_channel_by_address(&Address::new_id(77)).await.unwrap(), ci);

    let msg = MsgInfo {
        channel_id: ci.channel_id.clone(),
        msg_cid: Cid::of(b"create"),
        received: false,
        err: String::new(),
    };
    paych.save_msg_info(&msg).await.unwrap();
    assert_eq!(paych.get_msg_info(&msg.msg_cid).await.unwrap(), msg);
    assert_eq!(paych.list_msg_infos().await.unwrap().len(), 1);

    paych.remove_channel("chan-1").await.unwrap();
    assert!(paych.get_channel_info("chan-1").await.unwrap_err().is_not_found());
    assert!(paych.remove_channel("chan-1").await.unwrap_err().is_not_found());
}

async fn asks(repo: &dyn Repo) {
    let ask = SignedStorageAsk {
        ask: StorageAsk {
            miner: Address::new_id(1000),
            price: TokenAmount::from_atto(5),
            verified_price: TokenAmount::ZERO,
            min_piece_size: 256,
            max_piece_size: 1 << 30,
            timestamp: 10,
            expiry: 1000,
            seq_no: 0,
        },
        signature: None,
    };
    repo.asks().set_storage_ask(&ask).await.unwrap();
    assert_eq!(repo.asks().get_storage_ask(&Address::new_id(1000)).await.unwrap(), ask);
    assert_eq!(repo.asks().list_storage_asks().await.unwrap().len(), 1);
}

async fn concurrent_saves(repo: Arc<dyn Repo>) {
    let mut handles = Vec::new();
    for i in 0..16u64 {
        let repo = repo.clone();
        handles.push(tokio::spawn(async move {
            let deal = make_deal(Address::new_id(1000), format!("piece-{}", i).as_bytes(), "c", i as i64);
            repo.storage_deals().save_deal(&deal).await.unwrap();
        }));
    }
    for h in handles {
        h.await.unwrap();
    }
    assert_eq!(repo.storage_deals().list_deals().await.unwrap().len(), 16);
}

macro_rules! contract_tests {
    ($modname:ident, $make:expr) => {
        mod $modname {
            use super::*;

            #[tokio::test]
            async fn test_save_get_has() {
                let (repo, _guard) = $make;
                save_get_has(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_not_found_is_typed() {
                let (repo, _guard) = $make;
                not_found_is_typed(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_field_queries() {
                let (repo, _guard) = $make;
                field_queries(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_transaction() {
                let (repo, _guard) = $make;
                transaction_commit_and_rollback(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_fund_states() {
                let (repo, _guard) = $make;
                fund_states(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_retrieval_deals() {
                let (repo, _guard) = $make;
                retrieval_deals(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_channels_and_messages() {
                let (repo, _guard) = $make;
                channels_and_messages(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_asks() {
                let (repo, _guard) = $make;
                asks(repo.as_ref()).await;
            }

            #[tokio::test]
            async fn test_concurrent_saves() {
                let (repo, _guard) = $make;
                concurrent_saves(repo).await;
            }
        }
    };
}

contract_tests!(memory, (Arc::new(KvRepo::memory()) as Arc<dyn Repo>, ()));

contract_tests!(
    sqlite,
    {
        let dir = tempfile::tempdir().unwrap();
        let repo = SqliteRepo::open(dir.path().join("market.db")).unwrap();
        (Arc::new(repo) as Arc<dyn Repo>, dir)
    }
);

#[cfg(feature = "rocksdb")]
contract_tests!(
    rocks,
    {
        let dir = tempfile::tempdir().unwrap();
        let repo = KvRepo::open_rocks(dir.path()).unwrap();
        (Arc::new(repo) as Arc<dyn Repo>, dir)
    }
);

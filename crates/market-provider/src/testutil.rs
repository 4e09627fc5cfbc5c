//! Fixtures shared by the unit tests and the integration tests under `tests/`.
//! Built for `cfg(test)` and the `testutil` feature.

use market_chain::mock::MockChain;
use market_chain::{ChainApi, Events};
use market_storage::Repo;
use market_types::message::{actors, encode_params, PublishStorageDealsParams, PublishStorageDealsReturn};
use market_types::{
    Address, Cid, ClientDealProposal, DealId, DealProposal, DealState, HeadChange, MarketDeal,
    Message, MessageReceipt, Method, MinerDeal, PeerId, Signature, StorageDealStatus, TokenAmount,
};

pub const PROVIDER: Address = Address::Id(1000);
pub const WORKER: Address = Address::Id(1001);

pub fn client_deal(n: u64) -> ClientDealProposal {
    ClientDealProposal {
        proposal: DealProposal {
            piece_cid: Cid::of(format!("piece-{}", n).as_bytes()),
            piece_size: 2048,
            verified_deal: false,
            client: Address::new_id(100),
            provider: PROVIDER,
            label: format!("deal {}", n),
            start_epoch: 10,
            end_epoch: 100,
            storage_price_per_epoch: TokenAmount::from_atto(1),
            provider_collateral: TokenAmount::ZERO,
            client_collateral: TokenAmount::ZERO,
        },
        client_signature: Signature::new_ed25519(Vec::new()),
    }
}

pub fn market_deal(proposal: &DealProposal, state: DealState) -> MarketDeal {
    MarketDeal {
        proposal: proposal.clone(),
        state,
    }
}

/// On-chain state of a deal activated at `start` and never slashed.
pub fn active(start: i64) -> DealState {
    DealState {
        sector_start_epoch: start,
        last_updated_epoch: start,
        slash_epoch: -1,
    }
}

/// Save a provider deal record with deal id and sector number `n`.
pub async fn tracked_deal(repo: &dyn Repo, n: u64, status: StorageDealStatus) -> MinerDeal {
    let mut deal = MinerDeal::new(
        client_deal(n),
        PeerId::new("client"),
        PeerId::new("miner"),
        Cid::of(b"payload"),
    )
    .unwrap();
    deal.state = status;
    deal.deal_id = Some(n);
    deal.sector_number = Some(n);
    repo.storage_deals().save_deal(&deal).await.unwrap();
    deal
}

/// Push a publish message for `deals` and resolve it successfully with `ids`.
pub async fn publish(chain: &MockChain, deals: Vec<ClientDealProposal>, ids: Vec<DealId>) -> Cid {
    let params = encode_params(&PublishStorageDealsParams { deals }).unwrap();
    let msg = Message::new(
        WORKER,
        actors::MARKET_ACTOR,
        TokenAmount::ZERO,
        Method::PublishStorageDeals,
        params,
    );
    let cid = chain.mpool_push_message(msg, None).await.unwrap();
    let ret = encode_params(&PublishStorageDealsReturn { ids }).unwrap();
    chain.resolve_message(cid, MessageReceipt::ok(ret));
    cid
}

pub async fn step(chain: &MockChain, events: &Events) {
    events.process(vec![HeadChange::Apply(chain.advance())]).await;
}

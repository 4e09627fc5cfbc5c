use async_trait::async_trait;
use market_chain::mock::{MockChain, MockWallet};
use market_paych::{PaychError, PaychManager};
use market_storage::{
    AskRepo, FundRepo, KvRepo, PaychRepo, Repo, RetrievalDealRepo, ScanResult, SqliteRepo,
    StorageDealRepo, StoreError, Table, TxFn,
};
use market_types::message::encode_params;
use market_types::{
    Address, ChannelInfo, Cid, KeyPair, MessageReceipt, Method, MsgInfo, PaychCreateReturn,
    SignedVoucher, TokenAmount,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Repository whose message records stop saving once `fail_msg_saves` is set.
struct BrokenMsgStore {
    inner: KvRepo,
    fail_msg_saves: AtomicBool,
}

impl BrokenMsgStore {
    fn new() -> Self {
        Self {
            inner: KvRepo::memory(),
            fail_msg_saves: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PaychRepo for BrokenMsgStore {
    async fn save_channel_info(&self, info: &ChannelInfo) -> market_storage::Result<()> {
        self.inner.paych().save_channel_info(info).await
    }

    async fn get_channel_info(&self, channel_id: &str) -> market_storage::Result<ChannelInfo> {
        self.inner.paych().get_channel_info(channel_id).await
    }

    async fn get_channel_by_address(&self, channel: &Address) -> market_storage::Result<ChannelInfo> {
        self.inner.paych().get_channel_by_address(channel).await
    }

    async fn outbound_active_by_from_to(
        &self,
        from: &Address,
        to: &Address,
    ) -> market_storage::Result<ChannelInfo> {
        self.inner.paych().outbound_active_by_from_to(from, to).await
    }

    async fn list_channels(&self) -> market_storage::Result<ScanResult<ChannelInfo>> {
        self.inner.paych().list_channels().await
    }

    async fn remove_channel(&self, channel_id: &str) -> market_storage::Result<()> {
        self.inner.paych().remove_channel(channel_id).await
    }

    async fn save_msg_info(&self, info: &MsgInfo) -> market_storage::Result<()> {
        if self.fail_msg_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.paych().save_msg_info(info).await
    }

    async fn get_msg_info(&self, msg_cid: &Cid) -> market_storage::Result<MsgInfo> {
        self.inner.paych().get_msg_info(msg_cid).await
    }

    async fn list_msg_infos(&self) -> market_storage::Result<ScanResult<MsgInfo>> {
        self.inner.paych().list_msg_infos().await
    }
}

#[async_trait]
impl Repo for BrokenMsgStore {
    fn backend_name(&self) -> &'static str {
        "broken"
    }

    fn storage_deals(&self) -> &dyn StorageDealRepo {
        self.inner.storage_deals()
    }

    fn retrieval_deals(&self) -> &dyn RetrievalDealRepo {
        self.inner.retrieval_deals()
    }

    fn funds(&self) -> &dyn FundRepo {
        self.inner.funds()
    }

    fn paych(&self) -> &dyn PaychRepo {
        self
    }

    fn asks(&self) -> &dyn AskRepo {
        self.inner.asks()
    }

    async fn transaction(&self, f: &mut TxFn<'_>) -> market_storage::Result<()> {
        self.inner.transaction(f).await
    }

    async fn raw_keys(&self, table: Table) -> market_storage::Result<Vec<String>> {
        self.inner.raw_keys(table).await
    }

    async fn flush(&self) -> market_storage::Result<()> {
        self.inner.flush().await
    }
}

struct Harness {
    chain: Arc<MockChain>,
    wallet: Arc<MockWallet>,
    repo: Arc<dyn Repo>,
    paych: PaychManager,
}

fn harness(repo: Arc<dyn Repo>) -> Harness {
    let chain = Arc::new(MockChain::new());
    let wallet = Arc::new(MockWallet::new());
    let paych = PaychManager::new(
        chain.clone(),
        wallet.clone(),
        repo.clone(),
        1,
        CancellationToken::new(),
    );
    Harness {
        chain,
        wallet,
        repo,
        paych,
    }
}

fn created(ch: Address) -> MessageReceipt {
    MessageReceipt::ok(
        encode_params(&PaychCreateReturn {
            id_address: Address::new_id(1234),
            robust_address: ch,
        })
        .unwrap(),
    )
}

fn amt(n: u128) -> TokenAmount {
    TokenAmount::from_atto(n)
}

async fn open_channel(h: &Harness, from: Address, to: Address, amount: u128) -> Address {
    let ch = Address::new_actor(format!("{}->{}", from, to).as_bytes());
    let (addr, mcid) = h.paych.get_paych(from, to, amt(amount)).await.unwrap();
    assert_eq!(addr, None);
    h.chain.resolve_message(mcid, created(ch));
    let ready = h
        .paych
        .wait_ready(mcid, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(ready, ch);
    ch
}

#[tokio::test]
async fn test_create_wait_first() {
    let h = harness(Arc::new(KvRepo::memory()));
    let from = h.wallet.generate();
    let to = Address::new_id(2);
    let ch = Address::new_actor(b"wait-first");

    let (_, mcid) = h.paych.get_paych(from, to, amt(100)).await.unwrap();
    let (_, msg) = h.chain.last_pushed().unwrap();
    assert_eq!(msg.method, Method::PaychCreate);
    assert_eq!(msg.value, amt(100));

    let waiter = {
        let paych = h.paych.clone();
        tokio::spawn(async move { paych.wait_ready(mcid, &CancellationToken::new()).await })
    };
    while h.paych.listeners().pending() == 0 {
        tokio::task::yield_now().await;
    }
    h.chain.resolve_message(mcid, created(ch));
    assert_eq!(waiter.await.unwrap().unwrap(), ch);

    let funds = h.paych.available_funds(&ch).await.unwrap();
    assert_eq!(funds.confirmed_amt, amt(100));
    assert_eq!(funds.pending_amt, TokenAmount::ZERO);
    assert_eq!(funds.spendable_amt, amt(100));
}

#[tokio::test]
async fn test_create_result_first() {
    let h = harness(Arc::new(KvRepo::memory()));
    let from = h.wallet.generate();
    let ch = open_channel(&h, from, Address::new_id(2), 50).await;

    // a later wait on a settled message returns from the persisted record
    let mcid = h.chain.pushed_messages()[0].0;
    assert_eq!(
        h.paych.wait_ready(mcid, &CancellationToken::new()).await.unwrap(),
        ch
    );
}

#[tokio::test]
async fn test_add_funds_to_existing_channel() {
    let h = harness(Arc::new(SqliteRepo::open_in_memory().unwrap()));
    let from = h.wallet.generate();
    let to = Address::new_id(2);
    let ch = open_channel(&h, from, to, 100).await;

    let (addr, mcid) = h.paych.get_paych(from, to, amt(40)).await.unwrap();
    assert_eq!(addr, Some(ch));
    let (_, msg) = h.chain.last_pushed().unwrap();
    assert_eq!(msg.to, ch);
    assert_eq!(h.paych.available_funds(&ch).await.unwrap().pending_amt, amt(40));

    // a second top-up while one is in flight is refused
    assert!(matches!(
        h.paych.get_paych(from, to, amt(1)).await,
        Err(PaychError::NotReady(_))
    ));

    h.chain.resolve_message(mcid, MessageReceipt::ok(Vec::new()));
    h.paych.wait_ready(mcid, &CancellationToken::new()).await.unwrap();
    let funds = h.paych.available_funds(&ch).await.unwrap();
    assert_eq!(funds.confirmed_amt, amt(140));
    assert_eq!(funds.pending_amt, TokenAmount::ZERO);
}

#[tokio::test]
async fn test_failed_create_removes_channel() {
    let h = harness(Arc::new(KvRepo::memory()));
    let from = h.wallet.generate();
    let to = Address::new_id(2);
    let (_, mcid) = h.paych.get_paych(from, to, amt(10)).await.unwrap();
    h.chain.resolve_message(
        mcid,
        MessageReceipt {
            exit_code: 16,
            return_data: Vec::new(),
            gas_used: 0,
        },
    );
    let err = h
        .paych
        .wait_ready(mcid, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PaychError::MessageFailed { .. }));
    assert!(h
        .repo
        .paych()
        .outbound_active_by_from_to(&from, &to)
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn test_unknown_wallet_key_is_refused() {
    let h = harness(Arc::new(KvRepo::memory()));
    assert!(matches!(
        h.paych.get_paych(Address::new_id(1), Address::new_id(2), amt(1)).await,
        Err(PaychError::NoKey(_))
    ));
}

#[tokio::test]
async fn test_wait_is_cancellable() {
    let h = harness(Arc::new(KvRepo::memory()));
    let from = h.wallet.generate();
    let (_, mcid) = h.paych.get_paych(from, Address::new_id(2), amt(10)).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        h.paych.wait_ready(mcid, &cancel).await,
        Err(PaychError::Cancelled)
    ));

    let waiter = {
        let paych = h.paych.clone();
        tokio::spawn(async move { paych.wait_ready(mcid, &CancellationToken::new()).await })
    };
    while h.paych.listeners().pending() == 0 {
        tokio::task::yield_now().await;
    }
    h.paych.shutdown();
    assert!(matches!(waiter.await.unwrap(), Err(PaychError::Cancelled)));
}

#[tokio::test]
async fn test_outbound_vouchers_are_monotonic_and_funded() {
    let h = harness(Arc::new(KvRepo::memory()));
    let from = h.wallet.generate();
    let ch = open_channel(&h, from, Address::new_id(2), 100).await;

    assert_eq!(h.paych.allocate_lane(&ch).await.unwrap(), 0);
    assert_eq!(h.paych.allocate_lane(&ch).await.unwrap(), 1);

    let v1 = h.paych.create_voucher(&ch, 0, amt(30)).await.unwrap();
    assert_eq!(v1.nonce, 1);
    v1.signature
        .as_ref()
        .unwrap()
        .verify(&from, &v1.signing_bytes().unwrap())
        .unwrap();

    assert!(matches!(
        h.paych.create_voucher(&ch, 0, amt(20)).await,
        Err(PaychError::InvalidVoucher(_))
    ));
    assert!(matches!(
        h.paych.create_voucher(&ch, 1, amt(80)).await,
        Err(PaychError::InsufficientFunds { .. })
    ));
    assert_eq!(h.paych.list_vouchers(&ch).await.unwrap().len(), 1);

    let v2 = h.paych.create_voucher(&ch, 1, amt(70)).await.unwrap();
    assert_eq!(v2.lane, 1);
    let funds = h.paych.available_funds(&ch).await.unwrap();
    assert_eq!(funds.redeemed_amt, amt(100));
    assert_eq!(funds.spendable_amt, TokenAmount::ZERO);
}

#[tokio::test]
async fn test_inbound_vouchers() {
    let h = harness(Arc::new(KvRepo::memory()));
    let payer = KeyPair::from_seed([9; 32]);
    let me = h.wallet.generate();
    let ch = Address::new_actor(b"inbound");
    h.paych
        .track_inbound_channel(ch, payer.address(), me, amt(100))
        .await
        .unwrap();

    let sign = |lane: u64, nonce: u64, amount: u128| {
        let mut sv = SignedVoucher::new(ch, lane, nonce, amt(amount));
        sv.signature = Some(payer.sign(&sv.signing_bytes().unwrap()));
        sv
    };

    let first = sign(0, 1, 40);
    h.paych.check_voucher_valid(&ch, &first).await.unwrap();
    assert_eq!(h.paych.add_voucher_inbound(&ch, &first, amt(40)).await.unwrap(), amt(40));
    assert_eq!(h.paych.add_voucher_inbound(&ch, &first, amt(40)).await.unwrap(), TokenAmount::ZERO);

    assert!(matches!(
        h.paych.add_voucher_inbound(&ch, &sign(0, 2, 50), amt(20)).await,
        Err(PaychError::InvalidVoucher(_))
    ));
    assert!(matches!(
        h.paych.add_voucher_inbound(&ch, &sign(0, 1, 60), TokenAmount::ZERO).await,
        Err(PaychError::InvalidVoucher(_))
    ));
    assert_eq!(
        h.paych.add_voucher_inbound(&ch, &sign(0, 2, 100), amt(20)).await.unwrap(),
        amt(60)
    );
    assert!(matches!(
        h.paych.add_voucher_inbound(&ch, &sign(1, 1, 1), TokenAmount::ZERO).await,
        Err(PaychError::InsufficientFunds { .. })
    ));

    let mut forged = sign(0, 3, 100);
    forged.amount = amt(100);
    forged.nonce = 4;
    assert!(matches!(
        h.paych.check_voucher_valid(&ch, &forged).await,
        Err(PaychError::InvalidVoucher(_))
    ));
    assert_eq!(h.paych.list_vouchers(&ch).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_store_failure_still_wakes_waiters() {
    let store = Arc::new(BrokenMsgStore::new());
    let h = harness(store.clone());
    let from = h.wallet.generate();
    let (_, mcid) = h.paych.get_paych(from, Address::new_id(2), amt(10)).await.unwrap();

    let waiter = {
        let paych = h.paych.clone();
        tokio::spawn(async move { paych.wait_ready(mcid, &CancellationToken::new()).await })
    };
    while h.paych.listeners().pending() == 0 {
        tokio::task::yield_now().await;
    }
    store.fail_msg_saves.store(true, Ordering::SeqCst);
    h.chain.resolve_message(mcid, created(Address::new_actor(b"unrecorded")));

    let err = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("waiter left hanging")
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PaychError::MessageFailed { reason, .. } if reason.contains("disk full")));
    assert_eq!(h.paych.listeners().pending(), 0);

    // a caller arriving after the failed delivery gets the same answer
    let late = tokio::time::timeout(
        Duration::from_secs(5),
        h.paych.wait_ready(mcid, &CancellationToken::new()),
    )
    .await
    .unwrap();
    assert!(matches!(late, Err(PaychError::MessageFailed { .. })));
}

#[tokio::test]
async fn test_restart_resumes_in_flight_messages() {
    let repo: Arc<dyn Repo> = Arc::new(SqliteRepo::open_in_memory().unwrap());
    let chain = Arc::new(MockChain::new());
    let wallet = Arc::new(MockWallet::new());
    let from = wallet.generate();
    let to = Address::new_id(2);
    let ch = Address::new_actor(b"restarted");

    let first_run = CancellationToken::new();
    let before = PaychManager::new(chain.clone(), wallet.clone(), repo.clone(), 1, first_run.clone());
    let (_, mcid) = before.get_paych(from, to, amt(25)).await.unwrap();
    while chain.pending_waits(&mcid) == 0 {
        tokio::task::yield_now().await;
    }
    before.shutdown();
    while chain.pending_waits(&mcid) > 0 {
        tokio::task::yield_now().await;
    }

    // the message lands while nobody is watching
    chain.resolve_message(mcid, created(ch));

    let after = PaychManager::new(chain, wallet, repo.clone(), 1, CancellationToken::new());
    assert_eq!(after.restart_pending().await.unwrap(), 1);
    let ready = tokio::time::timeout(
        Duration::from_secs(5),
        after.wait_ready(mcid, &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(ready, ch);
    assert_eq!(after.available_funds(&ch).await.unwrap().confirmed_amt, amt(25));

    // nothing left to resume
    assert_eq!(after.restart_pending().await.unwrap(), 0);
}

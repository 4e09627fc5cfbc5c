use crate::error::{PaychError, Result};
use market_chain::ChainApi;
use market_storage::Repo;
use market_types::message::{actors, encode_params};
use market_types::{Address, Cid, FundedAddressState, Message, Method, TokenAmount};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Reserves market escrow for deals. Reservations are keyed by the address
/// whose escrow backs them and are persisted, so they survive a restart.
pub struct FundManager {
    chain: Arc<dyn ChainApi>,
    repo: Arc<dyn Repo>,
    max_fee: Option<TokenAmount>,
    lock: Mutex<()>,
}

impl FundManager {
    pub fn new(chain: Arc<dyn ChainApi>, repo: Arc<dyn Repo>, max_fee: Option<TokenAmount>) -> Self {
        Self {
            chain,
            repo,
            max_fee,
            lock: Mutex::new(()),
        }
    }

    async fn load(&self, addr: &Address) -> Result<FundedAddressState> {
        match self.repo.funds().get_fund_state(addr).await {
            Ok(state) => Ok(state),
            Err(e) if e.is_not_found() => Ok(FundedAddressState::new(*addr)),
            Err(e) => Err(e.into()),
        }
    }

    /// Escrow at the head that is neither locked by the market nor reserved here.
    pub async fn available(&self, addr: &Address) -> Result<TokenAmount> {
        let _guard = self.lock.lock().await;
        let state = self.load(addr).await?;
        Ok(self.confirmed(addr).await?.saturating_sub(state.amt_reserved))
    }

    pub async fn reserved(&self, addr: &Address) -> Result<TokenAmount> {
        Ok(self.load(addr).await?.amt_reserved)
    }

    async fn confirmed(&self, addr: &Address) -> Result<TokenAmount> {
        let head = self.chain.chain_head().await?;
        let balance = self.chain.state_market_balance(addr, &head.key).await?;
        Ok(balance.available())
    }

    /// Reserve `amount` of `addr`'s escrow on behalf of `wallet`. Fails without
    /// touching the reservation when the free balance is too small.
    pub async fn reserve_funds(
        &self,
        wallet: Address,
        addr: Address,
        amount: TokenAmount,
    ) -> Result<TokenAmount> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(&addr).await?;
        let available = self.confirmed(&addr).await?.saturating_sub(state.amt_reserved);
        if amount > available {
            warn!(addr = %addr, required = %amount, available = %available, "insufficient funds for reservation");
            return Err(PaychError::InsufficientFunds {
                required: amount,
                available,
            });
        }

        state.amt_reserved = state.amt_reserved.saturating_add(amount);
        state.wallet = Some(wallet);
        self.repo.funds().save_fund_state(&state).await?;
        info!(
            addr = %addr,
            wallet = %wallet,
            amount = %amount,
            reserved = %state.amt_reserved,
            "💰 Funds reserved"
        );
        Ok(state.amt_reserved)
    }

    /// Give back part of a reservation. The counter never drops below zero.
    pub async fn release_funds(&self, addr: Address, amount: TokenAmount) -> Result<TokenAmount> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(&addr).await?;
        if amount > state.amt_reserved {
            warn!(addr = %addr, amount = %amount, reserved = %state.amt_reserved, "releasing more than reserved");
        }
        state.amt_reserved = state.amt_reserved.saturating_sub(amount);
        self.repo.funds().save_fund_state(&state).await?;
        info!(addr = %addr, amount = %amount, reserved = %state.amt_reserved, "💸 Funds released");
        Ok(state.amt_reserved)
    }

    /// Push an AddBalance message moving `amount` from `wallet` into `addr`'s escrow.
    pub async fn add_funds(&self, wallet: Address, addr: Address, amount: TokenAmount) -> Result<Cid> {
        let _guard = self.lock.lock().await;
        let msg = Message::new(
            wallet,
            actors::MARKET_ACTOR,
            amount,
            Method::AddBalance,
            encode_params(&addr)?,
        );
        let cid = self.chain.mpool_push_message(msg, self.max_fee).await?;

        let mut state = self.load(&addr).await?;
        state.wallet = Some(wallet);
        state.msg_cid = Some(cid);
        self.repo.funds().save_fund_state(&state).await?;
        debug!(addr = %addr, wallet = %wallet, amount = %amount, msg = %cid, "pushed add balance message");
        Ok(cid)
    }
}

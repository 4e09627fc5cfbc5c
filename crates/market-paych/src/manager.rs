use crate::error::{PaychError, Result};
use crate::listeners::{MsgListeners, MsgOutcome};
use market_chain::{ChainApi, WalletApi};
use market_storage::Repo;
use market_types::message::{actors, decode_params, encode_params};
use market_types::{
    Address, ChannelDirection, ChannelInfo, Cid, Message, Method, MsgInfo, MsgLookup,
    PaychCreateParams, PaychCreateReturn, SignedVoucher, TipSetKey, TokenAmount, VoucherInfo,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Funds of one channel as seen locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAvailableFunds {
    pub channel: Option<Address>,
    pub from: Address,
    pub to: Address,
    /// Amount confirmed on chain.
    pub confirmed_amt: TokenAmount,
    /// Amount in a create or add-funds message not yet executed.
    pub pending_amt: TokenAmount,
    /// Amount already promised in vouchers.
    pub redeemed_amt: TokenAmount,
    pub spendable_amt: TokenAmount,
}

/// Payment channel ledger: creation and funding through chain messages,
/// lanes, and vouchers. Every channel is guarded by its own lock, looked up
/// under a directory lock.
#[derive(Clone)]
pub struct PaychManager {
    chain: Arc<dyn ChainApi>,
    wallet: Arc<dyn WalletApi>,
    repo: Arc<dyn Repo>,
    listeners: Arc<MsgListeners>,
    locks: Arc<Mutex<HashMap<(Address, Address), Arc<Mutex<()>>>>>,
    confidence: u64,
    cancel: CancellationToken,
}

impl PaychManager {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        wallet: Arc<dyn WalletApi>,
        repo: Arc<dyn Repo>,
        confidence: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            chain,
            wallet,
            repo,
            listeners: Arc::new(MsgListeners::new()),
            locks: Arc::new(Mutex::new(HashMap::new())),
            confidence,
            cancel,
        }
    }

    pub fn listeners(&self) -> &Arc<MsgListeners> {
        &self.listeners
    }

    async fn channel_lock(&self, from: Address, to: Address) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry((from, to))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn channel_by_address(&self, ch: &Address) -> Result<ChannelInfo> {
        Ok(self.repo.paych().get_channel_by_address(ch).await?)
    }

    /// Get a channel from `from` to `to` holding at least `amount` more.
    /// Creates the channel when none exists, otherwise adds funds to it.
    /// Returns the channel address when already known and the message cid.
    pub async fn get_paych(
        &self,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<(Option<Address>, Cid)> {
        if !self.wallet.wallet_has(&from).await? {
            return Err(PaychError::NoKey(from));
        }
        let _guard = self.channel_lock(from, to).await;

        let existing = match self.repo.paych().outbound_active_by_from_to(&from, &to).await {
            Ok(ci) => Some(ci),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };

        match existing {
            None => self.create_channel(from, to, amount).await,
            Some(ci) => self.add_funds(ci, amount).await,
        }
    }

    async fn create_channel(
        &self,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<(Option<Address>, Cid)> {
        let params = encode_params(&PaychCreateParams { from, to })?;
        let msg = Message::new(from, actors::INIT_ACTOR, amount, Method::PaychCreate, params);
        let mcid = self.chain.mpool_push_message(msg, None).await?;

        let mut ci = ChannelInfo::new_outbound(mcid.to_string(), from, to);
        ci.pending_amount = amount;
        ci.create_msg = Some(mcid);
        self.repo.paych().save_channel_info(&ci).await?;
        self.save_pending_msg(&ci, mcid).await?;
        info!(from = %from, to = %to, amount = %amount, msg = %mcid, "🔗 Creating payment channel");

        self.spawn_settle(mcid);
        Ok((None, mcid))
    }

    async fn add_funds(&self, mut ci: ChannelInfo, amount: TokenAmount) -> Result<(Option<Address>, Cid)> {
        let ch = match ci.channel {
            Some(ch) => ch,
            None => {
                return Err(PaychError::NotReady(format!(
                    "channel {} is still being created",
                    ci.channel_id
                )))
            }
        };
        if let Some(pending) = ci.add_funds_msg {
            return Err(PaychError::NotReady(format!(
                "channel {} already has add funds message {} in flight",
                ch, pending
            )));
        }

        let msg = Message::new(ci.from(), ch, amount, Method::Send, Vec::new());
        let mcid = self.chain.mpool_push_message(msg, None).await?;
        ci.pending_amount = amount;
        ci.add_funds_msg = Some(mcid);
        self.repo.paych().save_channel_info(&ci).await?;
        self.save_pending_msg(&ci, mcid).await?;
        info!(channel = %ch, amount = %amount, msg = %mcid, "🔗 Adding funds to payment channel");

        self.spawn_settle(mcid);
        Ok((Some(ch), mcid))
    }

    async fn save_pending_msg(&self, ci: &ChannelInfo, mcid: Cid) -> Result<()> {
        let info = MsgInfo {
            channel_id: ci.channel_id.clone(),
            msg_cid: mcid,
            received: false,
            err: String::new(),
        };
        Ok(self.repo.paych().save_msg_info(&info).await?)
    }

    fn spawn_settle(&self, mcid: Cid) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {
                    debug!(msg = %mcid, "stopped waiting for channel message");
                }
                outcome = this.settle_message(mcid) => {
                    if let Err(e) = outcome {
                        warn!(msg = %mcid, error = %e, "failed to settle channel message");
                    }
                }
            }
        });
    }

    /// Wait for `mcid` on chain, fold its result into the channel and wake
    /// whoever waits on it. Waiters are woken even when recording fails.
    async fn settle_message(&self, mcid: Cid) -> Result<()> {
        let lookup = self.chain.state_wait_msg(&mcid, self.confidence).await;
        match self.record_message_result(mcid, lookup).await {
            Ok(outcome) => {
                self.listeners.deliver(mcid, outcome);
                Ok(())
            }
            Err(e) => {
                self.listeners
                    .deliver(mcid, Err(format!("recording message result: {}", e)));
                Err(e)
            }
        }
    }

    async fn record_message_result(
        &self,
        mcid: Cid,
        lookup: market_chain::Result<MsgLookup>,
    ) -> Result<MsgOutcome> {
        let mut info = self.repo.paych().get_msg_info(&mcid).await?;
        let mut ci = self.repo.paych().get_channel_info(&info.channel_id).await?;
        let _guard = self.channel_lock(ci.from(), ci.to()).await;
        // re-read under the channel lock
        ci = self.repo.paych().get_channel_info(&info.channel_id).await?;

        let outcome: MsgOutcome = match lookup {
            Err(e) => Err(e.to_string()),
            Ok(lookup) if !lookup.receipt.is_success() => {
                Err(format!("exit code {}", lookup.receipt.exit_code))
            }
            Ok(lookup) => {
                if ci.create_msg == Some(mcid) {
                    decode_params::<PaychCreateReturn>(&lookup.receipt.return_data)
                        .map(|ret| ci.channel = Some(ret.robust_address))
                        .map_err(|e| e.to_string())
                } else {
                    Ok(())
                }
            }
        };

        let is_create = ci.create_msg == Some(mcid);
        match &outcome {
            Ok(()) => {
                ci.amount = ci.amount.saturating_add(ci.pending_amount);
                info!(channel_id = %ci.channel_id, amount = %ci.amount, "🔗 Payment channel funded");
            }
            Err(reason) => {
                warn!(channel_id = %ci.channel_id, msg = %mcid, reason = %reason, "payment channel message failed");
            }
        }
        ci.pending_amount = TokenAmount::ZERO;
        if is_create {
            ci.create_msg = None;
        } else {
            ci.add_funds_msg = None;
        }

        if is_create && outcome.is_err() {
            self.repo.paych().remove_channel(&ci.channel_id).await?;
        } else {
            self.repo.paych().save_channel_info(&ci).await?;
        }

        info.received = true;
        info.err = outcome.clone().err().unwrap_or_default();
        self.repo.paych().save_msg_info(&info).await?;
        Ok(outcome)
    }

    /// Resume waiting on create and add-funds messages a previous run left
    /// in flight. Returns how many were resumed.
    pub async fn restart_pending(&self) -> Result<usize> {
        let scan = self.repo.paych().list_channels().await?;
        for failure in &scan.failures {
            warn!(key = %failure.key, reason = %failure.reason, "skipping undecodable channel record");
        }

        let mut resumed = 0;
        for ci in scan.items {
            for mcid in [ci.create_msg, ci.add_funds_msg].into_iter().flatten() {
                match self.repo.paych().get_msg_info(&mcid).await {
                    Ok(info) if info.received => continue,
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => self.save_pending_msg(&ci, mcid).await?,
                    Err(e) => return Err(e.into()),
                }
                debug!(channel_id = %ci.channel_id, msg = %mcid, "resuming wait for channel message");
                self.spawn_settle(mcid);
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!(resumed, "🔗 Resumed pending payment channel messages");
        }
        Ok(resumed)
    }

    /// Wait until the create or add-funds message `mcid` has executed and
    /// return the channel address.
    pub async fn wait_ready(&self, mcid: Cid, cancel: &CancellationToken) -> Result<Address> {
        let info = self.repo.paych().get_msg_info(&mcid).await?;
        if info.received {
            if !info.err.is_empty() {
                return Err(PaychError::MessageFailed {
                    cid: mcid,
                    reason: info.err,
                });
            }
        } else {
            self.listeners.wait(mcid, cancel).await?;
        }

        let ci = self.repo.paych().get_channel_info(&info.channel_id).await?;
        ci.channel
            .ok_or_else(|| PaychError::NotReady(format!("channel {} has no address", ci.channel_id)))
    }

    /// Start tracking a channel someone else opened towards us.
    pub async fn track_inbound_channel(
        &self,
        ch: Address,
        from: Address,
        to: Address,
        amount: TokenAmount,
    ) -> Result<ChannelInfo> {
        let _guard = self.channel_lock(from, to).await;
        match self.channel_by_address(&ch).await {
            Ok(ci) => return Ok(ci),
            Err(PaychError::Store(e)) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let mut ci = ChannelInfo::new_inbound(ch.to_string(), ch, from, to);
        ci.amount = amount;
        self.repo.paych().save_channel_info(&ci).await?;
        info!(channel = %ch, from = %from, to = %to, "🔗 Tracking inbound payment channel");
        Ok(ci)
    }

    pub async fn allocate_lane(&self, ch: &Address) -> Result<u64> {
        let ci = self.channel_by_address(ch).await?;
        let _guard = self.channel_lock(ci.from(), ci.to()).await;
        let mut ci = self.channel_by_address(ch).await?;
        let lane = ci.next_lane;
        ci.next_lane += 1;
        self.repo.paych().save_channel_info(&ci).await?;
        debug!(channel = %ch, lane, "allocated lane");
        Ok(lane)
    }

    pub async fn list_vouchers(&self, ch: &Address) -> Result<Vec<VoucherInfo>> {
        Ok(self.channel_by_address(ch).await?.vouchers)
    }

    pub async fn available_funds(&self, ch: &Address) -> Result<ChannelAvailableFunds> {
        let ci = self.channel_by_address(ch).await?;
        let redeemed = ci.redeemed_total();
        Ok(ChannelAvailableFunds {
            channel: ci.channel,
            from: ci.from(),
            to: ci.to(),
            confirmed_amt: ci.amount,
            pending_amt: ci.pending_amount,
            redeemed_amt: redeemed,
            spendable_amt: ci.amount.saturating_sub(redeemed),
        })
    }

    /// Sign a voucher for a cumulative `amount` on `lane`.
    pub async fn create_voucher(&self, ch: &Address, lane: u64, amount: TokenAmount) -> Result<SignedVoucher> {
        let ci = self.channel_by_address(ch).await?;
        let _guard = self.channel_lock(ci.from(), ci.to()).await;
        let mut ci = self.channel_by_address(ch).await?;
        if ci.direction != ChannelDirection::Outbound {
            return Err(PaychError::WrongDirection(format!(
                "cannot create vouchers on inbound channel {}",
                ch
            )));
        }

        let lane_state = ci.lane_state(lane);
        if amount < lane_state.redeemed {
            return Err(PaychError::InvalidVoucher(format!(
                "amount {} is below {} already promised on lane {}",
                amount, lane_state.redeemed, lane
            )));
        }
        let others = ci.redeemed_total().saturating_sub(lane_state.redeemed);
        let available = ci.amount.saturating_sub(others).saturating_sub(lane_state.redeemed);
        let required = amount.saturating_sub(lane_state.redeemed);
        if required > available {
            return Err(PaychError::InsufficientFunds { required, available });
        }

        let mut voucher = SignedVoucher::new(*ch, lane, lane_state.nonce + 1, amount);
        let sig = self
            .wallet
            .wallet_sign(&ci.from(), &voucher.signing_bytes()?)
            .await?;
        voucher.signature = Some(sig);

        ci.vouchers.push(VoucherInfo {
            voucher: voucher.clone(),
            proof: Vec::new(),
            submitted: false,
        });
        if lane >= ci.next_lane {
            ci.next_lane = lane + 1;
        }
        self.repo.paych().save_channel_info(&ci).await?;
        info!(channel = %ch, lane, nonce = voucher.nonce, amount = %amount, "🎫 Voucher created");
        Ok(voucher)
    }

    async fn check_voucher(&self, ci: &ChannelInfo, sv: &SignedVoucher) -> Result<()> {
        if ci.channel != Some(sv.channel_addr) {
            return Err(PaychError::InvalidVoucher(format!(
                "voucher is for channel {}, not {}",
                sv.channel_addr, ci.channel_id
            )));
        }
        let sig = sv
            .signature
            .as_ref()
            .ok_or_else(|| PaychError::InvalidVoucher("voucher is not signed".to_string()))?;
        let signer = self
            .chain
            .state_account_key(&ci.from(), &TipSetKey::default())
            .await?;
        sig.verify(&signer, &sv.signing_bytes()?)
            .map_err(|e| PaychError::InvalidVoucher(e.to_string()))?;

        let lane_state = ci.lane_state(sv.lane);
        if lane_state.nonce > 0 && sv.nonce <= lane_state.nonce {
            return Err(PaychError::InvalidVoucher(format!(
                "nonce {} is not above {} on lane {}",
                sv.nonce, lane_state.nonce, sv.lane
            )));
        }
        if sv.amount < lane_state.redeemed {
            return Err(PaychError::InvalidVoucher(format!(
                "amount {} is below {} already redeemed on lane {}",
                sv.amount, lane_state.redeemed, sv.lane
            )));
        }
        let total = ci
            .redeemed_total()
            .saturating_sub(lane_state.redeemed)
            .saturating_add(sv.amount);
        if total > ci.amount {
            return Err(PaychError::InsufficientFunds {
                required: total,
                available: ci.amount,
            });
        }
        Ok(())
    }

    /// Validate `sv` against the recorded lane state without storing it.
    pub async fn check_voucher_valid(&self, ch: &Address, sv: &SignedVoucher) -> Result<()> {
        let ci = self.channel_by_address(ch).await?;
        self.check_voucher(&ci, sv).await
    }

    /// Accept a voucher on an inbound channel, returning how much it adds to
    /// its lane. A voucher already stored adds nothing.
    pub async fn add_voucher_inbound(
        &self,
        ch: &Address,
        sv: &SignedVoucher,
        min_delta: TokenAmount,
    ) -> Result<TokenAmount> {
        let ci = self.channel_by_address(ch).await?;
        let _guard = self.channel_lock(ci.from(), ci.to()).await;
        let mut ci = self.channel_by_address(ch).await?;
        if ci.direction != ChannelDirection::Inbound {
            return Err(PaychError::WrongDirection(format!(
                "channel {} is not inbound",
                ch
            )));
        }
        if ci.has_voucher(sv) {
            debug!(channel = %ch, lane = sv.lane, nonce = sv.nonce, "voucher already stored");
            return Ok(TokenAmount::ZERO);
        }

        self.check_voucher(&ci, sv).await?;
        let delta = sv.amount.saturating_sub(ci.lane_state(sv.lane).redeemed);
        if delta < min_delta {
            return Err(PaychError::InvalidVoucher(format!(
                "voucher adds {}, expected at least {}",
                delta, min_delta
            )));
        }

        ci.vouchers.push(VoucherInfo {
            voucher: sv.clone(),
            proof: Vec::new(),
            submitted: false,
        });
        if sv.lane >= ci.next_lane {
            ci.next_lane = sv.lane + 1;
        }
        self.repo.paych().save_channel_info(&ci).await?;
        info!(channel = %ch, lane = sv.lane, delta = %delta, "🎫 Voucher received");
        Ok(delta)
    }

    /// Release waiters and stop background message tracking.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.listeners.shutdown();
    }
}

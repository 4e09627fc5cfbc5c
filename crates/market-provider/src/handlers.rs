//! Reactions to data-transfer and retrieval events.
//!
//! Every handler reads the persisted record, applies one transition and
//! saves it before returning. A failed save leaves the record at its prior
//! persisted status and is returned to the caller.

use crate::error::{ProviderError, Result};
use async_trait::async_trait;
use market_chain::{ChainError, TransferApi};
use market_storage::Repo;
use market_types::{
    ChannelId, Cid, MinerDeal, ProviderDealState, RetrievalDealId, RetrievalDealStatus,
    StorageDealStatus,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The storage deal pipeline that continues once data has arrived.
#[async_trait]
pub trait DealProcess: Send + Sync {
    /// Verify the received data and carry the deal on towards publishing.
    async fn handle_off(&self, deal: MinerDeal);

    /// Clean up after a deal that failed with `reason`.
    async fn handle_error(&self, deal: MinerDeal, reason: String);
}

pub struct StorageTransferHandler {
    repo: Arc<dyn Repo>,
    process: Arc<dyn DealProcess>,
}

impl StorageTransferHandler {
    pub fn new(repo: Arc<dyn Repo>, process: Arc<dyn DealProcess>) -> Self {
        Self { repo, process }
    }

    /// Move the deal to `next` and save it. Also reports whether the status
    /// changed; a repeated event re-saves the deal at the status it already has.
    async fn transition(
        &self,
        proposal_cid: &Cid,
        next: StorageDealStatus,
        update: impl FnOnce(&mut MinerDeal),
    ) -> Result<(MinerDeal, bool)> {
        let mut deal = self.repo.storage_deals().get_deal(proposal_cid).await?;
        let from = deal.state;
        if !from.can_transition_to(&next) {
            warn!(proposal = %proposal_cid, from = ?from, to = ?next, "refusing deal transition");
            return Err(ProviderError::invalid_transition(from, next));
        }
        deal.state = next;
        update(&mut deal);
        deal.touch();
        self.repo.storage_deals().save_deal(&deal).await?;
        debug!(proposal = %proposal_cid, from = ?from, to = ?next, "deal status updated");
        Ok((deal, from != next))
    }

    /// All data arrived; verification continues in the background.
    pub async fn on_transfer_completed(&self, proposal_cid: &Cid) -> Result<()> {
        let (deal, changed) = self
            .transition(proposal_cid, StorageDealStatus::VerifyData, |_| {})
            .await?;
        if !changed {
            debug!(proposal = %proposal_cid, "ignoring repeated transfer completion");
            return Ok(());
        }
        info!(proposal = %proposal_cid, "📥 Data transfer completed");
        let process = self.process.clone();
        tokio::spawn(async move { process.handle_off(deal).await });
        Ok(())
    }

    pub async fn on_transfer_cancelled(&self, proposal_cid: &Cid) -> Result<()> {
        let reason = format!("proposal {} data transfer cancelled", proposal_cid);
        let (deal, changed) = self
            .transition(proposal_cid, StorageDealStatus::Error, |d| d.message = reason.clone())
            .await?;
        if !changed {
            debug!(proposal = %proposal_cid, "ignoring repeated transfer cancellation");
            return Ok(());
        }
        error!(proposal = %proposal_cid, "Data transfer cancelled");
        self.process.handle_error(deal, reason).await;
        Ok(())
    }

    pub async fn on_transfer_initiated(&self, proposal_cid: &Cid, channel: ChannelId) -> Result<()> {
        self.transition(proposal_cid, StorageDealStatus::Transferring, |d| {
            d.message.clear();
            d.transfer_channel_id = Some(channel);
        })
        .await?;
        Ok(())
    }

    pub async fn on_transfer_restarted(&self, proposal_cid: &Cid, channel: ChannelId) -> Result<()> {
        self.transition(proposal_cid, StorageDealStatus::ProviderTransferAwaitRestart, |d| {
            d.message.clear();
            d.transfer_channel_id = Some(channel);
        })
        .await?;
        info!(proposal = %proposal_cid, "🔁 Data transfer restarted");
        Ok(())
    }

    pub async fn on_transfer_stalled(&self, proposal_cid: &Cid) -> Result<()> {
        self.transition(proposal_cid, StorageDealStatus::ProviderTransferAwaitRestart, |d| {
            d.message = "data transfer appears to be stalled, awaiting reconnect from client".to_string();
        })
        .await?;
        warn!(proposal = %proposal_cid, "Data transfer stalled");
        Ok(())
    }

    /// A failed transfer can always be restarted, so the deal waits for that.
    pub async fn on_transfer_failed(&self, proposal_cid: &Cid, reason: &str) -> Result<()> {
        self.transition(proposal_cid, StorageDealStatus::ProviderTransferAwaitRestart, |d| {
            d.message = format!("error transferring data: {}", reason);
        })
        .await?;
        warn!(proposal = %proposal_cid, reason, "Data transfer failed");
        Ok(())
    }
}

/// Piece access needed to serve a retrieval.
#[async_trait]
pub trait RetrievalEnvironment: Send + Sync {
    /// Unseal `piece_cid` and open a blockstore for the deal.
    async fn prepare_blockstore(&self, deal_id: RetrievalDealId, piece_cid: &Cid) -> Result<()>;

    async fn delete_store(&self, deal_id: RetrievalDealId) -> Result<()>;
}

pub struct RetrievalDealHandler {
    repo: Arc<dyn Repo>,
    env: Arc<dyn RetrievalEnvironment>,
    transfer: Arc<dyn TransferApi>,
}

impl RetrievalDealHandler {
    pub fn new(
        repo: Arc<dyn Repo>,
        env: Arc<dyn RetrievalEnvironment>,
        transfer: Arc<dyn TransferApi>,
    ) -> Self {
        Self {
            repo,
            env,
            transfer,
        }
    }

    /// Persist `deal` moved to `next`. `deal` is only updated once the save succeeded.
    async fn save(
        &self,
        deal: &mut ProviderDealState,
        next: RetrievalDealStatus,
        message: Option<String>,
    ) -> Result<()> {
        if !deal.status.can_transition_to(&next) {
            return Err(ProviderError::invalid_transition(deal.status, next));
        }
        let mut updated = deal.clone();
        updated.status = next;
        if let Some(message) = message {
            updated.message = message;
        }
        updated.touch();
        self.repo.retrieval_deals().save_retrieval_deal(&updated).await?;
        debug!(deal_id = deal.deal_id, from = ?deal.status, to = ?next, "retrieval deal status updated");
        *deal = updated;
        Ok(())
    }

    pub async fn unseal_data(&self, deal: &mut ProviderDealState) -> Result<()> {
        self.save(deal, RetrievalDealStatus::Unsealing, None).await?;

        let prepared = match deal.params.piece_cid {
            Some(piece) => self.env.prepare_blockstore(deal.deal_id, &piece).await,
            None => Err(ProviderError::Environment("deal has no piece cid".to_string())),
        };
        if let Err(e) = prepared {
            warn!(deal_id = deal.deal_id, error = %e, "unsealing failed, cancelling deal");
            return self.cancel_deal(deal).await;
        }
        debug!(deal_id = deal.deal_id, "blockstore prepared");
        self.save(deal, RetrievalDealStatus::Unsealed, None).await?;

        if let Some(channel) = deal.channel_id.clone() {
            debug!(deal_id = deal.deal_id, channel = %channel, "resuming data transfer");
            if let Err(e) = self.transfer.restart_transfer(&channel).await {
                return self.error(deal, Some(e.into())).await;
            }
        }
        info!(deal_id = deal.deal_id, "🔓 Retrieval data unsealed");
        Ok(())
    }

    /// Release unseal resources, close the transfer and mark the deal cancelled.
    pub async fn cancel_deal(&self, deal: &mut ProviderDealState) -> Result<()> {
        if let Err(e) = self.env.delete_store(deal.deal_id).await {
            return self.error(deal, Some(e)).await;
        }
        if let Some(channel) = deal.channel_id.clone() {
            match self.transfer.close_transfer(&channel).await {
                Ok(()) | Err(ChainError::Terminated(_)) => {}
                Err(e) => return self.error(deal, Some(e.into())).await,
            }
        }
        self.save(deal, RetrievalDealStatus::Cancelled, None).await?;
        info!(deal_id = deal.deal_id, "Retrieval deal cancelled");
        Ok(())
    }

    /// Release resources of a finished deal.
    pub async fn cleanup_deal(&self, deal: &mut ProviderDealState) -> Result<()> {
        if let Err(e) = self.env.delete_store(deal.deal_id).await {
            return self.error(deal, Some(e)).await;
        }
        self.save(deal, RetrievalDealStatus::Completed, None).await?;
        info!(deal_id = deal.deal_id, sent = deal.total_sent, "✅ Retrieval deal completed");
        Ok(())
    }

    /// Mark the deal errored whatever its status, recording `err` when given.
    pub async fn error(&self, deal: &mut ProviderDealState, err: Option<ProviderError>) -> Result<()> {
        if let Some(e) = &err {
            error!(deal_id = deal.deal_id, error = %e, "Retrieval deal errored");
        }
        let message = err.map(|e| e.to_string());
        self.save(deal, RetrievalDealStatus::Errored, message).await
    }
}

use crate::config::MarketConfig;
use anyhow::{Context, Result};
use futures::future::join_all;
use market_chain::{ChainApi, Events, TransferApi, WalletApi};
use market_paych::{FundManager, PaychManager};
use market_provider::{
    DealProcess, DealTracker, ProviderNodeAdapter, RetrievalDealHandler, RetrievalEnvironment,
    StorageTransferHandler,
};
use market_storage::{BackendRegistry, Repo};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A running market node: the deal repository, the chain event dispatcher,
/// one reconciliation poller per provider, and the provider-facing adapter.
pub struct MarketNode {
    config: MarketConfig,
    repo: Arc<dyn Repo>,
    events: Events,
    funds: Arc<FundManager>,
    paych: PaychManager,
    provider: Arc<ProviderNodeAdapter>,
    transfer: Arc<dyn TransferApi>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MarketNode {
    pub async fn start(
        config: MarketConfig,
        chain: Arc<dyn ChainApi>,
        wallet: Arc<dyn WalletApi>,
        transfer: Arc<dyn TransferApi>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        info!(repo = %config.repo.dsn, providers = config.tracker.providers.len(), "🚀 Starting market node");

        let repo = BackendRegistry::with_defaults()
            .open(&config.repo.dsn)
            .with_context(|| format!("opening deal repository {}", config.repo.dsn))?;

        let events = Events::new(chain.clone());
        let mut tasks = Vec::new();
        {
            let events = events.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = events.run(cancel).await {
                    error!(error = %e, "❌ Chain event dispatcher exited");
                }
            }));
        }

        for provider in &config.tracker.providers {
            let tracker = DealTracker::new(chain.clone(), repo.clone(), vec![*provider])
                .with_period(config.poll_interval());
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { tracker.run(cancel).await }));
        }

        let funds = Arc::new(FundManager::new(
            chain.clone(),
            repo.clone(),
            config.fees.max_add_balance_fee,
        ));
        let paych = PaychManager::new(
            chain.clone(),
            wallet.clone(),
            repo.clone(),
            config.chain.message_confidence,
            cancel.child_token(),
        );
        let resumed = paych
            .restart_pending()
            .await
            .context("resuming payment channel messages")?;
        let provider = Arc::new(ProviderNodeAdapter::new(
            wallet,
            funds.clone(),
            events.clone(),
            config.provider_node_config(),
        ));

        info!(
            backend = repo.backend_name(),
            loops = tasks.len(),
            resumed_paych_msgs = resumed,
            "✅ Market node ready"
        );

        Ok(Self {
            config,
            repo,
            events,
            funds,
            paych,
            provider,
            transfer,
            cancel,
            tasks,
        })
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    pub fn repo(&self) -> &Arc<dyn Repo> {
        &self.repo
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn funds(&self) -> &Arc<FundManager> {
        &self.funds
    }

    pub fn paych(&self) -> &PaychManager {
        &self.paych
    }

    pub fn provider(&self) -> &Arc<ProviderNodeAdapter> {
        &self.provider
    }

    /// Handler for storage-side data transfer events, handing deals to `process`.
    pub fn transfer_handler(&self, process: Arc<dyn DealProcess>) -> StorageTransferHandler {
        StorageTransferHandler::new(self.repo.clone(), process)
    }

    pub fn retrieval_handler(&self, env: Arc<dyn RetrievalEnvironment>) -> RetrievalDealHandler {
        RetrievalDealHandler::new(self.repo.clone(), env, self.transfer.clone())
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down market node");
        self.cancel.cancel();
        self.paych.shutdown();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "background loop did not exit cleanly");
            }
        }
        info!("🛑 Market node stopped");
    }
}

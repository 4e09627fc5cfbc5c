//! Confidence-aware watches over chain head changes.
//!
//! A watch is checked once against the head when it is registered. After that
//! every applied tipset is compared with its predecessor. A match is held back
//! until `confidence` further tipsets have been applied on top of it, and is
//! dropped with a [`WatchEvent::Reverted`] if its tipset is reverted first.

use crate::api::ChainApi;
use crate::error::{ChainError, Result};
use async_trait::async_trait;
use market_types::{ChainEpoch, HeadChange, TipSet, TipSetKey};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timeout value for watches that never expire.
pub const NO_TIMEOUT: ChainEpoch = ChainEpoch::MAX;

/// Outcome of the one-off check run at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// The condition already holds and was handled; nothing is registered.
    Done,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchControl {
    Continue,
    Done,
}

/// What a watch is told about its condition.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<C> {
    /// The change seen at `matched_at` is now buried under enough tipsets.
    Matched {
        change: C,
        matched_at: ChainEpoch,
        confirmed: TipSet,
    },
    /// The tipset holding a not-yet-confirmed match was reverted.
    Reverted { tipset: TipSet },
    TimedOut { height: ChainEpoch },
    /// A chain query failed while evaluating the watch.
    Failed(ChainError),
}

#[async_trait]
pub trait StateWatch: Send + 'static {
    type Change: Send + 'static;

    async fn check(&mut self, head: &TipSet) -> Result<Check>;

    /// Compare the state at `prev` with the state at `next`.
    async fn matches(&mut self, prev: &TipSet, next: &TipSet) -> Result<Option<Self::Change>>;

    async fn on_event(&mut self, event: WatchEvent<Self::Change>) -> WatchControl;
}

enum Phase<C> {
    Waiting,
    Matched { change: C, at: ChainEpoch },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Live,
    Finished,
}

struct Slot<W: StateWatch> {
    watch: W,
    phase: Phase<W::Change>,
    confidence: u64,
    timeout_height: ChainEpoch,
}

impl<W: StateWatch> Slot<W> {
    async fn deliver(&mut self, event: WatchEvent<W::Change>) -> Progress {
        match self.watch.on_event(event).await {
            WatchControl::Continue => Progress::Live,
            WatchControl::Done => Progress::Finished,
        }
    }
}

#[async_trait]
trait DynWatch: Send {
    async fn apply(&mut self, prev: &TipSet, next: &TipSet) -> Progress;

    async fn revert(&mut self, tipset: &TipSet) -> Progress;
}

#[async_trait]
impl<W: StateWatch> DynWatch for Slot<W> {
    async fn apply(&mut self, prev: &TipSet, next: &TipSet) -> Progress {
        if let Phase::Waiting = self.phase {
            match self.watch.matches(prev, next).await {
                Ok(Some(change)) => {
                    self.phase = Phase::Matched {
                        change,
                        at: next.height,
                    }
                }
                Ok(None) if next.height >= self.timeout_height => {
                    return self.deliver(WatchEvent::TimedOut { height: next.height }).await;
                }
                Ok(None) => return Progress::Live,
                Err(e) => return self.deliver(WatchEvent::Failed(e)).await,
            }
        }

        let confidence = ChainEpoch::try_from(self.confidence).unwrap_or(ChainEpoch::MAX);
        let confirmed = matches!(
            self.phase,
            Phase::Matched { at, .. } if next.height >= at.saturating_add(confidence)
        );
        if !confirmed {
            return Progress::Live;
        }
        match std::mem::replace(&mut self.phase, Phase::Waiting) {
            Phase::Matched { change, at } => {
                self.deliver(WatchEvent::Matched {
                    change,
                    matched_at: at,
                    confirmed: next.clone(),
                })
                .await
            }
            Phase::Waiting => Progress::Live,
        }
    }

    async fn revert(&mut self, tipset: &TipSet) -> Progress {
        let abandoned = matches!(self.phase, Phase::Matched { at, .. } if at >= tipset.height);
        if !abandoned {
            return Progress::Live;
        }
        self.phase = Phase::Waiting;
        self.deliver(WatchEvent::Reverted {
            tipset: tipset.clone(),
        })
        .await
    }
}

struct EventsState {
    head: Option<TipSet>,
    watches: BTreeMap<u64, Box<dyn DynWatch>>,
    next_id: u64,
}

/// Dispatches head changes to every registered watch.
///
/// Watch callbacks run while the dispatcher lock is held, so they must not
/// register new watches themselves.
#[derive(Clone)]
pub struct Events {
    api: Arc<dyn ChainApi>,
    state: Arc<Mutex<EventsState>>,
}

impl Events {
    pub fn new(api: Arc<dyn ChainApi>) -> Self {
        Self {
            api,
            state: Arc::new(Mutex::new(EventsState {
                head: None,
                watches: BTreeMap::new(),
                next_id: 0,
            })),
        }
    }

    pub fn api(&self) -> &Arc<dyn ChainApi> {
        &self.api
    }

    pub async fn head(&self) -> Option<TipSet> {
        self.state.lock().await.head.clone()
    }

    pub async fn active_watches(&self) -> usize {
        self.state.lock().await.watches.len()
    }

    /// Register `watch`. It is checked against the current head first and
    /// only registered when the check is still pending. `timeout` is counted
    /// in epochs from the dispatcher's head.
    pub async fn state_changed<W: StateWatch>(
        &self,
        watch: W,
        confidence: u64,
        timeout: ChainEpoch,
    ) -> Result<()> {
        self.register(watch, confidence, move |height| height.saturating_add(timeout))
            .await
    }

    /// Like [`Events::state_changed`], with the timeout given as the height
    /// at which the watch expires.
    pub async fn state_changed_until<W: StateWatch>(
        &self,
        watch: W,
        confidence: u64,
        timeout_height: ChainEpoch,
    ) -> Result<()> {
        self.register(watch, confidence, move |_| timeout_height).await
    }

    async fn register<W: StateWatch>(
        &self,
        mut watch: W,
        confidence: u64,
        deadline: impl FnOnce(ChainEpoch) -> ChainEpoch + Send,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let head = match &state.head {
            Some(head) => head.clone(),
            None => {
                let head = self.api.chain_head().await?;
                state.head = Some(head.clone());
                head
            }
        };

        if watch.check(&head).await? == Check::Done {
            debug!(height = head.height, "chain watch satisfied at registration");
            return Ok(());
        }

        let id = state.next_id;
        state.next_id += 1;
        let timeout_height = deadline(head.height);
        state.watches.insert(
            id,
            Box::new(Slot {
                watch,
                phase: Phase::Waiting,
                confidence,
                timeout_height,
            }),
        );
        debug!(watch_id = id, height = head.height, timeout_height, confidence, "registered chain watch");
        Ok(())
    }

    /// Feed one batch of head changes to the watches.
    pub async fn process(&self, changes: Vec<HeadChange>) {
        let mut state = self.state.lock().await;
        for change in changes {
            match change {
                HeadChange::Current(ts) => state.head = Some(ts),
                HeadChange::Revert(ts) => {
                    let mut finished = Vec::new();
                    for (id, watch) in state.watches.iter_mut() {
                        if watch.revert(&ts).await == Progress::Finished {
                            finished.push(*id);
                        }
                    }
                    for id in finished {
                        state.watches.remove(&id);
                    }
                    state.head = match self
                        .api
                        .chain_get_tipset_by_height(ts.height - 1, &ts.parents)
                        .await
                    {
                        Ok(parent) => Some(parent),
                        Err(e) => {
                            // the parent key is known from the link; its own parents are not
                            warn!(height = ts.height, error = %e, "could not load parent of reverted tipset");
                            Some(TipSet::new(ts.height - 1, ts.parents.clone(), TipSetKey::default()))
                        }
                    };
                    debug!(height = ts.height, "reverted tipset");
                }
                HeadChange::Apply(ts) => {
                    let prev = state.head.clone().unwrap_or_else(|| ts.clone());
                    let mut finished = Vec::new();
                    for (id, watch) in state.watches.iter_mut() {
                        if watch.apply(&prev, &ts).await == Progress::Finished {
                            finished.push(*id);
                        }
                    }
                    for id in finished {
                        state.watches.remove(&id);
                    }
                    state.head = Some(ts);
                }
            }
        }
    }

    /// Subscribe to head changes and dispatch them until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut changes = self.api.chain_notify().await?;
        info!("⛓️ Chain event dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("⛓️ Chain event dispatcher stopped");
                    return Ok(());
                }
                batch = changes.recv() => match batch {
                    Some(batch) => self.process(batch).await,
                    None => {
                        warn!("head change subscription closed");
                        return Err(ChainError::Rpc("head change subscription closed".to_string()));
                    }
                },
            }
        }
    }
}

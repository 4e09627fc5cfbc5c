//! Rendez-vous between callers waiting on a message and the task that
//! learns its result. Either side may arrive first.

use crate::error::{PaychError, Result};
use market_types::Cid;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Result of a message as seen by waiters: `Err` carries the failure reason.
pub type MsgOutcome = std::result::Result<(), String>;

/// Outcomes kept for callers that arrive after delivery.
pub const DEFAULT_RETAINED_OUTCOMES: usize = 256;

#[derive(Default)]
struct Inner {
    waiting: HashMap<Cid, Vec<oneshot::Sender<MsgOutcome>>>,
    delivered: HashMap<Cid, MsgOutcome>,
    // delivery order, oldest first
    order: VecDeque<Cid>,
    closed: bool,
}

impl Inner {
    /// Drop senders whose receiver is gone; forget the message once none are left.
    fn prune(&mut self, mcid: &Cid) {
        if let Some(waiters) = self.waiting.get_mut(mcid) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                self.waiting.remove(mcid);
            }
        }
    }
}

pub struct MsgListeners {
    inner: Mutex<Inner>,
    retain: usize,
}

impl Default for MsgListeners {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETAINED_OUTCOMES)
    }
}

/// A registered waiter. Dropping it, on any path, removes its sender.
struct Registration<'a> {
    listeners: &'a MsgListeners,
    mcid: Cid,
    rx: oneshot::Receiver<MsgOutcome>,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.rx.close();
        self.listeners.inner().prune(&self.mcid);
    }
}

fn into_result(mcid: Cid, outcome: MsgOutcome) -> Result<()> {
    outcome.map_err(|reason| PaychError::MessageFailed { cid: mcid, reason })
}

impl MsgListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retain` delivered outcomes; older ones are evicted first.
    pub fn with_retention(retain: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retain,
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for the outcome of `mcid`. Returns at once if it was delivered
    /// recently, and `Cancelled` if `cancel` fires or the listeners shut down.
    pub async fn wait(&self, mcid: Cid, cancel: &CancellationToken) -> Result<()> {
        let mut registration = {
            let mut inner = self.inner();
            if inner.closed {
                return Err(PaychError::Cancelled);
            }
            if let Some(outcome) = inner.delivered.get(&mcid) {
                return into_result(mcid, outcome.clone());
            }
            let (tx, rx) = oneshot::channel();
            inner.waiting.entry(mcid).or_default().push(tx);
            Registration {
                listeners: self,
                mcid,
                rx,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(PaychError::Cancelled),
            outcome = &mut registration.rx => match outcome {
                Ok(outcome) => into_result(mcid, outcome),
                Err(_) => Err(PaychError::Cancelled),
            },
        }
    }

    /// Publish the outcome of `mcid`, waking every registered waiter. Later
    /// deliveries for the same message are ignored while the first is retained.
    pub fn deliver(&self, mcid: Cid, outcome: MsgOutcome) {
        let mut inner = self.inner();
        if inner.delivered.contains_key(&mcid) {
            debug!(msg = %mcid, "ignoring repeated message outcome");
            return;
        }
        for waiter in inner.waiting.remove(&mcid).unwrap_or_default() {
            let _ = waiter.send(outcome.clone());
        }
        if self.retain == 0 {
            return;
        }
        inner.delivered.insert(mcid, outcome);
        inner.order.push_back(mcid);
        while inner.order.len() > self.retain {
            if let Some(oldest) = inner.order.pop_front() {
                inner.delivered.remove(&oldest);
            }
        }
    }

    /// Release every pending waiter with `Cancelled` and refuse new waits.
    pub fn shutdown(&self) {
        let mut inner = self.inner();
        inner.closed = true;
        let pending = inner.waiting.len();
        // dropping the senders cancels the receivers
        inner.waiting.clear();
        debug!(pending, "message listeners shut down");
    }

    /// Messages with at least one live waiter.
    pub fn pending(&self) -> usize {
        self.inner().waiting.len()
    }

    pub fn delivered(&self) -> usize {
        self.inner().delivered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_result_before_wait() {
        let listeners = MsgListeners::new();
        let mcid = Cid::of(b"m1");
        listeners.deliver(mcid, Ok(()));
        listeners.wait(mcid, &CancellationToken::new()).await.unwrap();
        // a second wait sees the same outcome
        listeners.wait(mcid, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_before_result() {
        let listeners = Arc::new(MsgListeners::new());
        let mcid = Cid::of(b"m2");
        let waiter = {
            let listeners = listeners.clone();
            tokio::spawn(async move { listeners.wait(mcid, &CancellationToken::new()).await })
        };
        while listeners.pending() == 0 {
            tokio::task::yield_now().await;
        }
        listeners.deliver(mcid, Err("exit code 16".to_string()));
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PaychError::MessageFailed { reason, .. } if reason == "exit code 16"));

        // the first outcome wins
        listeners.deliver(mcid, Ok(()));
        assert!(listeners.wait(mcid, &CancellationToken::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_and_shutdown_release_waiters() {
        let listeners = Arc::new(MsgListeners::new());
        let cancel = CancellationToken::new();
        let cancelled = {
            let listeners = listeners.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { listeners.wait(Cid::of(b"a"), &cancel).await })
        };
        let shut = {
            let listeners = listeners.clone();
            tokio::spawn(async move { listeners.wait(Cid::of(b"b"), &CancellationToken::new()).await })
        };
        while listeners.pending() < 2 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert!(matches!(cancelled.await.unwrap(), Err(PaychError::Cancelled)));

        listeners.shutdown();
        assert!(matches!(shut.await.unwrap(), Err(PaychError::Cancelled)));
        assert!(matches!(
            listeners.wait(Cid::of(b"c"), &CancellationToken::new()).await,
            Err(PaychError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancelled_wait_leaves_no_sender_behind() {
        let listeners = Arc::new(MsgListeners::new());
        let mcid = Cid::of(b"abandoned");

        let cancel = CancellationToken::new();
        let cancelled = {
            let listeners = listeners.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { listeners.wait(mcid, &cancel).await })
        };
        while listeners.pending() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert!(matches!(cancelled.await.unwrap(), Err(PaychError::Cancelled)));
        assert_eq!(listeners.pending(), 0);

        // a caller dropped mid-wait is removed too
        let aborted = {
            let listeners = listeners.clone();
            tokio::spawn(async move { listeners.wait(mcid, &CancellationToken::new()).await })
        };
        while listeners.pending() == 0 {
            tokio::task::yield_now().await;
        }
        aborted.abort();
        assert!(aborted.await.unwrap_err().is_cancelled());
        assert_eq!(listeners.pending(), 0);

        // a later delivery still finds nobody and is retained for late callers
        listeners.deliver(mcid, Ok(()));
        listeners.wait(mcid, &CancellationToken::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_delivered_outcomes_are_bounded() {
        let listeners = MsgListeners::with_retention(2);
        for seed in [b"x1", b"x2", b"x3"] {
            listeners.deliver(Cid::of(seed), Ok(()));
        }
        assert_eq!(listeners.delivered(), 2);

        // the oldest outcome was evicted, so a late wait blocks until cancelled
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            listeners.wait(Cid::of(b"x1"), &cancel).await,
            Err(PaychError::Cancelled)
        ));
        assert_eq!(listeners.pending(), 0);
        listeners.wait(Cid::of(b"x3"), &CancellationToken::new()).await.unwrap();
    }
}

//! Event-driven reconciliation loop.
//!
//! Change events are mapped to claim keys, de-duplicated in a work queue and
//! reconciled by a bounded set of concurrent workers. Failed passes are
//! retried with exponential backoff.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, error, info, warn};
use volpop_core::PopulatorConfig;

use crate::error::{Error, Result};
use crate::mappers::map_change;
use crate::reconciler::Reconciler;
use crate::types::{ObjectKey, OutcomeKind, ReconcileOutcome};
use crate::watch::ChangeEvent;

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Maximum number of reconciles running at once.
    pub max_concurrent: usize,
    /// Delay before the first retry of a failed claim.
    pub base_backoff: Duration,
    /// Upper bound of the retry delay.
    pub max_backoff: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(300),
        }
    }
}

impl From<&PopulatorConfig> for LoopConfig {
    fn from(config: &PopulatorConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_reconciles,
            base_backoff: config.base_backoff,
            max_backoff: config.max_backoff,
        }
    }
}

impl LoopConfig {
    /// Retry delay after `failures` consecutive failures (1-based).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// De-duplicating work queue of claim keys.
///
/// A key is never handed out twice at once: a key added while it is being
/// processed is marked dirty and queued again when processing ends.
#[derive(Debug, Default)]
pub struct WorkQueue {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key. Returns whether it became ready.
    pub fn add(&mut self, key: ObjectKey) -> bool {
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if !self.queued.insert(key.clone()) {
            return false;
        }
        self.ready.push_back(key);
        true
    }

    /// Take the next ready key and mark it in flight.
    pub fn next(&mut self) -> Option<ObjectKey> {
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        self.processing.insert(key.clone());
        Some(key)
    }

    /// Mark a key done, re-queueing it if it changed while in flight.
    pub fn done(&mut self, key: &ObjectKey) {
        self.processing.remove(key);
        if self.dirty.remove(key) {
            self.add(key.clone());
        }
    }

    /// Count a failure for `key`, returning the consecutive failure count.
    pub fn record_failure(&mut self, key: &ObjectKey) -> u32 {
        let count = self.failures.entry(key.clone()).or_default();
        *count = count.saturating_add(1);
        *count
    }

    /// Reset the failure count for `key`.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    /// Number of ready keys.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    /// Whether no key is ready.
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// Number of keys in flight.
    pub fn in_flight(&self) -> usize {
        self.processing.len()
    }
}

/// Counters reported when the loop returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Change events consumed.
    pub events: u64,
    /// Reconcile passes that returned an outcome.
    pub reconciled: u64,
    /// Passes among `reconciled` that changed cluster state.
    pub progressed: u64,
    /// Reconcile passes that failed.
    pub failed: u64,
}

type PassResult = std::thread::Result<Result<ReconcileOutcome>>;
type Joined = std::result::Result<(task::Id, PassResult), JoinError>;

/// Event-driven reconciliation loop.
pub struct PopulatorLoop {
    /// The reconciler.
    reconciler: Arc<Reconciler>,
    /// Loop configuration.
    config: LoopConfig,
    /// Stop signal receiver.
    stop_rx: watch::Receiver<bool>,
    /// Stop signal sender (for external control).
    stop_tx: watch::Sender<bool>,
}

impl PopulatorLoop {
    /// Create a new loop.
    pub fn new(reconciler: Arc<Reconciler>, config: LoopConfig) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            reconciler,
            config,
            stop_rx,
            stop_tx,
        }
    }

    /// Run until stopped or until `changes` ends and all work is done.
    ///
    /// In-flight reconciles are awaited before returning. Retries still
    /// waiting out their backoff are dropped.
    pub async fn run<S>(&self, mut changes: S) -> Result<LoopStats>
    where
        S: Stream<Item = ChangeEvent> + Unpin + Send,
    {
        if self.config.max_concurrent == 0 {
            return Err(Error::invalid_config("max_concurrent must be at least 1"));
        }
        info!(
            max_concurrent = self.config.max_concurrent,
            base_backoff_ms = self.config.base_backoff.as_millis(),
            "Starting populator loop"
        );

        let store = Arc::clone(self.reconciler.store());
        let mut stop_rx = self.stop_rx.clone();
        let mut queue = WorkQueue::new();
        let mut workers: JoinSet<PassResult> = JoinSet::new();
        let mut running: HashMap<task::Id, ObjectKey> = HashMap::new();
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<ObjectKey>();
        let mut stats = LoopStats::default();
        let mut stream_done = false;

        loop {
            while workers.len() < self.config.max_concurrent {
                let Some(key) = queue.next() else {
                    break;
                };
                let reconciler = Arc::clone(&self.reconciler);
                let pass_key = key.clone();
                let handle = workers.spawn(async move {
                    AssertUnwindSafe(reconciler.reconcile(&pass_key))
                        .catch_unwind()
                        .await
                });
                running.insert(handle.id(), key);
            }

            if *stop_rx.borrow() {
                break;
            }
            if stream_done && workers.is_empty() && queue.is_empty() {
                info!("Change stream ended and queue is empty");
                break;
            }

            tokio::select! {
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
                event = changes.next(), if !stream_done => match event {
                    Some(event) => {
                        stats.events = stats.events.saturating_add(1);
                        for key in map_change(store.as_ref(), &event).await {
                            queue.add(key);
                        }
                        debug!(
                            ready = queue.len(),
                            in_flight = queue.in_flight(),
                            "Queue after change"
                        );
                    }
                    None => stream_done = true,
                },
                Some(key) = retry_rx.recv() => {
                    queue.add(key);
                }
                Some(joined) = workers.join_next_with_id(), if !workers.is_empty() => {
                    self.complete(joined, &mut running, &mut queue, &mut stats, Some(&retry_tx));
                }
            }
        }

        info!(
            in_flight = workers.len(),
            ready = queue.len(),
            "Populator loop stopping, draining workers"
        );
        while let Some(joined) = workers.join_next_with_id().await {
            self.complete(joined, &mut running, &mut queue, &mut stats, None);
        }
        info!(
            events = stats.events,
            reconciled = stats.reconciled,
            progressed = stats.progressed,
            failed = stats.failed,
            "Populator loop stopped"
        );
        Ok(stats)
    }

    /// Handle a finished pass; failed keys are retried through `retry_tx`.
    ///
    /// The key is released from `queue` however the task ended, so a
    /// cancelled task never leaves its claim marked in flight.
    fn complete(
        &self,
        joined: Joined,
        running: &mut HashMap<task::Id, ObjectKey>,
        queue: &mut WorkQueue,
        stats: &mut LoopStats,
        retry_tx: Option<&mpsc::UnboundedSender<ObjectKey>>,
    ) {
        let (id, pass) = match joined {
            Ok((id, pass)) => (id, Some(pass)),
            Err(e) => (e.id(), None),
        };
        let Some(key) = running.remove(&id) else {
            warn!(task = %id, "Finished reconcile task has no claim");
            return;
        };
        queue.done(&key);

        let retry = match pass {
            Some(Ok(Ok(outcome))) => {
                stats.reconciled = stats.reconciled.saturating_add(1);
                queue.forget(&key);
                if outcome.kind() == OutcomeKind::Progressed {
                    stats.progressed = stats.progressed.saturating_add(1);
                    info!(claim = %key, outcome = %outcome, "Reconciled");
                } else {
                    debug!(claim = %key, outcome = %outcome, "Reconciled");
                }
                false
            }
            Some(Ok(Err(e))) if e.is_transient() => {
                stats.failed = stats.failed.saturating_add(1);
                warn!(claim = %key, error = %e, "Reconcile failed, will retry");
                true
            }
            Some(Ok(Err(e))) => {
                stats.failed = stats.failed.saturating_add(1);
                queue.forget(&key);
                error!(claim = %key, error = %e, "Reconcile failed permanently");
                false
            }
            Some(Err(_)) => {
                stats.failed = stats.failed.saturating_add(1);
                error!(claim = %key, "Reconcile panicked, will retry");
                true
            }
            None => {
                stats.failed = stats.failed.saturating_add(1);
                error!(claim = %key, "Reconcile task was cancelled, will retry");
                true
            }
        };

        if let (true, Some(retry_tx)) = (retry, retry_tx) {
            let failures = queue.record_failure(&key);
            let delay = self.config.backoff_for(failures);
            debug!(claim = %key, failures, delay_ms = delay.as_millis(), "Scheduling retry");
            let retry_tx = retry_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // The loop may have stopped meanwhile.
                let _ = retry_tx.send(key);
            });
        }
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> LoopStopper {
        LoopStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }
}

/// Handle to stop a populator loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

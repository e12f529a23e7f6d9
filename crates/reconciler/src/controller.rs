//! Worker pool draining the work queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use echo_cluster::{ChangeBus, ObjectKey};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::queue::{BackoffPolicy, WorkQueue};
use crate::reconciler::Reconciler;
use crate::trigger::{TriggerBinding, resync_all};
use crate::types::{Action, ReconcileResult};

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 4;

/// Configuration for the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Keys reconciled concurrently. The same key is never run twice at once.
    pub workers: usize,
    /// Backoff for keys whose pass failed.
    pub backoff: BackoffPolicy,
    /// Periodic full resync, `None` to disable.
    pub resync_interval: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            backoff: BackoffPolicy::default(),
            resync_interval: None,
        }
    }
}

impl ControllerConfig {
    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for zero workers or a backoff ceiling
    /// below its base.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be positive"));
        }
        if self.backoff.base.is_zero() {
            return Err(Error::invalid_config("backoff base must be positive"));
        }
        if self.backoff.max < self.backoff.base {
            return Err(Error::invalid_config(
                "backoff max must not be below backoff base",
            ));
        }
        Ok(())
    }
}

/// Running counters of the controller.
#[derive(Debug, Default)]
pub struct ControllerStats {
    passes: AtomicU64,
    errors: AtomicU64,
    requeues: AtomicU64,
    conflicts: AtomicU64,
}

/// Point-in-time copy of [`ControllerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub passes: u64,
    pub errors: u64,
    pub requeues: u64,
    pub conflicts: u64,
}

impl ControllerStats {
    fn record(&self, outcome: &Result<ReconcileResult>) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Ok(result) => {
                if result.conflicted {
                    self.conflicts.fetch_add(1, Ordering::Relaxed);
                }
                if result.action != Action::Await {
                    self.requeues.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(Error::Cancelled) => {}
            Err(_) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                self.requeues.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Read all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
        }
    }
}

/// Watches for changes and runs reconciliation passes on a worker pool.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    stats: Arc<ControllerStats>,
    /// Stop signal receiver.
    stop_rx: watch::Receiver<bool>,
    /// Stop signal sender (for external control).
    stop_tx: watch::Sender<bool>,
}

impl Controller {
    /// Create a new controller.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `config` is invalid.
    pub fn new(reconciler: Arc<Reconciler>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let (stop_tx, stop_rx) = watch::channel(false);
        Ok(Self {
            reconciler,
            queue: Arc::new(WorkQueue::new(config.backoff)),
            config,
            stats: Arc::new(ControllerStats::default()),
            stop_rx,
            stop_tx,
        })
    }

    /// Run until stopped.
    ///
    /// Every Echo already in the store is enqueued once at startup. On stop,
    /// workers finish between passes and in-flight passes are cancelled.
    ///
    /// # Errors
    ///
    /// Returns `Error::QueueShutdown` if the controller already ran.
    pub async fn run(&self, bus: &ChangeBus) -> Result<()> {
        if self.queue.is_shutting_down() {
            return Err(Error::QueueShutdown);
        }
        info!(
            workers = self.config.workers,
            resync = ?self.config.resync_interval,
            "Starting controller"
        );

        let call_timeout = self.reconciler.config().call_timeout;
        let binding = TriggerBinding::standard()
            .with_resync(self.config.resync_interval)
            .with_call_timeout(call_timeout)
            .spawn(
                bus,
                Arc::clone(self.reconciler.store()),
                Arc::clone(&self.queue),
                self.stop_rx.clone(),
            );
        resync_all(self.reconciler.store().as_ref(), &self.queue, call_timeout).await;

        let workers: Vec<_> = (0..self.config.workers)
            .map(|id| {
                tokio::spawn(worker(
                    id,
                    Arc::clone(&self.reconciler),
                    Arc::clone(&self.queue),
                    Arc::clone(&self.stats),
                    self.stop_rx.clone(),
                ))
            })
            .collect();

        stopped(&mut self.stop_rx.clone()).await;

        info!("Stopping controller");
        self.queue.shut_down();
        for joined in join_all(workers).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        if let Err(e) = binding.await {
            error!(error = %e, "Trigger binding task ended abnormally");
        }

        info!(stats = ?self.stats.snapshot(), "Controller stopped");
        Ok(())
    }

    /// Stop the controller.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Get a stopper handle.
    pub fn stopper(&self) -> ControllerStopper {
        ControllerStopper {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Get the work queue.
    pub const fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    /// Read the counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Handle to stop a controller.
#[derive(Clone)]
pub struct ControllerStopper {
    stop_tx: watch::Sender<bool>,
}

impl ControllerStopper {
    /// Stop the controller.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

async fn worker(
    id: usize,
    reconciler: Arc<Reconciler>,
    queue: Arc<WorkQueue>,
    stats: Arc<ControllerStats>,
    mut stop: watch::Receiver<bool>,
) {
    debug!(worker = id, "Worker started");
    while let Some(key) = queue.get().await {
        let outcome = tokio::select! {
            result = reconciler.reconcile(&key) => result,
            () = stopped(&mut stop) => Err(Error::Cancelled),
        };
        stats.record(&outcome);
        schedule(&queue, &key, outcome);
        queue.done(&key);
    }
    debug!(worker = id, "Worker stopped");
}

/// Resolve once the stop flag is set or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

/// Turn the outcome of a pass into the key's next enqueue.
fn schedule(queue: &Arc<WorkQueue>, key: &ObjectKey, outcome: Result<ReconcileResult>) {
    match outcome {
        Ok(result) => {
            queue.forget(key);
            match result.action {
                Action::Requeue => {
                    queue.add(key.clone());
                }
                Action::RequeueAfter(delay) => queue.add_after(key.clone(), delay),
                Action::Await => {}
            }
        }
        Err(Error::Cancelled) => {
            debug!(key = %key, "Pass cancelled");
            queue.add_rate_limited(key.clone());
        }
        Err(e) if e.is_retryable() => {
            let delay = queue.add_rate_limited(key.clone());
            warn!(
                key = %key,
                error = %e,
                retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Reconciliation failed, retrying with backoff"
            );
        }
        Err(e) => {
            queue.forget(key);
            error!(key = %key, error = %e, "Reconciliation failed permanently");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(ControllerConfig::default().validate().is_ok());

        let no_workers = ControllerConfig {
            workers: 0,
            ..ControllerConfig::default()
        };
        assert!(no_workers.validate().is_err());

        let inverted = ControllerConfig {
            backoff: BackoffPolicy {
                base: Duration::from_secs(2),
                max: Duration::from_secs(1),
                jitter: false,
            },
            ..ControllerConfig::default()
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_stats_record_outcomes() {
        let stats = ControllerStats::default();
        let key = ObjectKey::new("default", "hello");

        stats.record(&Ok(ReconcileResult {
            action: Action::Requeue,
            ..ReconcileResult::gone(key.clone())
        }));
        stats.record(&Ok(ReconcileResult {
            conflicted: true,
            ..ReconcileResult::gone(key.clone())
        }));
        stats.record(&Err(Error::job_lost(key, "echo-job-hello")));
        stats.record(&Err(Error::Cancelled));

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                passes: 4,
                errors: 1,
                requeues: 2,
                conflicts: 1,
            }
        );
    }

    /// Given a key whose pass asked for an immediate requeue
    /// When the outcome is scheduled while the key is still processing
    /// Then it comes back exactly once after done
    #[tokio::test]
    async fn test_immediate_requeue_waits_for_done() {
        let queue = Arc::new(WorkQueue::default());
        let key = ObjectKey::new("default", "hello");
        queue.add(key.clone());
        let taken = queue.get().await;
        assert_eq!(taken.as_ref(), Some(&key));

        schedule(
            &queue,
            &key,
            Ok(ReconcileResult {
                action: Action::Requeue,
                ..ReconcileResult::gone(key.clone())
            }),
        );
        assert!(queue.is_empty());
        queue.done(&key);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_and_success_forgets() {
        let queue = Arc::new(WorkQueue::default());
        let key = ObjectKey::new("default", "hello");

        schedule(&queue, &key, Err(Error::job_lost(key.clone(), "j")));
        schedule(&queue, &key, Err(Error::job_lost(key.clone(), "j")));
        assert_eq!(queue.num_requeues(&key), 2);

        schedule(&queue, &key, Ok(ReconcileResult::gone(key.clone())));
        assert_eq!(queue.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let queue = Arc::new(WorkQueue::default());
        let key = ObjectKey::new("default", "hello");

        schedule(&queue, &key, Err(Error::invalid_config("broken")));
        assert_eq!(queue.num_requeues(&key), 0);
        assert!(queue.is_empty());
    }
}

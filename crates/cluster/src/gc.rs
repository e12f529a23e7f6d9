//! Owner-reference garbage collection of jobs.
//!
//! Jobs are collected when their controlling Echo is deleted. A failed
//! collection is retried with exponential backoff, and a lagging bus
//! subscription triggers a sweep of every job whose owner is no longer in the
//! store, so no deletion is missed for good.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use echo_core::backoff_delay;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::JobBackend;
use crate::bus::{ChangeBus, ChangeKind};
use crate::error::{Error, Result};
use crate::store::ResourceStore;
use crate::types::ResourceKind;

/// Default first retry delay after a failed collection.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Default retry delay ceiling.
pub const DEFAULT_RETRY_MAX: Duration = Duration::from_secs(60);

/// A unit of cleanup work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Cleanup {
    /// Jobs of one deleted owner.
    Owner(Uuid),
    /// Jobs of every owner missing from the store.
    Sweep,
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner(uid) => write!(f, "owner {uid}"),
            Self::Sweep => f.write_str("orphan sweep"),
        }
    }
}

/// Failed cleanups waiting for their next attempt.
struct RetrySchedule {
    base: Duration,
    max: Duration,
    pending: HashMap<Cleanup, (u32, Instant)>,
}

impl RetrySchedule {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            pending: HashMap::new(),
        }
    }

    /// Schedule `cleanup` after its `failures`-th failure. Returns the delay.
    fn schedule(&mut self, cleanup: Cleanup, failures: u32) -> Duration {
        let delay = backoff_delay(failures, self.base, self.max);
        self.pending
            .insert(cleanup, (failures.saturating_add(1), Instant::now() + delay));
        delay
    }

    fn clear(&mut self, cleanup: Cleanup) {
        self.pending.remove(&cleanup);
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending.values().map(|(_, due)| *due).min()
    }

    /// Remove and return every cleanup due at `now` with its failure count.
    fn take_due(&mut self, now: Instant) -> Vec<(Cleanup, u32)> {
        let due: Vec<(Cleanup, u32)> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| *at <= now)
            .map(|(cleanup, (failures, _))| (*cleanup, *failures))
            .collect();
        for (cleanup, _) in &due {
            self.pending.remove(cleanup);
        }
        due
    }
}

/// Deletes jobs whose controller owner was deleted.
pub struct OwnerGarbageCollector {
    bus: Arc<ChangeBus>,
    store: Arc<dyn ResourceStore>,
    backend: Arc<dyn JobBackend>,
    retry_base: Duration,
    retry_max: Duration,
}

impl OwnerGarbageCollector {
    /// Create a collector watching `bus`, checking owners in `store` and
    /// cleaning up `backend`.
    pub fn new(
        bus: Arc<ChangeBus>,
        store: Arc<dyn ResourceStore>,
        backend: Arc<dyn JobBackend>,
    ) -> Self {
        Self {
            bus,
            store,
            backend,
            retry_base: DEFAULT_RETRY_BASE,
            retry_max: DEFAULT_RETRY_MAX,
        }
    }

    /// Set the backoff applied to failed collections.
    #[must_use]
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max.max(base);
        self
    }

    /// Delete every job owned by `owner_uid`. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; jobs deleted before the failure stay
    /// deleted and the rest are picked up by the next call.
    pub async fn collect(&self, owner_uid: Uuid) -> Result<usize> {
        let owned = self.backend.list_owned_by(owner_uid).await?;
        let mut removed = 0usize;
        for key in owned {
            if self.backend.delete(&key).await? {
                debug!(job = %key, owner_uid = %owner_uid, "Collected orphaned job");
                removed = removed.saturating_add(1);
            }
        }
        Ok(removed)
    }

    /// Delete every job whose controller owner is not in the store.
    ///
    /// # Errors
    ///
    /// Propagates store and backend failures.
    pub async fn sweep(&self) -> Result<usize> {
        // Owners first: any owner listed here existed before the store
        // listing, so it is missing from that listing only if deleted.
        let owners = self.backend.owner_uids().await?;
        let live: HashSet<Uuid> = self
            .store
            .list()
            .await?
            .iter()
            .map(|echo| echo.metadata.uid)
            .collect();

        let mut removed = 0usize;
        for uid in owners.into_iter().filter(|uid| !live.contains(uid)) {
            removed = removed.saturating_add(self.collect(uid).await?);
        }
        Ok(removed)
    }

    async fn run(&self, cleanup: Cleanup) -> Result<usize> {
        match cleanup {
            Cleanup::Owner(uid) => self.collect(uid).await,
            Cleanup::Sweep => self.sweep().await,
        }
    }

    async fn attempt(&self, cleanup: Cleanup, failures: u32, retries: &mut RetrySchedule) {
        match self.run(cleanup).await {
            Ok(removed) => {
                retries.clear(cleanup);
                if removed > 0 {
                    info!(%cleanup, removed, "Garbage collected jobs");
                }
            }
            Err(e) => {
                let delay = retries.schedule(cleanup, failures);
                warn!(
                    %cleanup,
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Garbage collection failed, retrying with backoff"
                );
            }
        }
    }

    /// Run until `stop` flips to `true`.
    pub fn spawn(self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let mut sub = self.bus.subscribe();
        tokio::spawn(async move {
            info!("Owner garbage collector started");
            let mut retries = RetrySchedule::new(self.retry_base, self.retry_max);
            loop {
                let next_due = retries.next_due();
                tokio::select! {
                    event = sub.recv() => match event {
                        Ok(event) if event.kind == ResourceKind::Echo && event.change == ChangeKind::Deleted => {
                            let Some(uid) = event.uid else { continue };
                            debug!(owner = %event.key, "Owner deleted");
                            self.attempt(Cleanup::Owner(uid), 0, &mut retries).await;
                        }
                        Ok(_) => {}
                        Err(Error::Lagged { skipped }) => {
                            warn!(skipped, "Garbage collector lagged behind the change bus, sweeping");
                            self.attempt(Cleanup::Sweep, 0, &mut retries).await;
                        }
                        Err(_) => break,
                    },
                    () = wait_until(next_due) => {
                        for (cleanup, failures) in retries.take_due(Instant::now()) {
                            self.attempt(cleanup, failures, &mut retries).await;
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(pending = retries.pending.len(), "Owner garbage collector stopped");
        })
    }
}

async fn wait_until(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryJobBackend;
    use crate::bus::WatchEvent;
    use crate::job::{JobSpec, JobState, JobTemplate, job_key_for};
    use crate::store::InMemoryResourceStore;
    use crate::types::{EchoSpec, ObjectKey};

    async fn wait_absent(backend: &InMemoryJobBackend, key: &ObjectKey) -> Result<bool> {
        for _ in 0..200 {
            if backend.get(key).await? == JobState::Absent {
                return Ok(true);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Ok(false)
    }

    #[tokio::test]
    async fn test_collect_removes_only_owned_jobs() -> Result<()> {
        let bus = Arc::new(ChangeBus::default());
        let store = Arc::new(InMemoryResourceStore::new());
        let backend = Arc::new(InMemoryJobBackend::new());

        let doomed = store.create("default", "doomed", EchoSpec::new("a")?).await?;
        let kept = store.create("default", "kept", EchoSpec::new("b")?).await?;
        backend
            .create(&JobSpec::for_echo(&doomed, &JobTemplate::default()))
            .await?;
        backend
            .create(&JobSpec::for_echo(&kept, &JobTemplate::default()))
            .await?;

        let gc = OwnerGarbageCollector::new(bus, store, backend.clone());
        assert_eq!(gc.collect(doomed.metadata.uid).await?, 1);
        assert_eq!(backend.job_count().await, 1);
        assert_eq!(backend.get(&job_key_for(&kept.key())).await?, JobState::Running);
        Ok(())
    }

    #[tokio::test]
    async fn test_deleting_owner_collects_its_job() -> Result<()> {
        let bus = Arc::new(ChangeBus::default());
        let store = Arc::new(InMemoryResourceStore::with_bus(bus.clone()));
        let backend = Arc::new(InMemoryJobBackend::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle =
            OwnerGarbageCollector::new(bus, store.clone(), backend.clone()).spawn(stop_rx);

        let echo = store.create("default", "hello", EchoSpec::new("hi")?).await?;
        backend
            .create(&JobSpec::for_echo(&echo, &JobTemplate::default()))
            .await?;
        store.delete(&echo.key()).await?;

        let collected = wait_absent(&backend, &job_key_for(&echo.key())).await?;
        assert!(collected, "job should be collected after owner deletion");

        let _ = stop_tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
        Ok(())
    }

    /// Given a backend whose job listing fails once
    /// When the owner is deleted
    /// Then the collection is retried and the job still goes away
    #[tokio::test]
    async fn test_failed_collection_is_retried() -> Result<()> {
        let bus = Arc::new(ChangeBus::default());
        let store = Arc::new(InMemoryResourceStore::with_bus(bus.clone()));
        let backend = Arc::new(InMemoryJobBackend::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = OwnerGarbageCollector::new(bus, store.clone(), backend.clone())
            .with_retry_backoff(Duration::from_millis(10), Duration::from_millis(50))
            .spawn(stop_rx);

        let echo = store.create("default", "hello", EchoSpec::new("hi")?).await?;
        backend
            .create(&JobSpec::for_echo(&echo, &JobTemplate::default()))
            .await?;
        backend.faults().fail_next("list", 1);
        store.delete(&echo.key()).await?;

        let collected = wait_absent(&backend, &job_key_for(&echo.key())).await?;
        assert!(collected, "job should be collected on retry");

        let _ = stop_tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
        Ok(())
    }

    /// Given a deletion the collector never saw and a subscription that lags
    /// When the lag is reported
    /// Then a sweep removes the orphaned job and keeps jobs of live owners
    #[tokio::test]
    async fn test_lagging_subscription_sweeps_orphans() -> Result<()> {
        let bus = Arc::new(ChangeBus::new(1));
        let store = Arc::new(InMemoryResourceStore::new());
        let backend = Arc::new(InMemoryJobBackend::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let gone = store.create("default", "gone", EchoSpec::new("a")?).await?;
        let kept = store.create("default", "kept", EchoSpec::new("b")?).await?;
        for echo in [&gone, &kept] {
            backend
                .create(&JobSpec::for_echo(echo, &JobTemplate::default()))
                .await?;
        }
        store.delete(&gone.key()).await?;

        let handle =
            OwnerGarbageCollector::new(bus.clone(), store.clone(), backend.clone()).spawn(stop_rx);
        for name in ["a", "b", "c"] {
            bus.publish(WatchEvent::echo(
                ChangeKind::Updated,
                ObjectKey::new("default", name),
                Uuid::new_v4(),
            ));
        }

        let collected = wait_absent(&backend, &job_key_for(&gone.key())).await?;
        assert!(collected, "orphaned job should be swept");
        assert_eq!(backend.get(&job_key_for(&kept.key())).await?, JobState::Running);

        let _ = stop_tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_removes_only_orphans() -> Result<()> {
        let bus = Arc::new(ChangeBus::default());
        let store = Arc::new(InMemoryResourceStore::new());
        let backend = Arc::new(InMemoryJobBackend::new());

        let gone = store.create("default", "gone", EchoSpec::new("a")?).await?;
        let kept = store.create("default", "kept", EchoSpec::new("b")?).await?;
        for echo in [&gone, &kept] {
            backend
                .create(&JobSpec::for_echo(echo, &JobTemplate::default()))
                .await?;
        }
        store.delete(&gone.key()).await?;

        let gc = OwnerGarbageCollector::new(bus, store, backend.clone());
        assert_eq!(gc.sweep().await?, 1);
        assert_eq!(gc.sweep().await?, 0);
        assert_eq!(backend.job_count().await, 1);
        Ok(())
    }

    #[test]
    fn test_retry_schedule_backs_off() {
        let mut retries =
            RetrySchedule::new(Duration::from_millis(100), Duration::from_millis(300));
        let owner = Cleanup::Owner(Uuid::new_v4());

        assert_eq!(retries.schedule(owner, 0), Duration::from_millis(100));
        assert_eq!(retries.schedule(owner, 2), Duration::from_millis(300));
        assert!(retries.next_due().is_some());

        let due = retries.take_due(Instant::now() + Duration::from_secs(1));
        assert_eq!(due, vec![(owner, 3)]);
        assert!(retries.next_due().is_none());
    }
}

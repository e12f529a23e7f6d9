//! Event trigger binding: which changes enqueue which keys.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use echo_cluster::{
    ChangeBus, ChangeKind, ECHO_KIND, ObjectKey, ResourceKind, ResourceStore, WatchEvent,
};
use echo_core::ResultExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::queue::WorkQueue;
use crate::reconciler::DEFAULT_CALL_TIMEOUT;

/// Why a key was enqueued. Informational only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    ResourceCreated,
    ResourceUpdated,
    ResourceDeleted,
    JobChanged,
    Resync,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::ResourceCreated => "resource created",
            Self::ResourceUpdated => "resource updated",
            Self::ResourceDeleted => "resource deleted",
            Self::JobChanged => "job changed",
            Self::Resync => "resync",
        };
        f.write_str(text)
    }
}

/// A key to reconcile and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub key: ObjectKey,
    pub reason: TriggerReason,
}

/// A watched kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSource {
    /// Every change of an Echo enqueues that Echo.
    Resources,
    /// Job status changes and deletions enqueue the controlling Echo.
    OwnedJobs,
}

/// Registered watch sources plus the optional periodic resync.
#[derive(Debug, Clone)]
pub struct TriggerBinding {
    sources: Vec<WatchSource>,
    resync_interval: Option<Duration>,
    call_timeout: Duration,
}

impl Default for TriggerBinding {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            resync_interval: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl TriggerBinding {
    /// A binding with no sources.
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard binding: Echo resources and the jobs they own.
    pub fn standard() -> Self {
        Self::new().watch_resources().watch_owned_jobs()
    }

    /// Watch Echo resources.
    #[must_use]
    pub fn watch_resources(mut self) -> Self {
        if !self.sources.contains(&WatchSource::Resources) {
            self.sources.push(WatchSource::Resources);
        }
        self
    }

    /// Watch jobs owned by Echo resources.
    #[must_use]
    pub fn watch_owned_jobs(mut self) -> Self {
        if !self.sources.contains(&WatchSource::OwnedJobs) {
            self.sources.push(WatchSource::OwnedJobs);
        }
        self
    }

    /// Enqueue every Echo every `interval`; `None` disables it.
    #[must_use]
    pub fn with_resync(mut self, interval: Option<Duration>) -> Self {
        self.resync_interval = interval.filter(|i| !i.is_zero());
        self
    }

    /// Bound on the store listing of a resync.
    #[must_use]
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Registered sources.
    pub fn sources(&self) -> &[WatchSource] {
        &self.sources
    }

    /// Map a watch event to the key it should enqueue, if any.
    pub fn map_event(&self, event: &WatchEvent) -> Option<Trigger> {
        match event.kind {
            ResourceKind::Echo if self.sources.contains(&WatchSource::Resources) => {
                let reason = match event.change {
                    ChangeKind::Created => TriggerReason::ResourceCreated,
                    ChangeKind::Updated | ChangeKind::StatusChanged => {
                        TriggerReason::ResourceUpdated
                    }
                    ChangeKind::Deleted => TriggerReason::ResourceDeleted,
                };
                Some(Trigger {
                    key: event.key.clone(),
                    reason,
                })
            }
            ResourceKind::Job if self.sources.contains(&WatchSource::OwnedJobs) => {
                // Our own creates are followed by a status write already.
                if event.change == ChangeKind::Created {
                    return None;
                }
                let owner = event.owner.as_ref()?;
                (owner.controller && owner.kind == ECHO_KIND).then(|| Trigger {
                    key: owner.key(),
                    reason: TriggerReason::JobChanged,
                })
            }
            _ => None,
        }
    }

    /// Feed matching bus events into `queue` until `stop` flips to `true`.
    ///
    /// A lagging subscription and the periodic resync both enqueue every
    /// Echo listed by `store`, so no change is lost for good.
    pub fn spawn(
        self,
        bus: &ChangeBus,
        store: Arc<dyn ResourceStore>,
        queue: Arc<WorkQueue>,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut sub = bus.subscribe();
        tokio::spawn(async move {
            info!(sources = ?self.sources, resync = ?self.resync_interval, "Trigger binding started");
            let mut resync = self.resync_interval.map(|period| {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker
            });

            loop {
                tokio::select! {
                    event = sub.recv() => match event {
                        Ok(event) => {
                            if let Some(trigger) = self.map_event(&event) {
                                let added = queue.add(trigger.key.clone());
                                trace!(key = %trigger.key, reason = %trigger.reason, added, "Enqueued");
                            }
                        }
                        Err(echo_cluster::Error::Lagged { skipped }) => {
                            warn!(skipped, "Trigger binding lagged behind the change bus, resyncing");
                            resync_all(store.as_ref(), &queue, self.call_timeout).await;
                        }
                        Err(_) => break,
                    },
                    () = tick(resync.as_mut()) => {
                        resync_all(store.as_ref(), &queue, self.call_timeout).await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Trigger binding stopped");
        })
    }
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Enqueue every Echo the store knows about. The listing is bounded by
/// `call_timeout`; a failed or timed out listing enqueues nothing.
pub async fn resync_all(
    store: &dyn ResourceStore,
    queue: &WorkQueue,
    call_timeout: Duration,
) -> usize {
    let Some(items) = tokio::time::timeout(call_timeout, store.list())
        .await
        .map_err(|_| {
            echo_cluster::Error::unavailable(
                "list",
                format!("timed out after {}ms", call_timeout.as_millis()),
            )
        })
        .and_then(std::convert::identity)
        .into_option_logged("Resync failed to list resources")
    else {
        return 0;
    };

    let added = items
        .iter()
        .filter(|echo| queue.add(echo.key()))
        .count();
    debug!(listed = items.len(), added, reason = %TriggerReason::Resync, "Resynced");
    added
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_cluster::{
        EchoSpec, InMemoryJobBackend, InMemoryResourceStore, JobBackend, JobSpec, JobState,
        JobTemplate, OwnerReference,
    };

    async fn seeded_owner(store: &InMemoryResourceStore, name: &str) -> echo_cluster::Result<OwnerReference> {
        let echo = store.create("default", name, EchoSpec::new("hi")?).await?;
        Ok(OwnerReference::for_echo(&echo))
    }

    #[test]
    fn test_echo_events_map_to_their_key() {
        let binding = TriggerBinding::standard();
        let key = ObjectKey::new("default", "hello");
        let event = WatchEvent {
            kind: ResourceKind::Echo,
            change: ChangeKind::StatusChanged,
            key: key.clone(),
            uid: None,
            owner: None,
        };

        assert_eq!(
            binding.map_event(&event),
            Some(Trigger {
                key,
                reason: TriggerReason::ResourceUpdated
            })
        );
    }

    /// Given a job owned by an Echo
    /// When its status changes
    /// Then the owning Echo's key is enqueued, not the job's
    #[tokio::test]
    async fn test_job_events_map_to_owner() -> echo_cluster::Result<()> {
        let store = InMemoryResourceStore::new();
        let owner = seeded_owner(&store, "hello").await?;
        let binding = TriggerBinding::standard();

        let changed = WatchEvent::job(
            ChangeKind::StatusChanged,
            ObjectKey::new("default", "echo-job-hello"),
            owner.clone(),
        );
        assert_eq!(
            binding.map_event(&changed).map(|t| t.key),
            Some(ObjectKey::new("default", "hello"))
        );

        let created = WatchEvent::job(
            ChangeKind::Created,
            ObjectKey::new("default", "echo-job-hello"),
            owner.clone(),
        );
        assert_eq!(binding.map_event(&created), None);

        let foreign = OwnerReference {
            controller: false,
            ..owner
        };
        let unowned = WatchEvent::job(
            ChangeKind::Deleted,
            ObjectKey::new("default", "echo-job-hello"),
            foreign,
        );
        assert_eq!(binding.map_event(&unowned), None);
        Ok(())
    }

    #[test]
    fn test_unregistered_sources_are_ignored() {
        let binding = TriggerBinding::new().watch_owned_jobs();
        let event = WatchEvent {
            kind: ResourceKind::Echo,
            change: ChangeKind::Created,
            key: ObjectKey::new("default", "hello"),
            uid: None,
            owner: None,
        };
        assert_eq!(binding.map_event(&event), None);
        assert_eq!(binding.sources(), &[WatchSource::OwnedJobs]);
    }

    #[test]
    fn test_zero_resync_is_disabled() {
        let binding = TriggerBinding::standard().with_resync(Some(Duration::ZERO));
        assert!(binding.resync_interval.is_none());
    }

    #[tokio::test]
    async fn test_spawned_binding_dedups_into_queue() -> echo_cluster::Result<()> {
        let bus = Arc::new(ChangeBus::default());
        let store = Arc::new(InMemoryResourceStore::with_bus(bus.clone()));
        let backend = InMemoryJobBackend::with_bus(bus.clone());
        let queue = Arc::new(WorkQueue::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = TriggerBinding::standard().spawn(&bus, store.clone(), queue.clone(), stop_rx);

        let echo = store.create("default", "hello", EchoSpec::new("hi")?).await?;
        let spec = JobSpec::for_echo(&echo, &JobTemplate::default());
        backend.create(&spec).await?;
        backend.set_state(&spec.key(), JobState::Succeeded).await?;

        let mut queued = 0;
        for _ in 0..100 {
            queued = queue.len();
            if queued > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Give the remaining events a chance to arrive before asserting dedup.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queued.max(queue.len()), 1);
        assert_eq!(queue.get().await, Some(echo.key()));

        let _ = stop_tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_resync_all_enqueues_every_echo() -> echo_cluster::Result<()> {
        let store = InMemoryResourceStore::new();
        store.create("default", "a", EchoSpec::new("a")?).await?;
        store.create("other", "b", EchoSpec::new("b")?).await?;
        let queue = WorkQueue::default();

        assert_eq!(resync_all(&store, &queue, Duration::from_secs(1)).await, 2);
        assert_eq!(resync_all(&store, &queue, Duration::from_secs(1)).await, 0);
        assert_eq!(queue.len(), 2);
        Ok(())
    }

    /// Given a store whose listing hangs
    /// When a resync runs
    /// Then it gives up after the call timeout and enqueues nothing
    #[tokio::test(start_paused = true)]
    async fn test_resync_listing_is_bounded() -> echo_cluster::Result<()> {
        let store = InMemoryResourceStore::new();
        store.create("default", "a", EchoSpec::new("a")?).await?;
        store.faults().set_latency(Some(Duration::from_secs(3600)));
        let queue = WorkQueue::default();

        let started = tokio::time::Instant::now();
        assert_eq!(resync_all(&store, &queue, Duration::from_millis(200)).await, 0);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(queue.is_empty());
        Ok(())
    }

    /// Given a running binding whose periodic resync hits a hanging store
    /// When it is told to stop
    /// Then the task still ends
    #[tokio::test(start_paused = true)]
    async fn test_hanging_resync_does_not_block_stop() -> echo_cluster::Result<()> {
        let bus = ChangeBus::default();
        let store = Arc::new(InMemoryResourceStore::new());
        store.create("default", "a", EchoSpec::new("a")?).await?;
        store.faults().set_latency(Some(Duration::from_secs(3600)));
        let queue = Arc::new(WorkQueue::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = TriggerBinding::standard()
            .with_resync(Some(Duration::from_millis(10)))
            .with_call_timeout(Duration::from_millis(100))
            .spawn(&bus, store.clone(), queue, stop_rx);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = stop_tx.send(true);
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.is_ok());
        Ok(())
    }
}

//! Job backend trait and the scriptable in-memory implementation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{ChangeBus, ChangeKind, WatchEvent};
use crate::error::{Error, Result};
use crate::fault::FaultInjector;
use crate::job::{JobSpec, JobState, OwnerReference};
use crate::types::{ObjectKey, ResourceKind};

/// Create/inspect/delete access to execution units.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Create a job.
    ///
    /// Returns `Error::AlreadyExists` if a job with the same key exists.
    async fn create(&self, spec: &JobSpec) -> Result<()>;

    /// Current execution state; `JobState::Absent` if there is no such job.
    async fn get(&self, key: &ObjectKey) -> Result<JobState>;

    /// Delete a job. Returns `false` if it did not exist.
    async fn delete(&self, key: &ObjectKey) -> Result<bool>;

    /// Keys of every job whose controller owner has `owner_uid`.
    async fn list_owned_by(&self, owner_uid: Uuid) -> Result<Vec<ObjectKey>>;

    /// Controller owner of an existing job; `None` if there is no such job.
    async fn owner(&self, key: &ObjectKey) -> Result<Option<OwnerReference>>;

    /// Distinct uids of every controller owner that still has jobs.
    async fn owner_uids(&self) -> Result<Vec<Uuid>>;
}

/// A job as held by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub spec: JobSpec,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Captured output of the job, if the backend runs it.
    pub logs: String,
}

impl JobRecord {
    fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            state: JobState::Running,
            created_at: Utc::now(),
            finished_at: None,
            logs: String::new(),
        }
    }
}

/// Shared job bookkeeping used by the backends in this crate.
pub(crate) struct JobTable {
    jobs: RwLock<HashMap<ObjectKey, JobRecord>>,
    bus: Option<Arc<ChangeBus>>,
}

impl JobTable {
    pub(crate) fn new(bus: Option<Arc<ChangeBus>>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Insert a fresh record unless the key is taken.
    pub(crate) async fn insert(&self, spec: &JobSpec) -> Result<()> {
        let key = spec.key();
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&key) {
            return Err(Error::already_exists(ResourceKind::Job, key));
        }
        jobs.insert(key.clone(), JobRecord::new(spec.clone()));
        drop(jobs);

        debug!(job = %key, owner = %spec.owner.key(), "Created job");
        self.publish(ChangeKind::Created, key, spec.owner.clone());
        Ok(())
    }

    pub(crate) async fn state(&self, key: &ObjectKey) -> JobState {
        self.jobs
            .read()
            .await
            .get(key)
            .map_or(JobState::Absent, |record| record.state)
    }

    pub(crate) async fn record(&self, key: &ObjectKey) -> Option<JobRecord> {
        self.jobs.read().await.get(key).cloned()
    }

    /// Record an outcome. Returns `false` if the job no longer exists.
    pub(crate) async fn finish(&self, key: &ObjectKey, state: JobState, logs: String) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(record) = jobs.get_mut(key) else {
            return false;
        };
        if record.state == state && record.logs == logs {
            return true;
        }
        record.state = state;
        record.logs = logs;
        record.finished_at = state.is_finished().then(Utc::now);
        let owner = record.spec.owner.clone();
        drop(jobs);

        debug!(job = %key, state = %state, "Job state changed");
        self.publish(ChangeKind::StatusChanged, key.clone(), owner);
        true
    }

    pub(crate) async fn remove(&self, key: &ObjectKey) -> Option<JobRecord> {
        let removed = self.jobs.write().await.remove(key)?;
        debug!(job = %key, "Deleted job");
        self.publish(ChangeKind::Deleted, key.clone(), removed.spec.owner.clone());
        Some(removed)
    }

    pub(crate) async fn owned_by(&self, owner_uid: Uuid) -> Vec<ObjectKey> {
        let mut keys: Vec<ObjectKey> = self
            .jobs
            .read()
            .await
            .iter()
            .filter(|(_, record)| record.spec.owner.controller && record.spec.owner.uid == owner_uid)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) async fn owner(&self, key: &ObjectKey) -> Option<OwnerReference> {
        self.jobs
            .read()
            .await
            .get(key)
            .map(|record| record.spec.owner.clone())
            .filter(|owner| owner.controller)
    }

    pub(crate) async fn owner_uids(&self) -> Vec<Uuid> {
        let uids: BTreeSet<Uuid> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|record| record.spec.owner.controller)
            .map(|record| record.spec.owner.uid)
            .collect();
        uids.into_iter().collect()
    }

    pub(crate) async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    fn publish(&self, change: ChangeKind, key: ObjectKey, owner: OwnerReference) {
        if let Some(bus) = &self.bus {
            bus.publish(WatchEvent::job(change, key, owner));
        }
    }
}

/// In-memory backend whose job outcomes are driven by the caller.
///
/// Jobs start `Running` and stay there until [`InMemoryJobBackend::set_state`]
/// reports an outcome.
pub struct InMemoryJobBackend {
    table: JobTable,
    create_calls: AtomicUsize,
    created: AtomicUsize,
    faults: FaultInjector,
}

impl InMemoryJobBackend {
    /// Create a backend that publishes nothing.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a backend that publishes job changes to `bus`.
    pub fn with_bus(bus: Arc<ChangeBus>) -> Self {
        Self::build(Some(bus))
    }

    fn build(bus: Option<Arc<ChangeBus>>) -> Self {
        Self {
            table: JobTable::new(bus),
            create_calls: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            faults: FaultInjector::new(),
        }
    }

    /// Fault injection handle.
    pub const fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Report an execution outcome for a job.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the job does not exist.
    pub async fn set_state(&self, key: &ObjectKey, state: JobState) -> Result<()> {
        if state == JobState::Absent {
            return self.evict(key).await;
        }
        if self.table.finish(key, state, String::new()).await {
            Ok(())
        } else {
            Err(Error::not_found(ResourceKind::Job, key.clone()))
        }
    }

    /// Remove a job as if it was lost or evicted.
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` if the job does not exist.
    pub async fn evict(&self, key: &ObjectKey) -> Result<()> {
        self.table
            .remove(key)
            .await
            .map(|_| ())
            .ok_or_else(|| Error::not_found(ResourceKind::Job, key.clone()))
    }

    /// Snapshot of a job.
    pub async fn job(&self, key: &ObjectKey) -> Option<JobRecord> {
        self.table.record(key).await
    }

    /// Number of live jobs.
    pub async fn job_count(&self) -> usize {
        self.table.len().await
    }

    /// Number of `create` calls received, successful or not.
    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of jobs actually created.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryJobBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobBackend for InMemoryJobBackend {
    async fn create(&self, spec: &JobSpec) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        self.faults.check("create").await?;
        self.table.insert(spec).await?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<JobState> {
        self.faults.check("get").await?;
        Ok(self.table.state(key).await)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        self.faults.check("delete").await?;
        Ok(self.table.remove(key).await.is_some())
    }

    async fn list_owned_by(&self, owner_uid: Uuid) -> Result<Vec<ObjectKey>> {
        self.faults.check("list").await?;
        Ok(self.table.owned_by(owner_uid).await)
    }

    async fn owner(&self, key: &ObjectKey) -> Result<Option<OwnerReference>> {
        self.faults.check("get").await?;
        Ok(self.table.owner(key).await)
    }

    async fn owner_uids(&self) -> Result<Vec<Uuid>> {
        self.faults.check("list").await?;
        Ok(self.table.owner_uids().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobTemplate, OwnerReference};
    use crate::store::InMemoryResourceStore;
    use crate::types::EchoSpec;

    async fn spec_for(name: &str) -> Result<JobSpec> {
        let store = InMemoryResourceStore::new();
        let echo = store.create("default", name, EchoSpec::new("hi")?).await?;
        Ok(JobSpec::for_echo(&echo, &JobTemplate::default()))
    }

    #[tokio::test]
    async fn test_create_is_exclusive() -> Result<()> {
        let backend = InMemoryJobBackend::new();
        let spec = spec_for("hello").await?;

        backend.create(&spec).await?;
        let again = backend.create(&spec).await;

        assert!(again.is_err_and(|e| e.is_already_exists()));
        assert_eq!(backend.create_calls(), 2);
        assert_eq!(backend.created(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_state_transitions() -> Result<()> {
        let backend = InMemoryJobBackend::new();
        let spec = spec_for("hello").await?;
        let key = spec.key();

        assert_eq!(backend.get(&key).await?, JobState::Absent);
        backend.create(&spec).await?;
        assert_eq!(backend.get(&key).await?, JobState::Running);

        backend.set_state(&key, JobState::Succeeded).await?;
        assert_eq!(backend.get(&key).await?, JobState::Succeeded);
        assert!(backend.job(&key).await.and_then(|j| j.finished_at).is_some());

        backend.set_state(&key, JobState::Absent).await?;
        assert_eq!(backend.get(&key).await?, JobState::Absent);
        Ok(())
    }

    #[tokio::test]
    async fn test_state_changes_are_published_with_owner() -> Result<()> {
        let bus = Arc::new(ChangeBus::default());
        let mut sub = bus.subscribe();
        let backend = InMemoryJobBackend::with_bus(bus);
        let spec = spec_for("hello").await?;

        backend.create(&spec).await?;
        backend.set_state(&spec.key(), JobState::Failed).await?;

        assert_eq!(sub.recv().await?.change, ChangeKind::Created);
        let event = sub.recv().await?;
        assert_eq!(event.change, ChangeKind::StatusChanged);
        assert_eq!(event.owner.map(|o| o.key()), Some(spec.owner.key()));
        Ok(())
    }

    #[tokio::test]
    async fn test_list_owned_by_filters_uid() -> Result<()> {
        let backend = InMemoryJobBackend::new();
        let first = spec_for("first").await?;
        let mut foreign = spec_for("second").await?;
        foreign.owner = OwnerReference {
            uid: Uuid::new_v4(),
            ..foreign.owner
        };

        backend.create(&first).await?;
        backend.create(&foreign).await?;

        let owned = backend.list_owned_by(first.owner.uid).await?;
        assert_eq!(owned, vec![first.key()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_owner_lookups() -> Result<()> {
        let backend = InMemoryJobBackend::new();
        let first = spec_for("first").await?;
        let second = spec_for("second").await?;
        let mut detached = spec_for("detached").await?;
        detached.owner.controller = false;

        backend.create(&first).await?;
        backend.create(&second).await?;
        backend.create(&detached).await?;

        assert_eq!(backend.owner(&first.key()).await?, Some(first.owner.clone()));
        assert_eq!(backend.owner(&detached.key()).await?, None);
        assert_eq!(
            backend.owner(&ObjectKey::new("default", "missing")).await?,
            None
        );

        let mut expected = vec![first.owner.uid, second.owner.uid];
        expected.sort();
        assert_eq!(backend.owner_uids().await?, expected);
        Ok(())
    }
}

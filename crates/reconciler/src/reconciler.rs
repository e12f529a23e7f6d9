//! Reconcile driver: one pass for one Echo.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use echo_cluster::{
    Echo, EchoPhase, JobBackend, JobSpec, JobState, JobTemplate, ObjectKey, ResourceStore,
    job_key_for,
};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::phase::{DEFAULT_POLL_INTERVAL, PhaseMachine};
use crate::types::{Action, Decision, DecisionInput, Effect, Fault, ReconcileResult, Requeue};

/// Default bound on each collaborator call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Delay between checks of a running job.
    pub poll_interval: Duration,
    /// Bound on every store and backend call.
    pub call_timeout: Duration,
    /// Template for the jobs this reconciler creates.
    pub job_template: JobTemplate,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            job_template: JobTemplate::default(),
        }
    }
}

impl ReconcilerConfig {
    /// Check the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` for a zero timeout or poll interval, or
    /// an empty job command.
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(Error::invalid_config("call timeout must be positive"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_config("poll interval must be positive"));
        }
        if self.job_template.command.is_empty() {
            return Err(Error::invalid_config("job command must not be empty"));
        }
        Ok(())
    }
}

/// Drives Echo resources toward their decided state.
pub struct Reconciler {
    store: Arc<dyn ResourceStore>,
    backend: Arc<dyn JobBackend>,
    machine: PhaseMachine,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        backend: Arc<dyn JobBackend>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            backend,
            machine: PhaseMachine::new(config.poll_interval),
            config,
        }
    }

    /// Run one reconciliation pass for `key`.
    ///
    /// # Errors
    ///
    /// Returns an error for transient collaborator failures, timeouts and a
    /// job that disappeared while Running. Version conflicts, duplicate job
    /// creation and a missing Echo are not errors.
    #[instrument(skip(self), fields(namespace = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<ReconcileResult> {
        let echo = match self.bounded("get resource", self.store.get(key)).await? {
            Ok(echo) => echo,
            Err(e) if e.is_not_found() => {
                debug!("Echo not found, assuming it was deleted");
                return Ok(ReconcileResult::gone(key.clone()));
            }
            Err(e) => return Err(Error::Store(e)),
        };

        let observed_job = match echo.phase() {
            Some(EchoPhase::Running) => Some(self.observe_job(&echo).await?),
            _ => None,
        };

        let decision = self.machine.decide(&DecisionInput {
            key,
            spec: &echo.spec,
            status: &echo.status,
            generation: echo.metadata.generation,
            observed_job,
            now: Utc::now(),
        });

        let job_created = self.apply(&echo, &decision).await?;

        let mut result = ReconcileResult {
            key: key.clone(),
            action: Action::Await,
            phase: Some(decision.next_phase.clone()),
            job_created,
            status_written: false,
            conflicted: false,
        };

        if decision.status != echo.status {
            let mut updated = echo.clone();
            updated.status = decision.status.clone();
            match self
                .bounded("update status", self.store.update_status(&updated))
                .await?
            {
                Ok(stored) => {
                    result.status_written = true;
                    if echo.phase() != stored.phase() {
                        info!(
                            from = echo.phase().map_or("", EchoPhase::as_str),
                            to = %decision.next_phase,
                            "Echo phase changed"
                        );
                    }
                }
                Err(e) if e.is_conflict() => {
                    // Another writer got there first; its change triggers a new pass.
                    debug!(error = %e, "Status write lost to a concurrent writer, dropping pass");
                    result.conflicted = true;
                    result.phase = echo.phase().cloned();
                    return Ok(result);
                }
                Err(e) if e.is_not_found() => {
                    debug!("Echo deleted during the pass");
                    return Ok(ReconcileResult::gone(key.clone()));
                }
                Err(e) => return Err(Error::Store(e)),
            }
        }

        result.action = match decision.requeue {
            Requeue::Immediate => Action::Requeue,
            Requeue::After(delay) => Action::RequeueAfter(delay),
            Requeue::Never => Action::Await,
            Requeue::Backoff(Fault::JobLost { job_name }) => {
                warn!(job = %job_name, "Job of a running Echo is missing");
                return Err(Error::job_lost(key.clone(), job_name));
            }
        };

        debug!(
            phase = %decision.next_phase,
            action = %result.action.description(),
            "Reconciliation pass finished"
        );
        Ok(result)
    }

    /// Freshly query the job recorded for a running Echo.
    async fn observe_job(&self, echo: &Echo) -> Result<JobState> {
        let job_key = match &echo.status.job_name {
            Some(name) => ObjectKey::new(echo.metadata.namespace.clone(), name.clone()),
            None => job_key_for(&echo.key()),
        };
        let state = self
            .bounded("get job", self.backend.get(&job_key))
            .await?
            .map_err(Error::Backend)?;
        debug!(job = %job_key, state = %state, "Observed job");
        Ok(state)
    }

    /// Apply the decided effect. Returns whether a job was created.
    async fn apply(&self, echo: &Echo, decision: &Decision) -> Result<bool> {
        let Effect::CreateJob { job_name } = &decision.effect else {
            return Ok(false);
        };

        let mut spec = JobSpec::for_echo(echo, &self.config.job_template);
        spec.name.clone_from(job_name);

        match self.bounded("create job", self.backend.create(&spec)).await? {
            Ok(()) => {
                info!(job = %job_name, message = %echo.spec.message, "Created job");
                Ok(true)
            }
            Err(e) if e.is_already_exists() => self.adopt_or_replace(echo, &spec).await,
            Err(e) => Err(Error::Backend(e)),
        }
    }

    /// Resolve a create that hit an existing job with the same name.
    ///
    /// A job controlled by this Echo is ours already. One left behind by an
    /// earlier object of the same name is deleted and created afresh; a job
    /// that vanished in between is simply created again.
    async fn adopt_or_replace(&self, echo: &Echo, spec: &JobSpec) -> Result<bool> {
        let key = spec.key();
        let owner = self
            .bounded("get job owner", self.backend.owner(&key))
            .await?
            .map_err(Error::Backend)?;

        match owner {
            Some(owner) if owner.uid == echo.metadata.uid => {
                debug!(job = %key, "Job already exists");
                return Ok(false);
            }
            Some(owner) => {
                warn!(
                    job = %key,
                    stale_owner_uid = %owner.uid,
                    "Job belongs to a deleted Echo of the same name, replacing it"
                );
                self.bounded("delete job", self.backend.delete(&key))
                    .await?
                    .map_err(Error::Backend)?;
            }
            None => debug!(job = %key, "Conflicting job disappeared, creating again"),
        }

        self.bounded("create job", self.backend.create(spec))
            .await?
            .map_err(Error::Backend)?;
        info!(job = %key, message = %echo.spec.message, "Created job");
        Ok(true)
    }

    /// Run a collaborator call under the configured timeout.
    async fn bounded<T, F>(&self, operation: &'static str, call: F) -> Result<echo_cluster::Result<T>>
    where
        F: Future<Output = echo_cluster::Result<T>>,
    {
        timeout(self.config.call_timeout, call)
            .await
            .map_err(|_| Error::timeout(operation, self.config.call_timeout))
    }

    /// Get the resource store.
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Get the job backend.
    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    /// Get the configuration.
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    store: Option<Arc<dyn ResourceStore>>,
    backend: Option<Arc<dyn JobBackend>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            store: None,
            backend: None,
            config: ReconcilerConfig::default(),
        }
    }

    /// Set the resource store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the job backend.
    #[must_use]
    pub fn with_backend(mut self, backend: Arc<dyn JobBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the poll interval for running jobs.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the bound on collaborator calls.
    #[must_use]
    pub fn call_timeout(mut self, limit: Duration) -> Self {
        self.config.call_timeout = limit;
        self
    }

    /// Set the job template.
    #[must_use]
    pub fn job_template(mut self, template: JobTemplate) -> Self {
        self.config.job_template = template;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if a collaborator is missing or the
    /// configuration is invalid.
    pub fn build(self) -> Result<Reconciler> {
        let store = self
            .store
            .ok_or_else(|| Error::invalid_config("resource store is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| Error::invalid_config("job backend is required"))?;
        self.config.validate()?;

        Ok(Reconciler::new(store, backend, self.config))
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use echo_cluster::{EchoSpec, InMemoryJobBackend, InMemoryResourceStore};

    struct Fixture {
        store: Arc<InMemoryResourceStore>,
        backend: Arc<InMemoryJobBackend>,
        reconciler: Reconciler,
    }

    fn fixture(config: ReconcilerConfig) -> Fixture {
        let store = Arc::new(InMemoryResourceStore::new());
        let backend = Arc::new(InMemoryJobBackend::new());
        let reconciler = Reconciler::new(store.clone(), backend.clone(), config);
        Fixture {
            store,
            backend,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_missing_echo_is_success() -> Result<()> {
        let f = fixture(ReconcilerConfig::default());
        let result = f
            .reconciler
            .reconcile(&ObjectKey::new("default", "ghost"))
            .await?;

        assert_eq!(result.action, Action::Await);
        assert!(result.is_noop());
        assert_eq!(f.backend.create_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_fetch_error_propagates() -> std::result::Result<(), echo_cluster::Error> {
        let f = fixture(ReconcilerConfig::default());
        let echo = f
            .store
            .create("default", "hello", EchoSpec::new("hello")?)
            .await?;
        f.store.faults().fail_next("get", 1);

        let result = f.reconciler.reconcile(&echo.key()).await;
        assert!(matches!(result, Err(Error::Store(_))));
        assert!(result.is_err_and(|e| e.is_retryable()));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_create_propagates_and_keeps_pending(
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let f = fixture(ReconcilerConfig::default());
        let echo = f
            .store
            .create("default", "hello", EchoSpec::new("hello")?)
            .await?;
        f.reconciler.reconcile(&echo.key()).await?;

        f.backend.faults().fail_next("create", 1);
        let result = f.reconciler.reconcile(&echo.key()).await;
        assert!(matches!(result, Err(Error::Backend(_))));

        let stored = f.store.get(&echo.key()).await?;
        assert_eq!(stored.status.phase, Some(EchoPhase::Pending));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let config = ReconcilerConfig {
            call_timeout: Duration::from_millis(50),
            ..ReconcilerConfig::default()
        };
        let f = fixture(config);
        let echo = f
            .store
            .create("default", "hello", EchoSpec::new("hello")?)
            .await?;
        f.store.faults().set_latency(Some(Duration::from_secs(5)));

        let result = f.reconciler.reconcile(&echo.key()).await;
        assert!(matches!(
            result,
            Err(Error::Timeout {
                operation: "get resource",
                ..
            })
        ));
        Ok(())
    }

    #[test]
    fn test_builder() {
        let result = ReconcilerBuilder::new()
            .with_store(Arc::new(InMemoryResourceStore::new()))
            .with_backend(Arc::new(InMemoryJobBackend::new()))
            .poll_interval(Duration::from_secs(2))
            .build();

        assert!(result.is_ok());
        assert_eq!(
            result.ok().map(|r| r.config().poll_interval),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let result = ReconcilerBuilder::new()
            .with_store(Arc::new(InMemoryResourceStore::new()))
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }

    #[test]
    fn test_builder_rejects_zero_timeout() {
        let result = ReconcilerBuilder::new()
            .with_store(Arc::new(InMemoryResourceStore::new()))
            .with_backend(Arc::new(InMemoryJobBackend::new()))
            .call_timeout(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(Error::InvalidConfig { .. })));
    }
}

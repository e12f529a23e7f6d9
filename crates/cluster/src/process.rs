//! Job backend that runs each job as a local process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{JobBackend, JobRecord, JobTable};
use crate::bus::ChangeBus;
use crate::error::Result;
use crate::job::{JobSpec, JobState, OwnerReference};
use crate::types::ObjectKey;

/// Default wall-clock limit for a single job.
pub const DEFAULT_ACTIVE_DEADLINE: Duration = Duration::from_secs(300);

/// Runs `command + args` of every job on the local host.
///
/// The image is ignored. Stdout and stderr are captured into the job's logs;
/// a zero exit status is `Succeeded`, anything else (including exceeding the
/// active deadline) is `Failed`.
pub struct LocalProcessJobBackend {
    table: Arc<JobTable>,
    running: Mutex<HashMap<ObjectKey, JoinHandle<()>>>,
    active_deadline: Duration,
}

impl LocalProcessJobBackend {
    /// Create a backend publishing job changes to `bus`.
    pub fn new(bus: Option<Arc<ChangeBus>>) -> Self {
        Self {
            table: Arc::new(JobTable::new(bus)),
            running: Mutex::new(HashMap::new()),
            active_deadline: DEFAULT_ACTIVE_DEADLINE,
        }
    }

    /// Set the wall-clock limit applied to each job.
    #[must_use]
    pub fn with_active_deadline(mut self, deadline: Duration) -> Self {
        self.active_deadline = deadline;
        self
    }

    /// Snapshot of a job, including captured output.
    pub async fn job(&self, key: &ObjectKey) -> Option<JobRecord> {
        self.table.record(key).await
    }

    async fn run(spec: JobSpec, deadline: Duration) -> (JobState, String) {
        let Some((program, leading)) = spec.command.split_first() else {
            return (JobState::Failed, "job has an empty command".to_string());
        };

        let child = Command::new(program)
            .args(leading)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => return (JobState::Failed, format!("failed to spawn '{program}': {e}")),
        };

        match timeout(deadline, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let mut logs = String::from_utf8_lossy(&output.stdout).into_owned();
                logs.push_str(&String::from_utf8_lossy(&output.stderr));
                let state = if output.status.success() {
                    JobState::Succeeded
                } else {
                    JobState::Failed
                };
                (state, logs)
            }
            Ok(Err(e)) => (JobState::Failed, format!("failed to wait for job: {e}")),
            Err(_) => (
                JobState::Failed,
                format!("job exceeded active deadline of {}s", deadline.as_secs()),
            ),
        }
    }
}

#[async_trait]
impl JobBackend for LocalProcessJobBackend {
    async fn create(&self, spec: &JobSpec) -> Result<()> {
        self.table.insert(spec).await?;

        let key = spec.key();
        let table = Arc::clone(&self.table);
        let spec = spec.clone();
        let deadline = self.active_deadline;
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let (state, logs) = Self::run(spec, deadline).await;
            match state {
                JobState::Succeeded => info!(job = %task_key, output = %logs.trim_end(), "Job succeeded"),
                _ => warn!(job = %task_key, output = %logs.trim_end(), "Job failed"),
            }
            table.finish(&task_key, state, logs).await;
        });

        let mut running = self.running.lock().await;
        running.retain(|_, task| !task.is_finished());
        running.insert(key, handle);
        Ok(())
    }

    async fn get(&self, key: &ObjectKey) -> Result<JobState> {
        Ok(self.table.state(key).await)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        if let Some(task) = self.running.lock().await.remove(key) {
            // Dropping the child inside the aborted task kills the process.
            task.abort();
            debug!(job = %key, "Aborted running job");
        }
        Ok(self.table.remove(key).await.is_some())
    }

    async fn list_owned_by(&self, owner_uid: Uuid) -> Result<Vec<ObjectKey>> {
        Ok(self.table.owned_by(owner_uid).await)
    }

    async fn owner(&self, key: &ObjectKey) -> Result<Option<OwnerReference>> {
        Ok(self.table.owner(key).await)
    }

    async fn owner_uids(&self) -> Result<Vec<Uuid>> {
        Ok(self.table.owner_uids().await)
    }
}

//! Core types for the reconciler.

use std::time::Duration;

use chrono::{DateTime, Utc};
use echo_cluster::{EchoPhase, EchoSpec, EchoStatus, JobState, ObjectKey};
use serde::{Deserialize, Serialize};

/// Everything the phase machine looks at for one decision.
///
/// The machine reads nothing else: no clock, no collaborators.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub key: &'a ObjectKey,
    pub spec: &'a EchoSpec,
    pub status: &'a EchoStatus,
    /// Generation stamped onto conditions as `observedGeneration`.
    pub generation: i64,
    /// Freshly queried job state; only supplied while Running.
    pub observed_job: Option<JobState>,
    pub now: DateTime<Utc>,
}

/// Side effect requested by a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Effect {
    /// Nothing to do outside the status.
    None,
    /// Create the execution job with this name.
    CreateJob { job_name: String },
}

/// Why a decision asks for an error requeue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    /// The recorded job is gone while the Echo is Running.
    JobLost { job_name: String },
}

/// When the same key should be looked at again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requeue {
    /// Right away.
    Immediate,
    /// After a fixed delay.
    After(Duration),
    /// Only on the next watched change.
    Never,
    /// Surface an error so the key is retried with backoff.
    Backoff(Fault),
}

/// Output of the phase machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub next_phase: EchoPhase,
    /// Complete status to store if it differs from the current one.
    pub status: EchoStatus,
    pub effect: Effect,
    pub requeue: Requeue,
}

impl Decision {
    /// Whether applying this decision touches the outside world.
    pub const fn has_effect(&self) -> bool {
        matches!(self.effect, Effect::CreateJob { .. })
    }
}

/// Caller-visible outcome of a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Enqueue the key again immediately.
    Requeue,
    /// Enqueue the key again after the delay.
    RequeueAfter(Duration),
    /// Wait for the next notification.
    Await,
}

impl Action {
    /// Human readable description.
    pub fn description(&self) -> String {
        match self {
            Self::Requeue => "requeue immediately".to_string(),
            Self::RequeueAfter(delay) => format!("requeue after {}ms", delay.as_millis()),
            Self::Await => "await next change".to_string(),
        }
    }
}

/// What a single pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileResult {
    pub key: ObjectKey,
    pub action: Action,
    /// Phase after the pass, `None` if the Echo is gone.
    pub phase: Option<EchoPhase>,
    /// A job was created by this pass.
    pub job_created: bool,
    /// The status was persisted by this pass.
    pub status_written: bool,
    /// The status write lost to a concurrent writer and the pass was dropped.
    pub conflicted: bool,
}

impl ReconcileResult {
    /// Result of a pass that found nothing to reconcile.
    pub fn gone(key: ObjectKey) -> Self {
        Self {
            key,
            action: Action::Await,
            phase: None,
            job_created: false,
            status_written: false,
            conflicted: false,
        }
    }

    /// Whether the pass changed nothing.
    pub const fn is_noop(&self) -> bool {
        !self.job_created && !self.status_written
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_description() {
        assert!(Action::Requeue.description().contains("immediately"));
        assert_eq!(
            Action::RequeueAfter(Duration::from_secs(5)).description(),
            "requeue after 5000ms"
        );
    }

    #[test]
    fn test_gone_result_is_noop() {
        let result = ReconcileResult::gone(ObjectKey::new("default", "hello"));
        assert!(result.is_noop());
        assert_eq!(result.action, Action::Await);
        assert!(result.phase.is_none());
    }

    #[test]
    fn test_effect_serializes_tagged() {
        let effect = Effect::CreateJob {
            job_name: "echo-job-hello".to_string(),
        };
        let json = serde_json::to_string(&effect).ok();
        assert_eq!(
            json.as_deref(),
            Some(r#"{"type":"create_job","job_name":"echo-job-hello"}"#)
        );
    }
}

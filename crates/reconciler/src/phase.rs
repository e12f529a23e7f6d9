//! Pure phase decisions for Echo resources.
//!
//! [`PhaseMachine::decide`] maps the stored phase and the observed job state
//! to the next status, the side effect to apply and when to look again:
//!
//! | Phase        | Job observed          | Effect     | Next      | Requeue        |
//! |--------------|-----------------------|------------|-----------|----------------|
//! | unset        | -                     | none       | Pending   | immediate      |
//! | Pending      | none / absent         | create job | Running   | immediate      |
//! | Pending      | exists                | none       | Running   | immediate      |
//! | Running      | running / not queried | none       | Running   | poll interval  |
//! | Running      | succeeded             | none       | Completed | never          |
//! | Running      | failed                | none       | Failed    | never          |
//! | Running      | absent                | none       | Running   | error backoff  |
//! | terminal     | -                     | none       | unchanged | never          |
//! | unrecognized | -                     | none       | Pending   | immediate      |

use std::time::Duration;

use chrono::{DateTime, Utc};
use echo_cluster::{
    Condition, ConditionStatus, EchoPhase, EchoStatus, JobState, condition_types, job_name_for,
};

use crate::types::{Decision, DecisionInput, Effect, Fault, Requeue};

/// Default delay between checks of a running job.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Status message of a freshly observed Echo.
pub const INITIALIZED_MESSAGE: &str = "Echo resource created, preparing to execute";

/// The Echo phase state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseMachine {
    poll_interval: Duration,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl PhaseMachine {
    /// Create a machine that rechecks running jobs every `poll_interval`.
    pub const fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Delay used while a job is running.
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Decide what to do next. Deterministic in its input.
    pub fn decide(&self, input: &DecisionInput<'_>) -> Decision {
        match input.status.phase.as_ref() {
            None => Self::initialize(input),
            Some(EchoPhase::Pending) => Self::start(input),
            Some(EchoPhase::Running) => self.observe(input),
            Some(phase @ (EchoPhase::Completed | EchoPhase::Failed)) => Decision {
                next_phase: phase.clone(),
                status: input.status.clone(),
                effect: Effect::None,
                requeue: Requeue::Never,
            },
            Some(EchoPhase::Unknown(value)) => Self::reset(input, value),
        }
    }

    fn initialize(input: &DecisionInput<'_>) -> Decision {
        let mut status = input.status.clone();
        status.phase = Some(EchoPhase::Pending);
        status.message = INITIALIZED_MESSAGE.to_string();
        let marks = ConditionMarks {
            ready: (ConditionStatus::False, "Pending"),
            progressing: (ConditionStatus::True, "Initialized"),
            failed: None,
        };
        marks.apply(&mut status, input.generation, input.now);

        Decision {
            next_phase: EchoPhase::Pending,
            status,
            effect: Effect::None,
            requeue: Requeue::Immediate,
        }
    }

    fn reset(input: &DecisionInput<'_>, value: &str) -> Decision {
        let mut status = input.status.clone();
        status.phase = Some(EchoPhase::Pending);
        status.message = format!("Unrecognized phase '{value}', reset to Pending");
        let marks = ConditionMarks {
            ready: (ConditionStatus::False, "Pending"),
            progressing: (ConditionStatus::True, "PhaseReset"),
            failed: None,
        };
        marks.apply(&mut status, input.generation, input.now);

        Decision {
            next_phase: EchoPhase::Pending,
            status,
            effect: Effect::None,
            requeue: Requeue::Immediate,
        }
    }

    fn start(input: &DecisionInput<'_>) -> Decision {
        let job_name = Self::job_name(input);
        let create = matches!(input.observed_job, None | Some(JobState::Absent));

        let mut status = input.status.clone();
        status.phase = Some(EchoPhase::Running);
        status.job_name = Some(job_name.clone());
        status.message = format!(
            "Job {job_name} created for message: {}",
            input.spec.message
        );
        status.last_execution_time = if create {
            Some(input.now)
        } else {
            status.last_execution_time.or(Some(input.now))
        };
        let marks = ConditionMarks {
            ready: (ConditionStatus::False, "JobRunning"),
            progressing: (ConditionStatus::True, "JobCreated"),
            failed: None,
        };
        marks.apply(&mut status, input.generation, input.now);

        Decision {
            next_phase: EchoPhase::Running,
            status,
            effect: if create {
                Effect::CreateJob { job_name }
            } else {
                Effect::None
            },
            requeue: Requeue::Immediate,
        }
    }

    fn observe(&self, input: &DecisionInput<'_>) -> Decision {
        let job_name = Self::job_name(input);
        let message = &input.spec.message;

        let mut status = input.status.clone();
        status.job_name = Some(job_name.clone());

        let (next_phase, marks, requeue) = match input.observed_job {
            None | Some(JobState::Running) => {
                status.message = format!("Job {job_name} is running for message: {message}");
                let marks = ConditionMarks {
                    ready: (ConditionStatus::False, "JobRunning"),
                    progressing: (ConditionStatus::True, "JobRunning"),
                    failed: None,
                };
                (EchoPhase::Running, marks, Requeue::After(self.poll_interval))
            }
            Some(JobState::Succeeded) => {
                status.message = format!(
                    "Job {job_name} completed successfully. Message '{message}' was echoed."
                );
                let marks = ConditionMarks {
                    ready: (ConditionStatus::True, "JobSucceeded"),
                    progressing: (ConditionStatus::False, "JobSucceeded"),
                    failed: Some((ConditionStatus::False, "JobSucceeded")),
                };
                (EchoPhase::Completed, marks, Requeue::Never)
            }
            Some(JobState::Failed) => {
                status.message =
                    format!("Job {job_name} failed while echoing message '{message}'.");
                let marks = ConditionMarks {
                    ready: (ConditionStatus::False, "JobFailed"),
                    progressing: (ConditionStatus::False, "JobFailed"),
                    failed: Some((ConditionStatus::True, "JobFailed")),
                };
                (EchoPhase::Failed, marks, Requeue::Never)
            }
            Some(JobState::Absent) => {
                // Re-creating could echo the message twice; report and retry the check.
                status.message =
                    format!("Job {job_name} is missing; it will not be re-created automatically.");
                let marks = ConditionMarks {
                    ready: (ConditionStatus::False, "JobMissing"),
                    progressing: (ConditionStatus::Unknown, "JobMissing"),
                    failed: None,
                };
                let requeue = Requeue::Backoff(Fault::JobLost {
                    job_name: job_name.clone(),
                });
                (EchoPhase::Running, marks, requeue)
            }
        };

        status.phase = Some(next_phase.clone());
        marks.apply(&mut status, input.generation, input.now);

        Decision {
            next_phase,
            status,
            effect: Effect::None,
            requeue,
        }
    }

    /// The recorded job name wins over the derived one once assigned.
    fn job_name(input: &DecisionInput<'_>) -> String {
        input
            .status
            .job_name
            .clone()
            .unwrap_or_else(|| job_name_for(input.key))
    }
}

/// Condition values written alongside a phase.
struct ConditionMarks {
    ready: (ConditionStatus, &'static str),
    progressing: (ConditionStatus, &'static str),
    failed: Option<(ConditionStatus, &'static str)>,
}

impl ConditionMarks {
    fn apply(self, status: &mut EchoStatus, generation: i64, now: DateTime<Utc>) {
        let message = status.message.clone();
        let marks = [
            Some((condition_types::READY, self.ready)),
            Some((condition_types::PROGRESSING, self.progressing)),
            self.failed.map(|mark| (condition_types::FAILED, mark)),
        ];
        for (condition_type, (value, reason)) in marks.into_iter().flatten() {
            status.set_condition(Condition::new(
                condition_type,
                value,
                reason,
                message.clone(),
                generation,
                now,
            ));
        }
    }
}

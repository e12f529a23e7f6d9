//! Core types for the Echo resource.
//!
//! Wire names follow the cluster API conventions (camelCase fields, phase and
//! condition status as plain strings) so a stored object serializes exactly
//! like its declarative manifest.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Error, Result};

/// API group of the Echo kind.
pub const API_GROUP: &str = "echo.martineg.net";

/// API version of the Echo kind.
pub const API_VERSION: &str = "v1alpha1";

/// Kind name of the Echo resource.
pub const ECHO_KIND: &str = "Echo";

/// Maximum length of `spec.message`, in characters.
pub const MAX_MESSAGE_LEN: usize = 1000;

/// Kinds of objects observed by the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// The Echo custom resource.
    Echo,
    /// The execution unit created for an Echo.
    Job,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Echo => write!(f, "Echo"),
            Self::Job => write!(f, "Job"),
        }
    }
}

/// Stable identity of a namespaced object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    /// Create a new object key.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Optimistic-concurrency token, bumped by the store on every write.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ResourceVersion(u64);

impl ResourceVersion {
    /// Wrap a raw version number.
    #[must_use]
    pub const fn new(version: u64) -> Self {
        Self(version)
    }

    /// Raw version number.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object metadata assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    pub uid: Uuid,
    pub resource_version: ResourceVersion,
    pub generation: i64,
    pub creation_timestamp: DateTime<Utc>,
}

impl ObjectMeta {
    /// Identity of the object.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Desired state of an Echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoSpec {
    /// The text to echo. Required, 1..=1000 characters.
    pub message: String,
}

impl EchoSpec {
    /// Create a validated spec.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` if the message is empty or too long.
    pub fn new(message: impl Into<String>) -> Result<Self> {
        let spec = Self {
            message: message.into(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Check the schema bounds of the spec.
    ///
    /// # Errors
    ///
    /// Returns `Error::Invalid` if the message is empty or longer than
    /// [`MAX_MESSAGE_LEN`] characters.
    pub fn validate(&self) -> Result<()> {
        if self.message.is_empty() {
            return Err(Error::invalid("spec.message", "must not be empty"));
        }
        let len = self.message.chars().count();
        if len > MAX_MESSAGE_LEN {
            return Err(Error::invalid(
                "spec.message",
                format!("length {len} exceeds maximum of {MAX_MESSAGE_LEN}"),
            ));
        }
        Ok(())
    }
}

/// Lifecycle phase of an Echo.
///
/// `Unknown` holds any stored value outside the four defined phases, so a
/// corrupted status is represented rather than rejected at read time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EchoPhase {
    /// Accepted, job not created yet.
    Pending,
    /// Job created and executing.
    Running,
    /// Job finished successfully. Terminal.
    Completed,
    /// Job finished unsuccessfully. Terminal.
    Failed,
    /// Unrecognized stored value.
    Unknown(String),
}

impl EchoPhase {
    /// Parse a stored phase value.
    pub fn parse(value: &str) -> Self {
        match value {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Completed" => Self::Completed,
            "Failed" => Self::Failed,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Unknown(value) => value,
        }
    }

    /// Whether the phase admits no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EchoPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EchoPhase {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EchoPhase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

/// Condition types written to `status.conditions`.
pub mod condition_types {
    /// The Echo has been echoed successfully.
    pub const READY: &str = "Ready";
    /// The Echo is moving through its lifecycle.
    pub const PROGRESSING: &str = "Progressing";
    /// The Echo's job failed.
    pub const FAILED: &str = "Failed";
}

/// Tri-state condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A typed observation in `status.conditions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub observed_generation: i64,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

impl Condition {
    /// Build a condition observed at `now`.
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
        observed_generation: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status,
            observed_generation,
            last_transition_time: now,
            reason: reason.into(),
            message: message.into(),
        }
    }
}

/// Observed state of an Echo.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<EchoPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execution_time: Option<DateTime<Utc>>,
}

impl EchoStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Merge a condition by type.
    ///
    /// An existing condition of the same type is overwritten in place, but
    /// its `lastTransitionTime` is kept unless `status` actually changed.
    /// Returns `true` if anything changed.
    pub fn set_condition(&mut self, incoming: Condition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == incoming.condition_type)
        {
            Some(existing) => {
                let transition_time = if existing.status == incoming.status {
                    existing.last_transition_time
                } else {
                    incoming.last_transition_time
                };
                let merged = Condition {
                    last_transition_time: transition_time,
                    ..incoming
                };
                if *existing == merged {
                    false
                } else {
                    *existing = merged;
                    true
                }
            }
            None => {
                self.conditions.push(incoming);
                true
            }
        }
    }
}

/// The Echo custom resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Echo {
    pub metadata: ObjectMeta,
    pub spec: EchoSpec,
    #[serde(default)]
    pub status: EchoStatus,
}

impl Echo {
    /// Identity of this Echo.
    pub fn key(&self) -> ObjectKey {
        self.metadata.key()
    }

    /// Current phase, `None` when unobserved.
    pub fn phase(&self) -> Option<&EchoPhase> {
        self.status.phase.as_ref()
    }

    /// One-line view with the printer columns: phase, message, job, age.
    pub fn summary(&self, now: DateTime<Utc>) -> EchoSummary {
        let age = now
            .signed_duration_since(self.metadata.creation_timestamp)
            .num_seconds()
            .max(0);
        EchoSummary {
            name: self.metadata.name.clone(),
            namespace: self.metadata.namespace.clone(),
            phase: self
                .status
                .phase
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
            message: self.spec.message.clone(),
            job: self.status.job_name.clone().unwrap_or_default(),
            age_secs: age,
        }
    }
}

/// Printer-column view of an Echo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EchoSummary {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub message: String,
    pub job: String,
    pub age_secs: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
    }

    #[test]
    fn test_spec_rejects_empty_message() {
        assert!(EchoSpec::new("").is_err());
    }

    #[test]
    fn test_spec_bounds_counted_in_chars() {
        assert!(EchoSpec::new("é".repeat(MAX_MESSAGE_LEN)).is_ok());
        assert!(EchoSpec::new("x".repeat(MAX_MESSAGE_LEN + 1)).is_err());
    }

    #[test]
    fn test_phase_parse_known_and_unknown() {
        assert_eq!(EchoPhase::parse("Running"), EchoPhase::Running);
        assert_eq!(
            EchoPhase::parse("Bogus"),
            EchoPhase::Unknown("Bogus".to_string())
        );
        assert!(EchoPhase::Failed.is_terminal());
        assert!(!EchoPhase::Unknown("Completed ".to_string()).is_terminal());
    }

    #[test]
    fn test_status_wire_format() -> std::result::Result<(), serde_json::Error> {
        let status = EchoStatus {
            phase: Some(EchoPhase::Unknown("Bogus".to_string())),
            job_name: Some("echo-job-a".to_string()),
            ..EchoStatus::default()
        };
        let json = serde_json::to_value(&status)?;
        assert_eq!(json["phase"], "Bogus");
        assert_eq!(json["jobName"], "echo-job-a");
        assert!(json.get("lastExecutionTime").is_none());

        let parsed: EchoStatus = serde_json::from_value(json)?;
        assert_eq!(parsed, status);
        Ok(())
    }

    #[test]
    fn test_set_condition_keeps_transition_time_when_status_unchanged() {
        let mut status = EchoStatus::default();
        assert!(status.set_condition(Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "JobRunning",
            "",
            1,
            at(10),
        )));

        // Same status, new reason: updated in place, time preserved.
        assert!(status.set_condition(Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "JobCreated",
            "",
            1,
            at(20),
        )));
        let ready = status.condition(condition_types::READY);
        assert_eq!(ready.map(|c| c.last_transition_time), Some(at(10)));
        assert_eq!(ready.map(|c| c.reason.as_str()), Some("JobCreated"));

        // Identical re-application is a no-op.
        assert!(!status.set_condition(Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "JobCreated",
            "",
            1,
            at(30),
        )));

        // Status flip moves the transition time.
        assert!(status.set_condition(Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "JobSucceeded",
            "",
            1,
            at(40),
        )));
        assert_eq!(
            status
                .condition(condition_types::READY)
                .map(|c| c.last_transition_time),
            Some(at(40))
        );
        assert_eq!(status.conditions.len(), 1);
    }
}

//! Job model: the execution unit created for an Echo.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::types::{ECHO_KIND, Echo, ObjectKey};

/// Prefix of every derived job name.
pub const JOB_NAME_PREFIX: &str = "echo-job-";

/// DNS label limit for object names.
pub const MAX_NAME_LEN: usize = 63;

/// Hex digits of the identity hash appended to truncated names.
const HASH_SUFFIX_LEN: usize = 8;

/// Derive the job name for an Echo.
///
/// `echo-job-<name>` whenever it fits in a DNS label. Longer names are
/// truncated and suffixed with a hash of `namespace/name`, so the result is a
/// pure function of the resource identity and distinct identities sharing a
/// truncated prefix still map to distinct jobs.
pub fn job_name_for(key: &ObjectKey) -> String {
    let plain = format!("{JOB_NAME_PREFIX}{}", key.name);
    if plain.len() <= MAX_NAME_LEN {
        return plain;
    }

    let digest = format!("{:x}", Sha256::digest(key.to_string().as_bytes()));
    let suffix: String = digest.chars().take(HASH_SUFFIX_LEN).collect();
    let budget = MAX_NAME_LEN - HASH_SUFFIX_LEN - 1;

    let mut head = String::with_capacity(budget);
    for ch in plain.chars() {
        if head.len() + ch.len_utf8() > budget {
            break;
        }
        head.push(ch);
    }
    let head = head.trim_end_matches('-');
    format!("{head}-{suffix}")
}

/// Identity of the job owned by an Echo.
pub fn job_key_for(key: &ObjectKey) -> ObjectKey {
    ObjectKey::new(key.namespace.clone(), job_name_for(key))
}

/// Back-reference from a job to the Echo that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: Uuid,
    pub controller: bool,
}

impl OwnerReference {
    /// Controller reference to `echo`.
    pub fn for_echo(echo: &Echo) -> Self {
        Self {
            kind: ECHO_KIND.to_string(),
            namespace: echo.metadata.namespace.clone(),
            name: echo.metadata.name.clone(),
            uid: echo.metadata.uid,
            controller: true,
        }
    }

    /// Identity of the owner.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Template values applied to every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobTemplate {
    pub image: String,
    pub command: Vec<String>,
    pub backoff_limit: u32,
}

impl Default for JobTemplate {
    fn default() -> Self {
        Self {
            image: "busybox:1.36".to_string(),
            command: vec!["echo".to_string()],
            backoff_limit: 0,
        }
    }
}

/// Desired state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub namespace: String,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub backoff_limit: u32,
    pub owner: OwnerReference,
}

impl JobSpec {
    /// Build the job that echoes `echo.spec.message`.
    pub fn for_echo(echo: &Echo, template: &JobTemplate) -> Self {
        let key = echo.key();
        Self {
            namespace: key.namespace.clone(),
            name: job_name_for(&key),
            image: template.image.clone(),
            command: template.command.clone(),
            args: vec![echo.spec.message.clone()],
            backoff_limit: template.backoff_limit,
            owner: OwnerReference::for_echo(echo),
        }
    }

    /// Identity of the job.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

/// Execution outcome reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Scheduled or executing.
    Running,
    /// Finished with success.
    Succeeded,
    /// Finished with failure.
    Failed,
    /// No such job.
    Absent,
}

impl JobState {
    /// Whether the job has finished.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Absent => write!(f, "absent"),
        }
    }
}

//! Operator configuration.

use std::path::Path;
use std::time::Duration;

use echo_cluster::JobTemplate;
use echo_core::{Error, Result};
use echo_reconciler::{BackoffPolicy, ControllerConfig, ReconcilerConfig};
use serde::{Deserialize, Serialize};

/// Complete operator configuration, as read from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorConfig {
    #[serde(default)]
    pub controller: ControllerSection,

    #[serde(default)]
    pub job: JobSection,

    #[serde(default)]
    pub backend: BackendSection,
}

/// `[controller]`: worker pool, timeouts and retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSection {
    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Seconds between checks of a running job.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds allowed for each store or backend call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// First retry delay after a failed pass, in milliseconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling, in milliseconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Randomize retry delays.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: bool,

    /// Seconds between full resyncs, 0 to disable.
    #[serde(default)]
    pub resync_interval_secs: u64,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_secs: default_poll_interval(),
            call_timeout_secs: default_call_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            backoff_jitter: default_backoff_jitter(),
            resync_interval_secs: 0,
        }
    }
}

/// `[job]`: template for created jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSection {
    #[serde(default = "default_image")]
    pub image: String,

    /// Program and leading arguments; the message is appended.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default)]
    pub backoff_limit: u32,
}

impl Default for JobSection {
    fn default() -> Self {
        Self {
            image: default_image(),
            command: default_command(),
            backoff_limit: 0,
        }
    }
}

/// Which job backend executes jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Run each job as a local process.
    #[default]
    LocalProcess,
    /// Keep jobs in memory; they never finish on their own.
    InMemory,
}

/// `[backend]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    100
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_backoff_jitter() -> bool {
    true
}

fn default_image() -> String {
    JobTemplate::default().image
}

fn default_command() -> Vec<String> {
    JobTemplate::default().command
}

impl OperatorConfig {
    /// Load from `path`, or use defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// does not validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => echo_core::load_toml_file(path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;
        if c.workers == 0 {
            return Err(Error::invalid_config("controller.workers", "must be greater than 0"));
        }
        if c.poll_interval_secs == 0 {
            return Err(Error::invalid_config(
                "controller.poll_interval_secs",
                "must be greater than 0",
            ));
        }
        if c.call_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "controller.call_timeout_secs",
                "must be greater than 0",
            ));
        }
        if c.backoff_base_ms == 0 {
            return Err(Error::invalid_config(
                "controller.backoff_base_ms",
                "must be greater than 0",
            ));
        }
        if c.backoff_max_ms < c.backoff_base_ms {
            return Err(Error::invalid_config(
                "controller.backoff_max_ms",
                "must not be below controller.backoff_base_ms",
            ));
        }
        if self.job.command.is_empty() {
            return Err(Error::invalid_config("job.command", "must not be empty"));
        }
        Ok(())
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        echo_core::to_toml_string(self)
    }

    /// Settings for the reconcile driver.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_secs(self.controller.poll_interval_secs),
            call_timeout: Duration::from_secs(self.controller.call_timeout_secs),
            job_template: JobTemplate {
                image: self.job.image.clone(),
                command: self.job.command.clone(),
                backoff_limit: self.job.backoff_limit,
            },
        }
    }

    /// Settings for the worker pool.
    pub fn controller_config(&self) -> ControllerConfig {
        let c = &self.controller;
        ControllerConfig {
            workers: c.workers,
            backoff: BackoffPolicy {
                base: Duration::from_millis(c.backoff_base_ms),
                max: Duration::from_millis(c.backoff_max_ms),
                jitter: c.backoff_jitter,
            },
            resync_interval: (c.resync_interval_secs > 0)
                .then(|| Duration::from_secs(c.resync_interval_secs)),
        }
    }
}

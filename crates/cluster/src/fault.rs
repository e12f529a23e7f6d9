//! Fault injection for the in-memory collaborators.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};

/// Scripted failures and latency, keyed by operation name.
#[derive(Debug, Default)]
pub struct FaultInjector {
    failures: Mutex<HashMap<&'static str, u32>>,
    latency: Mutex<Option<Duration>>,
}

impl FaultInjector {
    /// Create an injector with no faults armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` calls of `operation` fail as unavailable.
    pub fn fail_next(&self, operation: &'static str, times: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(operation, times);
        }
    }

    /// Delay every call by `latency`; `None` clears it.
    pub fn set_latency(&self, latency: Option<Duration>) {
        if let Ok(mut slot) = self.latency.lock() {
            *slot = latency;
        }
    }

    /// Apply configured latency, then consume one armed failure if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::Unavailable` while failures remain armed for
    /// `operation`.
    pub async fn check(&self, operation: &'static str) -> Result<()> {
        let latency = self.latency.lock().ok().and_then(|slot| *slot);
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let armed = self
            .failures
            .lock()
            .ok()
            .and_then(|mut failures| match failures.get_mut(operation) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(())
                }
                _ => None,
            });

        match armed {
            Some(()) => Err(Error::unavailable(operation, "injected fault")),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_are_consumed() {
        let faults = FaultInjector::new();
        faults.fail_next("get", 2);

        assert!(faults.check("get").await.is_err());
        assert!(faults.check("get").await.is_err());
        assert!(faults.check("get").await.is_ok());
        assert!(faults.check("list").await.is_ok());
    }
}

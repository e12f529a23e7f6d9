//! Exponential backoff arithmetic shared by retrying components.

use std::time::Duration;

/// Calculate exponential backoff: `base_ms * 2^attempt`, capped at `max_ms`.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> u64 {
    let multiplier = 2u64.saturating_pow(attempt);
    base_ms.saturating_mul(multiplier).min(max_ms)
}

/// [`calculate_backoff`] over durations, at millisecond precision.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(calculate_backoff(attempt, base_ms, max_ms))
}

//! Deduplicating work queue of reconciliation keys.
//!
//! A key is in at most one of three places: waiting in `queue`, being
//! processed, or both processed and marked `dirty` again. Adding a key that
//! is already waiting is a no-op; adding a key that is being processed parks
//! it until [`WorkQueue::done`], so a key is never handed to two workers at
//! once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use echo_cluster::ObjectKey;
use echo_core::calculate_backoff;
use tokio::sync::Notify;
use tracing::trace;

/// Default base delay of the failure backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Default ceiling of the failure backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Per-key exponential backoff for failed passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Spread delays by up to a quarter in either direction.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            max: DEFAULT_BACKOFF_MAX,
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let capped = calculate_backoff(attempt, base_ms, max_ms);
        if !self.jitter {
            return Duration::from_millis(capped);
        }

        let spread = (capped / 4).max(1);
        let offset = rand::random::<u64>() % spread.saturating_mul(2);
        let jittered = capped.saturating_sub(spread).saturating_add(offset);
        Duration::from_millis(jittered.min(max_ms))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    failures: HashMap<ObjectKey, u32>,
    shutting_down: bool,
}

/// Work queue shared by the trigger binding and the workers.
#[derive(Debug)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

impl WorkQueue {
    /// Create an empty queue.
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `key` as needing a pass. Returns `true` if it was not already pending.
    pub fn add(&self, key: ObjectKey) -> bool {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return false;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            trace!(key = %key, "Key is being processed, parked until done");
            return true;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after its failure backoff and count the failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) -> Duration {
        let attempt = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *failures;
            *failures = failures.saturating_add(1);
            attempt
        };
        let delay = self.backoff.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The key counts as processing until [`WorkQueue::done`] is called.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Finish processing `key`, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] was called.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether no key is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `key` is currently handed out.
    pub fn is_processing(&self, key: &ObjectKey) -> bool {
        self.lock().processing.contains(key)
    }

    /// Whether nothing is waiting and nothing is being processed.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queue.is_empty() && state.processing.is_empty()
    }
}

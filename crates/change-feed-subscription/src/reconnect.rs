//! Resubscribe scheduling with exponential backoff.

use rand::Rng;
use std::time::Duration;
use timeout_coordinator::{TimeoutCoordinator, TimeoutId};
use tracing::{debug, info, warn};

/// Backoff parameters for resubscribe attempts.
///
/// `delay(attempt) = min(initial * 2^attempt + jitter, max_delay)` where
/// `jitter` is drawn uniformly from `0..=jitter_ratio * initial * 2^attempt`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
            jitter_ratio: 0.3,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay for `attempt` (zero-based), jitter included.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = compute_backoff(attempt, self.initial_delay, self.max_delay);
        with_jitter(base, self.jitter_ratio, &mut rand::thread_rng()).min(self.max_delay)
    }
}

/// Exponential backoff without jitter: `initial * 2^attempt`, capped at `max`.
///
/// | attempt | initial = 500ms |
/// |---------|-----------------|
/// | 0       | 500ms           |
/// | 1       | 1s              |
/// | 2       | 2s              |
/// | 3       | 4s              |
/// | 6+      | 30s (capped)    |
pub fn compute_backoff(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let base_ms = initial.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let multiplier = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier).min(max_ms))
}

fn with_jitter(delay: Duration, ratio: f64, rng: &mut impl Rng) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let max_jitter_ms = delay.as_millis() as f64 * ratio;
    let jitter_ms = rng.gen_range(0.0..=max_jitter_ms);
    delay + Duration::from_millis(jitter_ms as u64)
}

/// Outcome of reporting a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry was scheduled; `attempt` is one-based.
    Scheduled { attempt: u32, delay: Duration },
    /// The retry budget is spent.
    Exhausted { attempts: u32 },
}

/// Schedules resubscribe attempts for one subscription through the
/// [`TimeoutCoordinator`].
///
/// All of its timers hang off a single scope node, so shutting the manager
/// down clears any pending retry.
pub struct ReconnectionManager {
    policy: RetryPolicy,
    timeouts: TimeoutCoordinator,
    scope: TimeoutId,
    attempt: u32,
    pending: Option<TimeoutId>,
}

impl ReconnectionManager {
    pub fn new(policy: RetryPolicy, timeouts: TimeoutCoordinator, label: &str) -> Self {
        let scope = TimeoutId::generate(&format!("reconnect:{label}"));
        timeouts.register_scope(scope.clone(), None);
        Self {
            policy,
            timeouts,
            scope,
            attempt: 0,
            pending: None,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries scheduled since the last success or reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn has_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|id| self.timeouts.contains(id))
    }

    /// Record a failure and schedule `retry`, unless the budget is spent.
    pub fn on_failure<F>(&mut self, retry: F) -> RetryDecision
    where
        F: FnOnce() + Send + 'static,
    {
        if self.attempt >= self.policy.max_attempts {
            warn!(attempts = self.attempt, "Max reconnect attempts reached");
            self.cancel_pending();
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }

        self.cancel_pending();
        let delay = self.policy.delay_for(self.attempt);
        // The scope node may have been cleared by a coordinator-wide shutdown
        if !self.timeouts.contains(&self.scope) {
            self.timeouts.register_scope(self.scope.clone(), None);
        }
        let id = self.timeouts.start_timeout(delay, retry, Some(&self.scope));
        self.pending = Some(id);
        self.attempt += 1;

        info!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling resubscribe"
        );
        RetryDecision::Scheduled {
            attempt: self.attempt,
            delay,
        }
    }

    /// A subscribe succeeded: reset the sequence.
    pub fn on_success(&mut self) {
        if self.attempt > 0 {
            debug!(attempts = self.attempt, "Resubscribed; resetting backoff");
        }
        self.reset();
    }

    /// Start a fresh retry sequence.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.cancel_pending();
    }

    /// Cancel the scheduled retry, if any.
    pub fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(id) => self.timeouts.clear(&id) > 0,
            None => false,
        }
    }

    /// Clear every timer this manager owns.
    pub fn shutdown(&mut self) {
        self.pending = None;
        self.timeouts.clear_subtree(&self.scope);
    }
}

impl Drop for ReconnectionManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReconnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconnectionManager")
            .field("attempt", &self.attempt)
            .field("pending", &self.pending)
            .finish()
    }
}

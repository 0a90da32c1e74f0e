//! Reconnection policy and the scheduled retry attempt.
//!
//! Backoff is linear with a cap, not exponential:
//!
//! ```text
//! delay = min(base_delay * attempt, max_delay)    attempt = 1, 2, ...
//! ```
//!
//! A scheduled attempt is a one-shot deferred task wrapped in a cancellable
//! handle, decoupled from any specific timer primitive: dropping or
//! cancelling the handle aborts the pending attempt.

// ============================================================================
// Imports
// ============================================================================

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

// ============================================================================
// Constants
// ============================================================================

/// Default delay before the first reconnect attempt.
const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(1000);

/// Default cap on the reconnect delay.
const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(5000);

/// Default maximum number of automatic reconnect attempts.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

// ============================================================================
// ReconnectPolicy
// ============================================================================

/// Reconnection policy.
///
/// With the defaults (base 1000 ms, cap 5000 ms), attempts 1..=5 wait
/// 1000, 2000, 3000, 4000, 5000 milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Whether automatic reconnection is armed after an unexpected close.
    pub enabled: bool,

    /// Delay for the first attempt; scales linearly with the attempt number.
    pub base_delay: Duration,

    /// Upper bound on the delay.
    pub max_delay: Duration,

    /// Attempts stop once the counter reaches this value; the caller must
    /// then reconnect manually.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl ReconnectPolicy {
    /// Creates the default policy.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            enabled: true,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Creates a policy with automatic reconnection turned off.
    #[inline]
    #[must_use]
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

// ============================================================================
// Builder Methods
// ============================================================================

impl ReconnectPolicy {
    /// Sets the base delay.
    #[inline]
    #[must_use]
    pub const fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay cap.
    #[inline]
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Sets the maximum attempt count.
    #[inline]
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

// ============================================================================
// Backoff Computation
// ============================================================================

impl ReconnectPolicy {
    /// Returns the delay before the given attempt.
    ///
    /// Attempt numbers start at 1 for the first retry; 0 is clamped up.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(attempt.max(1))
            .min(self.max_delay)
    }
}

// ============================================================================
// ScheduledAttempt
// ============================================================================

/// A pending one-shot reconnect attempt.
///
/// Wraps the runtime timer in a handle that can be cancelled; cancellation
/// (or drop) aborts the timer so the attempt never fires. The connection
/// manager holds at most one of these, which keeps two reconnection cycles
/// from running concurrently.
#[derive(Debug)]
pub(crate) struct ScheduledAttempt {
    handle: JoinHandle<()>,
}

impl ScheduledAttempt {
    /// Arms a deferred attempt: after `delay`, `fire` runs once.
    pub(crate) fn schedule<F>(delay: Duration, fire: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fire.await;
        });
        Self { handle }
    }

    /// Cancels the pending attempt.
    pub(crate) fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledAttempt {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================

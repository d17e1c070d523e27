//! Per-request retry policies ("tutors").
//!
//! Every control request is paired with a tutor that decides whether and
//! when to resend it after a transport failure or a response timeout.
//! Retries are always driven by the tutor's timing, never by busy-waiting.

// ============================================================================
// Imports
// ============================================================================

use std::fmt::Debug;
use std::time::Duration;

// ============================================================================
// Tutor Trait
// ============================================================================

/// Retry/backoff policy attached to one pending control request.
pub trait Tutor: Send + Debug {
    /// Notifies the tutor about the fate of the current physical attempt.
    ///
    /// `retry_needed = false` means the transport confirmed the request left
    /// the client and no early retransmission is required; `true` means the
    /// attempt failed before a response could be read.
    fn notify_sender(&mut self, retry_needed: bool);

    /// Consumes one retry attempt. Returns `false` when the policy is
    /// exhausted or the request was discarded.
    fn should_retry(&mut self) -> bool;

    /// Delay to wait before the next retransmission (or before declaring the
    /// current attempt timed out).
    fn retry_delay(&self) -> Duration;

    /// Abandons the request permanently.
    fn discard(&mut self);

    /// Attempts performed so far, including the first transmission.
    fn attempts(&self) -> u32;
}

// ============================================================================
// BackoffTutor
// ============================================================================

/// Default number of transmissions, including the first.
const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default delay before the first retransmission.
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Default ceiling for exponential backoff growth.
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Exponential-backoff tutor with a bounded attempt count.
#[derive(Debug)]
pub struct BackoffTutor {
    attempts: u32,
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    discarded: bool,
}

impl BackoffTutor {
    /// Creates a tutor with explicit bounds.
    #[must_use]
    pub fn new(max_attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            attempts: 1,
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff,
            discarded: false,
        }
    }
}

impl Default for BackoffTutor {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            DEFAULT_INITIAL_BACKOFF,
            DEFAULT_MAX_BACKOFF,
        )
    }
}

impl Tutor for BackoffTutor {
    fn notify_sender(&mut self, retry_needed: bool) {
        // The decision is taken in should_retry; the notification only
        // matters for policies that distinguish confirmed sends.
        let _ = retry_needed;
    }

    fn should_retry(&mut self) -> bool {
        if self.discarded || self.attempts >= self.max_attempts {
            return false;
        }
        self.attempts += 1;
        true
    }

    fn retry_delay(&self) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..self.attempts {
            delay = delay.saturating_mul(2).min(self.max_backoff);
        }
        delay
    }

    fn discard(&mut self) {
        self.discarded = true;
    }

    fn attempts(&self) -> u32 {
        self.attempts
    }
}

// ============================================================================
// FireAndForgetTutor
// ============================================================================

/// Tutor for requests that must never be retransmitted, such as reverse
/// heartbeats: a lost heartbeat is simply replaced by the next scheduled one.
#[derive(Debug, Default)]
pub struct FireAndForgetTutor {
    discarded: bool,
}

impl Tutor for FireAndForgetTutor {
    fn notify_sender(&mut self, _retry_needed: bool) {}

    fn should_retry(&mut self) -> bool {
        false
    }

    fn retry_delay(&self) -> Duration {
        DEFAULT_INITIAL_BACKOFF
    }

    fn discard(&mut self) {
        self.discarded = true;
    }

    fn attempts(&self) -> u32 {
        1
    }
}

// ============================================================================
// Tests
// ============================================================================

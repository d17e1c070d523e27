//! Reverse-heartbeat scheduling.
//!
//! When the configured interval is non-zero, the client must send a
//! heartbeat control request whenever no other request has gone out for one
//! interval, so intermediaries never see the upstream direction as idle.
//! The timer here only computes deadlines; the session engine owns the
//! single `sleep_until` that waits on them and sends the actual request.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

// ============================================================================
// ReverseHeartbeatTimer
// ============================================================================

/// Schedules reverse heartbeats relative to the last outbound request.
///
/// An interval of zero disables the timer entirely. Interval changes take
/// effect without bursts: the next deadline is recomputed from the last
/// outbound send and never moved into the past by more than "fire now".
#[derive(Debug)]
pub struct ReverseHeartbeatTimer {
    /// Interval requested by configuration; the effective interval never
    /// exceeds this, so the upstream direction is never idle longer than
    /// the application asked for.
    configured: Duration,
    /// Effective interval currently in force; zero = disabled.
    interval: Duration,
    /// When the last outbound request (of any kind) was handed to the
    /// transport.
    last_send: Instant,
}

impl ReverseHeartbeatTimer {
    /// Creates a timer with the configured interval in milliseconds;
    /// 0 disables it.
    #[must_use]
    pub fn new(configured_ms: u64) -> Self {
        let configured = Duration::from_millis(configured_ms);
        Self {
            configured,
            interval: configured,
            last_send: Instant::now(),
        }
    }

    /// Returns `true` when heartbeats are currently enabled.
    #[inline]
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Effective interval currently in force.
    #[inline]
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Records an outbound request; the idle countdown restarts.
    pub fn on_traffic(&mut self, now: Instant) {
        self.last_send = now;
    }

    /// Applies a server-granted interval, clamped so the effective interval
    /// never exceeds the configured one: the server may tighten the idle
    /// bound, never loosen it.
    ///
    /// The pending deadline is rescheduled relative to the last send at
    /// `max(0, remaining)`: a shorter interval whose deadline already passed
    /// fires once immediately, without a burst, and a change back up takes
    /// effect without an extra early wake-up.
    pub fn on_change_interval(&mut self, granted_ms: u64) {
        let granted = Duration::from_millis(granted_ms);
        let effective = if self.configured.is_zero() {
            // disabled by configuration, whatever the server says
            Duration::ZERO
        } else if granted.is_zero() {
            // the server imposes no bound of its own
            self.configured
        } else {
            granted.min(self.configured)
        };
        if effective != self.interval {
            debug!(
                old_ms = self.interval.as_millis() as u64,
                new_ms = effective.as_millis() as u64,
                "reverse heartbeat interval changed"
            );
            self.interval = effective;
        }
    }

    /// Instant at which the next heartbeat is due, or `None` when disabled.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.is_enabled().then(|| self.last_send + self.interval)
    }

    /// The engine's timer fired at `now`.
    ///
    /// Returns `true` when a heartbeat request should go out; `false` when
    /// other traffic already covered the interval (the engine re-arms on the
    /// new deadline).
    pub fn on_fire(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.last_send = now;
                true
            }
            _ => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timer_has_no_deadline() {
        let timer = ReverseHeartbeatTimer::new(0);
        assert!(!timer.is_enabled());
        assert!(timer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_after_idle_interval() {
        let mut timer = ReverseHeartbeatTimer::new(1000);
        let start = Instant::now();
        timer.on_traffic(start);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(timer.on_fire(Instant::now()));
        // firing restarts the countdown
        assert_eq!(timer.deadline(), Some(Instant::now() + Duration::from_millis(1000)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_resets_countdown() {
        let mut timer = ReverseHeartbeatTimer::new(1000);
        timer.on_traffic(Instant::now());

        tokio::time::advance(Duration::from_millis(600)).await;
        timer.on_traffic(Instant::now());

        tokio::time::advance(Duration::from_millis(600)).await;
        // only 600ms idle since the last send: stale wake-up, no heartbeat
        assert!(!timer.on_fire(Instant::now()));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(timer.on_fire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_interval_never_exceeds_configured() {
        let mut timer = ReverseHeartbeatTimer::new(1000);
        timer.on_traffic(Instant::now());

        // a huge server keepalive must not stretch the idle bound
        timer.on_change_interval(3_600_000);
        assert_eq!(timer.interval(), Duration::from_millis(1000));

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(timer.on_fire(Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_may_tighten_the_interval() {
        let mut timer = ReverseHeartbeatTimer::new(5000);
        timer.on_change_interval(1000);
        assert_eq!(timer.interval(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_downward_change_reschedules_pending_deadline() {
        let mut timer = ReverseHeartbeatTimer::new(5000);
        timer.on_traffic(Instant::now());

        tokio::time::advance(Duration::from_millis(900)).await;
        // mid-countdown tightening: deadline moves to last_send + 1000
        timer.on_change_interval(1000);
        assert!(!timer.on_fire(Instant::now()));
        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(timer.on_fire(Instant::now()));

        // tightening past an already-elapsed deadline fires once, now
        tokio::time::advance(Duration::from_millis(2000)).await;
        timer.on_change_interval(500);
        assert!(timer.on_fire(Instant::now()));
        assert_eq!(timer.deadline(), Some(Instant::now() + Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_configured_zero_stays_disabled() {
        let mut timer = ReverseHeartbeatTimer::new(0);
        timer.on_change_interval(3000);
        assert!(!timer.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_zero_keeps_configured_interval() {
        let mut timer = ReverseHeartbeatTimer::new(1000);
        timer.on_change_interval(0);
        assert!(timer.is_enabled());
        assert_eq!(timer.interval(), Duration::from_millis(1000));
    }
}

// Link-health timers: the liveness monitor and the reconnect backoff.
//
// `LivenessMonitor` answers one question for the session loops: has it been
// longer than `interval` since the peer last proved it was alive? The server
// confirms when a `PING` is answered with `OK`; the client confirms when it
// answers the server's `PING` or gets `ok` back for its own `ping`. The
// session loops also use `time_until_due` to bound how long they block
// waiting for inbound frames, so a due probe is never delayed by an idle
// link.
//
// `BackoffPolicy` spaces out the client's reconnect attempts
// (initial * 2^(attempt-1), capped at `max_delay`) and bounds how many
// consecutive attempts are made before the link is declared down.

use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct LivenessMonitor {
    interval: Duration,
    last_confirmed: Instant,
}

impl LivenessMonitor {
    /// Start a monitor whose first probe falls due `interval` after `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            last_confirmed: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_confirmed) >= self.interval
    }

    /// Zero when a probe is already due.
    pub fn time_until_due(&self, now: Instant) -> Duration {
        (self.last_confirmed + self.interval).saturating_duration_since(now)
    }

    pub fn confirm(&mut self, now: Instant) {
        self.last_confirmed = now;
    }

    pub fn last_confirmed(&self) -> Instant {
        self.last_confirmed
    }
}

/// Bounded exponential backoff for reconnect attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the 1-based `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << doublings)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// True once `attempt` exceeds the retry budget.
    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_retries
    }
}

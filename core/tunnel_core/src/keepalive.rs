//! Keep-alive supervision
//!
//! The remote server sends SERVER_KEEPALIVE packets; every packet it sends
//! refreshes the session's last-activity clock. The supervisor checks that
//! clock on a fixed interval once the session reaches `AwaitingDummyAck`:
//!
//! ```text
//! armed ──(every interval)──► check
//!                               │ first check, nothing heard → alive
//!                               │ now - last ≤ timeout       → alive
//!                               └ now - last > timeout       → timed out (disarm)
//! ```
//!
//! Until the server has sent anything, silence is measured from the moment
//! the supervisor was armed.

use std::time::{Duration, Instant};

/// Result of a supervisor check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveVerdict {
    /// No check was due
    NotDue,
    /// Check ran and the path is alive
    Alive,
    /// Silence exceeded the timeout; fires once
    TimedOut { silent_for: Duration },
}

#[derive(Debug)]
pub struct KeepAliveSupervisor {
    interval: Duration,
    timeout: Duration,
    /// Next scheduled check (None while disarmed)
    next_check: Option<Instant>,
    /// When supervision started; stands in for activity until the first packet
    armed_at: Option<Instant>,
    first_check_done: bool,
}

impl KeepAliveSupervisor {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            next_check: None,
            armed_at: None,
            first_check_done: false,
        }
    }

    /// Start periodic checks; the first one runs one interval from `now`
    pub fn arm(&mut self, now: Instant) {
        if self.next_check.is_none() {
            self.next_check = Some(now + self.interval);
            self.armed_at = Some(now);
            self.first_check_done = false;
        }
    }

    pub fn disarm(&mut self) {
        self.next_check = None;
        self.armed_at = None;
    }

    pub fn is_armed(&self) -> bool {
        self.next_check.is_some()
    }

    /// When the next check is due, for poll timeout calculation
    pub fn deadline(&self) -> Option<Instant> {
        self.next_check
    }

    /// Run the check if due
    pub fn poll(&mut self, now: Instant, last_activity: Option<Instant>) -> KeepAliveVerdict {
        let due = match self.next_check {
            Some(at) => at,
            None => return KeepAliveVerdict::NotDue,
        };
        if now < due {
            return KeepAliveVerdict::NotDue;
        }

        let first_check = !self.first_check_done;
        self.first_check_done = true;

        let last = match (last_activity, self.armed_at) {
            (Some(t), _) => t,
            // Nothing heard from the server yet; only the first check lets it pass
            (None, Some(armed_at)) if !first_check => armed_at,
            (None, _) => {
                self.next_check = Some(now + self.interval);
                return KeepAliveVerdict::Alive;
            }
        };

        let silent_for = now.saturating_duration_since(last);
        if silent_for > self.timeout {
            self.disarm();
            return KeepAliveVerdict::TimedOut { silent_for };
        }

        self.next_check = Some(now + self.interval);
        KeepAliveVerdict::Alive
    }
}

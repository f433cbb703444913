//! Bounded reconnect/retry bookkeeping for session-owning backends.
//!
//! FTP and SFTP hold one long-lived session that can die under the
//! connector at any time. Every operation on those backends consults a
//! [`RetryState`]: a countdown seeded from the configured maximum,
//! decremented on each transient failure. A countdown below the maximum is
//! a staleness signal (the previous call saw trouble) and makes the next
//! operation reconnect eagerly before touching the wire.
//!
//! The countdown has exactly one reset point: a successfully completed
//! operation. Exhaustion does not reset it; a later call still gets a
//! fresh connection attempt because exhaustion is only consulted when
//! deciding whether to retry after a *new* failure.

use std::fmt;

/// Session lifecycle phase, tracked for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connected => f.write_str("connected"),
            SessionState::Disconnected => f.write_str("disconnected"),
            SessionState::Reconnecting => f.write_str("reconnecting"),
        }
    }
}

/// Retry budget for one connector instance.
#[derive(Debug, Clone)]
pub struct RetryState {
    max: i32,
    countdown: i32,
}

impl RetryState {
    /// Negative configured maxima are treated as zero retries.
    pub fn new(max_retries: i32) -> Self {
        let max = max_retries.max(0);
        Self {
            max,
            countdown: max,
        }
    }

    /// True when an earlier failure left the budget below its maximum;
    /// the session should be re-established before the next operation.
    pub fn stale(&self) -> bool {
        self.countdown < self.max
    }

    /// Record a transient failure. Returns whether the budget still allows
    /// another attempt.
    pub fn on_transient_failure(&mut self) -> bool {
        self.countdown -= 1;
        self.countdown >= 0
    }

    /// Sole reset point: called after an operation completes against a
    /// healthy session.
    pub fn reset(&mut self) {
        self.countdown = self.max;
    }

    /// Attempts consumed since the last reset.
    pub fn used(&self) -> i32 {
        self.max - self.countdown
    }

    pub fn max_retries(&self) -> i32 {
        self.max
    }
}

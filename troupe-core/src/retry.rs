// ABOUTME: Retry policy for the conductor submission call
// ABOUTME: Pure function of (error class, attempt number) — no clocks, no network

use std::time::Duration;

/// How a failed outbound call is classified. Only genuinely transient
/// transport faults are retry candidates; everything else is a definitive
/// answer from the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The attempt timed out
    Timeout,
    /// Connection refused / reset / unreachable
    Connection,
    /// The conductor answered with a non-success status
    Rejected,
    /// The platform refused on authorization grounds
    Permission,
    /// The referenced resource does not exist
    NotFound,
}

impl ErrorClass {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Connection)
    }
}

/// Bounded fixed-delay retry. The human is waiting synchronously in the
/// channel, so total wait stays tightly bounded instead of growing an
/// exponential tail.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Per-attempt timeout handed to the transport
    pub attempt_timeout: Duration,
    /// Fixed pause between attempts
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(60),
            retry_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Decide what follows a failed attempt (1-based). `Some(delay)` means
    /// wait and try again; `None` means the failure is terminal.
    pub fn next_delay(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        if !class.is_transient() {
            return None;
        }
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.retry_delay)
    }

    /// Upper bound on wall-clock time a full submission can take
    pub fn worst_case(&self) -> Duration {
        self.attempt_timeout * self.max_attempts
            + self.retry_delay * self.max_attempts.saturating_sub(1)
    }
}

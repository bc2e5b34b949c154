use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::GenerateError;

/// Upper bound (exclusive) of the uniform jitter added to backoff delays.
pub const JITTER_RANGE: f64 = 0.5;

/// Retry tuning for one streaming task. The whole policy is a pure function
/// of (error, attempt, jitter) so it can be exercised without a transport.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: f64,
    pub max_backoff: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: 1.5,
            max_backoff: 10.0,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt may be scheduled after `attempt` (0-indexed)
    /// failed with `error`.
    pub fn should_retry(&self, attempt: u32, error: &GenerateError) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    /// Delay before the next attempt. A numeric Retry-After carried by the
    /// failed response is honored exactly; otherwise exponential backoff plus
    /// the caller-supplied jitter, capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32, error: &GenerateError, jitter: f64) -> Duration {
        if let Some(secs) = error.retry_after() {
            return Duration::from_secs_f64(secs.max(0.0));
        }
        let delay = (self.base_backoff.powi(attempt as i32) + jitter).min(self.max_backoff);
        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Map a response status (plus its Retry-After header) onto the error
/// taxonomy. Returns `None` for success statuses.
pub fn classify_status(status: u16, retry_after: Option<&str>) -> Option<GenerateError> {
    match status {
        200..=299 => None,
        429 => Some(GenerateError::RateLimited {
            retry_after: parse_retry_after(retry_after),
        }),
        500..=599 => Some(GenerateError::Server {
            status,
            retry_after: parse_retry_after(retry_after),
        }),
        _ => Some(GenerateError::Fatal(format!(
            "generation endpoint returned status {status}"
        ))),
    }
}

// Only all-digit values are honored; HTTP-date forms fall through to backoff.
fn parse_retry_after(header: Option<&str>) -> Option<f64> {
    let raw = header?.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

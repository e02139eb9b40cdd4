//! One retry strategy for everything that retries: a capped exponential
//! schedule with an overall deadline, and a transient-failure classifier
//! over the hub error taxonomy. Control-plane calls run the schedule on
//! transient failures only; chunk downloads run it on any failure. Chunk
//! uploads deliberately do not come here at all — they draw on the shared
//! attempt budget in the transfer driver instead, with no backoff.

use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;

use crate::error::{as_hub_error, HubError};

const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Capped exponential delay schedule with an overall deadline. `next_delay`
/// returns `None` once the deadline has passed, at which point the caller
/// gives up with its last error.
pub struct ExponentialBackoff {
    delay: Duration,
    max_delay: Duration,
    deadline: Instant,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_delay: Duration, max_elapsed: Duration) -> Self {
        Self {
            delay: initial,
            max_delay,
            deadline: Instant::now() + max_elapsed,
        }
    }

    /// Short schedule for small idempotent API calls: a few quick attempts,
    /// then the failure belongs to the caller.
    pub fn brief() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
    }

    pub fn next_delay(&mut self) -> Option<Duration> {
        if Instant::now() >= self.deadline {
            return None;
        }
        let delay = self.delay;
        self.delay = self.delay.mul_f64(BACKOFF_MULTIPLIER).min(self.max_delay);
        Some(delay)
    }
}

impl Default for ExponentialBackoff {
    /// Long-haul schedule used by chunk downloads: keep a stuck chunk alive
    /// for a while before the pull as a whole fails.
    fn default() -> Self {
        Self::new(
            Duration::from_millis(500),
            Duration::from_secs(60),
            Duration::from_secs(15 * 60),
        )
    }
}

/// Whether a failed exchange is worth repeating: connection-level trouble,
/// or a status the server hands out when it is overloaded rather than when
/// the request is wrong. Conflicts, permission errors and digest mismatches
/// never become right by asking again.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(hub) = as_hub_error(err) {
        return match hub {
            HubError::Network(_) => true,
            HubError::Http { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        };
    }
    err.chain()
        .find_map(|cause| cause.downcast_ref::<reqwest::Error>())
        .map(|e| e.is_timeout() || e.is_connect())
        .unwrap_or(false)
}

/// Drives `attempt` until it succeeds, `should_retry` declines the error,
/// or the schedule's deadline runs out. Each attempt rebuilds its request
/// from scratch, so bodies are never replayed mid-stream.
pub async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    mut schedule: ExponentialBackoff,
    mut should_retry: impl FnMut(&anyhow::Error) -> bool,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut tries = 0u32;
    loop {
        tries += 1;
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let delay = if should_retry(&err) {
            schedule.next_delay()
        } else {
            None
        };
        match delay {
            Some(delay) => {
                tracing::debug!(operation, tries, error = %err, "retrying");
                sleep(delay).await;
            }
            None if tries > 1 => {
                return Err(err.context(format!("{operation} failed after {tries} attempts")))
            }
            None => return Err(err.context(format!("{operation} failed"))),
        }
    }
}

//! Fibonacci backoff shared by the agent client, the snapshot saver and
//! the relational schema initialisation.

use std::future::Future;
use std::time::Duration;

/// Delay before the first retry.
pub const DEFAULT_START: Duration = Duration::from_secs(1);
/// Upper bound for any single delay.
pub const DEFAULT_CAP: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_RETRIES: u32 = 4;

/// Iterator over retry delays: `start, 2*start, 3*start, 5*start, ...`,
/// each capped, ending after `max_retries` items.
///
/// ```
/// use std::time::Duration;
/// use pulsemon_common::retry::Backoff;
///
/// let delays: Vec<_> = Backoff::fibonacci(Duration::from_millis(100), Duration::from_millis(250), 5).collect();
/// assert_eq!(
///     delays,
///     [100, 200, 250, 250, 250].map(Duration::from_millis).to_vec()
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    next: Duration,
    cap: Duration,
    remaining: u32,
}

impl Backoff {
    pub fn fibonacci(start: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            current: start,
            next: start * 2,
            cap,
            remaining: max_retries,
        }
    }

    /// No retries at all; the operation runs once.
    pub fn none() -> Self {
        Self::fibonacci(Duration::ZERO, Duration::ZERO, 0)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::fibonacci(DEFAULT_START, DEFAULT_CAP, DEFAULT_MAX_RETRIES)
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let delay = self.current.min(self.cap);
        let sum = self.current.saturating_add(self.next);
        self.current = self.next;
        self.next = sum;
        Some(delay)
    }
}

/// Runs `op` until it succeeds or the backoff is exhausted, sleeping between
/// attempts. Each failed attempt that will be retried is logged at warn.
pub async fn retry<T, E, F, Fut>(what: &str, backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delays = backoff;
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => match delays.next() {
                Some(delay) => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(e),
            },
        }
    }
}

/// Blocking counterpart of [`retry`] for synchronous callers. Does not log.
pub fn retry_blocking<T, E, F>(backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut delays = backoff;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) => match delays.next() {
                Some(delay) => std::thread::sleep(delay),
                None => return Err(e),
            },
        }
    }
}

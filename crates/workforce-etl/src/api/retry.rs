use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Exponential backoff shared by every HTTP call the client makes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts allowed after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Outcome of a single failed attempt, as judged by the caller.
#[derive(Debug)]
pub enum Attempt<E> {
    Retry { error: E, after: Option<Duration> },
    Abort(E),
}

#[derive(Debug)]
pub enum RetryFailure<E> {
    Exhausted { attempts: u32, last: E },
    Aborted(E),
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2,
        }
    }

    pub fn is_retryable_status(status: u16) -> bool {
        status == 429 || (500..600).contains(&status)
    }

    /// Delay before retry number `retry` (zero based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).saturating_pow(retry);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `op` until it succeeds, aborts, or the retry budget is spent.
    /// `op` receives the zero-based attempt number.
    pub fn run<T, E, F>(&self, clock: &dyn Clock, mut op: F) -> Result<T, RetryFailure<E>>
    where
        E: Display,
        F: FnMut(u32) -> Result<T, Attempt<E>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(Attempt::Abort(error)) => return Err(RetryFailure::Aborted(error)),
                Err(Attempt::Retry { error, after }) => {
                    if attempt >= self.max_retries {
                        return Err(RetryFailure::Exhausted {
                            attempts: attempt + 1,
                            last: error,
                        });
                    }
                    let delay = after
                        .map(|hint| hint.min(self.max_delay))
                        .unwrap_or_else(|| self.delay_for(attempt));
                    tracing::warn!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying request"
                    );
                    clock.sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Reads a `Retry-After` value given either as seconds or as an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or(Duration::ZERO))
}

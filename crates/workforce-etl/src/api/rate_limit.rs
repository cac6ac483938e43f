use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::clock::Clock;

const MAX_BACKOFF_MULTIPLIER: u32 = 8;

/// Sliding-window limiter for outbound API calls.
///
/// At most `max_calls` are let through in any window of `window` length. Errors
/// widen the window by doubling a backoff multiplier; successes halve it again
/// until it is back to 1.
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

#[derive(Debug)]
struct LimiterState {
    calls: VecDeque<Instant>,
    multiplier: u32,
}

impl RateLimiter {
    pub fn new(max_calls: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_calls: max_calls.max(1) as usize,
            window,
            clock,
            state: Mutex::new(LimiterState {
                calls: VecDeque::new(),
                multiplier: 1,
            }),
        }
    }

    pub fn per_minute(max_calls: u32, clock: Arc<dyn Clock>) -> Self {
        Self::new(max_calls, Duration::from_secs(60), clock)
    }

    /// Blocks until one more call fits in the window, then records it.
    /// Returns how long the caller was held back.
    pub fn wait_if_needed(&self) -> Duration {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut waited = Duration::ZERO;
        loop {
            let now = self.clock.now();
            let window = self.window * state.multiplier;
            while let Some(oldest) = state.calls.front() {
                if now.duration_since(*oldest) >= window {
                    state.calls.pop_front();
                } else {
                    break;
                }
            }

            if state.calls.len() < self.max_calls {
                state.calls.push_back(now);
                if !waited.is_zero() {
                    tracing::debug!(waited_ms = waited.as_millis() as u64, "rate limiter released call");
                }
                return waited;
            }

            let oldest = state.calls.front().copied().unwrap_or(now);
            let pause = window.saturating_sub(now.duration_since(oldest));
            self.clock.sleep(pause);
            waited += pause;
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.multiplier = (state.multiplier / 2).max(1);
    }

    pub fn record_error(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.multiplier = (state.multiplier * 2).min(MAX_BACKOFF_MULTIPLIER);
    }

    pub fn backoff_multiplier(&self) -> u32 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .multiplier
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_calls", &self.max_calls)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn manual() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[test]
    fn never_exceeds_ceiling_in_any_rolling_window() {
        let clock = manual();
        let limiter = RateLimiter::per_minute(5, clock.clone());
        let mut stamps = Vec::new();

        for i in 0..23 {
            limiter.wait_if_needed();
            stamps.push(clock.elapsed());
            clock.advance(Duration::from_millis(1_500 + (i % 4) * 700));
        }

        for (i, start) in stamps.iter().enumerate() {
            let in_window = stamps[i..]
                .iter()
                .take_while(|stamp| **stamp - *start < Duration::from_secs(60))
                .count();
            assert!(in_window <= 5, "{in_window} calls within 60s of {start:?}");
        }
    }

    #[test]
    fn full_window_blocks_until_oldest_call_expires() {
        let clock = manual();
        let limiter = RateLimiter::per_minute(2, clock.clone());

        assert_eq!(limiter.wait_if_needed(), Duration::ZERO);
        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.wait_if_needed(), Duration::ZERO);
        assert_eq!(limiter.wait_if_needed(), Duration::from_secs(50));
        assert_eq!(clock.elapsed(), Duration::from_secs(60));
    }

    #[test]
    fn errors_widen_the_window_and_successes_decay_it() {
        let clock = manual();
        let limiter = RateLimiter::per_minute(1, clock.clone());

        limiter.record_error();
        limiter.record_error();
        assert_eq!(limiter.backoff_multiplier(), 4);
        for _ in 0..5 {
            limiter.record_error();
        }
        assert_eq!(limiter.backoff_multiplier(), MAX_BACKOFF_MULTIPLIER);

        limiter.wait_if_needed();
        assert_eq!(limiter.wait_if_needed(), Duration::from_secs(480));

        for _ in 0..4 {
            limiter.record_success();
        }
        assert_eq!(limiter.backoff_multiplier(), 1);
    }
}

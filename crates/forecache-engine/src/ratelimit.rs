//! Admission rate limiting for task queues
//!
//! A token bucket holding `cap` tokens that refills at `cap` tokens per
//! `interval`. Each task admission consumes one token, so at most `cap`
//! tasks start within any interval after the initial burst.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Scale factor for sub-token precision
const SCALE: u64 = 1000;

/// Shortest wait between two acquisition attempts
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Token bucket limiting admissions per interval
#[derive(Debug)]
pub struct RateLimiter {
    /// Current token count, scaled
    tokens: AtomicU64,
    /// Bucket capacity, scaled
    max_tokens: u64,
    /// Refill window in microseconds
    interval_us: u64,
    last_refill: Mutex<Instant>,
}

impl RateLimiter {
    /// `cap` admissions per `interval`. Returns `None` when either is zero
    /// (unlimited).
    #[must_use]
    pub fn new(cap: u64, interval: Duration) -> Option<Self> {
        let interval_us = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
        if cap == 0 || interval_us == 0 {
            return None;
        }
        Some(Self {
            tokens: AtomicU64::new(cap * SCALE),
            max_tokens: cap * SCALE,
            interval_us,
            last_refill: Mutex::new(Instant::now()),
        })
    }

    /// Take one token if available
    pub fn try_acquire(&self) -> bool {
        self.refill();

        loop {
            let current = self.tokens.load(Ordering::Relaxed);
            if current < SCALE {
                return false;
            }
            if self
                .tokens
                .compare_exchange_weak(current, current - SCALE, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Wait until a token is available and take it
    pub async fn acquire(&self) {
        while !self.try_acquire() {
            tokio::time::sleep(self.time_to_next_token()).await;
        }
    }

    /// Whole tokens currently available
    pub fn available(&self) -> u64 {
        self.refill();
        self.tokens.load(Ordering::Relaxed) / SCALE
    }

    fn time_to_next_token(&self) -> Duration {
        let current = self.tokens.load(Ordering::Relaxed);
        let missing = SCALE.saturating_sub(current);
        let wait_us = u128::from(missing) * u128::from(self.interval_us) / u128::from(self.max_tokens);
        Duration::from_micros(u64::try_from(wait_us).unwrap_or(u64::MAX)).max(MIN_WAIT)
    }

    fn refill(&self) {
        let mut last = self.last_refill.lock();
        let now = Instant::now();
        let elapsed_us = u128::from(
            u64::try_from(now.duration_since(*last).as_micros()).unwrap_or(u64::MAX),
        );

        let new_tokens = elapsed_us * u128::from(self.max_tokens) / u128::from(self.interval_us);
        let new_tokens = u64::try_from(new_tokens).unwrap_or(u64::MAX);

        if new_tokens > 0 {
            let current = self.tokens.load(Ordering::Relaxed);
            let new_value = current.saturating_add(new_tokens).min(self.max_tokens);
            self.tokens.store(new_value, Ordering::Relaxed);
            *last = now;
        }
    }
}

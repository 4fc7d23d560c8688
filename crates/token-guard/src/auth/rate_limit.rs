//! Sliding-window limiter for outbound JWKS fetches.
//!
//! Every permit granted is remembered for one window. A fetch is allowed
//! only while fewer than `max_fetches` permits were granted in the trailing
//! window, so no burst pattern can exceed the budget in any window-sized
//! interval.
//!
//! Time is read from `tokio::time`, so tests can drive the window with a
//! paused clock.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Fetches allowed per window when none are configured.
pub const DEFAULT_FETCHES_PER_MINUTE: u32 = 5;

/// Length of the default window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Largest per-minute budget accepted from configuration.
pub const MAX_FETCHES_PER_MINUTE: u32 = 600;

/// The grant log grows on demand past this many entries.
const INITIAL_LOG_CAPACITY: u32 = 16;

/// Bounds JWKS fetches to `max_fetches` per trailing `window`.
#[derive(Debug)]
pub struct FetchRateLimiter {
    max_fetches: u32,
    window: Duration,
    /// Grant times inside the current window, oldest first.
    granted: Mutex<VecDeque<Instant>>,
}

impl FetchRateLimiter {
    /// Create a limiter allowing `max_fetches` per `window`.
    ///
    /// A `max_fetches` of zero refuses every fetch.
    pub fn new(max_fetches: u32, window: Duration) -> Self {
        Self {
            max_fetches,
            window,
            granted: Mutex::new(VecDeque::with_capacity(
                max_fetches.min(INITIAL_LOG_CAPACITY) as usize,
            )),
        }
    }

    pub fn per_minute(max_fetches: u32) -> Self {
        Self::new(max_fetches, DEFAULT_WINDOW)
    }

    pub fn max_fetches(&self) -> u32 {
        self.max_fetches
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Take a permit if the budget allows one.
    ///
    /// Returns `false` without recording anything when the budget for the
    /// trailing window is spent.
    pub fn try_acquire(&self) -> bool {
        let now = Instant::now();
        let mut granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_expired(&mut granted, now);

        if granted.len() >= self.max_fetches as usize {
            tracing::debug!(
                target: "tg.auth.rate_limit",
                max_fetches = self.max_fetches,
                window_secs = self.window.as_secs(),
                "JWKS fetch budget exhausted"
            );
            return false;
        }

        granted.push_back(now);
        true
    }

    /// Permits still available in the trailing window.
    pub fn remaining(&self) -> u32 {
        let now = Instant::now();
        let mut granted = self.granted.lock().unwrap_or_else(PoisonError::into_inner);
        self.evict_expired(&mut granted, now);

        let used = u32::try_from(granted.len()).unwrap_or(u32::MAX);
        self.max_fetches.saturating_sub(used)
    }

    fn evict_expired(&self, granted: &mut VecDeque<Instant>, now: Instant) {
        while granted
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) >= self.window)
        {
            granted.pop_front();
        }
    }
}

impl Default for FetchRateLimiter {
    fn default() -> Self {
        Self::per_minute(DEFAULT_FETCHES_PER_MINUTE)
    }
}

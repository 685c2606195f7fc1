//! In-process rate limiting primitives.
//!
//! `SlidingWindow` counts events inside a rolling window. Its lock is held
//! only while the timestamp deque is updated, never across I/O.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Debug)]
pub struct SlidingWindow {
    limit: usize,
    window: Duration,
    hits: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Allow `limit` events per minute.
    #[must_use]
    pub fn per_minute(limit: usize) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record an event if the window has room.
    pub fn try_acquire(&self) -> RateLimitDecision {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> RateLimitDecision {
        let mut hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        while let Some(oldest) = hits.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.limit {
            return RateLimitDecision::Limited;
        }
        hits.push_back(now);
        RateLimitDecision::Allowed
    }

    /// Events currently counted inside the window.
    pub fn in_window(&self) -> usize {
        let now = Instant::now();
        let hits = self.hits.lock().unwrap_or_else(PoisonError::into_inner);
        hits.iter()
            .filter(|hit| now.saturating_duration_since(**hit) < self.window)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_within_window() {
        let limiter = SlidingWindow::per_minute(3);
        let start = Instant::now();
        for _ in 0..3 {
            assert_eq!(limiter.try_acquire_at(start), RateLimitDecision::Allowed);
        }
        assert_eq!(limiter.try_acquire_at(start), RateLimitDecision::Limited);
        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_secs(59)),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn window_slides() {
        let limiter = SlidingWindow::new(2, Duration::from_secs(60));
        let start = Instant::now();
        assert_eq!(limiter.try_acquire_at(start), RateLimitDecision::Allowed);
        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_secs(30)),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_secs(45)),
            RateLimitDecision::Limited
        );
        // First hit leaves the window, second is still counted.
        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_secs(60)),
            RateLimitDecision::Allowed
        );
        assert_eq!(
            limiter.try_acquire_at(start + Duration::from_secs(61)),
            RateLimitDecision::Limited
        );
    }

    #[test]
    fn zero_limit_always_limits() {
        let limiter = SlidingWindow::per_minute(0);
        assert_eq!(limiter.try_acquire(), RateLimitDecision::Limited);
        assert_eq!(limiter.in_window(), 0);
    }
}

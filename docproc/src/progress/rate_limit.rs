//! Sliding-window limiter for per-job progress writes.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Accepts at most `max_events` within any `window`.
///
/// Not synchronized on its own; the tracker keeps one per job inside the
/// job's lock so the check and the append happen together.
#[derive(Debug)]
pub struct RateWindow {
    max_events: usize,
    window: Duration,
    accepted: VecDeque<Instant>,
}

impl RateWindow {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            max_events: max_events as usize,
            window,
            accepted: VecDeque::with_capacity(max_events as usize),
        }
    }

    /// Per-second limiter. Zero disables limiting.
    pub fn per_second(max_events: u32) -> Self {
        Self::new(max_events, Duration::from_secs(1))
    }

    /// Record an event at `now` if the window has room.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        if self.max_events == 0 {
            return true;
        }
        while let Some(front) = self.accepted.front() {
            if now.duration_since(*front) < self.window {
                break;
            }
            self.accepted.pop_front();
        }
        if self.accepted.len() >= self.max_events {
            return false;
        }
        self.accepted.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_within_window() {
        let mut limiter = RateWindow::per_second(10);
        let start = Instant::now();
        let accepted = (0..25)
            .filter(|i| limiter.try_acquire(start + Duration::from_millis(*i)))
            .count();
        assert_eq!(accepted, 10);
    }

    #[test]
    fn test_window_slides() {
        let mut limiter = RateWindow::per_second(2);
        let start = Instant::now();
        assert!(limiter.try_acquire(start));
        assert!(limiter.try_acquire(start + Duration::from_millis(100)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(900)));
        assert!(limiter.try_acquire(start + Duration::from_millis(1000)));
        assert!(!limiter.try_acquire(start + Duration::from_millis(1050)));
        assert!(limiter.try_acquire(start + Duration::from_millis(1100)));
    }

    #[test]
    fn test_zero_disables_limit() {
        let mut limiter = RateWindow::per_second(0);
        let now = Instant::now();
        assert!((0..100).all(|_| limiter.try_acquire(now)));
    }
}

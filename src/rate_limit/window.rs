//! Window accounting for a single rate-limit key.

use super::Decision;
use crate::config::WindowStrategy;
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Window {
    Fixed { start: u64, count: u32 },
    Sliding { hits: VecDeque<u64> },
}

impl Window {
    pub(crate) fn new(strategy: WindowStrategy, now: u64) -> Self {
        match strategy {
            WindowStrategy::Fixed => Window::Fixed { start: now, count: 0 },
            WindowStrategy::Sliding => Window::Sliding { hits: VecDeque::new() },
        }
    }

    /// Drop whatever has aged out of the window as of `now`.
    fn roll(&mut self, now: u64, window_ms: u64) {
        match self {
            Window::Fixed { start, count } => {
                if now.saturating_sub(*start) >= window_ms {
                    *start = now;
                    *count = 0;
                }
            }
            Window::Sliding { hits } => {
                while hits.front().is_some_and(|t| now.saturating_sub(*t) >= window_ms) {
                    hits.pop_front();
                }
            }
        }
    }

    /// Admit and count one request, or deny without counting.
    pub(crate) fn try_acquire(&mut self, now: u64, max: u32, window_ms: u64) -> Decision {
        self.roll(now, window_ms);
        match self {
            Window::Fixed { start, count } => {
                if *count >= max {
                    let reset_at = *start + window_ms;
                    return Decision::Denied { retry_after: Duration::from_millis(reset_at.saturating_sub(now)) };
                }
                *count += 1;
                Decision::Allowed { remaining: max - *count }
            }
            Window::Sliding { hits } => {
                let used = hits.len() as u32;
                if used >= max {
                    let oldest = hits.front().copied().unwrap_or(now);
                    let frees_at = oldest + window_ms;
                    return Decision::Denied { retry_after: Duration::from_millis(frees_at.saturating_sub(now)) };
                }
                hits.push_back(now);
                Decision::Allowed { remaining: max - used - 1 }
            }
        }
    }

    /// Requests counted in the window as of `now`.
    pub(crate) fn count(&self, now: u64, window_ms: u64) -> u32 {
        match self {
            Window::Fixed { start, count } => {
                if now.saturating_sub(*start) >= window_ms {
                    0
                } else {
                    *count
                }
            }
            Window::Sliding { hits } => {
                hits.iter().filter(|t| now.saturating_sub(**t) < window_ms).count() as u32
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_window_resets_when_elapsed() {
        let mut w = Window::new(WindowStrategy::Fixed, 0);
        assert_eq!(w.try_acquire(0, 2, 100), Decision::Allowed { remaining: 1 });
        assert_eq!(w.try_acquire(50, 2, 100), Decision::Allowed { remaining: 0 });
        assert_eq!(
            w.try_acquire(60, 2, 100),
            Decision::Denied { retry_after: Duration::from_millis(40) }
        );
        assert_eq!(w.count(60, 100), 2);
        assert_eq!(w.count(100, 100), 0);
        assert!(w.try_acquire(100, 2, 100).is_allowed());
    }

    #[test]
    fn sliding_window_frees_slots_one_at_a_time() {
        let mut w = Window::new(WindowStrategy::Sliding, 0);
        assert!(w.try_acquire(0, 2, 100).is_allowed());
        assert!(w.try_acquire(60, 2, 100).is_allowed());
        assert_eq!(
            w.try_acquire(90, 2, 100),
            Decision::Denied { retry_after: Duration::from_millis(10) }
        );
        // The hit at t=0 has aged out; the one at t=60 has not.
        assert_eq!(w.try_acquire(100, 2, 100), Decision::Allowed { remaining: 0 });
        assert!(!w.try_acquire(120, 2, 100).is_allowed());
        assert_eq!(w.count(161, 100), 1);
    }

    #[test]
    fn denial_does_not_count() {
        let mut w = Window::new(WindowStrategy::Fixed, 0);
        w.try_acquire(0, 1, 100);
        for t in 1..10 {
            assert!(!w.try_acquire(t, 1, 100).is_allowed());
        }
        assert_eq!(w.count(10, 100), 1);
    }
}

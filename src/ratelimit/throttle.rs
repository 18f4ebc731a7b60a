//! Per-connection send allowance

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct ThrottleState {
    tokens_remaining: u32,
    window_reset_at: Instant,
}

/// Fixed-window token allowance owned by a single connection.
///
/// Overlaps deliberately with [`RateLimiter`](super::RateLimiter): the
/// limiter caps what one network identifier may do across all of its
/// connections, this caps what one connection may push within a window.
#[derive(Debug)]
pub struct ConnectionThrottle {
    state: Mutex<ThrottleState>,
    tokens_per_window: u32,
    window: Duration,
}

impl ConnectionThrottle {
    pub fn new(tokens_per_window: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                tokens_remaining: tokens_per_window,
                window_reset_at: Instant::now() + window,
            }),
            tokens_per_window,
            window,
        }
    }

    fn refill_if_due(&self, state: &mut ThrottleState, now: Instant) {
        if now >= state.window_reset_at {
            state.tokens_remaining = self.tokens_per_window;
            state.window_reset_at = now + self.window;
        }
    }

    /// Whether at least one token is available in the current window
    pub fn has_tokens(&self) -> bool {
        let mut state = self.state.lock();
        self.refill_if_due(&mut state, Instant::now());
        state.tokens_remaining > 0
    }

    /// Consume a token; returns false when the window is exhausted.
    pub fn consume(&self) -> bool {
        let mut state = self.state.lock();
        self.refill_if_due(&mut state, Instant::now());
        if state.tokens_remaining == 0 {
            return false;
        }
        state.tokens_remaining -= 1;
        true
    }

    pub fn tokens_remaining(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill_if_due(&mut state, Instant::now());
        state.tokens_remaining
    }

    pub fn window_reset_at(&self) -> Instant {
        self.state.lock().window_reset_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consume_until_exhausted() {
        let throttle = ConnectionThrottle::new(3, Duration::from_secs(60));

        assert!(throttle.consume());
        assert!(throttle.consume());
        assert!(throttle.has_tokens());
        assert!(throttle.consume());
        assert!(!throttle.has_tokens());
        assert!(!throttle.consume());
        assert_eq!(throttle.tokens_remaining(), 0);
    }

    #[test]
    fn test_window_refill() {
        let throttle = ConnectionThrottle::new(1, Duration::from_millis(30));

        assert!(throttle.consume());
        assert!(!throttle.has_tokens());

        std::thread::sleep(Duration::from_millis(45));
        assert!(throttle.has_tokens());
        assert_eq!(throttle.tokens_remaining(), 1);
        assert!(throttle.window_reset_at() > Instant::now());
    }
}

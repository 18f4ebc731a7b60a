//! Sliding-window limiter keyed by network identifier

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

/// Default duration of a severe-abuse block
pub const DEFAULT_BLOCK_DURATION: Duration = Duration::from_secs(300);

/// Request history for a single identifier
#[derive(Debug, Default)]
struct RequestHistory {
    /// Accepted requests inside the current window, oldest first
    accepted: VecDeque<Instant>,
    /// Rejected attempts inside the current window, oldest first
    rejected: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RequestHistory {
    fn evict_before(&mut self, cutoff: Instant) {
        while self.accepted.front().is_some_and(|t| *t < cutoff) {
            self.accepted.pop_front();
        }
        while self.rejected.front().is_some_and(|t| *t < cutoff) {
            self.rejected.pop_front();
        }
    }

    fn attempts(&self) -> usize {
        self.accepted.len() + self.rejected.len()
    }

    fn is_idle(&self) -> bool {
        self.accepted.is_empty() && self.rejected.is_empty() && self.blocked_until.is_none()
    }
}

/// Sliding-window request counter with temporary blocking.
///
/// Every identifier keeps the timestamps of its accepted requests. Old
/// entries are evicted lazily on access, there is no background timer.
/// An identifier that keeps knocking after hitting its limit (more than
/// twice the limit in attempts within one window) is blocked outright for
/// `block_duration`.
pub struct RateLimiter {
    histories: DashMap<String, RequestHistory>,
    block_duration: Duration,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_block_duration(DEFAULT_BLOCK_DURATION)
    }

    pub fn with_block_duration(block_duration: Duration) -> Self {
        Self {
            histories: DashMap::new(),
            block_duration,
        }
    }

    /// Record a request for `identifier` and report whether it is allowed.
    pub fn allow(&self, identifier: &str, limit: u32, window: Duration) -> bool {
        let now = Instant::now();
        let mut history = self.histories.entry(identifier.to_string()).or_default();

        if let Some(cutoff) = now.checked_sub(window) {
            history.evict_before(cutoff);
        }

        if let Some(until) = history.blocked_until {
            if now < until {
                return false;
            }
            history.blocked_until = None;
            history.rejected.clear();
            tracing::info!(identifier = %identifier, "Rate limit block expired");
        }

        let limit = limit as usize;
        if history.accepted.len() >= limit {
            history.rejected.push_back(now);
            if history.attempts() > limit.saturating_mul(2) {
                history.blocked_until = Some(now + self.block_duration);
                tracing::warn!(
                    identifier = %identifier,
                    attempts = history.attempts(),
                    limit = limit,
                    block_secs = self.block_duration.as_secs(),
                    "Identifier blocked for severe rate limit abuse"
                );
            }
            return false;
        }

        history.accepted.push_back(now);
        true
    }

    /// Whether `identifier` is currently under a temporary block
    pub fn is_blocked(&self, identifier: &str) -> bool {
        let now = Instant::now();
        self.histories
            .get(identifier)
            .and_then(|h| h.blocked_until)
            .is_some_and(|until| now < until)
    }

    /// Accepted requests for `identifier` still inside `window`
    pub fn current_count(&self, identifier: &str, window: Duration) -> usize {
        let now = Instant::now();
        self.histories
            .get(identifier)
            .map(|h| {
                h.accepted
                    .iter()
                    .filter(|t| now.duration_since(**t) <= window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Drop histories whose entries have all aged out of `window` and whose
    /// block (if any) has expired.
    pub fn cleanup_stale(&self, window: Duration) -> usize {
        let now = Instant::now();
        let before = self.histories.len();

        self.histories.retain(|_, history| {
            if let Some(cutoff) = now.checked_sub(window) {
                history.evict_before(cutoff);
            }
            if history.blocked_until.is_some_and(|until| now >= until) {
                history.blocked_until = None;
            }
            !history.is_idle()
        });

        let removed = before.saturating_sub(self.histories.len());
        if removed > 0 {
            tracing::debug!(
                removed = removed,
                tracked = self.histories.len(),
                "Cleaned up stale rate limit histories"
            );
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let blocked_identifiers = self
            .histories
            .iter()
            .filter(|entry| entry.blocked_until.is_some_and(|until| now < until))
            .count();

        RateLimiterStats {
            tracked_identifiers: self.histories.len(),
            blocked_identifiers,
            block_duration_secs: self.block_duration.as_secs(),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics about the rate limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub tracked_identifiers: usize,
    pub blocked_identifiers: usize,
    pub block_duration_secs: u64,
}

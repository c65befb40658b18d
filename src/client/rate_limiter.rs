use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Sliding one-minute window limiting API writes
///
/// Tracks when recent writes happened and allows at most `max_per_minute`
/// of them inside any sixty second window.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum number of writes allowed per minute
    max_per_minute: usize,
    /// Timestamps of recent writes (within the last minute)
    recent: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a new rate limiter with the specified maximum writes per minute
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            recent: VecDeque::new(),
        }
    }

    fn can_send_at(&mut self, now: DateTime<Utc>) -> bool {
        self.cleanup(now);
        self.recent.len() < self.max_per_minute
    }

    /// Record a write if the limit allows it
    ///
    /// # Returns
    ///
    /// `true` if the write was admitted, `false` if rate limited
    pub fn try_acquire(&mut self) -> bool {
        let now = Utc::now();
        if !self.can_send_at(now) {
            return false;
        }
        self.recent.push_back(now);
        true
    }

    /// How long until the oldest write leaves the window
    pub fn time_until_available(&mut self) -> std::time::Duration {
        self.time_until_available_at(Utc::now())
    }

    fn time_until_available_at(&mut self, now: DateTime<Utc>) -> std::time::Duration {
        if self.can_send_at(now) {
            return std::time::Duration::ZERO;
        }
        self.recent
            .iter()
            .min()
            .map(|oldest| (*oldest + Duration::minutes(1) - now).to_std().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Drop writes older than one minute before `now`
    fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(1);
        // Timestamps may be recorded out of order
        self.recent.retain(|&time| time > cutoff);
    }
}

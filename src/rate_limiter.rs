use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Sliding-window rate limiter
///
/// Tracks the timestamps of recent events and enforces a maximum count per
/// trailing window. The safety guard uses one per service (actions per hour)
/// and the throttled notifier uses one for notifications per minute.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum number of events allowed per window
    max_per_window: usize,
    /// Length of the trailing window
    window: Duration,
    /// Timestamps of recent events (within the window)
    recent: VecDeque<DateTime<Utc>>,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    ///
    /// * `max_per_window` - Maximum number of events allowed per window
    /// * `window` - Length of the trailing window
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            recent: VecDeque::new(),
        }
    }

    /// Shorthand for a per-minute limiter
    pub fn per_minute(max_per_minute: usize) -> Self {
        Self::new(max_per_minute, Duration::minutes(1))
    }

    pub fn max_per_window(&self) -> usize {
        self.max_per_window
    }

    /// Check if another event fits in the window at the current time
    pub fn can_acquire(&mut self) -> bool {
        self.can_acquire_at(Utc::now())
    }

    /// Check if another event fits in the window ending at `now`
    ///
    /// # Returns
    ///
    /// `true` if the event is allowed, `false` if rate limited
    pub fn can_acquire_at(&mut self, now: DateTime<Utc>) -> bool {
        self.count_at(now) < self.max_per_window
    }

    /// Record an event at the current time
    pub fn record(&mut self) {
        self.record_at(Utc::now());
    }

    /// Record an event at a specific time
    pub fn record_at(&mut self, timestamp: DateTime<Utc>) {
        self.recent.push_back(timestamp);
    }

    /// Give back a slot recorded at `timestamp`
    ///
    /// # Returns
    ///
    /// `true` if a matching slot was found and removed
    pub fn release(&mut self, timestamp: DateTime<Utc>) -> bool {
        match self.recent.iter().rposition(|&t| t == timestamp) {
            Some(index) => {
                self.recent.remove(index);
                true
            }
            None => false,
        }
    }

    /// Number of events inside the window ending at `now`
    pub fn count_at(&mut self, now: DateTime<Utc>) -> usize {
        self.cleanup(now);
        self.recent.len()
    }

    /// Drop events older than the window ending at `now`
    ///
    /// Events may be recorded out of order, so the whole queue is scanned.
    fn cleanup(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        self.recent.retain(|&time| time > cutoff);
    }
}

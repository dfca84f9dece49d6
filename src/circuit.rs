//! Circuit breaker state machine
//!
//! Used per LLM backend by the model orchestrator and per service by the
//! safety guard. The breaker is a plain value; callers own the locking.
//!
//! ```text
//! Closed --N consecutive failures--> Open --cool-off elapsed--> HalfOpen
//! HalfOpen --trial succeeds--> Closed
//! HalfOpen --trial fails-----> Open
//! ```

use crate::events::Timestamp;
use chrono::Duration;
use serde::Serialize;

/// Current state of a circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CircuitState {
    Closed { consecutive_failures: u32 },
    Open { until: Timestamp },
    /// Cool-off elapsed; `trial_started` is set while the single trial call runs
    HalfOpen { trial_started: Option<Timestamp> },
}

/// Answer to "may I make a call now?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed, call normally
    Closed,
    /// Half-open, this call is the single recovery trial
    Trial,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    threshold: u32,
    cool_off: Duration,
    state: CircuitState,
    trips: u64,
}

impl CircuitBreaker {
    /// Create a closed breaker that opens after `threshold` consecutive failures
    pub fn new(threshold: u32, cool_off: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cool_off,
            state: CircuitState::Closed {
                consecutive_failures: 0,
            },
            trips: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// How many times the breaker has opened since creation
    pub fn trips(&self) -> u64 {
        self.trips
    }

    pub fn consecutive_failures(&self) -> u32 {
        match self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => consecutive_failures,
            _ => self.threshold,
        }
    }

    /// Whether calls are currently being refused outright
    pub fn is_open_at(&self, now: Timestamp) -> bool {
        matches!(self.state, CircuitState::Open { until } if now < until)
    }

    /// Check admission without claiming the half-open trial
    ///
    /// Moves an expired `Open` breaker to `HalfOpen`. A trial that has been
    /// running longer than the cool-off is considered abandoned.
    pub fn peek(&mut self, now: Timestamp) -> Admission {
        if let CircuitState::Open { until } = self.state {
            if now >= until {
                self.state = CircuitState::HalfOpen {
                    trial_started: None,
                };
            }
        }

        match self.state {
            CircuitState::Closed { .. } => Admission::Closed,
            CircuitState::Open { .. } => Admission::Rejected,
            CircuitState::HalfOpen {
                trial_started: None,
            } => Admission::Trial,
            CircuitState::HalfOpen {
                trial_started: Some(started),
            } => {
                if now - started >= self.cool_off {
                    Admission::Trial
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Check admission and claim the half-open trial if one is available
    pub fn admit(&mut self, now: Timestamp) -> Admission {
        let admission = self.peek(now);
        if admission == Admission::Trial {
            self.state = CircuitState::HalfOpen {
                trial_started: Some(now),
            };
        }
        admission
    }

    /// Give back a claimed trial that never ran
    pub fn release_trial(&mut self) {
        if let CircuitState::HalfOpen {
            trial_started: Some(_),
        } = self.state
        {
            self.state = CircuitState::HalfOpen {
                trial_started: None,
            };
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&mut self, now: Timestamp) {
        match self.state {
            CircuitState::Closed {
                consecutive_failures,
            } => {
                let failures = consecutive_failures + 1;
                if failures >= self.threshold {
                    self.trip(now);
                } else {
                    self.state = CircuitState::Closed {
                        consecutive_failures: failures,
                    };
                }
            }
            CircuitState::HalfOpen { .. } => self.trip(now),
            // A call admitted before the breaker opened; the window stays as is
            CircuitState::Open { .. } => {}
        }
    }

    /// Force the breaker closed (operator override)
    pub fn reset(&mut self) {
        self.record_success();
    }

    fn trip(&mut self, now: Timestamp) {
        self.state = CircuitState::Open {
            until: now + self.cool_off,
        };
        self.trips += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_opens_after_threshold() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(3, Duration::minutes(30));

        breaker.record_failure(now);
        breaker.record_failure(now);
        assert_eq!(breaker.peek(now), Admission::Closed);
        assert_eq!(breaker.consecutive_failures(), 2);

        breaker.record_failure(now);
        assert_eq!(breaker.peek(now), Admission::Rejected);
        assert!(breaker.is_open_at(now));
        assert_eq!(breaker.trips(), 1);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(3, Duration::minutes(30));

        breaker.record_failure(now);
        breaker.record_failure(now);
        breaker.record_success();
        breaker.record_failure(now);
        breaker.record_failure(now);

        assert_eq!(breaker.peek(now), Admission::Closed);
    }

    #[test]
    fn test_half_open_allows_single_trial() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::minutes(10));
        breaker.record_failure(now);

        let later = now + Duration::minutes(10);
        assert_eq!(breaker.admit(later), Admission::Trial);
        assert_eq!(breaker.admit(later), Admission::Rejected);

        breaker.record_success();
        assert_eq!(breaker.admit(later), Admission::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(2, Duration::minutes(10));
        breaker.record_failure(now);
        breaker.record_failure(now);

        let later = now + Duration::minutes(11);
        assert_eq!(breaker.admit(later), Admission::Trial);
        breaker.record_failure(later);

        assert!(breaker.is_open_at(later + Duration::minutes(9)));
        assert_eq!(breaker.peek(later + Duration::minutes(10)), Admission::Trial);
        assert_eq!(breaker.trips(), 2);
    }

    #[test]
    fn test_released_trial_can_be_claimed_again() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::minutes(5));
        breaker.record_failure(now);

        let later = now + Duration::minutes(5);
        assert_eq!(breaker.admit(later), Admission::Trial);
        breaker.release_trial();
        assert_eq!(breaker.admit(later), Admission::Trial);
    }

    #[test]
    fn test_abandoned_trial_expires() {
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::minutes(5));
        breaker.record_failure(now);

        let trial_time = now + Duration::minutes(5);
        assert_eq!(breaker.admit(trial_time), Admission::Trial);
        assert_eq!(
            breaker.peek(trial_time + Duration::minutes(4)),
            Admission::Rejected
        );
        assert_eq!(
            breaker.peek(trial_time + Duration::minutes(5)),
            Admission::Trial
        );
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use chrono::Utc;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_opens_exactly_at_threshold(threshold: u8) -> bool {
        let threshold = (threshold % 10) as u32 + 1;
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(threshold, Duration::minutes(1));

        for _ in 0..threshold - 1 {
            breaker.record_failure(now);
            if breaker.peek(now) != Admission::Closed {
                return false;
            }
        }
        breaker.record_failure(now);
        breaker.peek(now) == Admission::Rejected
    }

    #[quickcheck]
    fn prop_open_rejects_until_cool_off(cool_off_minutes: u8, probe_minutes: u8) -> bool {
        let cool_off = cool_off_minutes as i64 + 1;
        let probe = probe_minutes as i64;
        let now = Utc::now();
        let mut breaker = CircuitBreaker::new(1, Duration::minutes(cool_off));
        breaker.record_failure(now);

        let admission = breaker.peek(now + Duration::minutes(probe));
        if probe < cool_off {
            admission == Admission::Rejected
        } else {
            admission == Admission::Trial
        }
    }
}

use crate::alerts::alert::Priority;
use crate::events::Timestamp;
use chrono::Duration;
use std::collections::{HashMap, VecDeque};

/// Raise priority when `occurrences` observations land within `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationRule {
    pub occurrences: u32,
    pub window: Duration,
}

impl Default for EscalationRule {
    fn default() -> Self {
        Self {
            occurrences: 10,
            window: Duration::minutes(5),
        }
    }
}

impl EscalationRule {
    /// Trim `recent` to the window ending at `now` and report whether the
    /// rule fires
    pub fn fires(&self, recent: &mut VecDeque<Timestamp>, now: Timestamp) -> bool {
        let cutoff = now - self.window;
        recent.retain(|&seen| seen > cutoff);
        self.occurrences > 0 && recent.len() >= self.occurrences as usize
    }
}

/// Escalation configuration for the alert manager
///
/// Two independent mechanisms: the occurrence-rate rule raises priority and
/// can be overridden per service; the unacknowledged-age thresholds re-notify
/// without changing priority.
#[derive(Debug, Clone)]
pub struct EscalationPolicy {
    default_rule: EscalationRule,
    per_service: HashMap<String, EscalationRule>,
    unacknowledged_after: HashMap<Priority, Duration>,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        let mut unacknowledged_after = HashMap::new();
        unacknowledged_after.insert(Priority::P1, Duration::minutes(5));
        unacknowledged_after.insert(Priority::P2, Duration::minutes(30));
        unacknowledged_after.insert(Priority::P3, Duration::minutes(120));

        Self {
            default_rule: EscalationRule::default(),
            per_service: HashMap::new(),
            unacknowledged_after,
        }
    }
}

impl EscalationPolicy {
    pub fn new(default_rule: EscalationRule) -> Self {
        Self {
            default_rule,
            ..Self::default()
        }
    }

    pub fn with_service_rule(mut self, service: impl Into<String>, rule: EscalationRule) -> Self {
        self.per_service.insert(service.into(), rule);
        self
    }

    pub fn with_unacknowledged_threshold(mut self, priority: Priority, after: Duration) -> Self {
        self.unacknowledged_after.insert(priority, after);
        self
    }

    pub fn rule_for(&self, service: &str) -> EscalationRule {
        self.per_service
            .get(service)
            .copied()
            .unwrap_or(self.default_rule)
    }

    pub fn unacknowledged_threshold(&self, priority: Priority) -> Option<Duration> {
        self.unacknowledged_after.get(&priority).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_rule_fires_at_threshold() {
        let rule = EscalationRule {
            occurrences: 3,
            window: Duration::minutes(1),
        };
        let now = Utc::now();
        let mut recent: VecDeque<Timestamp> = VecDeque::new();

        recent.push_back(now - Duration::seconds(50));
        recent.push_back(now - Duration::seconds(20));
        assert!(!rule.fires(&mut recent, now));

        recent.push_back(now);
        assert!(rule.fires(&mut recent, now));
    }

    #[test]
    fn test_rule_ignores_occurrences_outside_window() {
        let rule = EscalationRule {
            occurrences: 2,
            window: Duration::minutes(1),
        };
        let now = Utc::now();
        let mut recent: VecDeque<Timestamp> = VecDeque::new();
        recent.push_back(now - Duration::minutes(5));
        recent.push_back(now);

        assert!(!rule.fires(&mut recent, now));
        assert_eq!(recent.len(), 1);
    }

    #[test]
    fn test_zero_occurrence_rule_never_fires() {
        let rule = EscalationRule {
            occurrences: 0,
            window: Duration::minutes(1),
        };
        let mut recent = VecDeque::from(vec![Utc::now()]);
        assert!(!rule.fires(&mut recent, Utc::now()));
    }

    #[test]
    fn test_service_override() {
        let strict = EscalationRule {
            occurrences: 2,
            window: Duration::seconds(30),
        };
        let policy = EscalationPolicy::default().with_service_rule("db-1", strict);

        assert_eq!(policy.rule_for("db-1"), strict);
        assert_eq!(policy.rule_for("web-1"), EscalationRule::default());
        assert_eq!(
            policy.unacknowledged_threshold(Priority::P1),
            Some(Duration::minutes(5))
        );
    }
}

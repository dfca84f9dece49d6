use crate::alerts::alert::{
    Alert, AlertHandle, AlertId, AlertState, AlertTransition, Escalation, EscalationReason,
    Priority,
};
use crate::alerts::escalation::EscalationPolicy;
use crate::alerts::fingerprint::{self, Fingerprint};
use crate::analysis::Diagnosis;
use crate::error::AlertError;
use crate::events::{Observation, Timestamp};
use crate::remediation::ActionProposal;
use chrono::{Duration, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Deduplication key: one active alert per fingerprint per service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AlertKey {
    service: String,
    fingerprint: Fingerprint,
}

/// Single-writer cell for one deduplication key
#[derive(Debug, Default)]
struct Slot {
    active: Option<Alert>,
    /// Set once the slot has been removed from the map
    retired: bool,
}

/// Counts reported by [`AlertManager::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub open: usize,
    pub acknowledged: usize,
    pub archived: usize,
    pub p1: usize,
    pub p2: usize,
    pub p3: usize,
}

/// Owns alert state and the open/acknowledged/resolved lifecycle
///
/// Observations are collapsed into alerts by fingerprint. Each
/// (service, fingerprint) key has its own mutex, so concurrent observations
/// for the same signature serialize while unrelated alerts proceed in
/// parallel. The slot map lock is only held long enough to find or insert a
/// slot.
///
/// Lock order is slot, then index, then archive. Releasing an empty slot
/// locks the map before the slot; nothing else takes the map lock while
/// holding a slot.
#[derive(Debug)]
pub struct AlertManager {
    policy: EscalationPolicy,
    slots: RwLock<HashMap<AlertKey, Arc<Mutex<Slot>>>>,
    /// Active alert id to its slot key
    index: RwLock<HashMap<AlertId, AlertKey>>,
    /// Resolved alerts, oldest first
    archive: Mutex<VecDeque<Alert>>,
    max_archived: usize,
    /// Lower-cased substrings of suppressed service names
    suppressed: RwLock<Vec<String>>,
}

impl Default for AlertManager {
    fn default() -> Self {
        Self::new(EscalationPolicy::default())
    }
}

impl AlertManager {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self::with_archive_size(policy, 10_000)
    }

    /// Create a manager that keeps at most `max_archived` resolved alerts in memory
    pub fn with_archive_size(policy: EscalationPolicy, max_archived: usize) -> Self {
        Self {
            policy,
            slots: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            archive: Mutex::new(VecDeque::new()),
            max_archived: max_archived.max(1),
            suppressed: RwLock::new(Vec::new()),
        }
    }

    /// Correlate an observation into an alert
    ///
    /// Returns the existing alert's handle (with `is_new == false`) when an
    /// open or acknowledged alert already carries the same fingerprint for
    /// the service; otherwise opens a new alert.
    ///
    /// # Errors
    ///
    /// `AlertError::Suppressed` if the service matches a suppression pattern.
    pub fn submit(&self, observation: &Observation) -> Result<AlertHandle, AlertError> {
        if self.is_suppressed(&observation.service) {
            debug!(
                "Dropping observation for suppressed service {}",
                observation.service
            );
            return Err(AlertError::Suppressed(observation.service.clone()));
        }

        let class = fingerprint::classify(&observation.text);
        let key = AlertKey {
            service: observation.service.clone(),
            fingerprint: Fingerprint::compute(&observation.service, &observation.text),
        };

        let cell = self.slot_for(&key);
        let mut slot = cell.lock().unwrap();
        if slot.retired {
            // Resolved and released between lookup and lock
            drop(slot);
            return self.submit(observation);
        }

        if let Some(alert) = slot.active.as_mut() {
            alert.record_occurrence(observation.timestamp);
            let escalated = self.escalate_on_rate(alert);
            debug!(
                "Deduplicated observation into alert {} (occurrences={})",
                alert.id, alert.occurrence_count
            );
            return Ok(AlertHandle::of(alert, false, escalated));
        }

        let severity = observation.severity.unwrap_or(class.severity);
        let mut alert = Alert::open(
            key.fingerprint.clone(),
            &observation.service,
            &observation.text,
            class.name,
            severity,
            observation.context.clone(),
            observation.timestamp,
        );
        let escalated = self.escalate_on_rate(&mut alert);

        info!(
            "Opened {} alert {} for {} [{}]: {}",
            alert.priority, alert.id, alert.service, alert.fingerprint, alert.title
        );

        let handle = AlertHandle::of(&alert, true, escalated);
        self.index.write().unwrap().insert(alert.id, key);
        slot.active = Some(alert);
        Ok(handle)
    }

    /// Mark an open alert as acknowledged by `by`
    pub fn acknowledge(&self, id: AlertId, by: &str) -> Result<Alert, AlertError> {
        self.transition(id, AlertTransition::Acknowledge, by, None)
    }

    /// Resolve an open or acknowledged alert and move it to the archive
    pub fn resolve(&self, id: AlertId, by: &str, reason: &str) -> Result<Alert, AlertError> {
        self.transition(id, AlertTransition::Resolve, by, Some(reason))
    }

    /// React to a health state change for `service`
    ///
    /// A transition to healthy auto-resolves every active alert of the
    /// service. Unhealthy transitions are turned into observations by the
    /// pipeline, so nothing happens here.
    ///
    /// # Returns
    ///
    /// The alerts that were resolved
    pub fn health_changed(&self, service: &str, healthy: bool) -> Vec<Alert> {
        if !healthy {
            return Vec::new();
        }

        let ids: Vec<AlertId> = self
            .active_alerts()
            .into_iter()
            .filter(|alert| alert.service == service)
            .map(|alert| alert.id)
            .collect();

        let resolved: Vec<Alert> = ids
            .into_iter()
            .filter_map(|id| self.resolve(id, "auto", "service health recovered").ok())
            .collect();

        if !resolved.is_empty() {
            info!(
                "Auto-resolved {} alert(s) for {} after health recovery",
                resolved.len(),
                service
            );
        }
        resolved
    }

    /// Attach a new diagnosis; earlier ones are kept, never replaced
    pub fn record_diagnosis(&self, id: AlertId, diagnosis: Diagnosis) -> Result<(), AlertError> {
        self.with_active(id, |alert| {
            alert.diagnoses.push(diagnosis);
            Ok(())
        })
    }

    pub fn record_proposal(&self, id: AlertId, proposal: ActionProposal) -> Result<(), AlertError> {
        self.with_active(id, |alert| {
            alert.latest_proposal = Some(proposal);
            Ok(())
        })
    }

    /// Look up an alert, active or archived
    pub fn get(&self, id: AlertId) -> Option<Alert> {
        if let Ok(alert) = self.with_active(id, |alert| Ok(alert.clone())) {
            return Some(alert);
        }
        self.find_archived(id)
    }

    /// Active alerts sorted by priority, then age
    pub fn open_alerts(&self, priority: Option<Priority>) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .active_alerts()
            .into_iter()
            .filter(|alert| priority.map_or(true, |p| alert.priority == p))
            .collect();
        alerts.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.first_seen.cmp(&b.first_seen))
        });
        alerts
    }

    /// Most recently resolved alerts first
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let archive = self.archive.lock().unwrap();
        archive.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> AlertStats {
        let mut stats = AlertStats {
            archived: self.archive.lock().unwrap().len(),
            ..AlertStats::default()
        };
        for alert in self.active_alerts() {
            match alert.state {
                AlertState::Open => stats.open += 1,
                AlertState::Acknowledged => stats.acknowledged += 1,
                AlertState::Resolved => {}
            }
            match alert.priority {
                Priority::P1 => stats.p1 += 1,
                Priority::P2 => stats.p2 += 1,
                Priority::P3 => stats.p3 += 1,
            }
        }
        stats
    }

    /// Find open alerts left unacknowledged past the threshold for their priority
    ///
    /// Each alert is reported once per priority level; the returned alerts
    /// are snapshots taken after marking.
    pub fn due_escalations(&self, now: Timestamp) -> Vec<(Alert, Escalation)> {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().unwrap().values().cloned().collect();
        let mut due = Vec::new();

        for slot in slots {
            let mut slot = slot.lock().unwrap();
            let Some(alert) = slot.active.as_mut() else {
                continue;
            };
            if alert.state != AlertState::Open || alert.age_escalated_at == Some(alert.priority) {
                continue;
            }
            let Some(threshold) = self.policy.unacknowledged_threshold(alert.priority) else {
                continue;
            };
            let age = now - alert.first_seen;
            if age >= threshold {
                alert.age_escalated_at = Some(alert.priority);
                warn!(
                    "{} alert {} for {} unacknowledged for {}s",
                    alert.priority,
                    alert.id,
                    alert.service,
                    age.num_seconds()
                );
                let escalation = Escalation {
                    from: alert.priority,
                    to: alert.priority,
                    reason: EscalationReason::Unacknowledged {
                        age_seconds: age.num_seconds(),
                    },
                };
                due.push((alert.clone(), escalation));
            }
        }
        due
    }

    /// Resolve active alerts that have not been seen for `max_age`
    pub fn resolve_stale(&self, max_age: Duration, now: Timestamp) -> Vec<Alert> {
        let cutoff = now - max_age;
        let stale: Vec<AlertId> = self
            .active_alerts()
            .into_iter()
            .filter(|alert| alert.last_seen < cutoff)
            .map(|alert| alert.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.resolve(id, "auto", "no occurrences within the stale window").ok())
            .collect()
    }

    /// Stop creating alerts for services whose name contains `pattern`
    pub fn suppress_service(&self, pattern: &str) {
        let pattern = pattern.to_lowercase();
        let mut suppressed = self.suppressed.write().unwrap();
        if !suppressed.contains(&pattern) {
            info!("Suppressing observations for services matching '{}'", pattern);
            suppressed.push(pattern);
        }
    }

    /// # Returns
    ///
    /// `true` if the pattern was suppressed before
    pub fn unsuppress_service(&self, pattern: &str) -> bool {
        let pattern = pattern.to_lowercase();
        let mut suppressed = self.suppressed.write().unwrap();
        let before = suppressed.len();
        suppressed.retain(|p| *p != pattern);
        before != suppressed.len()
    }

    pub fn is_suppressed(&self, service: &str) -> bool {
        let service = service.to_lowercase();
        self.suppressed
            .read()
            .unwrap()
            .iter()
            .any(|pattern| service.contains(pattern.as_str()))
    }

    fn slot_for(&self, key: &AlertKey) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.read().unwrap().get(key) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write().unwrap();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn active_alerts(&self) -> Vec<Alert> {
        let slots: Vec<Arc<Mutex<Slot>>> = self.slots.read().unwrap().values().cloned().collect();
        slots
            .iter()
            .filter_map(|slot| slot.lock().unwrap().active.clone())
            .collect()
    }

    fn find_archived(&self, id: AlertId) -> Option<Alert> {
        let archive = self.archive.lock().unwrap();
        archive.iter().rev().find(|alert| alert.id == id).cloned()
    }

    /// Run `f` on the active alert `id` while holding its slot lock
    fn with_active<R>(
        &self,
        id: AlertId,
        f: impl FnOnce(&mut Alert) -> Result<R, AlertError>,
    ) -> Result<R, AlertError> {
        let key = self.index.read().unwrap().get(&id).cloned();
        let slot = key.and_then(|key| self.slots.read().unwrap().get(&key).cloned());

        if let Some(slot) = slot {
            let mut slot = slot.lock().unwrap();
            if let Some(alert) = slot.active.as_mut().filter(|alert| alert.id == id) {
                return f(alert);
            }
        }

        if self.find_archived(id).is_some() {
            Err(AlertError::Archived(id))
        } else {
            Err(AlertError::NotFound(id))
        }
    }

    fn transition(
        &self,
        id: AlertId,
        transition: AlertTransition,
        by: &str,
        reason: Option<&str>,
    ) -> Result<Alert, AlertError> {
        let now = Utc::now();
        let key = self.index.read().unwrap().get(&id).cloned();
        let slot = key.and_then(|key| self.slots.read().unwrap().get(&key).cloned());

        let Some(slot) = slot else {
            // Archived alerts are terminal
            return match self.find_archived(id) {
                Some(alert) => Err(AlertError::InvalidTransition {
                    id,
                    from: alert.state,
                    to: match transition {
                        AlertTransition::Acknowledge => AlertState::Acknowledged,
                        AlertTransition::Resolve => AlertState::Resolved,
                    },
                }),
                None => Err(AlertError::NotFound(id)),
            };
        };

        let mut slot = slot.lock().unwrap();
        let alert = match slot.active.as_mut() {
            Some(alert) if alert.id == id => alert,
            _ => return Err(AlertError::NotFound(id)),
        };
        alert.transition(transition, by, reason, now)?;

        if alert.state != AlertState::Resolved {
            info!("Alert {} {} by {}", alert.id, alert.state, by);
            return Ok(alert.clone());
        }

        let resolved = match slot.active.take() {
            Some(alert) => alert,
            None => return Err(AlertError::NotFound(id)),
        };
        info!(
            "Alert {} for {} resolved by {} after {} occurrence(s)",
            resolved.id, resolved.service, by, resolved.occurrence_count
        );

        self.index.write().unwrap().remove(&id);
        {
            let mut archive = self.archive.lock().unwrap();
            archive.push_back(resolved.clone());
            while archive.len() > self.max_archived {
                archive.pop_front();
            }
        }
        drop(slot);

        self.release_slot(&AlertKey {
            service: resolved.service.clone(),
            fingerprint: resolved.fingerprint.clone(),
        });
        Ok(resolved)
    }

    /// Drop the slot for `key` if it holds no active alert
    ///
    /// A concurrent `submit` may already hold a clone of the slot, so the
    /// slot is marked retired and `submit` looks it up again.
    fn release_slot(&self, key: &AlertKey) {
        let mut slots = self.slots.write().unwrap();
        let Some(slot) = slots.get(key).cloned() else {
            return;
        };
        let mut slot = slot.lock().unwrap();
        if slot.active.is_none() {
            slot.retired = true;
            slots.remove(key);
        }
    }

    #[cfg(test)]
    fn slot_count(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    fn escalate_on_rate(&self, alert: &mut Alert) -> Option<Escalation> {
        let rule = self.policy.rule_for(&alert.service);
        // Trim the window even when the alert cannot be raised further
        let fired = rule.fires(&mut alert.recent, alert.last_seen);
        if alert.priority == Priority::P1 {
            alert.recent.clear();
            return None;
        }
        if !fired {
            return None;
        }

        let from = alert.priority;
        alert.priority = from.raised();
        alert.recent.clear();
        warn!(
            "Escalated alert {} for {} from {} to {} ({} occurrences within {}s)",
            alert.id,
            alert.service,
            from,
            alert.priority,
            rule.occurrences,
            rule.window.num_seconds()
        );

        Some(Escalation {
            from,
            to: alert.priority,
            reason: EscalationReason::OccurrenceRate {
                occurrences: rule.occurrences,
                window_seconds: rule.window.num_seconds(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::escalation::EscalationRule;
    use crate::events::Severity;
    use std::thread;

    fn observation(service: &str, text: &str) -> Observation {
        Observation::new(service, text).with_severity(Severity::Error)
    }

    #[test]
    fn test_first_observation_opens_alert() {
        let manager = AlertManager::default();
        let handle = manager
            .submit(&observation("web-1", "connection refused to db:5432"))
            .unwrap();

        assert!(handle.is_new);
        assert_eq!(handle.priority, Priority::P2);
        assert_eq!(handle.occurrence_count, 1);

        let alert = manager.get(handle.id).unwrap();
        assert_eq!(alert.state, AlertState::Open);
        assert_eq!(alert.error_class, "connection");
    }

    #[test]
    fn test_repeated_observations_deduplicate() {
        let manager = AlertManager::default();
        let first = manager
            .submit(&observation("web-1", "request 17 timed out after 3000ms"))
            .unwrap();
        let second = manager
            .submit(&observation("web-1", "request 42 timed out after 3100ms"))
            .unwrap();

        assert!(!second.is_new);
        assert_eq!(first.id, second.id);
        assert_eq!(second.occurrence_count, 2);
        assert_eq!(manager.open_alerts(None).len(), 1);
    }

    #[test]
    fn test_severity_falls_back_to_error_class() {
        let manager = AlertManager::default();
        let handle = manager
            .submit(&Observation::new("worker", "process segfault at 0x7ffd"))
            .unwrap();
        assert_eq!(handle.priority, Priority::P1);
    }

    #[test]
    fn test_acknowledge_then_resolve() {
        let manager = AlertManager::default();
        let handle = manager.submit(&observation("api", "database deadlock")).unwrap();

        let acked = manager.acknowledge(handle.id, "operator:kim").unwrap();
        assert_eq!(acked.state, AlertState::Acknowledged);

        // Still deduplicates while acknowledged
        let again = manager.submit(&observation("api", "database deadlock")).unwrap();
        assert_eq!(again.id, handle.id);

        let resolved = manager.resolve(handle.id, "operator:kim", "fixed index").unwrap();
        assert_eq!(resolved.state, AlertState::Resolved);
        assert_eq!(manager.history(10).len(), 1);
        assert!(manager.open_alerts(None).is_empty());
    }

    #[test]
    fn test_resolved_is_terminal() {
        let manager = AlertManager::default();
        let handle = manager.submit(&observation("api", "database deadlock")).unwrap();
        manager.resolve(handle.id, "operator", "done").unwrap();

        let err = manager.acknowledge(handle.id, "operator").unwrap_err();
        assert!(matches!(err, AlertError::InvalidTransition { .. }));

        let err = manager
            .record_diagnosis(
                handle.id,
                crate::analysis::heuristics::heuristic_diagnosis(
                    &manager.get(handle.id).unwrap(),
                    "test",
                ),
            )
            .unwrap_err();
        assert_eq!(err, AlertError::Archived(handle.id));
    }

    #[test]
    fn test_reoccurrence_after_resolution_creates_new_alert() {
        let manager = AlertManager::default();
        let first = manager.submit(&observation("api", "database deadlock")).unwrap();
        manager.resolve(first.id, "auto", "recovered").unwrap();

        let second = manager.submit(&observation("api", "database deadlock")).unwrap();
        assert!(second.is_new);
        assert_ne!(first.id, second.id);
        assert_eq!(manager.get(first.id).unwrap().state, AlertState::Resolved);
    }

    #[test]
    fn test_unknown_alert() {
        let manager = AlertManager::default();
        let id = AlertId::new();
        assert_eq!(
            manager.acknowledge(id, "x").unwrap_err(),
            AlertError::NotFound(id)
        );
        assert!(manager.get(id).is_none());
    }

    #[test]
    fn test_health_recovery_resolves_service_alerts() {
        let manager = AlertManager::default();
        manager.submit(&observation("web-1", "connection refused")).unwrap();
        manager.submit(&observation("web-1", "upstream timed out")).unwrap();
        manager.submit(&observation("web-2", "connection refused")).unwrap();

        assert!(manager.health_changed("web-1", false).is_empty());

        let resolved = manager.health_changed("web-1", true);
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|a| a.resolved_by.as_deref() == Some("auto")));

        let remaining = manager.open_alerts(None);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].service, "web-2");
    }

    #[test]
    fn test_occurrence_rate_escalates_priority() {
        let policy = EscalationPolicy::new(EscalationRule {
            occurrences: 3,
            window: Duration::minutes(1),
        });
        let manager = AlertManager::new(policy);
        let start = Utc::now();

        let submit = |offset: i64| {
            manager
                .submit(
                    &Observation::new("web-1", "slow response from cache")
                        .with_severity(Severity::Warning)
                        .at(start + Duration::seconds(offset)),
                )
                .unwrap()
        };

        assert_eq!(submit(0).priority, Priority::P3);
        assert!(submit(10).escalated.is_none());

        let third = submit(20);
        assert_eq!(third.priority, Priority::P2);
        let escalation = third.escalated.unwrap();
        assert_eq!(escalation.from, Priority::P3);
        assert_eq!(escalation.to, Priority::P2);

        // The window restarts after escalating
        assert!(submit(30).escalated.is_none());
    }

    #[test]
    fn test_slow_occurrences_do_not_escalate() {
        let policy = EscalationPolicy::new(EscalationRule {
            occurrences: 3,
            window: Duration::minutes(1),
        });
        let manager = AlertManager::new(policy);
        let start = Utc::now();

        for minute in 0..5 {
            let handle = manager
                .submit(
                    &Observation::new("web-1", "retrying request")
                        .with_severity(Severity::Warning)
                        .at(start + Duration::minutes(minute * 2)),
                )
                .unwrap();
            assert_eq!(handle.priority, Priority::P3);
        }
    }

    #[test]
    fn test_due_escalations_fire_once() {
        let manager = AlertManager::default();
        let seen = Utc::now() - Duration::minutes(10);
        manager
            .submit(
                &Observation::new("db-1", "FATAL: too many connections")
                    .with_severity(Severity::Critical)
                    .at(seen),
            )
            .unwrap();

        let due = manager.due_escalations(Utc::now());
        assert_eq!(due.len(), 1);
        assert!(matches!(
            due[0].1.reason,
            EscalationReason::Unacknowledged { .. }
        ));
        assert!(manager.due_escalations(Utc::now()).is_empty());
    }

    #[test]
    fn test_acknowledged_alerts_are_not_age_escalated() {
        let manager = AlertManager::default();
        let handle = manager
            .submit(
                &Observation::new("db-1", "FATAL: too many connections")
                    .with_severity(Severity::Critical)
                    .at(Utc::now() - Duration::hours(1)),
            )
            .unwrap();
        manager.acknowledge(handle.id, "operator").unwrap();

        assert!(manager.due_escalations(Utc::now()).is_empty());
    }

    #[test]
    fn test_suppression() {
        let manager = AlertManager::default();
        manager.suppress_service("Canary");

        let err = manager
            .submit(&observation("web-canary-3", "connection refused"))
            .unwrap_err();
        assert_eq!(err, AlertError::Suppressed("web-canary-3".to_string()));

        assert!(manager.unsuppress_service("canary"));
        assert!(manager
            .submit(&observation("web-canary-3", "connection refused"))
            .is_ok());
    }

    #[test]
    fn test_resolve_stale() {
        let manager = AlertManager::default();
        let now = Utc::now();
        manager
            .submit(&observation("old", "disk warning").at(now - Duration::hours(30)))
            .unwrap();
        manager
            .submit(&observation("fresh", "disk warning").at(now))
            .unwrap();

        let resolved = manager.resolve_stale(Duration::hours(24), now);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].service, "old");
    }

    #[test]
    fn test_open_alerts_sorted_by_priority() {
        let manager = AlertManager::default();
        manager
            .submit(&Observation::new("a", "slow query").with_severity(Severity::Warning))
            .unwrap();
        manager
            .submit(&Observation::new("b", "kernel panic").with_severity(Severity::Critical))
            .unwrap();
        manager
            .submit(&Observation::new("c", "job failed").with_severity(Severity::Error))
            .unwrap();

        let priorities: Vec<Priority> = manager
            .open_alerts(None)
            .iter()
            .map(|a| a.priority)
            .collect();
        assert_eq!(priorities, vec![Priority::P1, Priority::P2, Priority::P3]);
        assert_eq!(manager.open_alerts(Some(Priority::P2)).len(), 1);

        let stats = manager.stats();
        assert_eq!(stats.open, 3);
        assert_eq!(stats.p1, 1);
    }

    #[test]
    fn test_critical_alert_keeps_occurrence_window_bounded() {
        let manager = AlertManager::default();
        let start = Utc::now();
        let mut id = None;
        for i in 0..5000 {
            let handle = manager
                .submit(
                    &Observation::new("db-1", "fatal: database corrupted")
                        .with_severity(Severity::Critical)
                        .at(start + Duration::milliseconds(i)),
                )
                .unwrap();
            id = Some(handle.id);
        }

        let alert = manager.get(id.unwrap()).unwrap();
        assert_eq!(alert.priority, Priority::P1);
        assert_eq!(alert.occurrence_count, 5000);
        assert!(alert.recent.len() <= 10, "recent grew to {}", alert.recent.len());
    }

    #[test]
    fn test_resolving_releases_slot() {
        let manager = AlertManager::default();
        let handles: Vec<AlertHandle> = (0..5)
            .map(|i| {
                manager
                    .submit(&observation(&format!("svc-{}", i), "connection refused"))
                    .unwrap()
            })
            .collect();
        assert_eq!(manager.slot_count(), 5);

        manager.resolve(handles[0].id, "operator", "fixed").unwrap();
        manager.health_changed("svc-1", true);
        assert_eq!(manager.slot_count(), 3);

        let stale = manager.resolve_stale(Duration::zero(), Utc::now() + Duration::seconds(1));
        assert_eq!(stale.len(), 3);
        assert_eq!(manager.slot_count(), 0);

        // The key can be reused after its slot was released
        let again = manager.submit(&observation("svc-0", "connection refused")).unwrap();
        assert!(again.is_new);
        assert_eq!(manager.slot_count(), 1);
        assert_eq!(manager.get(again.id).unwrap().state, AlertState::Open);
    }

    #[test]
    fn test_concurrent_submit_and_resolve_keep_alerts_reachable() {
        let manager = Arc::new(AlertManager::default());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    for _ in 0..50 {
                        let handle = manager
                            .submit(&observation("web-1", "connection refused"))
                            .unwrap();
                        let _ = manager.resolve(handle.id, "operator", "retry");
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let handle = manager.submit(&observation("web-1", "connection refused")).unwrap();
        assert!(manager.get(handle.id).unwrap().is_active());
        assert_eq!(manager.open_alerts(None).len(), 1);
    }

    #[test]
    fn test_concurrent_submissions_share_one_alert() {
        let manager = Arc::new(AlertManager::default());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    (0..25)
                        .map(|j| {
                            manager
                                .submit(&observation(
                                    "web-1",
                                    &format!("worker {} request {} connection refused", i, j),
                                ))
                                .unwrap()
                        })
                        .filter(|handle| handle.is_new)
                        .count()
                })
            })
            .collect();

        let created: usize = threads.into_iter().map(|t| t.join().unwrap()).sum();
        assert_eq!(created, 1);

        let alerts = manager.open_alerts(None);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].occurrence_count, 200);
    }
}

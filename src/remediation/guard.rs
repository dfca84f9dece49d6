//! The safety guard: the authoritative gate in front of every action
//!
//! Evaluation order, first applicable rule wins:
//!
//! 1. freeze active for the service (manual or scheduled,
//!    unless the window exempts the action kind)            -> deny `frozen`
//! 2. service circuit open                                 -> deny `circuit_open`
//! 3. actions in the trailing window >= max                -> deny `rate_limited`
//! 4. since last successful action < cooldown              -> deny `cooldown`
//! 5. high risk or always-approve kind                     -> require approval
//! 6. otherwise                                            -> allow and reserve
//!
//! Rules 1-4 only apply to disruptive actions. Each service has its own state
//! behind its own mutex, so check-and-reserve is atomic per service.
//!
//! Maintenance windows never change a decision. High-risk actions still go
//! to a human inside a window; the active window is reported so approvers
//! can see it.

use crate::alerts::AlertId;
use crate::circuit::{Admission, CircuitBreaker, CircuitState};
use crate::events::Timestamp;
use crate::rate_limiter::RateLimiter;
use crate::remediation::action::{ActionKind, ActionProposal, RiskTier};
use chrono::{Datelike, Duration, NaiveTime, Utc, Weekday};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Violations kept for `violations()`
const MAX_VIOLATIONS: usize = 1000;

/// Why an action was not allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Frozen,
    CircuitOpen,
    RateLimited,
    Cooldown,
    ApprovalTimeout,
    ApprovalRejected,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::Frozen => "frozen",
            DenyReason::CircuitOpen => "circuit_open",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::Cooldown => "cooldown",
            DenyReason::ApprovalTimeout => "approval_timeout",
            DenyReason::ApprovalRejected => "approval_rejected",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A denial with a human-readable explanation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    pub reason: DenyReason,
    pub detail: String,
}

/// Claim on guard capacity handed out with `Allow`
///
/// Must be given back through `complete` or `release`.
#[derive(Debug, PartialEq, Eq)]
pub struct Reservation {
    pub service: String,
    pub kind: ActionKind,
    /// Rate-limit slot, only for disruptive actions
    slot: Option<Timestamp>,
    /// Whether this action is the half-open circuit trial
    trial: bool,
}

impl Reservation {
    pub fn is_trial(&self) -> bool {
        self.trial
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum GateDecision {
    Allow(Reservation),
    Deny(Denial),
    RequireApproval,
}

/// Scheduled maintenance freeze
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreezeWindow {
    pub name: String,
    pub start: Timestamp,
    pub end: Timestamp,
    /// Services covered; empty means every service
    #[serde(default)]
    pub services: Vec<String>,
    /// Action kinds still permitted while the window is active
    #[serde(default)]
    pub allowed_actions: Vec<ActionKind>,
}

impl FreezeWindow {
    pub fn covers(&self, service: &str, now: Timestamp) -> bool {
        now >= self.start
            && now < self.end
            && (self.services.is_empty() || self.services.iter().any(|s| s == service))
    }

    /// Whether this window stops `kind` on `service` at `now`
    pub fn blocks(&self, service: &str, kind: ActionKind, now: Timestamp) -> bool {
        self.covers(service, now) && !self.allowed_actions.contains(&kind)
    }
}

/// Recurring maintenance window, in UTC
///
/// `end` before `start` wraps past midnight; the window then belongs to the
/// day it starts on. Equal `start` and `end` cover the whole day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub name: String,
    /// Days the window opens on; empty means every day
    #[serde(default)]
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl MaintenanceWindow {
    pub fn contains(&self, now: Timestamp) -> bool {
        let time = now.time();
        let on = |day: Weekday| self.days.is_empty() || self.days.contains(&day);

        if self.start == self.end {
            on(now.weekday())
        } else if self.start < self.end {
            on(now.weekday()) && time >= self.start && time < self.end
        } else if time >= self.start {
            on(now.weekday())
        } else {
            time < self.end && on(now.weekday().pred())
        }
    }
}

/// A denied proposal, kept for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    pub service: String,
    pub alert_id: AlertId,
    pub proposal_id: Uuid,
    pub kind: ActionKind,
    pub reason: DenyReason,
    pub detail: String,
    pub at: Timestamp,
}

#[derive(Debug, Clone)]
pub struct GuardSettings {
    pub max_actions_per_window: usize,
    pub window: Duration,
    pub cooldown: Duration,
    /// Consecutive executor failures that open a service's circuit
    pub failure_threshold: u32,
    pub cool_off: Duration,
    /// Kinds that always need a human, whatever their risk
    pub always_approve: Vec<ActionKind>,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            max_actions_per_window: 3,
            window: Duration::hours(1),
            cooldown: Duration::minutes(10),
            failure_threshold: 3,
            cool_off: Duration::minutes(30),
            always_approve: vec![ActionKind::Redeploy, ActionKind::Reboot],
        }
    }
}

#[derive(Debug)]
struct ServiceGuard {
    slots: RateLimiter,
    last_success: Option<Timestamp>,
    breaker: CircuitBreaker,
    /// Manual freeze with its reason
    frozen: Option<String>,
}

/// Guard state of one service as reported by `stats`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceGuardStatus {
    pub service: String,
    pub actions_in_window: usize,
    pub last_success: Option<Timestamp>,
    pub circuit: CircuitState,
    pub frozen: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuardStats {
    pub services: Vec<ServiceGuardStatus>,
    pub freeze_windows: Vec<FreezeWindow>,
    pub maintenance_windows: Vec<MaintenanceWindow>,
    /// Name of the maintenance window open right now
    pub in_maintenance_window: Option<String>,
    pub violations: usize,
}

pub struct SafetyGuard {
    settings: GuardSettings,
    services: RwLock<HashMap<String, Arc<Mutex<ServiceGuard>>>>,
    freeze_windows: RwLock<Vec<FreezeWindow>>,
    maintenance_windows: RwLock<Vec<MaintenanceWindow>>,
    violations: Mutex<VecDeque<Violation>>,
}

impl Default for SafetyGuard {
    fn default() -> Self {
        Self::new(GuardSettings::default())
    }
}

impl SafetyGuard {
    pub fn new(settings: GuardSettings) -> Self {
        Self {
            settings,
            services: RwLock::new(HashMap::new()),
            freeze_windows: RwLock::new(Vec::new()),
            maintenance_windows: RwLock::new(Vec::new()),
            violations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn settings(&self) -> &GuardSettings {
        &self.settings
    }

    fn service_state(&self, service: &str) -> Arc<Mutex<ServiceGuard>> {
        if let Some(state) = self.services.read().unwrap().get(service) {
            return Arc::clone(state);
        }

        let mut services = self.services.write().unwrap();
        Arc::clone(services.entry(service.to_string()).or_insert_with(|| {
            Arc::new(Mutex::new(ServiceGuard {
                slots: RateLimiter::new(self.settings.max_actions_per_window, self.settings.window),
                last_success: None,
                breaker: CircuitBreaker::new(self.settings.failure_threshold, self.settings.cool_off),
                frozen: None,
            }))
        }))
    }

    pub fn evaluate(&self, proposal: &ActionProposal) -> GateDecision {
        self.evaluate_at(proposal, Utc::now())
    }

    /// Gate a proposal at an explicit time
    pub fn evaluate_at(&self, proposal: &ActionProposal, now: Timestamp) -> GateDecision {
        let state = self.service_state(&proposal.service);
        let mut state = state.lock().unwrap();

        if proposal.kind.is_disruptive() {
            if let Some(denial) = self.check_limits(&mut state, proposal, now) {
                drop(state);
                self.record_violation(proposal, &denial, now);
                return GateDecision::Deny(denial);
            }
        }

        if proposal.risk == RiskTier::High || self.settings.always_approve.contains(&proposal.kind) {
            info!(
                "{} on '{}' ({} risk) requires approval",
                proposal.kind, proposal.service, proposal.risk
            );
            return GateDecision::RequireApproval;
        }

        GateDecision::Allow(self.reserve(&mut state, proposal, now))
    }

    pub fn evaluate_approved(&self, proposal: &ActionProposal) -> Result<Reservation, Denial> {
        self.evaluate_approved_at(proposal, Utc::now())
    }

    /// Re-check the hard limits after a human approval and reserve
    ///
    /// Time has passed while waiting, so freeze, circuit, rate limit and
    /// cooldown may have changed.
    pub fn evaluate_approved_at(
        &self,
        proposal: &ActionProposal,
        now: Timestamp,
    ) -> Result<Reservation, Denial> {
        let state = self.service_state(&proposal.service);
        let mut state = state.lock().unwrap();

        if proposal.kind.is_disruptive() {
            if let Some(denial) = self.check_limits(&mut state, proposal, now) {
                drop(state);
                self.record_violation(proposal, &denial, now);
                return Err(denial);
            }
        }

        Ok(self.reserve(&mut state, proposal, now))
    }

    /// Rules 1-4
    fn check_limits(
        &self,
        state: &mut ServiceGuard,
        proposal: &ActionProposal,
        now: Timestamp,
    ) -> Option<Denial> {
        let denial = |reason: DenyReason, detail: String| {
            warn!(
                "Denied {} on '{}': {} ({})",
                proposal.kind, proposal.service, reason, detail
            );
            Some(Denial { reason, detail })
        };

        if let Some(reason) = &state.frozen {
            return denial(DenyReason::Frozen, format!("service frozen: {}", reason));
        }
        if let Some(window) = self
            .freeze_windows
            .read()
            .unwrap()
            .iter()
            .find(|w| w.blocks(&proposal.service, proposal.kind, now))
        {
            return denial(
                DenyReason::Frozen,
                format!("freeze window '{}' until {}", window.name, window.end.to_rfc3339()),
            );
        }

        if state.breaker.peek(now) == Admission::Rejected {
            let detail = match state.breaker.state() {
                CircuitState::Open { until } => format!("circuit open until {}", until.to_rfc3339()),
                _ => "circuit half-open, trial action in progress".to_string(),
            };
            return denial(DenyReason::CircuitOpen, detail);
        }

        let count = state.slots.count_at(now);
        if count >= state.slots.max_per_window() {
            return denial(
                DenyReason::RateLimited,
                format!(
                    "{} action(s) in the last {} minute(s), max {}",
                    count,
                    self.settings.window.num_minutes(),
                    state.slots.max_per_window()
                ),
            );
        }

        if let Some(last) = state.last_success {
            let elapsed = now - last;
            if elapsed < self.settings.cooldown {
                return denial(
                    DenyReason::Cooldown,
                    format!(
                        "last successful action {}s ago, cooldown {}s",
                        elapsed.num_seconds(),
                        self.settings.cooldown.num_seconds()
                    ),
                );
            }
        }

        None
    }

    fn reserve(
        &self,
        state: &mut ServiceGuard,
        proposal: &ActionProposal,
        now: Timestamp,
    ) -> Reservation {
        if !proposal.kind.is_disruptive() {
            return Reservation {
                service: proposal.service.clone(),
                kind: proposal.kind,
                slot: None,
                trial: false,
            };
        }

        state.slots.record_at(now);
        let trial = state.breaker.admit(now) == Admission::Trial;
        debug!(
            "Reserved action slot on '{}' ({} in window, trial={})",
            proposal.service,
            state.slots.count_at(now),
            trial
        );

        Reservation {
            service: proposal.service.clone(),
            kind: proposal.kind,
            slot: Some(now),
            trial,
        }
    }

    pub fn complete(&self, reservation: Reservation, success: bool) {
        self.complete_at(reservation, success, Utc::now());
    }

    /// Settle a reservation once the action has run
    ///
    /// Success starts the cooldown and closes the circuit. Failure gives the
    /// rate-limit slot back but counts towards the circuit breaker.
    pub fn complete_at(&self, reservation: Reservation, success: bool, now: Timestamp) {
        let Some(slot) = reservation.slot else {
            return;
        };

        let state = self.service_state(&reservation.service);
        let mut state = state.lock().unwrap();
        if success {
            state.last_success = Some(now);
            state.breaker.record_success();
        } else {
            state.slots.release(slot);
            state.breaker.record_failure(now);
            if state.breaker.is_open_at(now) {
                warn!(
                    "Circuit opened for '{}' after {} consecutive failed action(s)",
                    reservation.service, self.settings.failure_threshold
                );
            }
        }
    }

    /// Give back a reservation whose action never ran
    pub fn release(&self, reservation: Reservation) {
        let Some(slot) = reservation.slot else {
            return;
        };

        let state = self.service_state(&reservation.service);
        let mut state = state.lock().unwrap();
        state.slots.release(slot);
        if reservation.trial {
            state.breaker.release_trial();
        }
    }

    pub fn freeze_service(&self, service: &str, reason: &str) {
        info!("Freezing remediation for '{}': {}", service, reason);
        let state = self.service_state(service);
        state.lock().unwrap().frozen = Some(reason.to_string());
    }

    /// Returns `false` if the service was not frozen
    pub fn unfreeze_service(&self, service: &str) -> bool {
        let state = self.service_state(service);
        let was_frozen = state.lock().unwrap().frozen.take().is_some();
        if was_frozen {
            info!("Unfroze remediation for '{}'", service);
        }
        was_frozen
    }

    pub fn add_freeze_window(&self, window: FreezeWindow) {
        info!(
            "Adding freeze window '{}' ({} to {})",
            window.name,
            window.start.to_rfc3339(),
            window.end.to_rfc3339()
        );
        self.freeze_windows.write().unwrap().push(window);
    }

    /// Returns `false` if no window had that name
    pub fn remove_freeze_window(&self, name: &str) -> bool {
        let mut windows = self.freeze_windows.write().unwrap();
        let before = windows.len();
        windows.retain(|w| w.name != name);
        windows.len() != before
    }

    pub fn add_maintenance_window(&self, window: MaintenanceWindow) {
        info!(
            "Adding maintenance window '{}' ({} to {} UTC)",
            window.name, window.start, window.end
        );
        self.maintenance_windows.write().unwrap().push(window);
    }

    /// The maintenance window open at `now`, if any
    pub fn active_maintenance_window(&self, now: Timestamp) -> Option<MaintenanceWindow> {
        self.maintenance_windows
            .read()
            .unwrap()
            .iter()
            .find(|w| w.contains(now))
            .cloned()
    }

    /// Force a service's circuit closed; returns `false` for unknown services
    pub fn reset_circuit(&self, service: &str) -> bool {
        let Some(state) = self.services.read().unwrap().get(service).cloned() else {
            return false;
        };
        state.lock().unwrap().breaker.reset();
        info!("Circuit reset for '{}'", service);
        true
    }

    fn record_violation(&self, proposal: &ActionProposal, denial: &Denial, now: Timestamp) {
        let mut violations = self.violations.lock().unwrap();
        violations.push_back(Violation {
            service: proposal.service.clone(),
            alert_id: proposal.alert_id,
            proposal_id: proposal.id,
            kind: proposal.kind,
            reason: denial.reason,
            detail: denial.detail.clone(),
            at: now,
        });
        while violations.len() > MAX_VIOLATIONS {
            violations.pop_front();
        }
    }

    /// Most recent denials, newest first
    pub fn violations(&self, limit: usize) -> Vec<Violation> {
        self.violations
            .lock()
            .unwrap()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> GuardStats {
        let now = Utc::now();
        let entries: Vec<(String, Arc<Mutex<ServiceGuard>>)> = self
            .services
            .read()
            .unwrap()
            .iter()
            .map(|(name, state)| (name.clone(), Arc::clone(state)))
            .collect();

        let mut services: Vec<ServiceGuardStatus> = entries
            .into_iter()
            .map(|(service, state)| {
                let mut state = state.lock().unwrap();
                ServiceGuardStatus {
                    service,
                    actions_in_window: state.slots.count_at(now),
                    last_success: state.last_success,
                    circuit: state.breaker.state(),
                    frozen: state.frozen.clone(),
                }
            })
            .collect();
        services.sort_by(|a, b| a.service.cmp(&b.service));

        GuardStats {
            services,
            freeze_windows: self.freeze_windows.read().unwrap().clone(),
            maintenance_windows: self.maintenance_windows.read().unwrap().clone(),
            in_maintenance_window: self.active_maintenance_window(now).map(|w| w.name),
            violations: self.violations.lock().unwrap().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn proposal(service: &str, kind: ActionKind, risk: RiskTier) -> ActionProposal {
        ActionProposal {
            id: Uuid::new_v4(),
            alert_id: AlertId::new(),
            service: service.to_string(),
            kind,
            target: service.to_string(),
            risk,
            confidence: 0.9,
            rationale: "test".to_string(),
            rule: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    fn restart(service: &str) -> ActionProposal {
        proposal(service, ActionKind::Restart, RiskTier::Low)
    }

    fn allow(decision: GateDecision) -> Reservation {
        match decision {
            GateDecision::Allow(reservation) => reservation,
            other => panic!("expected allow, got {:?}", other),
        }
    }

    fn denied(decision: GateDecision) -> DenyReason {
        match decision {
            GateDecision::Deny(denial) => denial.reason,
            other => panic!("expected deny, got {:?}", other),
        }
    }

    fn no_cooldown() -> GuardSettings {
        GuardSettings {
            cooldown: Duration::zero(),
            ..GuardSettings::default()
        }
    }

    #[test]
    fn test_rate_limit_denies_at_max() {
        let guard = SafetyGuard::new(no_cooldown());
        let now = Utc::now();

        for i in 0..3 {
            let reservation = allow(guard.evaluate_at(&restart("db-1"), now + Duration::minutes(i)));
            guard.complete_at(reservation, true, now + Duration::minutes(i));
        }

        let decision = guard.evaluate_at(&restart("db-1"), now + Duration::minutes(5));
        assert_eq!(denied(decision), DenyReason::RateLimited);

        // Other services are unaffected
        allow(guard.evaluate_at(&restart("web-1"), now));

        // Slots expire with the window
        allow(guard.evaluate_at(&restart("db-1"), now + Duration::minutes(61)));
    }

    #[test]
    fn test_cooldown_boundary() {
        let guard = SafetyGuard::default();
        let now = Utc::now();

        let reservation = allow(guard.evaluate_at(&restart("web-1"), now));
        guard.complete_at(reservation, true, now);

        let just_before = now + Duration::minutes(10) - Duration::seconds(1);
        assert_eq!(
            denied(guard.evaluate_at(&restart("web-1"), just_before)),
            DenyReason::Cooldown
        );

        // Elapsed == cooldown passes
        allow(guard.evaluate_at(&restart("web-1"), now + Duration::minutes(10)));
    }

    #[test]
    fn test_failed_action_does_not_start_cooldown() {
        let guard = SafetyGuard::default();
        let now = Utc::now();

        let reservation = allow(guard.evaluate_at(&restart("web-1"), now));
        guard.complete_at(reservation, false, now);

        let reservation = allow(guard.evaluate_at(&restart("web-1"), now + Duration::seconds(1)));
        // The failed attempt's slot was given back
        assert_eq!(reservation.slot, Some(now + Duration::seconds(1)));
        let stats = guard.stats();
        assert_eq!(stats.services[0].actions_in_window, 1);
    }

    #[test]
    fn test_circuit_opens_after_consecutive_failures() {
        let guard = SafetyGuard::new(no_cooldown());
        let now = Utc::now();

        for i in 0..3 {
            let at = now + Duration::seconds(i);
            let reservation = allow(guard.evaluate_at(&restart("api"), at));
            guard.complete_at(reservation, false, at);
        }

        let at = now + Duration::minutes(1);
        assert_eq!(denied(guard.evaluate_at(&restart("api"), at)), DenyReason::CircuitOpen);

        // After the cool-off exactly one trial is allowed
        let after = now + Duration::minutes(31);
        let trial = allow(guard.evaluate_at(&restart("api"), after));
        assert!(trial.is_trial());
        assert_eq!(
            denied(guard.evaluate_at(&restart("api"), after)),
            DenyReason::CircuitOpen
        );

        // The trial succeeds and the circuit closes
        guard.complete_at(trial, true, after);
        allow(guard.evaluate_at(&restart("api"), after + Duration::seconds(1)));
    }

    #[test]
    fn test_failed_trial_reopens_circuit() {
        let guard = SafetyGuard::new(GuardSettings {
            failure_threshold: 1,
            ..no_cooldown()
        });
        let now = Utc::now();

        let reservation = allow(guard.evaluate_at(&restart("api"), now));
        guard.complete_at(reservation, false, now);

        let after = now + Duration::minutes(31);
        let trial = allow(guard.evaluate_at(&restart("api"), after));
        guard.complete_at(trial, false, after);

        assert_eq!(
            denied(guard.evaluate_at(&restart("api"), after + Duration::minutes(1))),
            DenyReason::CircuitOpen
        );
    }

    #[test]
    fn test_freeze_wins_over_everything() {
        let guard = SafetyGuard::default();
        let now = Utc::now();

        guard.freeze_service("db-1", "schema migration");
        assert_eq!(denied(guard.evaluate_at(&restart("db-1"), now)), DenyReason::Frozen);
        assert!(guard.unfreeze_service("db-1"));
        assert!(!guard.unfreeze_service("db-1"));
        allow(guard.evaluate_at(&restart("db-1"), now));
    }

    #[test]
    fn test_scheduled_freeze_window() {
        let guard = SafetyGuard::default();
        let now = Utc::now();
        guard.add_freeze_window(FreezeWindow {
            name: "release".to_string(),
            start: now,
            end: now + Duration::hours(2),
            services: vec!["web-1".to_string()],
            allowed_actions: vec![],
        });

        assert_eq!(
            denied(guard.evaluate_at(&restart("web-1"), now + Duration::minutes(30))),
            DenyReason::Frozen
        );
        allow(guard.evaluate_at(&restart("db-1"), now + Duration::minutes(30)));
        allow(guard.evaluate_at(&restart("web-1"), now + Duration::hours(2)));

        assert!(guard.remove_freeze_window("release"));
        assert!(!guard.remove_freeze_window("release"));
    }

    #[test]
    fn test_freeze_window_exempts_allowed_actions() {
        let guard = SafetyGuard::default();
        let now = Utc::now();
        guard.add_freeze_window(FreezeWindow {
            name: "holiday".to_string(),
            start: now - Duration::hours(1),
            end: now + Duration::hours(1),
            services: vec![],
            allowed_actions: vec![ActionKind::Restart],
        });

        allow(guard.evaluate_at(&restart("web-1"), now));
        let redeploy = proposal("web-1", ActionKind::Redeploy, RiskTier::Medium);
        assert_eq!(denied(guard.evaluate_at(&redeploy, now)), DenyReason::Frozen);
    }

    fn nightly() -> MaintenanceWindow {
        MaintenanceWindow {
            name: "nightly".to_string(),
            days: vec![Weekday::Mon, Weekday::Tue],
            start: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(5, 0, 0).unwrap(),
        }
    }

    fn utc(s: &str) -> Timestamp {
        chrono::DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_maintenance_window_days_and_hours() {
        let window = nightly();
        // 2024-06-03 is a Monday
        assert!(window.contains(utc("2024-06-03T02:00:00Z")));
        assert!(window.contains(utc("2024-06-04T04:59:59Z")));
        assert!(!window.contains(utc("2024-06-03T05:00:00Z")));
        assert!(!window.contains(utc("2024-06-05T03:00:00Z")));

        let overnight = MaintenanceWindow {
            name: "overnight".to_string(),
            days: vec![Weekday::Fri],
            start: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(2, 0, 0).unwrap(),
        };
        assert!(overnight.contains(utc("2024-06-07T23:00:00Z")));
        assert!(overnight.contains(utc("2024-06-08T01:00:00Z")));
        assert!(!overnight.contains(utc("2024-06-09T01:00:00Z")));
    }

    #[test]
    fn test_maintenance_window_still_requires_approval() {
        let guard = SafetyGuard::default();
        guard.add_maintenance_window(nightly());
        let inside = utc("2024-06-03T03:00:00Z");

        let high = proposal("db-1", ActionKind::Restart, RiskTier::High);
        assert_eq!(guard.evaluate_at(&high, inside), GateDecision::RequireApproval);
        assert_eq!(
            guard.active_maintenance_window(inside).map(|w| w.name),
            Some("nightly".to_string())
        );
        assert!(guard
            .active_maintenance_window(utc("2024-06-03T12:00:00Z"))
            .is_none());
        assert_eq!(guard.stats().maintenance_windows.len(), 1);
    }

    #[test]
    fn test_high_risk_requires_approval() {
        let guard = SafetyGuard::default();
        let high = proposal("db-1", ActionKind::NotifyOnly, RiskTier::High);
        assert_eq!(guard.evaluate(&high), GateDecision::RequireApproval);

        let redeploy = proposal("db-1", ActionKind::Redeploy, RiskTier::Medium);
        assert_eq!(guard.evaluate(&redeploy), GateDecision::RequireApproval);
    }

    #[test]
    fn test_limits_checked_before_approval() {
        let guard = SafetyGuard::default();
        guard.freeze_service("db-1", "maintenance");
        let redeploy = proposal("db-1", ActionKind::Redeploy, RiskTier::High);
        assert_eq!(denied(guard.evaluate(&redeploy)), DenyReason::Frozen);
    }

    #[test]
    fn test_notifications_bypass_limits() {
        let guard = SafetyGuard::default();
        guard.freeze_service("db-1", "maintenance");
        let notify = proposal("db-1", ActionKind::NotifyOnly, RiskTier::Low);
        let reservation = allow(guard.evaluate(&notify));
        assert_eq!(reservation.slot, None);
    }

    #[test]
    fn test_evaluate_approved_rechecks_limits() {
        let guard = SafetyGuard::new(GuardSettings {
            max_actions_per_window: 1,
            ..no_cooldown()
        });
        let now = Utc::now();
        let redeploy = proposal("api", ActionKind::Redeploy, RiskTier::High);

        assert_eq!(guard.evaluate_at(&redeploy, now), GateDecision::RequireApproval);
        // Another action takes the only slot while approval is pending
        allow(guard.evaluate_at(&restart("api"), now));

        let denial = guard.evaluate_approved_at(&redeploy, now).unwrap_err();
        assert_eq!(denial.reason, DenyReason::RateLimited);
        assert_eq!(guard.violations(10).len(), 1);
    }

    #[test]
    fn test_release_returns_slot() {
        let guard = SafetyGuard::new(GuardSettings {
            max_actions_per_window: 1,
            ..no_cooldown()
        });
        let now = Utc::now();

        let reservation = allow(guard.evaluate_at(&restart("api"), now));
        assert_eq!(denied(guard.evaluate_at(&restart("api"), now)), DenyReason::RateLimited);
        guard.release(reservation);
        allow(guard.evaluate_at(&restart("api"), now));
    }

    #[test]
    fn test_reset_circuit() {
        let guard = SafetyGuard::new(GuardSettings {
            failure_threshold: 1,
            ..no_cooldown()
        });
        let now = Utc::now();
        assert!(!guard.reset_circuit("api"));

        let reservation = allow(guard.evaluate_at(&restart("api"), now));
        guard.complete_at(reservation, false, now);
        assert_eq!(denied(guard.evaluate_at(&restart("api"), now)), DenyReason::CircuitOpen);

        assert!(guard.reset_circuit("api"));
        allow(guard.evaluate_at(&restart("api"), now));
    }

    #[test]
    fn test_concurrent_evaluation_respects_limit() {
        let guard = Arc::new(SafetyGuard::new(no_cooldown()));
        let now = Utc::now();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let guard = Arc::clone(&guard);
                std::thread::spawn(move || {
                    matches!(guard.evaluate_at(&restart("db-1"), now), GateDecision::Allow(_))
                })
            })
            .collect();

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(allowed, 3);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    /// Never more than `max` allows inside any window, whatever the outcomes
    #[quickcheck]
    fn prop_allows_never_exceed_rate_limit(outcomes: Vec<bool>, max: u8) -> bool {
        let max = (max % 5) as usize + 1;
        let guard = SafetyGuard::new(GuardSettings {
            max_actions_per_window: max,
            cooldown: Duration::zero(),
            failure_threshold: u32::MAX,
            ..GuardSettings::default()
        });
        let now = Utc::now();
        let mut successes = 0;

        for (i, success) in outcomes.into_iter().enumerate() {
            let at = now + Duration::seconds(i as i64);
            let proposal = super::tests::proposal("svc", ActionKind::Restart, RiskTier::Low);
            match guard.evaluate_at(&proposal, at) {
                GateDecision::Allow(reservation) => {
                    if success {
                        successes += 1;
                    }
                    guard.complete_at(reservation, success, at);
                }
                GateDecision::Deny(denial) => {
                    if denial.reason != DenyReason::RateLimited || successes < max {
                        return false;
                    }
                }
                GateDecision::RequireApproval => return false,
            }
        }
        successes <= max
    }
}

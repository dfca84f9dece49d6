use crate::alerts::fingerprint::Fingerprint;
use crate::analysis::Diagnosis;
use crate::error::AlertError;
use crate::events::{Severity, Timestamp};
use crate::remediation::ActionProposal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Longest alert title kept from the triggering observation
const MAX_TITLE_CHARS: usize = 120;

/// Unique identifier of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(Uuid);

impl AlertId {
    pub fn new() -> Self {
        AlertId(Uuid::new_v4())
    }
}

impl Default for AlertId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for AlertId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(AlertId)
    }
}

/// Alert priority, `P1` being the most urgent
///
/// Ordering follows urgency: `P1 < P2 < P3`, so sorting ascending puts the
/// most urgent alerts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Priority {
    /// Priority of a newly opened alert
    pub fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Critical => Priority::P1,
            Severity::Error => Priority::P2,
            Severity::Warning | Severity::Info => Priority::P3,
        }
    }

    /// One level more urgent, saturating at `P1`
    pub fn raised(self) -> Self {
        match self {
            Priority::P3 => Priority::P2,
            Priority::P2 | Priority::P1 => Priority::P1,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        };
        f.write_str(label)
    }
}

/// Lifecycle state of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertState {
    /// The state reached by `transition`, or `None` if it is not allowed
    ///
    /// ```text
    /// open -> acknowledged -> resolved
    /// open -----------------> resolved
    /// ```
    pub fn apply(self, transition: AlertTransition) -> Option<AlertState> {
        match (self, transition) {
            (AlertState::Open, AlertTransition::Acknowledge) => Some(AlertState::Acknowledged),
            (AlertState::Open, AlertTransition::Resolve)
            | (AlertState::Acknowledged, AlertTransition::Resolve) => Some(AlertState::Resolved),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        self != AlertState::Resolved
    }
}

impl fmt::Display for AlertState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AlertState::Open => "open",
            AlertState::Acknowledged => "acknowledged",
            AlertState::Resolved => "resolved",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertTransition {
    Acknowledge,
    Resolve,
}

impl AlertTransition {
    fn target(self) -> AlertState {
        match self {
            AlertTransition::Acknowledge => AlertState::Acknowledged,
            AlertTransition::Resolve => AlertState::Resolved,
        }
    }
}

/// The durable unit of work: one deduplicated error signature on one service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    pub fingerprint: Fingerprint,
    pub service: String,
    pub title: String,
    /// Error class from the fingerprint pattern table
    pub error_class: String,
    pub severity: Severity,
    pub priority: Priority,
    pub state: AlertState,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub occurrence_count: u64,
    /// Context lines of the first observation, handed to the analyzer
    pub context: Vec<String>,
    /// Every diagnosis computed for this alert, oldest first
    pub diagnoses: Vec<Diagnosis>,
    pub latest_proposal: Option<ActionProposal>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<Timestamp>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<Timestamp>,
    pub resolution: Option<String>,
    /// Priority at which the unacknowledged-age escalation last fired
    pub age_escalated_at: Option<Priority>,
    /// Occurrence times inside the current escalation window
    #[serde(skip)]
    pub(crate) recent: VecDeque<Timestamp>,
}

impl Alert {
    pub(crate) fn open(
        fingerprint: Fingerprint,
        service: &str,
        text: &str,
        error_class: &str,
        severity: Severity,
        context: Vec<String>,
        seen: Timestamp,
    ) -> Self {
        let mut recent = VecDeque::new();
        recent.push_back(seen);

        Self {
            id: AlertId::new(),
            fingerprint,
            service: service.to_string(),
            title: text.trim().chars().take(MAX_TITLE_CHARS).collect(),
            error_class: error_class.to_string(),
            severity,
            priority: Priority::from_severity(severity),
            state: AlertState::Open,
            first_seen: seen,
            last_seen: seen,
            occurrence_count: 1,
            context,
            diagnoses: Vec::new(),
            latest_proposal: None,
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            resolution: None,
            age_escalated_at: None,
            recent,
        }
    }

    pub fn latest_diagnosis(&self) -> Option<&Diagnosis> {
        self.diagnoses.last()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Register another observation with the same fingerprint
    pub(crate) fn record_occurrence(&mut self, seen: Timestamp) {
        self.occurrence_count += 1;
        if seen > self.last_seen {
            self.last_seen = seen;
        }
        self.recent.push_back(seen);
    }

    /// Apply a lifecycle transition, recording who made it
    pub(crate) fn transition(
        &mut self,
        transition: AlertTransition,
        actor: &str,
        reason: Option<&str>,
        now: Timestamp,
    ) -> Result<(), AlertError> {
        let next = self
            .state
            .apply(transition)
            .ok_or(AlertError::InvalidTransition {
                id: self.id,
                from: self.state,
                to: transition.target(),
            })?;

        match next {
            AlertState::Acknowledged => {
                self.acknowledged_by = Some(actor.to_string());
                self.acknowledged_at = Some(now);
            }
            AlertState::Resolved => {
                self.resolved_by = Some(actor.to_string());
                self.resolved_at = Some(now);
                self.resolution = reason.map(str::to_string);
            }
            AlertState::Open => {}
        }
        self.state = next;
        Ok(())
    }
}

/// Why an alert's priority went up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EscalationReason {
    /// Too many occurrences inside the escalation window
    OccurrenceRate { occurrences: u32, window_seconds: i64 },
    /// Left unacknowledged past the threshold for its priority
    Unacknowledged { age_seconds: i64 },
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationReason::OccurrenceRate {
                occurrences,
                window_seconds,
            } => write!(f, "{} occurrences within {}s", occurrences, window_seconds),
            EscalationReason::Unacknowledged { age_seconds } => {
                write!(f, "unacknowledged for {}s", age_seconds)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub from: Priority,
    pub to: Priority,
    pub reason: EscalationReason,
}

/// What `submit` hands back to the caller
#[derive(Debug, Clone, PartialEq)]
pub struct AlertHandle {
    pub id: AlertId,
    pub fingerprint: Fingerprint,
    pub service: String,
    pub priority: Priority,
    pub occurrence_count: u64,
    /// `true` only for the observation that created the alert
    pub is_new: bool,
    pub escalated: Option<Escalation>,
}

impl AlertHandle {
    pub(crate) fn of(alert: &Alert, is_new: bool, escalated: Option<Escalation>) -> Self {
        Self {
            id: alert.id,
            fingerprint: alert.fingerprint.clone(),
            service: alert.service.clone(),
            priority: alert.priority,
            occurrence_count: alert.occurrence_count,
            is_new,
            escalated,
        }
    }
}

use crate::alerts::{Alert, AlertId, Escalation, Priority};
use crate::analysis::Diagnosis;
use crate::events::{Severity, Timestamp};
use crate::remediation::{ActionProposal, ActionRecord, ApprovalOutcome, ApprovalRequest};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Discriminant of [`AuditPayload`], used for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    AlertOpened,
    AlertEscalated,
    AlertAcknowledged,
    AlertResolved,
    DiagnosisRecorded,
    ActionProposed,
    ApprovalRequested,
    ApprovalResolved,
    ActionRecorded,
}

impl AuditKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditKind::AlertOpened => "alert_opened",
            AuditKind::AlertEscalated => "alert_escalated",
            AuditKind::AlertAcknowledged => "alert_acknowledged",
            AuditKind::AlertResolved => "alert_resolved",
            AuditKind::DiagnosisRecorded => "diagnosis_recorded",
            AuditKind::ActionProposed => "action_proposed",
            AuditKind::ApprovalRequested => "approval_requested",
            AuditKind::ApprovalResolved => "approval_resolved",
            AuditKind::ActionRecorded => "action_recorded",
        }
    }
}

impl fmt::Display for AuditKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditPayload {
    AlertOpened {
        fingerprint: String,
        title: String,
        error_class: String,
        severity: Severity,
    },
    AlertEscalated {
        escalation: Escalation,
    },
    AlertAcknowledged {
        by: String,
    },
    AlertResolved {
        by: String,
        reason: Option<String>,
    },
    DiagnosisRecorded {
        diagnosis: Diagnosis,
    },
    ActionProposed {
        proposal: ActionProposal,
    },
    ApprovalRequested {
        request: ApprovalRequest,
        /// Maintenance window open when the request was made
        #[serde(default, skip_serializing_if = "Option::is_none")]
        maintenance_window: Option<String>,
    },
    ApprovalResolved {
        outcome: ApprovalOutcome,
    },
    ActionRecorded {
        record: ActionRecord,
    },
}

impl AuditPayload {
    pub fn kind(&self) -> AuditKind {
        match self {
            AuditPayload::AlertOpened { .. } => AuditKind::AlertOpened,
            AuditPayload::AlertEscalated { .. } => AuditKind::AlertEscalated,
            AuditPayload::AlertAcknowledged { .. } => AuditKind::AlertAcknowledged,
            AuditPayload::AlertResolved { .. } => AuditKind::AlertResolved,
            AuditPayload::DiagnosisRecorded { .. } => AuditKind::DiagnosisRecorded,
            AuditPayload::ActionProposed { .. } => AuditKind::ActionProposed,
            AuditPayload::ApprovalRequested { .. } => AuditKind::ApprovalRequested,
            AuditPayload::ApprovalResolved { .. } => AuditKind::ApprovalResolved,
            AuditPayload::ActionRecorded { .. } => AuditKind::ActionRecorded,
        }
    }
}

/// One entry of the append-only audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    /// Position in the trail, assigned by the logger
    pub sequence: u64,
    pub timestamp: Timestamp,
    pub service: String,
    pub alert_id: Option<AlertId>,
    pub priority: Option<Priority>,
    /// `system`, `operator:<name>`, `llm:<backend>` or `heuristic`
    pub actor: String,
    pub payload: AuditPayload,
}

impl AuditEvent {
    pub fn new(service: impl Into<String>, actor: impl Into<String>, payload: AuditPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            service: service.into(),
            alert_id: None,
            priority: None,
            actor: actor.into(),
            payload,
        }
    }

    /// An event about `alert`, carrying its id and current priority
    pub fn for_alert(alert: &Alert, actor: impl Into<String>, payload: AuditPayload) -> Self {
        let mut event = Self::new(alert.service.clone(), actor, payload);
        event.alert_id = Some(alert.id);
        event.priority = Some(alert.priority);
        event
    }

    pub fn kind(&self) -> AuditKind {
        self.payload.kind()
    }
}

/// Filter for [`AuditLogger::query`](crate::audit::AuditLogger::query)
///
/// Unset fields match everything; `since` and `until` are inclusive.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditQuery {
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub service: Option<String>,
    pub priority: Option<Priority>,
    pub kind: Option<AuditKind>,
    pub alert_id: Option<AlertId>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.since.map_or(true, |since| event.timestamp >= since)
            && self.until.map_or(true, |until| event.timestamp <= until)
            && self.service.as_ref().map_or(true, |s| event.service == *s)
            && self.priority.map_or(true, |p| event.priority == Some(p))
            && self.kind.map_or(true, |k| event.kind() == k)
            && self.alert_id.map_or(true, |id| event.alert_id == Some(id))
    }
}

/// Denied action listed in a compliance report
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DenialEntry {
    pub at: Timestamp,
    pub service: String,
    pub alert_id: AlertId,
    pub action: String,
    pub reason: String,
    pub detail: String,
}

/// Executed action that did not succeed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEntry {
    pub at: Timestamp,
    pub service: String,
    pub alert_id: AlertId,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceReport {
    pub start: Timestamp,
    pub end: Timestamp,
    pub total_events: usize,
    pub events_by_kind: BTreeMap<String, u64>,
    pub events_by_service: BTreeMap<String, u64>,
    pub events_by_actor: BTreeMap<String, u64>,
    pub actions_executed: u64,
    pub actions_succeeded: u64,
    pub denials: Vec<DenialEntry>,
    pub failed_actions: Vec<FailureEntry>,
    pub generated_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_serializes_with_type_tag() {
        let event = AuditEvent::new(
            "web-1",
            "operator:kim",
            AuditPayload::AlertAcknowledged {
                by: "operator:kim".to_string(),
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "alert_acknowledged");
        assert_eq!(json["service"], "web-1");
        assert_eq!(event.kind(), AuditKind::AlertAcknowledged);
    }

    #[test]
    fn test_query_filters() {
        let alert_id = AlertId::new();
        let mut event = AuditEvent::new(
            "db-1",
            "system",
            AuditPayload::AlertResolved {
                by: "auto".to_string(),
                reason: None,
            },
        );
        event.alert_id = Some(alert_id);
        event.priority = Some(Priority::P1);

        assert!(AuditQuery::default().matches(&event));
        assert!(AuditQuery {
            service: Some("db-1".to_string()),
            priority: Some(Priority::P1),
            kind: Some(AuditKind::AlertResolved),
            alert_id: Some(alert_id),
            ..AuditQuery::default()
        }
        .matches(&event));
        assert!(!AuditQuery {
            service: Some("web-1".to_string()),
            ..AuditQuery::default()
        }
        .matches(&event));
        assert!(!AuditQuery {
            since: Some(event.timestamp + chrono::Duration::seconds(1)),
            ..AuditQuery::default()
        }
        .matches(&event));
        assert!(AuditQuery {
            until: Some(event.timestamp),
            ..AuditQuery::default()
        }
        .matches(&event));
    }
}

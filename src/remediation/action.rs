use crate::alerts::AlertId;
use crate::events::Timestamp;
use crate::remediation::executor::ExecutionResult;
use crate::remediation::guard::DenyReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Remediation action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Restart,
    Redeploy,
    Reboot,
    NotifyOnly,
    NoOp,
}

impl ActionKind {
    /// Actions that change the state of the target
    pub fn is_disruptive(self) -> bool {
        matches!(
            self,
            ActionKind::Restart | ActionKind::Redeploy | ActionKind::Reboot
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Restart => "restart",
            ActionKind::Redeploy => "redeploy",
            ActionKind::Reboot => "reboot",
            ActionKind::NotifyOnly => "notify_only",
            ActionKind::NoOp => "no_op",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "restart" => Ok(ActionKind::Restart),
            "redeploy" => Ok(ActionKind::Redeploy),
            "reboot" => Ok(ActionKind::Reboot),
            "notify_only" | "notify" => Ok(ActionKind::NotifyOnly),
            "no_op" | "noop" => Ok(ActionKind::NoOp),
            other => Err(format!("unknown action kind '{}'", other)),
        }
    }
}

/// Declared risk of an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
        };
        f.write_str(label)
    }
}

/// Candidate remediation for an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionProposal {
    pub id: Uuid,
    pub alert_id: AlertId,
    pub service: String,
    pub kind: ActionKind,
    /// Resource the action is performed on
    pub target: String,
    pub risk: RiskTier,
    /// Confidence of the diagnosis behind the proposal
    pub confidence: f64,
    pub rationale: String,
    /// Policy rule that produced the proposal
    pub rule: String,
    pub created_at: Timestamp,
}

/// What the safety guard (and possibly a human) decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum GateOutcome {
    Allowed,
    Approved { by: String },
    Denied { reason: DenyReason, detail: String },
}

impl GateOutcome {
    pub fn is_denied(&self) -> bool {
        matches!(self, GateOutcome::Denied { .. })
    }
}

/// Durable record of an executed or blocked action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub alert_id: AlertId,
    pub proposal: ActionProposal,
    pub outcome: GateOutcome,
    /// Absent when the action never ran
    pub result: Option<ExecutionResult>,
    pub recorded_at: Timestamp,
}

impl ActionRecord {
    pub fn new(
        proposal: ActionProposal,
        outcome: GateOutcome,
        result: Option<ExecutionResult>,
        recorded_at: Timestamp,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_id: proposal.alert_id,
            proposal,
            outcome,
            result,
            recorded_at,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.succeeded())
    }
}

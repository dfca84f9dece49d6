use crate::alerts::AlertId;
use crate::error::ApprovalError;
use crate::events::Timestamp;
use crate::remediation::action::ActionProposal;
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Approval request emitted to the approval channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub alert_id: AlertId,
    pub proposal: ActionProposal,
    pub rationale: String,
    pub requested_at: Timestamp,
    pub expires_at: Timestamp,
}

/// Answer to an approval request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved { by: String },
    Rejected { by: String, reason: String },
    TimedOut,
}

/// Handle held by the chain waiting for a decision
#[derive(Debug)]
pub struct ApprovalTicket {
    pub request: ApprovalRequest,
    receiver: oneshot::Receiver<ApprovalOutcome>,
}

struct PendingApproval {
    request: ApprovalRequest,
    sender: oneshot::Sender<ApprovalOutcome>,
}

/// Routes approve/reject signals, keyed by alert id, to waiting chains
pub struct ApprovalBroker {
    timeout: Duration,
    pending: Mutex<HashMap<AlertId, PendingApproval>>,
}

impl Default for ApprovalBroker {
    fn default() -> Self {
        Self::new(Duration::from_secs(15 * 60))
    }
}

impl ApprovalBroker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register an approval request for a proposal
    pub fn request(&self, proposal: &ActionProposal, rationale: &str) -> ApprovalTicket {
        let (sender, receiver) = oneshot::channel();
        let requested_at = Utc::now();
        let expires_at = requested_at
            + chrono::Duration::from_std(self.timeout).unwrap_or(chrono::Duration::MAX);

        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            alert_id: proposal.alert_id,
            proposal: proposal.clone(),
            rationale: rationale.to_string(),
            requested_at,
            expires_at,
        };

        info!(
            "Approval requested for {} on '{}' (alert {}), expires {}",
            proposal.kind,
            proposal.service,
            proposal.alert_id,
            expires_at.to_rfc3339()
        );

        let previous = self.pending.lock().unwrap().insert(
            proposal.alert_id,
            PendingApproval {
                request: request.clone(),
                sender,
            },
        );
        if previous.is_some() {
            warn!(
                "Replaced an earlier approval request for alert {}",
                proposal.alert_id
            );
        }

        ApprovalTicket { request, receiver }
    }

    /// Wait for a decision, up to the configured timeout
    pub async fn wait(&self, ticket: ApprovalTicket) -> ApprovalOutcome {
        let ApprovalTicket { request, receiver } = ticket;

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => ApprovalOutcome::Rejected {
                by: "system".to_string(),
                reason: "approval request was withdrawn".to_string(),
            },
            Err(_) => {
                let mut pending = self.pending.lock().unwrap();
                if pending
                    .get(&request.alert_id)
                    .is_some_and(|p| p.request.id == request.id)
                {
                    pending.remove(&request.alert_id);
                }
                warn!(
                    "Approval for alert {} timed out after {:?}",
                    request.alert_id, self.timeout
                );
                ApprovalOutcome::TimedOut
            }
        }
    }

    /// Approve the pending request for an alert
    ///
    /// # Errors
    /// `ApprovalError::NotPending` when nothing is waiting for this alert
    pub fn approve(&self, alert_id: AlertId, by: &str) -> Result<ApprovalRequest, ApprovalError> {
        let request = self.resolve(
            alert_id,
            ApprovalOutcome::Approved {
                by: by.to_string(),
            },
        )?;
        info!("Alert {} approved by {}", alert_id, by);
        Ok(request)
    }

    pub fn reject(
        &self,
        alert_id: AlertId,
        by: &str,
        reason: &str,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let request = self.resolve(
            alert_id,
            ApprovalOutcome::Rejected {
                by: by.to_string(),
                reason: reason.to_string(),
            },
        )?;
        info!("Alert {} rejected by {}: {}", alert_id, by, reason);
        Ok(request)
    }

    fn resolve(
        &self,
        alert_id: AlertId,
        outcome: ApprovalOutcome,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let Some(pending) = self.pending.lock().unwrap().remove(&alert_id) else {
            debug!("No approval pending for alert {}", alert_id);
            return Err(ApprovalError::NotPending(alert_id));
        };

        // The waiter may have timed out between the lookup and the send
        pending.sender.send(outcome).map_err(|_| {
            debug!("Approval waiter for alert {} already gone", alert_id);
            ApprovalError::NotPending(alert_id)
        })?;

        Ok(pending.request)
    }

    /// Requests still waiting for a decision, oldest first
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<ApprovalRequest> = self
            .pending
            .lock()
            .unwrap()
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.requested_at);
        requests
    }
}

use crate::alerts::Priority;
use crate::error::ExecutorError;
use crate::events::Timestamp;
use crate::notify::{NotificationKind, NotificationRequest, Notifier};
use crate::remediation::action::{ActionKind, ActionProposal, RiskTier};
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;

/// Boxed future returned by remediation targets
pub type TargetFuture = Pin<Box<dyn Future<Output = Result<String, ExecutorError>> + Send>>;

/// The infrastructure the executor acts on
///
/// Implementations receive owned arguments so the returned future can outlive
/// the call.
#[cfg_attr(test, mockall::automock)]
pub trait RemediationTarget: Send + Sync {
    /// Perform a disruptive action, returning a short description of what happened
    fn perform(&self, kind: ActionKind, target: String) -> TargetFuture;

    /// Capture the current state of the target
    fn snapshot(&self, target: String) -> TargetFuture;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// What happened when an action ran
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub detail: String,
    pub duration_ms: u64,
    pub dry_run: bool,
    /// Target state before the action (best-effort)
    pub before: Option<String>,
    /// Target state after the settle delay (best-effort)
    pub after: Option<String>,
    pub started_at: Timestamp,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorSettings {
    pub dry_run: bool,
    pub action_timeout: Duration,
    pub snapshot_timeout: Duration,
    /// Wait before the after-snapshot so the target can settle
    pub settle_delay: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            action_timeout: Duration::from_secs(120),
            snapshot_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(5),
        }
    }
}

/// Runs approved proposals against a remediation target
///
/// One attempt per proposal; retries are the guard's and the next alert's job.
pub struct ActionExecutor {
    target: Arc<dyn RemediationTarget>,
    notifier: Arc<dyn Notifier>,
    settings: ExecutorSettings,
}

impl ActionExecutor {
    pub fn new(
        target: Arc<dyn RemediationTarget>,
        notifier: Arc<dyn Notifier>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            target,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Execute a proposal that has passed the gate
    ///
    /// Never returns an error: failures and timeouts are reported in the
    /// result so the caller can audit them.
    pub async fn execute(&self, proposal: &ActionProposal) -> ExecutionResult {
        let started_at = Utc::now();
        let start = Instant::now();

        let finish = |status, detail: String, before, after| ExecutionResult {
            status,
            detail,
            duration_ms: start.elapsed().as_millis() as u64,
            dry_run: false,
            before,
            after,
            started_at,
        };

        match proposal.kind {
            ActionKind::NoOp => {
                debug!("No-op for alert {}", proposal.alert_id);
                return finish(
                    ExecutionStatus::Succeeded,
                    "No action required".to_string(),
                    None,
                    None,
                );
            }
            ActionKind::NotifyOnly => {
                return match self.notifier.notify(&advisory(proposal)) {
                    Ok(()) => finish(
                        ExecutionStatus::Succeeded,
                        "Notification sent".to_string(),
                        None,
                        None,
                    ),
                    Err(e) => {
                        warn!("Advisory for alert {} not delivered: {}", proposal.alert_id, e);
                        finish(ExecutionStatus::Failed, e.to_string(), None, None)
                    }
                };
            }
            ActionKind::Restart | ActionKind::Redeploy | ActionKind::Reboot => {}
        }

        if self.settings.dry_run {
            info!(
                "DRY RUN: would {} '{}' for alert {}",
                proposal.kind, proposal.target, proposal.alert_id
            );
            let mut result = finish(
                ExecutionStatus::Succeeded,
                "Dry run - no changes made".to_string(),
                None,
                None,
            );
            result.dry_run = true;
            return result;
        }

        let before = self.snapshot(&proposal.target).await;

        info!(
            "Executing {} on '{}' for alert {}",
            proposal.kind, proposal.target, proposal.alert_id
        );
        let call = self.target.perform(proposal.kind, proposal.target.clone());
        let (status, detail) = match tokio::time::timeout(self.settings.action_timeout, call).await {
            Ok(Ok(detail)) => (ExecutionStatus::Succeeded, detail),
            Ok(Err(e)) => {
                error!(
                    "{} on '{}' failed: {}",
                    proposal.kind, proposal.target, e
                );
                (ExecutionStatus::Failed, e.to_string())
            }
            Err(_) => {
                let e = ExecutorError::Timeout(self.settings.action_timeout);
                error!("{} on '{}': {}", proposal.kind, proposal.target, e);
                (ExecutionStatus::TimedOut, e.to_string())
            }
        };

        // Taken for every outcome, timeouts included
        tokio::time::sleep(self.settings.settle_delay).await;
        let after = self.snapshot(&proposal.target).await;

        let result = finish(status, detail, before, after);
        info!(
            "{} on '{}' finished: {:?} in {}ms",
            proposal.kind, proposal.target, result.status, result.duration_ms
        );
        result
    }

    async fn snapshot(&self, target: &str) -> Option<String> {
        let call = self.target.snapshot(target.to_string());
        match tokio::time::timeout(self.settings.snapshot_timeout, call).await {
            Ok(Ok(state)) => Some(state),
            Ok(Err(e)) => {
                debug!("Snapshot of '{}' unavailable: {}", target, e);
                None
            }
            Err(_) => {
                debug!("Snapshot of '{}' timed out", target);
                None
            }
        }
    }
}

fn advisory(proposal: &ActionProposal) -> NotificationRequest {
    let priority = match proposal.risk {
        RiskTier::High => Priority::P1,
        RiskTier::Medium => Priority::P2,
        RiskTier::Low => Priority::P3,
    };
    NotificationRequest::new(
        NotificationKind::Advisory,
        &proposal.service,
        priority,
        format!("Attention needed on {}", proposal.service),
    )
    .with_alert(proposal.alert_id)
    .with_body(proposal.rationale.clone())
}

/// Runs shell command templates per action kind
///
/// `{target}` in a template is replaced by the proposal target. Targets are
/// restricted to a conservative character set before substitution.
#[derive(Debug, Clone, Default)]
pub struct CommandTarget {
    commands: HashMap<ActionKind, String>,
    snapshot_command: Option<String>,
}

impl CommandTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_command(mut self, kind: ActionKind, template: impl Into<String>) -> Self {
        self.commands.insert(kind, template.into());
        self
    }

    pub fn with_snapshot_command(mut self, template: impl Into<String>) -> Self {
        self.snapshot_command = Some(template.into());
        self
    }

    fn render(template: &str, target: &str) -> Result<String, ExecutorError> {
        let safe = !target.is_empty()
            && target
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@'));
        if !safe {
            return Err(ExecutorError::Target(format!(
                "refusing to run a command for target '{}'",
                target
            )));
        }
        Ok(template.replace("{target}", target))
    }

    fn run(command: Result<String, ExecutorError>) -> TargetFuture {
        Box::pin(async move {
            let command = command?;
            debug!("Running: sh -c {:?}", command);
            let output = Command::new("sh")
                .arg("-c")
                .arg(&command)
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|e| ExecutorError::Target(format!("failed to spawn shell: {}", e)))?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                Err(ExecutorError::Target(format!(
                    "command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        })
    }
}

impl RemediationTarget for CommandTarget {
    fn perform(&self, kind: ActionKind, target: String) -> TargetFuture {
        let command = self
            .commands
            .get(&kind)
            .ok_or_else(|| ExecutorError::Unsupported(kind.to_string()))
            .and_then(|template| Self::render(template, &target));
        Self::run(command)
    }

    fn snapshot(&self, target: String) -> TargetFuture {
        let command = self
            .snapshot_command
            .as_deref()
            .ok_or_else(|| ExecutorError::Unsupported("snapshot".to_string()))
            .and_then(|template| Self::render(template, &target));
        Self::run(command)
    }
}

use crate::alerts::{Alert, AlertId, AlertManager, Escalation};
use crate::analysis::{Diagnosis, DiagnosisSource, ErrorAnalyzer};
use crate::audit::{AuditEvent, AuditLogger, AuditPayload, JsonlFileSink};
use crate::config::Config;
use crate::error::{AlertError, ConfigError, PipelineError};
use crate::events::{HealthEvent, Observation, Timestamp};
use crate::llm::ModelOrchestrator;
use crate::monitoring::{PipelineTelemetry, TelemetrySnapshot};
use crate::notify::{NotificationKind, NotificationRequest, Notifier, ThrottledNotifier};
use crate::remediation::{
    ActionExecutor, ActionKind, ActionProposal, ActionRecommender, ActionRecord, ApprovalBroker,
    ApprovalOutcome, ApprovalRequest, Denial, DenyReason, ExecutorSettings, GateDecision,
    GateOutcome, PolicyTable, RemediationTarget, Reservation, SafetyGuard,
};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// What happened to one observation or chain run
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    /// Folded into an existing alert; no chain was started
    Deduplicated { alert_id: AlertId, occurrences: u64 },
    /// The proposal passed the gate and ran (successfully or not)
    Executed(ActionRecord),
    /// The gate, or a human, blocked the proposal
    Denied(ActionRecord),
    /// The chain stopped early, usually because the alert was resolved
    Skipped { alert_id: AlertId, reason: String },
    /// A health recovery auto-resolved these alerts
    Recovered(Vec<AlertId>),
}

/// Summary of one maintenance tick
#[derive(Debug, Clone)]
pub struct TickReport {
    pub escalations: usize,
    pub stale_resolved: usize,
    pub notifications_flushed: usize,
    pub telemetry: TelemetrySnapshot,
}

/// Removes the alert from the in-flight set when the chain ends
struct InFlight<'a> {
    set: &'a Mutex<HashSet<AlertId>>,
    id: AlertId,
}

impl<'a> InFlight<'a> {
    fn claim(set: &'a Mutex<HashSet<AlertId>>, id: AlertId) -> Option<Self> {
        if set.lock().unwrap().insert(id) {
            Some(Self { set, id })
        } else {
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap().remove(&self.id);
    }
}

/// Closed loop from observation to audited action
///
/// Every new alert runs one chain: analyze, recommend, gate, optionally wait
/// for a human, execute, audit and notify. At most one chain runs per alert,
/// and at most `max_concurrent` chains do work at the same time. Waiting for
/// approval does not hold a worker slot.
pub struct RemediationPipeline {
    alerts: AlertManager,
    orchestrator: Arc<ModelOrchestrator>,
    analyzer: ErrorAnalyzer,
    recommender: ActionRecommender,
    guard: SafetyGuard,
    approvals: ApprovalBroker,
    target: Arc<dyn RemediationTarget>,
    executor: ActionExecutor,
    audit: AuditLogger,
    notifier: Arc<dyn Notifier>,
    telemetry: Arc<PipelineTelemetry>,
    workers: Semaphore,
    in_flight: Mutex<HashSet<AlertId>>,
    stale_after: Option<chrono::Duration>,
}

impl RemediationPipeline {
    /// Create a pipeline with default components around the given
    /// orchestrator, remediation target and notifier
    pub fn new(
        orchestrator: Arc<ModelOrchestrator>,
        target: Arc<dyn RemediationTarget>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let telemetry = Arc::new(PipelineTelemetry::new());
        Self {
            alerts: AlertManager::default(),
            analyzer: ErrorAnalyzer::new(Arc::clone(&orchestrator))
                .with_monitoring(Arc::clone(&telemetry)),
            orchestrator,
            recommender: ActionRecommender::new(PolicyTable::default()),
            guard: SafetyGuard::default(),
            approvals: ApprovalBroker::default(),
            executor: ActionExecutor::new(
                Arc::clone(&target),
                Arc::clone(&notifier),
                ExecutorSettings::default(),
            ),
            target,
            audit: AuditLogger::default(),
            notifier,
            telemetry,
            workers: Semaphore::new(4),
            in_flight: Mutex::new(HashSet::new()),
            stale_after: None,
        }
    }

    /// Build the whole pipeline from a loaded configuration
    ///
    /// The notifier is wrapped in a [`ThrottledNotifier`] using the
    /// configured rate, and the audit trail is mirrored to a JSONL file when
    /// a path is set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a backend cannot be built or the audit file
    /// cannot be opened.
    pub fn from_config(
        config: &Config,
        target: Arc<dyn RemediationTarget>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, ConfigError> {
        let telemetry = Arc::new(PipelineTelemetry::new());
        let orchestrator = Arc::new(
            config
                .llm
                .build_orchestrator()?
                .with_monitoring(Arc::clone(&telemetry)),
        );

        let notifier: Arc<dyn Notifier> = Arc::new(
            ThrottledNotifier::with_queue_size(
                notifier,
                config.notifications.max_per_minute,
                config.notifications.max_queue_size,
            )
            .with_monitoring(Arc::clone(&telemetry)),
        );

        let alerts =
            AlertManager::with_archive_size(config.escalation_policy(), config.alerts.max_archived);
        for pattern in config.suppressed_services() {
            alerts.suppress_service(pattern);
        }

        let guard = SafetyGuard::new(config.guard.settings());
        for window in &config.guard.freeze_windows {
            guard.add_freeze_window(window.clone());
        }
        for window in &config.guard.maintenance_windows {
            guard.add_maintenance_window(window.clone());
        }

        let mut audit =
            AuditLogger::new(config.audit.max_events).with_monitoring(Arc::clone(&telemetry));
        if let Some(path) = &config.audit.path {
            let sink = JsonlFileSink::open(path).map_err(|e| {
                ConfigError::ValidationError(format!(
                    "cannot open audit log {}: {}",
                    path.display(),
                    e
                ))
            })?;
            info!("Writing audit trail to {}", path.display());
            audit = audit.with_sink(Box::new(sink));
        }

        Ok(Self::new(orchestrator, target, notifier)
            .with_monitoring(telemetry)
            .with_alert_manager(alerts)
            .with_recommender(config.recommender())
            .with_guard(guard)
            .with_approval_timeout(config.guard.approval_timeout())
            .with_executor_settings(config.executor.settings())
            .with_audit(audit)
            .with_max_concurrent(config.pipeline.max_concurrent)
            .with_stale_after(config.stale_after()))
    }

    /// Share a telemetry collector with the analyzer and the pipeline
    pub fn with_monitoring(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.analyzer =
            ErrorAnalyzer::new(Arc::clone(&self.orchestrator)).with_monitoring(Arc::clone(&telemetry));
        self.telemetry = telemetry;
        self
    }

    pub fn with_alert_manager(mut self, alerts: AlertManager) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_recommender(mut self, recommender: ActionRecommender) -> Self {
        self.recommender = recommender;
        self
    }

    pub fn with_guard(mut self, guard: SafetyGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn with_approval_timeout(mut self, timeout: Duration) -> Self {
        self.approvals = ApprovalBroker::new(timeout);
        self
    }

    pub fn with_executor_settings(mut self, settings: ExecutorSettings) -> Self {
        self.executor =
            ActionExecutor::new(Arc::clone(&self.target), Arc::clone(&self.notifier), settings);
        self
    }

    pub fn with_audit(mut self, audit: AuditLogger) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.workers = Semaphore::new(max_concurrent.max(1));
        self
    }

    /// Auto-resolve alerts not seen for `max_age` on every tick
    pub fn with_stale_after(mut self, max_age: Option<chrono::Duration>) -> Self {
        self.stale_after = max_age;
        self
    }

    pub fn alerts(&self) -> &AlertManager {
        &self.alerts
    }

    pub fn guard(&self) -> &SafetyGuard {
        &self.guard
    }

    pub fn approvals(&self) -> &ApprovalBroker {
        &self.approvals
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn orchestrator(&self) -> &ModelOrchestrator {
        &self.orchestrator
    }

    pub fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    /// Feed one observation through the pipeline
    ///
    /// Only the observation that opens an alert starts a chain; repeats are
    /// deduplicated into it.
    ///
    /// # Errors
    ///
    /// `PipelineError::Alert` if the service is suppressed, `ChainInFlight`
    /// if a chain for the alert is already running and `Shutdown` once the
    /// pipeline has been shut down.
    pub async fn process(&self, observation: Observation) -> Result<PipelineOutcome, PipelineError> {
        self.telemetry.record_observations(1);
        let handle = self.alerts.submit(&observation)?;

        if let Some(escalation) = &handle.escalated {
            if let Some(alert) = self.alerts.get(handle.id) {
                self.escalated(&alert, escalation);
            }
        }

        if !handle.is_new {
            return Ok(PipelineOutcome::Deduplicated {
                alert_id: handle.id,
                occurrences: handle.occurrence_count,
            });
        }

        let alert = self
            .alerts
            .get(handle.id)
            .ok_or(AlertError::NotFound(handle.id))?;
        self.audit.record(AuditEvent::for_alert(
            &alert,
            "system",
            AuditPayload::AlertOpened {
                fingerprint: alert.fingerprint.to_string(),
                title: alert.title.clone(),
                error_class: alert.error_class.clone(),
                severity: alert.severity,
            },
        ));
        self.notify(
            NotificationRequest::new(
                NotificationKind::AlertOpened,
                &alert.service,
                alert.priority,
                format!("{} alert on {}: {}", alert.priority, alert.service, alert.title),
            )
            .with_alert(alert.id)
            .with_body(format!("{} ({})", alert.error_class, alert.severity)),
        );

        self.run_chain(alert.id).await
    }

    /// Run a fresh analysis for an active alert
    ///
    /// The new diagnosis is appended to the alert and goes through the rest
    /// of the chain like the first one did.
    pub async fn reanalyze(&self, alert_id: AlertId) -> Result<PipelineOutcome, PipelineError> {
        info!("Re-analyzing alert {}", alert_id);
        self.run_chain(alert_id).await
    }

    /// React to a health probe
    ///
    /// Unhealthy is handled like an observation; healthy auto-resolves the
    /// active alerts of the service.
    pub async fn health_changed(&self, event: HealthEvent) -> Result<PipelineOutcome, PipelineError> {
        if !event.healthy {
            return self.process(event.to_observation()).await;
        }

        let resolved = self.alerts.health_changed(&event.service, true);
        for alert in &resolved {
            self.audit_resolved(alert, "system");
            self.withdraw_approval(alert.id);
        }
        Ok(PipelineOutcome::Recovered(
            resolved.iter().map(|alert| alert.id).collect(),
        ))
    }

    pub fn acknowledge(&self, alert_id: AlertId, by: &str) -> Result<Alert, PipelineError> {
        let alert = self.alerts.acknowledge(alert_id, by)?;
        self.audit.record(AuditEvent::for_alert(
            &alert,
            actor(by),
            AuditPayload::AlertAcknowledged { by: by.to_string() },
        ));
        Ok(alert)
    }

    /// Resolve an alert by hand, withdrawing any approval still pending for it
    pub fn resolve(&self, alert_id: AlertId, by: &str, reason: &str) -> Result<Alert, PipelineError> {
        let alert = self.alerts.resolve(alert_id, by, reason)?;
        self.audit_resolved(&alert, &actor(by));
        self.withdraw_approval(alert_id);
        Ok(alert)
    }

    pub fn approve(&self, alert_id: AlertId, by: &str) -> Result<ApprovalRequest, PipelineError> {
        Ok(self.approvals.approve(alert_id, by)?)
    }

    pub fn reject(
        &self,
        alert_id: AlertId,
        by: &str,
        reason: &str,
    ) -> Result<ApprovalRequest, PipelineError> {
        Ok(self.approvals.reject(alert_id, by, reason)?)
    }

    /// Periodic maintenance
    ///
    /// Re-notifies alerts left unacknowledged too long, resolves stale ones,
    /// flushes held-back notifications and samples telemetry.
    pub fn tick(&self, now: Timestamp) -> TickReport {
        let due = self.alerts.due_escalations(now);
        for (alert, escalation) in &due {
            self.escalated(alert, escalation);
        }

        let stale = match self.stale_after {
            Some(max_age) => self.alerts.resolve_stale(max_age, now),
            None => Vec::new(),
        };
        for alert in &stale {
            self.audit_resolved(alert, "system");
            self.withdraw_approval(alert.id);
        }

        let notifications_flushed = self.notifier.flush().unwrap_or_else(|e| {
            warn!("Failed to flush notifications: {}", e);
            0
        });

        let telemetry = self.telemetry.collect_metrics();
        debug!(
            "Tick: {} escalation(s), {} stale alert(s), {} notification(s) flushed",
            due.len(),
            stale.len(),
            notifications_flushed
        );

        TickReport {
            escalations: due.len(),
            stale_resolved: stale.len(),
            notifications_flushed,
            telemetry,
        }
    }

    /// Stop accepting chains and close the audit trail
    pub fn shutdown(&self) {
        info!("Shutting down remediation pipeline");
        self.workers.close();
        self.audit.close();
    }

    async fn run_chain(&self, alert_id: AlertId) -> Result<PipelineOutcome, PipelineError> {
        let _in_flight = InFlight::claim(&self.in_flight, alert_id)
            .ok_or(PipelineError::ChainInFlight(alert_id))?;
        let permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| PipelineError::Shutdown)?;

        let alert = self.alerts.get(alert_id).ok_or(AlertError::NotFound(alert_id))?;
        if !alert.is_active() {
            return Ok(skipped(alert_id, format!("alert is {}", alert.state)));
        }

        let diagnosis = self.analyzer.analyze(&alert, &alert.context).await;
        if self.alerts.record_diagnosis(alert_id, diagnosis.clone()).is_err() {
            return Ok(skipped(alert_id, "alert resolved during analysis"));
        }
        self.audit.record(AuditEvent::for_alert(
            &alert,
            diagnosis_actor(&diagnosis),
            AuditPayload::DiagnosisRecorded {
                diagnosis: diagnosis.clone(),
            },
        ));

        let alert = self.alerts.get(alert_id).ok_or(AlertError::NotFound(alert_id))?;
        let proposal = self.recommender.recommend(&alert, &diagnosis);
        if self.alerts.record_proposal(alert_id, proposal.clone()).is_err() {
            return Ok(skipped(alert_id, "alert resolved before gating"));
        }
        self.audit.record(AuditEvent::for_alert(
            &alert,
            "system",
            AuditPayload::ActionProposed {
                proposal: proposal.clone(),
            },
        ));

        match self.guard.evaluate(&proposal) {
            GateDecision::Allow(reservation) => {
                self.telemetry.record_allowed();
                Ok(self
                    .execute(&alert, proposal, reservation, GateOutcome::Allowed)
                    .await)
            }
            GateDecision::Deny(denial) => Ok(self.deny(&alert, proposal, denial)),
            GateDecision::RequireApproval => {
                drop(permit);
                self.await_approval(alert, proposal).await
            }
        }
    }

    async fn await_approval(
        &self,
        alert: Alert,
        proposal: ActionProposal,
    ) -> Result<PipelineOutcome, PipelineError> {
        self.telemetry.record_approval_requested();
        let ticket = self.approvals.request(&proposal, &proposal.rationale);
        self.audit.record(AuditEvent::for_alert(
            &alert,
            "system",
            AuditPayload::ApprovalRequested {
                request: ticket.request.clone(),
                maintenance_window: self
                    .guard
                    .active_maintenance_window(Utc::now())
                    .map(|window| window.name),
            },
        ));
        if let Err(e) = self.notifier.request_approval(&ticket.request) {
            warn!("Failed to send approval request for alert {}: {}", alert.id, e);
        }

        let outcome = self.approvals.wait(ticket).await;
        let decided_by = match &outcome {
            ApprovalOutcome::Approved { by } | ApprovalOutcome::Rejected { by, .. } => actor(by),
            ApprovalOutcome::TimedOut => "system".to_string(),
        };
        self.audit.record(AuditEvent::for_alert(
            &alert,
            decided_by,
            AuditPayload::ApprovalResolved {
                outcome: outcome.clone(),
            },
        ));

        let current = self.alerts.get(alert.id).ok_or(AlertError::NotFound(alert.id))?;
        if !current.is_active() {
            return Ok(skipped(alert.id, "alert resolved while awaiting approval"));
        }

        match outcome {
            ApprovalOutcome::Approved { by } => {
                let _permit = self
                    .workers
                    .acquire()
                    .await
                    .map_err(|_| PipelineError::Shutdown)?;
                match self.guard.evaluate_approved(&proposal) {
                    Ok(reservation) => Ok(self
                        .execute(&current, proposal, reservation, GateOutcome::Approved { by })
                        .await),
                    Err(denial) => Ok(self.deny(&current, proposal, denial)),
                }
            }
            ApprovalOutcome::Rejected { by, reason } => {
                let denial = Denial {
                    reason: DenyReason::ApprovalRejected,
                    detail: format!("rejected by {}: {}", by, reason),
                };
                Ok(self.deny(&current, proposal, denial))
            }
            ApprovalOutcome::TimedOut => {
                let denial = Denial {
                    reason: DenyReason::ApprovalTimeout,
                    detail: format!(
                        "no decision within {} minute(s)",
                        self.approvals.timeout().as_secs() / 60
                    ),
                };
                Ok(self.deny(&current, proposal, denial))
            }
        }
    }

    async fn execute(
        &self,
        alert: &Alert,
        proposal: ActionProposal,
        reservation: Reservation,
        outcome: GateOutcome,
    ) -> PipelineOutcome {
        let result = self.executor.execute(&proposal).await;
        self.guard.complete(reservation, result.succeeded());
        self.telemetry.record_execution(result.status);

        if proposal.kind.is_disruptive() {
            let (kind, verb) = if result.succeeded() {
                (NotificationKind::ActionExecuted, "succeeded")
            } else {
                (NotificationKind::ActionFailed, "failed")
            };
            self.notify(
                NotificationRequest::new(
                    kind,
                    &proposal.service,
                    alert.priority,
                    format!("{} on {} {}", proposal.kind, proposal.target, verb),
                )
                .with_alert(alert.id)
                .with_body(result.detail.clone()),
            );
        }

        let record = ActionRecord::new(proposal, outcome, Some(result), Utc::now());
        self.audit.record(AuditEvent::for_alert(
            alert,
            "system",
            AuditPayload::ActionRecorded {
                record: record.clone(),
            },
        ));
        PipelineOutcome::Executed(record)
    }

    fn deny(&self, alert: &Alert, proposal: ActionProposal, denial: Denial) -> PipelineOutcome {
        self.telemetry.record_denial(denial.reason);
        if proposal.kind != ActionKind::NoOp {
            self.notify(
                NotificationRequest::new(
                    NotificationKind::ActionDenied,
                    &proposal.service,
                    alert.priority,
                    format!(
                        "{} on {} blocked: {}",
                        proposal.kind, proposal.target, denial.reason
                    ),
                )
                .with_alert(alert.id)
                .with_body(denial.detail.clone()),
            );
        }

        let record = ActionRecord::new(
            proposal,
            GateOutcome::Denied {
                reason: denial.reason,
                detail: denial.detail,
            },
            None,
            Utc::now(),
        );
        self.audit.record(AuditEvent::for_alert(
            alert,
            "system",
            AuditPayload::ActionRecorded {
                record: record.clone(),
            },
        ));
        PipelineOutcome::Denied(record)
    }

    fn escalated(&self, alert: &Alert, escalation: &Escalation) {
        self.audit.record(AuditEvent::for_alert(
            alert,
            "system",
            AuditPayload::AlertEscalated {
                escalation: escalation.clone(),
            },
        ));
        self.notify(
            NotificationRequest::new(
                NotificationKind::AlertEscalated,
                &alert.service,
                escalation.to,
                format!("{} alert on {}: {}", escalation.to, alert.service, alert.title),
            )
            .with_alert(alert.id)
            .with_body(format!(
                "{} ({} -> {}, {} occurrence(s))",
                escalation.reason, escalation.from, escalation.to, alert.occurrence_count
            )),
        );
    }

    fn audit_resolved(&self, alert: &Alert, actor: &str) {
        self.audit.record(AuditEvent::for_alert(
            alert,
            actor,
            AuditPayload::AlertResolved {
                by: alert.resolved_by.clone().unwrap_or_else(|| actor.to_string()),
                reason: alert.resolution.clone(),
            },
        ));
    }

    fn withdraw_approval(&self, alert_id: AlertId) {
        if self
            .approvals
            .reject(alert_id, "system", "alert resolved")
            .is_ok()
        {
            debug!("Withdrew pending approval for resolved alert {}", alert_id);
        }
    }

    fn notify(&self, request: NotificationRequest) {
        if let Err(e) = self.notifier.notify(&request) {
            warn!("Failed to send '{}' notification for {}: {}", request.kind, request.service, e);
        }
    }
}

fn skipped(alert_id: AlertId, reason: impl Into<String>) -> PipelineOutcome {
    let reason = reason.into();
    info!("Chain for alert {} skipped: {}", alert_id, reason);
    PipelineOutcome::Skipped { alert_id, reason }
}

/// Audit actor for a human or automatic decision
fn actor(by: &str) -> String {
    match by {
        "system" | "auto" => "system".to_string(),
        name => format!("operator:{}", name),
    }
}

fn diagnosis_actor(diagnosis: &Diagnosis) -> String {
    match &diagnosis.source {
        DiagnosisSource::Model { backend, .. } => format!("llm:{}", backend),
        DiagnosisSource::Heuristic { .. } => "heuristic".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Priority;
    use crate::audit::{AuditKind, AuditQuery};
    use crate::llm::{BackendDescriptor, MockBackend, OrchestratorSettings};
    use crate::notify::{ChannelNotifier, LogNotifier, NotifierMessage};
    use crate::remediation::executor::MockRemediationTarget;
    use crate::remediation::RiskTier;
    use uuid::Uuid;

    const PERFORMANCE: &str = r#"{"category":"performance","confidence":0.8,"root_cause":"Slow upstream responses","impact":"Elevated latency"}"#;
    const CONNECTIVITY: &str = r#"{"category":"connectivity","confidence":0.9,"root_cause":"Database refused connections","impact":"Writes fail"}"#;
    const CORRUPTION: &str = r#"{"category":"data_corruption","confidence":0.9,"root_cause":"Checksum mismatch in table pages","impact":"Reads return bad rows"}"#;

    fn orchestrator(backend: &MockBackend) -> Arc<ModelOrchestrator> {
        Arc::new(
            ModelOrchestrator::new(OrchestratorSettings::default())
                .with_backend(BackendDescriptor::new("mock", Arc::new(backend.clone())))
                .with_fallback(vec!["mock".to_string()]),
        )
    }

    fn pipeline(backend: &MockBackend, target: MockRemediationTarget) -> RemediationPipeline {
        RemediationPipeline::new(orchestrator(backend), Arc::new(target), Arc::new(LogNotifier))
    }

    fn restart(service: &str) -> ActionProposal {
        ActionProposal {
            id: Uuid::new_v4(),
            alert_id: AlertId::new(),
            service: service.to_string(),
            kind: ActionKind::Restart,
            target: service.to_string(),
            risk: RiskTier::Low,
            confidence: 0.9,
            rationale: "earlier incident".to_string(),
            rule: "connectivity->restart".to_string(),
            created_at: Utc::now(),
        }
    }

    fn kinds(pipeline: &RemediationPipeline, alert_id: AlertId) -> Vec<AuditKind> {
        pipeline
            .audit()
            .by_alert(alert_id)
            .iter()
            .map(|event| event.kind())
            .collect()
    }

    /// Spawn `process` and wait until its approval request is pending
    async fn pending_chain(
        pipeline: &Arc<RemediationPipeline>,
        observation: Observation,
    ) -> (tokio::task::JoinHandle<Result<PipelineOutcome, PipelineError>>, AlertId) {
        let task = {
            let pipeline = Arc::clone(pipeline);
            tokio::spawn(async move { pipeline.process(observation).await })
        };
        loop {
            if let Some(request) = pipeline.approvals().pending().first() {
                return (task, request.alert_id);
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_observations_share_one_alert() {
        let backend = MockBackend::success(PERFORMANCE);
        // notify_only never reaches the target
        let pipeline = pipeline(&backend, MockRemediationTarget::new());
        let text = "upstream request took 5400ms (threshold 2000ms)";

        let first = pipeline.process(Observation::new("web-1", text)).await.unwrap();
        let PipelineOutcome::Executed(record) = first else {
            panic!("expected an executed notify_only action, got {:?}", first);
        };
        assert_eq!(record.proposal.kind, ActionKind::NotifyOnly);

        for expected in [2, 3] {
            let outcome = pipeline.process(Observation::new("web-1", text)).await.unwrap();
            assert_eq!(
                outcome,
                PipelineOutcome::Deduplicated {
                    alert_id: record.alert_id,
                    occurrences: expected,
                }
            );
        }

        let alert = pipeline.alerts().get(record.alert_id).unwrap();
        assert_eq!(alert.occurrence_count, 3);
        assert_eq!(alert.diagnoses.len(), 1);
        assert_eq!(backend.call_count(), 1);
        assert_eq!(pipeline.alerts().open_alerts(None).len(), 1);
        assert_eq!(
            kinds(&pipeline, record.alert_id),
            vec![
                AuditKind::AlertOpened,
                AuditKind::DiagnosisRecorded,
                AuditKind::ActionProposed,
                AuditKind::ActionRecorded,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_service_is_denied_without_execution() {
        let backend = MockBackend::success(CONNECTIVITY);
        let mut target = MockRemediationTarget::new();
        target.expect_perform().times(0);
        target.expect_snapshot().times(0);
        let pipeline = pipeline(&backend, target);

        for _ in 0..3 {
            match pipeline.guard().evaluate(&restart("db-1")) {
                GateDecision::Allow(reservation) => pipeline.guard().complete(reservation, true),
                other => panic!("expected Allow, got {:?}", other),
            }
        }

        let outcome = pipeline
            .process(Observation::new("db-1", "dial tcp 10.0.0.5:5432: connection refused"))
            .await
            .unwrap();
        let PipelineOutcome::Denied(record) = outcome else {
            panic!("expected a denial, got {:?}", outcome);
        };
        assert_eq!(record.proposal.kind, ActionKind::Restart);
        assert!(record.result.is_none());
        match &record.outcome {
            GateOutcome::Denied { reason, .. } => assert_eq!(*reason, DenyReason::RateLimited),
            other => panic!("expected Denied, got {:?}", other),
        }

        let snapshot = pipeline.telemetry().collect_metrics();
        assert_eq!(snapshot.denials.get("rate_limited"), Some(&1));
        assert_eq!(pipeline.audit().action_records(Some("db-1")).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_approval_times_out_into_denial() {
        let backend = MockBackend::success(CORRUPTION);
        let (notifier, messages) = ChannelNotifier::new();
        let pipeline = RemediationPipeline::new(
            orchestrator(&backend),
            Arc::new(MockRemediationTarget::new()),
            Arc::new(notifier),
        );

        let outcome = pipeline
            .process(
                Observation::new("db-1", "page checksum mismatch: data corruption detected")
                    .with_severity(crate::events::Severity::Critical),
            )
            .await
            .unwrap();

        let PipelineOutcome::Denied(record) = outcome else {
            panic!("expected a denial, got {:?}", outcome);
        };
        assert_eq!(record.proposal.risk, RiskTier::High);
        match &record.outcome {
            GateOutcome::Denied { reason, .. } => assert_eq!(*reason, DenyReason::ApprovalTimeout),
            other => panic!("expected Denied, got {:?}", other),
        }
        assert!(pipeline.approvals().pending().is_empty());

        let trail = kinds(&pipeline, record.alert_id);
        assert!(trail.contains(&AuditKind::ActionProposed));
        assert!(trail.contains(&AuditKind::ApprovalRequested));
        assert_eq!(trail.last(), Some(&AuditKind::ActionRecorded));
        let recorded = pipeline.audit().query(&AuditQuery {
            kind: Some(AuditKind::ActionRecorded),
            ..AuditQuery::default()
        });
        assert_eq!(recorded.len(), 1);

        let messages: Vec<NotifierMessage> = messages.try_iter().collect();
        assert!(messages
            .iter()
            .any(|m| matches!(m, NotifierMessage::Approval(r) if r.alert_id == record.alert_id)));
        assert!(messages.iter().any(|m| matches!(
            m,
            NotifierMessage::Notification(n) if n.kind == NotificationKind::ActionDenied
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approved_action_is_rechecked_and_executed() {
        let backend = MockBackend::success(CONNECTIVITY);
        let mut target = MockRemediationTarget::new();
        target
            .expect_snapshot()
            .times(2)
            .returning(|_| Box::pin(async { Ok("running".to_string()) }));
        target
            .expect_perform()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok("restarted".to_string()) }));
        // Every action needs sign-off
        let guard = SafetyGuard::new(crate::remediation::GuardSettings {
            always_approve: vec![ActionKind::Restart],
            ..crate::remediation::GuardSettings::default()
        });
        let pipeline = Arc::new(pipeline(&backend, target).with_guard(guard));

        let (task, alert_id) =
            pending_chain(&pipeline, Observation::new("db-1", "connection refused")).await;
        pipeline.approve(alert_id, "kim").unwrap();

        let outcome = task.await.unwrap().unwrap();
        let PipelineOutcome::Executed(record) = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        assert_eq!(
            record.outcome,
            GateOutcome::Approved {
                by: "kim".to_string()
            }
        );
        assert!(record.succeeded());

        let resolved = pipeline.audit().query(&AuditQuery {
            kind: Some(AuditKind::ApprovalResolved),
            ..AuditQuery::default()
        });
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].actor, "operator:kim");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_approval_is_denied() {
        let backend = MockBackend::success(CORRUPTION);
        let pipeline = Arc::new(pipeline(&backend, MockRemediationTarget::new()));

        let (task, alert_id) = pending_chain(
            &pipeline,
            Observation::new("db-1", "data corruption detected in users table"),
        )
        .await;
        pipeline.reject(alert_id, "kim", "restoring from backup instead").unwrap();

        let outcome = task.await.unwrap().unwrap();
        let PipelineOutcome::Denied(record) = outcome else {
            panic!("expected a denial, got {:?}", outcome);
        };
        match record.outcome {
            GateOutcome::Denied { reason, detail } => {
                assert_eq!(reason, DenyReason::ApprovalRejected);
                assert!(detail.contains("restoring from backup"));
            }
            other => panic!("expected Denied, got {:?}", other),
        }
        assert!(matches!(
            pipeline.approve(alert_id, "kim"),
            Err(PipelineError::Approval(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_approval_request_reports_maintenance_window() {
        let backend = MockBackend::success(CORRUPTION);
        let guard = SafetyGuard::default();
        guard.add_maintenance_window(crate::remediation::MaintenanceWindow {
            name: "all-day".to_string(),
            days: vec![],
            start: chrono::NaiveTime::MIN,
            end: chrono::NaiveTime::MIN,
        });
        let pipeline = Arc::new(pipeline(&backend, MockRemediationTarget::new()).with_guard(guard));

        let (task, alert_id) = pending_chain(
            &pipeline,
            Observation::new("db-1", "data corruption detected in users table"),
        )
        .await;
        pipeline.reject(alert_id, "kim", "not now").unwrap();

        // The window is visible to approvers but the action still needed a human
        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, PipelineOutcome::Denied(_)));
        let requested = pipeline.audit().query(&AuditQuery {
            kind: Some(AuditKind::ApprovalRequested),
            ..AuditQuery::default()
        });
        assert_eq!(requested.len(), 1);
        match &requested[0].payload {
            AuditPayload::ApprovalRequested {
                maintenance_window, ..
            } => assert_eq!(maintenance_window.as_deref(), Some("all-day")),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolving_alert_skips_pending_approval() {
        let backend = MockBackend::success(CORRUPTION);
        let pipeline = Arc::new(pipeline(&backend, MockRemediationTarget::new()));

        let (task, alert_id) = pending_chain(
            &pipeline,
            Observation::new("db-1", "data corruption detected in users table"),
        )
        .await;
        pipeline.resolve(alert_id, "kim", "false alarm").unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome, PipelineOutcome::Skipped { .. }));
        assert!(pipeline.audit().action_records(None).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_recovery_resolves_alerts() {
        let backend = MockBackend::success(PERFORMANCE);
        let pipeline = pipeline(&backend, MockRemediationTarget::new());

        let down = HealthEvent {
            service: "api-1".to_string(),
            healthy: false,
            timestamp: Utc::now(),
            detail: Some("timeout after 5s".to_string()),
        };
        let outcome = pipeline.health_changed(down.clone()).await.unwrap();
        let PipelineOutcome::Executed(record) = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        assert_eq!(
            pipeline.alerts().get(record.alert_id).unwrap().priority,
            Priority::P2
        );

        let up = HealthEvent {
            healthy: true,
            detail: None,
            ..down
        };
        let outcome = pipeline.health_changed(up).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Recovered(vec![record.alert_id]));
        assert!(pipeline.alerts().open_alerts(None).is_empty());
        assert_eq!(
            kinds(&pipeline, record.alert_id).last(),
            Some(&AuditKind::AlertResolved)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_models_fall_back_to_heuristics() {
        let backend = MockBackend::error("connection reset");
        let pipeline = pipeline(&backend, MockRemediationTarget::new());

        let outcome = pipeline
            .process(Observation::new("web-1", "request latency 9000ms exceeds threshold"))
            .await
            .unwrap();
        let PipelineOutcome::Executed(record) = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };
        let alert = pipeline.alerts().get(record.alert_id).unwrap();
        assert!(alert.diagnoses[0].is_heuristic());

        let diagnosis_events = pipeline.audit().query(&AuditQuery {
            kind: Some(AuditKind::DiagnosisRecorded),
            ..AuditQuery::default()
        });
        assert_eq!(diagnosis_events[0].actor, "heuristic");
        assert_eq!(pipeline.telemetry().collect_metrics().heuristic_diagnoses, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acknowledge_and_tick() {
        let backend = MockBackend::success(PERFORMANCE);
        let pipeline = pipeline(&backend, MockRemediationTarget::new());

        let outcome = pipeline
            .process(Observation::new("web-1", "upstream latency 4000ms"))
            .await
            .unwrap();
        let PipelineOutcome::Executed(record) = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };

        // Longer than every default unacknowledged threshold
        let report = pipeline.tick(Utc::now() + chrono::Duration::hours(3));
        assert_eq!(report.escalations, 1);
        let report = pipeline.tick(Utc::now() + chrono::Duration::hours(4));
        assert_eq!(report.escalations, 0);

        let alert = pipeline.acknowledge(record.alert_id, "kim").unwrap();
        assert_eq!(alert.acknowledged_by.as_deref(), Some("kim"));
        assert!(kinds(&pipeline, record.alert_id).contains(&AuditKind::AlertAcknowledged));
        assert!(kinds(&pipeline, record.alert_id).contains(&AuditKind::AlertEscalated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_chain_for_same_alert_is_rejected() {
        let backend = MockBackend::success(PERFORMANCE).with_delay(Duration::from_secs(1));
        let pipeline = Arc::new(pipeline(&backend, MockRemediationTarget::new()));

        let outcome = pipeline
            .process(Observation::new("web-1", "upstream latency 4000ms"))
            .await
            .unwrap();
        let PipelineOutcome::Executed(record) = outcome else {
            panic!("expected execution, got {:?}", outcome);
        };

        let first = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.reanalyze(record.alert_id).await })
        };
        tokio::task::yield_now().await;
        assert!(matches!(
            pipeline.reanalyze(record.alert_id).await,
            Err(PipelineError::ChainInFlight(_))
        ));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(
            pipeline.alerts().get(record.alert_id).unwrap().diagnoses.len(),
            2
        );
    }
}

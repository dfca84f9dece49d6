use crate::audit::event::{
    AuditEvent, AuditKind, AuditPayload, AuditQuery, ComplianceReport, DenialEntry, FailureEntry,
};
use crate::error::AuditError;
use crate::events::Timestamp;
use crate::monitoring::PipelineTelemetry;
use crate::remediation::{ActionRecord, GateOutcome};
use chrono::Utc;
use log::{debug, error, info};
use std::collections::{BTreeMap, VecDeque};
use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Durable destination for audit events
pub trait AuditSink: Send {
    /// Persist one event
    ///
    /// # Errors
    ///
    /// Returns `AuditError` if the event could not be written.
    fn write(&mut self, event: &AuditEvent) -> Result<(), AuditError>;

    fn flush(&mut self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonlFileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlFileSink {
    /// Open (or create) the file in append mode, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlFileSink {
    fn write(&mut self, event: &AuditEvent) -> Result<(), AuditError> {
        serde_json::to_writer(&mut self.writer, event)?;
        self.writer.write_all(b"\n")?;
        // Each event is flushed so a crash loses at most the one being written
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AuditError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Append-only audit trail
///
/// Events are kept in memory (the most recent `max_events`) for queries and
/// handed to an optional sink running on its own thread. `record` never
/// blocks on the sink and never fails; sink errors are logged and counted.
/// There is no API to change or delete an event.
pub struct AuditLogger {
    events: Mutex<VecDeque<AuditEvent>>,
    max_events: usize,
    next_sequence: AtomicU64,
    sender: Mutex<Option<Sender<AuditEvent>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicU64>,
    telemetry: Option<Arc<PipelineTelemetry>>,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl AuditLogger {
    /// Create an in-memory logger keeping at most `max_events` events
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max_events.max(1),
            next_sequence: AtomicU64::new(1),
            sender: Mutex::new(None),
            writer: Mutex::new(None),
            failures: Arc::new(AtomicU64::new(0)),
            telemetry: None,
        }
    }

    /// Report sink failures to `telemetry`; call before `with_sink`
    pub fn with_monitoring(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Start the writer thread feeding `sink`
    pub fn with_sink(self, mut sink: Box<dyn AuditSink>) -> Self {
        let (sender, receiver) = mpsc::channel::<AuditEvent>();
        let failures = Arc::clone(&self.failures);
        let telemetry = self.telemetry.clone();

        let handle = std::thread::spawn(move || {
            debug!("Audit writer thread started");
            for event in receiver {
                if let Err(e) = sink.write(&event) {
                    error!("Failed to write audit event {}: {}", event.sequence, e);
                    failures.fetch_add(1, Ordering::Relaxed);
                    if let Some(telemetry) = &telemetry {
                        telemetry.record_audit_failure();
                    }
                }
            }
            if let Err(e) = sink.flush() {
                error!("Failed to flush audit sink: {}", e);
            }
            debug!("Audit writer thread stopped");
        });

        *self.sender.lock().unwrap() = Some(sender);
        *self.writer.lock().unwrap() = Some(handle);
        self
    }

    /// Append an event, returning its sequence number
    pub fn record(&self, mut event: AuditEvent) -> u64 {
        let mut events = self.events.lock().unwrap();
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        event.sequence = sequence;

        info!(
            "AUDIT #{} {} [{}] by {}",
            sequence,
            event.kind(),
            event.service,
            event.actor
        );

        // Queued while the events lock is held so the sink sees sequence order
        let delivered = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map(|sender| sender.send(event.clone()).is_ok());

        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
        drop(events);

        if delivered == Some(false) {
            error!("Audit writer is gone; event {} not persisted", sequence);
            self.record_failure();
        }
        sequence
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_audit_failure();
        }
    }

    /// Sink write failures so far
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events matching `query`, newest first
    pub fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let limit = query.limit.unwrap_or(usize::MAX);
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|event| query.matches(event))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every retained event about one alert, in the order it was recorded
    pub fn by_alert(&self, alert_id: crate::alerts::AlertId) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.alert_id == Some(alert_id))
            .cloned()
            .collect()
    }

    /// Action records, oldest first, optionally for one service
    pub fn action_records(&self, service: Option<&str>) -> Vec<ActionRecord> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| service.map_or(true, |s| event.service == s))
            .filter_map(|event| match &event.payload {
                AuditPayload::ActionRecorded { record } => Some(record.clone()),
                _ => None,
            })
            .collect()
    }

    /// Summarize the retained trail between `start` and `end` (inclusive)
    pub fn compliance_report(&self, start: Timestamp, end: Timestamp) -> ComplianceReport {
        let query = AuditQuery {
            since: Some(start),
            until: Some(end),
            ..AuditQuery::default()
        };

        let mut events = self.query(&query);
        events.reverse();

        let mut report = ComplianceReport {
            start,
            end,
            total_events: events.len(),
            events_by_kind: BTreeMap::new(),
            events_by_service: BTreeMap::new(),
            events_by_actor: BTreeMap::new(),
            actions_executed: 0,
            actions_succeeded: 0,
            denials: Vec::new(),
            failed_actions: Vec::new(),
            generated_at: Utc::now(),
        };

        for event in &events {
            *report
                .events_by_kind
                .entry(event.kind().as_str().to_string())
                .or_insert(0) += 1;
            *report
                .events_by_service
                .entry(event.service.clone())
                .or_insert(0) += 1;
            *report.events_by_actor.entry(event.actor.clone()).or_insert(0) += 1;

            let AuditPayload::ActionRecorded { record } = &event.payload else {
                continue;
            };

            if let GateOutcome::Denied { reason, detail } = &record.outcome {
                report.denials.push(DenialEntry {
                    at: event.timestamp,
                    service: event.service.clone(),
                    alert_id: record.alert_id,
                    action: record.proposal.kind.to_string(),
                    reason: reason.to_string(),
                    detail: detail.clone(),
                });
            }

            if let Some(result) = &record.result {
                report.actions_executed += 1;
                if result.succeeded() {
                    report.actions_succeeded += 1;
                } else {
                    report.failed_actions.push(FailureEntry {
                        at: event.timestamp,
                        service: event.service.clone(),
                        alert_id: record.alert_id,
                        action: record.proposal.kind.to_string(),
                        detail: result.detail.clone(),
                    });
                }
            }
        }

        report
    }

    /// Count of retained events per kind
    pub fn counts(&self) -> BTreeMap<AuditKind, usize> {
        let mut counts = BTreeMap::new();
        for event in self.events.lock().unwrap().iter() {
            *counts.entry(event.kind()).or_insert(0) += 1;
        }
        counts
    }

    /// Stop the writer thread after it has drained every queued event
    pub fn close(&self) {
        let sender = self.sender.lock().unwrap().take();
        drop(sender);
        if let Some(handle) = self.writer.lock().unwrap().take() {
            if handle.join().is_err() {
                error!("Audit writer thread panicked");
            }
        }
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        self.close();
    }
}

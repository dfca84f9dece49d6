//! Operational telemetry for the remediation pipeline
//!
//! Tracks how the engine itself behaves: analysis latency, model fallbacks,
//! heuristic diagnoses, gate decisions, executor outcomes, notification
//! delivery and audit write failures. Nothing in here can veto a decision.

use crate::remediation::{DenyReason, ExecutionStatus};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Point-in-time view of the pipeline telemetry
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    /// Current resident memory in bytes (0 when unknown)
    pub memory_usage_bytes: u64,
    /// Observations submitted in the last minute
    pub observations_per_minute: u64,
    /// Average analysis latency in milliseconds
    pub avg_analysis_latency_ms: f64,
    pub successful_notifications_per_minute: u64,
    pub failed_notifications_per_minute: u64,
    /// Notification success rate as a percentage (0-100)
    pub notification_success_rate: f64,
    /// Completions served by a backend other than the first in the chain
    pub model_fallbacks: u64,
    pub heuristic_diagnoses: u64,
    pub audit_write_failures: u64,
    pub actions_allowed: u64,
    pub approvals_requested: u64,
    /// Denials keyed by reason code
    pub denials: BTreeMap<String, u64>,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
    pub executions_timed_out: u64,
    pub timestamp: DateTime<Utc>,
}

/// Tracks timing information for analysis operations
#[derive(Debug, Clone)]
struct AnalysisLatency {
    duration: Duration,
}

/// Tracks notification delivery results
#[derive(Debug, Clone)]
struct NotificationResult {
    success: bool,
    timestamp: DateTime<Utc>,
}

/// Observation counter bucket
#[derive(Debug, Clone)]
struct EventCount {
    count: u64,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    model_fallbacks: AtomicU64,
    heuristic_diagnoses: AtomicU64,
    audit_write_failures: AtomicU64,
    actions_allowed: AtomicU64,
    approvals_requested: AtomicU64,
    executions_succeeded: AtomicU64,
    executions_failed: AtomicU64,
    executions_timed_out: AtomicU64,
}

/// Telemetry collector shared by every pipeline component
#[derive(Debug)]
pub struct PipelineTelemetry {
    /// Recent analysis latencies (last 100 operations)
    analysis_latencies: Arc<Mutex<VecDeque<AnalysisLatency>>>,
    /// Recent notification results (last 1000 notifications)
    notification_results: Arc<Mutex<VecDeque<NotificationResult>>>,
    observation_counts: Arc<Mutex<VecDeque<EventCount>>>,
    denials: Arc<Mutex<BTreeMap<String, u64>>>,
    counters: Arc<Counters>,
    max_latency_samples: usize,
    max_notification_samples: usize,
    /// Maximum age for observation count buckets
    max_count_age: chrono::Duration,
}

impl Default for PipelineTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineTelemetry {
    pub fn new() -> Self {
        Self {
            analysis_latencies: Arc::new(Mutex::new(VecDeque::new())),
            notification_results: Arc::new(Mutex::new(VecDeque::new())),
            observation_counts: Arc::new(Mutex::new(VecDeque::new())),
            denials: Arc::new(Mutex::new(BTreeMap::new())),
            counters: Arc::new(Counters::default()),
            max_latency_samples: 100,
            max_notification_samples: 1000,
            max_count_age: chrono::Duration::minutes(5),
        }
    }

    /// Record the latency of one analysis (model chain or heuristic)
    pub fn record_analysis_latency(&self, duration: Duration) {
        debug!("Recording analysis latency: {:?}", duration);

        let mut latencies = self.analysis_latencies.lock().unwrap();
        latencies.push_back(AnalysisLatency { duration });

        while latencies.len() > self.max_latency_samples {
            latencies.pop_front();
        }
    }

    /// Record the result of a notification delivery attempt
    pub fn record_notification_result(&self, success: bool) {
        debug!("Recording notification result: success={}", success);

        let mut results = self.notification_results.lock().unwrap();
        results.push_back(NotificationResult {
            success,
            timestamp: Utc::now(),
        });

        while results.len() > self.max_notification_samples {
            results.pop_front();
        }
    }

    /// Record that observations were submitted
    pub fn record_observations(&self, count: u64) {
        if count == 0 {
            return;
        }

        let now = Utc::now();
        let mut counts = self.observation_counts.lock().unwrap();
        counts.push_back(EventCount {
            count,
            timestamp: now,
        });

        let cutoff = now - self.max_count_age;
        while let Some(front) = counts.front() {
            if front.timestamp < cutoff {
                counts.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn record_fallback(&self) {
        self.counters.model_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_heuristic_diagnosis(&self) {
        self.counters
            .heuristic_diagnoses
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed audit write; the pipeline carries on regardless
    pub fn record_audit_failure(&self) {
        self.counters
            .audit_write_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_allowed(&self) {
        self.counters.actions_allowed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_approval_requested(&self) {
        self.counters
            .approvals_requested
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_denial(&self, reason: DenyReason) {
        *self
            .denials
            .lock()
            .unwrap()
            .entry(reason.as_str().to_string())
            .or_insert(0) += 1;
    }

    pub fn record_execution(&self, status: ExecutionStatus) {
        let counter = match status {
            ExecutionStatus::Succeeded => &self.counters.executions_succeeded,
            ExecutionStatus::Failed => &self.counters.executions_failed,
            ExecutionStatus::TimedOut => &self.counters.executions_timed_out,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn audit_failures(&self) -> u64 {
        self.counters.audit_write_failures.load(Ordering::Relaxed)
    }

    /// Get current resident memory of the process
    fn get_memory_usage(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb) = line
                            .split_whitespace()
                            .nth(1)
                            .and_then(|kb| kb.parse::<u64>().ok())
                        {
                            return kb * 1024;
                        }
                    }
                }
            }
        }

        0
    }

    fn calculate_avg_latency(&self) -> f64 {
        let latencies = self.analysis_latencies.lock().unwrap();

        if latencies.is_empty() {
            return 0.0;
        }

        let total_ms: f64 = latencies
            .iter()
            .map(|l| l.duration.as_millis() as f64)
            .sum();

        total_ms / latencies.len() as f64
    }

    fn calculate_observation_rate(&self) -> u64 {
        let one_minute_ago = Utc::now() - chrono::Duration::minutes(1);
        self.observation_counts
            .lock()
            .unwrap()
            .iter()
            .filter(|count| count.timestamp >= one_minute_ago)
            .map(|count| count.count)
            .sum()
    }

    fn calculate_notification_success_rate(&self) -> (u64, u64, f64) {
        let one_minute_ago = Utc::now() - chrono::Duration::minutes(1);
        let results = self.notification_results.lock().unwrap();

        let recent: Vec<_> = results
            .iter()
            .filter(|result| result.timestamp >= one_minute_ago)
            .collect();

        if recent.is_empty() {
            return (0, 0, 100.0);
        }

        let successful = recent.iter().filter(|r| r.success).count() as u64;
        let failed = recent.len() as u64 - successful;
        let success_rate = (successful as f64 / recent.len() as f64) * 100.0;

        (successful, failed, success_rate)
    }

    /// Collect a telemetry snapshot and log anything that looks unhealthy
    pub fn collect_metrics(&self) -> TelemetrySnapshot {
        debug!("Collecting pipeline telemetry");

        let (successful, failed, notification_success_rate) =
            self.calculate_notification_success_rate();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let snapshot = TelemetrySnapshot {
            memory_usage_bytes: self.get_memory_usage(),
            observations_per_minute: self.calculate_observation_rate(),
            avg_analysis_latency_ms: self.calculate_avg_latency(),
            successful_notifications_per_minute: successful,
            failed_notifications_per_minute: failed,
            notification_success_rate,
            model_fallbacks: load(&self.counters.model_fallbacks),
            heuristic_diagnoses: load(&self.counters.heuristic_diagnoses),
            audit_write_failures: load(&self.counters.audit_write_failures),
            actions_allowed: load(&self.counters.actions_allowed),
            approvals_requested: load(&self.counters.approvals_requested),
            denials: self.denials.lock().unwrap().clone(),
            executions_succeeded: load(&self.counters.executions_succeeded),
            executions_failed: load(&self.counters.executions_failed),
            executions_timed_out: load(&self.counters.executions_timed_out),
            timestamp: Utc::now(),
        };

        info!(
            "Pipeline telemetry: memory={}MB, observations/min={}, analysis_latency={:.1}ms, fallbacks={}, heuristic={}, allowed={}, denied={}, executed ok/failed/timeout={}/{}/{}",
            snapshot.memory_usage_bytes / 1024 / 1024,
            snapshot.observations_per_minute,
            snapshot.avg_analysis_latency_ms,
            snapshot.model_fallbacks,
            snapshot.heuristic_diagnoses,
            snapshot.actions_allowed,
            snapshot.denials.values().sum::<u64>(),
            snapshot.executions_succeeded,
            snapshot.executions_failed,
            snapshot.executions_timed_out
        );

        if snapshot.memory_usage_bytes > 500 * 1024 * 1024 {
            warn!(
                "High memory usage detected: {}MB",
                snapshot.memory_usage_bytes / 1024 / 1024
            );
        }

        if snapshot.avg_analysis_latency_ms > 30000.0 {
            warn!(
                "High analysis latency detected: {:.1}ms",
                snapshot.avg_analysis_latency_ms
            );
        }

        if snapshot.audit_write_failures > 0 {
            warn!(
                "{} audit write(s) failed; the audit sink may be unavailable",
                snapshot.audit_write_failures
            );
        }

        if notification_success_rate < 90.0 && successful + failed > 0 {
            warn!(
                "Low notification success rate: {:.1}%",
                notification_success_rate
            );
        }

        snapshot
    }
}

/// Measures one analysis and records its latency on `finish`
pub struct AnalysisTimer {
    start_time: Instant,
    telemetry: Arc<PipelineTelemetry>,
}

impl AnalysisTimer {
    pub fn start(telemetry: Arc<PipelineTelemetry>) -> Self {
        Self {
            start_time: Instant::now(),
            telemetry,
        }
    }

    pub fn finish(self) {
        let duration = self.start_time.elapsed();
        self.telemetry.record_analysis_latency(duration);
    }
}

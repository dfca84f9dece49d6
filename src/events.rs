//! Input event types for the remediation engine
//!
//! Log and health adapters translate whatever they watch into these shapes.
//! Observations are ephemeral: the alert manager consumes them immediately
//! and keeps only the derived alert state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

/// Severity hint attached to an observation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// A raw error or event extracted from a log stream or health probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    /// Identifier of the service that produced the line
    pub service: String,
    /// When the line was written
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
    /// Severity reported by the source, if it had one
    #[serde(default)]
    pub severity: Option<Severity>,
    /// The raw message text
    pub text: String,
    /// Surrounding log lines
    #[serde(default)]
    pub context: Vec<String>,
}

impl Observation {
    /// Create an observation stamped with the current time and no severity hint
    pub fn new(service: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            timestamp: Utc::now(),
            severity: None,
            text: text.into(),
            context: Vec::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn at(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_context(mut self, context: Vec<String>) -> Self {
        self.context = context;
        self
    }
}

/// Health state change reported by a probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthEvent {
    pub service: String,
    pub healthy: bool,
    #[serde(default = "Utc::now")]
    pub timestamp: Timestamp,
    /// Optional probe output, used as the alert text when unhealthy
    #[serde(default)]
    pub detail: Option<String>,
}

impl HealthEvent {
    /// Build the observation recorded when a service turns unhealthy
    pub fn to_observation(&self) -> Observation {
        let text = match &self.detail {
            Some(detail) => format!("health check failed for {}: {}", self.service, detail),
            None => format!("health check failed for {}", self.service),
        };
        Observation {
            service: self.service.clone(),
            timestamp: self.timestamp,
            severity: Some(Severity::Error),
            text,
            context: Vec::new(),
        }
    }
}

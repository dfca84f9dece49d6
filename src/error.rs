use crate::alerts::{AlertId, AlertState};
use crate::llm::{Complexity, StuckReason};
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a single LLM backend call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend communication failed: {0}")]
    Communication(String),

    #[error("Provider returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Request timeout")]
    Timeout,
}

impl BackendError {
    /// Whether the failure is likely to clear up on its own (network, 5xx, 429)
    pub fn is_transient(&self) -> bool {
        match self {
            BackendError::Communication(_) | BackendError::Timeout => true,
            BackendError::Api { status, .. } => *status == 429 || *status >= 500,
            BackendError::InvalidResponse(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if let Some(status) = err.status() {
            BackendError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            BackendError::Communication(err.to_string())
        }
    }
}

/// One failed attempt inside a fallback chain
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptFailure {
    pub backend: String,
    pub error: OrchestratorError,
}

/// Errors surfaced by the model orchestrator
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    #[error("All backends exhausted after {} failed attempt(s)", .attempts.len())]
    AllBackendsExhausted { attempts: Vec<AttemptFailure> },

    #[error("Backend '{backend}' timed out after {timeout:?}")]
    Timeout { backend: String, timeout: Duration },

    #[error("Backend '{backend}' produced stuck output: {reason}")]
    StuckOutput { backend: String, reason: StuckReason },

    #[error("Backend '{backend}' failed: {error}")]
    ProviderError { backend: String, error: BackendError },

    #[error("Backend '{backend}' returned output that failed validation: {message}")]
    InvalidOutput { backend: String, message: String },

    #[error("No backends configured for the {0} tier")]
    NoBackendsAvailable(Complexity),
}

/// Errors raised by the alert lifecycle manager
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    #[error("Alert {0} not found")]
    NotFound(AlertId),

    #[error("Alert {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: AlertId,
        from: AlertState,
        to: AlertState,
    },

    #[error("Alert {0} is resolved and archived")]
    Archived(AlertId),

    #[error("Observations for service '{0}' are suppressed")]
    Suppressed(String),
}

/// Errors raised when answering an approval request
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApprovalError {
    #[error("No approval pending for alert {0}")]
    NotPending(AlertId),
}

/// Errors raised by remediation targets
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Remediation target failed: {0}")]
    Target(String),

    #[error("Action '{0}' is not supported by this target")]
    Unsupported(String),

    #[error("Target call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors raised when delivering notifications
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotifyError {
    #[error("Notification delivery failed: {0}")]
    DeliveryFailed(String),

    #[error("Notification channel closed")]
    ChannelClosed,
}

/// Errors raised while persisting audit events
#[derive(Error, Debug)]
pub enum AuditError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Errors returned by the remediation pipeline entry points
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    Alert(#[from] AlertError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("A remediation chain is already running for alert {0}")]
    ChainInFlight(AlertId),

    #[error("Worker pool is shut down")]
    Shutdown,
}

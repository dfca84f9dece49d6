/// Error types for the remediation engine
pub mod error;

/// Observations and health events fed into the pipeline
pub mod events;

/// Consecutive-failure circuit breaker
pub mod circuit;

/// Sliding-window rate limiter
pub mod rate_limiter;

/// Alert lifecycle: fingerprinting, deduplication and escalation
pub mod alerts;

/// Model backends and the orchestrator that routes between them
pub mod llm;

/// Error analysis with model and heuristic diagnoses
pub mod analysis;

/// Proposals, the safety guard, approvals and execution
pub mod remediation;

/// Append-only audit trail
pub mod audit;

/// Notification delivery and throttling
pub mod notify;

/// Pipeline telemetry
pub mod monitoring;

/// Configuration management
pub mod config;

/// The closed loop from observation to audited action
pub mod pipeline;

// Re-export commonly used types
pub use config::Config;
pub use error::{
    AlertError, ApprovalError, AuditError, BackendError, ConfigError, ExecutorError, NotifyError,
    OrchestratorError, PipelineError,
};
pub use pipeline::{PipelineOutcome, RemediationPipeline, TickReport};

/// Append-only audit trail of every decision the pipeline makes
pub mod audit_logger;
pub mod event;

pub use audit_logger::{AuditLogger, AuditSink, JsonlFileSink};
pub use event::{AuditEvent, AuditKind, AuditPayload, AuditQuery, ComplianceReport};

/// Alert lifecycle: fingerprinting, deduplication and escalation
pub mod alert;
pub mod alert_manager;
pub mod escalation;
pub mod fingerprint;

pub use alert::{
    Alert, AlertHandle, AlertId, AlertState, AlertTransition, Escalation, EscalationReason,
    Priority,
};
pub use alert_manager::{AlertManager, AlertStats};
pub use escalation::{EscalationPolicy, EscalationRule};
pub use fingerprint::Fingerprint;

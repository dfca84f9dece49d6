/// Proposals, gate outcomes and action records
pub mod action;
/// Human approval of gated proposals
pub mod approval;
/// Running actions against remediation targets
pub mod executor;
/// The safety guard
pub mod guard;
/// Policy table from diagnosis to proposal
pub mod recommender;

pub use action::{ActionKind, ActionProposal, ActionRecord, GateOutcome, RiskTier};
pub use approval::{ApprovalBroker, ApprovalOutcome, ApprovalRequest, ApprovalTicket};
pub use executor::{
    ActionExecutor, CommandTarget, ExecutionResult, ExecutionStatus, ExecutorSettings,
    RemediationTarget,
};
pub use guard::{
    Denial, DenyReason, FreezeWindow, GateDecision, GuardSettings, GuardStats, MaintenanceWindow,
    Reservation, SafetyGuard, Violation,
};
pub use recommender::{ActionRecommender, PolicyRule, PolicyTable, ServicePolicy};

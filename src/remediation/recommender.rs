use crate::alerts::Alert;
use crate::analysis::{Category, Diagnosis};
use crate::remediation::action::{ActionKind, ActionProposal, RiskTier};
use chrono::Utc;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// One row of the policy table
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub category: Category,
    pub kind: ActionKind,
    pub risk: RiskTier,
    /// Diagnoses below this confidence are downgraded to `notify_only`
    #[serde(default)]
    pub min_confidence: f64,
}

impl PolicyRule {
    pub const fn new(category: Category, kind: ActionKind, risk: RiskTier, min_confidence: f64) -> Self {
        Self {
            category,
            kind,
            risk,
            min_confidence,
        }
    }

    fn name(&self) -> String {
        format!("{}->{}", self.category, self.kind)
    }
}

const DEFAULT_RULES: [PolicyRule; 10] = [
    PolicyRule::new(Category::Connectivity, ActionKind::Restart, RiskTier::Low, 0.5),
    PolicyRule::new(Category::ResourceExhaustion, ActionKind::Restart, RiskTier::Medium, 0.6),
    PolicyRule::new(Category::Crash, ActionKind::Restart, RiskTier::Medium, 0.6),
    PolicyRule::new(Category::Application, ActionKind::Redeploy, RiskTier::High, 0.8),
    PolicyRule::new(Category::Performance, ActionKind::NotifyOnly, RiskTier::Low, 0.0),
    PolicyRule::new(Category::Dependency, ActionKind::NotifyOnly, RiskTier::Low, 0.0),
    PolicyRule::new(Category::Configuration, ActionKind::NotifyOnly, RiskTier::Medium, 0.0),
    PolicyRule::new(Category::Security, ActionKind::NotifyOnly, RiskTier::High, 0.0),
    PolicyRule::new(Category::DataCorruption, ActionKind::NotifyOnly, RiskTier::High, 0.0),
    PolicyRule::new(Category::Unknown, ActionKind::NotifyOnly, RiskTier::Low, 0.0),
];

/// Declared mapping from diagnosis category to action and risk
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyTable {
    rules: HashMap<Category, PolicyRule>,
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            rules: DEFAULT_RULES.iter().map(|r| (r.category, *r)).collect(),
        }
    }
}

impl PolicyTable {
    /// Override (or add) the rule for a category
    pub fn with_rule(mut self, rule: PolicyRule) -> Self {
        self.rules.insert(rule.category, rule);
        self
    }

    /// The rule for a category; categories without a rule notify at low risk
    pub fn rule_for(&self, category: Category) -> PolicyRule {
        self.rules.get(&category).copied().unwrap_or(PolicyRule::new(
            category,
            ActionKind::NotifyOnly,
            RiskTier::Low,
            0.0,
        ))
    }
}

/// Per-service remediation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicePolicy {
    /// Disruptive actions this service may receive
    pub allowed_actions: Vec<ActionKind>,
    /// Resource the actions are performed on; defaults to the service id
    pub target: Option<String>,
}

impl Default for ServicePolicy {
    fn default() -> Self {
        Self {
            allowed_actions: vec![ActionKind::Restart, ActionKind::NotifyOnly, ActionKind::NoOp],
            target: None,
        }
    }
}

impl ServicePolicy {
    /// Non-disruptive actions are always allowed
    pub fn allows(&self, kind: ActionKind) -> bool {
        !kind.is_disruptive() || self.allowed_actions.contains(&kind)
    }
}

/// Maps diagnoses to remediation proposals
///
/// Pure: the output depends only on the alert, the diagnosis and the static
/// policy, so every decision can be reproduced from the audit trail.
#[derive(Debug, Clone, Default)]
pub struct ActionRecommender {
    table: PolicyTable,
    services: HashMap<String, ServicePolicy>,
    default_service: ServicePolicy,
}

impl ActionRecommender {
    pub fn new(table: PolicyTable) -> Self {
        Self {
            table,
            ..Self::default()
        }
    }

    pub fn with_service(mut self, service: impl Into<String>, policy: ServicePolicy) -> Self {
        self.services.insert(service.into(), policy);
        self
    }

    pub fn with_default_service_policy(mut self, policy: ServicePolicy) -> Self {
        self.default_service = policy;
        self
    }

    pub fn service_policy(&self, service: &str) -> &ServicePolicy {
        self.services.get(service).unwrap_or(&self.default_service)
    }

    /// Recommend an action for an alert given its diagnosis
    pub fn recommend(&self, alert: &Alert, diagnosis: &Diagnosis) -> ActionProposal {
        let service = self.service_policy(&alert.service);
        let target = service
            .target
            .clone()
            .unwrap_or_else(|| alert.service.clone());
        let rule = self.table.rule_for(diagnosis.category);

        let (kind, risk, rule_name, rationale) = if !alert.is_active() {
            (
                ActionKind::NoOp,
                RiskTier::Low,
                "alert_resolved".to_string(),
                format!("Alert is already {}", alert.state),
            )
        } else if diagnosis.confidence < rule.min_confidence {
            (
                ActionKind::NotifyOnly,
                RiskTier::Low,
                format!("{}:low_confidence", rule.name()),
                format!(
                    "{} diagnosis confidence {:.2} is below the {:.2} required for {}; notifying instead",
                    diagnosis.category, diagnosis.confidence, rule.min_confidence, rule.kind
                ),
            )
        } else if !service.allows(rule.kind) {
            (
                ActionKind::NotifyOnly,
                RiskTier::Low,
                format!("{}:not_allowed", rule.name()),
                format!(
                    "{} is not an allowed action for '{}'; notifying instead",
                    rule.kind, alert.service
                ),
            )
        } else {
            (
                rule.kind,
                rule.risk,
                rule.name(),
                format!(
                    "{} diagnosis ({:.2}): {}",
                    diagnosis.category, diagnosis.confidence, diagnosis.root_cause
                ),
            )
        };

        debug!(
            "Policy for alert {}: category={} rule={} -> {} ({} risk)",
            alert.id, diagnosis.category, rule_name, kind, risk
        );
        info!(
            "Recommending {} on '{}' for alert {} ({} risk)",
            kind, target, alert.id, risk
        );

        ActionProposal {
            id: Uuid::new_v4(),
            alert_id: alert.id,
            service: alert.service.clone(),
            kind,
            target,
            risk,
            confidence: diagnosis.confidence,
            rationale,
            rule: rule_name,
            created_at: Utc::now(),
        }
    }
}

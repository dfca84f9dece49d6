use crate::alerts::{EscalationPolicy, EscalationRule, Priority};
use crate::error::ConfigError;
use crate::llm::{
    AnthropicBackend, BackendDescriptor, Complexity, LLMBackend, MockBackend, ModelOrchestrator,
    OllamaBackend, OpenAIBackend, OrchestratorSettings, StuckPolicy,
};
use crate::remediation::{
    ActionKind, ActionRecommender, CommandTarget, ExecutorSettings, FreezeWindow, GuardSettings,
    MaintenanceWindow, PolicyRule, PolicyTable, ServicePolicy,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration, loaded from TOML
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub alerts: AlertsConfig,
    pub llm: LlmConfig,
    pub guard: GuardConfig,
    pub executor: ExecutorConfig,
    pub audit: AuditConfig,
    pub notifications: NotificationConfig,
    pub pipeline: PipelineConfig,
    /// Overrides of the default category policy table
    pub policy: Vec<PolicyRule>,
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    /// Occurrences within the window that raise priority one level
    pub escalation_occurrences: u32,
    pub escalation_window_secs: u64,
    pub p1_unacknowledged_minutes: u64,
    pub p2_unacknowledged_minutes: u64,
    pub p3_unacknowledged_minutes: u64,
    /// Auto-resolve alerts not seen for this long; 0 disables
    pub stale_after_minutes: u64,
    pub max_archived: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            escalation_occurrences: 10,
            escalation_window_secs: 300,
            p1_unacknowledged_minutes: 5,
            p2_unacknowledged_minutes: 30,
            p3_unacknowledged_minutes: 120,
            stale_after_minutes: 0,
            max_archived: 10_000,
        }
    }
}

/// Provider settings of one LLM backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum LlmBackendConfig {
    Ollama {
        endpoint: String,
        model: String,
    },
    OpenAI {
        /// Falls back to `OPENAI_API_KEY`
        #[serde(default)]
        api_key: Option<String>,
        model: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    Anthropic {
        /// Falls back to `ANTHROPIC_API_KEY`
        #[serde(default)]
        api_key: Option<String>,
        model: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    /// Canned response, for trying out configurations offline
    Mock {
        #[serde(default)]
        response: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedBackend {
    pub name: String,
    #[serde(flatten)]
    pub backend: LlmBackendConfig,
    #[serde(default)]
    pub cost_per_1k_input: f64,
    #[serde(default)]
    pub cost_per_1k_output: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub triage: Vec<String>,
    pub standard: Vec<String>,
    pub deep: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backends: Vec<NamedBackend>,
    pub tiers: TierConfig,
    /// Tried after the tier list, in order
    pub fallback: Vec<String>,
    pub request_timeout_secs: u64,
    pub failure_threshold: u32,
    pub cool_off_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
    pub stuck: StuckPolicy,
}

impl Default for LlmConfig {
    fn default() -> Self {
        let local = "local".to_string();
        Self {
            backends: vec![NamedBackend {
                name: local.clone(),
                backend: LlmBackendConfig::Ollama {
                    endpoint: "http://localhost:11434".to_string(),
                    model: "llama3".to_string(),
                },
                cost_per_1k_input: 0.0,
                cost_per_1k_output: 0.0,
            }],
            tiers: TierConfig {
                triage: vec![local.clone()],
                standard: vec![local.clone()],
                deep: vec![local],
            },
            fallback: Vec::new(),
            request_timeout_secs: 30,
            failure_threshold: 5,
            cool_off_secs: 300,
            max_tokens: 1024,
            temperature: 0.1,
            stuck: StuckPolicy::default(),
        }
    }
}

impl LlmConfig {
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            stuck: self.stuck.clone(),
            failure_threshold: self.failure_threshold,
            cool_off: seconds(self.cool_off_secs),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    /// Build the orchestrator with every configured backend and tier
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` if a hosted backend has no API key.
    pub fn build_orchestrator(&self) -> Result<ModelOrchestrator, ConfigError> {
        let mut orchestrator = ModelOrchestrator::new(self.orchestrator_settings());

        for named in &self.backends {
            let backend = create_backend(named)?;
            info!("Configured LLM backend '{}' ({})", named.name, backend.model());
            orchestrator = orchestrator.with_backend(
                BackendDescriptor::new(named.name.clone(), backend)
                    .with_pricing(named.cost_per_1k_input, named.cost_per_1k_output),
            );
        }

        Ok(orchestrator
            .with_tier(Complexity::Triage, self.tiers.triage.clone())
            .with_tier(Complexity::Standard, self.tiers.standard.clone())
            .with_tier(Complexity::Deep, self.tiers.deep.clone())
            .with_fallback(self.fallback.clone()))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut names = HashSet::new();
        for named in &self.backends {
            if named.name.trim().is_empty() {
                return Err(invalid("llm backend name must not be empty"));
            }
            if !names.insert(named.name.as_str()) {
                return Err(invalid(format!("duplicate llm backend '{}'", named.name)));
            }
            let model = match &named.backend {
                LlmBackendConfig::Ollama { model, .. }
                | LlmBackendConfig::OpenAI { model, .. }
                | LlmBackendConfig::Anthropic { model, .. } => Some(model),
                LlmBackendConfig::Mock { .. } => None,
            };
            if model.is_some_and(|m| m.trim().is_empty()) {
                return Err(invalid(format!("llm backend '{}' has no model", named.name)));
            }
        }

        let referenced = self
            .tiers
            .triage
            .iter()
            .chain(&self.tiers.standard)
            .chain(&self.tiers.deep)
            .chain(&self.fallback);
        for name in referenced {
            if !names.contains(name.as_str()) {
                return Err(invalid(format!("unknown llm backend '{}' in tiers", name)));
            }
        }

        if self.request_timeout_secs == 0 {
            return Err(invalid("llm.request_timeout_secs must be greater than 0"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(invalid("llm.temperature must be between 0.0 and 2.0"));
        }
        if !(0.0..=1.0).contains(&self.stuck.min_unique_word_ratio) {
            return Err(invalid("llm.stuck.min_unique_word_ratio must be between 0.0 and 1.0"));
        }
        Ok(())
    }
}

fn create_backend(named: &NamedBackend) -> Result<Arc<dyn LLMBackend>, ConfigError> {
    let missing_key = |var: &str| {
        invalid(format!(
            "llm backend '{}' needs an api_key or the {} environment variable",
            named.name, var
        ))
    };

    let backend: Arc<dyn LLMBackend> = match &named.backend {
        LlmBackendConfig::Ollama { endpoint, model } => {
            Arc::new(OllamaBackend::new(endpoint.clone(), model.clone()))
        }
        LlmBackendConfig::OpenAI {
            api_key,
            model,
            base_url,
        } => {
            let key = api_key.clone().ok_or_else(|| missing_key("OPENAI_API_KEY"))?;
            match base_url {
                Some(url) => Arc::new(OpenAIBackend::with_base_url(key, model.clone(), url.clone())),
                None => Arc::new(OpenAIBackend::new(key, model.clone())),
            }
        }
        LlmBackendConfig::Anthropic {
            api_key,
            model,
            base_url,
        } => {
            let key = api_key
                .clone()
                .ok_or_else(|| missing_key("ANTHROPIC_API_KEY"))?;
            match base_url {
                Some(url) => Arc::new(AnthropicBackend::with_base_url(key, model.clone(), url.clone())),
                None => Arc::new(AnthropicBackend::new(key, model.clone())),
            }
        }
        LlmBackendConfig::Mock { response } => Arc::new(MockBackend::success(
            response.as_deref().unwrap_or(
                r#"{"category":"unknown","confidence":0.5,"root_cause":"mock backend","impact":"none"}"#,
            ),
        )),
    };
    Ok(backend)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub max_actions_per_hour: usize,
    pub cooldown_minutes: u64,
    /// Consecutive failed actions that open a service's circuit
    pub failure_threshold: u32,
    pub cool_off_minutes: u64,
    pub always_approve: Vec<ActionKind>,
    pub approval_timeout_minutes: u64,
    pub freeze_windows: Vec<FreezeWindow>,
    /// Recurring windows reported alongside approval requests
    pub maintenance_windows: Vec<MaintenanceWindow>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_actions_per_hour: 3,
            cooldown_minutes: 10,
            failure_threshold: 3,
            cool_off_minutes: 30,
            always_approve: vec![ActionKind::Redeploy, ActionKind::Reboot],
            approval_timeout_minutes: 15,
            freeze_windows: Vec::new(),
            maintenance_windows: Vec::new(),
        }
    }
}

impl GuardConfig {
    pub fn settings(&self) -> GuardSettings {
        GuardSettings {
            max_actions_per_window: self.max_actions_per_hour,
            window: chrono::Duration::hours(1),
            cooldown: minutes(self.cooldown_minutes),
            failure_threshold: self.failure_threshold,
            cool_off: minutes(self.cool_off_minutes),
            always_approve: self.always_approve.clone(),
        }
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_minutes.saturating_mul(60))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub dry_run: bool,
    pub action_timeout_secs: u64,
    pub snapshot_timeout_secs: u64,
    pub settle_delay_secs: u64,
    /// Shell command template per action kind, `{target}` is substituted
    pub commands: BTreeMap<String, String>,
    pub snapshot_command: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            action_timeout_secs: 120,
            snapshot_timeout_secs: 10,
            settle_delay_secs: 5,
            commands: BTreeMap::new(),
            snapshot_command: None,
        }
    }
}

impl ExecutorConfig {
    pub fn settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            dry_run: self.dry_run,
            action_timeout: Duration::from_secs(self.action_timeout_secs),
            snapshot_timeout: Duration::from_secs(self.snapshot_timeout_secs),
            settle_delay: Duration::from_secs(self.settle_delay_secs),
        }
    }

    /// # Errors
    ///
    /// `ConfigError::ValidationError` for unknown or non-disruptive kinds.
    pub fn command_target(&self) -> Result<CommandTarget, ConfigError> {
        let mut target = CommandTarget::new();
        for (kind, template) in &self.commands {
            let kind: ActionKind = kind.parse().map_err(invalid)?;
            if !kind.is_disruptive() {
                return Err(invalid(format!(
                    "executor.commands: '{}' does not run a command",
                    kind
                )));
            }
            target = target.with_command(kind, template.clone());
        }
        if let Some(snapshot) = &self.snapshot_command {
            target = target.with_snapshot_command(snapshot.clone());
        }
        Ok(target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// JSONL file the trail is appended to; in-memory only when unset
    pub path: Option<PathBuf>,
    pub max_events: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_events: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub max_per_minute: usize,
    pub max_queue_size: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 3,
            max_queue_size: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Concurrent diagnosis/execution chains
    pub max_concurrent: usize,
    pub tick_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            tick_interval_secs: 30,
        }
    }
}

/// `[services.<name>]` section
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Disruptive actions this service may receive; default policy when unset
    pub allowed_actions: Option<Vec<ActionKind>>,
    pub target: Option<String>,
    pub escalation_occurrences: Option<u32>,
    pub escalation_window_secs: Option<u64>,
    /// Drop observations for this service entirely
    pub suppressed: bool,
}

impl Config {
    /// Load, apply environment fallbacks and validate a TOML file
    ///
    /// # Errors
    ///
    /// `ConfigError::ReadError` if the file cannot be read, `TomlError` if it
    /// does not parse and `ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill missing API keys from `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`
    pub fn apply_env(&mut self) {
        for named in &mut self.llm.backends {
            match &mut named.backend {
                LlmBackendConfig::OpenAI { api_key, .. } if api_key.is_none() => {
                    *api_key = std::env::var("OPENAI_API_KEY").ok();
                }
                LlmBackendConfig::Anthropic { api_key, .. } if api_key.is_none() => {
                    *api_key = std::env::var("ANTHROPIC_API_KEY").ok();
                }
                _ => {}
            }
        }
    }

    /// Check ranges and cross-references
    ///
    /// # Errors
    ///
    /// `ConfigError::ValidationError` naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.llm.validate()?;

        for (name, secs) in self.durations() {
            if secs > MAX_DURATION_SECS {
                return Err(invalid(format!("{} is longer than one year", name)));
            }
        }
        if self.alerts.escalation_window_secs == 0 {
            return Err(invalid("alerts.escalation_window_secs must be greater than 0"));
        }
        if self.guard.max_actions_per_hour == 0 {
            warn!("guard.max_actions_per_hour is 0: no disruptive action will ever run");
        }
        if self.guard.failure_threshold == 0 {
            return Err(invalid("guard.failure_threshold must be greater than 0"));
        }
        if self.guard.approval_timeout_minutes == 0 {
            return Err(invalid("guard.approval_timeout_minutes must be greater than 0"));
        }
        for window in &self.guard.freeze_windows {
            if window.end <= window.start {
                return Err(invalid(format!(
                    "freeze window '{}' ends before it starts",
                    window.name
                )));
            }
        }
        if self.executor.action_timeout_secs == 0 {
            return Err(invalid("executor.action_timeout_secs must be greater than 0"));
        }
        self.executor.command_target()?;
        if self.notifications.max_per_minute == 0 {
            return Err(invalid("notifications.max_per_minute must be greater than 0"));
        }
        if self.pipeline.max_concurrent == 0 {
            return Err(invalid("pipeline.max_concurrent must be greater than 0"));
        }
        if self.pipeline.tick_interval_secs == 0 {
            return Err(invalid("pipeline.tick_interval_secs must be greater than 0"));
        }
        for rule in &self.policy {
            if !(0.0..=1.0).contains(&rule.min_confidence) {
                return Err(invalid(format!(
                    "policy for {}: min_confidence must be between 0.0 and 1.0",
                    rule.category
                )));
            }
        }
        Ok(())
    }

    /// Every configured duration, in seconds
    fn durations(&self) -> Vec<(String, u64)> {
        let minutes = |value: u64| value.saturating_mul(60);
        let alerts = &self.alerts;
        let mut durations: Vec<(String, u64)> = [
            ("alerts.escalation_window_secs", alerts.escalation_window_secs),
            ("alerts.p1_unacknowledged_minutes", minutes(alerts.p1_unacknowledged_minutes)),
            ("alerts.p2_unacknowledged_minutes", minutes(alerts.p2_unacknowledged_minutes)),
            ("alerts.p3_unacknowledged_minutes", minutes(alerts.p3_unacknowledged_minutes)),
            ("alerts.stale_after_minutes", minutes(alerts.stale_after_minutes)),
            ("llm.request_timeout_secs", self.llm.request_timeout_secs),
            ("llm.cool_off_secs", self.llm.cool_off_secs),
            ("guard.cooldown_minutes", minutes(self.guard.cooldown_minutes)),
            ("guard.cool_off_minutes", minutes(self.guard.cool_off_minutes)),
            ("guard.approval_timeout_minutes", minutes(self.guard.approval_timeout_minutes)),
            ("executor.action_timeout_secs", self.executor.action_timeout_secs),
            ("executor.snapshot_timeout_secs", self.executor.snapshot_timeout_secs),
            ("executor.settle_delay_secs", self.executor.settle_delay_secs),
            ("pipeline.tick_interval_secs", self.pipeline.tick_interval_secs),
        ]
        .into_iter()
        .map(|(name, secs)| (name.to_string(), secs))
        .collect();
        for (name, service) in &self.services {
            if let Some(secs) = service.escalation_window_secs {
                durations.push((format!("services.{}.escalation_window_secs", name), secs));
            }
        }
        durations
    }

    /// How long an alert may go unseen before it is auto-resolved
    pub fn stale_after(&self) -> Option<chrono::Duration> {
        match self.alerts.stale_after_minutes {
            0 => None,
            value => Some(minutes(value)),
        }
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        let alerts = &self.alerts;
        let default_rule = EscalationRule {
            occurrences: alerts.escalation_occurrences,
            window: seconds(alerts.escalation_window_secs),
        };

        let mut policy = EscalationPolicy::new(default_rule)
            .with_unacknowledged_threshold(
                Priority::P1,
                minutes(alerts.p1_unacknowledged_minutes),
            )
            .with_unacknowledged_threshold(
                Priority::P2,
                minutes(alerts.p2_unacknowledged_minutes),
            )
            .with_unacknowledged_threshold(
                Priority::P3,
                minutes(alerts.p3_unacknowledged_minutes),
            );

        for (name, service) in &self.services {
            if service.escalation_occurrences.is_some() || service.escalation_window_secs.is_some() {
                let rule = EscalationRule {
                    occurrences: service
                        .escalation_occurrences
                        .unwrap_or(default_rule.occurrences),
                    window: service
                        .escalation_window_secs
                        .map(seconds)
                        .unwrap_or(default_rule.window),
                };
                policy = policy.with_service_rule(name.clone(), rule);
            }
        }
        policy
    }

    pub fn recommender(&self) -> ActionRecommender {
        let table = self
            .policy
            .iter()
            .fold(PolicyTable::default(), |table, rule| table.with_rule(*rule));

        self.services
            .iter()
            .fold(ActionRecommender::new(table), |recommender, (name, service)| {
                let defaults = ServicePolicy::default();
                recommender.with_service(
                    name.clone(),
                    ServicePolicy {
                        allowed_actions: service
                            .allowed_actions
                            .clone()
                            .unwrap_or(defaults.allowed_actions),
                        target: service.target.clone(),
                    },
                )
            })
    }

    pub fn suppressed_services(&self) -> Vec<&str> {
        self.services
            .iter()
            .filter(|(_, service)| service.suppressed)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Upper bound for every configured duration
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(MAX_DURATION_SECS) as i64)
}

fn minutes(value: u64) -> chrono::Duration {
    seconds(value.saturating_mul(60))
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

use crate::circuit::{Admission, CircuitBreaker, CircuitState};
use crate::error::{AttemptFailure, BackendError, OrchestratorError};
use crate::events::Timestamp;
use crate::llm::backends::{BackendResponse, CompletionRequest, LLMBackend};
use crate::llm::stuck::{self, NextStep, StuckPolicy};
use crate::monitoring::PipelineTelemetry;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Routing tier for a completion request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    /// Cheap, fast classification
    Triage,
    Standard,
    /// Most capable models for critical or unclear incidents
    Deep,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Complexity::Triage => "triage",
            Complexity::Standard => "standard",
            Complexity::Deep => "deep",
        };
        f.write_str(label)
    }
}

/// A named backend with its pricing
#[derive(Clone)]
pub struct BackendDescriptor {
    pub name: String,
    pub backend: Arc<dyn LLMBackend>,
    /// USD per 1000 prompt tokens
    pub cost_per_1k_input: f64,
    /// USD per 1000 completion tokens
    pub cost_per_1k_output: f64,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>, backend: Arc<dyn LLMBackend>) -> Self {
        Self {
            name: name.into(),
            backend,
            cost_per_1k_input: 0.0,
            cost_per_1k_output: 0.0,
        }
    }

    pub fn with_pricing(mut self, per_1k_input: f64, per_1k_output: f64) -> Self {
        self.cost_per_1k_input = per_1k_input;
        self.cost_per_1k_output = per_1k_output;
        self
    }

    fn cost_of(&self, response: &BackendResponse) -> f64 {
        (response.prompt_tokens as f64 * self.cost_per_1k_input
            + response.completion_tokens as f64 * self.cost_per_1k_output)
            / 1000.0
    }
}

impl fmt::Debug for BackendDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendDescriptor")
            .field("name", &self.name)
            .field("model", &self.backend.model())
            .finish()
    }
}

/// Orchestrator tunables
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Hard timeout for a single backend call
    pub request_timeout: Duration,
    pub stuck: StuckPolicy,
    /// Consecutive failures that open a backend's circuit
    pub failure_threshold: u32,
    pub cool_off: chrono::Duration,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            stuck: StuckPolicy::default(),
            failure_threshold: 5,
            cool_off: chrono::Duration::minutes(5),
            max_tokens: 1024,
            temperature: 0.1,
        }
    }
}

/// Token usage and estimated cost of one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub estimated_cost_usd: f64,
}

/// A successful completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    /// Name of the backend that produced the content
    pub backend: String,
    pub model: String,
    pub usage: Usage,
    pub latency: Duration,
    /// Attempts that failed before this one succeeded
    pub failed_attempts: Vec<AttemptFailure>,
}

impl Completion {
    /// Whether the answer came from a backend further down the chain
    pub fn fell_back(&self) -> bool {
        !self.failed_attempts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one backend as reported by `health_report`
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealth {
    pub backend: String,
    pub model: String,
    pub state: HealthState,
    pub circuit: CircuitState,
    pub total_requests: u64,
    pub total_failures: u64,
    pub consecutive_failures: u32,
    pub timeouts: u64,
    pub stuck_outputs: u64,
    pub invalid_outputs: u64,
    /// Exponential moving average over successful calls
    pub avg_latency_ms: f64,
    pub last_success: Option<Timestamp>,
    pub last_failure: Option<Timestamp>,
}

/// Accumulated usage of one backend
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendUsage {
    pub backend: String,
    pub model: String,
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost_usd: f64,
}

/// Failure rate above which a backend without a current failure streak is degraded
const DEGRADED_FAILURE_RATE: f64 = 0.2;

#[derive(Debug)]
struct BackendState {
    breaker: CircuitBreaker,
    total_requests: u64,
    total_failures: u64,
    consecutive_failures: u32,
    timeouts: u64,
    stuck_outputs: u64,
    invalid_outputs: u64,
    avg_latency_ms: f64,
    last_success: Option<Timestamp>,
    last_failure: Option<Timestamp>,
    usage: BackendUsage,
}

impl BackendState {
    fn new(settings: &OrchestratorSettings, descriptor: &BackendDescriptor) -> Self {
        Self {
            breaker: CircuitBreaker::new(settings.failure_threshold, settings.cool_off),
            total_requests: 0,
            total_failures: 0,
            consecutive_failures: 0,
            timeouts: 0,
            stuck_outputs: 0,
            invalid_outputs: 0,
            avg_latency_ms: 0.0,
            last_success: None,
            last_failure: None,
            usage: BackendUsage {
                backend: descriptor.name.clone(),
                model: descriptor.backend.model().to_string(),
                ..BackendUsage::default()
            },
        }
    }

    fn record_success(&mut self, latency: Duration, now: Timestamp) {
        self.total_requests += 1;
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.breaker.record_success();

        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = if self.avg_latency_ms == 0.0 {
            latency_ms
        } else {
            self.avg_latency_ms * 0.9 + latency_ms * 0.1
        };
    }

    fn record_failure(&mut self, error: &OrchestratorError, now: Timestamp) {
        self.total_requests += 1;
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        self.breaker.record_failure(now);

        match error {
            OrchestratorError::Timeout { .. } => self.timeouts += 1,
            OrchestratorError::StuckOutput { .. } => self.stuck_outputs += 1,
            OrchestratorError::InvalidOutput { .. } => self.invalid_outputs += 1,
            _ => {}
        }
    }

    fn record_usage(&mut self, response: &BackendResponse, cost: f64) {
        self.usage.requests += 1;
        self.usage.prompt_tokens += response.prompt_tokens as u64;
        self.usage.completion_tokens += response.completion_tokens as u64;
        self.usage.estimated_cost_usd += cost;
    }

    fn health_state(&self, now: Timestamp) -> HealthState {
        let circuit_closed = matches!(self.breaker.state(), CircuitState::Closed { .. });
        if self.consecutive_failures > 0 || !circuit_closed || self.breaker.is_open_at(now) {
            return HealthState::Unhealthy;
        }

        if self.total_requests > 0
            && self.total_failures as f64 / self.total_requests as f64 > DEGRADED_FAILURE_RATE
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

/// Validator applied to every otherwise usable output
pub type OutputValidator<'a> = &'a (dyn Fn(&str) -> Result<(), String> + Send + Sync);

/// Routes completion requests across LLM backends
///
/// Each complexity tier has an ordered list of backends, followed by the
/// global fallback chain. A call walks that chain until one backend produces
/// usable output, skipping backends whose circuit is open.
pub struct ModelOrchestrator {
    backends: HashMap<String, BackendDescriptor>,
    /// Registration order, used for reports
    order: Vec<String>,
    tiers: RwLock<HashMap<Complexity, Vec<String>>>,
    fallback: Vec<String>,
    settings: OrchestratorSettings,
    state: Mutex<HashMap<String, BackendState>>,
    telemetry: Option<Arc<PipelineTelemetry>>,
}

impl ModelOrchestrator {
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self {
            backends: HashMap::new(),
            order: Vec::new(),
            tiers: RwLock::new(HashMap::new()),
            fallback: Vec::new(),
            settings,
            state: Mutex::new(HashMap::new()),
            telemetry: None,
        }
    }

    pub fn with_backend(mut self, descriptor: BackendDescriptor) -> Self {
        let name = descriptor.name.clone();
        self.state.get_mut().unwrap().insert(
            name.clone(),
            BackendState::new(&self.settings, &descriptor),
        );
        if !self.order.contains(&name) {
            self.order.push(name.clone());
        }
        self.backends.insert(name, descriptor);
        self
    }

    pub fn with_tier(self, complexity: Complexity, backends: Vec<String>) -> Self {
        self.set_tier(complexity, backends);
        self
    }

    pub fn with_fallback(mut self, backends: Vec<String>) -> Self {
        self.fallback = backends;
        self
    }

    pub fn with_monitoring(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Replace the backend preference list of a tier at runtime
    pub fn set_tier(&self, complexity: Complexity, backends: Vec<String>) {
        info!("Setting {} tier to {:?}", complexity, backends);
        self.tiers.write().unwrap().insert(complexity, backends);
    }

    /// Tier list followed by the fallback chain, without duplicates
    pub fn chain_for(&self, complexity: Complexity) -> Vec<String> {
        let tiers = self.tiers.read().unwrap();
        let mut chain: Vec<String> = Vec::new();
        for name in tiers
            .get(&complexity)
            .into_iter()
            .flatten()
            .chain(self.fallback.iter())
        {
            if !chain.contains(name) {
                chain.push(name.clone());
            }
        }
        chain
    }

    /// Complete a free-form task on the given tier
    ///
    /// # Arguments
    /// * `task` - Task description, used as the system prompt
    /// * `prompt` - Material to work on
    /// * `complexity` - Routing tier
    ///
    /// # Errors
    /// `AllBackendsExhausted` when every backend in the chain failed, or
    /// `NoBackendsAvailable` when the chain is empty
    pub async fn complete(
        &self,
        task: &str,
        prompt: &str,
        complexity: Complexity,
    ) -> Result<Completion, OrchestratorError> {
        let request = CompletionRequest::new(task, prompt)
            .with_max_tokens(self.settings.max_tokens)
            .with_temperature(self.settings.temperature);
        self.complete_validated(&request, complexity, &|_| Ok(()))
            .await
    }

    /// Complete a request, rejecting outputs that fail `validator`
    ///
    /// A rejected output counts as a failure of that backend and the chain
    /// moves on.
    pub async fn complete_validated(
        &self,
        request: &CompletionRequest,
        complexity: Complexity,
        validator: OutputValidator<'_>,
    ) -> Result<Completion, OrchestratorError> {
        let chain = self.chain_for(complexity);
        if chain.is_empty() {
            error!("No LLM backends configured for the {} tier", complexity);
            return Err(OrchestratorError::NoBackendsAvailable(complexity));
        }

        let mut attempts: Vec<AttemptFailure> = Vec::new();
        let mut position = 0;

        loop {
            let name = &chain[position];
            let failure = match self.attempt(name, request, validator).await {
                Some(Ok(mut completion)) => {
                    if !attempts.is_empty() {
                        info!(
                            "Backend '{}' answered after {} failed attempt(s)",
                            name,
                            attempts.len()
                        );
                        if let Some(telemetry) = &self.telemetry {
                            telemetry.record_fallback();
                        }
                    }
                    completion.failed_attempts = attempts;
                    return Ok(completion);
                }
                Some(Err(error)) => {
                    warn!("{}", error);
                    attempts.push(AttemptFailure {
                        backend: name.clone(),
                        error,
                    });
                    attempts.last().map(|attempt| &attempt.error)
                }
                None => None,
            };

            match stuck::next_step(failure, position, chain.len()) {
                NextStep::TryNext(next) => position = next,
                NextStep::Exhausted => {
                    error!(
                        "All LLM backends exhausted for the {} tier ({} failed attempt(s))",
                        complexity,
                        attempts.len()
                    );
                    return Err(OrchestratorError::AllBackendsExhausted { attempts });
                }
            }
        }
    }

    /// One attempt against one backend; `None` when the backend was skipped
    async fn attempt(
        &self,
        name: &str,
        request: &CompletionRequest,
        validator: OutputValidator<'_>,
    ) -> Option<Result<Completion, OrchestratorError>> {
        let Some(descriptor) = self.backends.get(name) else {
            warn!("Skipping unknown backend '{}'", name);
            return None;
        };

        {
            let mut state = self.state.lock().unwrap();
            let backend_state = state.get_mut(name)?;
            match backend_state.breaker.admit(Utc::now()) {
                Admission::Rejected => {
                    debug!("Skipping backend '{}': circuit open", name);
                    return None;
                }
                Admission::Trial => info!("Backend '{}' half-open, sending trial request", name),
                Admission::Closed => {}
            }
        }

        debug!("Sending request to backend '{}'", name);
        let started = Instant::now();
        let outcome =
            tokio::time::timeout(self.settings.request_timeout, descriptor.backend.complete(request))
                .await;
        let latency = started.elapsed();

        let mut response_usage = None;
        let result = match outcome {
            Err(_) => Err(OrchestratorError::Timeout {
                backend: name.to_string(),
                timeout: self.settings.request_timeout,
            }),
            Ok(Err(error)) => Err(self.provider_error(name, error)),
            Ok(Ok(response)) => {
                let cost = descriptor.cost_of(&response);
                response_usage = Some((response.clone(), cost));
                self.check_output(name, request, response, validator)
                    .map(|response| Completion {
                        usage: Usage {
                            prompt_tokens: response.prompt_tokens,
                            completion_tokens: response.completion_tokens,
                            estimated_cost_usd: cost,
                        },
                        content: response.content,
                        backend: name.to_string(),
                        model: response.model,
                        latency,
                        failed_attempts: Vec::new(),
                    })
            }
        };

        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        if let Some(backend_state) = state.get_mut(name) {
            if let Some((response, cost)) = &response_usage {
                backend_state.record_usage(response, *cost);
            }
            match &result {
                Ok(_) => backend_state.record_success(latency, now),
                Err(error) => backend_state.record_failure(error, now),
            }
        }

        Some(result)
    }

    fn provider_error(&self, name: &str, error: BackendError) -> OrchestratorError {
        if !error.is_transient() {
            warn!("Backend '{}' returned a non-transient error", name);
        }
        OrchestratorError::ProviderError {
            backend: name.to_string(),
            error,
        }
    }

    fn check_output(
        &self,
        name: &str,
        request: &CompletionRequest,
        response: BackendResponse,
        validator: OutputValidator<'_>,
    ) -> Result<BackendResponse, OrchestratorError> {
        if let Some(reason) = stuck::detect(&response, request.is_structured(), &self.settings.stuck)
        {
            return Err(OrchestratorError::StuckOutput {
                backend: name.to_string(),
                reason,
            });
        }

        validator(&response.content).map_err(|message| OrchestratorError::InvalidOutput {
            backend: name.to_string(),
            message,
        })?;

        Ok(response)
    }

    /// Health of every registered backend, in registration order
    pub fn health_report(&self) -> Vec<BackendHealth> {
        let now = Utc::now();
        let state = self.state.lock().unwrap();
        self.order
            .iter()
            .filter_map(|name| {
                let s = state.get(name)?;
                Some(BackendHealth {
                    backend: name.clone(),
                    model: s.usage.model.clone(),
                    state: s.health_state(now),
                    circuit: s.breaker.state(),
                    total_requests: s.total_requests,
                    total_failures: s.total_failures,
                    consecutive_failures: s.consecutive_failures,
                    timeouts: s.timeouts,
                    stuck_outputs: s.stuck_outputs,
                    invalid_outputs: s.invalid_outputs,
                    avg_latency_ms: s.avg_latency_ms,
                    last_success: s.last_success,
                    last_failure: s.last_failure,
                })
            })
            .collect()
    }

    /// Accumulated token usage and cost per backend
    pub fn usage_report(&self) -> Vec<BackendUsage> {
        let state = self.state.lock().unwrap();
        self.order
            .iter()
            .filter_map(|name| state.get(name).map(|s| s.usage.clone()))
            .collect()
    }

    /// Force a backend's circuit closed; returns `false` for unknown backends
    pub fn reset_circuit(&self, name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.get_mut(name) {
            Some(backend_state) => {
                backend_state.breaker.reset();
                backend_state.consecutive_failures = 0;
                info!("Circuit breaker reset for backend '{}'", name);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::backends::{FinishReason, MockBackend};
    use crate::llm::stuck::StuckReason;

    const GOOD: &str = r#"{"category":"connectivity","confidence":0.9,"root_cause":"db","impact":"web"}"#;

    fn orchestrator(backends: Vec<(&str, MockBackend)>, settings: OrchestratorSettings) -> ModelOrchestrator {
        let names: Vec<String> = backends.iter().map(|(n, _)| n.to_string()).collect();
        let mut orchestrator = ModelOrchestrator::new(settings);
        for (name, backend) in backends {
            orchestrator = orchestrator.with_backend(BackendDescriptor::new(name, Arc::new(backend)));
        }
        orchestrator.with_tier(Complexity::Standard, names)
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_falls_back_to_next_backend() {
        let slow = MockBackend::success(GOOD).with_delay(Duration::from_secs(60));
        let fast = MockBackend::success(GOOD);
        let orchestrator = orchestrator(
            vec![("a", slow.clone()), ("b", fast.clone())],
            OrchestratorSettings::default(),
        );

        let completion = orchestrator
            .complete("diagnose", "connection refused", Complexity::Standard)
            .await
            .unwrap();

        assert_eq!(completion.backend, "b");
        assert!(completion.fell_back());
        assert!(matches!(
            completion.failed_attempts[0].error,
            OrchestratorError::Timeout { .. }
        ));
        assert_eq!(fast.call_count(), 1);

        let health = orchestrator.health_report();
        assert_eq!(health[0].backend, "a");
        assert_eq!(health[0].state, HealthState::Unhealthy);
        assert_eq!(health[0].timeouts, 1);
        assert_eq!(health[1].state, HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_all_backends_exhausted_lists_attempts() {
        let orchestrator = orchestrator(
            vec![("a", MockBackend::error("down")), ("b", MockBackend::timeout())],
            OrchestratorSettings::default(),
        );

        let err = orchestrator
            .complete("t", "p", Complexity::Standard)
            .await
            .unwrap_err();

        match err {
            OrchestratorError::AllBackendsExhausted { attempts } => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].backend, "a");
                assert_eq!(
                    attempts[1].error,
                    OrchestratorError::ProviderError {
                        backend: "b".to_string(),
                        error: BackendError::Timeout
                    }
                );
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_chain() {
        let orchestrator = ModelOrchestrator::new(OrchestratorSettings::default());
        let err = orchestrator
            .complete("t", "p", Complexity::Deep)
            .await
            .unwrap_err();
        assert_eq!(err, OrchestratorError::NoBackendsAvailable(Complexity::Deep));
    }

    #[tokio::test]
    async fn test_stuck_output_falls_back() {
        let looping = MockBackend::success(&"still thinking about it\n".repeat(10));
        let orchestrator = orchestrator(
            vec![("a", looping), ("b", MockBackend::success(GOOD))],
            OrchestratorSettings::default(),
        );

        let completion = orchestrator
            .complete("t", "p", Complexity::Standard)
            .await
            .unwrap();
        assert_eq!(completion.backend, "b");
        assert!(matches!(
            completion.failed_attempts[0].error,
            OrchestratorError::StuckOutput {
                reason: StuckReason::RepeatedLines { .. },
                ..
            }
        ));
        assert_eq!(orchestrator.health_report()[0].stuck_outputs, 1);
    }

    #[tokio::test]
    async fn test_truncated_structured_output_is_stuck() {
        let mut truncated = BackendResponse::estimated("m", "p", r#"{"category":"connectivity","root_cause":"the"#);
        truncated.finish_reason = FinishReason::Length;
        let orchestrator = orchestrator(
            vec![
                ("a", MockBackend::with_response(Ok(truncated))),
                ("b", MockBackend::success(GOOD)),
            ],
            OrchestratorSettings::default(),
        );

        let request = CompletionRequest::new("t", "p").with_schema("{}");
        let completion = orchestrator
            .complete_validated(&request, Complexity::Standard, &|_| Ok(()))
            .await
            .unwrap();
        assert_eq!(completion.backend, "b");
    }

    #[tokio::test]
    async fn test_validator_rejection_moves_on() {
        let orchestrator = orchestrator(
            vec![
                ("a", MockBackend::success("this is not json at all, sorry")),
                ("b", MockBackend::success(GOOD)),
            ],
            OrchestratorSettings::default(),
        );

        let validator = |content: &str| {
            serde_json::from_str::<serde_json::Value>(content)
                .map(|_| ())
                .map_err(|e| e.to_string())
        };
        let request = CompletionRequest::new("t", "p");
        let completion = orchestrator
            .complete_validated(&request, Complexity::Standard, &validator)
            .await
            .unwrap();

        assert_eq!(completion.backend, "b");
        assert!(matches!(
            completion.failed_attempts[0].error,
            OrchestratorError::InvalidOutput { .. }
        ));
    }

    #[tokio::test]
    async fn test_circuit_opens_and_skips_backend() {
        let failing = MockBackend::error("down");
        let healthy = MockBackend::success(GOOD);
        let settings = OrchestratorSettings {
            failure_threshold: 2,
            ..OrchestratorSettings::default()
        };
        let orchestrator = orchestrator(
            vec![("a", failing.clone()), ("b", healthy.clone())],
            settings,
        );

        for _ in 0..3 {
            orchestrator
                .complete("t", "p", Complexity::Standard)
                .await
                .unwrap();
        }

        // Third call skipped "a" entirely
        assert_eq!(failing.call_count(), 2);
        assert_eq!(healthy.call_count(), 3);
        assert!(matches!(
            orchestrator.health_report()[0].circuit,
            CircuitState::Open { .. }
        ));

        assert!(orchestrator.reset_circuit("a"));
        assert!(!orchestrator.reset_circuit("missing"));
        orchestrator
            .complete("t", "p", Complexity::Standard)
            .await
            .unwrap();
        assert_eq!(failing.call_count(), 3);
    }

    #[tokio::test]
    async fn test_chain_deduplicates_fallback() {
        let orchestrator = ModelOrchestrator::new(OrchestratorSettings::default())
            .with_tier(Complexity::Triage, vec!["local".to_string(), "cloud".to_string()])
            .with_fallback(vec!["cloud".to_string(), "backup".to_string()]);

        assert_eq!(
            orchestrator.chain_for(Complexity::Triage),
            vec!["local", "cloud", "backup"]
        );
        assert_eq!(orchestrator.chain_for(Complexity::Deep), vec!["cloud", "backup"]);

        orchestrator.set_tier(Complexity::Deep, vec!["backup".to_string()]);
        assert_eq!(orchestrator.chain_for(Complexity::Deep), vec!["backup", "cloud"]);
    }

    #[tokio::test]
    async fn test_usage_and_cost_tracking() {
        let response = BackendResponse {
            content: GOOD.to_string(),
            model: "m".to_string(),
            prompt_tokens: 1000,
            completion_tokens: 500,
            finish_reason: FinishReason::Stop,
        };
        let orchestrator = ModelOrchestrator::new(OrchestratorSettings::default())
            .with_backend(
                BackendDescriptor::new("paid", Arc::new(MockBackend::with_response(Ok(response))))
                    .with_pricing(0.01, 0.03),
            )
            .with_tier(Complexity::Standard, vec!["paid".to_string()]);

        let completion = orchestrator
            .complete("t", "p", Complexity::Standard)
            .await
            .unwrap();
        assert!((completion.usage.estimated_cost_usd - 0.025).abs() < 1e-9);

        orchestrator
            .complete("t", "p", Complexity::Standard)
            .await
            .unwrap();
        let usage = &orchestrator.usage_report()[0];
        assert_eq!(usage.requests, 2);
        assert_eq!(usage.prompt_tokens, 2000);
        assert!((usage.estimated_cost_usd - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fallback_recorded_in_telemetry() {
        let telemetry = Arc::new(PipelineTelemetry::new());
        let orchestrator = orchestrator(
            vec![("a", MockBackend::error("down")), ("b", MockBackend::success(GOOD))],
            OrchestratorSettings::default(),
        )
        .with_monitoring(Arc::clone(&telemetry));

        orchestrator
            .complete("t", "p", Complexity::Standard)
            .await
            .unwrap();
        assert_eq!(telemetry.collect_metrics().model_fallbacks, 1);
    }
}

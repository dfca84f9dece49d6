use crate::alerts::{Alert, AlertId};
use crate::analysis::heuristics::{self, Category, HeuristicMatch};
use crate::analysis::prompt::{self, DIAGNOSIS_SCHEMA, DIAGNOSIS_TASK};
use crate::events::Timestamp;
use crate::llm::{CompletionRequest, Complexity, ModelOrchestrator, Usage};
use crate::monitoring::{AnalysisTimer, PipelineTelemetry};
use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Where a diagnosis came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiagnosisSource {
    Model {
        backend: String,
        model: String,
        usage: Usage,
        /// The primary backend of the tier did not produce this answer
        fell_back: bool,
    },
    Heuristic {
        /// Keyword rule that matched
        rule: String,
        /// Why no model answer was used
        reason: String,
    },
}

/// Structured diagnosis of an alert
///
/// Immutable once recorded; re-analysis appends a new one to the alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub id: Uuid,
    pub alert_id: AlertId,
    pub category: Category,
    /// Confidence in the category, 0.0 to 1.0
    pub confidence: f64,
    pub root_cause: String,
    pub impact: String,
    /// Routing tier the analysis was requested on
    pub complexity: Complexity,
    pub source: DiagnosisSource,
    pub created_at: Timestamp,
}

impl Diagnosis {
    pub fn is_heuristic(&self) -> bool {
        matches!(self.source, DiagnosisSource::Heuristic { .. })
    }
}

/// Expected JSON shape of a model diagnosis; every field is required
#[derive(Debug, Deserialize)]
struct ModelDiagnosis {
    category: String,
    confidence: f64,
    root_cause: String,
    impact: String,
}

/// Diagnosis fields parsed out of a model response
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDiagnosis {
    pub category: Category,
    pub confidence: f64,
    pub root_cause: String,
    pub impact: String,
}

/// Extract JSON content from a model response
///
/// Models often wrap JSON in markdown code blocks or add explanatory text
/// around it.
pub fn extract_json(response_text: &str) -> &str {
    let text = response_text.trim();

    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return text[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let json_start = start + 3;
        if let Some(end) = text[json_start..].find("```") {
            let candidate = text[json_start..json_start + end].trim();
            if candidate.starts_with('{') && candidate.ends_with('}') {
                return candidate;
            }
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

/// Strictly parse a model diagnosis
///
/// # Errors
/// Returns a description of the problem when the JSON is malformed, a field
/// is missing, the category is unknown, the confidence is outside
/// 0..=1, or a text field is blank.
pub fn parse_diagnosis(response_text: &str) -> Result<ParsedDiagnosis, String> {
    let json = extract_json(response_text);
    let raw: ModelDiagnosis =
        serde_json::from_str(json).map_err(|e| format!("invalid diagnosis JSON: {}", e))?;

    let category: Category = raw.category.parse()?;
    if !(0.0..=1.0).contains(&raw.confidence) {
        return Err(format!("confidence {} is outside 0..=1", raw.confidence));
    }
    if raw.root_cause.trim().is_empty() {
        return Err("root_cause is empty".to_string());
    }
    if raw.impact.trim().is_empty() {
        return Err("impact is empty".to_string());
    }

    Ok(ParsedDiagnosis {
        category,
        confidence: raw.confidence,
        root_cause: raw.root_cause.trim().to_string(),
        impact: raw.impact.trim().to_string(),
    })
}

/// Turns alerts into diagnoses
///
/// Classifies locally first to pick a tier, then asks the orchestrator for a
/// structured diagnosis. Any orchestrator failure or unparseable answer falls
/// back to the heuristic diagnosis, so `analyze` always produces a result.
pub struct ErrorAnalyzer {
    orchestrator: Arc<ModelOrchestrator>,
    telemetry: Option<Arc<PipelineTelemetry>>,
}

impl ErrorAnalyzer {
    pub fn new(orchestrator: Arc<ModelOrchestrator>) -> Self {
        Self {
            orchestrator,
            telemetry: None,
        }
    }

    pub fn with_monitoring(mut self, telemetry: Arc<PipelineTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Diagnose an alert
    ///
    /// # Arguments
    /// * `alert` - The alert to diagnose
    /// * `context` - Additional log lines observed around the error
    pub async fn analyze(&self, alert: &Alert, context: &[String]) -> Diagnosis {
        let heuristic = heuristics::classify(&alert.title, &alert.context);
        let complexity = heuristics::select_complexity(alert.priority, &heuristic);
        info!(
            "Analyzing alert {} on '{}' (heuristic: {} {:.2}, tier: {})",
            alert.id, alert.service, heuristic.category, heuristic.confidence, complexity
        );

        let timer = self
            .telemetry
            .as_ref()
            .map(|t| AnalysisTimer::start(Arc::clone(t)));

        let diagnosis = self.model_diagnosis(alert, context, &heuristic, complexity).await;

        if let Some(timer) = timer {
            timer.finish();
        }

        match diagnosis {
            Ok(diagnosis) => {
                info!(
                    "Alert {} diagnosed as {} ({:.2})",
                    alert.id, diagnosis.category, diagnosis.confidence
                );
                diagnosis
            }
            Err(reason) => {
                warn!(
                    "Falling back to heuristic diagnosis for alert {}: {}",
                    alert.id, reason
                );
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_heuristic_diagnosis();
                }
                heuristics::heuristic_diagnosis_from(alert, &heuristic, &reason)
            }
        }
    }

    async fn model_diagnosis(
        &self,
        alert: &Alert,
        context: &[String],
        heuristic: &HeuristicMatch,
        complexity: Complexity,
    ) -> Result<Diagnosis, String> {
        let settings = self.orchestrator.settings();
        let request = CompletionRequest::new(DIAGNOSIS_TASK, prompt::build_prompt(alert, context, heuristic))
            .with_schema(DIAGNOSIS_SCHEMA)
            .with_max_tokens(settings.max_tokens)
            .with_temperature(settings.temperature);
        debug!("Diagnosis prompt for alert {}:\n{}", alert.id, request.prompt);

        // Parse failures are validator rejections, so the next backend gets a turn
        let validator = |content: &str| parse_diagnosis(content).map(|_| ());
        let completion = self
            .orchestrator
            .complete_validated(&request, complexity, &validator)
            .await
            .map_err(|e| e.to_string())?;

        let parsed = parse_diagnosis(&completion.content)?;
        Ok(Diagnosis {
            id: Uuid::new_v4(),
            alert_id: alert.id,
            category: parsed.category,
            confidence: parsed.confidence,
            root_cause: parsed.root_cause,
            impact: parsed.impact,
            complexity,
            source: DiagnosisSource::Model {
                fell_back: completion.fell_back(),
                backend: completion.backend,
                model: completion.model,
                usage: completion.usage,
            },
            created_at: Utc::now(),
        })
    }
}

use crate::alerts::Alert;
use crate::analysis::heuristics::HeuristicMatch;
use std::fmt::Write;

/// Context lines included in a prompt
const MAX_CONTEXT_LINES: usize = 30;
/// Longest single context line included in a prompt
const MAX_LINE_CHARS: usize = 300;

pub const DIAGNOSIS_TASK: &str = "You are an experienced site reliability engineer diagnosing \
a production error. Classify the error, explain the most likely root cause and describe the \
impact on the service and its users. Be concise and specific.";

pub const DIAGNOSIS_SCHEMA: &str = r#"{
  "category": "connectivity|resource_exhaustion|crash|dependency|configuration|security|data_corruption|performance|application|unknown",
  "confidence": 0.0-1.0,
  "root_cause": "<one or two sentences>",
  "impact": "<affected scope>"
}"#;

/// Format an alert and its context into a diagnosis prompt
///
/// Includes the alert metadata, the heuristic pre-classification as a hint,
/// and the most recent context lines (trimmed to keep prompts bounded).
pub fn build_prompt(alert: &Alert, context: &[String], hint: &HeuristicMatch) -> String {
    let mut prompt = String::new();

    // Writing to a String cannot fail
    let _ = writeln!(prompt, "Service: {}", alert.service);
    let _ = writeln!(
        prompt,
        "Priority: {} (severity {})",
        alert.priority, alert.severity
    );
    let _ = writeln!(prompt, "Error class: {}", alert.error_class);
    let _ = writeln!(
        prompt,
        "Occurrences: {} between {} and {}",
        alert.occurrence_count,
        alert.first_seen.to_rfc3339(),
        alert.last_seen.to_rfc3339()
    );
    let _ = writeln!(prompt, "Error: {}", alert.title);

    if let Some(term) = &hint.matched {
        let _ = writeln!(
            prompt,
            "Keyword pre-classification: {} (matched '{}'); override it if the evidence disagrees.",
            hint.category, term
        );
    }

    let lines: Vec<&String> = alert.context.iter().chain(context.iter()).collect();
    if !lines.is_empty() {
        prompt.push_str("\nRecent log context:\n");
        let skip = lines.len().saturating_sub(MAX_CONTEXT_LINES);
        for line in lines.into_iter().skip(skip) {
            let truncated: String = line.chars().take(MAX_LINE_CHARS).collect();
            let _ = writeln!(prompt, "  {}", truncated);
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertManager;
    use crate::analysis::heuristics::classify;
    use crate::events::{Observation, Severity};

    fn alert_with_context(context: Vec<String>) -> Alert {
        let manager = AlertManager::default();
        let observation = Observation::new("web-1", "dial tcp: connection refused")
            .with_severity(Severity::Error)
            .with_context(context);
        let handle = manager.submit(&observation).unwrap();
        manager.get(handle.id).unwrap()
    }

    #[test]
    fn test_prompt_includes_alert_metadata() {
        let alert = alert_with_context(vec!["GET /health 200".to_string()]);
        let hint = classify(&alert.title, &alert.context);
        let prompt = build_prompt(&alert, &[], &hint);

        assert!(prompt.contains("Service: web-1"));
        assert!(prompt.contains("Priority: P2"));
        assert!(prompt.contains("Error: dial tcp: connection refused"));
        assert!(prompt.contains("connectivity"));
        assert!(prompt.contains("GET /health 200"));
    }

    #[test]
    fn test_prompt_keeps_most_recent_context() {
        let context: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
        let alert = alert_with_context(context);
        let hint = classify(&alert.title, &[]);
        let prompt = build_prompt(&alert, &["extra line".to_string()], &hint);

        assert!(prompt.contains("extra line"));
        assert!(prompt.contains("line 49"));
        assert!(!prompt.contains("line 20\n"));
        let context_lines = prompt.lines().filter(|l| l.starts_with("  ")).count();
        assert_eq!(context_lines, MAX_CONTEXT_LINES);
    }
}

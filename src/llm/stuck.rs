//! Stuck-output detection and the fallback decision function
//!
//! Both are pure so they can be exercised without any backend.

use crate::error::OrchestratorError;
use crate::llm::backends::{BackendResponse, FinishReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Thresholds for deciding that a model produced degenerate output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StuckPolicy {
    /// Shorter trimmed output counts as empty
    pub min_chars: usize,
    /// Completion-token budget; reaching it without finishing is stuck
    pub max_output_tokens: u32,
    /// Structured output must end with one of these
    pub terminal_markers: Vec<String>,
    /// Identical non-blank lines allowed before it is a loop
    pub max_repeated_lines: usize,
    /// Word count from which the vocabulary ratio is checked
    pub min_words_for_ratio: usize,
    pub min_unique_word_ratio: f64,
    /// Phrases that signal a refusal or apology loop (case-insensitive)
    pub degenerate_phrases: Vec<String>,
    /// A degenerate phrase may appear this many times
    pub max_phrase_repeats: usize,
}

impl Default for StuckPolicy {
    fn default() -> Self {
        Self {
            min_chars: 20,
            max_output_tokens: 4096,
            terminal_markers: vec!["}".to_string()],
            max_repeated_lines: 4,
            min_words_for_ratio: 50,
            min_unique_word_ratio: 0.3,
            degenerate_phrases: vec![
                "i apologize".to_string(),
                "i cannot".to_string(),
                "as an ai".to_string(),
            ],
            max_phrase_repeats: 2,
        }
    }
}

/// Why an output was judged stuck
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StuckReason {
    Empty { chars: usize },
    TokenBudgetExhausted { tokens: u32 },
    RepeatedLines { line: String, repeats: usize },
    LowVocabulary { ratio: f64 },
    DegeneratePhrase { phrase: String, count: usize },
}

impl fmt::Display for StuckReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StuckReason::Empty { chars } => write!(f, "output too short ({} chars)", chars),
            StuckReason::TokenBudgetExhausted { tokens } => {
                write!(f, "token budget exhausted after {} tokens without finishing", tokens)
            }
            StuckReason::RepeatedLines { line, repeats } => {
                write!(f, "line repeated {} times: {:?}", repeats, line)
            }
            StuckReason::LowVocabulary { ratio } => {
                write!(f, "unique word ratio {:.2} is too low", ratio)
            }
            StuckReason::DegeneratePhrase { phrase, count } => {
                write!(f, "phrase {:?} repeated {} times", phrase, count)
            }
        }
    }
}

/// Inspect a backend response for signs that the model is stuck
///
/// # Arguments
/// * `response` - The raw backend response
/// * `structured` - Whether a JSON object was requested
/// * `policy` - Detection thresholds
///
/// # Returns
/// The first reason found, or `None` for usable output
pub fn detect(
    response: &BackendResponse,
    structured: bool,
    policy: &StuckPolicy,
) -> Option<StuckReason> {
    let content = response.content.trim();
    let chars = content.chars().count();
    if chars < policy.min_chars {
        return Some(StuckReason::Empty { chars });
    }

    let budget_hit = response.finish_reason == FinishReason::Length
        || response.completion_tokens >= policy.max_output_tokens;
    if budget_hit {
        let finished = structured
            && policy
                .terminal_markers
                .iter()
                .any(|marker| content.ends_with(marker.as_str()));
        if !finished {
            return Some(StuckReason::TokenBudgetExhausted {
                tokens: response.completion_tokens,
            });
        }
    }

    repeated_line(content, policy.max_repeated_lines)
        .or_else(|| degenerate_phrase(content, policy))
        .or_else(|| low_vocabulary(content, policy))
}

fn repeated_line(content: &str, max_repeats: usize) -> Option<StuckReason> {
    if max_repeats == 0 {
        return None;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for line in content.lines().map(str::trim).filter(|l| l.len() > 1) {
        let count = counts.entry(line).or_insert(0);
        *count += 1;
        if *count > max_repeats {
            return Some(StuckReason::RepeatedLines {
                line: line.to_string(),
                repeats: *count,
            });
        }
    }
    None
}

fn degenerate_phrase(content: &str, policy: &StuckPolicy) -> Option<StuckReason> {
    let lowered = content.to_lowercase();
    policy.degenerate_phrases.iter().find_map(|phrase| {
        let count = lowered.matches(phrase.to_lowercase().as_str()).count();
        (count > policy.max_phrase_repeats).then(|| StuckReason::DegeneratePhrase {
            phrase: phrase.clone(),
            count,
        })
    })
}

fn low_vocabulary(content: &str, policy: &StuckPolicy) -> Option<StuckReason> {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.len() <= policy.min_words_for_ratio {
        return None;
    }

    let mut unique = words.clone();
    unique.sort_unstable();
    unique.dedup();
    let ratio = unique.len() as f64 / words.len() as f64;
    (ratio < policy.min_unique_word_ratio).then_some(StuckReason::LowVocabulary { ratio })
}

/// Where the fallback chain goes after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    TryNext(usize),
    Exhausted,
}

/// Decide the next chain position after the attempt at `position` failed
///
/// `failure` is `None` when the backend was skipped (open circuit or unknown
/// name). Failures of one backend (timeout, provider error, stuck or
/// unparseable output) advance the chain; a failure that no other backend
/// can fix ends it.
pub fn next_step(
    failure: Option<&OrchestratorError>,
    position: usize,
    chain_len: usize,
) -> NextStep {
    match failure {
        None
        | Some(OrchestratorError::Timeout { .. })
        | Some(OrchestratorError::StuckOutput { .. })
        | Some(OrchestratorError::InvalidOutput { .. })
        | Some(OrchestratorError::ProviderError { .. }) => {}
        Some(OrchestratorError::NoBackendsAvailable(_))
        | Some(OrchestratorError::AllBackendsExhausted { .. }) => return NextStep::Exhausted,
    }

    let next = position + 1;
    if next < chain_len {
        NextStep::TryNext(next)
    } else {
        NextStep::Exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content: &str) -> BackendResponse {
        BackendResponse::estimated("mock", "", content)
    }

    #[test]
    fn test_good_json_is_not_stuck() {
        let r = response(r#"{"category":"connectivity","confidence":0.8,"root_cause":"db down","impact":"web-1"}"#);
        assert_eq!(detect(&r, true, &StuckPolicy::default()), None);
    }

    #[test]
    fn test_short_output_is_stuck() {
        let r = response("  {}  ");
        assert_eq!(
            detect(&r, true, &StuckPolicy::default()),
            Some(StuckReason::Empty { chars: 2 })
        );
    }

    #[test]
    fn test_budget_exhausted_without_terminal_marker() {
        let mut r = response(r#"{"category":"connectivity","root_cause":"the database"#);
        r.finish_reason = FinishReason::Length;
        assert!(matches!(
            detect(&r, true, &StuckPolicy::default()),
            Some(StuckReason::TokenBudgetExhausted { .. })
        ));
    }

    #[test]
    fn test_budget_reached_with_complete_json_is_fine() {
        let mut r = response(r#"{"category":"connectivity","confidence":0.9}"#);
        r.finish_reason = FinishReason::Length;
        assert_eq!(detect(&r, true, &StuckPolicy::default()), None);
    }

    #[test]
    fn test_unstructured_output_hitting_budget_is_stuck() {
        let mut r = response("a perfectly reasonable sentence that goes on");
        r.completion_tokens = 5000;
        assert!(matches!(
            detect(&r, false, &StuckPolicy::default()),
            Some(StuckReason::TokenBudgetExhausted { tokens: 5000 })
        ));
    }

    #[test]
    fn test_repeated_lines_detected() {
        let content = "checking the database connection\n".repeat(6);
        let reason = detect(&response(&content), false, &StuckPolicy::default());
        assert!(matches!(
            reason,
            Some(StuckReason::RepeatedLines { repeats: 5, .. })
        ));
    }

    #[test]
    fn test_degenerate_phrase_detected() {
        let content = "I apologize, but I cannot. I apologize again. I apologize once more.";
        let reason = detect(&response(content), false, &StuckPolicy::default());
        assert_eq!(
            reason,
            Some(StuckReason::DegeneratePhrase {
                phrase: "i apologize".to_string(),
                count: 3
            })
        );
    }

    #[test]
    fn test_low_vocabulary_detected() {
        let content = "error retry ".repeat(40);
        let reason = detect(&response(&content), false, &StuckPolicy::default());
        assert!(matches!(reason, Some(StuckReason::LowVocabulary { .. })));
    }

    #[test]
    fn test_policy_thresholds_are_parameters() {
        let content = "same line here\n".repeat(3);
        let strict = StuckPolicy {
            max_repeated_lines: 2,
            ..StuckPolicy::default()
        };
        assert!(detect(&response(&content), false, &strict).is_some());
        assert!(detect(&response(&content), false, &StuckPolicy::default()).is_none());
    }

    #[test]
    fn test_next_step_advances_on_backend_failures() {
        let timeout = OrchestratorError::Timeout {
            backend: "fast".to_string(),
            timeout: std::time::Duration::from_secs(30),
        };
        let parse = OrchestratorError::InvalidOutput {
            backend: "fast".to_string(),
            message: "expected JSON object".to_string(),
        };
        let looping = OrchestratorError::StuckOutput {
            backend: "fast".to_string(),
            reason: StuckReason::RepeatedLines {
                line: "thinking...".to_string(),
                repeats: 9,
            },
        };

        assert_eq!(next_step(Some(&timeout), 0, 3), NextStep::TryNext(1));
        assert_eq!(next_step(Some(&parse), 1, 3), NextStep::TryNext(2));
        assert_eq!(next_step(Some(&looping), 2, 3), NextStep::Exhausted);
        assert_eq!(next_step(None, 0, 2), NextStep::TryNext(1));
        assert_eq!(next_step(None, 0, 1), NextStep::Exhausted);
    }

    #[test]
    fn test_next_step_stops_on_chain_failures() {
        let unconfigured = OrchestratorError::NoBackendsAvailable(crate::llm::Complexity::Deep);
        assert_eq!(next_step(Some(&unconfigured), 0, 3), NextStep::Exhausted);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_next_step_stays_in_chain(position: u8, len: u8) -> bool {
        let (position, len) = (position as usize, len as usize);
        match next_step(None, position, len) {
            NextStep::TryNext(next) => next == position + 1 && next < len,
            NextStep::Exhausted => position + 1 >= len,
        }
    }
}

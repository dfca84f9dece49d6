//! Local keyword classification
//!
//! Runs before any model call. It picks the routing tier and is the answer
//! of last resort when every backend fails.

use crate::alerts::{Alert, Priority};
use crate::analysis::analyzer::{Diagnosis, DiagnosisSource};
use crate::llm::Complexity;
use chrono::Utc;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use uuid::Uuid;

/// Diagnosis category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Connectivity,
    ResourceExhaustion,
    Crash,
    Dependency,
    Configuration,
    Security,
    DataCorruption,
    Performance,
    Application,
    Unknown,
}

impl Category {
    pub const ALL: [Category; 10] = [
        Category::Connectivity,
        Category::ResourceExhaustion,
        Category::Crash,
        Category::Dependency,
        Category::Configuration,
        Category::Security,
        Category::DataCorruption,
        Category::Performance,
        Category::Application,
        Category::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Connectivity => "connectivity",
            Category::ResourceExhaustion => "resource_exhaustion",
            Category::Crash => "crash",
            Category::Dependency => "dependency",
            Category::Configuration => "configuration",
            Category::Security => "security",
            Category::DataCorruption => "data_corruption",
            Category::Performance => "performance",
            Category::Application => "application",
            Category::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace([' ', '-'], "_");
        Category::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown category '{}'", s))
    }
}

/// Result of the keyword classification
#[derive(Debug, Clone, PartialEq)]
pub struct HeuristicMatch {
    pub category: Category,
    pub confidence: f64,
    /// Text fragment that triggered the rule
    pub matched: Option<String>,
    /// Whether the match came from context lines rather than the error itself
    pub from_context: bool,
}

/// Confidence when no rule matches
const UNKNOWN_CONFIDENCE: f64 = 0.2;
/// Penalty for a match found only in the context window
const CONTEXT_PENALTY: f64 = 0.1;
/// Heuristic confidence at which a P3 alert is triaged on the cheap tier
const TRIAGE_CONFIDENCE: f64 = 0.6;

/// Ordered: the first matching rule wins, so specific signals come first
const RULES: &[(Category, &str, f64)] = &[
    (
        Category::DataCorruption,
        r"corrupt|checksum mismatch|integrity (check|violation)|data loss|torn page|inconsistent state",
        0.7,
    ),
    (
        Category::Security,
        r"unauthori[sz]ed|forbidden|permission denied|access denied|authentication failed|invalid token|certificate|tls handshake",
        0.6,
    ),
    (
        Category::ResourceExhaustion,
        r"out of memory|\boom|cannot allocate|no space left|disk full|too many open files|resource exhausted|quota exceeded|memory limit",
        0.7,
    ),
    (
        Category::Crash,
        r"segfault|segmentation fault|core dumped|\bpanic|\bfatal\b|crash|sigkill|\bkilled\b|exited with code|unexpected exit",
        0.65,
    ),
    (
        Category::Connectivity,
        r"connection (refused|reset|closed|timed out)|econnrefused|econnreset|broken pipe|network (is )?unreachable|no route to host|name resolution|host not found",
        0.65,
    ),
    (
        Category::Dependency,
        r"upstream|bad gateway|\b50[23]\b|service unavailable|dependency|third[- ]party|external (api|service)",
        0.55,
    ),
    (
        Category::Configuration,
        r"config|missing (env|environment)|environment variable|invalid setting|not configured|unknown option",
        0.55,
    ),
    (
        Category::Performance,
        r"timed? ?out|timeout|\bslow\b|latency|deadline exceeded",
        0.5,
    ),
    (
        Category::Application,
        r"exception|traceback|null ?pointer|null reference|undefined|typeerror|valueerror|keyerror|assertion|stack trace",
        0.4,
    ),
];

fn rule_table() -> &'static [(Category, Regex, f64)] {
    static TABLE: OnceLock<Vec<(Category, Regex, f64)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        RULES
            .iter()
            .filter_map(|(category, pattern, confidence)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|regex| (*category, regex, *confidence))
            })
            .collect()
    })
}

fn first_match(text: &str) -> Option<(Category, String, f64)> {
    rule_table().iter().find_map(|(category, regex, confidence)| {
        regex
            .find(text)
            .map(|m| (*category, m.as_str().to_lowercase(), *confidence))
    })
}

/// Classify error text, looking at the context window only when the text
/// itself matches nothing
pub fn classify(text: &str, context: &[String]) -> HeuristicMatch {
    if let Some((category, matched, confidence)) = first_match(text) {
        return HeuristicMatch {
            category,
            confidence,
            matched: Some(matched),
            from_context: false,
        };
    }

    context
        .iter()
        .find_map(|line| first_match(line))
        .map(|(category, matched, confidence)| HeuristicMatch {
            category,
            confidence: (confidence - CONTEXT_PENALTY).max(0.0),
            matched: Some(matched),
            from_context: true,
        })
        .unwrap_or(HeuristicMatch {
            category: Category::Unknown,
            confidence: UNKNOWN_CONFIDENCE,
            matched: None,
            from_context: false,
        })
}

/// Pick the routing tier for an alert
///
/// Critical or unclassifiable alerts get the deepest models; low-priority
/// alerts the heuristic is already confident about go to triage.
pub fn select_complexity(priority: Priority, heuristic: &HeuristicMatch) -> Complexity {
    if priority == Priority::P1 || heuristic.category == Category::Unknown {
        Complexity::Deep
    } else if priority == Priority::P3 && heuristic.confidence >= TRIAGE_CONFIDENCE {
        Complexity::Triage
    } else {
        Complexity::Standard
    }
}

/// Build the fallback diagnosis for an alert
///
/// # Arguments
/// * `alert` - The alert being diagnosed
/// * `reason` - Why no model diagnosis is available
pub fn heuristic_diagnosis(alert: &Alert, reason: &str) -> Diagnosis {
    let heuristic = classify(&alert.title, &alert.context);
    heuristic_diagnosis_from(alert, &heuristic, reason)
}

pub(crate) fn heuristic_diagnosis_from(
    alert: &Alert,
    heuristic: &HeuristicMatch,
    reason: &str,
) -> Diagnosis {
    let root_cause = match &heuristic.matched {
        Some(term) if heuristic.from_context => format!(
            "Surrounding log lines mention '{}', suggesting a {} problem",
            term, heuristic.category
        ),
        Some(term) => format!(
            "Error text mentions '{}', suggesting a {} problem",
            term, heuristic.category
        ),
        None => "No known error pattern matched".to_string(),
    };

    Diagnosis {
        id: Uuid::new_v4(),
        alert_id: alert.id,
        category: heuristic.category,
        confidence: heuristic.confidence,
        root_cause,
        impact: format!(
            "Service '{}' ({} occurrence(s))",
            alert.service, alert.occurrence_count
        ),
        complexity: select_complexity(alert.priority, heuristic),
        source: DiagnosisSource::Heuristic {
            rule: heuristic.category.as_str().to_string(),
            reason: reason.to_string(),
        },
        created_at: Utc::now(),
    }
}

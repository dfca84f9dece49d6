//! Error signature normalization and fingerprinting
//!
//! Two observations share a fingerprint when they come from the same service,
//! fall into the same error class and read the same once volatile tokens
//! (timestamps, ids, addresses, numbers) are masked.

use crate::events::Severity;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::OnceLock;

/// Normalized signatures are cut to this many characters before hashing
const MAX_SIGNATURE_CHARS: usize = 200;

/// Stable deduplication key for an error signature
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a raw error line from `service`
    pub fn compute(service: &str, text: &str) -> Self {
        let class = classify(text);
        let signature = normalize(text);

        let mut hasher = Sha256::new();
        hasher.update(service.as_bytes());
        hasher.update(b":");
        hasher.update(class.name.as_bytes());
        hasher.update(b":");
        hasher.update(signature.as_bytes());
        let digest = hasher.finalize();

        Fingerprint(hex::encode(&digest[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error class assigned from the pattern table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorClass {
    pub name: &'static str,
    /// Severity used when the observation carries no hint
    pub severity: Severity,
}

const CLASS_PATTERNS: &[(&str, &str, Severity)] = &[
    (r"\bfatal\b|\bpanic(ked)?\b", "fatal", Severity::Critical),
    (
        r"out of memory|\boom(killed)?\b|cannot allocate|memoryerror",
        "memory",
        Severity::Critical,
    ),
    (r"\bsigkill\b|\bkilled\b", "killed", Severity::Critical),
    (r"segfault|segmentation fault|\bcrash", "crash", Severity::Critical),
    (
        r"connection (refused|reset)|econnrefused|econnreset|broken pipe",
        "connection",
        Severity::Error,
    ),
    (r"timed? ?out\b|timeout|deadline exceeded", "timeout", Severity::Error),
    (r"(status|http|code)\D{0,10}5\d\d\b", "http_5xx", Severity::Error),
    (r"(status|http|code)\D{0,10}4\d\d\b", "http_4xx", Severity::Warning),
    (r"database|deadlock|\bsql", "database", Severity::Error),
    (r"traceback", "traceback", Severity::Error),
    (r"exception", "exception", Severity::Error),
    (r"\bfail(ed|ure|ing)?\b", "failure", Severity::Error),
    (r"\berror\b", "error", Severity::Error),
    (r"deprecat", "deprecated", Severity::Warning),
    (r"\bretry(ing)?\b", "retry", Severity::Warning),
    (r"\bslow\b|latency", "performance", Severity::Warning),
    (r"\bwarn(ing)?\b", "warning", Severity::Warning),
];

const OTHER: ErrorClass = ErrorClass {
    name: "other",
    severity: Severity::Info,
};

fn class_table() -> &'static [(Regex, ErrorClass)] {
    static TABLE: OnceLock<Vec<(Regex, ErrorClass)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        CLASS_PATTERNS
            .iter()
            .filter_map(|(pattern, name, severity)| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .ok()
                    .map(|regex| {
                        (
                            regex,
                            ErrorClass {
                                name,
                                severity: *severity,
                            },
                        )
                    })
            })
            .collect()
    })
}

fn mask_rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        [
            (
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
                "[TIME]",
            ),
            (r"\b\d{2}:\d{2}:\d{2}(\.\d+)?\b", "[TIME]"),
            (
                r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b",
                "[UUID]",
            ),
            (r"\b0x[0-9a-fA-F]+\b", "[HEX]"),
            (r"\b[0-9a-fA-F]{16,}\b", "[HEX]"),
            (r"\b\d{1,3}(\.\d{1,3}){3}\b", "[IP]"),
            (r"\d+", "[N]"),
            (r"\s+", " "),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|r| (r, replacement)))
        .collect()
    })
}

/// Classify an error line into a coarse error class
pub fn classify(text: &str) -> ErrorClass {
    class_table()
        .iter()
        .find(|(regex, _)| regex.is_match(text))
        .map(|(_, class)| *class)
        .unwrap_or(OTHER)
}

/// Mask volatile tokens and collapse whitespace
pub fn normalize(text: &str) -> String {
    let mut signature = text.trim().to_string();
    for (regex, replacement) in mask_rules() {
        signature = regex.replace_all(&signature, *replacement).into_owned();
    }
    let truncated: String = signature.chars().take(MAX_SIGNATURE_CHARS).collect();
    truncated.trim_end().to_string()
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_numbers_do_not_change_fingerprint(a: u32, b: u32) -> bool {
        let first = Fingerprint::compute("svc", &format!("request {} failed after {} ms", a, b));
        let second = Fingerprint::compute("svc", &format!("request {} failed after {} ms", b, a));
        first == second
    }

    #[quickcheck]
    fn prop_normalized_signature_is_bounded_and_digit_free(text: String) -> bool {
        let signature = normalize(&text);
        signature.chars().count() <= MAX_SIGNATURE_CHARS
            && !signature.chars().any(|c| c.is_ascii_digit())
    }
}

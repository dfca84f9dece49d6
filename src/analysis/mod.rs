pub mod analyzer;
pub mod heuristics;
pub mod prompt;

pub use analyzer::{parse_diagnosis, Diagnosis, DiagnosisSource, ErrorAnalyzer, ParsedDiagnosis};
pub use heuristics::{heuristic_diagnosis, Category, HeuristicMatch};

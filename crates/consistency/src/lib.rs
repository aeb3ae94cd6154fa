//! Consistency Engine: scores freshly written text against what the story
//! already established.

pub mod engine;
pub mod report;

pub use engine::{AnalysisInputs, ConsistencyEngine};
pub use report::{ConsistencyIssue, ConsistencyReport, IssueType, Severity, overall_score};

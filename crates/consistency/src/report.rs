use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// The five fixed consistency categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueType {
    CharacterBehavior,
    Timeline,
    WorldRule,
    PointOfView,
    ToneDrift,
}

impl IssueType {
    pub const ALL: [IssueType; 5] = [
        Self::CharacterBehavior,
        Self::Timeline,
        Self::WorldRule,
        Self::PointOfView,
        Self::ToneDrift,
    ];

    pub fn slug(self) -> &'static str {
        match self {
            Self::CharacterBehavior => "character_behavior",
            Self::Timeline => "timeline",
            Self::WorldRule => "world_rule",
            Self::PointOfView => "point_of_view",
            Self::ToneDrift => "tone_drift",
        }
    }

    /// Lenient label parsing for model output.
    pub fn from_label(label: &str) -> Option<Self> {
        let norm = label.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "character_behavior" | "character_behaviour" | "character" | "character_inconsistency" => {
                Some(Self::CharacterBehavior)
            }
            "timeline" | "timeline_contradiction" | "continuity" => Some(Self::Timeline),
            "world_rule" | "world_rules" | "world_rule_violation" | "world" => Some(Self::WorldRule),
            "point_of_view" | "pov" | "pov_consistency" | "pov_inconsistency" => {
                Some(Self::PointOfView)
            }
            "tone_drift" | "tone" => Some(Self::ToneDrift),
            _ => None,
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Score penalty per issue.
    pub fn weight(self) -> f32 {
        match self {
            Self::Low => 0.05,
            Self::Medium => 0.10,
            Self::High => 0.20,
            Self::Critical => 0.35,
        }
    }

    /// Unrecognised labels count as medium.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "low" | "minor" => Self::Low,
            "high" | "major" => Self::High,
            "critical" | "severe" => Self::Critical,
            "medium" | "moderate" => Self::Medium,
            other => {
                debug!(severity = other, "unknown severity; treating as medium");
                Self::Medium
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyIssue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// Result of a full analysis.  Score and critical flag are derived from the
/// issues at construction and cannot be set independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyReport {
    overall_score: f32,
    summary: String,
    issues: Vec<ConsistencyIssue>,
    recommendations: Vec<String>,
    has_critical_issues: bool,
}

impl ConsistencyReport {
    /// Issues are ordered most severe first; ties keep their given order.
    pub fn new(
        summary: impl Into<String>,
        mut issues: Vec<ConsistencyIssue>,
        recommendations: Vec<String>,
    ) -> Self {
        issues.sort_by(|a, b| b.severity.cmp(&a.severity));
        Self {
            overall_score: overall_score(&issues),
            has_critical_issues: issues.iter().any(|i| i.severity == Severity::Critical),
            summary: summary.into(),
            issues,
            recommendations,
        }
    }

    pub fn overall_score(&self) -> f32 {
        self.overall_score
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }

    pub fn issues(&self) -> &[ConsistencyIssue] {
        &self.issues
    }

    pub fn recommendations(&self) -> &[String] {
        &self.recommendations
    }

    pub fn has_critical_issues(&self) -> bool {
        self.has_critical_issues
    }
}

/// `1 - Σ severity weight`, clamped to `[0, 1]`.  Adding an issue or raising
/// a severity never increases the score.
pub fn overall_score(issues: &[ConsistencyIssue]) -> f32 {
    let penalty: f32 = issues.iter().map(|i| i.severity.weight()).sum();
    (1.0 - penalty).clamp(0.0, 1.0)
}

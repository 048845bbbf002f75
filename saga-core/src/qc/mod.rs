//! Quality control.
//!
//! Evaluators score finished output along independent dimensions and return
//! a [`QcVerdict`]. A verdict passes only when its score clears the threshold
//! and it carries no blocking issue.

mod chapter;
pub mod heuristics;
mod outline;
mod repair;

pub use chapter::{ChapterEvaluator, ChapterQcInput};
pub use outline::{OutlineEvaluator, OUTLINE_WEIGHTS};
pub use repair::{RepairLoop, RepairOutcome};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How bad an issue is. Ordered from harmless to blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Minor,
    Major,
    Blocking,
}

impl Severity {
    pub const TABLE: &'static [(&'static str, Severity)] = &[
        ("info", Severity::Info),
        ("minor", Severity::Minor),
        ("low", Severity::Minor),
        ("major", Severity::Major),
        ("medium", Severity::Major),
        ("high", Severity::Major),
        ("blocking", Severity::Blocking),
        ("critical", Severity::Blocking),
    ];

    /// Points subtracted from a perfect heuristic score.
    pub fn penalty(&self) -> f64 {
        match self {
            Severity::Info => 0.0,
            Severity::Minor => 1.0,
            Severity::Major => 2.5,
            Severity::Blocking => 4.0,
        }
    }
}

/// Category of a QC issue. Repair instructions are chosen per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    // Chapters
    TitleFormat,
    TooShort,
    PrematureEnding,
    Truncated,
    Repetition,
    CharacterConsistency,
    PacingMismatch,
    GoalMissed,
    // Outlines
    MissingIndices,
    DuplicateIndices,
    OutOfRangeIndices,
    PlaceholderTitles,
    WeakGoals,
    FewMilestones,
    ArcCoherence,
    WeakHooks,
    Other,
}

impl IssueKind {
    pub const TABLE: &'static [(&'static str, IssueKind)] = &[
        ("title_format", IssueKind::TitleFormat),
        ("too_short", IssueKind::TooShort),
        ("premature_ending", IssueKind::PrematureEnding),
        ("truncated", IssueKind::Truncated),
        ("repetition", IssueKind::Repetition),
        ("character_consistency", IssueKind::CharacterConsistency),
        ("character", IssueKind::CharacterConsistency),
        ("pacing_mismatch", IssueKind::PacingMismatch),
        ("pacing", IssueKind::PacingMismatch),
        ("goal_missed", IssueKind::GoalMissed),
        ("goal", IssueKind::GoalMissed),
        ("missing_indices", IssueKind::MissingIndices),
        ("duplicate_indices", IssueKind::DuplicateIndices),
        ("out_of_range_indices", IssueKind::OutOfRangeIndices),
        ("placeholder_titles", IssueKind::PlaceholderTitles),
        ("weak_goals", IssueKind::WeakGoals),
        ("few_milestones", IssueKind::FewMilestones),
        ("arc_coherence", IssueKind::ArcCoherence),
        ("weak_hooks", IssueKind::WeakHooks),
        ("other", IssueKind::Other),
    ];
}

/// One finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub description: String,
}

impl QcIssue {
    pub fn new(kind: IssueKind, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
        }
    }
}

/// Result of one evaluation. Never mutated; re-evaluation produces a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcVerdict {
    /// 0..=10.
    pub score: f64,
    pub passed: bool,
    pub issues: Vec<QcIssue>,
    pub dimensions: BTreeMap<String, f64>,
}

impl QcVerdict {
    /// Build a verdict; `passed` requires `score >= threshold` and no blocking issue.
    pub fn new(
        score: f64,
        threshold: f64,
        issues: Vec<QcIssue>,
        dimensions: BTreeMap<String, f64>,
    ) -> Self {
        let score = if score.is_finite() { score.clamp(0.0, 10.0) } else { 0.0 };
        let passed = score >= threshold && !issues.iter().any(|i| i.severity == Severity::Blocking);
        Self {
            score,
            passed,
            issues,
            dimensions,
        }
    }

    pub fn has_blocking(&self) -> bool {
        self.issues.iter().any(|i| i.severity == Severity::Blocking)
    }

    pub fn has_issue(&self, kind: IssueKind) -> bool {
        self.issues.iter().any(|i| i.kind == kind)
    }

    pub fn dimension(&self, name: &str) -> Option<f64> {
        self.dimensions.get(name).copied()
    }

    /// Whether `self` should be preferred over `other`.
    ///
    /// Passing beats failing; otherwise fewer blocking issues, then score.
    pub fn better_than(&self, other: &QcVerdict) -> bool {
        if self.passed != other.passed {
            return self.passed;
        }
        let blocking = |v: &QcVerdict| v.issues.iter().filter(|i| i.severity == Severity::Blocking).count();
        match blocking(self).cmp(&blocking(other)) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Equal => self.score > other.score,
        }
    }

    /// One line per issue, for prompts and logs.
    pub fn render_issues(&self) -> String {
        self.issues
            .iter()
            .map(|i| format!("- [{:?}] {}", i.severity, i.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

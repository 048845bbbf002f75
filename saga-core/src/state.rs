//! Agent state for orchestrated runs.
//!
//! Every transition returns a new value; nothing here is mutated in place.

use crate::ids::ProjectId;
use crate::knowledge::KnowledgeBundle;
use crate::outline::Outline;
use crate::qc::QcVerdict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// One orchestrator iteration, as recorded in the history log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub iteration: u32,
    pub tool: String,
    pub reason: String,
    pub summary: String,
    /// The planner's proposal was replaced by the fallback decision.
    pub overridden: bool,
    pub timestamp: DateTime<Utc>,
}

/// State of one run, generic over the pipeline's progress type.
#[derive(Debug, Clone)]
pub struct AgentState<P> {
    pub goal: String,
    pub iteration: u32,
    pub done: bool,
    pub done_reason: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub progress: P,
}

impl<P: Clone> AgentState<P> {
    pub fn new(goal: impl Into<String>, progress: P) -> Self {
        Self {
            goal: goal.into(),
            iteration: 0,
            done: false,
            done_reason: None,
            history: Vec::new(),
            progress,
        }
    }

    /// Next iteration: new progress plus a history entry.
    pub fn advance(&self, progress: P, entry: HistoryEntry) -> Self {
        let mut history = self.history.clone();
        history.push(entry);
        Self {
            goal: self.goal.clone(),
            iteration: self.iteration + 1,
            done: self.done,
            done_reason: self.done_reason.clone(),
            history,
            progress,
        }
    }

    /// Terminal copy of this state.
    pub fn finished(&self, reason: impl Into<String>) -> Self {
        Self {
            done: true,
            done_reason: Some(reason.into()),
            ..self.clone()
        }
    }

    pub fn last_entry(&self) -> Option<&HistoryEntry> {
        self.history.last()
    }
}

/// What a tool hands back to the orchestrator.
#[derive(Debug, Clone)]
pub struct StatePatch<P> {
    /// Replacement progress; `None` leaves progress unchanged.
    pub progress: Option<P>,
    pub summary: String,
    /// Ends the run with this reason.
    pub finish: Option<String>,
}

impl<P> StatePatch<P> {
    pub fn progress(progress: P, summary: impl Into<String>) -> Self {
        Self {
            progress: Some(progress),
            summary: summary.into(),
            finish: None,
        }
    }

    pub fn finish(progress: Option<P>, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            progress,
            summary: reason.clone(),
            finish: Some(reason),
        }
    }
}

// ============================================================================
// Outline pipeline
// ============================================================================

/// Progress of an outline run.
#[derive(Debug, Clone, PartialEq)]
pub struct OutlineProgress {
    pub project: ProjectId,
    pub target_chapters: u32,
    pub draft: Option<Outline>,
    pub evaluation: Option<QcVerdict>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Feedback carried into the next generation attempt.
    pub revision_notes: Vec<String>,
    pub best: Option<Outline>,
    pub best_verdict: Option<QcVerdict>,
}

impl OutlineProgress {
    pub fn new(project: ProjectId, target_chapters: u32, max_attempts: u32) -> Self {
        Self {
            project,
            target_chapters,
            draft: None,
            evaluation: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            revision_notes: Vec::new(),
            best: None,
            best_verdict: None,
        }
    }

    pub fn attempts_left(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    /// Progress with a fresh draft awaiting critique.
    pub fn with_draft(&self, outline: Outline) -> Self {
        Self {
            draft: Some(outline),
            evaluation: None,
            attempts: self.attempts + 1,
            ..self.clone()
        }
    }

    /// Progress with the current draft evaluated; the best outline is kept.
    pub fn with_evaluation(&self, verdict: QcVerdict) -> Self {
        let mut next = self.clone();
        let is_best = match &self.best_verdict {
            Some(best) => verdict.better_than(best),
            None => true,
        };
        if is_best {
            next.best = self.draft.clone();
            next.best_verdict = Some(verdict.clone());
        }
        if !verdict.passed {
            next.revision_notes = verdict.issues.iter().map(|i| i.description.clone()).collect();
        }
        next.evaluation = Some(verdict);
        next
    }

    /// Progress after a failed generation attempt.
    pub fn with_failed_attempt(&self, note: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.attempts += 1;
        next.draft = None;
        next.evaluation = None;
        next.revision_notes.push(note.into());
        next
    }
}

// ============================================================================
// Chapter pipeline
// ============================================================================

/// A chapter draft waiting for QC, repair or commit.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChapterDraft {
    pub chapter: u32,
    pub text: String,
    pub repairs: u32,
    /// Premature-ending self-corrections during generation.
    pub rewrites: u32,
    pub title: String,
    pub goal: String,
    /// Persisted next index observed when generation started.
    pub expected_next_index: u32,
    pub context_from_cache: bool,
}

/// A chapter committed during this run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedChapter {
    pub index: u32,
    pub title: String,
    pub score: f64,
    pub passed: bool,
    pub repairs: u32,
    pub rewrites: u32,
    pub chars: usize,
}

/// Progress of a chapter-batch run.
#[derive(Debug, Clone)]
pub struct ChapterProgress {
    pub project: ProjectId,
    /// Chapter being worked on.
    pub current: u32,
    /// Last chapter of this run.
    pub last: u32,
    pub total_chapters: u32,
    pub draft: Option<PendingChapterDraft>,
    pub verdict: Option<QcVerdict>,
    pub generated: Vec<GeneratedChapter>,
    pub failed: BTreeSet<u32>,
    pub knowledge: Arc<KnowledgeBundle>,
    pub max_repairs: u32,
    pub best_effort_commit: bool,
}

impl ChapterProgress {
    pub fn new(
        project: ProjectId,
        first: u32,
        last: u32,
        total_chapters: u32,
        knowledge: Arc<KnowledgeBundle>,
    ) -> Self {
        Self {
            project,
            current: first,
            last,
            total_chapters,
            draft: None,
            verdict: None,
            generated: Vec::new(),
            failed: BTreeSet::new(),
            knowledge,
            max_repairs: 2,
            best_effort_commit: true,
        }
    }

    pub fn with_repair_policy(mut self, max_repairs: u32, best_effort_commit: bool) -> Self {
        self.max_repairs = max_repairs;
        self.best_effort_commit = best_effort_commit;
        self
    }

    /// Every chapter of the run is committed or recorded as failed.
    pub fn all_handled(&self) -> bool {
        self.current > self.last
    }

    pub fn repairs_left(&self) -> u32 {
        let used = self.draft.as_ref().map(|d| d.repairs).unwrap_or(0);
        self.max_repairs.saturating_sub(used)
    }

    pub fn with_draft(&self, draft: PendingChapterDraft) -> Self {
        Self {
            draft: Some(draft),
            verdict: None,
            ..self.clone()
        }
    }

    pub fn with_verdict(&self, verdict: QcVerdict) -> Self {
        Self {
            verdict: Some(verdict),
            ..self.clone()
        }
    }

    /// Draft text replaced by a repair round.
    pub fn with_repaired(&self, text: String, verdict: QcVerdict) -> Self {
        let draft = self.draft.as_ref().map(|d| PendingChapterDraft {
            text,
            repairs: d.repairs + 1,
            ..d.clone()
        });
        Self {
            draft,
            verdict: Some(verdict),
            ..self.clone()
        }
    }

    /// Draft committed; move to the next chapter.
    pub fn with_committed(&self, chapter: GeneratedChapter, knowledge: Arc<KnowledgeBundle>) -> Self {
        let mut generated = self.generated.clone();
        let current = chapter.index + 1;
        generated.push(chapter);
        Self {
            current,
            draft: None,
            verdict: None,
            generated,
            knowledge,
            ..self.clone()
        }
    }

    /// Current chapter recorded as failed and skipped.
    pub fn with_failed_current(&self) -> Self {
        let mut failed = self.failed.clone();
        failed.insert(self.current);
        Self {
            current: self.current + 1,
            draft: None,
            verdict: None,
            failed,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qc::{IssueKind, QcIssue, Severity};
    use std::collections::BTreeMap;

    fn entry(iteration: u32) -> HistoryEntry {
        HistoryEntry {
            iteration,
            tool: "generate".into(),
            reason: "no draft".into(),
            summary: "drafted".into(),
            overridden: false,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_advance_does_not_touch_original() {
        let state = AgentState::new("write", 1u32);
        let next = state.advance(2, entry(0));
        assert_eq!(state.iteration, 0);
        assert!(state.history.is_empty());
        assert_eq!(next.iteration, 1);
        assert_eq!(next.progress, 2);

        let done = next.finished("goal reached");
        assert!(done.done && !next.done);
    }

    #[test]
    fn test_outline_keeps_best_and_notes() {
        let outline = Outline {
            title: "t".into(),
            target_chapters: 1,
            chapters: vec![],
            milestones: vec![],
        };
        let progress = OutlineProgress::new(ProjectId::new(), 1, 3).with_draft(outline.clone());
        let good = QcVerdict::new(6.0, 7.5, vec![], BTreeMap::new());
        let progress = progress.with_evaluation(good.clone());
        assert_eq!(progress.best_verdict, Some(good));

        let worse = QcVerdict::new(
            2.0,
            7.5,
            vec![QcIssue::new(IssueKind::MissingIndices, Severity::Blocking, "缺第1章")],
            BTreeMap::new(),
        );
        let progress = progress.with_draft(outline).with_evaluation(worse);
        assert_eq!(progress.attempts, 2);
        assert_eq!(progress.best_verdict.as_ref().map(|v| v.score), Some(6.0));
        assert_eq!(progress.revision_notes, vec!["缺第1章".to_string()]);
    }

    #[test]
    fn test_failed_chapter_advances() {
        let progress = ChapterProgress::new(ProjectId::new(), 3, 5, 10, Arc::default());
        let next = progress.with_failed_current();
        assert_eq!(next.current, 4);
        assert!(next.failed.contains(&3));
        assert_eq!(progress.current, 3);
    }
}

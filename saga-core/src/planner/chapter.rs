use super::{PipelineState, ToolKind};
use crate::error::EngineError;
use crate::state::ChapterProgress;
use std::fmt;

/// Iterations one work unit buys under [`crate::orchestrator::hard_limit`].
const STEPS_PER_UNIT: u32 = 5;

/// Tools of the chapter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChapterTool {
    Generate,
    Qc,
    Repair,
    Commit,
    Finish,
}

impl ToolKind for ChapterTool {
    const ALL: &'static [Self] = &[
        ChapterTool::Generate,
        ChapterTool::Qc,
        ChapterTool::Repair,
        ChapterTool::Commit,
        ChapterTool::Finish,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            ChapterTool::Generate => "generate",
            ChapterTool::Qc => "qc",
            ChapterTool::Repair => "repair",
            ChapterTool::Commit => "commit",
            ChapterTool::Finish => "finish",
        }
    }
}

impl fmt::Display for ChapterTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a chapter run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChapterPhase {
    /// Every chapter of the run is committed or recorded as failed.
    Done,
    NeedsDraft { chapter: u32 },
    NeedsQc { chapter: u32 },
    /// The draft failed QC and repairs remain.
    NeedsRepair { chapter: u32 },
    /// The draft passed, or repairs are used up.
    ReadyToCommit { chapter: u32, can_polish: bool },
}

impl PipelineState for ChapterProgress {
    type Phase = ChapterPhase;
    type Tool = ChapterTool;

    fn phase(&self) -> ChapterPhase {
        if self.all_handled() {
            return ChapterPhase::Done;
        }
        let chapter = self.current;
        match (&self.draft, &self.verdict) {
            (None, _) => ChapterPhase::NeedsDraft { chapter },
            (Some(_), None) => ChapterPhase::NeedsQc { chapter },
            (Some(_), Some(v)) if !v.passed && self.repairs_left() > 0 => ChapterPhase::NeedsRepair { chapter },
            (Some(_), Some(_)) => ChapterPhase::ReadyToCommit {
                chapter,
                can_polish: self.repairs_left() > 0,
            },
        }
    }

    fn fallback(phase: ChapterPhase) -> ChapterTool {
        match phase {
            ChapterPhase::Done => ChapterTool::Finish,
            ChapterPhase::NeedsDraft { .. } => ChapterTool::Generate,
            ChapterPhase::NeedsQc { .. } => ChapterTool::Qc,
            ChapterPhase::NeedsRepair { .. } => ChapterTool::Repair,
            ChapterPhase::ReadyToCommit { .. } => ChapterTool::Commit,
        }
    }

    fn legal(phase: ChapterPhase) -> &'static [ChapterTool] {
        match phase {
            ChapterPhase::Done => &[ChapterTool::Finish],
            ChapterPhase::NeedsDraft { .. } => &[ChapterTool::Generate],
            ChapterPhase::NeedsQc { .. } => &[ChapterTool::Qc],
            ChapterPhase::NeedsRepair { .. } => &[ChapterTool::Repair],
            ChapterPhase::ReadyToCommit { can_polish: true, .. } => &[ChapterTool::Commit, ChapterTool::Repair],
            ChapterPhase::ReadyToCommit { can_polish: false, .. } => &[ChapterTool::Commit],
        }
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "Writing chapters {}..={} of {}. Current chapter: {}. Committed this run: {}. Failed: {:?}.\n",
            self.current.min(self.last),
            self.last,
            self.total_chapters,
            self.current,
            self.generated.len(),
            self.failed
        );
        match (&self.draft, &self.verdict) {
            (None, _) => out.push_str("No draft.\n"),
            (Some(d), None) => out.push_str(&format!(
                "Draft of chapter {} ({} chars, {} repairs), not yet checked.\n",
                d.chapter,
                d.text.chars().count(),
                d.repairs
            )),
            (Some(d), Some(v)) => {
                out.push_str(&format!(
                    "Draft of chapter {} checked: score {:.1}, passed {}, repairs {}/{}.\n",
                    d.chapter, v.score, v.passed, d.repairs, self.max_repairs
                ));
                if !v.issues.is_empty() {
                    out.push_str(&v.render_issues());
                    out.push('\n');
                }
            }
        }
        out
    }

    fn work_units(&self) -> u32 {
        let chapters = (self.last + 1).saturating_sub(self.current);
        // generate, qc and commit, plus every repair round the policy allows
        let steps = self.max_repairs.saturating_add(3);
        chapters.saturating_mul(steps.div_ceil(STEPS_PER_UNIT))
    }

    fn skip_failed(&self, _tool: ChapterTool, _error: &EngineError) -> Self {
        if self.all_handled() {
            return self.clone();
        }
        self.with_failed_current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProjectId;
    use crate::planner::{fallback_decision, normalize, Decision};
    use crate::qc::QcVerdict;
    use crate::state::PendingChapterDraft;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn progress() -> ChapterProgress {
        ChapterProgress::new(ProjectId::new(), 1, 2, 10, Arc::default()).with_repair_policy(1, true)
    }

    fn draft(chapter: u32) -> PendingChapterDraft {
        PendingChapterDraft {
            chapter,
            text: "第1章 开端\n正文。".into(),
            repairs: 0,
            rewrites: 0,
            title: "开端".into(),
            goal: "开场".into(),
            expected_next_index: chapter,
            context_from_cache: false,
        }
    }

    fn verdict(passed: bool) -> QcVerdict {
        QcVerdict::new(if passed { 9.0 } else { 3.0 }, 7.0, vec![], BTreeMap::new())
    }

    #[test]
    fn test_transition_table() {
        let p = progress();
        assert_eq!(fallback_decision(&p).tool, ChapterTool::Generate);

        let p = p.with_draft(draft(1));
        assert_eq!(fallback_decision(&p).tool, ChapterTool::Qc);

        let failing = p.with_verdict(verdict(false));
        assert_eq!(failing.phase(), ChapterPhase::NeedsRepair { chapter: 1 });

        let repaired = failing.with_repaired("第1章 开端\n新正文。".into(), verdict(false));
        assert_eq!(
            repaired.phase(),
            ChapterPhase::ReadyToCommit {
                chapter: 1,
                can_polish: false
            }
        );
        assert_eq!(fallback_decision(&repaired).tool, ChapterTool::Commit);

        let done = progress().with_failed_current().with_failed_current();
        assert_eq!(done.phase(), ChapterPhase::Done);
        assert_eq!(fallback_decision(&done).tool, ChapterTool::Finish);
    }

    #[test]
    fn test_normalization_guards() {
        let p = progress();
        for tool in [ChapterTool::Commit, ChapterTool::Qc, ChapterTool::Repair, ChapterTool::Finish] {
            let decision = normalize(&p, Decision::new(tool, "model says so"));
            assert!(decision.overridden);
            assert_eq!(decision.tool, ChapterTool::Generate);
        }

        let passed = p.with_draft(draft(1)).with_verdict(verdict(true));
        let polish = normalize(&passed, Decision::new(ChapterTool::Repair, "polish"));
        assert!(!polish.overridden);
        let skip = normalize(&passed, Decision::new(ChapterTool::Generate, "next"));
        assert!(skip.overridden);
        assert_eq!(skip.tool, ChapterTool::Commit);
    }

    /// Iterations of the longest legal run: every draft fails QC, every
    /// repair is spent, then the draft is committed anyway.
    fn worst_case_iterations(mut p: ChapterProgress) -> u32 {
        let mut steps = 0;
        while !p.all_handled() {
            let chapter = p.current;
            p = p.with_draft(draft(chapter)).with_verdict(verdict(false));
            steps += 2;
            while p.repairs_left() > 0 {
                p = p.with_repaired("第1章 开端\n又一稿。".into(), verdict(false));
                steps += 1;
            }
            assert_eq!(fallback_decision(&p).tool, ChapterTool::Commit);
            p = p.with_failed_current();
            steps += 1;
        }
        steps + 1
    }

    #[test]
    fn test_ceiling_covers_every_repair_budget() {
        for max_repairs in 0..=8 {
            let p = ChapterProgress::new(ProjectId::new(), 1, 10, 10, Arc::default())
                .with_repair_policy(max_repairs, true);
            let needed = worst_case_iterations(p.clone());
            let limit = crate::orchestrator::hard_limit(p.work_units());
            assert!(needed <= limit, "max_repairs {max_repairs}: {needed} steps, limit {limit}");
        }
    }

    #[test]
    fn test_default_policy_keeps_one_unit_per_chapter() {
        let p = ChapterProgress::new(ProjectId::new(), 1, 10, 10, Arc::default()).with_repair_policy(2, true);
        assert_eq!(p.work_units(), 10);
    }
}

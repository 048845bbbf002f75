use super::{PipelineState, ToolKind};
use crate::error::EngineError;
use crate::state::OutlineProgress;
use std::fmt;

/// Tools of the outline pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutlineTool {
    Generate,
    Critique,
    Finish,
}

impl ToolKind for OutlineTool {
    const ALL: &'static [Self] = &[OutlineTool::Generate, OutlineTool::Critique, OutlineTool::Finish];

    fn as_str(&self) -> &'static str {
        match self {
            OutlineTool::Generate => "generate",
            OutlineTool::Critique => "critique",
            OutlineTool::Finish => "finish",
        }
    }
}

impl fmt::Display for OutlineTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an outline run stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlinePhase {
    /// No draft yet and attempts remain.
    NeedsDraft,
    /// A draft awaits evaluation.
    NeedsCritique,
    /// The last draft failed and attempts remain.
    Revise { attempts_left: u32 },
    /// A draft passed, or attempts are used up with an evaluated draft kept.
    Complete { passed: bool },
    /// Attempts are used up and no draft was ever evaluated.
    Failed,
}

impl PipelineState for OutlineProgress {
    type Phase = OutlinePhase;
    type Tool = OutlineTool;

    fn phase(&self) -> OutlinePhase {
        match (&self.draft, &self.evaluation) {
            (Some(_), None) => OutlinePhase::NeedsCritique,
            (Some(_), Some(verdict)) if verdict.passed => OutlinePhase::Complete { passed: true },
            _ if self.attempts_left() == 0 && self.best.is_none() => OutlinePhase::Failed,
            _ if self.attempts_left() == 0 => OutlinePhase::Complete { passed: false },
            (Some(_), Some(_)) => OutlinePhase::Revise {
                attempts_left: self.attempts_left(),
            },
            (None, _) => OutlinePhase::NeedsDraft,
        }
    }

    fn fallback(phase: OutlinePhase) -> OutlineTool {
        match phase {
            OutlinePhase::NeedsDraft => OutlineTool::Generate,
            OutlinePhase::NeedsCritique => OutlineTool::Critique,
            OutlinePhase::Revise { .. } => OutlineTool::Generate,
            // Finish reports the failure and ends the run with an error.
            OutlinePhase::Complete { .. } | OutlinePhase::Failed => OutlineTool::Finish,
        }
    }

    fn legal(phase: OutlinePhase) -> &'static [OutlineTool] {
        match phase {
            OutlinePhase::NeedsDraft => &[OutlineTool::Generate],
            OutlinePhase::NeedsCritique => &[OutlineTool::Critique],
            // An evaluated draft exists, so stopping early is safe.
            OutlinePhase::Revise { .. } => &[OutlineTool::Generate, OutlineTool::Finish],
            OutlinePhase::Complete { .. } | OutlinePhase::Failed => &[OutlineTool::Finish],
        }
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "Outline for {} chapters. Attempts used: {}/{}.\n",
            self.target_chapters, self.attempts, self.max_attempts
        );
        match (&self.draft, &self.evaluation) {
            (None, _) => out.push_str("No draft yet.\n"),
            (Some(d), None) => out.push_str(&format!("Draft with {} chapters, not yet evaluated.\n", d.chapters.len())),
            (Some(_), Some(v)) => {
                out.push_str(&format!("Draft evaluated: score {:.1}, passed {}.\n", v.score, v.passed));
                if !v.issues.is_empty() {
                    out.push_str(&v.render_issues());
                    out.push('\n');
                }
            }
        }
        if let Some(best) = &self.best_verdict {
            out.push_str(&format!("Best score so far: {:.1}.\n", best.score));
        }
        out
    }

    fn work_units(&self) -> u32 {
        self.max_attempts
    }

    fn skip_failed(&self, tool: OutlineTool, error: &EngineError) -> Self {
        match tool {
            OutlineTool::Generate => self.with_failed_attempt(format!("Previous attempt failed: {error}")),
            // Drop the unevaluable draft; the attempt it used stays spent.
            OutlineTool::Critique => Self {
                draft: None,
                evaluation: None,
                ..self.clone()
            },
            OutlineTool::Finish => Self {
                attempts: self.max_attempts,
                ..self.clone()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProjectId;
    use crate::outline::Outline;
    use crate::planner::{fallback_decision, normalize, Decision};
    use crate::qc::QcVerdict;
    use std::collections::BTreeMap;

    fn outline() -> Outline {
        Outline {
            title: "t".into(),
            target_chapters: 3,
            chapters: vec![],
            milestones: vec![],
        }
    }

    fn verdict(passed: bool) -> QcVerdict {
        QcVerdict::new(if passed { 9.0 } else { 3.0 }, 7.5, vec![], BTreeMap::new())
    }

    #[test]
    fn test_transition_table() {
        let fresh = OutlineProgress::new(ProjectId::new(), 3, 2);
        assert_eq!(fresh.phase(), OutlinePhase::NeedsDraft);
        assert_eq!(fallback_decision(&fresh).tool, OutlineTool::Generate);

        let drafted = fresh.with_draft(outline());
        assert_eq!(fallback_decision(&drafted).tool, OutlineTool::Critique);

        let failed = drafted.with_evaluation(verdict(false));
        assert_eq!(failed.phase(), OutlinePhase::Revise { attempts_left: 1 });
        assert_eq!(fallback_decision(&failed).tool, OutlineTool::Generate);

        let exhausted = failed.with_draft(outline()).with_evaluation(verdict(false));
        assert_eq!(exhausted.phase(), OutlinePhase::Complete { passed: false });
        assert_eq!(fallback_decision(&exhausted).tool, OutlineTool::Finish);

        let passed = drafted.with_evaluation(verdict(true));
        assert_eq!(passed.phase(), OutlinePhase::Complete { passed: true });
    }

    #[test]
    fn test_finish_without_draft_is_overridden() {
        let fresh = OutlineProgress::new(ProjectId::new(), 3, 2);
        let decision = normalize(&fresh, Decision::new(OutlineTool::Finish, "done"));
        assert!(decision.overridden);
        assert_eq!(decision.tool, OutlineTool::Generate);

        let drafted = fresh.with_draft(outline());
        let decision = normalize(&drafted, Decision::new(OutlineTool::Generate, "again"));
        assert!(decision.overridden);
        assert_eq!(decision.tool, OutlineTool::Critique);
    }

    #[test]
    fn test_failed_generation_spends_an_attempt() {
        let fresh = OutlineProgress::new(ProjectId::new(), 3, 1);
        let err = EngineError::precondition("generate", "boom");
        let next = fresh.skip_failed(OutlineTool::Generate, &err);
        assert_eq!(next.attempts, 1);
        assert_eq!(next.phase(), OutlinePhase::Failed);
        assert_eq!(fallback_decision(&next).tool, OutlineTool::Finish);
    }
}

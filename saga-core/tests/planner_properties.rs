//! Whatever the model proposes, the decision that reaches the orchestrator is
//! legal for the current phase.
//!
//! Run with: `cargo test -p saga-core --test planner_properties`

use saga_core::outline::Outline;
use saga_core::planner::{
    fallback_decision, normalize, ChapterTool, Decision, OutlineTool, PipelineState, ToolKind,
};
use saga_core::state::{ChapterProgress, OutlineProgress, PendingChapterDraft};
use saga_core::{ProjectId, QcVerdict};
use std::collections::BTreeMap;
use std::sync::Arc;

fn verdict(score: f64) -> QcVerdict {
    QcVerdict::new(score, 7.0, vec![], BTreeMap::new())
}

fn draft(chapter: u32, repairs: u32) -> PendingChapterDraft {
    PendingChapterDraft {
        chapter,
        text: format!("第{chapter}章 钟楼\n\n正文。"),
        repairs,
        rewrites: 0,
        title: "钟楼".into(),
        goal: "追查".into(),
        expected_next_index: chapter,
        context_from_cache: false,
    }
}

/// Chapter states covering every phase.
fn chapter_states() -> Vec<ChapterProgress> {
    let base = ChapterProgress::new(ProjectId::new(), 3, 4, 10, Arc::default()).with_repair_policy(2, true);
    let mut states = vec![base.clone()];
    for repairs in 0..=2 {
        let drafted = base.with_draft(draft(3, repairs));
        states.push(drafted.clone());
        states.push(drafted.with_verdict(verdict(3.0)));
        states.push(drafted.with_verdict(verdict(9.0)));
    }
    states.push(base.with_failed_current());
    states.push(base.with_failed_current().with_failed_current());
    states
}

/// Outline states covering every phase.
fn outline_states() -> Vec<OutlineProgress> {
    let outline = Outline {
        title: "雾城".into(),
        target_chapters: 3,
        chapters: vec![],
        milestones: vec![],
    };
    let base = OutlineProgress::new(ProjectId::new(), 3, 3);
    let mut states = vec![base.clone()];
    let mut current = base;
    for _ in 0..3 {
        current = current.with_draft(outline.clone());
        states.push(current.clone());
        states.push(current.with_evaluation(verdict(9.0)));
        current = current.with_evaluation(verdict(2.0));
        states.push(current.clone());
    }
    states.push(OutlineProgress::new(ProjectId::new(), 3, 1).with_failed_attempt("boom"));
    states
}

fn check_all<P: PipelineState>(states: &[P]) {
    for state in states {
        let phase = state.phase();
        let legal = P::legal(phase);
        let fallback = fallback_decision(state);
        assert!(legal.contains(&fallback.tool), "fallback {} illegal in {phase:?}", fallback.tool);

        for tool in P::Tool::ALL {
            let decision = normalize(state, Decision::new(*tool, "proposed"));
            assert!(legal.contains(&decision.tool), "{} illegal in {phase:?}", decision.tool);
            assert_eq!(decision.overridden, !legal.contains(tool));
            if decision.overridden {
                assert_eq!(decision.tool, fallback.tool);
                assert!(decision.input.is_empty());
            }
        }
    }
}

#[test]
fn test_chapter_decisions_are_always_legal() {
    check_all(&chapter_states());
}

#[test]
fn test_outline_decisions_are_always_legal() {
    check_all(&outline_states());
}

#[test]
fn test_only_done_allows_finish() {
    for state in chapter_states() {
        let finish_legal = ChapterProgress::legal(state.phase()).contains(&ChapterTool::Finish);
        assert_eq!(finish_legal, state.all_handled());
    }
}

#[test]
fn test_exhausted_outline_can_only_finish() {
    for state in outline_states() {
        let awaiting_critique = state.draft.is_some() && state.evaluation.is_none();
        if state.attempts_left() == 0 && !awaiting_critique {
            assert_eq!(OutlineProgress::legal(state.phase()), &[OutlineTool::Finish]);
        }
    }
}

//! Outline planning end to end, driven by scripted completions.
//!
//! Run with: `cargo test -p saga-core --test outline_pipeline`

use saga_core::config::OutlineConfig;
use saga_core::outline::Outline;
use saga_core::qc::{IssueKind, OutlineEvaluator};
use saga_core::{
    EngineConfig, MemoryStore, ProjectId, ProjectStore, ScriptedCompletion, ScriptedFactory, SemanticCache, Session,
};
use serde_json::{json, Value};
use std::sync::Arc;

const OUTLINE_NEEDLE: &str = "You plan serialized novels";

fn chapter(index: u32) -> Value {
    json!({
        "index": index,
        "title": format!("雾中的第{index}个线索"),
        "goal": format!("林风追查钟楼失踪案的第{index}条线索，并因此与守夜人发生正面冲突"),
        "pacing": if index % 25 == 0 { "climax" } else { "rising" },
    })
}

fn outline_json(indices: impl IntoIterator<Item = u32>) -> String {
    let chapters: Vec<Value> = indices.into_iter().map(chapter).collect();
    json!({
        "title": "雾城",
        "chapters": chapters,
        "milestones": [
            {"chapter": 25, "description": "钟楼之夜"},
            {"chapter": 50, "description": "守夜人现身"},
            {"chapter": 100, "description": "雾散"},
        ],
    })
    .to_string()
}

/// Chapters 1..=100 without 45-47 and with chapter 12 listed twice.
fn broken_indices() -> Vec<u32> {
    let mut indices: Vec<u32> = (1..=100).filter(|i| !(45..=47).contains(i)).collect();
    indices.insert(12, 12);
    indices
}

fn session(scripted: Arc<ScriptedCompletion>, store: Arc<MemoryStore>) -> Session {
    Session::new(
        EngineConfig::default(),
        &ScriptedFactory(scripted),
        store,
        Arc::new(SemanticCache::new()),
    )
    .unwrap()
}

// =============================================================================
// Complete outline
// =============================================================================

#[tokio::test]
async fn test_hundred_chapter_outline_passes_first_time() {
    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.respond_when(OUTLINE_NEEDLE, outline_json(1..=100));
    let store = Arc::new(MemoryStore::new());
    let project = ProjectId::new();

    let report = session(scripted.clone(), store.clone())
        .plan_outline(project, "A detective in a city swallowed by fog", 100)
        .await
        .unwrap();

    assert!(report.passed(), "verdict: {:?}", report.verdict);
    let verdict = report.verdict.as_ref().unwrap();
    assert_eq!(verdict.dimension("coverage"), Some(10.0));
    assert_eq!(verdict.dimension("title_quality"), Some(10.0));
    assert_eq!(report.attempts, 1);
    // generate, critique, finish
    assert_eq!(report.iterations, 3);
    assert!(report.done_reason.starts_with("outline accepted"));
    assert_eq!(scripted.calls_matching(OUTLINE_NEEDLE), 1);

    let saved = store.load_outline(project).await.unwrap().unwrap();
    assert_eq!(saved.chapters.len(), 100);
    assert_eq!(saved.target_chapters, 100);
    assert!(saved.is_milestone(50));
}

// =============================================================================
// Missing and duplicate indices
// =============================================================================

#[test]
fn test_missing_and_duplicate_indices_are_blocking() {
    let outline = Outline::from_model_json(&outline_json(broken_indices()), 100).unwrap();
    let evaluator = OutlineEvaluator::new(Arc::new(ScriptedCompletion::new()), OutlineConfig::default());

    let verdict = evaluator.quick(&outline);
    assert!(!verdict.passed);
    assert!(verdict.has_blocking());
    assert!(verdict.has_issue(IssueKind::MissingIndices));
    assert!(verdict.has_issue(IssueKind::DuplicateIndices));

    let missing = verdict
        .issues
        .iter()
        .find(|i| i.kind == IssueKind::MissingIndices)
        .unwrap();
    assert!(missing.description.contains("45-47"));
    let duplicate = verdict
        .issues
        .iter()
        .find(|i| i.kind == IssueKind::DuplicateIndices)
        .unwrap();
    assert!(duplicate.description.contains("12"));
}

#[tokio::test]
async fn test_broken_outline_is_revised_with_notes() {
    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.respond_when(OUTLINE_NEEDLE, outline_json(broken_indices()));
    scripted.respond_when(OUTLINE_NEEDLE, outline_json(1..=100));
    let store = Arc::new(MemoryStore::new());
    let project = ProjectId::new();

    let report = session(scripted.clone(), store.clone())
        .plan_outline(project, "A detective in a city swallowed by fog", 100)
        .await
        .unwrap();

    assert!(report.passed());
    assert_eq!(report.attempts, 2);

    let requests = scripted.requests();
    let prompts: Vec<&str> = requests
        .iter()
        .filter(|r| r.system_instruction.contains(OUTLINE_NEEDLE))
        .map(|r| r.user_prompt.as_str())
        .collect();
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("45-47"));
    assert!(prompts[1].contains("45-47"));

    let saved = store.load_outline(project).await.unwrap().unwrap();
    assert!(saved.chapter(46).is_some());
}

#[tokio::test]
async fn test_persistently_broken_outline_keeps_best_attempt() {
    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.respond_when(OUTLINE_NEEDLE, outline_json(broken_indices()));
    let store = Arc::new(MemoryStore::new());
    let project = ProjectId::new();

    let report = session(scripted.clone(), store.clone())
        .plan_outline(project, "A detective in a city swallowed by fog", 100)
        .await
        .unwrap();

    assert!(!report.passed());
    assert_eq!(report.attempts, 3);
    assert_eq!(scripted.calls_matching(OUTLINE_NEEDLE), 3);
    assert!(report.done_reason.contains("below target"));
    assert!(store.load_outline(project).await.unwrap().is_some());
}

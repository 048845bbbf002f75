//! Runs always terminate, whatever the collaborators do.
//!
//! Run with: `cargo test -p saga-core --test orchestrator_termination`

use saga_core::error::CompletionError;
use saga_core::outline::{Outline, OutlineChapter};
use saga_core::{
    hard_limit, EngineConfig, EngineError, MemoryStore, ProjectId, ProjectStore, ScriptedCompletion, ScriptedFactory,
    SemanticCache, Session,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

const PLANNER: &str = "You choose the next step";
const OUTLINE: &str = "You plan serialized novels";
const WRITER: &str = "You are the author of a serialized novel";

fn outline(total: u32) -> Outline {
    Outline {
        title: "雾城".into(),
        target_chapters: total,
        chapters: (1..=total)
            .map(|i| OutlineChapter {
                index: i,
                title: "钟楼".into(),
                goal: "林风追查失踪案".into(),
                pacing_hint: None,
            })
            .collect(),
        milestones: vec![],
    }
}

fn api_error() -> CompletionError {
    CompletionError::Api {
        status: 500,
        message: "internal error".into(),
    }
}

fn session(config: EngineConfig, scripted: Arc<ScriptedCompletion>, store: Arc<MemoryStore>) -> Session {
    Session::new(config, &ScriptedFactory(scripted), store, Arc::new(SemanticCache::new())).unwrap()
}

#[tokio::test]
async fn test_failing_writer_records_every_chapter_as_failed() {
    let store = Arc::new(MemoryStore::new());
    let project = ProjectId::new();
    store.save_outline(project, &outline(5)).await.unwrap();

    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.fail_when(WRITER, api_error());
    let report = session(EngineConfig::default(), scripted.clone(), store.clone())
        .write_chapters(project, 5, || false)
        .await
        .unwrap();

    assert!(report.generated.is_empty());
    assert_eq!(report.failed.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
    assert_eq!(report.done_reason, "goal reached");
    assert_eq!(report.iterations, 5);
    assert_eq!(report.next_chapter_index, 1);
    assert_eq!(scripted.calls_matching(WRITER), 5);
    assert!(store.load_chapter(project, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_adversarial_planner_is_normalized_and_run_ends() {
    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.respond_when(PLANNER, r#"{"tool": "critique", "reason": "always critique"}"#);
    scripted.fail_when(OUTLINE, api_error());

    let mut config = EngineConfig::default();
    config.planner.model_assisted = true;
    let store = Arc::new(MemoryStore::new());
    let project = ProjectId::new();

    let err = session(config, scripted.clone(), store.clone())
        .plan_outline(project, "A detective in a city swallowed by fog", 30)
        .await
        .err()
        .unwrap();

    assert!(matches!(err, EngineError::OutlineFailed { attempts: 3, .. }), "unexpected error: {err}");
    assert!(err.to_string().contains("internal error"));
    // Three overridden generates, then an overridden finish, well inside the ceiling.
    assert!(scripted.calls_matching(PLANNER) <= hard_limit(3) as usize);
    assert_eq!(scripted.calls_matching(PLANNER), 4);
    assert_eq!(scripted.calls_matching(OUTLINE), 3);
    assert!(store.load_outline(project).await.unwrap().is_none());
}

#[tokio::test]
async fn test_garbage_planner_replies_fall_back() {
    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.respond_when(PLANNER, "I think you should write something nice.");
    scripted.fail_when(OUTLINE, api_error());

    let mut config = EngineConfig::default();
    config.planner.model_assisted = true;
    config.outline.max_attempts = 2;

    let err = session(config, scripted.clone(), Arc::new(MemoryStore::new()))
        .plan_outline(ProjectId::new(), "A detective in a city swallowed by fog", 30)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, EngineError::OutlineFailed { attempts: 2, .. }), "unexpected error: {err}");
    // Two generates and the finish that reports the failure.
    assert_eq!(scripted.calls_matching(PLANNER), 3);
    assert_eq!(scripted.calls_matching(OUTLINE), 2);
}

#[tokio::test]
async fn test_cancel_mid_run_keeps_committed_chapters() {
    let store = Arc::new(MemoryStore::new());
    let project = ProjectId::new();
    store.save_outline(project, &outline(5)).await.unwrap();

    let scripted = Arc::new(ScriptedCompletion::new());
    scripted.fail_when(WRITER, api_error());

    // Cancel on the third poll.
    let polls = AtomicU32::new(0);
    let report = session(EngineConfig::default(), scripted.clone(), store)
        .write_chapters(project, 5, || polls.fetch_add(1, Ordering::SeqCst) >= 2)
        .await
        .unwrap();

    assert_eq!(report.done_reason, "cancelled");
    assert_eq!(report.iterations, 2);
    assert_eq!(report.failed.len(), 2);
    assert_eq!(scripted.calls_matching(WRITER), 2);
}

//! The orchestrator loop.
//!
//! One run drives one pipeline: ask the planner, dispatch the tool, fold the
//! patch into a new state, repeat. The loop always terminates: cancellation
//! and the goal predicate are checked every iteration, and an iteration
//! ceiling derived from the run size forces a synthetic `done`.

use crate::error::Result;
use crate::planner::{PipelineState, Planner};
use crate::state::{AgentState, HistoryEntry};
use crate::tools::ToolRegistry;
use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Iteration ceiling for a run of `work_units` units.
pub fn hard_limit(work_units: u32) -> u32 {
    work_units.saturating_mul(5).saturating_add(8).max(12)
}

/// Drives a pipeline to completion.
pub struct Orchestrator<P: PipelineState> {
    planner: Arc<dyn Planner<P>>,
    tools: ToolRegistry<P>,
}

impl<P: PipelineState> Orchestrator<P> {
    /// Fails if any tool of the pipeline is unbound.
    pub fn new(planner: Arc<dyn Planner<P>>, tools: ToolRegistry<P>) -> Result<Self> {
        tools.ensure_complete()?;
        Ok(Self { planner, tools })
    }

    /// Run from `initial` until done, cancelled, or out of iterations.
    ///
    /// `cancel` is polled once per iteration, before the goal check. Failures
    /// of retryable tools are recorded through [`PipelineState::skip_failed`];
    /// commit conflicts and failures of other tools end the run with an error.
    pub async fn run<C, G>(&self, initial: AgentState<P>, cancel: C, goal: G) -> Result<AgentState<P>>
    where
        C: Fn() -> bool + Send + Sync,
        G: Fn(&P) -> bool + Send + Sync,
    {
        let limit = hard_limit(initial.progress.work_units());
        let mut state = initial;

        while !state.done && state.iteration < limit {
            if cancel() {
                info!(iteration = state.iteration, "Run cancelled");
                state = state.finished("cancelled");
                break;
            }
            if goal(&state.progress) {
                state = state.finished("goal reached");
                break;
            }

            let decision = self.planner.plan(&state).await;
            info!(
                iteration = state.iteration,
                tool = %decision.tool,
                reason = %decision.reason,
                overridden = decision.overridden,
                "Dispatching tool"
            );
            let tool = self.tools.get(decision.tool)?;

            let (progress, summary, finish) = match tool.execute(&state, &decision.input).await {
                Ok(patch) => (
                    patch.progress.unwrap_or_else(|| state.progress.clone()),
                    patch.summary,
                    patch.finish,
                ),
                Err(e) if e.is_conflict() || !tool.retryable() => {
                    error!(iteration = state.iteration, tool = %decision.tool, error = %e, "Run aborted");
                    return Err(e);
                }
                Err(e) => {
                    warn!(iteration = state.iteration, tool = %decision.tool, error = %e, "Tool failed, skipping");
                    let skipped = state.progress.skip_failed(decision.tool, &e);
                    (skipped, format!("failed: {e}"), None)
                }
            };

            let entry = HistoryEntry {
                iteration: state.iteration,
                tool: decision.tool.to_string(),
                reason: decision.reason,
                summary,
                overridden: decision.overridden,
                timestamp: Utc::now(),
            };
            state = state.advance(progress, entry);
            if let Some(reason) = finish {
                state = state.finished(reason);
            }
        }

        if !state.done {
            let reason = format!("safety limit reached after {} iterations", state.iteration);
            warn!(limit, "{reason}");
            state = state.finished(reason);
        }
        info!(
            iterations = state.iteration,
            reason = state.done_reason.as_deref().unwrap_or(""),
            "Run finished"
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::ids::ProjectId;
    use crate::planner::{FallbackPlanner, OutlineTool};
    use crate::state::{OutlineProgress, StatePatch};
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct Failing {
        kind: OutlineTool,
        retryable: bool,
    }

    #[async_trait]
    impl Tool<OutlineProgress> for Failing {
        fn kind(&self) -> OutlineTool {
            self.kind
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn retryable(&self) -> bool {
            self.retryable
        }

        async fn execute(
            &self,
            _state: &AgentState<OutlineProgress>,
            _input: &Map<String, Value>,
        ) -> Result<StatePatch<OutlineProgress>> {
            Err(EngineError::precondition(self.kind, "broken"))
        }
    }

    fn registry(retryable: bool) -> ToolRegistry<OutlineProgress> {
        let mut registry = ToolRegistry::new();
        for kind in [OutlineTool::Generate, OutlineTool::Critique, OutlineTool::Finish] {
            registry
                .register(Arc::new(Failing { kind, retryable }))
                .unwrap();
        }
        registry
    }

    fn planner() -> Arc<dyn Planner<OutlineProgress>> {
        Arc::new(FallbackPlanner)
    }

    #[test]
    fn test_hard_limit() {
        assert_eq!(hard_limit(0), 12);
        assert_eq!(hard_limit(1), 13);
        assert_eq!(hard_limit(100), 508);
        assert_eq!(hard_limit(u32::MAX), u32::MAX);
    }

    #[tokio::test]
    async fn test_always_failing_retryable_tools_hit_the_ceiling() {
        let orchestrator = Orchestrator::new(planner(), registry(true)).unwrap();
        let state = AgentState::new("outline", OutlineProgress::new(ProjectId::new(), 5, 2));

        let done = orchestrator.run(state, || false, |_| false).await.unwrap();
        assert!(done.done);
        assert_eq!(done.iteration, hard_limit(2));
        assert_eq!(
            done.done_reason.as_deref(),
            Some("safety limit reached after 18 iterations")
        );
    }

    #[tokio::test]
    async fn test_non_retryable_failure_propagates() {
        let orchestrator = Orchestrator::new(planner(), registry(false)).unwrap();
        let state = AgentState::new("outline", OutlineProgress::new(ProjectId::new(), 5, 2));
        let err = orchestrator.run(state, || false, |_| false).await.err().unwrap();
        assert!(matches!(err, EngineError::Precondition { .. }));
    }

    #[tokio::test]
    async fn test_cancel_and_goal_are_checked_first() {
        let orchestrator = Orchestrator::new(planner(), registry(false)).unwrap();
        let state = AgentState::new("outline", OutlineProgress::new(ProjectId::new(), 5, 2));

        let cancelled = orchestrator.run(state.clone(), || true, |_| false).await.unwrap();
        assert_eq!(cancelled.done_reason.as_deref(), Some("cancelled"));
        assert_eq!(cancelled.iteration, 0);

        let reached = orchestrator.run(state, || false, |_| true).await.unwrap();
        assert_eq!(reached.done_reason.as_deref(), Some("goal reached"));
    }

    #[test]
    fn test_incomplete_registry_is_rejected() {
        let mut tools = ToolRegistry::<OutlineProgress>::new();
        tools
            .register(Arc::new(Failing {
                kind: OutlineTool::Generate,
                retryable: true,
            }))
            .unwrap();
        assert!(matches!(
            Orchestrator::new(planner(), tools),
            Err(EngineError::ToolNotFound { .. })
        ));
    }
}

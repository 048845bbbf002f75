//! Decision planning.
//!
//! Each pipeline classifies its progress into an explicit phase, and every
//! phase has exactly one fallback tool plus a small set of legal
//! alternatives. Model-proposed decisions are normalized against that set, so
//! whatever the model says, the run only ever takes a legal step.

mod chapter;
mod outline;

pub use chapter::{ChapterPhase, ChapterTool};
pub use outline::{OutlinePhase, OutlineTool};

use crate::completion::{CompletionRequest, TextCompletion};
use crate::error::{CompletionError, EngineError, SchemaError};
use crate::schema::{self, parse_enum, require_non_empty, value_any};
use crate::state::AgentState;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// The closed set of tools a pipeline can dispatch.
pub trait ToolKind: Copy + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static {
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;
}

/// A progress type the orchestrator can drive.
pub trait PipelineState: Clone + Send + Sync + 'static {
    type Phase: Copy + PartialEq + fmt::Debug + Send + Sync;
    type Tool: ToolKind;

    fn phase(&self) -> Self::Phase;

    /// The deterministic transition table.
    fn fallback(phase: Self::Phase) -> Self::Tool;

    /// Tools allowed in `phase`. Always contains the fallback.
    fn legal(phase: Self::Phase) -> &'static [Self::Tool];

    /// Plain-text description for the planner prompt.
    fn describe(&self) -> String;

    /// Units of work in the run, used to size the iteration ceiling.
    fn work_units(&self) -> u32;

    /// Progress after a retryable failure of `tool`: the failing unit is
    /// recorded and the run moves on.
    fn skip_failed(&self, tool: Self::Tool, error: &EngineError) -> Self;
}

/// A planned step.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision<T> {
    pub tool: T,
    pub reason: String,
    pub input: Map<String, Value>,
    /// A model proposal was replaced by the fallback.
    pub overridden: bool,
}

impl<T> Decision<T> {
    pub fn new(tool: T, reason: impl Into<String>) -> Self {
        Self {
            tool,
            reason: reason.into(),
            input: Map::new(),
            overridden: false,
        }
    }
}

/// The table decision for `progress`.
pub fn fallback_decision<P: PipelineState>(progress: &P) -> Decision<P::Tool> {
    let phase = progress.phase();
    Decision::new(P::fallback(phase), format!("fallback for phase {phase:?}"))
}

/// Replace `proposal` with the fallback unless it is legal in the current
/// phase.
pub fn normalize<P: PipelineState>(progress: &P, proposal: Decision<P::Tool>) -> Decision<P::Tool> {
    let phase = progress.phase();
    if P::legal(phase).contains(&proposal.tool) {
        return proposal;
    }
    let fallback = P::fallback(phase);
    warn!(
        proposed = %proposal.tool,
        replacement = %fallback,
        phase = ?phase,
        "Planner proposal overridden"
    );
    Decision {
        tool: fallback,
        reason: format!(
            "{} not allowed in phase {phase:?}; fallback to {fallback}",
            proposal.tool
        ),
        input: Map::new(),
        overridden: true,
    }
}

/// Chooses the next step of a run.
#[async_trait]
pub trait Planner<P: PipelineState>: Send + Sync {
    async fn plan(&self, state: &AgentState<P>) -> Decision<P::Tool>;
}

/// Deterministic table-driven planner.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallbackPlanner;

#[async_trait]
impl<P: PipelineState> Planner<P> for FallbackPlanner {
    async fn plan(&self, state: &AgentState<P>) -> Decision<P::Tool> {
        fallback_decision(&state.progress)
    }
}

const PLANNER_SYSTEM: &str = "You choose the next step of a writing pipeline. \
Pick exactly one of the allowed tools. Reply with JSON only: \
{\"tool\": \"<tool name>\", \"reason\": \"<one sentence>\", \"input\": {}}";

/// Asks the completion service for each decision.
///
/// Any failure (timeout, service error, malformed reply) yields the fallback
/// decision; every proposal is normalized.
pub struct ModelPlanner {
    completion: Arc<dyn TextCompletion>,
    timeout: Duration,
}

impl ModelPlanner {
    pub fn new(completion: Arc<dyn TextCompletion>, timeout: Duration) -> Self {
        Self { completion, timeout }
    }

    async fn propose<P: PipelineState>(&self, state: &AgentState<P>) -> Result<Decision<P::Tool>, EngineError> {
        let phase = state.progress.phase();
        let allowed: Vec<&str> = P::legal(phase).iter().map(|t| t.as_str()).collect();
        let recent: Vec<String> = state
            .history
            .iter()
            .rev()
            .take(5)
            .rev()
            .map(|h| format!("- #{} {}: {}", h.iteration, h.tool, h.summary))
            .collect();
        let prompt = format!(
            "Goal: {}\nIteration: {}\n\n## State\n{}\n\n## Recent steps\n{}\n\nAllowed tools: {}",
            state.goal,
            state.iteration,
            state.progress.describe(),
            if recent.is_empty() { "(none)".to_string() } else { recent.join("\n") },
            allowed.join(", ")
        );
        let request = CompletionRequest::new(PLANNER_SYSTEM, prompt)
            .with_temperature(0.0)
            .with_max_output_tokens(300);

        let reply = tokio::time::timeout(self.timeout, self.completion.complete(&request))
            .await
            .map_err(|_| CompletionError::Timeout { duration: self.timeout })??;
        Ok(parse_decision::<P::Tool>(&reply)?)
    }
}

/// Strictly parse a `{tool, reason, input?}` reply.
pub fn parse_decision<T: ToolKind>(reply: &str) -> Result<Decision<T>, SchemaError> {
    let obj = schema::parse_object(reply)?;
    let raw_tool = require_non_empty(&obj, "tool", &["tool", "action", "name"])?;
    let table: Vec<(&str, T)> = T::ALL.iter().map(|t| (t.as_str(), *t)).collect();
    let tool = parse_enum("tool", &raw_tool, &table)?;
    let reason = require_non_empty(&obj, "reason", &["reason", "why", "rationale"])?;
    let input = match value_any(&obj, &["input", "args", "arguments"]) {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(SchemaError::NotObject),
    };
    Ok(Decision {
        tool,
        reason,
        input,
        overridden: false,
    })
}

#[async_trait]
impl<P: PipelineState> Planner<P> for ModelPlanner {
    async fn plan(&self, state: &AgentState<P>) -> Decision<P::Tool> {
        match self.propose(state).await {
            Ok(proposal) => normalize(&state.progress, proposal),
            Err(e) => {
                warn!(error = %e, "Model planner failed, using fallback");
                fallback_decision(&state.progress)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_decision_strict() {
        let ok: Decision<OutlineTool> =
            parse_decision(r#"{"tool": "critique", "reason": "draft exists", "input": {"focus": "hooks"}}"#).unwrap();
        assert_eq!(ok.tool, OutlineTool::Critique);
        assert_eq!(ok.input["focus"], "hooks");

        assert!(matches!(
            parse_decision::<OutlineTool>(r#"{"tool": "publish", "reason": "x"}"#),
            Err(SchemaError::InvalidEnum { .. })
        ));
        assert!(matches!(
            parse_decision::<OutlineTool>(r#"{"tool": "finish", "reason": "  "}"#),
            Err(SchemaError::EmptyField { .. })
        ));
        assert!(matches!(
            parse_decision::<OutlineTool>(r#"{"tool": "finish", "reason": "x", "input": [1]}"#),
            Err(SchemaError::NotObject)
        ));
    }
}

//! Pipeline tools.
//!
//! A tool is one orchestrator step: it reads the agent state, does its work
//! (usually one or more completion calls and store writes) and returns a
//! [`StatePatch`]. Tools never mutate the state they are given.

mod chapter;
mod outline;

pub use chapter::{chapter_registry, ChapterServices};
pub use outline::{outline_registry, OutlineServices};

use crate::error::{EngineError, Result};
use crate::planner::{PipelineState, ToolKind};
use crate::state::{AgentState, StatePatch};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// An executable pipeline step.
#[async_trait]
pub trait Tool<P: PipelineState>: Send + Sync {
    /// Which tool of the pipeline this is.
    fn kind(&self) -> P::Tool;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Whether a failure should be recorded and skipped rather than ending
    /// the run.
    fn retryable(&self) -> bool {
        false
    }

    async fn execute(&self, state: &AgentState<P>, input: &Map<String, Value>) -> Result<StatePatch<P>>;
}

/// Tools of one pipeline, keyed by kind.
pub struct ToolRegistry<P: PipelineState> {
    tools: HashMap<P::Tool, Arc<dyn Tool<P>>>,
}

impl<P: PipelineState> Default for ToolRegistry<P> {
    fn default() -> Self {
        Self { tools: HashMap::new() }
    }
}

impl<P: PipelineState> ToolRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`. Each kind may be bound once.
    pub fn register(&mut self, tool: Arc<dyn Tool<P>>) -> Result<()> {
        let kind = tool.kind();
        if self.tools.contains_key(&kind) {
            return Err(EngineError::DuplicateTool {
                name: kind.as_str().to_string(),
            });
        }
        self.tools.insert(kind, tool);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, tool: Arc<dyn Tool<P>>) -> Result<Self> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn get(&self, kind: P::Tool) -> Result<Arc<dyn Tool<P>>> {
        self.tools.get(&kind).cloned().ok_or_else(|| EngineError::ToolNotFound {
            name: kind.as_str().to_string(),
        })
    }

    /// Every kind of the pipeline has a tool bound.
    pub fn ensure_complete(&self) -> Result<()> {
        for kind in P::Tool::ALL {
            if !self.tools.contains_key(kind) {
                return Err(EngineError::ToolNotFound {
                    name: kind.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

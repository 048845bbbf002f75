//! Outline pipeline tools: draft, critique, finish.

use super::{Tool, ToolRegistry};
use crate::completion::{CompletionRequest, TextCompletion};
use crate::config::OutlineConfig;
use crate::error::{EngineError, Result};
use crate::knowledge::RelationshipGraph;
use crate::outline::Outline;
use crate::persist::ProjectStore;
use crate::planner::OutlineTool;
use crate::qc::OutlineEvaluator;
use crate::state::{AgentState, OutlineProgress, StatePatch};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

const OUTLINE_SYSTEM: &str = "You plan serialized novels. Produce a complete chapter-by-chapter outline. \
Every chapter from 1 to the target count must appear exactly once, with a specific title and a concrete goal \
stating what happens and what changes. Mark structural high points as milestones. \
Reply with JSON only: {\"title\": \"<book title>\", \"chapters\": [{\"index\": 1, \"title\": \"...\", \
\"goal\": \"...\", \"pacing\": \"setup|rising|action|climax|falling|breather|resolution\"}], \
\"milestones\": [{\"chapter\": 25, \"description\": \"...\"}]}";

/// Collaborators shared by the outline tools.
pub struct OutlineServices {
    pub store: Arc<dyn ProjectStore>,
    pub completion: Arc<dyn TextCompletion>,
    pub evaluator: OutlineEvaluator,
    pub config: OutlineConfig,
}

/// Registry with every outline tool bound.
pub fn outline_registry(services: Arc<OutlineServices>) -> Result<ToolRegistry<OutlineProgress>> {
    ToolRegistry::new()
        .with(Arc::new(GenerateOutline(services.clone())))?
        .with(Arc::new(CritiqueOutline(services.clone())))?
        .with(Arc::new(FinishOutline(services)))
}

fn render_characters(graph: &RelationshipGraph) -> String {
    if graph.characters.is_empty() {
        return "(none recorded)".to_string();
    }
    let mut lines: Vec<String> = graph
        .characters
        .iter()
        .map(|c| {
            let mut line = format!("- {} ({})", c.name, c.id);
            if !c.role.is_empty() {
                line.push_str(&format!(", {}", c.role));
            }
            if c.protagonist {
                line.push_str(", protagonist");
            }
            if !c.description.is_empty() {
                line.push_str(&format!(": {}", c.description));
            }
            line
        })
        .collect();
    for r in &graph.relationships {
        lines.push(format!("- {} → {}: {}", r.from, r.to, r.kind));
    }
    lines.join("\n")
}

fn outline_prompt(
    goal: &str,
    progress: &OutlineProgress,
    setting: &str,
    graph: &RelationshipGraph,
    extra_notes: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Premise: {goal}\nTarget chapters: {}\n\n## Setting\n{}\n\n## Characters\n{}\n",
        progress.target_chapters,
        if setting.trim().is_empty() { "(none recorded)" } else { setting.trim() },
        render_characters(graph)
    );
    let mut notes: Vec<&str> = progress.revision_notes.iter().map(String::as_str).collect();
    if let Some(extra) = extra_notes.filter(|n| !n.trim().is_empty()) {
        notes.push(extra);
    }
    if !notes.is_empty() {
        prompt.push_str("\n## Fix these problems from the previous attempt\n");
        for note in notes {
            prompt.push_str(&format!("- {note}\n"));
        }
    }
    prompt.push_str(&format!(
        "\nReturn all {} chapters in order.",
        progress.target_chapters
    ));
    prompt
}

// ============================================================================
// Tools
// ============================================================================

struct GenerateOutline(Arc<OutlineServices>);

#[async_trait]
impl Tool<OutlineProgress> for GenerateOutline {
    fn kind(&self) -> OutlineTool {
        OutlineTool::Generate
    }

    fn description(&self) -> &str {
        "Draft a full outline, addressing any revision notes"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        state: &AgentState<OutlineProgress>,
        input: &Map<String, Value>,
    ) -> Result<StatePatch<OutlineProgress>> {
        let progress = &state.progress;
        if progress.attempts_left() == 0 {
            return Err(EngineError::precondition(self.kind(), "no attempts left"));
        }
        let setting = self.0.store.load_setting(progress.project).await?;
        let graph = self.0.store.load_relationships(progress.project).await?;
        let notes = input.get("notes").and_then(Value::as_str);

        let request = CompletionRequest::new(
            OUTLINE_SYSTEM,
            outline_prompt(&state.goal, progress, &setting, &graph, notes),
        )
        .with_temperature(self.0.config.temperature)
        .with_max_output_tokens(self.0.config.max_output_tokens);
        let reply = self.0.completion.complete(&request).await?;
        let outline = Outline::from_model_json(&reply, progress.target_chapters)?;

        let next = progress.with_draft(outline);
        let summary = format!(
            "drafted {} chapters (attempt {}/{})",
            next.draft.as_ref().map(|d| d.chapters.len()).unwrap_or(0),
            next.attempts,
            next.max_attempts
        );
        Ok(StatePatch::progress(next, summary))
    }
}

struct CritiqueOutline(Arc<OutlineServices>);

#[async_trait]
impl Tool<OutlineProgress> for CritiqueOutline {
    fn kind(&self) -> OutlineTool {
        OutlineTool::Critique
    }

    fn description(&self) -> &str {
        "Score the current draft for coverage, titles, goals and milestones"
    }

    async fn execute(
        &self,
        state: &AgentState<OutlineProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<OutlineProgress>> {
        let progress = &state.progress;
        let draft = progress
            .draft
            .as_ref()
            .ok_or_else(|| EngineError::precondition(self.kind(), "no draft to critique"))?;
        let verdict = self.0.evaluator.evaluate(draft).await;
        info!(
            score = verdict.score,
            passed = verdict.passed,
            issues = verdict.issues.len(),
            "Outline evaluated"
        );
        let summary = format!(
            "score {:.1}, {} ({} issues)",
            verdict.score,
            if verdict.passed { "passed" } else { "failed" },
            verdict.issues.len()
        );
        Ok(StatePatch::progress(progress.with_evaluation(verdict), summary))
    }
}

struct FinishOutline(Arc<OutlineServices>);

#[async_trait]
impl Tool<OutlineProgress> for FinishOutline {
    fn kind(&self) -> OutlineTool {
        OutlineTool::Finish
    }

    fn description(&self) -> &str {
        "Persist the best outline and end the run"
    }

    async fn execute(
        &self,
        state: &AgentState<OutlineProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<OutlineProgress>> {
        let progress = &state.progress;
        match (&progress.best, &progress.best_verdict) {
            (Some(best), Some(verdict)) => {
                self.0.store.save_outline(progress.project, best).await?;
                let reason = if verdict.passed {
                    format!("outline accepted (score {:.1})", verdict.score)
                } else {
                    format!(
                        "best outline kept after {} attempts (score {:.1}, below target)",
                        progress.attempts, verdict.score
                    )
                };
                Ok(StatePatch::finish(None, reason))
            }
            _ => {
                let last = progress
                    .revision_notes
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "no draft produced".to_string());
                warn!(attempts = progress.attempts, %last, "Outline run failed");
                Err(EngineError::OutlineFailed {
                    attempts: progress.attempts,
                    last,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ProjectId;
    use crate::persist::MemoryStore;
    use crate::testing::ScriptedCompletion;

    fn services(scripted: Arc<ScriptedCompletion>, store: Arc<MemoryStore>) -> Arc<OutlineServices> {
        let config = OutlineConfig {
            deep_review: false,
            ..OutlineConfig::default()
        };
        Arc::new(OutlineServices {
            store,
            completion: scripted.clone(),
            evaluator: OutlineEvaluator::new(scripted, config.clone()),
            config,
        })
    }

    #[tokio::test]
    async fn test_generate_includes_revision_notes() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.respond_when(
            "You plan serialized novels",
            r#"{"title": "雾城", "chapters": [{"index": 1, "title": "雾起", "goal": "林风在雾中醒来并发现自己失去了记忆"}]}"#,
        );
        let store = Arc::new(MemoryStore::new());
        let registry = outline_registry(services(scripted.clone(), store)).unwrap();

        let progress = OutlineProgress::new(ProjectId::new(), 1, 2).with_failed_attempt("缺少里程碑");
        let state = AgentState::new("A mystery in a fog-bound city", progress);
        let patch = registry
            .get(OutlineTool::Generate)
            .unwrap()
            .execute(&state, &Map::new())
            .await
            .unwrap();

        let next = patch.progress.unwrap();
        assert_eq!(next.attempts, 2);
        assert_eq!(next.draft.as_ref().map(|d| d.title.as_str()), Some("雾城"));
        let prompt = &scripted.requests()[0].user_prompt;
        assert!(prompt.contains("缺少里程碑"));
        assert!(prompt.contains("fog-bound"));
    }

    #[tokio::test]
    async fn test_finish_persists_best_outline() {
        let scripted = Arc::new(ScriptedCompletion::new());
        let store = Arc::new(MemoryStore::new());
        let registry = outline_registry(services(scripted, store.clone())).unwrap();
        registry.ensure_complete().unwrap();

        let project = ProjectId::new();
        let outline = Outline {
            title: "雾城".into(),
            target_chapters: 1,
            chapters: vec![],
            milestones: vec![],
        };
        let verdict = crate::qc::QcVerdict::new(8.0, 7.5, vec![], Default::default());
        let progress = OutlineProgress::new(project, 1, 1)
            .with_draft(outline.clone())
            .with_evaluation(verdict);
        let state = AgentState::new("premise", progress);

        let patch = registry
            .get(OutlineTool::Finish)
            .unwrap()
            .execute(&state, &Map::new())
            .await
            .unwrap();
        assert_eq!(patch.finish.as_deref(), Some("outline accepted (score 8.0)"));
        assert_eq!(store.load_outline(project).await.unwrap(), Some(outline));
    }

    #[tokio::test]
    async fn test_finish_without_outline_fails_and_saves_nothing() {
        let store = Arc::new(MemoryStore::new());
        let registry = outline_registry(services(Arc::new(ScriptedCompletion::new()), store.clone())).unwrap();
        let project = ProjectId::new();
        let state = AgentState::new("premise", OutlineProgress::new(project, 3, 1).with_failed_attempt("boom"));

        let err = registry
            .get(OutlineTool::Finish)
            .unwrap()
            .execute(&state, &Map::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::OutlineFailed { attempts: 1, ref last } if last == "boom"));
        assert_eq!(store.load_outline(project).await.unwrap(), None);
    }
}

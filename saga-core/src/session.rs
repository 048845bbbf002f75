//! Session - the primary public API.
//!
//! A session owns one completion client (built from the factory it is given),
//! the project store and the shared context cache, and wires them into the
//! outline and chapter pipelines.

use crate::completion::{ClientFactory, TextCompletion};
use crate::config::EngineConfig;
use crate::context::{ContextBudget, ContextEngine, SemanticCache};
use crate::error::{EngineError, PersistResult, Result};
use crate::generation::ChapterWriter;
use crate::ids::ProjectId;
use crate::knowledge::{KnowledgeAnalyzer, KnowledgeBundle};
use crate::orchestrator::Orchestrator;
use crate::outline::Outline;
use crate::persist::ProjectStore;
use crate::planner::{FallbackPlanner, ModelPlanner, PipelineState, Planner};
use crate::qc::{ChapterEvaluator, OutlineEvaluator, QcVerdict, RepairLoop};
use crate::state::{AgentState, ChapterProgress, GeneratedChapter, OutlineProgress};
use crate::tools::{chapter_registry, outline_registry, ChapterServices, OutlineServices};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Committed chapters fed back as recent prose.
const RECENT_CHAPTERS: u32 = 2;

/// Result of [`Session::plan_outline`].
#[derive(Debug, Clone)]
pub struct OutlineReport {
    /// Best outline produced; persisted when the run finished normally.
    pub outline: Option<Outline>,
    pub verdict: Option<QcVerdict>,
    pub attempts: u32,
    pub iterations: u32,
    pub done_reason: String,
}

impl OutlineReport {
    pub fn passed(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.passed)
    }
}

/// Result of [`Session::write_chapters`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub generated: Vec<GeneratedChapter>,
    pub failed: BTreeSet<u32>,
    pub done_reason: String,
    pub iterations: u32,
    /// Persisted next index after the run.
    pub next_chapter_index: u32,
}

/// Where a project stands.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectStatus {
    pub project: ProjectId,
    pub title: Option<String>,
    pub total_chapters: Option<u32>,
    pub next_chapter_index: u32,
    pub open_loops: Vec<String>,
    pub last_summary: Option<String>,
}

impl ProjectStatus {
    /// Read a project's standing straight from `store`; no completion client
    /// is involved.
    pub async fn load(store: &dyn ProjectStore, project: ProjectId) -> PersistResult<Self> {
        let outline = store.load_outline(project).await?;
        let row = store.load_progress(project).await?;
        Ok(Self {
            project,
            title: outline.as_ref().map(|o| o.title.clone()),
            total_chapters: outline.as_ref().map(|o| o.target_chapters),
            next_chapter_index: row.next_chapter_index,
            open_loops: row.open_loops,
            last_summary: row.summaries.last().map(|s| s.summary.clone()),
        })
    }
}

/// Entry point for outline planning and chapter writing.
pub struct Session {
    config: EngineConfig,
    completion: Arc<dyn TextCompletion>,
    store: Arc<dyn ProjectStore>,
    cache: Arc<SemanticCache>,
}

impl Session {
    /// Validate `config` and build the completion client.
    pub fn new(
        config: EngineConfig,
        factory: &dyn ClientFactory,
        store: Arc<dyn ProjectStore>,
        cache: Arc<SemanticCache>,
    ) -> Result<Self> {
        config.validate()?;
        let completion = factory.build(&config.completion)?;
        Ok(Self {
            config,
            completion,
            store,
            cache,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    fn planner<P: PipelineState>(&self) -> Arc<dyn Planner<P>> {
        if self.config.planner.model_assisted {
            Arc::new(ModelPlanner::new(
                self.completion.clone(),
                Duration::from_secs(self.config.planner.timeout_secs),
            ))
        } else {
            Arc::new(FallbackPlanner)
        }
    }

    /// Plan an outline of `target_chapters` chapters for `goal`.
    ///
    /// The best outline seen is persisted when the run finishes through the
    /// finish tool.
    pub async fn plan_outline(&self, project: ProjectId, goal: &str, target_chapters: u32) -> Result<OutlineReport> {
        if target_chapters == 0 {
            return Err(EngineError::precondition("plan_outline", "target chapter count must be positive"));
        }
        let services = Arc::new(OutlineServices {
            store: self.store.clone(),
            completion: self.completion.clone(),
            evaluator: OutlineEvaluator::new(self.completion.clone(), self.config.outline.clone()),
            config: self.config.outline.clone(),
        });
        let orchestrator = Orchestrator::new(self.planner(), outline_registry(services)?)?;

        info!(%project, target_chapters, "Planning outline");
        let initial = AgentState::new(
            goal,
            OutlineProgress::new(project, target_chapters, self.config.outline.max_attempts),
        );
        let done = orchestrator.run(initial, || false, |_| false).await?;

        let progress = done.progress;
        Ok(OutlineReport {
            outline: progress.best,
            verdict: progress.best_verdict,
            attempts: progress.attempts,
            iterations: done.iteration,
            done_reason: done.done_reason.unwrap_or_default(),
        })
    }

    /// Write up to `remaining` chapters, starting from the persisted next
    /// index.
    ///
    /// `cancel` is polled between iterations. A commit conflict aborts the run
    /// with [`EngineError::Conflict`].
    pub async fn write_chapters<C>(&self, project: ProjectId, remaining: u32, cancel: C) -> Result<BatchReport>
    where
        C: Fn() -> bool + Send + Sync,
    {
        let outline = self
            .store
            .load_outline(project)
            .await?
            .ok_or_else(|| EngineError::precondition("write_chapters", "project has no outline"))?;
        let row = self.store.load_progress(project).await?;
        let total = outline.target_chapters;
        let first = row.next_chapter_index;

        if remaining == 0 || first > total {
            let reason = if first > total { "book complete" } else { "nothing requested" };
            return Ok(BatchReport {
                generated: Vec::new(),
                failed: BTreeSet::new(),
                done_reason: reason.to_string(),
                iterations: 0,
                next_chapter_index: first,
            });
        }
        let last = first.saturating_add(remaining - 1).min(total);

        let knowledge = match self.store.load_knowledge(project).await? {
            Some(bundle) => bundle,
            None => {
                let graph = self.store.load_relationships(project).await?;
                let bundle = KnowledgeBundle::initial(&graph, &outline);
                self.store.save_knowledge(project, &bundle).await?;
                info!(%project, characters = graph.characters.len(), "Knowledge stores initialized");
                bundle
            }
        };

        let orchestrator = Orchestrator::new(self.planner(), chapter_registry(self.chapter_services())?)?;
        let progress = ChapterProgress::new(project, first, last, total, Arc::new(knowledge))
            .with_repair_policy(self.config.repair.max_attempts, self.config.repair.best_effort_commit);
        let goal = format!("Write chapters {first} to {last} of {total} of 《{}》", outline.title);

        info!(%project, first, last, total, "Writing chapters");
        let done = orchestrator
            .run(AgentState::new(goal, progress), cancel, ChapterProgress::all_handled)
            .await?;

        let next_chapter_index = self.store.load_progress(project).await?.next_chapter_index;
        Ok(BatchReport {
            generated: done.progress.generated,
            failed: done.progress.failed,
            done_reason: done.done_reason.unwrap_or_default(),
            iterations: done.iteration,
            next_chapter_index,
        })
    }

    fn chapter_services(&self) -> Arc<ChapterServices> {
        let config = &self.config;
        let completion = &self.completion;
        let budget = ContextBudget::with_overrides(config.context.total_tokens, &config.context.section_overrides());
        let evaluator = ChapterEvaluator::new(completion.clone(), config.qc.clone());
        Arc::new(ChapterServices {
            store: self.store.clone(),
            context: ContextEngine::new(budget, self.cache.clone()),
            writer: ChapterWriter::new(completion.clone(), config.generation.clone()),
            evaluator: evaluator.clone(),
            repair: RepairLoop::new(completion.clone(), evaluator, config.generation.clone(), 1),
            analyzer: KnowledgeAnalyzer::new(completion.clone()),
            min_chars: config.generation.min_chars,
            recent_chapters: RECENT_CHAPTERS,
        })
    }

    /// Summary of a project's persisted state.
    pub async fn status(&self, project: ProjectId) -> Result<ProjectStatus> {
        Ok(ProjectStatus::load(self.store.as_ref(), project).await?)
    }
}

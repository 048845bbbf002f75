//! Chapter pipeline tools: generate, qc, repair, commit, finish.

use super::{Tool, ToolRegistry};
use crate::context::compress::compress_characters;
use crate::context::{ContextEngine, ContextRequest, PriorChapter};
use crate::error::{EngineError, PersistError, Result};
use crate::generation::{ChapterBrief, ChapterWriter};
use crate::knowledge::KnowledgeAnalyzer;
use crate::persist::{ChapterRecord, ProjectProgress, ProjectStore};
use crate::planner::ChapterTool;
use crate::qc::{ChapterEvaluator, ChapterQcInput, RepairLoop};
use crate::state::{AgentState, ChapterProgress, GeneratedChapter, PendingChapterDraft, StatePatch};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Token budget for the character block handed to the reviewer.
const QC_CHARACTER_TOKENS: usize = 800;

/// Open threads carried in the progress row.
const MAX_OPEN_LOOPS: usize = 10;

/// Collaborators shared by the chapter tools.
pub struct ChapterServices {
    pub store: Arc<dyn ProjectStore>,
    pub context: ContextEngine,
    pub writer: ChapterWriter,
    pub evaluator: ChapterEvaluator,
    /// Runs one round per `repair` dispatch.
    pub repair: RepairLoop,
    pub analyzer: KnowledgeAnalyzer,
    pub min_chars: usize,
    /// Committed chapters fed back as recent prose.
    pub recent_chapters: u32,
}

/// Registry with every chapter tool bound.
pub fn chapter_registry(services: Arc<ChapterServices>) -> Result<ToolRegistry<ChapterProgress>> {
    ToolRegistry::new()
        .with(Arc::new(GenerateChapter(services.clone())))?
        .with(Arc::new(QcChapter(services.clone())))?
        .with(Arc::new(RepairChapter(services.clone())))?
        .with(Arc::new(CommitChapter(services)))?
        .with(Arc::new(FinishRun))
}

impl ChapterServices {
    /// Context for `brief`, plus the progress row it was built against.
    async fn assemble(&self, progress: &ChapterProgress, brief: &ChapterBrief) -> Result<(String, bool, ProjectProgress)> {
        let project = progress.project;
        let row = self.store.load_progress(project).await?;
        let setting = self.store.load_setting(project).await?;
        let recent: Vec<PriorChapter> = self
            .store
            .recent_chapters(project, brief.index, self.recent_chapters)
            .await?
            .iter()
            .map(ChapterRecord::as_prior)
            .collect();

        let focus = brief.focus();
        let built = self.context.build(&ContextRequest {
            project,
            chapter: brief.index,
            total_chapters: brief.total_chapters,
            focus: &focus,
            knowledge: progress.knowledge.as_ref(),
            setting: &setting,
            summaries: &row.summaries,
            recent: &recent,
        });
        debug!(
            chapter = brief.index,
            from_cache = built.from_cache,
            version = %built.state_version,
            "Context assembled"
        );

        let mut text = built.text;
        if !row.open_loops.is_empty() {
            text.push_str("\n\n## Open threads\n");
            for item in &row.open_loops {
                text.push_str(&format!("- {item}\n"));
            }
        }
        Ok((text, built.from_cache, row))
    }

    fn brief_for(&self, progress: &ChapterProgress, draft: &PendingChapterDraft) -> ChapterBrief {
        ChapterBrief {
            index: draft.chapter,
            total_chapters: progress.total_chapters,
            title: draft.title.clone(),
            goal: draft.goal.clone(),
            min_chars: self.min_chars,
        }
    }
}

fn pending_draft(progress: &ChapterProgress, tool: ChapterTool) -> Result<&PendingChapterDraft> {
    progress
        .draft
        .as_ref()
        .ok_or_else(|| EngineError::precondition(tool, "no pending draft"))
}

// ============================================================================
// Tools
// ============================================================================

struct GenerateChapter(Arc<ChapterServices>);

#[async_trait]
impl Tool<ChapterProgress> for GenerateChapter {
    fn kind(&self) -> ChapterTool {
        ChapterTool::Generate
    }

    fn description(&self) -> &str {
        "Draft the current chapter from its outline entry and assembled context"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        state: &AgentState<ChapterProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<ChapterProgress>> {
        let progress = &state.progress;
        if progress.all_handled() {
            return Err(EngineError::precondition(self.kind(), "every chapter of the run is handled"));
        }
        if progress.draft.is_some() {
            return Err(EngineError::precondition(self.kind(), "a draft is already pending"));
        }
        let chapter = progress.current;
        let outline = self
            .0
            .store
            .load_outline(progress.project)
            .await?
            .ok_or_else(|| EngineError::precondition(self.kind(), "project has no outline"))?;
        let entry = outline
            .chapter(chapter)
            .ok_or_else(|| EngineError::precondition(self.kind(), format!("outline has no chapter {chapter}")))?;

        let brief = ChapterBrief {
            index: chapter,
            total_chapters: progress.total_chapters,
            title: entry.title.clone(),
            goal: entry.goal.clone(),
            min_chars: self.0.min_chars,
        };
        let (context, from_cache, row) = self.0.assemble(progress, &brief).await?;
        let written = self.0.writer.write(&brief, &context).await?;

        let summary = format!(
            "drafted chapter {chapter} ({} chars, {} rewrites{})",
            written.text.chars().count(),
            written.rewrites,
            if from_cache { ", cached context" } else { "" }
        );
        let draft = PendingChapterDraft {
            chapter,
            text: written.text,
            repairs: 0,
            rewrites: written.rewrites,
            title: brief.title,
            goal: brief.goal,
            expected_next_index: row.next_chapter_index,
            context_from_cache: from_cache,
        };
        Ok(StatePatch::progress(progress.with_draft(draft), summary))
    }
}

struct QcChapter(Arc<ChapterServices>);

#[async_trait]
impl Tool<ChapterProgress> for QcChapter {
    fn kind(&self) -> ChapterTool {
        ChapterTool::Qc
    }

    fn description(&self) -> &str {
        "Score the pending draft"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        state: &AgentState<ChapterProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<ChapterProgress>> {
        let progress = &state.progress;
        let draft = pending_draft(progress, self.kind())?;
        let brief = self.0.brief_for(progress, draft);
        let pacing = progress.knowledge.arc.pacing_for(draft.chapter);
        let characters = compress_characters(
            &progress.knowledge.characters,
            &brief.focus(),
            draft.chapter,
            QC_CHARACTER_TOKENS,
        );

        let verdict = self
            .0
            .evaluator
            .evaluate(ChapterQcInput {
                text: &draft.text,
                brief: &brief,
                pacing: &pacing,
                characters: &characters,
            })
            .await;
        info!(
            chapter = draft.chapter,
            score = verdict.score,
            passed = verdict.passed,
            issues = verdict.issues.len(),
            "Chapter evaluated"
        );
        let summary = format!(
            "chapter {} scored {:.1} ({})",
            draft.chapter,
            verdict.score,
            if verdict.passed { "passed" } else { "failed" }
        );
        Ok(StatePatch::progress(progress.with_verdict(verdict), summary))
    }
}

struct RepairChapter(Arc<ChapterServices>);

#[async_trait]
impl Tool<ChapterProgress> for RepairChapter {
    fn kind(&self) -> ChapterTool {
        ChapterTool::Repair
    }

    fn description(&self) -> &str {
        "Run one targeted repair round on the pending draft"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        state: &AgentState<ChapterProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<ChapterProgress>> {
        let progress = &state.progress;
        let draft = pending_draft(progress, self.kind())?;
        let verdict = progress
            .verdict
            .as_ref()
            .ok_or_else(|| EngineError::precondition(self.kind(), "draft has not been checked"))?;
        if progress.repairs_left() == 0 {
            return Err(EngineError::precondition(self.kind(), "repair budget exhausted"));
        }

        let brief = self.0.brief_for(progress, draft);
        let (context, _, _) = self.0.assemble(progress, &brief).await?;
        let pacing = progress.knowledge.arc.pacing_for(draft.chapter);
        let characters = compress_characters(
            &progress.knowledge.characters,
            &brief.focus(),
            draft.chapter,
            QC_CHARACTER_TOKENS,
        );
        let outcome = self
            .0
            .repair
            .run(
                ChapterQcInput {
                    text: &draft.text,
                    brief: &brief,
                    pacing: &pacing,
                    characters: &characters,
                },
                &context,
                verdict,
            )
            .await?;

        let summary = format!(
            "repair {} of chapter {}: {:.1} → {:.1}{}",
            draft.repairs + 1,
            draft.chapter,
            verdict.score,
            outcome.verdict.score,
            if outcome.improved { "" } else { " (kept previous draft)" }
        );
        Ok(StatePatch::progress(
            progress.with_repaired(outcome.text, outcome.verdict),
            summary,
        ))
    }
}

struct CommitChapter(Arc<ChapterServices>);

#[async_trait]
impl Tool<ChapterProgress> for CommitChapter {
    fn kind(&self) -> ChapterTool {
        ChapterTool::Commit
    }

    fn description(&self) -> &str {
        "Persist the checked draft and update the knowledge stores"
    }

    fn retryable(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        state: &AgentState<ChapterProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<ChapterProgress>> {
        let progress = &state.progress;
        let draft = pending_draft(progress, self.kind())?;
        let verdict = progress
            .verdict
            .as_ref()
            .ok_or_else(|| EngineError::precondition(self.kind(), "draft has not been checked"))?;
        let store = &self.0.store;

        let row = store.load_progress(progress.project).await?;
        if row.next_chapter_index != draft.expected_next_index {
            warn!(
                chapter = draft.chapter,
                expected = draft.expected_next_index,
                found = row.next_chapter_index,
                "Next chapter index moved while drafting"
            );
            return Err(EngineError::Conflict {
                chapter: draft.chapter,
                expected: draft.expected_next_index,
                found: row.next_chapter_index,
            });
        }
        if !verdict.passed {
            if progress.repairs_left() > 0 || !progress.best_effort_commit {
                return Err(EngineError::QualityRejected {
                    chapter: draft.chapter,
                    score: verdict.score,
                });
            }
            warn!(chapter = draft.chapter, score = verdict.score, "Committing best-effort draft");
        }

        let chapter = draft.chapter;
        let summary = self.0.analyzer.summarize(&draft.text, chapter).await;
        let update = self.0.analyzer.update(&progress.knowledge, &draft.text, chapter).await;
        let mut warnings: Vec<String> = update.warnings.iter().map(ToString::to_string).collect();
        for w in &warnings {
            warn!(chapter, warning = %w, "Timeline duplication");
        }
        warnings.extend(
            update
                .failed
                .iter()
                .map(|kind| format!("{kind:?} analysis failed; store unchanged")),
        );
        let open_loops: Vec<String> = update
            .bundle
            .plot
            .foreshadowing_by_urgency(chapter + 1)
            .into_iter()
            .take(MAX_OPEN_LOOPS)
            .map(|(node, urgency)| format!("{} ({:?})", node.title, urgency.level))
            .collect();

        let record = ChapterRecord {
            index: chapter,
            title: draft.title.clone(),
            text: draft.text.clone(),
            summary: summary.clone(),
            verdict: verdict.clone(),
            repairs: draft.repairs,
            rewrites: draft.rewrites,
            warnings,
            committed_at: Utc::now(),
        };
        // The row may have moved while the analysers ran; the store re-checks.
        let committed = store
            .commit_chapter(
                progress.project,
                &record,
                &row.advanced(chapter, summary, open_loops),
                draft.expected_next_index,
            )
            .await;
        match committed {
            Err(PersistError::Conflict { expected, found }) => {
                warn!(chapter, expected, found, "Next chapter index moved before the write");
                return Err(EngineError::Conflict {
                    chapter,
                    expected,
                    found,
                });
            }
            other => other?,
        }
        if let Err(e) = store.save_knowledge(progress.project, &update.bundle).await {
            warn!(chapter, error = %e, "Knowledge stores not saved");
        }

        let generated = GeneratedChapter {
            index: chapter,
            title: draft.title.clone(),
            score: verdict.score,
            passed: verdict.passed,
            repairs: draft.repairs,
            rewrites: draft.rewrites,
            chars: draft.text.chars().count(),
        };
        info!(chapter, score = verdict.score, passed = verdict.passed, "Chapter committed");
        Ok(StatePatch::progress(
            progress.with_committed(generated, Arc::new(update.bundle)),
            format!("committed chapter {chapter} (score {:.1})", verdict.score),
        ))
    }
}

struct FinishRun;

#[async_trait]
impl Tool<ChapterProgress> for FinishRun {
    fn kind(&self) -> ChapterTool {
        ChapterTool::Finish
    }

    fn description(&self) -> &str {
        "End the run"
    }

    async fn execute(
        &self,
        state: &AgentState<ChapterProgress>,
        _input: &Map<String, Value>,
    ) -> Result<StatePatch<ChapterProgress>> {
        let progress = &state.progress;
        Ok(StatePatch::finish(
            None,
            format!(
                "run finished: {} committed, {} failed",
                progress.generated.len(),
                progress.failed.len()
            ),
        ))
    }
}

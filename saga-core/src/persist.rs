//! Project persistence.
//!
//! A project is one book: its outline, relationship graph, setting notes,
//! committed chapters, progress row and knowledge stores. The progress row's
//! `next_chapter_index` is the commit point; runs resume from it alone.

use crate::context::{ChapterSummary, PriorChapter};
use crate::error::{PersistError, PersistResult};
use crate::ids::ProjectId;
use crate::knowledge::{KnowledgeBundle, RelationshipGraph};
use crate::outline::Outline;
use crate::qc::QcVerdict;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Current on-disk progress format.
const FORMAT_VERSION: u32 = 1;

/// Rolling summaries kept in the progress row.
const MAX_SUMMARIES: usize = 200;

/// A committed chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterRecord {
    pub index: u32,
    pub title: String,
    pub text: String,
    pub summary: String,
    pub verdict: QcVerdict,
    pub repairs: u32,
    pub rewrites: u32,
    /// Timeline duplication warnings raised while analysing this chapter.
    #[serde(default)]
    pub warnings: Vec<String>,
    pub committed_at: DateTime<Utc>,
}

impl ChapterRecord {
    pub fn as_prior(&self) -> PriorChapter {
        PriorChapter {
            index: self.index,
            text: self.text.clone(),
        }
    }
}

/// Per-project progress row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProgress {
    #[serde(default = "default_format_version")]
    pub format_version: u32,
    /// The next chapter to commit. Starts at 1.
    pub next_chapter_index: u32,
    /// One line per committed chapter, oldest first.
    #[serde(default)]
    pub summaries: Vec<ChapterSummary>,
    /// Unresolved threads the next chapters should keep in view.
    #[serde(default)]
    pub open_loops: Vec<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_format_version() -> u32 {
    FORMAT_VERSION
}

impl Default for ProjectProgress {
    fn default() -> Self {
        Self {
            format_version: FORMAT_VERSION,
            next_chapter_index: 1,
            summaries: Vec::new(),
            open_loops: Vec::new(),
            updated_at: None,
        }
    }
}

impl ProjectProgress {
    /// Progress after committing `index` with `summary`.
    pub fn advanced(&self, index: u32, summary: String, open_loops: Vec<String>) -> Self {
        let mut summaries: Vec<ChapterSummary> = self
            .summaries
            .iter()
            .filter(|s| s.chapter != index)
            .cloned()
            .collect();
        summaries.push(ChapterSummary { chapter: index, summary });
        summaries.sort_by_key(|s| s.chapter);
        if summaries.len() > MAX_SUMMARIES {
            summaries.drain(..summaries.len() - MAX_SUMMARIES);
        }
        Self {
            format_version: FORMAT_VERSION,
            next_chapter_index: index + 1,
            summaries,
            open_loops,
            updated_at: Some(Utc::now()),
        }
    }
}

/// Storage for everything a project needs between runs.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn load_outline(&self, project: ProjectId) -> PersistResult<Option<Outline>>;
    async fn save_outline(&self, project: ProjectId, outline: &Outline) -> PersistResult<()>;

    /// The relationship graph; empty when none was saved.
    async fn load_relationships(&self, project: ProjectId) -> PersistResult<RelationshipGraph>;
    async fn save_relationships(&self, project: ProjectId, graph: &RelationshipGraph) -> PersistResult<()>;

    /// World-setting notes; empty when none were saved.
    async fn load_setting(&self, project: ProjectId) -> PersistResult<String>;
    async fn save_setting(&self, project: ProjectId, setting: &str) -> PersistResult<()>;

    /// The progress row; a fresh row when the project has none.
    async fn load_progress(&self, project: ProjectId) -> PersistResult<ProjectProgress>;

    /// Write a chapter record, then the progress row that commits it.
    ///
    /// The stored row's `next_chapter_index` is compared with
    /// `expected_next_index` atomically with the write; on mismatch nothing is
    /// written and [`PersistError::Conflict`] is returned.
    async fn commit_chapter(
        &self,
        project: ProjectId,
        record: &ChapterRecord,
        progress: &ProjectProgress,
        expected_next_index: u32,
    ) -> PersistResult<()>;

    async fn load_chapter(&self, project: ProjectId, index: u32) -> PersistResult<Option<ChapterRecord>>;

    async fn load_knowledge(&self, project: ProjectId) -> PersistResult<Option<KnowledgeBundle>>;
    async fn save_knowledge(&self, project: ProjectId, bundle: &KnowledgeBundle) -> PersistResult<()>;

    /// Up to `count` committed chapters before `index`, oldest first.
    async fn recent_chapters(
        &self,
        project: ProjectId,
        index: u32,
        count: u32,
    ) -> PersistResult<Vec<ChapterRecord>> {
        let mut chapters = Vec::new();
        for i in index.saturating_sub(count).max(1)..index {
            if let Some(record) = self.load_chapter(project, i).await? {
                chapters.push(record);
            }
        }
        Ok(chapters)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ProjectData {
    outline: Option<Outline>,
    relationships: RelationshipGraph,
    setting: String,
    progress: ProjectProgress,
    chapters: BTreeMap<u32, ChapterRecord>,
    knowledge: Option<KnowledgeBundle>,
}

/// A store that lives for the process. Used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<ProjectId, ProjectData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read<T>(&self, project: ProjectId, f: impl FnOnce(&ProjectData) -> T) -> T {
        let projects = self.projects.read().await;
        match projects.get(&project) {
            Some(data) => f(data),
            None => f(&ProjectData::default()),
        }
    }

    async fn write(&self, project: ProjectId, f: impl FnOnce(&mut ProjectData)) {
        let mut projects = self.projects.write().await;
        f(projects.entry(project).or_default());
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn load_outline(&self, project: ProjectId) -> PersistResult<Option<Outline>> {
        Ok(self.read(project, |d| d.outline.clone()).await)
    }

    async fn save_outline(&self, project: ProjectId, outline: &Outline) -> PersistResult<()> {
        self.write(project, |d| d.outline = Some(outline.clone())).await;
        Ok(())
    }

    async fn load_relationships(&self, project: ProjectId) -> PersistResult<RelationshipGraph> {
        Ok(self.read(project, |d| d.relationships.clone()).await)
    }

    async fn save_relationships(&self, project: ProjectId, graph: &RelationshipGraph) -> PersistResult<()> {
        self.write(project, |d| d.relationships = graph.clone()).await;
        Ok(())
    }

    async fn load_setting(&self, project: ProjectId) -> PersistResult<String> {
        Ok(self.read(project, |d| d.setting.clone()).await)
    }

    async fn save_setting(&self, project: ProjectId, setting: &str) -> PersistResult<()> {
        self.write(project, |d| d.setting = setting.to_string()).await;
        Ok(())
    }

    async fn load_progress(&self, project: ProjectId) -> PersistResult<ProjectProgress> {
        Ok(self.read(project, |d| d.progress.clone()).await)
    }

    async fn commit_chapter(
        &self,
        project: ProjectId,
        record: &ChapterRecord,
        progress: &ProjectProgress,
        expected_next_index: u32,
    ) -> PersistResult<()> {
        let mut projects = self.projects.write().await;
        let data = projects.entry(project).or_default();
        let found = data.progress.next_chapter_index;
        if found != expected_next_index {
            return Err(PersistError::Conflict {
                expected: expected_next_index,
                found,
            });
        }
        data.chapters.insert(record.index, record.clone());
        data.progress = progress.clone();
        Ok(())
    }

    async fn load_chapter(&self, project: ProjectId, index: u32) -> PersistResult<Option<ChapterRecord>> {
        Ok(self.read(project, |d| d.chapters.get(&index).cloned()).await)
    }

    async fn load_knowledge(&self, project: ProjectId) -> PersistResult<Option<KnowledgeBundle>> {
        Ok(self.read(project, |d| d.knowledge.clone()).await)
    }

    async fn save_knowledge(&self, project: ProjectId, bundle: &KnowledgeBundle) -> PersistResult<()> {
        self.write(project, |d| d.knowledge = Some(bundle.clone())).await;
        Ok(())
    }
}

// ============================================================================
// JSON directory store
// ============================================================================

/// One directory per project under `root`:
///
/// ```text
/// <root>/<project>/outline.json
///                  relationships.json
///                  setting.md
///                  progress.json
///                  knowledge.json
///                  chapters/0001.json
///                  chapters/0001.md
/// ```
///
/// Commits are serialized through one lock per store; the progress row is
/// re-read under it before anything is written.
#[derive(Debug, Clone)]
pub struct JsonDirStore {
    root: PathBuf,
    commit_lock: Arc<Mutex<()>>,
}

impl JsonDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn project_dir(&self, project: ProjectId) -> PathBuf {
        self.root.join(project.to_string())
    }

    fn chapter_path(&self, project: ProjectId, index: u32, ext: &str) -> PathBuf {
        self.project_dir(project)
            .join("chapters")
            .join(format!("{index:04}.{ext}"))
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> PersistResult<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_json<T: Serialize + Sync>(&self, path: &Path, value: &T) -> PersistResult<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.write_atomic(path, content.as_bytes()).await
    }

    /// Write to a sibling temp file, then rename over the target.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> PersistResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, path).await?;
        debug!(path = %path.display(), "Wrote project file");
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for JsonDirStore {
    async fn load_outline(&self, project: ProjectId) -> PersistResult<Option<Outline>> {
        self.read_json(&self.project_dir(project).join("outline.json")).await
    }

    async fn save_outline(&self, project: ProjectId, outline: &Outline) -> PersistResult<()> {
        self.write_json(&self.project_dir(project).join("outline.json"), outline)
            .await
    }

    async fn load_relationships(&self, project: ProjectId) -> PersistResult<RelationshipGraph> {
        Ok(self
            .read_json(&self.project_dir(project).join("relationships.json"))
            .await?
            .unwrap_or_default())
    }

    async fn save_relationships(&self, project: ProjectId, graph: &RelationshipGraph) -> PersistResult<()> {
        self.write_json(&self.project_dir(project).join("relationships.json"), graph)
            .await
    }

    async fn load_setting(&self, project: ProjectId) -> PersistResult<String> {
        match fs::read_to_string(self.project_dir(project).join("setting.md")).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_setting(&self, project: ProjectId, setting: &str) -> PersistResult<()> {
        self.write_atomic(&self.project_dir(project).join("setting.md"), setting.as_bytes())
            .await
    }

    async fn load_progress(&self, project: ProjectId) -> PersistResult<ProjectProgress> {
        let progress: Option<ProjectProgress> =
            self.read_json(&self.project_dir(project).join("progress.json")).await?;
        match progress {
            Some(p) if p.format_version != FORMAT_VERSION => Err(PersistError::VersionMismatch {
                expected: FORMAT_VERSION,
                found: p.format_version,
            }),
            Some(p) => Ok(p),
            None => Ok(ProjectProgress::default()),
        }
    }

    async fn commit_chapter(
        &self,
        project: ProjectId,
        record: &ChapterRecord,
        progress: &ProjectProgress,
        expected_next_index: u32,
    ) -> PersistResult<()> {
        let _guard = self.commit_lock.lock().await;
        let found = self.load_progress(project).await?.next_chapter_index;
        if found != expected_next_index {
            return Err(PersistError::Conflict {
                expected: expected_next_index,
                found,
            });
        }
        self.write_atomic(&self.chapter_path(project, record.index, "md"), record.text.as_bytes())
            .await?;
        self.write_json(&self.chapter_path(project, record.index, "json"), record)
            .await?;
        // The progress row goes last: it is what marks the chapter committed.
        self.write_json(&self.project_dir(project).join("progress.json"), progress)
            .await
    }

    async fn load_chapter(&self, project: ProjectId, index: u32) -> PersistResult<Option<ChapterRecord>> {
        self.read_json(&self.chapter_path(project, index, "json")).await
    }

    async fn load_knowledge(&self, project: ProjectId) -> PersistResult<Option<KnowledgeBundle>> {
        self.read_json(&self.project_dir(project).join("knowledge.json")).await
    }

    async fn save_knowledge(&self, project: ProjectId, bundle: &KnowledgeBundle) -> PersistResult<()> {
        self.write_json(&self.project_dir(project).join("knowledge.json"), bundle)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;

    fn record(index: u32) -> ChapterRecord {
        ChapterRecord {
            index,
            title: format!("第{index}章"),
            text: format!("第{index}章 标题\n\n正文。"),
            summary: "正文。".into(),
            verdict: QcVerdict::new(9.0, 7.0, vec![], Map::new()),
            repairs: 0,
            rewrites: 0,
            warnings: vec![],
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_advanced_replaces_summary_and_bumps_index() {
        let progress = ProjectProgress::default()
            .advanced(1, "a".into(), vec![])
            .advanced(2, "b".into(), vec!["师父的玉佩".into()]);
        assert_eq!(progress.next_chapter_index, 3);
        assert_eq!(progress.summaries.len(), 2);
        assert_eq!(progress.open_loops, vec!["师父的玉佩".to_string()]);

        let again = progress.advanced(2, "b2".into(), vec![]);
        assert_eq!(again.summaries.len(), 2);
        assert_eq!(again.summaries[1].summary, "b2");
    }

    #[tokio::test]
    async fn test_memory_store_commit_and_recent() {
        let store = MemoryStore::new();
        let project = ProjectId::new();
        assert_eq!(store.load_progress(project).await.unwrap().next_chapter_index, 1);

        let mut progress = ProjectProgress::default();
        for i in 1..=4 {
            progress = progress.advanced(i, format!("s{i}"), vec![]);
            store.commit_chapter(project, &record(i), &progress, i).await.unwrap();
        }
        let recent = store.recent_chapters(project, 5, 2).await.unwrap();
        assert_eq!(recent.iter().map(|r| r.index).collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(store.load_progress(project).await.unwrap().next_chapter_index, 5);
    }

    #[tokio::test]
    async fn test_memory_store_rejects_stale_commit() {
        let store = MemoryStore::new();
        let project = ProjectId::new();
        let first = ProjectProgress::default().advanced(1, "a".into(), vec![]);
        store.commit_chapter(project, &record(1), &first, 1).await.unwrap();

        // A writer that read the row before chapter 1 landed.
        let stale = ProjectProgress::default().advanced(1, "b".into(), vec![]);
        let mut rival = record(1);
        rival.text = "另一份稿子".into();
        let err = store.commit_chapter(project, &rival, &stale, 1).await.unwrap_err();
        assert!(matches!(err, PersistError::Conflict { expected: 1, found: 2 }));

        let kept = store.load_chapter(project, 1).await.unwrap().unwrap();
        assert_eq!(kept.text, record(1).text);
        assert_eq!(store.load_progress(project).await.unwrap().summaries[0].summary, "a");
    }

    #[tokio::test]
    async fn test_json_store_rejects_stale_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonDirStore::new(dir.path());
        let project = ProjectId::new();
        let first = ProjectProgress::default().advanced(1, "a".into(), vec![]);
        store.commit_chapter(project, &record(1), &first, 1).await.unwrap();

        let err = store
            .commit_chapter(project, &record(2), &first.advanced(2, "b".into(), vec![]), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Conflict { expected: 1, found: 2 }));
        assert!(store.load_chapter(project, 2).await.unwrap().is_none());
        assert_eq!(store.load_progress(project).await.unwrap().next_chapter_index, 2);
    }
}

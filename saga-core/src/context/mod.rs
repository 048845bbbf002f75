//! Context engineering.
//!
//! Builds the bounded prompt fragment a chapter is written from. The total
//! token budget is split across sections (adjusted for the chapter's pacing),
//! each section has its own compressor, and the whole assembly sits behind a
//! [`SemanticCache`] keyed by a derived [`StateVersion`].

mod budget;
mod cache;
pub mod compress;

pub use budget::{estimate_tokens, is_cjk, ContextBudget, Section};
pub use cache::{fingerprint, CacheKey, ContentKind, SemanticCache, StateVersion};

use crate::ids::ProjectId;
use crate::knowledge::{KnowledgeBundle, PacingBeat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// A committed chapter's rolling-summary line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterSummary {
    pub chapter: u32,
    pub summary: String,
}

/// Text of a recently committed chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorChapter {
    pub index: u32,
    pub text: String,
}

/// Inputs for one context build.
#[derive(Debug, Clone, Copy)]
pub struct ContextRequest<'a> {
    pub project: ProjectId,
    pub chapter: u32,
    pub total_chapters: u32,
    /// Outline title and goal of the chapter being written.
    pub focus: &'a str,
    pub knowledge: &'a KnowledgeBundle,
    pub setting: &'a str,
    pub summaries: &'a [ChapterSummary],
    pub recent: &'a [PriorChapter],
}

/// An assembled context.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltContext {
    pub text: String,
    pub from_cache: bool,
    pub state_version: StateVersion,
    /// Token budget granted to each section.
    pub section_tokens: BTreeMap<Section, usize>,
    pub pacing: PacingBeat,
}

/// Assembles chapter context under a token budget.
#[derive(Debug, Clone)]
pub struct ContextEngine {
    budget: ContextBudget,
    cache: Arc<SemanticCache>,
}

impl ContextEngine {
    pub fn new(budget: ContextBudget, cache: Arc<SemanticCache>) -> Self {
        Self { budget, cache }
    }

    pub fn cache(&self) -> &Arc<SemanticCache> {
        &self.cache
    }

    pub fn budget(&self) -> &ContextBudget {
        &self.budget
    }

    /// Build (or fetch) the context for `request`.
    ///
    /// Repeated calls against unchanged inputs return byte-identical text
    /// with `from_cache = true`.
    pub fn build(&self, request: &ContextRequest<'_>) -> BuiltContext {
        let knowledge = request.knowledge;
        let versions = knowledge.versions();
        let pacing = knowledge.arc.pacing_for(request.chapter);
        let budget = self.budget.for_pacing(pacing.pacing);
        let section_tokens: BTreeMap<Section, usize> = Section::ALL
            .iter()
            .map(|s| (*s, budget.tokens_for(*s)))
            .collect();

        let section_versions: Vec<(Section, StateVersion)> = Section::ALL
            .iter()
            .map(|s| {
                let kind = ContentKind::Section(*s);
                let extra = [section_tokens[s] as u64, self.input_digest(*s, request)];
                let version = StateVersion::compute(request.chapter, &kind.components(&versions), &extra);
                (*s, version)
            })
            .collect();
        let parts: Vec<StateVersion> = section_versions.iter().map(|(_, v)| *v).collect();
        let state_version = StateVersion::combine(request.chapter, &parts);

        let assembled_key = CacheKey {
            project: request.project,
            kind: ContentKind::Assembled,
            chapter: request.chapter,
            version: state_version,
        };
        let assembled_components = ContentKind::Assembled.components(&versions);
        if let Some(text) = self.cache.get(&assembled_key, &assembled_components) {
            return BuiltContext {
                text,
                from_cache: true,
                state_version,
                section_tokens,
                pacing,
            };
        }

        let mut blocks = Vec::new();
        for (section, version) in &section_versions {
            let kind = ContentKind::Section(*section);
            let key = CacheKey {
                project: request.project,
                kind,
                chapter: request.chapter,
                version: *version,
            };
            let components = kind.components(&versions);
            let text = match self.cache.get(&key, &components) {
                Some(text) => text,
                None => {
                    let text = self.render(*section, request, &pacing, section_tokens[section]);
                    self.cache.put(&key, components, text.clone());
                    text
                }
            };
            if !text.trim().is_empty() {
                blocks.push(format!("## {}\n{}", section.heading(), text.trim()));
            }
        }
        let text = blocks.join("\n\n");
        debug!(
            chapter = request.chapter,
            version = %state_version,
            tokens = estimate_tokens(&text),
            "Context assembled"
        );
        self.cache.put(&assembled_key, assembled_components, text.clone());

        BuiltContext {
            text,
            from_cache: false,
            state_version,
            section_tokens,
            pacing,
        }
    }

    /// Digest of the raw (non-store) inputs a section reads.
    fn input_digest(&self, section: Section, request: &ContextRequest<'_>) -> u64 {
        match section {
            Section::Setting => fingerprint(&[request.setting, request.focus]),
            Section::Characters => fingerprint(&[request.focus]),
            Section::Summary => {
                let lines: Vec<String> = request
                    .summaries
                    .iter()
                    .map(|s| format!("{}\u{1f}{}", s.chapter, s.summary))
                    .collect();
                let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                fingerprint(&refs)
            }
            Section::RecentProse => {
                let indices: Vec<String> = request.recent.iter().map(|c| c.index.to_string()).collect();
                let mut refs: Vec<&str> = indices.iter().map(String::as_str).collect();
                refs.extend(request.recent.iter().map(|c| c.text.as_str()));
                fingerprint(&refs)
            }
            Section::Pacing => u64::from(request.total_chapters),
            Section::Plot | Section::Timeline => 0,
        }
    }

    fn render(
        &self,
        section: Section,
        request: &ContextRequest<'_>,
        pacing: &PacingBeat,
        tokens: usize,
    ) -> String {
        let knowledge = request.knowledge;
        match section {
            Section::Setting => {
                let names: Vec<String> = knowledge
                    .characters
                    .iter()
                    .filter(|s| request.focus.contains(&s.name))
                    .map(|s| s.name.clone())
                    .collect();
                compress::compress_setting(request.setting, &names, tokens)
            }
            Section::Characters => {
                compress::compress_characters(&knowledge.characters, request.focus, request.chapter, tokens)
            }
            Section::Plot => compress::compress_plot(&knowledge.plot, request.chapter, tokens),
            Section::Timeline => compress::compress_timeline(&knowledge.timeline, tokens),
            Section::Summary => compress::compress_summary(request.summaries, tokens),
            Section::RecentProse => compress::compress_recent(request.recent, tokens),
            Section::Pacing => {
                let text = compress::render_pacing(pacing, &knowledge.arc, request.total_chapters);
                compress::truncate_to_tokens(&text, tokens)
            }
        }
    }
}

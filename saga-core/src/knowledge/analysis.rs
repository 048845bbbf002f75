//! Chapter analysis: turn committed prose into store proposals.
//!
//! Every `analyze_*` call asks the completion service for a JSON proposal
//! and validates it strictly. [`KnowledgeAnalyzer::update`] runs all four and
//! leaves a store untouched when its analysis fails.

use super::{
    CharacterChange, CharacterField, CharacterStateRegistry, CharacterUpdate, DuplicationWarning,
    EdgeKind, EventKind, EventStatus, KnowledgeBundle, NarrativeArc, NewPlotEdge, NewPlotNode,
    PacingObservation, PacingType, PlotGraph, PlotNodeKind, PlotStatus, PlotUpdate, ProposedEvent,
    StatusChange, StoreKind, TimelineLedger, TimelineUpdate,
};
use crate::completion::{CompletionRequest, TextCompletion};
use crate::error::{Result, SchemaError, SchemaResult};
use crate::ids::CharacterId;
use crate::schema::{self, bounded, objects_any, parse_enum, require_non_empty, str_any, strings_any};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{info, warn};

const MAX_CHARACTER_CHANGES: usize = 40;
const MAX_PLOT_ITEMS: usize = 20;
const MAX_TIMELINE_EVENTS: usize = 20;
/// Characters of chapter text shown to the analyst.
const EXCERPT_CHARS: usize = 12_000;

const CHARACTER_SYSTEM: &str = "You track character state changes in a serialized novel. \
Report only changes that happen on the page in this chapter. Reply with JSON only: \
{\"changes\": [{\"character\": \"<id or name>\", \"field\": \"location|condition|appearance|mood|motivation|goal|standing|allegiance|relationship:<id>\", \"value\": \"<new value>\"}]}";

const PLOT_SYSTEM: &str = "You maintain the plot graph of a serialized novel. \
Reply with JSON only: {\"new_nodes\": [{\"key\": \"...\", \"kind\": \"event|foreshadowing|secret|conflict|resolution|revelation|turning_point\", \
\"title\": \"...\", \"description\": \"...\", \"importance\": 1-10, \"participants\": [\"<character id>\"]}], \
\"status_changes\": [{\"node\": \"<id or title>\", \"status\": \"active|resolved|abandoned|transformed\"}], \
\"edges\": [{\"from\": \"<id, title or key>\", \"to\": \"...\", \"kind\": \"causes|enables|blocks|foreshadows|resolves|contradicts|parallels\"}]}";

const TIMELINE_SYSTEM: &str = "You maintain the story timeline of a serialized novel. \
Give every story beat a short stable unique_key so the same beat always gets the same key. \
Reply with JSON only: {\"events\": [{\"unique_key\": \"...\", \"kind\": \"plot|character|world|conflict|revelation|other\", \
\"title\": \"...\", \"description\": \"...\", \"status\": \"planned|foreshadowed|in_progress|completed|cancelled\", \"participants\": [\"<character id>\"]}]}";

const PACING_SYSTEM: &str = "You classify chapter pacing in a serialized novel. \
Reply with JSON only: {\"pacing\": \"setup|rising|action|climax|falling|breather|resolution\", \"tension\": 0-10}";

const SUMMARY_SYSTEM: &str = "You summarize chapters of a serialized novel for the author's notes. \
Write two or three plain sentences covering what happened and what changed. No preamble.";

/// Result of [`KnowledgeAnalyzer::update`].
#[derive(Debug, Clone)]
pub struct KnowledgeUpdate {
    pub bundle: KnowledgeBundle,
    pub warnings: Vec<DuplicationWarning>,
    /// Stores whose analysis failed and were left unchanged.
    pub failed: Vec<StoreKind>,
}

/// Produces store proposals from chapter text.
#[derive(Clone)]
pub struct KnowledgeAnalyzer {
    completion: Arc<dyn TextCompletion>,
    temperature: f32,
}

impl KnowledgeAnalyzer {
    pub fn new(completion: Arc<dyn TextCompletion>) -> Self {
        Self {
            completion,
            temperature: 0.2,
        }
    }

    async fn ask(&self, system: &str, user: String) -> Result<Map<String, Value>> {
        let request = CompletionRequest::new(system, user)
            .with_temperature(self.temperature)
            .with_max_output_tokens(2_000);
        let reply = self.completion.complete(&request).await?;
        Ok(schema::parse_object(&reply)?)
    }

    /// Propose character changes for `chapter`.
    pub async fn analyze_characters(
        &self,
        text: &str,
        chapter: u32,
        registry: &CharacterStateRegistry,
    ) -> Result<CharacterUpdate> {
        let roster: String = registry
            .iter()
            .map(|s| format!("- {} ({}): {}\n", s.id, s.name, s.role))
            .collect();
        let user = format!(
            "Known characters:\n{roster}\nChapter {chapter}:\n{}",
            excerpt(text)
        );
        let obj = self.ask(CHARACTER_SYSTEM, user).await?;
        Ok(parse_character_update(&obj)?)
    }

    /// Propose plot graph changes for `chapter`.
    pub async fn analyze_plot(&self, text: &str, chapter: u32, graph: &PlotGraph) -> Result<PlotUpdate> {
        let open: String = graph
            .active_nodes()
            .map(|n| format!("- {} [{:?}] {}\n", n.id, n.kind, n.title))
            .collect();
        let user = format!(
            "Open plot threads:\n{open}\nChapter {chapter}:\n{}",
            excerpt(text)
        );
        let obj = self.ask(PLOT_SYSTEM, user).await?;
        Ok(parse_plot_update(&obj)?)
    }

    /// Propose timeline beats for `chapter`.
    pub async fn analyze_timeline(
        &self,
        text: &str,
        chapter: u32,
        ledger: &TimelineLedger,
    ) -> Result<TimelineUpdate> {
        let known: String = ledger
            .events
            .iter()
            .filter(|e| e.status != EventStatus::Cancelled)
            .map(|e| format!("- {} [{:?}] {}\n", e.unique_key, e.status, e.title))
            .collect();
        let user = format!(
            "Known beats (reuse these keys):\n{known}\nChapter {chapter}:\n{}",
            excerpt(text)
        );
        let obj = self.ask(TIMELINE_SYSTEM, user).await?;
        Ok(parse_timeline_update(&obj)?)
    }

    /// Classify the pacing `chapter` actually delivered.
    pub async fn analyze_pacing(
        &self,
        text: &str,
        chapter: u32,
        arc: &NarrativeArc,
    ) -> Result<PacingObservation> {
        let planned = arc.pacing_for(chapter);
        let user = format!(
            "Planned pacing: {} (tension {})\nChapter {chapter}:\n{}",
            planned.pacing,
            planned.tension,
            excerpt(text)
        );
        let obj = self.ask(PACING_SYSTEM, user).await?;
        Ok(parse_pacing(&obj)?)
    }

    /// Run all four analyses and fold the proposals into a new bundle.
    pub async fn update(&self, bundle: &KnowledgeBundle, text: &str, chapter: u32) -> KnowledgeUpdate {
        let mut next = bundle.clone();
        let mut warnings = Vec::new();
        let mut failed = Vec::new();

        match self.analyze_characters(text, chapter, &bundle.characters).await {
            Ok(update) => next.characters = bundle.characters.apply(&update, chapter),
            Err(e) => {
                warn!(chapter, error = %e, "Character analysis failed, store unchanged");
                failed.push(StoreKind::Characters);
            }
        }
        match self.analyze_plot(text, chapter, &bundle.plot).await {
            Ok(update) => next.plot = bundle.plot.apply(&update, chapter),
            Err(e) => {
                warn!(chapter, error = %e, "Plot analysis failed, store unchanged");
                failed.push(StoreKind::Plot);
            }
        }
        match self.analyze_timeline(text, chapter, &bundle.timeline).await {
            Ok(update) => {
                let applied = bundle.timeline.apply(&update, chapter);
                next.timeline = applied.ledger;
                warnings = applied.warnings;
            }
            Err(e) => {
                warn!(chapter, error = %e, "Timeline analysis failed, store unchanged");
                failed.push(StoreKind::Timeline);
            }
        }
        match self.analyze_pacing(text, chapter, &bundle.arc).await {
            Ok(observation) => next.arc = bundle.arc.apply(observation, chapter),
            Err(e) => {
                warn!(chapter, error = %e, "Pacing analysis failed, store unchanged");
                failed.push(StoreKind::Arc);
            }
        }

        info!(chapter, failed = failed.len(), warnings = warnings.len(), "Knowledge stores updated");
        KnowledgeUpdate {
            bundle: next,
            warnings,
            failed,
        }
    }

    /// A short summary for the rolling summary; falls back to the opening
    /// sentences when the completion service fails.
    pub async fn summarize(&self, text: &str, chapter: u32) -> String {
        let request = CompletionRequest::new(SUMMARY_SYSTEM, format!("Chapter {chapter}:\n{}", excerpt(text)))
            .with_temperature(self.temperature)
            .with_max_output_tokens(400);
        match self.completion.complete(&request).await {
            Ok(summary) if !summary.trim().is_empty() => summary.trim().to_string(),
            Ok(_) | Err(_) => {
                warn!(chapter, "Summary generation failed, using opening sentences");
                heuristic_summary(text)
            }
        }
    }
}

/// First two sentences of the body (title line skipped), at most 200 chars.
pub fn heuristic_summary(text: &str) -> String {
    let body: String = text
        .lines()
        .skip_while(|l| l.trim().is_empty())
        .skip(1)
        .collect::<Vec<_>>()
        .join("");
    let body = if body.trim().is_empty() { text } else { body.as_str() };

    let mut out = String::new();
    let mut sentences = 0;
    for c in body.trim().chars() {
        out.push(c);
        if matches!(c, '。' | '！' | '？' | '.' | '!' | '?') {
            sentences += 1;
            if sentences == 2 {
                break;
            }
        }
        if out.chars().count() >= 200 {
            break;
        }
    }
    out.trim().to_string()
}

fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

// ============================================================================
// Proposal parsing
// ============================================================================

fn character_ids(obj: &Map<String, Value>) -> Vec<CharacterId> {
    strings_any(obj, &["participants", "characters", "involved"])
        .into_iter()
        .map(CharacterId::new)
        .collect()
}

fn parse_character_update(obj: &Map<String, Value>) -> SchemaResult<CharacterUpdate> {
    let items = bounded(
        "changes",
        objects_any(obj, &["changes", "updates", "characterChanges", "character_changes"]),
        MAX_CHARACTER_CHANGES,
    )?;
    let mut changes = Vec::with_capacity(items.len());
    for item in items {
        let character = require_non_empty(item, "character", &["character", "id", "name", "characterId"])?;
        let raw_field = require_non_empty(item, "field", &["field", "attribute", "aspect"])?;
        let field = CharacterField::parse(&raw_field).ok_or(SchemaError::InvalidEnum {
            field: "field".to_string(),
            value: raw_field.clone(),
        })?;
        let value = require_non_empty(item, "value", &["value", "new", "newValue", "to"])?;
        changes.push(CharacterChange {
            character,
            field,
            value,
        });
    }
    Ok(CharacterUpdate { changes })
}

fn parse_plot_update(obj: &Map<String, Value>) -> SchemaResult<PlotUpdate> {
    let mut update = PlotUpdate::default();

    let nodes = bounded(
        "new_nodes",
        objects_any(obj, &["new_nodes", "newNodes", "nodes"]),
        MAX_PLOT_ITEMS,
    )?;
    for item in nodes {
        let title = require_non_empty(item, "title", &["title", "name"])?;
        let raw_kind = require_non_empty(item, "kind", &["kind", "type"])?;
        let kind = parse_enum("kind", &raw_kind, PlotNodeKind::TABLE)?;
        let importance = schema::f64_any(item, &["importance", "weight"])
            .map(|v| v.round().clamp(1.0, 10.0) as u8)
            .unwrap_or(5);
        update.new_nodes.push(NewPlotNode {
            key: str_any(item, &["key", "ref", "id"]).unwrap_or_else(|| title.clone()),
            kind,
            title,
            description: str_any(item, &["description", "summary"]).unwrap_or_default(),
            importance,
            participants: character_ids(item),
        });
    }

    let changes = bounded(
        "status_changes",
        objects_any(obj, &["status_changes", "statusChanges", "updates"]),
        MAX_PLOT_ITEMS,
    )?;
    for item in changes {
        let node = require_non_empty(item, "node", &["node", "id", "title"])?;
        let raw_status = require_non_empty(item, "status", &["status", "to"])?;
        let status = parse_enum("status", &raw_status, PlotStatus::TABLE)?;
        update.status_changes.push(StatusChange { node, status });
    }

    let edges = bounded(
        "edges",
        objects_any(obj, &["edges", "new_edges", "newEdges", "links"]),
        MAX_PLOT_ITEMS,
    )?;
    for item in edges {
        let from = require_non_empty(item, "from", &["from", "source"])?;
        let to = require_non_empty(item, "to", &["to", "target"])?;
        let raw_kind = require_non_empty(item, "kind", &["kind", "type", "relation"])?;
        let kind = parse_enum("kind", &raw_kind, EdgeKind::TABLE)?;
        update.new_edges.push(NewPlotEdge { from, to, kind });
    }

    Ok(update)
}

fn parse_timeline_update(obj: &Map<String, Value>) -> SchemaResult<TimelineUpdate> {
    let items = bounded(
        "events",
        objects_any(obj, &["events", "timeline", "beats"]),
        MAX_TIMELINE_EVENTS,
    )?;
    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let unique_key = require_non_empty(item, "unique_key", &["unique_key", "uniqueKey", "key"])?;
        let title = str_any(item, &["title", "name"]).unwrap_or_else(|| unique_key.clone());
        let kind = match str_any(item, &["kind", "type"]) {
            Some(raw) => parse_enum("kind", &raw, EventKind::TABLE)?,
            None => EventKind::Plot,
        };
        let raw_status = require_non_empty(item, "status", &["status", "state"])?;
        let status = parse_enum("status", &raw_status, EventStatus::TABLE)?;
        events.push(ProposedEvent {
            unique_key,
            kind,
            title,
            description: str_any(item, &["description", "summary"]).unwrap_or_default(),
            status,
            participants: character_ids(item),
        });
    }
    Ok(TimelineUpdate { events })
}

fn parse_pacing(obj: &Map<String, Value>) -> SchemaResult<PacingObservation> {
    let raw = require_non_empty(obj, "pacing", &["pacing", "pacingType", "type"])?;
    let pacing = PacingType::parse(&raw).ok_or(SchemaError::InvalidEnum {
        field: "pacing".to_string(),
        value: raw.clone(),
    })?;
    let tension = schema::f64_any(obj, &["tension", "intensity"])
        .map(|t| t.round().clamp(0.0, 10.0) as u8)
        .unwrap_or_else(|| pacing.default_tension());
    Ok(PacingObservation { pacing, tension })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{CharacterProfile, RelationshipGraph};
    use crate::outline::Outline;
    use crate::testing::ScriptedCompletion;

    fn bundle() -> KnowledgeBundle {
        let graph = RelationshipGraph {
            characters: vec![CharacterProfile {
                id: CharacterId::new("lin_feng"),
                name: "林风".into(),
                role: "主角".into(),
                protagonist: true,
                description: String::new(),
            }],
            relationships: vec![],
        };
        let outline = Outline {
            title: "t".into(),
            target_chapters: 10,
            chapters: vec![],
            milestones: vec![],
        };
        KnowledgeBundle::initial(&graph, &outline)
    }

    #[test]
    fn test_parse_plot_update_rejects_unknown_kind() {
        let obj = schema::parse_object(
            r#"{"new_nodes": [{"title": "x", "kind": "subplot"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            parse_plot_update(&obj),
            Err(SchemaError::InvalidEnum { .. })
        ));
    }

    #[test]
    fn test_parse_timeline_aliases() {
        let obj = schema::parse_object(
            r#"{"beats": [{"uniqueKey": "master-dies", "type": "plot", "state": "in-progress"}]}"#,
        )
        .unwrap();
        let update = parse_timeline_update(&obj).unwrap();
        assert_eq!(update.events[0].status, EventStatus::InProgress);
        assert_eq!(update.events[0].title, "master-dies");
    }

    #[test]
    fn test_heuristic_summary() {
        let text = "第3章 夜袭\n\n月黑风高。林风握紧了剑。远处传来脚步声。";
        assert_eq!(heuristic_summary(text), "月黑风高。林风握紧了剑。");
    }

    #[tokio::test]
    async fn test_update_isolates_failures() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.respond_when(
            "character state changes",
            r#"{"changes": [{"character": "林风", "field": "location", "value": "青云山"}]}"#,
        );
        scripted.respond_when("plot graph", "I am not JSON");
        scripted.respond_when(
            "story timeline",
            r#"```json
            {"events": [{"unique_key": "arrival", "status": "completed", "title": "抵达青云山"}]}
            ```"#,
        );
        // No pacing reply scripted: that analysis fails.
        let analyzer = KnowledgeAnalyzer::new(scripted.clone());
        let original = bundle();

        let result = analyzer.update(&original, "第1章 出山\n\n林风到了青云山。", 1).await;
        assert_eq!(result.failed, vec![StoreKind::Plot, StoreKind::Arc]);
        assert_eq!(result.bundle.characters.version, 1);
        assert_eq!(result.bundle.timeline.completed().count(), 1);
        assert_eq!(result.bundle.plot, original.plot);
        assert_eq!(result.bundle.arc, original.arc);
    }
}

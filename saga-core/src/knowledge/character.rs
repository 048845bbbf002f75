//! Character state registry.
//!
//! One snapshot per character, seeded from the relationship graph and
//! superseded (never deleted) as chapters are committed.

use super::StoreStamp;
use crate::ids::CharacterId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Capacity of each character's change ring buffer.
pub const RECENT_CHANGES: usize = 5;

// ============================================================================
// Relationship graph (input)
// ============================================================================

/// A character as defined by the author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterProfile {
    pub id: CharacterId,
    pub name: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub protagonist: bool,
    #[serde(default)]
    pub description: String,
}

/// A typed link between two characters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub from: CharacterId,
    pub to: CharacterId,
    pub kind: String,
}

/// The author's character-relationship graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipGraph {
    pub characters: Vec<CharacterProfile>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhysicalState {
    pub location: Option<String>,
    pub condition: Option<String>,
    pub appearance: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PsychologicalState {
    pub mood: Option<String>,
    pub motivation: Option<String>,
    pub goal: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocialState {
    pub standing: Option<String>,
    pub allegiance: Option<String>,
    /// How this character currently regards others.
    pub relationships: BTreeMap<CharacterId, String>,
}

/// A tracked attribute of a character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharacterField {
    Location,
    Condition,
    Appearance,
    Mood,
    Motivation,
    Goal,
    Standing,
    Allegiance,
    Relationship(CharacterId),
}

impl CharacterField {
    /// Parse a field name; `relationship:<id>` addresses a relationship note.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase();
        if let Some(target) = lowered
            .strip_prefix("relationship:")
            .or_else(|| lowered.strip_prefix("relationship."))
        {
            return Some(CharacterField::Relationship(CharacterId::new(target)));
        }
        let field = match lowered.as_str() {
            "location" | "position" | "place" => CharacterField::Location,
            "condition" | "health" | "injury" => CharacterField::Condition,
            "appearance" | "look" => CharacterField::Appearance,
            "mood" | "emotion" | "feeling" => CharacterField::Mood,
            "motivation" | "drive" => CharacterField::Motivation,
            "goal" | "objective" => CharacterField::Goal,
            "standing" | "status" | "reputation" => CharacterField::Standing,
            "allegiance" | "faction" | "loyalty" => CharacterField::Allegiance,
            _ => return None,
        };
        Some(field)
    }

    pub fn label(&self) -> String {
        match self {
            CharacterField::Location => "location".into(),
            CharacterField::Condition => "condition".into(),
            CharacterField::Appearance => "appearance".into(),
            CharacterField::Mood => "mood".into(),
            CharacterField::Motivation => "motivation".into(),
            CharacterField::Goal => "goal".into(),
            CharacterField::Standing => "standing".into(),
            CharacterField::Allegiance => "allegiance".into(),
            CharacterField::Relationship(id) => format!("relationship:{id}"),
        }
    }
}

/// A recorded change of one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub old: Option<String>,
    pub new: String,
    pub chapter: u32,
}

/// Current state of one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterSnapshot {
    pub id: CharacterId,
    pub name: String,
    pub role: String,
    pub protagonist: bool,
    pub physical: PhysicalState,
    pub psychological: PsychologicalState,
    pub social: SocialState,
    /// Most recent changes, oldest first, at most [`RECENT_CHANGES`].
    pub recent_changes: VecDeque<FieldChange>,
    pub as_of_chapter: u32,
}

impl CharacterSnapshot {
    fn from_profile(profile: &CharacterProfile) -> Self {
        Self {
            id: profile.id.clone(),
            name: profile.name.clone(),
            role: profile.role.clone(),
            protagonist: profile.protagonist,
            physical: PhysicalState::default(),
            psychological: PsychologicalState::default(),
            social: SocialState::default(),
            recent_changes: VecDeque::new(),
            as_of_chapter: 0,
        }
    }

    /// Current value of `field`.
    pub fn get(&self, field: &CharacterField) -> Option<&str> {
        let value = match field {
            CharacterField::Location => &self.physical.location,
            CharacterField::Condition => &self.physical.condition,
            CharacterField::Appearance => &self.physical.appearance,
            CharacterField::Mood => &self.psychological.mood,
            CharacterField::Motivation => &self.psychological.motivation,
            CharacterField::Goal => &self.psychological.goal,
            CharacterField::Standing => &self.social.standing,
            CharacterField::Allegiance => &self.social.allegiance,
            CharacterField::Relationship(other) => {
                return self.social.relationships.get(other).map(String::as_str)
            }
        };
        value.as_deref()
    }

    fn set(&mut self, field: &CharacterField, value: String) {
        let slot = match field {
            CharacterField::Location => &mut self.physical.location,
            CharacterField::Condition => &mut self.physical.condition,
            CharacterField::Appearance => &mut self.physical.appearance,
            CharacterField::Mood => &mut self.psychological.mood,
            CharacterField::Motivation => &mut self.psychological.motivation,
            CharacterField::Goal => &mut self.psychological.goal,
            CharacterField::Standing => &mut self.social.standing,
            CharacterField::Allegiance => &mut self.social.allegiance,
            CharacterField::Relationship(other) => {
                self.social.relationships.insert(other.clone(), value);
                return;
            }
        };
        *slot = Some(value);
    }

    /// Chapter of the most recent change, if any.
    pub fn last_change_chapter(&self) -> Option<u32> {
        self.recent_changes.back().map(|c| c.chapter)
    }

    /// Prompt rendering.
    pub fn render(&self) -> String {
        let mut out = format!("{} ({})", self.name, self.id);
        if !self.role.is_empty() {
            out.push_str(&format!(" - {}", self.role));
        }
        if self.protagonist {
            out.push_str(" [protagonist]");
        }
        out.push('\n');
        let fields = [
            CharacterField::Location,
            CharacterField::Condition,
            CharacterField::Appearance,
            CharacterField::Mood,
            CharacterField::Motivation,
            CharacterField::Goal,
            CharacterField::Standing,
            CharacterField::Allegiance,
        ];
        for field in &fields {
            if let Some(value) = self.get(field) {
                out.push_str(&format!("  {}: {}\n", field.label(), value));
            }
        }
        for (other, note) in &self.social.relationships {
            out.push_str(&format!("  toward {other}: {note}\n"));
        }
        if let Some(last) = self.recent_changes.back() {
            out.push_str(&format!(
                "  latest change (ch{}): {} -> {}\n",
                last.chapter, last.field, last.new
            ));
        }
        out
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A proposed change for one character.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterChange {
    /// Character id or display name.
    pub character: String,
    pub field: CharacterField,
    pub value: String,
}

/// Proposed changes for one chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacterUpdate {
    pub changes: Vec<CharacterChange>,
}

/// All character snapshots for a book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterStateRegistry {
    pub snapshots: BTreeMap<CharacterId, CharacterSnapshot>,
    pub version: u64,
    pub last_updated_chapter: u32,
}

impl CharacterStateRegistry {
    /// Seed the registry from the relationship graph.
    pub fn from_graph(graph: &RelationshipGraph) -> Self {
        let mut snapshots: BTreeMap<CharacterId, CharacterSnapshot> = graph
            .characters
            .iter()
            .map(|p| (p.id.clone(), CharacterSnapshot::from_profile(p)))
            .collect();
        for rel in &graph.relationships {
            if let Some(snapshot) = snapshots.get_mut(&rel.from) {
                snapshot
                    .social
                    .relationships
                    .insert(rel.to.clone(), rel.kind.clone());
            }
        }
        Self {
            snapshots,
            version: 0,
            last_updated_chapter: 0,
        }
    }

    pub fn stamp(&self) -> StoreStamp {
        StoreStamp::new(self.version, self.last_updated_chapter)
    }

    pub fn get(&self, id: &CharacterId) -> Option<&CharacterSnapshot> {
        self.snapshots.get(id)
    }

    /// Look a character up by id or (case-insensitive) display name.
    pub fn resolve(&self, reference: &str) -> Option<&CharacterId> {
        let reference = reference.trim();
        let as_id = CharacterId::new(reference);
        if self.snapshots.contains_key(&as_id) {
            return self.snapshots.get_key_value(&as_id).map(|(k, _)| k);
        }
        let lowered = reference.to_lowercase();
        self.snapshots
            .values()
            .find(|s| s.name.to_lowercase() == lowered)
            .map(|s| &s.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CharacterSnapshot> {
        self.snapshots.values()
    }

    /// Apply proposed changes observed in `chapter`.
    ///
    /// Changes for unknown characters, for chapters older than a snapshot's
    /// `as_of_chapter`, or that repeat the current value are dropped. The
    /// version only advances when something actually changed.
    pub fn apply(&self, update: &CharacterUpdate, chapter: u32) -> Self {
        let mut next = self.clone();
        let mut changed = false;

        for change in &update.changes {
            let Some(id) = next.resolve(&change.character).cloned() else {
                debug!(character = %change.character, "Ignoring change for unknown character");
                continue;
            };
            let Some(snapshot) = next.snapshots.get_mut(&id) else {
                continue;
            };
            if chapter < snapshot.as_of_chapter {
                debug!(%id, chapter, as_of = snapshot.as_of_chapter, "Ignoring stale character change");
                continue;
            }
            let value = change.value.trim();
            if value.is_empty() {
                continue;
            }
            let old = snapshot.get(&change.field).map(str::to_string);
            if old.as_deref() == Some(value) {
                continue;
            }

            snapshot.set(&change.field, value.to_string());
            snapshot.recent_changes.push_back(FieldChange {
                field: change.field.label(),
                old,
                new: value.to_string(),
                chapter,
            });
            while snapshot.recent_changes.len() > RECENT_CHANGES {
                snapshot.recent_changes.pop_front();
            }
            snapshot.as_of_chapter = chapter;
            changed = true;
        }

        if changed {
            next.version += 1;
            next.last_updated_chapter = next.last_updated_chapter.max(chapter);
        }
        next
    }
}

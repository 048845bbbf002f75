//! Timeline ledger.
//!
//! Every story beat carries a unique key. The ledger refuses to let the same
//! beat complete twice, which is what stops a chapter from re-narrating
//! something the book has already resolved.

use super::StoreStamp;
use crate::ids::CharacterId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Plot,
    Character,
    World,
    Conflict,
    Revelation,
    Other,
}

impl EventKind {
    pub const TABLE: &'static [(&'static str, EventKind)] = &[
        ("plot", EventKind::Plot),
        ("character", EventKind::Character),
        ("world", EventKind::World),
        ("conflict", EventKind::Conflict),
        ("revelation", EventKind::Revelation),
        ("other", EventKind::Other),
    ];
}

/// Status lattice: `planned → foreshadowed → in_progress → completed`,
/// with `cancelled` reachable from any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Planned,
    Foreshadowed,
    InProgress,
    Completed,
    Cancelled,
}

impl EventStatus {
    pub const TABLE: &'static [(&'static str, EventStatus)] = &[
        ("planned", EventStatus::Planned),
        ("foreshadowed", EventStatus::Foreshadowed),
        ("in_progress", EventStatus::InProgress),
        ("completed", EventStatus::Completed),
        ("cancelled", EventStatus::Cancelled),
    ];

    fn rank(&self) -> Option<u8> {
        match self {
            EventStatus::Planned => Some(0),
            EventStatus::Foreshadowed => Some(1),
            EventStatus::InProgress => Some(2),
            EventStatus::Completed => Some(3),
            EventStatus::Cancelled => None,
        }
    }

    /// Whether `self → to` is a forward move in the lattice.
    pub fn can_transition(&self, to: EventStatus) -> bool {
        match (self.rank(), to.rank()) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(from), Some(to)) => to > from,
        }
    }

    /// Statuses that claim a unique key exclusively.
    pub fn is_claiming(&self) -> bool {
        matches!(self, EventStatus::InProgress | EventStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub unique_key: String,
    pub kind: EventKind,
    pub title: String,
    pub description: String,
    pub status: EventStatus,
    pub participants: Vec<CharacterId>,
    /// Chapter in which the event entered the ledger.
    pub chapter: u32,
    pub completed_chapter: Option<u32>,
}

/// A beat reported by chapter analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    pub unique_key: String,
    pub kind: EventKind,
    pub title: String,
    pub description: String,
    pub status: EventStatus,
    pub participants: Vec<CharacterId>,
}

/// Proposed timeline changes for one chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineUpdate {
    pub events: Vec<ProposedEvent>,
}

/// A proposal that would have completed an already completed beat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicationWarning {
    pub unique_key: String,
    /// The event that already holds the key.
    pub existing_event: String,
    pub existing_chapter: Option<u32>,
    /// Title of the rejected proposal.
    pub duplicate_title: String,
    pub chapter: u32,
}

impl std::fmt::Display for DuplicationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "chapter {} re-narrates '{}' ({}), already completed by {}",
            self.chapter, self.duplicate_title, self.unique_key, self.existing_event
        )
    }
}

/// Result of [`TimelineLedger::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineApplied {
    pub ledger: TimelineLedger,
    pub warnings: Vec<DuplicationWarning>,
}

/// All timeline events for a book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimelineLedger {
    pub events: Vec<TimelineEvent>,
    pub version: u64,
    pub last_updated_chapter: u32,
}

/// Canonical form of a unique key: trimmed, lowercase, single spaces.
pub fn normalize_key(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl TimelineLedger {
    pub fn stamp(&self) -> StoreStamp {
        StoreStamp::new(self.version, self.last_updated_chapter)
    }

    /// The live (non-cancelled) event holding `key`.
    pub fn find_live(&self, key: &str) -> Option<&TimelineEvent> {
        let key = normalize_key(key);
        self.events
            .iter()
            .find(|e| e.unique_key == key && e.status != EventStatus::Cancelled)
    }

    pub fn in_progress(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events
            .iter()
            .filter(|e| e.status == EventStatus::InProgress)
    }

    pub fn upcoming(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events
            .iter()
            .filter(|e| matches!(e.status, EventStatus::Planned | EventStatus::Foreshadowed))
    }

    pub fn completed(&self) -> impl Iterator<Item = &TimelineEvent> {
        self.events
            .iter()
            .filter(|e| e.status == EventStatus::Completed)
    }

    /// Apply the beats observed in `chapter`.
    ///
    /// A proposal whose key is already live advances that event along the
    /// lattice. A proposal that claims a key whose event is already completed
    /// is rejected with a [`DuplicationWarning`].
    pub fn apply(&self, update: &TimelineUpdate, chapter: u32) -> TimelineApplied {
        let mut next = self.clone();
        let mut warnings = Vec::new();
        let mut changed = false;
        let mut seq = next
            .events
            .iter()
            .filter(|e| e.id.starts_with(&format!("e{chapter}-")))
            .count();

        for proposal in &update.events {
            let key = normalize_key(&proposal.unique_key);
            if key.is_empty() {
                continue;
            }

            let live = next
                .events
                .iter()
                .position(|e| e.unique_key == key && e.status != EventStatus::Cancelled);

            match live {
                Some(pos) => {
                    let existing = &next.events[pos];
                    // A completed beat may still be retracted; any other proposal is a replay.
                    if existing.status == EventStatus::Completed && proposal.status != EventStatus::Cancelled {
                        if proposal.status.is_claiming() {
                            let warning = DuplicationWarning {
                                unique_key: key.clone(),
                                existing_event: existing.id.clone(),
                                existing_chapter: existing.completed_chapter,
                                duplicate_title: proposal.title.clone(),
                                chapter,
                            };
                            warn!(%warning, "Duplicate story beat rejected");
                            warnings.push(warning);
                        }
                        continue;
                    }
                    if !existing.status.can_transition(proposal.status) {
                        debug!(key = %key, from = ?existing.status, to = ?proposal.status, "Ignoring backward timeline transition");
                        continue;
                    }
                    let event = &mut next.events[pos];
                    event.status = proposal.status;
                    if proposal.status == EventStatus::Completed {
                        event.completed_chapter = Some(chapter);
                    }
                    for participant in &proposal.participants {
                        if !event.participants.contains(participant) {
                            event.participants.push(participant.clone());
                        }
                    }
                    changed = true;
                }
                None => {
                    seq += 1;
                    next.events.push(TimelineEvent {
                        id: format!("e{chapter}-{seq}"),
                        unique_key: key,
                        kind: proposal.kind,
                        title: proposal.title.trim().to_string(),
                        description: proposal.description.trim().to_string(),
                        status: proposal.status,
                        participants: proposal.participants.clone(),
                        chapter,
                        completed_chapter: (proposal.status == EventStatus::Completed)
                            .then_some(chapter),
                    });
                    changed = true;
                }
            }
        }

        if changed {
            next.version += 1;
            next.last_updated_chapter = next.last_updated_chapter.max(chapter);
        }
        TimelineApplied {
            ledger: next,
            warnings,
        }
    }
}

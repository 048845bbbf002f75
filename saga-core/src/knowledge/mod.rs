//! Knowledge stores.
//!
//! Four independently evolving records that feed the context engine:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      KnowledgeBundle                          │
//! │                                                               │
//! │  ┌────────────────────────┐   ┌────────────────────────────┐  │
//! │  │ CharacterStateRegistry │   │ PlotGraph                  │  │
//! │  │ (id → snapshot)        │   │ (threads, edges, urgency)  │  │
//! │  └────────────────────────┘   └────────────────────────────┘  │
//! │  ┌────────────────────────┐   ┌────────────────────────────┐  │
//! │  │ TimelineLedger         │   │ NarrativeArc               │  │
//! │  │ (unique-key beats)     │   │ (planned/observed pacing)  │  │
//! │  └────────────────────────┘   └────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Stores are plain data. Each exposes a pure `apply` reducer that returns a
//! new store; [`analysis::KnowledgeAnalyzer`] produces the proposals.

pub mod analysis;
mod character;
mod pacing;
mod plot;
mod timeline;

pub use analysis::{KnowledgeAnalyzer, KnowledgeUpdate};
pub use character::{
    CharacterChange, CharacterField, CharacterProfile, CharacterSnapshot, CharacterStateRegistry,
    CharacterUpdate, FieldChange, PhysicalState, PsychologicalState, Relationship,
    RelationshipGraph, SocialState, RECENT_CHANGES,
};
pub use pacing::{NarrativeArc, PacingBeat, PacingObservation, PacingType};
pub use plot::{
    EdgeKind, NewPlotEdge, NewPlotNode, PlotEdge, PlotGraph, PlotNode, PlotNodeKind, PlotStatus,
    PlotUpdate, StatusChange, Urgency, UrgencyLevel,
};
pub use timeline::{
    normalize_key, DuplicationWarning, EventKind, EventStatus, ProposedEvent, TimelineApplied,
    TimelineEvent, TimelineLedger, TimelineUpdate,
};

use crate::outline::Outline;
use serde::{Deserialize, Serialize};

/// Change counters of one store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreStamp {
    pub version: u64,
    pub last_updated_chapter: u32,
}

impl StoreStamp {
    pub const fn new(version: u64, last_updated_chapter: u32) -> Self {
        Self {
            version,
            last_updated_chapter,
        }
    }
}

/// Which knowledge store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Characters,
    Plot,
    Timeline,
    Arc,
}

impl StoreKind {
    pub const ALL: [StoreKind; 4] = [
        StoreKind::Characters,
        StoreKind::Plot,
        StoreKind::Timeline,
        StoreKind::Arc,
    ];
}

/// Stamps of all four stores at one moment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreVersions {
    pub characters: StoreStamp,
    pub plot: StoreStamp,
    pub timeline: StoreStamp,
    pub arc: StoreStamp,
}

impl StoreVersions {
    pub fn get(&self, kind: StoreKind) -> StoreStamp {
        match kind {
            StoreKind::Characters => self.characters,
            StoreKind::Plot => self.plot,
            StoreKind::Timeline => self.timeline,
            StoreKind::Arc => self.arc,
        }
    }
}

/// The four knowledge stores of one book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBundle {
    pub characters: CharacterStateRegistry,
    pub plot: PlotGraph,
    pub timeline: TimelineLedger,
    pub arc: NarrativeArc,
}

impl KnowledgeBundle {
    /// Fresh stores for a book that has no committed chapters yet.
    pub fn initial(graph: &RelationshipGraph, outline: &Outline) -> Self {
        Self {
            characters: CharacterStateRegistry::from_graph(graph),
            plot: PlotGraph::default(),
            timeline: TimelineLedger::default(),
            arc: NarrativeArc::from_outline(outline),
        }
    }

    pub fn versions(&self) -> StoreVersions {
        StoreVersions {
            characters: self.characters.stamp(),
            plot: self.plot.stamp(),
            timeline: self.timeline.stamp(),
            arc: self.arc.stamp(),
        }
    }
}

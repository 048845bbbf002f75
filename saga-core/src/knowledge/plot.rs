//! Plot graph: threads, foreshadowing and how they connect.

use super::StoreStamp;
use crate::ids::CharacterId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotNodeKind {
    Event,
    Foreshadowing,
    Secret,
    Conflict,
    Resolution,
    Revelation,
    TurningPoint,
}

impl PlotNodeKind {
    pub const TABLE: &'static [(&'static str, PlotNodeKind)] = &[
        ("event", PlotNodeKind::Event),
        ("foreshadowing", PlotNodeKind::Foreshadowing),
        ("secret", PlotNodeKind::Secret),
        ("conflict", PlotNodeKind::Conflict),
        ("resolution", PlotNodeKind::Resolution),
        ("revelation", PlotNodeKind::Revelation),
        ("turning_point", PlotNodeKind::TurningPoint),
    ];

    /// Kinds that make up a main plot line.
    pub fn is_main_line(&self) -> bool {
        matches!(
            self,
            PlotNodeKind::Conflict | PlotNodeKind::Secret | PlotNodeKind::TurningPoint
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotStatus {
    Active,
    Resolved,
    Abandoned,
    Transformed,
}

impl PlotStatus {
    pub const TABLE: &'static [(&'static str, PlotStatus)] = &[
        ("active", PlotStatus::Active),
        ("resolved", PlotStatus::Resolved),
        ("abandoned", PlotStatus::Abandoned),
        ("transformed", PlotStatus::Transformed),
    ];

    /// Whether the thread is still open.
    pub fn is_open(&self) -> bool {
        matches!(self, PlotStatus::Active | PlotStatus::Transformed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Causes,
    Enables,
    Blocks,
    Foreshadows,
    Resolves,
    Contradicts,
    Parallels,
}

impl EdgeKind {
    pub const TABLE: &'static [(&'static str, EdgeKind)] = &[
        ("causes", EdgeKind::Causes),
        ("enables", EdgeKind::Enables),
        ("blocks", EdgeKind::Blocks),
        ("foreshadows", EdgeKind::Foreshadows),
        ("resolves", EdgeKind::Resolves),
        ("contradicts", EdgeKind::Contradicts),
        ("parallels", EdgeKind::Parallels),
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotNode {
    pub id: String,
    pub kind: PlotNodeKind,
    pub title: String,
    pub description: String,
    pub introduced_chapter: u32,
    /// 1..=10.
    pub importance: u8,
    pub status: PlotStatus,
    pub participants: Vec<CharacterId>,
    pub closed_chapter: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

// ============================================================================
// Urgency
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UrgencyLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// How overdue an open foreshadowing thread is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Urgency {
    pub score: f64,
    pub level: UrgencyLevel,
}

impl Urgency {
    /// `importance × age / 10`, bucketed at 6 / 12 / 20.
    pub fn compute(age: u32, importance: u8) -> Self {
        let score = f64::from(importance.clamp(1, 10)) * f64::from(age) / 10.0;
        let level = if score >= 20.0 {
            UrgencyLevel::Critical
        } else if score >= 12.0 {
            UrgencyLevel::High
        } else if score >= 6.0 {
            UrgencyLevel::Medium
        } else {
            UrgencyLevel::Low
        };
        Self { score, level }
    }
}

// ============================================================================
// Proposals
// ============================================================================

/// A thread introduced by a chapter.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlotNode {
    /// Reference used by edges in the same update; defaults to the title.
    pub key: String,
    pub kind: PlotNodeKind,
    pub title: String,
    pub description: String,
    pub importance: u8,
    pub participants: Vec<CharacterId>,
}

/// A status change for an existing node, referenced by id or title.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub node: String,
    pub status: PlotStatus,
}

/// A new edge between nodes referenced by id, title or new-node key.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPlotEdge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
}

/// Proposed plot changes for one chapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlotUpdate {
    pub new_nodes: Vec<NewPlotNode>,
    pub status_changes: Vec<StatusChange>,
    pub new_edges: Vec<NewPlotEdge>,
}

impl PlotUpdate {
    pub fn is_empty(&self) -> bool {
        self.new_nodes.is_empty() && self.status_changes.is_empty() && self.new_edges.is_empty()
    }
}

// ============================================================================
// Graph
// ============================================================================

/// The plot graph of a book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlotGraph {
    pub nodes: BTreeMap<String, PlotNode>,
    pub edges: Vec<PlotEdge>,
    /// Ids of open nodes. Kept in sync with node statuses by every `apply`.
    pub active_lines: BTreeSet<String>,
    pub version: u64,
    pub last_updated_chapter: u32,
}

impl PlotGraph {
    pub fn stamp(&self) -> StoreStamp {
        StoreStamp::new(self.version, self.last_updated_chapter)
    }

    pub fn get(&self, id: &str) -> Option<&PlotNode> {
        self.nodes.get(id)
    }

    /// Resolve a node reference by id or (case-insensitive) title.
    pub fn resolve(&self, reference: &str) -> Option<&str> {
        let reference = reference.trim();
        if let Some((id, _)) = self.nodes.get_key_value(reference) {
            return Some(id.as_str());
        }
        let lowered = reference.to_lowercase();
        self.nodes
            .values()
            .find(|n| n.title.to_lowercase() == lowered)
            .map(|n| n.id.as_str())
    }

    /// Open nodes, in id order.
    pub fn active_nodes(&self) -> impl Iterator<Item = &PlotNode> {
        self.active_lines.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Urgency of an open foreshadowing node at `chapter`.
    pub fn urgency(&self, node: &PlotNode, chapter: u32) -> Option<Urgency> {
        if node.kind != PlotNodeKind::Foreshadowing || !node.status.is_open() {
            return None;
        }
        let age = chapter.saturating_sub(node.introduced_chapter);
        Some(Urgency::compute(age, node.importance))
    }

    /// Open foreshadowing, most urgent first.
    pub fn foreshadowing_by_urgency(&self, chapter: u32) -> Vec<(&PlotNode, Urgency)> {
        let mut items: Vec<_> = self
            .active_nodes()
            .filter_map(|n| self.urgency(n, chapter).map(|u| (n, u)))
            .collect();
        items.sort_by(|a, b| b.1.score.total_cmp(&a.1.score).then_with(|| a.0.id.cmp(&b.0.id)));
        items
    }

    /// Apply the changes observed in `chapter`.
    pub fn apply(&self, update: &PlotUpdate, chapter: u32) -> Self {
        let mut next = self.clone();
        let mut changed = false;
        let mut new_keys: BTreeMap<String, String> = BTreeMap::new();
        let mut seq = next
            .nodes
            .keys()
            .filter(|id| id.starts_with(&format!("p{chapter}-")))
            .count();

        for proposal in &update.new_nodes {
            if proposal.title.trim().is_empty() {
                continue;
            }
            if let Some(existing) = next.resolve(&proposal.title) {
                // Same thread reported again.
                new_keys.insert(proposal.key.to_lowercase(), existing.to_string());
                continue;
            }
            seq += 1;
            let id = format!("p{chapter}-{seq}");
            next.nodes.insert(
                id.clone(),
                PlotNode {
                    id: id.clone(),
                    kind: proposal.kind,
                    title: proposal.title.trim().to_string(),
                    description: proposal.description.trim().to_string(),
                    introduced_chapter: chapter,
                    importance: proposal.importance.clamp(1, 10),
                    status: PlotStatus::Active,
                    participants: proposal.participants.clone(),
                    closed_chapter: None,
                },
            );
            new_keys.insert(proposal.key.to_lowercase(), id);
            changed = true;
        }

        let lookup = |graph: &PlotGraph, reference: &str| -> Option<String> {
            new_keys
                .get(&reference.trim().to_lowercase())
                .cloned()
                .or_else(|| graph.resolve(reference).map(str::to_string))
        };

        for status_change in &update.status_changes {
            let Some(id) = lookup(&next, &status_change.node) else {
                debug!(node = %status_change.node, "Ignoring status change for unknown plot node");
                continue;
            };
            if next.transition(&id, status_change.status, chapter) {
                changed = true;
            }
        }

        for edge in &update.new_edges {
            let (Some(from), Some(to)) = (lookup(&next, &edge.from), lookup(&next, &edge.to)) else {
                debug!(from = %edge.from, to = %edge.to, "Ignoring edge with unknown endpoint");
                continue;
            };
            if from == to {
                continue;
            }
            let plot_edge = PlotEdge {
                from: from.clone(),
                to: to.clone(),
                kind: edge.kind,
            };
            if !next.edges.contains(&plot_edge) {
                next.edges.push(plot_edge);
                changed = true;
            }
            if edge.kind == EdgeKind::Resolves && next.transition(&to, PlotStatus::Resolved, chapter) {
                changed = true;
            }
        }

        next.active_lines = next
            .nodes
            .values()
            .filter(|n| n.status.is_open())
            .map(|n| n.id.clone())
            .collect();

        if changed {
            next.version += 1;
            next.last_updated_chapter = next.last_updated_chapter.max(chapter);
        }
        next
    }

    /// Move a node to `status` if the transition is allowed.
    ///
    /// Resolved and abandoned nodes are closed for good.
    fn transition(&mut self, id: &str, status: PlotStatus, chapter: u32) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        if !node.status.is_open() || node.status == status {
            return false;
        }
        node.status = status;
        if !status.is_open() {
            node.closed_chapter = Some(chapter);
            self.active_lines.remove(id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(key: &str, kind: PlotNodeKind, importance: u8) -> NewPlotNode {
        NewPlotNode {
            key: key.into(),
            kind,
            title: key.into(),
            description: format!("{key} description"),
            importance,
            participants: vec![],
        }
    }

    fn seeded() -> PlotGraph {
        PlotGraph::default().apply(
            &PlotUpdate {
                new_nodes: vec![
                    node("玉佩之谜", PlotNodeKind::Foreshadowing, 8),
                    node("宗门之争", PlotNodeKind::Conflict, 7),
                ],
                ..PlotUpdate::default()
            },
            2,
        )
    }

    #[test]
    fn test_new_nodes_are_active() {
        let graph = seeded();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.active_lines.len(), 2);
        assert!(graph.get("p2-1").is_some());
        assert_eq!(graph.version, 1);
    }

    #[test]
    fn test_resolution_leaves_active_index() {
        let graph = seeded();
        let next = graph.apply(
            &PlotUpdate {
                status_changes: vec![StatusChange {
                    node: "宗门之争".into(),
                    status: PlotStatus::Resolved,
                }],
                ..PlotUpdate::default()
            },
            9,
        );
        let id = next.resolve("宗门之争").unwrap().to_string();
        assert!(!next.active_lines.contains(&id));
        assert_eq!(next.get(&id).unwrap().closed_chapter, Some(9));

        // Closed threads do not reopen.
        let reopened = next.apply(
            &PlotUpdate {
                status_changes: vec![StatusChange {
                    node: id.clone(),
                    status: PlotStatus::Active,
                }],
                ..PlotUpdate::default()
            },
            10,
        );
        assert_eq!(reopened.get(&id).unwrap().status, PlotStatus::Resolved);
        assert_eq!(reopened.version, next.version);
    }

    #[test]
    fn test_resolves_edge_closes_target() {
        let graph = seeded();
        let next = graph.apply(
            &PlotUpdate {
                new_nodes: vec![node("真相大白", PlotNodeKind::Revelation, 9)],
                new_edges: vec![NewPlotEdge {
                    from: "真相大白".into(),
                    to: "玉佩之谜".into(),
                    kind: EdgeKind::Resolves,
                }],
                ..PlotUpdate::default()
            },
            20,
        );
        let target = next.resolve("玉佩之谜").unwrap();
        assert_eq!(next.get(target).unwrap().status, PlotStatus::Resolved);
        assert_eq!(next.edges.len(), 1);
    }

    #[test]
    fn test_urgency_grows_with_age() {
        let graph = seeded();
        let node = graph.get(graph.resolve("玉佩之谜").unwrap()).unwrap();
        assert_eq!(graph.urgency(node, 4).unwrap().level, UrgencyLevel::Low);
        assert_eq!(graph.urgency(node, 12).unwrap().level, UrgencyLevel::Medium);
        assert_eq!(graph.urgency(node, 20).unwrap().level, UrgencyLevel::High);
        assert_eq!(graph.urgency(node, 30).unwrap().level, UrgencyLevel::Critical);

        let conflict = graph.get(graph.resolve("宗门之争").unwrap()).unwrap();
        assert!(graph.urgency(conflict, 30).is_none());
    }
}

//! Narrative pacing arc.
//!
//! The arc holds a planned beat for every chapter (derived from the outline)
//! and the beats actually observed in committed chapters.

use super::StoreStamp;
use crate::outline::Outline;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The dramatic function of a chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingType {
    Setup,
    Rising,
    Action,
    Climax,
    Falling,
    Breather,
    Resolution,
}

impl PacingType {
    pub const ALL: [PacingType; 7] = [
        PacingType::Setup,
        PacingType::Rising,
        PacingType::Action,
        PacingType::Climax,
        PacingType::Falling,
        PacingType::Breather,
        PacingType::Resolution,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PacingType::Setup => "setup",
            PacingType::Rising => "rising",
            PacingType::Action => "action",
            PacingType::Climax => "climax",
            PacingType::Falling => "falling",
            PacingType::Breather => "breather",
            PacingType::Resolution => "resolution",
        }
    }

    /// Lenient parse of a model-provided label.
    pub fn parse(raw: &str) -> Option<Self> {
        let lowered = raw.trim().to_lowercase();
        let found = match lowered.as_str() {
            "setup" | "opening" | "introduction" | "铺垫" | "开端" => PacingType::Setup,
            "rising" | "rising_action" | "build" | "buildup" | "发展" | "上升" => PacingType::Rising,
            "action" | "conflict" | "battle" | "冲突" | "战斗" => PacingType::Action,
            "climax" | "peak" | "高潮" => PacingType::Climax,
            "falling" | "falling_action" | "aftermath" | "回落" => PacingType::Falling,
            "breather" | "rest" | "calm" | "slice_of_life" | "舒缓" | "日常" => PacingType::Breather,
            "resolution" | "ending" | "denouement" | "结局" | "收束" => PacingType::Resolution,
            _ => return None,
        };
        Some(found)
    }

    /// Action and climax chapters.
    pub fn is_high_intensity(&self) -> bool {
        matches!(self, PacingType::Action | PacingType::Climax)
    }

    /// Target tension on a 0..=10 scale.
    pub fn default_tension(&self) -> u8 {
        match self {
            PacingType::Setup => 3,
            PacingType::Rising => 5,
            PacingType::Action => 7,
            PacingType::Climax => 9,
            PacingType::Falling => 5,
            PacingType::Breather => 3,
            PacingType::Resolution => 4,
        }
    }

    /// Writing guidance for this pacing type.
    pub fn guidance(&self) -> &'static str {
        match self {
            PacingType::Setup => {
                "Establish place, stakes and the protagonist's want. Introduce at most one new thread."
            }
            PacingType::Rising => {
                "Escalate an existing conflict. End on a complication that raises the stakes."
            }
            PacingType::Action => {
                "Favor short paragraphs and concrete physical beats. Keep exposition minimal."
            }
            PacingType::Climax => {
                "Pay off prior foreshadowing. Force the decisive choice; consequences must land on the page."
            }
            PacingType::Falling => {
                "Show the cost of the last confrontation. Let characters react and regroup."
            }
            PacingType::Breather => {
                "Lower the tension. Deepen relationships and plant seeds for the next arc."
            }
            PacingType::Resolution => "Close the main threads and deliver the final emotional beat.",
        }
    }
}

impl std::fmt::Display for PacingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A planned or observed beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingBeat {
    pub chapter: u32,
    pub pacing: PacingType,
    /// 0..=10.
    pub tension: u8,
}

impl PacingBeat {
    pub fn new(chapter: u32, pacing: PacingType) -> Self {
        Self {
            chapter,
            pacing,
            tension: pacing.default_tension(),
        }
    }
}

/// What a committed chapter actually delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingObservation {
    pub pacing: PacingType,
    pub tension: u8,
}

/// Planned and observed pacing for a book.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarrativeArc {
    pub total_chapters: u32,
    pub planned: BTreeMap<u32, PacingBeat>,
    pub observed: Vec<PacingBeat>,
    pub version: u64,
    pub last_updated_chapter: u32,
}

impl NarrativeArc {
    /// Plan the arc from an outline.
    ///
    /// Explicit pacing hints win. Milestone chapters become climaxes flanked
    /// by an action lead-in and a falling aftermath. Everything else follows
    /// a default curve by position in the book.
    pub fn from_outline(outline: &Outline) -> Self {
        let total = outline.target_chapters.max(1);
        let mut planned = BTreeMap::new();

        for chapter in 1..=total {
            planned.insert(chapter, PacingBeat::new(chapter, default_curve(chapter, total)));
        }
        for milestone in &outline.milestones {
            let m = milestone.chapter;
            if m == 0 || m > total {
                continue;
            }
            if m > 1 && !outline.is_milestone(m - 1) {
                planned.insert(m - 1, PacingBeat::new(m - 1, PacingType::Action));
            }
            if m < total && !outline.is_milestone(m + 1) {
                planned.insert(m + 1, PacingBeat::new(m + 1, PacingType::Falling));
            }
        }
        for milestone in &outline.milestones {
            if (1..=total).contains(&milestone.chapter) {
                planned.insert(
                    milestone.chapter,
                    PacingBeat::new(milestone.chapter, PacingType::Climax),
                );
            }
        }
        for chapter in &outline.chapters {
            if let Some(hint) = chapter.pacing_hint {
                if (1..=total).contains(&chapter.index) {
                    planned.insert(chapter.index, PacingBeat::new(chapter.index, hint));
                }
            }
        }

        Self {
            total_chapters: total,
            planned,
            observed: Vec::new(),
            version: 0,
            last_updated_chapter: 0,
        }
    }

    pub fn stamp(&self) -> StoreStamp {
        StoreStamp::new(self.version, self.last_updated_chapter)
    }

    /// The beat to write for `chapter`.
    ///
    /// Follows the plan, except that after two consecutive high-intensity
    /// observed chapters a planned high-intensity beat becomes a breather.
    /// Planned climaxes and the resolution are never displaced.
    pub fn pacing_for(&self, chapter: u32) -> PacingBeat {
        let planned = self
            .planned
            .get(&chapter)
            .copied()
            .unwrap_or_else(|| PacingBeat::new(chapter, default_curve(chapter, self.total_chapters.max(chapter))));

        if matches!(planned.pacing, PacingType::Climax | PacingType::Resolution) {
            return planned;
        }
        if chapter >= 3 && planned.pacing.is_high_intensity() {
            let intense = |c: u32| {
                self.observed
                    .iter()
                    .any(|b| b.chapter == c && b.pacing.is_high_intensity())
            };
            if intense(chapter - 1) && intense(chapter - 2) {
                return PacingBeat::new(chapter, PacingType::Breather);
            }
        }
        planned
    }

    /// Observed beats, most recent last.
    pub fn recent_observed(&self, count: usize) -> &[PacingBeat] {
        let start = self.observed.len().saturating_sub(count);
        &self.observed[start..]
    }

    /// Record what `chapter` delivered.
    ///
    /// Observations for chapters earlier than the newest recorded one are
    /// ignored; a repeat observation for the same chapter replaces it.
    pub fn apply(&self, observation: PacingObservation, chapter: u32) -> Self {
        let mut next = self.clone();
        if let Some(last) = next.observed.last() {
            if chapter < last.chapter {
                return next;
            }
            if chapter == last.chapter {
                next.observed.pop();
            }
        }
        next.observed.push(PacingBeat {
            chapter,
            pacing: observation.pacing,
            tension: observation.tension.min(10),
        });
        next.version += 1;
        next.last_updated_chapter = next.last_updated_chapter.max(chapter);
        next
    }
}

fn default_curve(chapter: u32, total: u32) -> PacingType {
    if chapter >= total && total > 1 {
        return PacingType::Resolution;
    }
    let position = chapter as f64 / total.max(1) as f64;
    if chapter == 1 || position <= 0.1 {
        PacingType::Setup
    } else if position >= 0.9 {
        PacingType::Climax
    } else if chapter % 10 == 0 {
        PacingType::Action
    } else if chapter % 10 == 5 {
        PacingType::Breather
    } else {
        PacingType::Rising
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::{Milestone, OutlineChapter};

    fn outline(total: u32, milestones: &[u32]) -> Outline {
        Outline {
            title: "测试".into(),
            target_chapters: total,
            chapters: (1..=total)
                .map(|i| OutlineChapter {
                    index: i,
                    title: format!("第{i}章"),
                    goal: String::new(),
                    pacing_hint: None,
                })
                .collect(),
            milestones: milestones
                .iter()
                .map(|&chapter| Milestone {
                    chapter,
                    description: "turning point".into(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_milestones_become_climaxes() {
        let arc = NarrativeArc::from_outline(&outline(50, &[25]));
        assert_eq!(arc.pacing_for(25).pacing, PacingType::Climax);
        assert_eq!(arc.pacing_for(24).pacing, PacingType::Action);
        assert_eq!(arc.pacing_for(26).pacing, PacingType::Falling);
        assert_eq!(arc.pacing_for(1).pacing, PacingType::Setup);
        assert_eq!(arc.pacing_for(50).pacing, PacingType::Resolution);
    }

    #[test]
    fn test_breather_after_two_intense_chapters() {
        let arc = NarrativeArc::from_outline(&outline(100, &[]));
        assert_eq!(arc.pacing_for(30).pacing, PacingType::Action);

        let action = PacingObservation {
            pacing: PacingType::Action,
            tension: 8,
        };
        let arc = arc.apply(action, 28).apply(action, 29);
        assert_eq!(arc.pacing_for(30).pacing, PacingType::Breather);
        assert_eq!(arc.version, 2);
        assert_eq!(arc.last_updated_chapter, 29);
    }

    #[test]
    fn test_apply_ignores_stale_observations() {
        let arc = NarrativeArc::from_outline(&outline(10, &[]));
        let beat = PacingObservation {
            pacing: PacingType::Rising,
            tension: 5,
        };
        let arc = arc.apply(beat, 4);
        let same = arc.apply(beat, 3);
        assert_eq!(same, arc);
    }

    #[test]
    fn test_parse_labels() {
        assert_eq!(PacingType::parse("Climax"), Some(PacingType::Climax));
        assert_eq!(PacingType::parse("高潮"), Some(PacingType::Climax));
        assert_eq!(PacingType::parse("unknown"), None);
    }
}

//! Token estimation and per-section budget allocation.

use crate::knowledge::PacingType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A section of the assembled context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Setting,
    Characters,
    Plot,
    Timeline,
    Summary,
    RecentProse,
    Pacing,
}

impl Section {
    /// All sections in assembly order.
    pub const ALL: [Section; 7] = [
        Section::Setting,
        Section::Characters,
        Section::Plot,
        Section::Timeline,
        Section::Summary,
        Section::RecentProse,
        Section::Pacing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Setting => "setting",
            Section::Characters => "characters",
            Section::Plot => "plot",
            Section::Timeline => "timeline",
            Section::Summary => "summary",
            Section::RecentProse => "recent_prose",
            Section::Pacing => "pacing",
        }
    }

    /// Parse a configuration key such as `recent_prose`.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase().replace('-', "_");
        Section::ALL.into_iter().find(|s| s.as_str() == name)
    }

    pub fn heading(&self) -> &'static str {
        match self {
            Section::Setting => "World setting",
            Section::Characters => "Character state",
            Section::Plot => "Plot threads",
            Section::Timeline => "Timeline",
            Section::Summary => "Story so far",
            Section::RecentProse => "Recent chapters",
            Section::Pacing => "Pacing guide",
        }
    }

    fn base_fraction(&self) -> f64 {
        match self {
            Section::Setting => 0.15,
            Section::Characters => 0.15,
            Section::Plot => 0.12,
            Section::Timeline => 0.08,
            Section::Summary => 0.15,
            Section::RecentProse => 0.30,
            Section::Pacing => 0.05,
        }
    }

    /// Multiplier applied to this section's fraction for `pacing`.
    fn pacing_factor(&self, pacing: PacingType) -> f64 {
        use PacingType::*;
        use Section::*;
        match (pacing, *self) {
            (Action, Setting) => 0.6,
            (Action, Characters) => 0.9,
            (Action, Plot) => 1.1,
            (Action, Summary) => 0.8,
            (Action, RecentProse) => 1.4,

            (Climax, Setting) => 0.5,
            (Climax, Plot) => 1.3,
            (Climax, Timeline) => 1.2,
            (Climax, Summary) => 0.8,
            (Climax, RecentProse) => 1.4,

            (Setup, Setting) => 1.5,
            (Setup, Characters) => 1.2,
            (Setup, Plot) => 0.9,
            (Setup, Timeline) => 0.9,
            (Setup, Summary) => 0.8,
            (Setup, RecentProse) => 0.8,

            (Rising, Plot) => 1.1,

            (Falling, Characters) => 1.2,
            (Falling, Summary) => 1.1,

            (Breather, Setting) => 1.1,
            (Breather, Characters) => 1.3,
            (Breather, Plot) => 0.9,
            (Breather, Timeline) => 0.8,

            (Resolution, Setting) => 0.7,
            (Resolution, Plot) => 1.4,
            (Resolution, Timeline) => 1.3,
            (Resolution, Summary) => 1.2,
            (Resolution, RecentProse) => 0.9,

            _ => 1.0,
        }
    }
}

/// Approximate token count of `text`.
///
/// CJK ideographs, kana, hangul and fullwidth punctuation weigh 1.5; other
/// visible characters 0.25; whitespace 0.1. Never treat this as exact.
pub fn estimate_tokens(text: &str) -> usize {
    let weight: f64 = text.chars().map(char_weight).sum();
    weight.ceil() as usize
}

pub(crate) fn char_weight(c: char) -> f64 {
    if is_cjk(c) {
        1.5
    } else if c.is_whitespace() {
        0.1
    } else {
        0.25
    }
}

/// CJK ideographs, kana, hangul, CJK punctuation and fullwidth forms.
pub fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3000}'..='\u{303F}'
        | '\u{3040}'..='\u{30FF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{AC00}'..='\u{D7AF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{FF00}'..='\u{FFEF}'
    )
}

/// Total token budget and its split across sections.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextBudget {
    pub total_tokens: usize,
    allocation: BTreeMap<Section, f64>,
}

impl ContextBudget {
    /// Default split over `total_tokens`.
    pub fn new(total_tokens: usize) -> Self {
        let allocation = Section::ALL.iter().map(|s| (*s, s.base_fraction())).collect();
        Self {
            total_tokens,
            allocation,
        }
    }

    /// Default split with some fractions overridden, renormalized.
    pub fn with_overrides(total_tokens: usize, overrides: &BTreeMap<Section, f64>) -> Self {
        let mut budget = Self::new(total_tokens);
        for (section, fraction) in overrides {
            budget.allocation.insert(*section, fraction.max(0.0));
        }
        budget.allocation = normalize(budget.allocation);
        budget
    }

    /// Adjust the split for a chapter of the given pacing.
    pub fn for_pacing(&self, pacing: PacingType) -> Self {
        let scaled = self
            .allocation
            .iter()
            .map(|(section, fraction)| (*section, fraction * section.pacing_factor(pacing)))
            .collect();
        Self {
            total_tokens: self.total_tokens,
            allocation: normalize(scaled),
        }
    }

    pub fn fraction(&self, section: Section) -> f64 {
        self.allocation.get(&section).copied().unwrap_or(0.0)
    }

    pub fn fractions(&self) -> &BTreeMap<Section, f64> {
        &self.allocation
    }

    pub fn tokens_for(&self, section: Section) -> usize {
        (self.total_tokens as f64 * self.fraction(section)).floor() as usize
    }
}

fn normalize(allocation: BTreeMap<Section, f64>) -> BTreeMap<Section, f64> {
    let sum: f64 = allocation.values().filter(|v| v.is_finite()).sum();
    if sum <= 0.0 {
        let uniform = 1.0 / Section::ALL.len() as f64;
        return Section::ALL.iter().map(|s| (*s, uniform)).collect();
    }
    allocation
        .into_iter()
        .map(|(s, v)| (s, if v.is_finite() { v / sum } else { 0.0 }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_weights_cjk() {
        assert_eq!(estimate_tokens(""), 0);
        // 4 × 1.5
        assert_eq!(estimate_tokens("林风出山"), 6);
        // 4 × 0.25 + 1 × 0.1 + 4 × 0.25 = 2.1
        assert_eq!(estimate_tokens("word word"), 3);
        // fullwidth punctuation counts as CJK
        assert_eq!(estimate_tokens("，。"), 3);
    }

    #[test]
    fn test_base_allocation_sums_to_one() {
        let budget = ContextBudget::new(10_000);
        let sum: f64 = budget.fractions().values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_every_pacing_allocation_sums_to_one() {
        let budget = ContextBudget::new(10_000);
        for pacing in PacingType::ALL {
            let adjusted = budget.for_pacing(pacing);
            let sum: f64 = adjusted.fractions().values().sum();
            assert!((sum - 1.0).abs() < 1e-9, "{pacing:?} sums to {sum}");
            assert!(adjusted.fractions().values().all(|f| *f >= 0.0));
        }
    }

    #[test]
    fn test_action_shifts_toward_recent_prose() {
        let budget = ContextBudget::new(10_000);
        let action = budget.for_pacing(PacingType::Action);
        assert!(action.fraction(Section::RecentProse) > budget.fraction(Section::RecentProse));
        assert!(action.fraction(Section::Setting) < budget.fraction(Section::Setting));
    }

    #[test]
    fn test_overrides_are_renormalized() {
        let mut overrides = BTreeMap::new();
        overrides.insert(Section::RecentProse, 3.0);
        let budget = ContextBudget::with_overrides(1_000, &overrides);
        let sum: f64 = budget.fractions().values().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(budget.fraction(Section::RecentProse) > 0.7);
    }
}

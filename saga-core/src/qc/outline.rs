use super::{IssueKind, QcIssue, QcVerdict, Severity};
use crate::completion::{CompletionRequest, TextCompletion};
use crate::config::OutlineConfig;
use crate::context::is_cjk;
use crate::error::{Result, SchemaError};
use crate::outline::Outline;
use crate::schema::{self, f64_any, objects_any, str_any};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Dimension weights of the outline score.
pub const OUTLINE_WEIGHTS: [(&str, f64); 4] = [
    ("coverage", 0.35),
    ("title_quality", 0.20),
    ("goal_quality", 0.30),
    ("milestones", 0.15),
];

/// Share of the final score kept by the structural dimensions when the deep
/// review runs.
const STRUCTURAL_SHARE: f64 = 0.7;

/// A goal needs at least this many words to count as substantive.
const MIN_GOAL_WORDS: usize = 6;

/// One milestone is expected per this many chapters.
const CHAPTERS_PER_MILESTONE: u32 = 50;

const PLACEHOLDERS: &[&str] = &[
    "", "tbd", "todo", "untitled", "title", "chapter", "标题", "待定", "无题", "未命名", "章节", "...", "…",
];

const REVIEW_SYSTEM: &str = "You review outlines for serialized novels. \
Judge whether the arc holds together across the whole book and whether chapters end on hooks. \
Reply with JSON only: {\"arc_coherence\": 0-10, \"hook_strength\": 0-10, \"issues\": [\"...\"]}";

/// Whether a chapter title is a stand-in rather than a real title.
pub fn is_placeholder_title(title: &str) -> bool {
    let t = title.trim().to_lowercase();
    if t.starts_with('第') && t.ends_with('章') {
        return true;
    }
    if t.contains("tbd") || t.contains("待定") {
        return true;
    }
    let stem = t.trim_end_matches(|c: char| c.is_ascii_digit() || c.is_whitespace());
    PLACEHOLDERS.contains(&stem)
}

/// Words in `text`; every CJK character counts as one word.
pub fn count_words(text: &str) -> usize {
    let mut words = 0;
    let mut in_word = false;
    for c in text.chars() {
        if !c.is_alphanumeric() {
            in_word = false;
        } else if is_cjk(c) {
            words += 1;
            in_word = false;
        } else if !in_word {
            words += 1;
            in_word = true;
        }
    }
    words
}

/// `1,2,3,7,9,10` → `1-3, 7, 9-10`.
fn render_ranges(indices: &BTreeSet<u32>) -> String {
    let mut parts = Vec::new();
    let mut iter = indices.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        parts.push(if start == end {
            start.to_string()
        } else {
            format!("{start}-{end}")
        });
    }
    parts.join(", ")
}

/// Scores outline drafts.
#[derive(Clone)]
pub struct OutlineEvaluator {
    completion: Arc<dyn TextCompletion>,
    config: OutlineConfig,
}

impl OutlineEvaluator {
    pub fn new(completion: Arc<dyn TextCompletion>, config: OutlineConfig) -> Self {
        Self { completion, config }
    }

    /// Structural dimensions only.
    pub fn quick(&self, outline: &Outline) -> QcVerdict {
        let target = outline.target_chapters.max(1);
        let mut issues = Vec::new();

        // Coverage and index integrity.
        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        let mut out_of_range = BTreeSet::new();
        for ch in &outline.chapters {
            if ch.index == 0 || ch.index > target {
                out_of_range.insert(ch.index);
            } else if !seen.insert(ch.index) {
                duplicates.insert(ch.index);
            }
        }
        let missing: BTreeSet<u32> = (1..=target).filter(|i| !seen.contains(i)).collect();
        if !missing.is_empty() {
            issues.push(QcIssue::new(
                IssueKind::MissingIndices,
                Severity::Blocking,
                format!("Chapters {} are missing from the outline.", render_ranges(&missing)),
            ));
        }
        if !duplicates.is_empty() {
            issues.push(QcIssue::new(
                IssueKind::DuplicateIndices,
                Severity::Blocking,
                format!("Chapters {} appear more than once.", render_ranges(&duplicates)),
            ));
        }
        if !out_of_range.is_empty() {
            issues.push(QcIssue::new(
                IssueKind::OutOfRangeIndices,
                Severity::Blocking,
                format!(
                    "Chapter indices {} fall outside 1-{target}.",
                    render_ranges(&out_of_range)
                ),
            ));
        }
        let coverage = 10.0 * seen.len() as f64 / f64::from(target);

        // Titles and goals.
        let planned = outline.chapters.len().max(1) as f64;
        let placeholders = outline
            .chapters
            .iter()
            .filter(|c| is_placeholder_title(&c.title))
            .count();
        let title_quality = 10.0 * (1.0 - placeholders as f64 / planned);
        if placeholders > 0 {
            let severity = if title_quality < 9.0 { Severity::Major } else { Severity::Minor };
            issues.push(QcIssue::new(
                IssueKind::PlaceholderTitles,
                severity,
                format!("{placeholders} chapter(s) have placeholder titles."),
            ));
        }

        let substantive = outline
            .chapters
            .iter()
            .filter(|c| count_words(&c.goal) >= MIN_GOAL_WORDS)
            .count();
        let goal_quality = 10.0 * substantive as f64 / planned;
        let weak = outline.chapters.len() - substantive;
        if weak > 0 {
            let severity = if goal_quality < 8.0 { Severity::Major } else { Severity::Minor };
            issues.push(QcIssue::new(
                IssueKind::WeakGoals,
                severity,
                format!("{weak} chapter goal(s) are too thin to write from."),
            ));
        }

        // Milestones.
        let expected = target.div_ceil(CHAPTERS_PER_MILESTONE).max(1);
        let milestone_count = outline
            .milestones
            .iter()
            .filter(|m| m.chapter >= 1 && m.chapter <= target)
            .map(|m| m.chapter)
            .collect::<BTreeSet<_>>()
            .len() as u32;
        let milestones = (10.0 * f64::from(milestone_count) / f64::from(expected)).min(10.0);
        if milestone_count < expected {
            issues.push(QcIssue::new(
                IssueKind::FewMilestones,
                Severity::Minor,
                format!("{milestone_count} milestone(s) for {target} chapters; expected at least {expected}."),
            ));
        }

        let dimensions = BTreeMap::from([
            ("coverage".to_string(), coverage),
            ("title_quality".to_string(), title_quality),
            ("goal_quality".to_string(), goal_quality),
            ("milestones".to_string(), milestones),
        ]);
        let score = OUTLINE_WEIGHTS
            .iter()
            .map(|(name, weight)| dimensions[*name] * weight)
            .sum::<f64>();
        QcVerdict::new(score, self.config.target_score, issues, dimensions)
    }

    /// Structural dimensions plus, when enabled, a model review of arc
    /// coherence and hook strength. A failed review keeps the structural
    /// verdict.
    pub async fn evaluate(&self, outline: &Outline) -> QcVerdict {
        let quick = self.quick(outline);
        if !self.config.deep_review {
            return quick;
        }
        match self.review(outline).await {
            Ok((arc, hooks, notes)) => {
                let score = quick.score * STRUCTURAL_SHARE + (arc + hooks) / 2.0 * (1.0 - STRUCTURAL_SHARE);
                let mut dimensions = quick.dimensions;
                dimensions.insert("arc_coherence".into(), arc);
                dimensions.insert("hook_strength".into(), hooks);
                let mut issues = quick.issues;
                issues.extend(
                    notes
                        .into_iter()
                        .map(|n| QcIssue::new(IssueKind::ArcCoherence, Severity::Minor, n)),
                );
                debug!(structural = quick.score, score, "Outline review merged");
                QcVerdict::new(score, self.config.target_score, issues, dimensions)
            }
            Err(e) => {
                warn!(error = %e, "Outline review failed, using structural score");
                quick
            }
        }
    }

    async fn review(&self, outline: &Outline) -> Result<(f64, f64, Vec<String>)> {
        let request = CompletionRequest::new(REVIEW_SYSTEM, outline.render_brief())
            .with_temperature(0.2)
            .with_max_output_tokens(1_500);
        let reply = self.completion.complete(&request).await?;
        let obj = schema::parse_object(&reply)?;
        let score = |field: &str, aliases: &[&str]| {
            f64_any(&obj, aliases)
                .map(schema::clamp_score)
                .ok_or_else(|| SchemaError::MissingField { field: field.to_string() })
        };
        let arc = score("arc_coherence", &["arc_coherence", "arcCoherence", "coherence"])?;
        let hooks = score("hook_strength", &["hook_strength", "hookStrength", "hooks"])?;

        let mut notes = schema::strings_any(&obj, &["issues", "notes"]);
        notes.extend(
            objects_any(&obj, &["issues", "notes"])
                .into_iter()
                .filter_map(|o| str_any(o, &["description", "text"])),
        );
        Ok((arc, hooks, schema::bounded("issues", notes, 12)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::{Milestone, OutlineChapter};
    use crate::testing::ScriptedCompletion;

    fn outline(indices: impl IntoIterator<Item = u32>, target: u32) -> Outline {
        Outline {
            title: "风起".into(),
            target_chapters: target,
            chapters: indices
                .into_iter()
                .map(|i| OutlineChapter {
                    index: i,
                    title: format!("风云{}", ["起", "涌", "变"][i as usize % 3]),
                    goal: "林风在宗门大比中击败对手并引起长老注意".into(),
                    pacing_hint: None,
                })
                .collect(),
            milestones: vec![Milestone {
                chapter: target / 2,
                description: "大比决战".into(),
            }],
        }
    }

    fn evaluator(config: OutlineConfig) -> OutlineEvaluator {
        OutlineEvaluator::new(Arc::new(ScriptedCompletion::new()), config)
    }

    #[test]
    fn test_placeholder_titles() {
        assert!(is_placeholder_title("第12章"));
        assert!(is_placeholder_title("Chapter 3"));
        assert!(is_placeholder_title("标题7"));
        assert!(is_placeholder_title("  "));
        assert!(is_placeholder_title("待定：决战"));
        assert!(!is_placeholder_title("山门夜雨"));
    }

    #[test]
    fn test_count_words() {
        assert_eq!(count_words("林风下山"), 4);
        assert_eq!(count_words("Lin Feng leaves the mountain."), 5);
        assert_eq!(count_words("林风 meets 师父。"), 5);
    }

    #[test]
    fn test_render_ranges() {
        let set: BTreeSet<u32> = [1, 2, 3, 7, 9, 10].into_iter().collect();
        assert_eq!(render_ranges(&set), "1-3, 7, 9-10");
    }

    #[test]
    fn test_complete_outline_passes() {
        let verdict = evaluator(OutlineConfig::default()).quick(&outline(1..=20, 20));
        assert!(verdict.passed, "{verdict:?}");
        assert_eq!(verdict.dimension("coverage"), Some(10.0));
        assert_eq!(verdict.dimension("milestones"), Some(10.0));
    }

    #[test]
    fn test_out_of_range_blocks() {
        let mut o = outline(1..=10, 10);
        o.chapters[9].index = 11;
        let verdict = evaluator(OutlineConfig::default()).quick(&o);
        assert!(!verdict.passed);
        assert!(verdict.has_issue(IssueKind::OutOfRangeIndices));
        assert!(verdict.has_issue(IssueKind::MissingIndices));
    }

    #[tokio::test]
    async fn test_deep_review_merges() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.push_reply(r#"{"arc_coherence": 6, "hook_strength": 8, "issues": ["中段拖沓"]}"#);
        let config = OutlineConfig {
            deep_review: true,
            ..OutlineConfig::default()
        };
        let evaluator = OutlineEvaluator::new(scripted, config);
        let verdict = evaluator.evaluate(&outline(1..=20, 20)).await;
        // 0.7 * 10 + 0.3 * 7
        assert!((verdict.score - 9.1).abs() < 1e-9);
        assert_eq!(verdict.dimension("hook_strength"), Some(8.0));
        assert!(verdict.has_issue(IssueKind::ArcCoherence));
    }
}

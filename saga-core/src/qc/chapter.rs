use super::heuristics::{heuristic_score, quick_issues};
use super::{IssueKind, QcIssue, QcVerdict, Severity};
use crate::completion::{CompletionRequest, TextCompletion};
use crate::config::QcConfig;
use crate::error::{Result, SchemaError};
use crate::generation::ChapterBrief;
use crate::knowledge::PacingBeat;
use crate::schema::{self, f64_any, objects_any, parse_enum, str_any};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const REVIEW_SYSTEM: &str = "You review chapters of a serialized novel. \
Score each dimension from 0 to 10 and list concrete problems. Reply with JSON only: \
{\"character_consistency\": 0-10, \"pacing_alignment\": 0-10, \"goal_achievement\": 0-10, \
\"issues\": [{\"kind\": \"character_consistency|pacing_mismatch|goal_missed|repetition|other\", \
\"severity\": \"info|minor|major\", \"description\": \"...\"}]}";

/// Characters of chapter text shown to the reviewer.
const REVIEW_CHARS: usize = 16_000;
const MAX_REVIEW_ISSUES: usize = 12;

/// Everything a chapter evaluation looks at.
#[derive(Debug, Clone, Copy)]
pub struct ChapterQcInput<'a> {
    pub text: &'a str,
    pub brief: &'a ChapterBrief,
    pub pacing: &'a PacingBeat,
    /// Rendered character states, for the consistency check.
    pub characters: &'a str,
}

struct DeepReview {
    character_consistency: f64,
    pacing_alignment: f64,
    goal_achievement: f64,
    issues: Vec<QcIssue>,
}

/// Scores chapter drafts.
#[derive(Clone)]
pub struct ChapterEvaluator {
    completion: Arc<dyn TextCompletion>,
    config: QcConfig,
}

impl ChapterEvaluator {
    pub fn new(completion: Arc<dyn TextCompletion>, config: QcConfig) -> Self {
        Self { completion, config }
    }

    pub fn config(&self) -> &QcConfig {
        &self.config
    }

    /// Heuristic checks only.
    pub fn quick(&self, text: &str, brief: &ChapterBrief) -> QcVerdict {
        let issues = quick_issues(text, brief.index, brief.total_chapters, brief.min_chars);
        let score = heuristic_score(&issues);
        let dimensions = BTreeMap::from([("heuristic".to_string(), score)]);
        QcVerdict::new(score, self.config.pass_threshold, issues, dimensions)
    }

    /// Heuristic checks plus, when the policy selects this chapter, a
    /// model-judged review merged with the configured weights.
    ///
    /// A failed review falls back to the heuristic verdict.
    pub async fn evaluate(&self, input: ChapterQcInput<'_>) -> QcVerdict {
        let quick = self.quick(input.text, input.brief);
        let brief = input.brief;
        if !self.config.deep.applies_to(brief.index, brief.total_chapters) {
            return quick;
        }

        let review = match self.review(input).await {
            Ok(review) => review,
            Err(e) => {
                warn!(chapter = brief.index, error = %e, "Deep QC failed, using heuristic score");
                return quick;
            }
        };

        let w = &self.config.deep_weights;
        let heuristic = quick.score;
        let total_weight = w.heuristic + w.character_consistency + w.pacing_alignment + w.goal_achievement;
        let score = if total_weight > 0.0 {
            (heuristic * w.heuristic
                + review.character_consistency * w.character_consistency
                + review.pacing_alignment * w.pacing_alignment
                + review.goal_achievement * w.goal_achievement)
                / total_weight
        } else {
            heuristic
        };

        let mut dimensions = quick.dimensions;
        dimensions.insert("character_consistency".into(), review.character_consistency);
        dimensions.insert("pacing_alignment".into(), review.pacing_alignment);
        dimensions.insert("goal_achievement".into(), review.goal_achievement);

        let mut issues = quick.issues;
        issues.extend(review.issues);
        debug!(chapter = brief.index, heuristic, score, "Deep QC merged");
        QcVerdict::new(score, self.config.pass_threshold, issues, dimensions)
    }

    async fn review(&self, input: ChapterQcInput<'_>) -> Result<DeepReview> {
        let excerpt: String = input.text.chars().take(REVIEW_CHARS).collect();
        let prompt = format!(
            "Chapter {} of {}: {}\nGoal: {}\nPlanned pacing: {} (tension {}/10)\n\n## Characters\n{}\n\n## Chapter\n{}",
            input.brief.index,
            input.brief.total_chapters,
            input.brief.title,
            input.brief.goal,
            input.pacing.pacing,
            input.pacing.tension,
            input.characters,
            excerpt
        );
        let request = CompletionRequest::new(REVIEW_SYSTEM, prompt)
            .with_temperature(0.2)
            .with_max_output_tokens(1_500);
        let reply = self.completion.complete(&request).await?;
        Ok(parse_review(&reply)?)
    }
}

fn parse_review(reply: &str) -> std::result::Result<DeepReview, SchemaError> {
    let obj = schema::parse_object(reply)?;
    let score = |field: &str, aliases: &[&str]| {
        f64_any(&obj, aliases)
            .map(schema::clamp_score)
            .ok_or_else(|| SchemaError::MissingField { field: field.to_string() })
    };
    let character_consistency = score(
        "character_consistency",
        &["character_consistency", "characterConsistency", "characters"],
    )?;
    let pacing_alignment = score("pacing_alignment", &["pacing_alignment", "pacingAlignment", "pacing"])?;
    let goal_achievement = score("goal_achievement", &["goal_achievement", "goalAchievement", "goal"])?;

    let mut issues = Vec::new();
    for raw in objects_any(&obj, &["issues", "problems"]) {
        let Some(description) = str_any(raw, &["description", "detail", "text"]).filter(|d| !d.trim().is_empty())
        else {
            continue;
        };
        let severity = match str_any(raw, &["severity", "level"]) {
            Some(s) => parse_enum("severity", &s, Severity::TABLE)?,
            None => Severity::Minor,
        };
        let kind = str_any(raw, &["kind", "type", "category"])
            .and_then(|k| parse_enum("kind", &k, IssueKind::TABLE).ok())
            .unwrap_or(IssueKind::Other);
        // The reviewer cannot block a chapter on its own.
        issues.push(QcIssue::new(kind, severity.min(Severity::Major), description));
    }
    let issues = schema::bounded("issues", issues, MAX_REVIEW_ISSUES)?;

    Ok(DeepReview {
        character_consistency,
        pacing_alignment,
        goal_achievement,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeepQcPolicy;
    use crate::knowledge::PacingType;
    use crate::testing::ScriptedCompletion;

    fn brief(index: u32, total: u32) -> ChapterBrief {
        ChapterBrief {
            index,
            total_chapters: total,
            title: "夜袭".into(),
            goal: "林风夜探敌营".into(),
            min_chars: 20,
        }
    }

    const GOOD: &str = "第3章 夜袭\n\n月黑风高，林风伏在营帐之外，屏住了呼吸。\n\n帐中传来低语，他听见了师父的名字。";

    fn deep_config() -> QcConfig {
        QcConfig {
            deep: DeepQcPolicy {
                enabled: true,
                every_n_chapters: 1,
                always_on_final: true,
            },
            ..QcConfig::default()
        }
    }

    #[test]
    fn test_quick_pass() {
        let evaluator = ChapterEvaluator::new(Arc::new(ScriptedCompletion::new()), QcConfig::default());
        let verdict = evaluator.quick(GOOD, &brief(3, 10));
        assert!(verdict.passed, "{verdict:?}");
        assert_eq!(verdict.score, 10.0);
    }

    #[test]
    fn test_premature_ending_blocks() {
        let evaluator = ChapterEvaluator::new(Arc::new(ScriptedCompletion::new()), QcConfig::default());
        let text = format!("{GOOD}\n\n全书完。");
        let verdict = evaluator.quick(&text, &brief(3, 10));
        assert!(!verdict.passed);
        assert!(verdict.has_issue(IssueKind::PrematureEnding));

        let last = evaluator.quick(&text.replace("第3章", "第10章"), &brief(10, 10));
        assert!(!last.has_issue(IssueKind::PrematureEnding));
    }

    #[tokio::test]
    async fn test_deep_review_is_merged() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.push_reply(
            r#"{"character_consistency": 4, "pacing_alignment": 6, "goal_achievement": 8,
                "issues": [{"kind": "character", "severity": "critical", "description": "林风性格突变"}]}"#,
        );
        let evaluator = ChapterEvaluator::new(scripted, deep_config());
        let pacing = PacingBeat::new(3, PacingType::Action);
        let verdict = evaluator
            .evaluate(ChapterQcInput {
                text: GOOD,
                brief: &brief(3, 10),
                pacing: &pacing,
                characters: "林风：冷静",
            })
            .await;

        // 0.4*10 + 0.2*4 + 0.2*6 + 0.2*8 = 7.6
        assert!((verdict.score - 7.6).abs() < 1e-9);
        assert_eq!(verdict.dimension("character_consistency"), Some(4.0));
        let issue = verdict
            .issues
            .iter()
            .find(|i| i.kind == IssueKind::CharacterConsistency)
            .unwrap();
        assert_eq!(issue.severity, Severity::Major);
        assert!(verdict.passed);
    }

    #[tokio::test]
    async fn test_deep_failure_falls_back() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.push_reply("looks fine to me");
        let evaluator = ChapterEvaluator::new(scripted.clone(), deep_config());
        let pacing = PacingBeat::new(3, PacingType::Action);
        let verdict = evaluator
            .evaluate(ChapterQcInput {
                text: GOOD,
                brief: &brief(3, 10),
                pacing: &pacing,
                characters: "",
            })
            .await;
        assert_eq!(verdict.score, 10.0);
        assert!(verdict.dimension("goal_achievement").is_none());
        assert_eq!(scripted.call_count(), 1);
    }
}

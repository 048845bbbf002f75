use super::{ChapterEvaluator, ChapterQcInput, IssueKind, QcIssue, QcVerdict, Severity};
use crate::completion::{CompletionRequest, TextCompletion};
use crate::config::GenerationConfig;
use crate::error::Result;
use crate::generation::{chapter_rules, ChapterBrief};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Best candidate found by a repair run.
#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub text: String,
    pub verdict: QcVerdict,
    /// Rounds actually run.
    pub attempts: u32,
    /// Whether the returned candidate beats the input draft.
    pub improved: bool,
}

/// Targeted regeneration driven by QC issues.
#[derive(Clone)]
pub struct RepairLoop {
    completion: Arc<dyn TextCompletion>,
    evaluator: ChapterEvaluator,
    generation: GenerationConfig,
    max_attempts: u32,
}

impl RepairLoop {
    pub fn new(
        completion: Arc<dyn TextCompletion>,
        evaluator: ChapterEvaluator,
        generation: GenerationConfig,
        max_attempts: u32,
    ) -> Self {
        Self {
            completion,
            evaluator,
            generation,
            max_attempts,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Repair `input.text` until it passes or the round budget runs out.
    /// A draft that already passes gets one polishing round.
    ///
    /// Returns the best candidate seen, which may still fail. A completion
    /// failure before any round finished is returned as an error; a later one
    /// ends the run with the best candidate so far.
    pub async fn run(
        &self,
        input: ChapterQcInput<'_>,
        context: &str,
        verdict: &QcVerdict,
    ) -> Result<RepairOutcome> {
        let brief = input.brief;
        let mut best_text = input.text.to_string();
        let mut best_verdict = verdict.clone();
        let mut current_text = best_text.clone();
        let mut current_verdict = verdict.clone();
        let mut improved = false;
        let mut attempts = 0;

        while attempts < self.max_attempts && (attempts == 0 || !best_verdict.passed) {
            attempts += 1;
            let request = CompletionRequest::new(
                repair_system_prompt(brief),
                repair_prompt(brief, context, &current_text, &current_verdict),
            )
            .with_temperature(self.generation.temperature)
            .with_max_output_tokens(self.generation.max_output_tokens);

            let candidate = match self.completion.complete(&request).await {
                Ok(text) => text.trim().to_string(),
                Err(e) if attempts == 1 => return Err(e.into()),
                Err(e) => {
                    warn!(chapter = brief.index, attempt = attempts, error = %e, "Repair round failed");
                    attempts -= 1;
                    break;
                }
            };

            let candidate_verdict = self
                .evaluator
                .evaluate(ChapterQcInput {
                    text: &candidate,
                    ..input
                })
                .await;
            info!(
                chapter = brief.index,
                attempt = attempts,
                before = current_verdict.score,
                after = candidate_verdict.score,
                passed = candidate_verdict.passed,
                "Repair round finished"
            );

            if candidate_verdict.better_than(&best_verdict) {
                best_text = candidate.clone();
                best_verdict = candidate_verdict.clone();
                improved = true;
            }
            current_text = candidate;
            current_verdict = candidate_verdict;
        }

        Ok(RepairOutcome {
            text: best_text,
            verdict: best_verdict,
            attempts,
            improved,
        })
    }
}

fn repair_system_prompt(brief: &ChapterBrief) -> String {
    format!(
        "You revise chapters of a serialized novel. Return the complete revised chapter, \
         keeping everything that already works.\n{}",
        chapter_rules(brief)
    )
}

/// One instruction per outstanding issue kind.
pub fn repair_instructions(brief: &ChapterBrief, verdict: &QcVerdict) -> Vec<String> {
    let mut by_kind: BTreeMap<IssueKind, Vec<&QcIssue>> = BTreeMap::new();
    for issue in verdict.issues.iter().filter(|i| i.severity >= Severity::Minor) {
        by_kind.entry(issue.kind).or_default().push(issue);
    }

    by_kind
        .into_iter()
        .map(|(kind, issues)| {
            let details: Vec<&str> = issues.iter().map(|i| i.description.as_str()).collect();
            let details = details.join(" ");
            match kind {
                IssueKind::TitleFormat => format!(
                    "Make the first line exactly `第{}章 {}`.",
                    brief.index, brief.title
                ),
                IssueKind::TooShort => format!(
                    "Expand the chapter to at least {} characters with new scene content, not padding.",
                    brief.min_chars
                ),
                IssueKind::PrematureEnding => {
                    "Remove every book-ending phrase and end on a hook into the next chapter.".to_string()
                }
                IssueKind::Truncated => "Complete the final scene; the last sentence must be finished.".to_string(),
                IssueKind::Repetition => "Remove repeated paragraphs and replace them with new material.".to_string(),
                IssueKind::CharacterConsistency => {
                    format!("Keep every character consistent with their recorded state. {details}")
                }
                IssueKind::PacingMismatch => format!("Match the planned pacing of this chapter. {details}"),
                IssueKind::GoalMissed => format!("Make sure the chapter achieves its goal: {}. {details}", brief.goal),
                _ => format!("Fix: {details}"),
            }
        })
        .collect()
}

fn repair_prompt(brief: &ChapterBrief, context: &str, draft: &str, verdict: &QcVerdict) -> String {
    let mut instructions: Vec<String> = repair_instructions(brief, verdict)
        .into_iter()
        .map(|i| format!("- {i}"))
        .collect();
    if instructions.is_empty() {
        instructions.push("- Tighten the prose and strengthen the closing hook without changing events.".to_string());
    }
    format!(
        "{context}\n\n## Current draft of chapter {}\n{draft}\n\n## Required fixes\n{}\n\nReturn the full revised chapter.",
        brief.index,
        instructions.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QcConfig;
    use crate::knowledge::{PacingBeat, PacingType};
    use crate::testing::ScriptedCompletion;

    const BROKEN: &str = "第4章 山雨\n\n林风走了。\n\n全书完";
    const FIXED: &str = "第4章 山雨\n\n林风走下山道，雨越下越大，远处有人在等他。";

    fn brief() -> ChapterBrief {
        ChapterBrief {
            index: 4,
            total_chapters: 30,
            title: "山雨".into(),
            goal: "林风下山".into(),
            min_chars: 10,
        }
    }

    fn repair_loop(scripted: Arc<ScriptedCompletion>, attempts: u32) -> RepairLoop {
        let evaluator = ChapterEvaluator::new(scripted.clone(), QcConfig::default());
        RepairLoop::new(scripted, evaluator, GenerationConfig::default(), attempts)
    }

    #[test]
    fn test_one_instruction_per_kind() {
        let verdict = QcVerdict::new(
            3.0,
            7.0,
            vec![
                QcIssue::new(IssueKind::GoalMissed, Severity::Major, "未下山"),
                QcIssue::new(IssueKind::GoalMissed, Severity::Minor, "未见师父"),
                QcIssue::new(IssueKind::Truncated, Severity::Major, "cut"),
                QcIssue::new(IssueKind::Other, Severity::Info, "ignored"),
            ],
            BTreeMap::new(),
        );
        let instructions = repair_instructions(&brief(), &verdict);
        assert_eq!(instructions.len(), 2);
        assert!(instructions.iter().any(|i| i.contains("未下山") && i.contains("未见师父")));
    }

    #[tokio::test]
    async fn test_repair_returns_passing_candidate() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.push_reply(FIXED);
        let repair = repair_loop(scripted.clone(), 2);
        let evaluator = ChapterEvaluator::new(scripted.clone(), QcConfig::default());
        let pacing = PacingBeat::new(4, PacingType::Rising);
        let b = brief();
        let input = ChapterQcInput {
            text: BROKEN,
            brief: &b,
            pacing: &pacing,
            characters: "",
        };
        let verdict = evaluator.quick(BROKEN, &b);
        assert!(!verdict.passed);

        let outcome = repair.run(input, "context", &verdict).await.unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(outcome.improved);
        assert!(outcome.verdict.passed);
        assert_eq!(outcome.text, FIXED);
    }

    #[tokio::test]
    async fn test_repair_keeps_best_when_candidates_get_worse() {
        let scripted = Arc::new(ScriptedCompletion::new());
        scripted.push_reply("不是章节");
        let repair = repair_loop(scripted.clone(), 1);
        let pacing = PacingBeat::new(4, PacingType::Rising);
        let b = brief();
        let text = "第4章 山雨\n\n林风走了";
        let verdict = ChapterEvaluator::new(scripted.clone(), QcConfig::default()).quick(text, &b);

        let outcome = repair
            .run(
                ChapterQcInput {
                    text,
                    brief: &b,
                    pacing: &pacing,
                    characters: "",
                },
                "context",
                &verdict,
            )
            .await
            .unwrap();
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.improved);
        assert_eq!(outcome.text, text);
    }
}

//! Chapter drafting.
//!
//! One completion call per draft, followed by bounded self-correction when
//! the draft announces the end of the book early or stops mid-sentence.

use crate::completion::{CompletionRequest, TextCompletion};
use crate::config::GenerationConfig;
use crate::error::Result;
use crate::qc::heuristics::{detect_ending_signals, EndingSignal};
use std::sync::Arc;
use tracing::{info, warn};

/// What the writer is asked to produce.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterBrief {
    pub index: u32,
    pub total_chapters: u32,
    pub title: String,
    pub goal: String,
    pub min_chars: usize,
}

impl ChapterBrief {
    pub fn is_final(&self) -> bool {
        self.index >= self.total_chapters
    }

    /// Title and goal on one line; used to rank context by relevance.
    pub fn focus(&self) -> String {
        format!("{} {}", self.title, self.goal)
    }
}

/// A draft fresh from the writer.
#[derive(Debug, Clone, PartialEq)]
pub struct WrittenChapter {
    pub text: String,
    /// Self-correction rounds used.
    pub rewrites: u32,
    /// Signals still present after the last round.
    pub residual_signals: Vec<EndingSignal>,
}

/// Hard structural rules every chapter is written under.
pub fn chapter_rules(brief: &ChapterBrief) -> String {
    let ending_rule = if brief.is_final() {
        "This is the final chapter of the book. Bring the story to its ending.".to_string()
    } else {
        format!(
            "This is chapter {} of {}. The story continues after this chapter: never write closing \
             language such as 全书完, 大结局 or （完）, and end on a hook into the next chapter.",
            brief.index, brief.total_chapters
        )
    };
    format!(
        "Hard rules:\n\
         1. The first line is the chapter title, exactly in the form `第{index}章 {title}`.\n\
         2. Write at least {min} characters of prose after the title line.\n\
         3. {ending_rule}\n\
         4. Finish every sentence. Output only the chapter text, with no notes or commentary.\n\
         5. Never re-narrate beats listed as completed in the story notes.",
        index = brief.index,
        title = brief.title,
        min = brief.min_chars,
    )
}

/// System prompt for a fresh draft.
pub fn writer_system_prompt(brief: &ChapterBrief) -> String {
    format!(
        "You are the author of a serialized novel, writing it one chapter at a time.\n{}",
        chapter_rules(brief)
    )
}

/// The user prompt: assembled context followed by the chapter brief.
pub fn brief_prompt(brief: &ChapterBrief, context: &str) -> String {
    format!(
        "{context}\n\n## Chapter brief\nChapter {} of {}: {}\nGoal: {}\n\nWrite the chapter now.",
        brief.index, brief.total_chapters, brief.title, brief.goal
    )
}

fn rewrite_prompt(base: &str, draft: &str, signals: &[EndingSignal]) -> String {
    let problems: Vec<String> = signals
        .iter()
        .map(|s| format!("- {} {}", s.describe(), s.instruction()))
        .collect();
    format!(
        "{base}\n\n## Previous draft\n{draft}\n\n## Problems to fix\n{}\n\nRewrite the whole chapter with these problems fixed.",
        problems.join("\n")
    )
}

/// Drafts chapters through the completion service.
#[derive(Clone)]
pub struct ChapterWriter {
    completion: Arc<dyn TextCompletion>,
    config: GenerationConfig,
}

impl ChapterWriter {
    pub fn new(completion: Arc<dyn TextCompletion>, config: GenerationConfig) -> Self {
        Self { completion, config }
    }

    async fn ask(&self, system: &str, prompt: String) -> Result<String> {
        let request = CompletionRequest::new(system, prompt)
            .with_temperature(self.config.temperature)
            .with_max_output_tokens(self.config.max_output_tokens);
        Ok(self.completion.complete(&request).await?.trim().to_string())
    }

    /// Draft the chapter described by `brief` from `context`.
    ///
    /// Non-final chapters get up to `max_rewrite_attempts` correction rounds.
    /// A failed correction round keeps the previous draft.
    pub async fn write(&self, brief: &ChapterBrief, context: &str) -> Result<WrittenChapter> {
        let system = writer_system_prompt(brief);
        let prompt = brief_prompt(brief, context);

        let mut text = self.ask(&system, prompt.clone()).await?;
        let mut signals = detect_ending_signals(&text, brief.is_final());
        let mut rewrites = 0;

        while !brief.is_final() && !signals.is_empty() && rewrites < self.config.max_rewrite_attempts {
            rewrites += 1;
            warn!(
                chapter = brief.index,
                rewrite = rewrites,
                signals = ?signals,
                "Draft has structural problems, rewriting"
            );
            match self.ask(&system, rewrite_prompt(&prompt, &text, &signals)).await {
                Ok(rewritten) => {
                    text = rewritten;
                    signals = detect_ending_signals(&text, brief.is_final());
                }
                Err(e) => {
                    warn!(chapter = brief.index, error = %e, "Rewrite failed, keeping previous draft");
                    break;
                }
            }
        }

        info!(
            chapter = brief.index,
            chars = text.chars().count(),
            rewrites,
            clean = signals.is_empty(),
            "Chapter drafted"
        );
        Ok(WrittenChapter {
            text,
            rewrites,
            residual_signals: signals,
        })
    }
}

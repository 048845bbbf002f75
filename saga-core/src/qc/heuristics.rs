//! Cheap, synchronous chapter checks.
//!
//! Plain string scanning; nothing here calls the completion service.

use super::{IssueKind, QcIssue, Severity};

/// Phrases that announce the end of the whole book.
pub const ENDING_PHRASES: &[&str] = &[
    "全书完",
    "全书终",
    "全文完",
    "本书完",
    "全剧终",
    "大结局",
    "（完）",
    "(完)",
    "【完】",
    "【全文完】",
    "完结撒花",
    "故事到此结束",
    "end of the book",
    "the story ends here",
];

/// Characters of the chapter tail scanned for ending phrases.
const TAIL_CHARS: usize = 300;

/// Characters a finished chapter may end on.
const TERMINATORS: &[char] = &[
    '。', '！', '？', '…', '」', '』', '”', '’', '）', '】', '—', '～', '.', '!', '?', '"', '\'', ')', '*',
];

/// A structural reason to regenerate a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndingSignal {
    /// The tail announces the end of the book.
    PrematureEnding { phrase: String },
    /// The text stops mid-sentence.
    Truncated { last: char },
}

impl EndingSignal {
    pub fn describe(&self) -> String {
        match self {
            EndingSignal::PrematureEnding { phrase } => format!(
                "The chapter ends with book-ending language (\"{phrase}\") but the story continues."
            ),
            EndingSignal::Truncated { last } => {
                format!("The chapter stops mid-sentence (last character '{last}').")
            }
        }
    }

    /// Rewrite instruction for this signal.
    pub fn instruction(&self) -> &'static str {
        match self {
            EndingSignal::PrematureEnding { .. } => {
                "Remove every closing phrase such as 全书完 or 大结局. End on a hook that leads into the next chapter."
            }
            EndingSignal::Truncated { .. } => "Finish the final scene; the last sentence must be complete.",
        }
    }

    pub fn to_issue(&self) -> QcIssue {
        match self {
            EndingSignal::PrematureEnding { .. } => {
                QcIssue::new(IssueKind::PrematureEnding, Severity::Blocking, self.describe())
            }
            EndingSignal::Truncated { .. } => {
                QcIssue::new(IssueKind::Truncated, Severity::Major, self.describe())
            }
        }
    }
}

fn tail(text: &str, chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(chars)).collect()
}

/// Premature-ending and truncation signals.
///
/// Ending phrases are ignored for the book's final chapter.
pub fn detect_ending_signals(text: &str, is_final: bool) -> Vec<EndingSignal> {
    let mut signals = Vec::new();
    let trimmed = text.trim_end();

    if !is_final {
        let tail = tail(trimmed, TAIL_CHARS).to_lowercase();
        if let Some(phrase) = ENDING_PHRASES.iter().find(|p| tail.contains(*p)) {
            signals.push(EndingSignal::PrematureEnding {
                phrase: (*phrase).to_string(),
            });
        }
    }

    if let Some(last) = trimmed.chars().last() {
        if !TERMINATORS.contains(&last) {
            signals.push(EndingSignal::Truncated { last });
        }
    }
    signals
}

/// Parse a chapter number written in Arabic or Chinese numerals.
pub fn parse_chapter_number(raw: &str) -> Option<u32> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return raw.parse().ok();
    }

    let digit = |c: char| -> Option<u32> {
        Some(match c {
            '零' | '〇' => 0,
            '一' => 1,
            '二' | '两' => 2,
            '三' => 3,
            '四' => 4,
            '五' => 5,
            '六' => 6,
            '七' => 7,
            '八' => 8,
            '九' => 9,
            _ => return None,
        })
    };

    let mut total = 0;
    let mut current = 0;
    for c in raw.chars() {
        let unit = match c {
            '十' => 10,
            '百' => 100,
            '千' => 1000,
            _ => {
                current = digit(c)?;
                continue;
            }
        };
        let value = if current == 0 { 1 } else { current };
        total += value * unit;
        current = 0;
    }
    Some(total + current)
}

/// The first non-empty line must be `第N章 标题` with `N == index`.
pub fn check_title(text: &str, index: u32) -> Option<QcIssue> {
    let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) else {
        return Some(QcIssue::new(IssueKind::TitleFormat, Severity::Blocking, "The chapter is empty."));
    };

    let malformed = |why: &str| {
        Some(QcIssue::new(
            IssueKind::TitleFormat,
            Severity::Blocking,
            format!("Title line \"{line}\" {why}; expected \"第{index}章 标题\"."),
        ))
    };

    let line = line.trim_start_matches(['#', ' ']);
    let Some(rest) = line.strip_prefix('第') else {
        return malformed("does not start with 第");
    };
    let Some(pos) = rest.find('章') else {
        return malformed("has no 章 marker");
    };
    let Some(number) = parse_chapter_number(&rest[..pos]) else {
        return malformed("has an unreadable chapter number");
    };
    if number != index {
        return malformed(&format!("is numbered {number}"));
    }
    let title = rest[pos + '章'.len_utf8()..].trim_start_matches([' ', '\u{3000}', ':', '：']);
    if title.trim().is_empty() {
        return malformed("has no title after the number");
    }
    None
}

/// Visible characters of the body (title line excluded).
pub fn body_chars(text: &str) -> usize {
    text.lines()
        .skip_while(|l| l.trim().is_empty())
        .skip(1)
        .flat_map(str::chars)
        .filter(|c| !c.is_whitespace())
        .count()
}

pub fn check_length(text: &str, min_chars: usize) -> Option<QcIssue> {
    let chars = body_chars(text);
    if chars >= min_chars {
        return None;
    }
    let severity = if chars * 2 < min_chars {
        Severity::Major
    } else {
        Severity::Minor
    };
    Some(QcIssue::new(
        IssueKind::TooShort,
        severity,
        format!("The chapter body has {chars} characters; at least {min_chars} are required."),
    ))
}

/// Paragraphs of 20+ characters that appear more than once.
pub fn check_repetition(text: &str) -> Option<QcIssue> {
    let mut seen = std::collections::HashMap::new();
    for paragraph in text.lines().map(str::trim).filter(|p| p.chars().count() >= 20) {
        *seen.entry(paragraph).or_insert(0usize) += 1;
    }
    let repeated = seen.values().filter(|n| **n > 1).count();
    if repeated == 0 {
        return None;
    }
    Some(QcIssue::new(
        IssueKind::Repetition,
        Severity::Major,
        format!("{repeated} paragraph(s) are repeated verbatim."),
    ))
}

/// All quick checks for a chapter draft.
pub fn quick_issues(text: &str, index: u32, total: u32, min_chars: usize) -> Vec<QcIssue> {
    let mut issues = Vec::new();
    issues.extend(check_title(text, index));
    issues.extend(check_length(text, min_chars));
    issues.extend(
        detect_ending_signals(text, index >= total)
            .iter()
            .map(EndingSignal::to_issue),
    );
    issues.extend(check_repetition(text));
    issues
}

/// `10 - Σ penalties`, clamped to 0..=10.
pub fn heuristic_score(issues: &[QcIssue]) -> f64 {
    let penalty: f64 = issues.iter().map(|i| i.severity.penalty()).sum();
    (10.0 - penalty).clamp(0.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premature_ending_detected() {
        let text = "第5章 风雨\n\n林风转身离去，再也没有回头。\n\n全书完";
        let signals = detect_ending_signals(text, false);
        assert!(matches!(
            signals.first(),
            Some(EndingSignal::PrematureEnding { phrase }) if phrase == "全书完"
        ));
    }

    #[test]
    fn test_final_chapter_may_end() {
        let text = "第100章 终局\n\n一切尘埃落定。\n\n（完）";
        assert!(detect_ending_signals(text, true).is_empty());
    }

    #[test]
    fn test_truncation_detected() {
        let signals = detect_ending_signals("第1章 开端\n\n他拔出剑，正要", false);
        assert_eq!(signals, vec![EndingSignal::Truncated { last: '要' }]);
    }

    #[test]
    fn test_chinese_numerals() {
        assert_eq!(parse_chapter_number("十二"), Some(12));
        assert_eq!(parse_chapter_number("一百零五"), Some(105));
        assert_eq!(parse_chapter_number("二十"), Some(20));
        assert_eq!(parse_chapter_number("37"), Some(37));
        assert_eq!(parse_chapter_number("abc"), None);
    }

    #[test]
    fn test_title_format() {
        assert!(check_title("第7章 夜袭\n正文", 7).is_none());
        assert!(check_title("第七章：夜袭\n正文", 7).is_none());
        assert!(check_title("第8章 夜袭\n正文", 7).is_some());
        assert!(check_title("夜袭\n正文", 7).is_some());
        assert!(check_title("第7章\n正文", 7).is_some());
    }

    #[test]
    fn test_length_and_repetition() {
        let text = format!("第1章 开端\n{}", "字".repeat(100));
        assert_eq!(check_length(&text, 150).unwrap().severity, Severity::Minor);
        assert_eq!(check_length(&text, 300).unwrap().severity, Severity::Major);
        assert!(check_length(&text, 100).is_none());

        let para = "这是一段足够长的重复段落，用来测试重复检测是否有效。";
        let repeated = format!("第1章 开端\n{para}\n{para}\n");
        assert!(check_repetition(&repeated).is_some());
    }
}

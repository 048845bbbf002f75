//! Per-section compressors.
//!
//! Pure functions: the same inputs and budget always render the same text.

use super::budget::{char_weight, estimate_tokens};
use super::{ChapterSummary, PriorChapter};
use crate::knowledge::{
    CharacterStateRegistry, NarrativeArc, PacingBeat, PlotGraph, TimelineLedger, UrgencyLevel,
};

// ============================================================================
// Shared helpers
// ============================================================================

/// Longest prefix of `text` within `tokens`.
pub fn truncate_to_tokens(text: &str, tokens: usize) -> String {
    let mut used = 0.0;
    let mut out = String::new();
    for c in text.chars() {
        used += char_weight(c);
        if used > tokens as f64 {
            break;
        }
        out.push(c);
    }
    out
}

/// Longest suffix of `text` within `tokens`.
pub fn tail_to_tokens(text: &str, tokens: usize) -> String {
    let mut used = 0.0;
    let mut kept: Vec<char> = Vec::new();
    for c in text.chars().rev() {
        used += char_weight(c);
        if used > tokens as f64 {
            break;
        }
        kept.push(c);
    }
    kept.into_iter().rev().collect()
}

/// Greedily pack `items` visiting them in `order`, emit in input order.
fn pack_in_order(items: &[String], order: &[usize], budget: usize, sep: &str) -> String {
    let mut chosen = vec![false; items.len()];
    let mut used = 0;
    for &i in order {
        let cost = estimate_tokens(&items[i]) + 1;
        if used + cost <= budget {
            chosen[i] = true;
            used += cost;
        }
    }
    items
        .iter()
        .zip(chosen)
        .filter(|(_, keep)| *keep)
        .map(|(item, _)| item.as_str())
        .collect::<Vec<_>>()
        .join(sep)
}

// ============================================================================
// Setting
// ============================================================================

const CORE_TAGS: &[&str] = &["【核心】", "【重要】", "[core]", "[important]", "#core"];
const CORE_RULE_WORDS: &[&str] = &["规则", "法则", "禁忌", "天道", "rule", "law", "taboo", "forbidden"];
const POWER_WORDS: &[&str] = &["境界", "修为", "功法", "灵力", "真气", "cultivation", "realm", "magic", "power"];
const GEOGRAPHY_WORDS: &[&str] = &["大陆", "山脉", "城", "国", "map", "continent", "city", "kingdom", "mountain"];
const FACTION_WORDS: &[&str] = &["宗门", "门派", "家族", "帝国", "势力", "sect", "clan", "guild", "faction", "empire"];
const HISTORY_WORDS: &[&str] = &["历史", "传说", "年前", "上古", "history", "legend", "ancient"];

fn count_hits(text: &str, words: &[&str]) -> usize {
    words.iter().filter(|w| text.contains(*w)).count()
}

/// Importance of one setting paragraph for this chapter.
pub fn score_setting_paragraph(paragraph: &str, focus_names: &[String]) -> f64 {
    let lowered = paragraph.to_lowercase();
    let mut score = 0.0;
    if CORE_TAGS.iter().any(|t| lowered.contains(t)) {
        score += 10.0;
    }
    score += 4.0 * count_hits(&lowered, CORE_RULE_WORDS).min(2) as f64;
    score += 3.0 * count_hits(&lowered, POWER_WORDS).min(2) as f64;
    score += 2.0 * count_hits(&lowered, GEOGRAPHY_WORDS).min(2) as f64;
    score += 2.0 * count_hits(&lowered, FACTION_WORDS).min(2) as f64;
    score += count_hits(&lowered, HISTORY_WORDS).min(2) as f64;
    let mentions = focus_names
        .iter()
        .filter(|n| !n.is_empty() && lowered.contains(&n.to_lowercase()))
        .count();
    score += 5.0 * mentions.min(3) as f64;
    score
}

/// Keep the most important setting paragraphs that fit, in original order.
pub fn compress_setting(setting: &str, focus_names: &[String], budget: usize) -> String {
    let paragraphs: Vec<String> = if setting.contains("\n\n") {
        setting
            .split("\n\n")
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        setting
            .lines()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect()
    };
    let scores: Vec<f64> = paragraphs
        .iter()
        .map(|p| score_setting_paragraph(p, focus_names))
        .collect();
    let mut order: Vec<usize> = (0..paragraphs.len()).collect();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]).then(a.cmp(&b)));
    pack_in_order(&paragraphs, &order, budget, "\n\n")
}

// ============================================================================
// Characters
// ============================================================================

/// Rank characters for this chapter and render as many as fit.
///
/// Score: +10 when named in the chapter brief, `5 / (1 + age)` for the
/// latest change, +3 for protagonists.
pub fn compress_characters(
    registry: &CharacterStateRegistry,
    focus_text: &str,
    chapter: u32,
    budget: usize,
) -> String {
    let focus = focus_text.to_lowercase();
    let mut ranked: Vec<(f64, &str, String)> = registry
        .iter()
        .map(|s| {
            let mut score = 0.0;
            if focus.contains(&s.name.to_lowercase()) || focus.contains(&s.id.as_str().to_lowercase()) {
                score += 10.0;
            }
            if let Some(last) = s.last_change_chapter() {
                score += 5.0 / (1.0 + f64::from(chapter.saturating_sub(last)));
            }
            if s.protagonist {
                score += 3.0;
            }
            (score, s.id.as_str(), s.render())
        })
        .collect();
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1)));

    let mut out = String::new();
    let mut used = 0;
    for (_, _, block) in ranked {
        let cost = estimate_tokens(&block);
        if used + cost <= budget {
            out.push_str(&block);
            used += cost;
        } else if out.is_empty() {
            out = truncate_to_tokens(&block, budget);
            break;
        } else {
            break;
        }
    }
    out.trim_end().to_string()
}

// ============================================================================
// Plot
// ============================================================================

/// Urgent foreshadowing, then main lines, then fresh threads.
pub fn compress_plot(graph: &PlotGraph, chapter: u32, budget: usize) -> String {
    let mut lines = Vec::new();
    let mut seen = std::collections::BTreeSet::new();

    for (node, urgency) in graph.foreshadowing_by_urgency(chapter) {
        if urgency.level >= UrgencyLevel::High {
            let label = if urgency.level == UrgencyLevel::Critical {
                "CRITICAL"
            } else {
                "HIGH"
            };
            lines.push(format!(
                "[{label}, pay off soon] {}: {} (planted ch{})",
                node.title, node.description, node.introduced_chapter
            ));
            seen.insert(node.id.clone());
        }
    }

    let mut main: Vec<_> = graph
        .active_nodes()
        .filter(|n| n.kind.is_main_line() && n.importance >= 6 && !seen.contains(&n.id))
        .collect();
    main.sort_by(|a, b| b.importance.cmp(&a.importance).then_with(|| a.id.cmp(&b.id)));
    for node in main {
        lines.push(format!(
            "[main line, importance {}] {}: {}",
            node.importance, node.title, node.description
        ));
        seen.insert(node.id.clone());
    }

    let since = chapter.saturating_sub(3);
    let mut recent: Vec<_> = graph
        .nodes
        .values()
        .filter(|n| n.introduced_chapter >= since && n.introduced_chapter < chapter && !seen.contains(&n.id))
        .collect();
    recent.sort_by(|a, b| b.introduced_chapter.cmp(&a.introduced_chapter).then_with(|| a.id.cmp(&b.id)));
    for node in recent {
        lines.push(format!(
            "[recent, ch{}] {}: {}",
            node.introduced_chapter, node.title, node.description
        ));
    }

    let order: Vec<usize> = (0..lines.len()).collect();
    pack_in_order(&lines, &order, budget, "\n")
}

// ============================================================================
// Timeline
// ============================================================================

/// In-progress events, upcoming events, and keys that must not be re-narrated.
///
/// Packing priority is in-progress, then completed keys, then upcoming.
pub fn compress_timeline(ledger: &TimelineLedger, budget: usize) -> String {
    let in_progress: Vec<String> = ledger
        .in_progress()
        .map(|e| format!("- (in progress) {}: {}", e.title, e.description))
        .collect();
    let upcoming: Vec<String> = ledger
        .upcoming()
        .map(|e| format!("- (upcoming) {}", e.title))
        .collect();
    let mut completed: Vec<_> = ledger.completed().collect();
    completed.sort_by(|a, b| b.completed_chapter.cmp(&a.completed_chapter));

    let mut used = 0;
    let mut take = |line: &str| {
        let cost = estimate_tokens(line) + 1;
        if used + cost <= budget {
            used += cost;
            true
        } else {
            false
        }
    };

    let kept_progress: Vec<&String> = in_progress.iter().filter(|l| take(l)).collect();
    let header = "Completed beats (never re-narrate):";
    let mut kept_keys = Vec::new();
    if !completed.is_empty() && take(header) {
        for event in completed {
            let line = format!("- {}", event.unique_key);
            if take(&line) {
                kept_keys.push(line);
            }
        }
    }
    let kept_upcoming: Vec<&String> = upcoming.iter().filter(|l| take(l)).collect();

    let mut out: Vec<&str> = Vec::new();
    out.extend(kept_progress.iter().map(|s| s.as_str()));
    out.extend(kept_upcoming.iter().map(|s| s.as_str()));
    if !kept_keys.is_empty() {
        out.push(header);
        out.extend(kept_keys.iter().map(String::as_str));
    }
    out.join("\n")
}

// ============================================================================
// Rolling summary
// ============================================================================

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    match text.char_indices().find(|(_, c)| matches!(c, '。' | '！' | '？' | '.' | '!' | '?')) {
        Some((i, c)) => &text[..i + c.len_utf8()],
        None => text,
    }
}

/// Newest three summaries verbatim, older ones reduced to their first
/// sentence; packed newest first and emitted in chapter order.
pub fn compress_summary(summaries: &[ChapterSummary], budget: usize) -> String {
    let mut sorted: Vec<&ChapterSummary> = summaries.iter().collect();
    sorted.sort_by_key(|s| s.chapter);

    let lines: Vec<String> = sorted
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let from_end = sorted.len() - i;
            let text = if from_end <= 3 {
                s.summary.trim()
            } else {
                first_sentence(&s.summary)
            };
            format!("ch{}: {}", s.chapter, text)
        })
        .collect();
    let order: Vec<usize> = (0..lines.len()).rev().collect();
    pack_in_order(&lines, &order, budget, "\n")
}

// ============================================================================
// Recent prose
// ============================================================================

/// Latest chapter nearly whole (80%), tail of the one before (20%).
pub fn compress_recent(chapters: &[PriorChapter], budget: usize) -> String {
    let mut sorted: Vec<&PriorChapter> = chapters.iter().collect();
    sorted.sort_by_key(|c| c.index);
    let Some(latest) = sorted.pop() else {
        return String::new();
    };
    let prior = sorted.pop();

    let latest_budget = if prior.is_some() { budget * 4 / 5 } else { budget };
    let latest_text = if estimate_tokens(&latest.text) <= latest_budget {
        latest.text.trim().to_string()
    } else {
        format!("…{}", tail_to_tokens(latest.text.trim(), latest_budget.saturating_sub(2)))
    };

    match prior {
        Some(prior) => {
            let prior_budget = budget.saturating_sub(estimate_tokens(&latest_text)).min(budget / 5);
            let tail = tail_to_tokens(prior.text.trim(), prior_budget.saturating_sub(2));
            if tail.is_empty() {
                format!("[ch{}]\n{}", latest.index, latest_text)
            } else {
                format!(
                    "[ch{} ending]\n…{}\n\n[ch{}]\n{}",
                    prior.index, tail, latest.index, latest_text
                )
            }
        }
        None => format!("[ch{}]\n{}", latest.index, latest_text),
    }
}

// ============================================================================
// Pacing guide
// ============================================================================

pub fn render_pacing(beat: &PacingBeat, arc: &NarrativeArc, total_chapters: u32) -> String {
    let mut out = format!(
        "Chapter {} of {}: {} (tension {}/10)\n{}",
        beat.chapter,
        total_chapters,
        beat.pacing,
        beat.tension,
        beat.pacing.guidance()
    );
    let recent = arc.recent_observed(3);
    if !recent.is_empty() {
        let listing: Vec<String> = recent
            .iter()
            .map(|b| format!("ch{} {}", b.chapter, b.pacing))
            .collect();
        out.push_str(&format!("\nRecent pacing: {}", listing.join(", ")));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::{
        EventKind, EventStatus, NewPlotNode, PlotNodeKind, PlotUpdate, ProposedEvent,
        TimelineUpdate,
    };

    #[test]
    fn test_truncate_and_tail() {
        assert_eq!(truncate_to_tokens("林风出山了", 3), "林风");
        assert_eq!(tail_to_tokens("林风出山了", 3), "山了");
    }

    #[test]
    fn test_setting_prefers_tagged_paragraphs_in_order() {
        let setting = "天气晴朗，鸟语花香。\n\n【核心】修为境界分为炼气、筑基、金丹。\n\n青云宗位于东海之滨。";
        let packed = compress_setting(setting, &[], 30);
        assert!(packed.contains("【核心】"));
        assert!(!packed.contains("鸟语花香"));

        let all = compress_setting(setting, &[], 1_000);
        let core = all.find("【核心】").unwrap();
        let weather = all.find("天气").unwrap();
        assert!(weather < core);
    }

    #[test]
    fn test_summary_keeps_recent_verbatim() {
        let summaries: Vec<ChapterSummary> = (1..=5)
            .map(|i| ChapterSummary {
                chapter: i,
                summary: format!("第{i}章发生了大事。后续余波未平。"),
            })
            .collect();
        let text = compress_summary(&summaries, 1_000);
        assert!(text.starts_with("ch1: 第1章发生了大事。\n"));
        assert!(text.ends_with("ch5: 第5章发生了大事。后续余波未平。"));

        // A tight budget keeps the newest chapters.
        let tight = compress_summary(&summaries, 30);
        assert!(tight.contains("ch5"));
        assert!(!tight.contains("ch1"));
    }

    #[test]
    fn test_recent_keeps_latest_whole_and_prior_tail() {
        let chapters = vec![
            PriorChapter {
                index: 1,
                text: "开头".repeat(200) + "上一章的结尾",
            },
            PriorChapter {
                index: 2,
                text: "最新一章全文".into(),
            },
        ];
        let text = compress_recent(&chapters, 100);
        assert!(text.contains("最新一章全文"));
        assert!(text.contains("上一章的结尾"));
        assert!(!text.contains(&"开头".repeat(50)));
    }

    #[test]
    fn test_plot_lists_urgent_foreshadowing_first() {
        let graph = PlotGraph::default().apply(
            &PlotUpdate {
                new_nodes: vec![
                    NewPlotNode {
                        key: "a".into(),
                        kind: PlotNodeKind::Conflict,
                        title: "宗门之争".into(),
                        description: "两派相争".into(),
                        importance: 7,
                        participants: vec![],
                    },
                    NewPlotNode {
                        key: "b".into(),
                        kind: PlotNodeKind::Foreshadowing,
                        title: "玉佩之谜".into(),
                        description: "玉佩发光".into(),
                        importance: 9,
                        participants: vec![],
                    },
                ],
                ..PlotUpdate::default()
            },
            1,
        );
        let text = compress_plot(&graph, 30, 1_000);
        let urgent = text.find("玉佩之谜").unwrap();
        let main = text.find("宗门之争").unwrap();
        assert!(urgent < main);
        assert!(text.starts_with("[CRITICAL"));
    }

    #[test]
    fn test_timeline_lists_completed_keys() {
        let ledger = TimelineLedger::default()
            .apply(
                &TimelineUpdate {
                    events: vec![ProposedEvent {
                        unique_key: "master dies".into(),
                        kind: EventKind::Plot,
                        title: "师父陨落".into(),
                        description: String::new(),
                        status: EventStatus::Completed,
                        participants: vec![],
                    }],
                },
                4,
            )
            .ledger;
        let text = compress_timeline(&ledger, 200);
        assert!(text.contains("never re-narrate"));
        assert!(text.contains("- master dies"));
    }
}

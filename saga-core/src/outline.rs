//! The book outline.

use crate::error::{SchemaError, SchemaResult};
use crate::knowledge::PacingType;
use crate::schema::{self, objects_any, str_any, u32_any};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const CHAPTER_ALIASES: &[&str] = &["chapters", "outline", "items", "chapterList"];
const INDEX_ALIASES: &[&str] = &["index", "chapter", "number", "no", "chapterNumber"];
const TITLE_ALIASES: &[&str] = &["title", "name", "chapterTitle"];
const GOAL_ALIASES: &[&str] = &["goal", "summary", "description", "hint", "content"];
const MILESTONE_ALIASES: &[&str] = &["milestones", "keyPoints", "climaxes", "turningPoints"];

/// One planned chapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlineChapter {
    pub index: u32,
    pub title: String,
    pub goal: String,
    #[serde(default)]
    pub pacing_hint: Option<PacingType>,
}

/// A structural high point of the book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub chapter: u32,
    pub description: String,
}

/// A book outline in canonical form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outline {
    pub title: String,
    pub target_chapters: u32,
    pub chapters: Vec<OutlineChapter>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

impl Outline {
    /// Normalize a model reply into an outline.
    ///
    /// Chapters without a usable index take the position they appear at.
    /// Chapters are kept in reply order so that duplicates and gaps remain
    /// visible to the evaluator.
    pub fn from_model_json(text: &str, target_chapters: u32) -> SchemaResult<Self> {
        let obj = schema::parse_object(text)?;
        Self::from_object(&obj, target_chapters)
    }

    fn from_object(obj: &Map<String, Value>, target_chapters: u32) -> SchemaResult<Self> {
        let raw_chapters = objects_any(obj, CHAPTER_ALIASES);
        if raw_chapters.is_empty() {
            return Err(SchemaError::MissingField {
                field: "chapters".to_string(),
            });
        }

        let chapters = raw_chapters
            .into_iter()
            .enumerate()
            .map(|(pos, ch)| {
                let index = u32_any(ch, INDEX_ALIASES).unwrap_or(pos as u32 + 1);
                OutlineChapter {
                    index,
                    title: str_any(ch, TITLE_ALIASES).unwrap_or_default(),
                    goal: str_any(ch, GOAL_ALIASES).unwrap_or_default(),
                    pacing_hint: str_any(ch, &["pacing", "pacingType", "pace"])
                        .and_then(|raw| PacingType::parse(&raw)),
                }
            })
            .collect();

        let milestones = match schema::array_any(obj, MILESTONE_ALIASES) {
            Some(items) => items.iter().filter_map(parse_milestone).collect(),
            None => Vec::new(),
        };

        Ok(Self {
            title: str_any(obj, &["title", "bookTitle", "name"]).unwrap_or_default(),
            target_chapters,
            chapters,
            milestones,
        })
    }

    /// The entry for chapter `index`, if planned.
    pub fn chapter(&self, index: u32) -> Option<&OutlineChapter> {
        self.chapters.iter().find(|c| c.index == index)
    }

    /// Whether `index` carries a milestone.
    pub fn is_milestone(&self, index: u32) -> bool {
        self.milestones.iter().any(|m| m.chapter == index)
    }

    /// Compact listing used in prompts.
    pub fn render_brief(&self) -> String {
        let mut out = format!("《{}》 ({} chapters)\n", self.title, self.target_chapters);
        for ch in &self.chapters {
            out.push_str(&format!("{}. {}: {}\n", ch.index, ch.title, ch.goal));
        }
        if !self.milestones.is_empty() {
            out.push_str("Milestones:\n");
            for m in &self.milestones {
                out.push_str(&format!("- ch{}: {}\n", m.chapter, m.description));
            }
        }
        out
    }
}

fn parse_milestone(value: &Value) -> Option<Milestone> {
    match value {
        Value::Object(obj) => Some(Milestone {
            chapter: u32_any(obj, INDEX_ALIASES)?,
            description: str_any(obj, &["description", "title", "event", "summary"])
                .unwrap_or_default(),
        }),
        Value::Number(n) => Some(Milestone {
            chapter: u32::try_from(n.as_u64()?).ok()?,
            description: String::new(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_model_json_with_aliases() {
        let reply = r#"```json
        {
            "bookTitle": "风起青萍",
            "outline": [
                {"no": "第1章", "name": "少年", "summary": "林风在山村醒来，发现自己失去了记忆"},
                {"chapter": 2, "title": "出山", "goal": "林风离开山村踏上寻找身世之旅", "pacing": "rising"},
                {"title": "无序号", "hint": "索引缺失时按位置补齐"}
            ],
            "keyPoints": [{"chapter": 2, "event": "离乡"}, 3]
        }
        ```"#;
        let outline = Outline::from_model_json(reply, 3).unwrap();
        assert_eq!(outline.title, "风起青萍");
        assert_eq!(outline.chapters.len(), 3);
        assert_eq!(outline.chapters[0].index, 1);
        assert_eq!(outline.chapters[1].pacing_hint, Some(PacingType::Rising));
        assert_eq!(outline.chapters[2].index, 3);
        assert_eq!(outline.milestones.len(), 2);
        assert!(outline.is_milestone(2));
        assert_eq!(outline.chapter(2).unwrap().title, "出山");
    }

    #[test]
    fn test_missing_chapters_is_an_error() {
        let err = Outline::from_model_json(r#"{"title": "x"}"#, 10).unwrap_err();
        assert!(matches!(err, SchemaError::MissingField { .. }));
    }
}

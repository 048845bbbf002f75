//! Semantic cache for rendered context.
//!
//! One slot per `(project, kind, chapter)`. A slot is valid only for the
//! [`StateVersion`] and contributing store stamps it was rendered from, so a
//! store bump invalidates exactly the kinds that read that store.

use super::budget::Section;
use crate::ids::ProjectId;
use crate::knowledge::{StoreKind, StoreStamp, StoreVersions};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Distinct chapters whose slots a project keeps; the lowest go first.
const MAX_CACHED_CHAPTERS: usize = 4;

/// What a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentKind {
    Section(Section),
    Assembled,
}

impl ContentKind {
    /// Stores whose changes invalidate this kind.
    pub fn stores(&self) -> &'static [StoreKind] {
        match self {
            ContentKind::Section(Section::Summary) | ContentKind::Section(Section::RecentProse) => &[],
            // Setting paragraphs are ranked by the names of characters in focus.
            ContentKind::Section(Section::Setting) | ContentKind::Section(Section::Characters) => {
                &[StoreKind::Characters]
            }
            ContentKind::Section(Section::Plot) => &[StoreKind::Plot],
            ContentKind::Section(Section::Timeline) => &[StoreKind::Timeline],
            ContentKind::Section(Section::Pacing) => &[StoreKind::Arc],
            ContentKind::Assembled => &StoreKind::ALL,
        }
    }

    /// Stamps of the contributing stores.
    pub fn components(&self, versions: &StoreVersions) -> Vec<(StoreKind, StoreStamp)> {
        self.stores()
            .iter()
            .map(|kind| (*kind, versions.get(*kind)))
            .collect()
    }
}

/// Deterministic 64-bit digest of a chapter and the inputs it was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateVersion(pub u64);

impl StateVersion {
    /// Combine the chapter, contributing store stamps and any extra input
    /// digests (section budget, raw text fingerprints).
    pub fn compute(chapter: u32, components: &[(StoreKind, StoreStamp)], extra: &[u64]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"saga-context-version-v1");
        hasher.update(chapter.to_le_bytes());
        for (kind, stamp) in components {
            hasher.update([*kind as u8]);
            hasher.update(stamp.version.to_le_bytes());
            hasher.update(stamp.last_updated_chapter.to_le_bytes());
        }
        for value in extra {
            hasher.update(value.to_le_bytes());
        }
        Self(truncate(hasher))
    }

    /// Fold several versions into one.
    pub fn combine(chapter: u32, parts: &[StateVersion]) -> Self {
        let extra: Vec<u64> = parts.iter().map(|v| v.0).collect();
        Self::compute(chapter, &[], &extra)
    }
}

impl std::fmt::Display for StateVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Stable digest of raw text inputs.
pub fn fingerprint(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_le_bytes());
        hasher.update(part.as_bytes());
    }
    truncate(hasher)
}

/// First eight bytes of the SHA-256 digest.
fn truncate(hasher: Sha256) -> u64 {
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Full address of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub project: ProjectId,
    pub kind: ContentKind,
    pub chapter: u32,
    pub version: StateVersion,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    version: StateVersion,
    components: Vec<(StoreKind, StoreStamp)>,
    text: String,
}

type ProjectSlots = HashMap<(ContentKind, u32), CacheEntry>;

/// Rendered-context cache shared by all runs in a process.
///
/// Namespaced by project; runs on different projects never touch each
/// other's slots.
#[derive(Debug, Default)]
pub struct SemanticCache {
    projects: RwLock<HashMap<ProjectId, ProjectSlots>>,
}

impl SemanticCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached text for `key`, if it was rendered from the same components.
    pub fn get(&self, key: &CacheKey, components: &[(StoreKind, StoreStamp)]) -> Option<String> {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        let entry = projects.get(&key.project)?.get(&(key.kind, key.chapter))?;
        if entry.version == key.version && entry.components == components {
            debug!(kind = ?key.kind, chapter = key.chapter, "Context cache hit");
            Some(entry.text.clone())
        } else {
            debug!(kind = ?key.kind, chapter = key.chapter, "Context cache stale");
            None
        }
    }

    /// Store (or overwrite) the slot for `key`.
    ///
    /// A project keeps slots for at most [`MAX_CACHED_CHAPTERS`] chapters;
    /// the lowest-numbered chapters other than `key.chapter` are evicted.
    pub fn put(&self, key: &CacheKey, components: Vec<(StoreKind, StoreStamp)>, text: String) {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        let slots = projects.entry(key.project).or_default();
        slots.insert(
            (key.kind, key.chapter),
            CacheEntry {
                version: key.version,
                components,
                text,
            },
        );

        let mut chapters: Vec<u32> = slots.keys().map(|(_, chapter)| *chapter).collect();
        chapters.sort_unstable();
        chapters.dedup();
        if chapters.len() > MAX_CACHED_CHAPTERS {
            let cutoff = chapters[chapters.len() - MAX_CACHED_CHAPTERS];
            slots.retain(|(_, chapter), _| *chapter >= cutoff || *chapter == key.chapter);
            debug!(project = %key.project, cutoff, "Evicted old context slots");
        }
    }

    /// Drop every slot of `project`.
    pub fn invalidate_project(&self, project: ProjectId) {
        let mut projects = self.projects.write().unwrap_or_else(|e| e.into_inner());
        projects.remove(&project);
    }

    /// Number of slots across all projects.
    pub fn len(&self) -> usize {
        let projects = self.projects.read().unwrap_or_else(|e| e.into_inner());
        projects.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(project: ProjectId, version: u64) -> CacheKey {
        CacheKey {
            project,
            kind: ContentKind::Section(Section::Plot),
            chapter: 3,
            version: StateVersion(version),
        }
    }

    #[test]
    fn test_state_version_is_deterministic() {
        let components = [(StoreKind::Plot, StoreStamp::new(2, 5))];
        let a = StateVersion::compute(6, &components, &[42]);
        let b = StateVersion::compute(6, &components, &[42]);
        assert_eq!(a, b);
        assert_ne!(a, StateVersion::compute(7, &components, &[42]));
        assert_ne!(
            a,
            StateVersion::compute(6, &[(StoreKind::Plot, StoreStamp::new(3, 5))], &[42])
        );
    }

    #[test]
    fn test_put_get_and_overwrite() {
        let cache = SemanticCache::new();
        let project = ProjectId::new();
        let components = vec![(StoreKind::Plot, StoreStamp::new(1, 2))];

        cache.put(&key(project, 1), components.clone(), "v1".into());
        assert_eq!(cache.get(&key(project, 1), &components), Some("v1".into()));
        assert_eq!(cache.get(&key(project, 2), &components), None);

        cache.put(&key(project, 2), components.clone(), "v2".into());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(project, 1), &components), None);
    }

    #[test]
    fn test_component_mismatch_is_a_miss() {
        let cache = SemanticCache::new();
        let project = ProjectId::new();
        cache.put(&key(project, 1), vec![(StoreKind::Plot, StoreStamp::new(1, 2))], "x".into());
        assert_eq!(
            cache.get(&key(project, 1), &[(StoreKind::Plot, StoreStamp::new(2, 2))]),
            None
        );
    }

    #[test]
    fn test_invalidate_project_is_namespaced() {
        let cache = SemanticCache::new();
        let a = ProjectId::new();
        let b = ProjectId::new();
        cache.put(&key(a, 1), vec![], "a".into());
        cache.put(&key(b, 1), vec![], "b".into());
        cache.invalidate_project(a);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key(b, 1), &[]), Some("b".into()));
    }

    #[test]
    fn test_fingerprint_is_length_prefixed() {
        assert_eq!(fingerprint(&["林风", "出山"]), fingerprint(&["林风", "出山"]));
        assert_ne!(fingerprint(&["ab", "c"]), fingerprint(&["a", "bc"]));
        assert_ne!(fingerprint(&[]), fingerprint(&[""]));
    }

    #[test]
    fn test_setting_follows_character_store() {
        let kind = ContentKind::Section(Section::Setting);
        assert_eq!(kind.stores(), &[StoreKind::Characters]);

        let cache = SemanticCache::new();
        let project = ProjectId::new();
        let setting_key = CacheKey {
            project,
            kind,
            chapter: 3,
            version: StateVersion(1),
        };
        let before = vec![(StoreKind::Characters, StoreStamp::new(1, 2))];
        cache.put(&setting_key, before.clone(), "青云山".into());
        assert_eq!(cache.get(&setting_key, &before), Some("青云山".into()));
        let after = vec![(StoreKind::Characters, StoreStamp::new(2, 3))];
        assert_eq!(cache.get(&setting_key, &after), None);
    }

    #[test]
    fn test_slots_are_bounded_per_project() {
        let cache = SemanticCache::new();
        let project = ProjectId::new();
        let other = ProjectId::new();
        cache.put(&key(other, 1), vec![], "other".into());
        for chapter in 1..=10 {
            for kind in [ContentKind::Section(Section::Plot), ContentKind::Assembled] {
                let k = CacheKey {
                    project,
                    kind,
                    chapter,
                    version: StateVersion(u64::from(chapter)),
                };
                cache.put(&k, vec![], format!("第{chapter}章"));
            }
        }
        assert_eq!(cache.len(), MAX_CACHED_CHAPTERS * 2 + 1);

        let newest = CacheKey {
            project,
            kind: ContentKind::Assembled,
            chapter: 10,
            version: StateVersion(10),
        };
        assert_eq!(cache.get(&newest, &[]), Some("第10章".into()));
        let oldest = CacheKey {
            chapter: 1,
            version: StateVersion(1),
            ..newest
        };
        assert_eq!(cache.get(&oldest, &[]), None);
        assert_eq!(cache.get(&key(other, 1), &[]), Some("other".into()));
    }
}

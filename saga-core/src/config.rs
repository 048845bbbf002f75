//! Engine configuration.
//!
//! Every field has a default so a missing file, an empty file, or a partial
//! file all produce a usable configuration. Files are TOML.

use crate::context::Section;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a [`Session`](crate::session::Session).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub completion: CompletionConfig,
    pub generation: GenerationConfig,
    pub qc: QcConfig,
    pub repair: RepairConfig,
    pub context: ContextConfig,
    pub outline: OutlineConfig,
    pub planner: PlannerConfig,
}

impl EngineConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file. `SAGA_MODEL` overrides the configured model.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        Ok(config)
    }

    /// Apply environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(model) = std::env::var("SAGA_MODEL") {
            if !model.trim().is_empty() {
                self.completion.model = model.trim().to_string();
            }
        }
    }

    /// Reject values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field: field.to_string(),
                reason: reason.to_string(),
            }
        }

        if self.completion.timeout_secs == 0 {
            return Err(invalid("completion.timeout_secs", "must be positive"));
        }
        if self.generation.min_chars == 0 {
            return Err(invalid("generation.min_chars", "must be positive"));
        }
        for (field, value) in [
            ("qc.pass_threshold", self.qc.pass_threshold),
            ("outline.target_score", self.outline.target_score),
        ] {
            if !(0.0..=10.0).contains(&value) {
                return Err(invalid(field, "must be within 0..=10"));
            }
        }
        if self.outline.max_attempts == 0 {
            return Err(invalid("outline.max_attempts", "must be at least 1"));
        }
        if self.context.total_tokens < 500 {
            return Err(invalid("context.total_tokens", "must be at least 500"));
        }
        if let Some(allocation) = &self.context.allocation {
            if let Some(name) = allocation.keys().find(|k| Section::from_name(k).is_none()) {
                return Err(invalid("context.allocation", &format!("unknown section '{name}'")));
            }
            if allocation.values().any(|v| !v.is_finite() || *v < 0.0) {
                return Err(invalid("context.allocation", "fractions must be non-negative"));
            }
            if allocation.values().sum::<f64>() <= 0.0 {
                return Err(invalid("context.allocation", "fractions must not all be zero"));
            }
        }
        let weights = &self.qc.deep_weights;
        if weights.heuristic + weights.character_consistency + weights.pacing_alignment
            + weights.goal_achievement
            <= 0.0
        {
            return Err(invalid("qc.deep_weights", "weights must not all be zero"));
        }
        Ok(())
    }
}

/// Text-completion collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Model name passed to the provider.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Per-attempt deadline.
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// First backoff step for ordinary failures.
    pub base_backoff_ms: u64,
    /// First backoff step for rate-limit failures.
    pub rate_limit_backoff_ms: u64,
    /// Upper bound for any single backoff.
    pub max_backoff_ms: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet-4-20250514".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            timeout_secs: 180,
            max_retries: 3,
            base_backoff_ms: 1_000,
            rate_limit_backoff_ms: 10_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Chapter generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: usize,
    /// Minimum chapter length in characters.
    pub min_chars: usize,
    /// Self-correction rounds for premature endings.
    pub max_rewrite_attempts: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.85,
            max_output_tokens: 8_192,
            min_chars: 2_000,
            max_rewrite_attempts: 2,
        }
    }
}

/// When the model-assisted QC pass runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepQcPolicy {
    pub enabled: bool,
    /// Run on every n-th chapter (1 = every chapter).
    pub every_n_chapters: u32,
    /// Always run on the book's final chapter.
    pub always_on_final: bool,
}

impl Default for DeepQcPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            every_n_chapters: 1,
            always_on_final: true,
        }
    }
}

impl DeepQcPolicy {
    /// Whether the deep pass should run for `index` of `total`.
    pub fn applies_to(&self, index: u32, total: u32) -> bool {
        if !self.enabled {
            return false;
        }
        if self.always_on_final && index == total {
            return true;
        }
        let every = self.every_n_chapters.max(1);
        index % every == 0
    }
}

/// Weights used to merge heuristic and model-judged chapter scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeepWeights {
    pub heuristic: f64,
    pub character_consistency: f64,
    pub pacing_alignment: f64,
    pub goal_achievement: f64,
}

impl Default for DeepWeights {
    fn default() -> Self {
        Self {
            heuristic: 0.4,
            character_consistency: 0.2,
            pacing_alignment: 0.2,
            goal_achievement: 0.2,
        }
    }
}

/// Quality-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QcConfig {
    pub pass_threshold: f64,
    pub deep: DeepQcPolicy,
    pub deep_weights: DeepWeights,
}

impl Default for QcConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 7.0,
            deep: DeepQcPolicy::default(),
            deep_weights: DeepWeights::default(),
        }
    }
}

/// Repair loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    /// Repair rounds allowed per chapter.
    pub max_attempts: u32,
    /// Commit the best candidate when repairs run out instead of failing the chapter.
    pub best_effort_commit: bool,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            best_effort_commit: true,
        }
    }
}

/// Context assembly settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub total_tokens: usize,
    /// Overrides for the base section fractions, keyed by section name;
    /// renormalized on use.
    pub allocation: Option<BTreeMap<String, f64>>,
}

impl ContextConfig {
    /// Allocation overrides with recognized section names.
    pub fn section_overrides(&self) -> BTreeMap<Section, f64> {
        self.allocation
            .iter()
            .flatten()
            .filter_map(|(name, fraction)| Section::from_name(name).map(|s| (s, *fraction)))
            .collect()
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            total_tokens: 12_000,
            allocation: None,
        }
    }
}

/// Outline pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlineConfig {
    pub target_score: f64,
    pub max_attempts: u32,
    pub temperature: f32,
    pub max_output_tokens: usize,
    pub deep_review: bool,
}

impl Default for OutlineConfig {
    fn default() -> Self {
        Self {
            target_score: 7.5,
            max_attempts: 3,
            temperature: 0.7,
            max_output_tokens: 16_000,
            deep_review: false,
        }
    }
}

/// Planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Ask the model for each decision (always normalized).
    pub model_assisted: bool,
    pub timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            model_assisted: false,
            timeout_secs: 30,
        }
    }
}

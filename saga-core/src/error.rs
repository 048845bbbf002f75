//! Error types for the engine.
//!
//! One enum per layer, all defined with thiserror and folded into
//! [`EngineError`] with `#[from]` so tools can use `?` throughout.

use std::time::Duration;

/// Main error type for the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The text-completion collaborator failed after retries.
    #[error("Completion error: {0}")]
    Completion(#[from] CompletionError),

    /// A structured model reply did not match its expected shape.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The persistence collaborator failed.
    #[error("Persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A tool was dispatched without the state it requires.
    #[error("Precondition violated for tool '{tool}': {reason}")]
    Precondition { tool: String, reason: String },

    /// Another writer advanced the chapter counter while this draft was in flight.
    #[error("Commit conflict on chapter {chapter}: expected next index {expected}, found {found}")]
    Conflict { chapter: u32, expected: u32, found: u32 },

    /// A draft failed quality control and may not be committed.
    #[error("Chapter {chapter} rejected by quality control (score {score:.1})")]
    QualityRejected { chapter: u32, score: f64 },

    /// Every outline attempt failed before a draft could be evaluated.
    #[error("No usable outline after {attempts} attempts: {last}")]
    OutlineFailed { attempts: u32, last: String },

    /// A tool name was registered twice.
    #[error("Tool already registered: {name}")]
    DuplicateTool { name: String },

    /// The planner named a tool that is not registered.
    #[error("Tool not found: {name}")]
    ToolNotFound { name: String },
}

impl EngineError {
    /// Build a precondition error for `tool`.
    pub fn precondition(tool: impl ToString, reason: impl Into<String>) -> Self {
        EngineError::Precondition {
            tool: tool.to_string(),
            reason: reason.into(),
        }
    }

    /// Concurrency conflicts are never swallowed by the orchestrator.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict { .. })
    }
}

/// Failures of the text-completion collaborator.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    /// A single attempt exceeded its deadline.
    #[error("Completion timed out after {duration:?}")]
    Timeout { duration: Duration },

    /// The provider asked us to slow down.
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// The provider answered with an error status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Connection-level failure.
    #[error("Network error: {0}")]
    Network(String),

    /// The provider answered with no text.
    #[error("Completion returned empty text")]
    Empty,

    /// The client is misconfigured (missing key, bad model name).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Every retry failed.
    #[error("Completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl CompletionError {
    /// Whether another attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Timeout { .. }
            | CompletionError::RateLimited { .. }
            | CompletionError::Network(_)
            | CompletionError::Empty => true,
            CompletionError::Api { status, .. } => *status >= 500 || *status == 408,
            CompletionError::Configuration(_) | CompletionError::Exhausted { .. } => false,
        }
    }

    /// Rate-limit class failures back off longer.
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, CompletionError::RateLimited { .. })
    }
}

impl From<claude::Error> for CompletionError {
    fn from(err: claude::Error) -> Self {
        match err {
            claude::Error::NoApiKey => {
                CompletionError::Configuration("ANTHROPIC_API_KEY not set".to_string())
            }
            claude::Error::Config(msg) => CompletionError::Configuration(msg),
            claude::Error::Network(msg) => CompletionError::Network(msg),
            claude::Error::Timeout => CompletionError::Timeout {
                duration: Duration::ZERO,
            },
            claude::Error::RateLimited { retry_after } => {
                CompletionError::RateLimited { retry_after }
            }
            claude::Error::Api { status, message } => CompletionError::Api { status, message },
            claude::Error::Parse(msg) => CompletionError::Network(format!("unreadable reply: {msg}")),
        }
    }
}

/// A structured model reply failed validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    /// No JSON value could be parsed.
    #[error("Reply is not valid JSON: {0}")]
    NotJson(String),

    /// JSON parsed but is not an object.
    #[error("Reply is not a JSON object")]
    NotObject,

    /// A required field is absent under every accepted alias.
    #[error("Missing required field '{field}'")]
    MissingField { field: String },

    /// A required string field is blank.
    #[error("Field '{field}' must not be empty")]
    EmptyField { field: String },

    /// A field holds a value outside its enumeration.
    #[error("Field '{field}' has invalid value '{value}'")]
    InvalidEnum { field: String, value: String },

    /// An array exceeds its bound.
    #[error("Field '{field}' has {found} items, at most {max} allowed")]
    TooMany {
        field: String,
        max: usize,
        found: usize,
    },
}

/// Persistence collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// The progress row moved since the caller read it.
    #[error("Progress moved: expected next index {expected}, found {found}")]
    Conflict { expected: u32, found: u32 },
}

/// Configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type for collaborator calls.
pub type CompletionResult<T> = std::result::Result<T, CompletionError>;

/// Result type for schema validation.
pub type SchemaResult<T> = std::result::Result<T, SchemaError>;

/// Result type for persistence operations.
pub type PersistResult<T> = std::result::Result<T, PersistError>;

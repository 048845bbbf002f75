//! Orchestration engine for long-form serialized fiction.
//!
//! This crate provides:
//! - An outline pipeline that drafts, scores and revises a chapter plan
//! - A chapter pipeline that writes, checks, repairs and commits chapters
//! - Four knowledge stores (characters, plot, timeline, pacing) updated after
//!   every commit and fed back through a token-budgeted, cached context
//! - A planner whose decisions are always normalized against a phase table,
//!   so an unreliable model can never drive a run into an illegal state
//!
//! # Quick Start
//!
//! ```ignore
//! use saga_core::{ClaudeFactory, EngineConfig, JsonDirStore, ProjectId, SemanticCache, Session};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(
//!         EngineConfig::default(),
//!         &ClaudeFactory,
//!         Arc::new(JsonDirStore::new("books")),
//!         Arc::new(SemanticCache::new()),
//!     )?;
//!
//!     let project = ProjectId::new();
//!     session.plan_outline(project, "A detective in a city that forgets", 30).await?;
//!     let report = session.write_chapters(project, 3, || false).await?;
//!     println!("next chapter: {}", report.next_chapter_index);
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod config;
pub mod context;
pub mod error;
pub mod generation;
pub mod ids;
pub mod knowledge;
pub mod orchestrator;
pub mod outline;
pub mod persist;
pub mod planner;
pub mod qc;
pub mod schema;
pub mod session;
pub mod state;
pub mod testing;
pub mod tools;

// Primary public API
pub use completion::{ClaudeFactory, ClientFactory, CompletionRequest, ResilientCompletion, RetryPolicy, TextCompletion};
pub use config::EngineConfig;
pub use context::{ContextBudget, ContextEngine, SemanticCache};
pub use error::{CompletionError, ConfigError, EngineError, PersistError, Result, SchemaError};
pub use ids::{CharacterId, ProjectId};
pub use knowledge::{KnowledgeBundle, RelationshipGraph};
pub use orchestrator::{hard_limit, Orchestrator};
pub use outline::Outline;
pub use persist::{JsonDirStore, MemoryStore, ProjectStore};
pub use qc::QcVerdict;
pub use session::{BatchReport, OutlineReport, ProjectStatus, Session};
pub use testing::{ScriptedCompletion, ScriptedFactory};

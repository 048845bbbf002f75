//! Command-line front end for the saga writing engine.
//!
//! ```bash
//! saga outline --goal "A detective in a city that forgets" --chapters 30
//! saga write --project <uuid> --count 3
//! saga status --project <uuid>
//! ```
//!
//! Projects live under `--data` (default `books/`). Set `RUST_LOG=info` to
//! follow the orchestrator.

use anyhow::Context;
use clap::{Parser, Subcommand};
use saga_core::{
    ClaudeFactory, EngineConfig, JsonDirStore, ProjectId, ProjectStatus, ProjectStore, RelationshipGraph, SemanticCache,
    Session,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "saga", version, about = "Plan and write serialized novels")]
struct Cli {
    /// Directory holding all projects
    #[arg(long, global = true, default_value = "books")]
    data: PathBuf,

    /// Engine configuration (TOML); defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Plan (or re-plan) a project's outline
    Outline {
        /// Existing project; a new one is created when omitted
        #[arg(long)]
        project: Option<ProjectId>,
        /// Premise of the book
        #[arg(long)]
        goal: String,
        /// Number of chapters to plan
        #[arg(long)]
        chapters: u32,
        /// World setting document (plain text)
        #[arg(long)]
        setting: Option<PathBuf>,
        /// Character relationship graph (JSON)
        #[arg(long)]
        characters: Option<PathBuf>,
    },

    /// Write the next chapters of a project
    Write {
        #[arg(long)]
        project: ProjectId,
        /// Chapters to write in this run
        #[arg(long, default_value_t = 1)]
        count: u32,
    },

    /// Show where a project stands
    Status {
        #[arg(long)]
        project: ProjectId,
    },
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => {
            let mut config = EngineConfig::default();
            config.apply_env();
            Ok(config)
        }
    }
}

/// Flag raised by the first Ctrl-C.
fn cancellation_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            raised.store(true, Ordering::SeqCst);
        }
    });
    flag
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(JsonDirStore::new(&cli.data));
    let start_session = |config: EngineConfig| {
        Session::new(config, &ClaudeFactory, store.clone(), Arc::new(SemanticCache::new())).context("starting session")
    };

    match cli.cmd {
        Command::Outline {
            project,
            goal,
            chapters,
            setting,
            characters,
        } => {
            let project = project.unwrap_or_default();
            if let Some(path) = setting {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                store.save_setting(project, &text).await?;
            }
            if let Some(path) = characters {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let graph: RelationshipGraph =
                    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
                store.save_relationships(project, &graph).await?;
            }

            let report = start_session(config)?.plan_outline(project, &goal, chapters).await?;
            println!("Project: {project}");
            match (&report.outline, &report.verdict) {
                (Some(outline), Some(verdict)) => {
                    println!("Outline: 《{}》, {} chapters", outline.title, outline.chapters.len());
                    println!("Score: {:.1} ({})", verdict.score, if verdict.passed { "passed" } else { "below target" });
                    if !verdict.issues.is_empty() {
                        println!("{}", verdict.render_issues());
                    }
                }
                _ => println!("No outline produced"),
            }
            println!("Attempts: {}, iterations: {}", report.attempts, report.iterations);
            println!("Result: {}", report.done_reason);
        }
        Command::Write { project, count } => {
            let session = start_session(config)?;
            let cancelled = cancellation_flag();
            let report = session
                .write_chapters(project, count, || cancelled.load(Ordering::SeqCst))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Status { project } => {
            // Read-only: no completion client, so no API key needed.
            let status = ProjectStatus::load(store.as_ref(), project).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}

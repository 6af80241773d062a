//! Command-line interface for voxnote.
//!
//! Every command prints its result as pretty JSON, the same serializable
//! types an HTTP layer would return.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use uuid::Uuid;

use crate::adapters::openai::OpenAiConfig;
use crate::adapters::{FsBlobStore, OpenAiCompleter, OpenAiTranscriber};
use crate::config::{self, ResolvedConfig};
use crate::core::Orchestrator;
use crate::domain::{Note, NoteEvent, NoteStatus};
use crate::store::{NoteStore, SqliteNoteStore};

/// voxnote - Voice note processing orchestrator
#[derive(Parser, Debug)]
#[command(name = "voxnote")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register an audio file as a new note
    Add {
        /// Audio file to import
        file: PathBuf,

        /// Owner of the note
        #[arg(short, long)]
        owner: String,

        /// Recording time (RFC 3339, defaults to now)
        #[arg(long)]
        recorded_at: Option<DateTime<Utc>>,
    },

    /// Process a single note
    Process {
        /// Note ID (UUID)
        note_id: String,

        /// Owner the note must belong to
        #[arg(short, long)]
        owner: String,

        /// Re-run both stages even if the note is already processed
        #[arg(short, long)]
        force: bool,
    },

    /// Process the next batch of eligible notes
    Batch {
        /// Maximum notes in the batch (defaults to config)
        #[arg(short, long)]
        size: Option<usize>,
    },

    /// Release notes whose processing claim went stale
    ResetStuck {
        /// Claim age in minutes (defaults to config)
        #[arg(short, long)]
        threshold_minutes: Option<u64>,

        /// Maximum notes reset (defaults to config)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Sweep and process batches on an interval until Ctrl-C
    Run {
        /// Seconds between passes
        #[arg(short, long, default_value = "60")]
        interval: u64,

        /// Maximum notes per batch (defaults to config)
        #[arg(short, long)]
        size: Option<usize>,
    },

    /// Show a note with its processing events
    Status {
        /// Note ID (UUID)
        note_id: String,
    },

    /// Show an owner's quota usage
    Quota {
        /// Owner ID
        owner: String,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Add {
                file,
                owner,
                recorded_at,
            } => add_note(file, &owner, recorded_at).await,
            Commands::Process {
                note_id,
                owner,
                force,
            } => process_note(&note_id, &owner, force).await,
            Commands::Batch { size } => process_batch(size).await,
            Commands::ResetStuck {
                threshold_minutes,
                limit,
            } => reset_stuck(threshold_minutes, limit).await,
            Commands::Run { interval, size } => run_loop(interval, size).await,
            Commands::Status { note_id } => show_status(&note_id).await,
            Commands::Quota { owner } => show_quota(&owner).await,
            Commands::Config => show_config(),
        }
    }
}

/// A note as reported by `status`
#[derive(Debug, Serialize)]
struct NoteReport {
    status: NoteStatus,
    note: Note,
    events: Vec<NoteEvent>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", out);
    Ok(())
}

fn parse_note_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid note ID: {}", value))
}

fn open_store(config: &ResolvedConfig) -> Result<Arc<SqliteNoteStore>> {
    let store = SqliteNoteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database: {}", config.db_path.display()))?;
    Ok(Arc::new(store))
}

/// Wire the orchestrator from config.
///
/// Provider calls without a key fail as auth errors, so commands that call
/// providers check for one first.
fn build_orchestrator(config: &ResolvedConfig, require_key: bool) -> Result<Orchestrator> {
    if require_key && config.api_key().is_none() {
        anyhow::bail!("No API key configured. Set VOXNOTE_API_KEY or OPENAI_API_KEY");
    }

    let store = open_store(config)?;
    let providers = &config.settings.providers;
    let openai = OpenAiConfig::new(
        providers.api_base.clone(),
        config.api_key().unwrap_or_default(),
    );

    let orchestrator = Orchestrator::builder(
        store,
        Arc::new(FsBlobStore::new(&config.blobs_dir)),
        Arc::new(OpenAiTranscriber::new(
            openai.clone(),
            providers.transcription_model.clone(),
        )),
        Arc::new(OpenAiCompleter::new(openai, providers.analysis_model.clone())),
    )
    .settings(config.orchestrator_settings())
    .build();

    Ok(orchestrator)
}

/// Import audio and insert an unprocessed note
async fn add_note(file: PathBuf, owner: &str, recorded_at: Option<DateTime<Utc>>) -> Result<()> {
    let config = config::config()?;
    let blobs = FsBlobStore::new(&config.blobs_dir);

    let (audio_ref, size) = blobs
        .import_file(&file)
        .await
        .with_context(|| format!("Failed to import audio: {}", file.display()))?;

    let note = Note::new(owner, audio_ref, size, recorded_at.unwrap_or_else(Utc::now));
    let store = open_store(config)?;
    store.insert_note(&note).await.context("Failed to save note")?;

    print_json(&note)
}

async fn process_note(note_id: &str, owner: &str, force: bool) -> Result<()> {
    let note_id = parse_note_id(note_id)?;
    let config = config::config()?;
    let orchestrator = build_orchestrator(config, true)?;

    let result = orchestrator.process_note(note_id, owner, force).await;
    print_json(&result)?;

    if result.status_code() >= 400 {
        std::process::exit(1);
    }
    Ok(())
}

async fn process_batch(size: Option<usize>) -> Result<()> {
    let config = config::config()?;
    let orchestrator = build_orchestrator(config, true)?;
    let size = size.unwrap_or(config.settings.batch.batch_size);

    let result = orchestrator
        .process_next_batch(size)
        .await
        .context("Batch selection failed")?;
    print_json(&result)
}

async fn reset_stuck(threshold_minutes: Option<u64>, limit: Option<usize>) -> Result<()> {
    let config = config::config()?;
    let orchestrator = build_orchestrator(config, false)?;
    let recovery = &config.settings.recovery;

    let threshold = threshold_minutes
        .map(|m| Duration::from_secs(m.saturating_mul(60)))
        .unwrap_or_else(|| recovery.threshold());
    let report = orchestrator
        .reset_stuck_with(threshold, limit.unwrap_or(recovery.batch_size))
        .await
        .context("Stuck recovery failed")?;

    print_json(&report)
}

async fn run_loop(interval: u64, size: Option<usize>) -> Result<()> {
    let config = config::config()?;
    let orchestrator = build_orchestrator(config, true)?;
    let size = size.unwrap_or(config.settings.batch.batch_size);

    eprintln!("Processing every {}s, Ctrl-C to stop", interval);
    let summary = orchestrator
        .run_forever(Duration::from_secs(interval.max(1)), size, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;

    print_json(&summary)
}

async fn show_status(note_id: &str) -> Result<()> {
    let note_id = parse_note_id(note_id)?;
    let config = config::config()?;
    let store = open_store(config)?;

    let note = store
        .get_note(note_id)
        .await
        .with_context(|| format!("Note not found: {}", note_id))?;
    let events = store
        .events_for(note_id)
        .await
        .context("Failed to load events")?;

    print_json(&NoteReport {
        status: note.status(),
        note,
        events,
    })
}

async fn show_quota(owner: &str) -> Result<()> {
    let config = config::config()?;
    let orchestrator = build_orchestrator(config, false)?;

    let decision = orchestrator.quota(owner).await;
    print_json(&decision)
}

fn show_config() -> Result<()> {
    let config = config::config()?;
    print_json(config)
}

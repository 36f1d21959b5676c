//! # Session RAG CLI (`srag`)
//!
//! The `srag` binary indexes AI pair-programming transcripts into a local
//! vector store and serves semantic search over them.
//!
//! ## Usage
//!
//! ```bash
//! srag --config ./config/srag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `srag init` | Create the SQLite database and run schema migrations |
//! | `srag qdrant install` | Download and install the pinned Qdrant release |
//! | `srag qdrant start` | Run the managed Qdrant server in the foreground |
//! | `srag qdrant status` | Show install and reachability status |
//! | `srag index <file>` | Index a single transcript file |
//! | `srag scan` | Full scan of the transcript tree with progress |
//! | `srag watch` | Index on file changes and run enrichment workers |
//! | `srag search "<query>"` | Semantic search over indexed turns |
//! | `srag get <chunk_id>` | Show a full chunk |
//! | `srag enrich run` | Drain the enrichment queue in the foreground |
//! | `srag enrich reset-failed` | Requeue failed enrichment tasks |
//! | `srag stats` | Index and queue statistics |
//! | `srag clear` | Drop every indexed chunk and vector |
//!
//! ## Examples
//!
//! ```bash
//! # One-time setup
//! srag init
//! srag qdrant install
//!
//! # Index everything, then keep up with new sessions
//! srag scan --progress human
//! srag watch
//!
//! # Search two projects at once
//! srag search "sqlite busy timeout" --project Users-me-api --project Users-me-web
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;

use session_rag::cancel::CancelToken;
use session_rag::config::{self, Config};
use session_rag::progress::ProgressMode;
use session_rag::runtime::Runtime;
use session_rag::session::parse_transcript_path;
use session_rag::vector::download::ProgressFn;
use session_rag::vector::manager::QdrantManager;
use session_rag::vector::VectorStore;
use session_rag::{get, logging, migrate, search, stats};

/// Session RAG CLI: semantic search over AI pair-programming transcripts.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/srag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "srag",
    about = "Session RAG: semantic search over AI pair-programming transcripts",
    version,
    long_about = "Session RAG parses agent transcripts into user/assistant turns, extracts \
    the searchable core of each turn, embeds it into a local Qdrant collection, optionally \
    enriches it with an LLM summary, and serves filtered semantic search."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/srag.toml`.
    #[arg(long, global = true, default_value = "./config/srag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it more than once is safe.
    Init,

    /// Manage the local Qdrant server.
    Qdrant {
        #[command(subcommand)]
        action: QdrantAction,
    },

    /// Index one transcript file.
    ///
    /// The path must look like `<root>/<projectKey>/agent-transcripts/<sessionID>.txt`.
    Index {
        file: PathBuf,

        /// Reindex even when the content hash is unchanged.
        #[arg(long)]
        force: bool,
    },

    /// Scan the whole transcript tree.
    ///
    /// Without `--changed` every file is reindexed. Ctrl-C cancels.
    Scan {
        /// Progress output on stderr: `human`, `json` or `off`.
        /// Defaults to `human` on a terminal, `off` otherwise.
        #[arg(long)]
        progress: Option<ProgressMode>,

        /// Only index files whose content changed since the last scan.
        #[arg(long)]
        changed: bool,
    },

    /// Watch the transcript tree and index changes as they happen.
    ///
    /// Also runs the enrichment workers (when an LLM is configured) and the
    /// periodic scan (when `scan.interval` is set). Ctrl-C stops.
    Watch,

    /// Semantic search over indexed turns.
    Search {
        query: String,

        /// Restrict to a project ID. Repeat for several projects.
        #[arg(long = "project")]
        projects: Vec<String>,

        /// Maximum number of results (default 10, max 100).
        #[arg(long, default_value_t = 10)]
        limit: usize,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Show a chunk by ID.
    Get {
        chunk_id: String,

        #[arg(long)]
        json: bool,
    },

    /// Manage LLM enrichment.
    Enrich {
        #[command(subcommand)]
        action: EnrichAction,
    },

    /// Index and queue statistics.
    Stats {
        #[arg(long)]
        json: bool,
    },

    /// Delete every chunk, index status, queued task and vector.
    Clear {
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum QdrantAction {
    /// Download, verify and install the configured Qdrant version.
    Install,
    /// Start the managed server and keep it running until Ctrl-C.
    Start,
    /// Show installed version and whether the endpoint answers.
    Status,
}

#[derive(Subcommand)]
enum EnrichAction {
    /// Process queued tasks until the queue is empty.
    Run,
    /// Move failed tasks back to pending.
    ResetFailed,
    /// Task counts by status.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging.level)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            std::fs::create_dir_all(&cfg.transcripts.root).ok();
            println!("Database initialized successfully.");
        }
        Commands::Qdrant { action } => run_qdrant(&cfg, action).await?,
        Commands::Index { file, force } => {
            let rt = Runtime::build(cfg).await?;
            let result = run_index(&rt, file, force).await;
            rt.shutdown().await;
            result?;
        }
        Commands::Scan { progress, changed } => {
            let rt = Runtime::build(cfg).await?;
            let mode = progress.unwrap_or_else(ProgressMode::default_for_tty);
            let result = run_scan(&rt, mode, changed).await;
            rt.shutdown().await;
            result?;
        }
        Commands::Watch => {
            let rt = Runtime::build(cfg).await?;
            let watcher = rt.start_background(rt.config.scan.watch)?;
            if watcher.is_some() {
                println!("Watching {} (Ctrl-C to stop)", rt.config.transcripts.root.display());
            } else {
                println!("File watching disabled (scan.watch = false); running background workers (Ctrl-C to stop)");
            }
            tokio::signal::ctrl_c().await?;
            if let Some(w) = watcher {
                w.stop();
            }
            rt.shutdown().await;
        }
        Commands::Search {
            query,
            projects,
            limit,
            json,
        } => {
            let rt = Runtime::build(cfg).await?;
            let result = search::run_search(&rt, &query, &projects, limit, json).await;
            rt.shutdown().await;
            result?;
        }
        Commands::Get { chunk_id, json } => {
            let rt = Runtime::build(cfg).await?;
            let result = get::run_get(&rt, &chunk_id, json).await;
            rt.shutdown().await;
            result?;
        }
        Commands::Enrich { action } => {
            let rt = Runtime::build(cfg).await?;
            let result = run_enrich(&rt, action).await;
            rt.shutdown().await;
            result?;
        }
        Commands::Stats { json } => {
            let rt = Runtime::build(cfg).await?;
            let result = stats::run_stats(&rt, json).await;
            rt.shutdown().await;
            result?;
        }
        Commands::Clear { yes } => {
            if !yes && !confirm("Delete all indexed chunks and vectors?")? {
                println!("Aborted.");
                return Ok(());
            }
            let rt = Runtime::build(cfg).await?;
            let result = async { rt.rag()?.scanner.clear_metadata().await }.await;
            rt.shutdown().await;
            result?;
            println!("Index cleared.");
        }
    }

    Ok(())
}

async fn run_qdrant(cfg: &Config, action: QdrantAction) -> Result<()> {
    let manager = QdrantManager::new(&cfg.vector)?;
    match action {
        QdrantAction::Install => {
            let show = atty::is(atty::Stream::Stderr);
            let progress: &ProgressFn = &move |done: u64, total: Option<u64>| {
                if !show {
                    return;
                }
                let mut err = std::io::stderr().lock();
                let _ = match total {
                    Some(t) if t > 0 => write!(err, "\r  {} / {} KB", done / 1024, t / 1024),
                    _ => write!(err, "\r  {} KB", done / 1024),
                };
                let _ = err.flush();
            };
            let path = manager
                .install(Some(progress), &CancelToken::never())
                .await
                .context("qdrant install failed")?;
            if show {
                eprintln!();
            }
            println!("Qdrant {} installed at {}", cfg.vector.version, path.display());
        }
        QdrantAction::Start => {
            manager.start().await.context("qdrant start failed")?;
            println!("Qdrant running at {} (Ctrl-C to stop)", cfg.vector.endpoint());
            tokio::signal::ctrl_c().await?;
            manager.stop().await;
        }
        QdrantAction::Status => {
            match manager.installed_version().await {
                Some(v) => println!("installed:  {} ({})", v.trim(), manager.binary_path().display()),
                None => println!("installed:  no ({})", manager.binary_path().display()),
            }
            println!("endpoint:   {}", cfg.vector.endpoint());
            if manager.is_running().await {
                let collections = manager.store().list_collections().await?;
                println!("running:    yes");
                println!("collections: {}", collections.join(", "));
            } else {
                println!("running:    no");
            }
        }
    }
    Ok(())
}

async fn run_index(rt: &Runtime, file: PathBuf, force: bool) -> Result<()> {
    let rag = rt.rag()?;
    let file = std::fs::canonicalize(&file)
        .with_context(|| format!("transcript not found: {}", file.display()))?;
    let Some(transcript) = parse_transcript_path(&file) else {
        bail!(
            "not a transcript path (expected <projectKey>/agent-transcripts/<sessionID>.txt): {}",
            file.display()
        );
    };

    let chunks = if force {
        rag.indexer
            .index_session(&transcript.session_id, &transcript.path)
            .await?
    } else {
        rag.scanner
            .handle_session_file_event(&transcript.session_id, &transcript.project_key, &transcript.path)
            .await?
    };
    println!("{}: {} chunk(s) indexed", transcript.session_id, chunks);
    Ok(())
}

async fn run_scan(rt: &Runtime, mode: ProgressMode, changed: bool) -> Result<()> {
    let scanner = &rt.rag()?.scanner;

    if changed {
        let files = scanner.scan_changed(&CancelToken::never()).await?;
        println!("{} changed file(s) checked", files);
        return Ok(());
    }

    let task = scanner.trigger_full_scan(mode.reporter())?;
    tokio::pin!(task);
    let last = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            scanner.cancel_scan();
            task.await?
        }
    };

    println!(
        "Scan {}: {} / {} files, {} chunks",
        last.status.as_str(),
        last.processed_files,
        last.total_files,
        last.indexed_messages
    );
    if let Some(err) = last.error_message {
        eprintln!("  {}", err);
    }
    Ok(())
}

async fn run_enrich(rt: &Runtime, action: EnrichAction) -> Result<()> {
    let enrichment = &rt.rag()?.enrichment;
    match action {
        EnrichAction::Run => {
            let n = enrichment.run_until_empty().await?;
            println!("{} task(s) processed", n);
        }
        EnrichAction::ResetFailed => {
            let n = enrichment.reset_failed_tasks().await?;
            println!("{} failed task(s) requeued", n);
        }
        EnrichAction::Stats => {
            let s = enrichment.queue_stats().await?;
            println!("pending:    {}", s.pending);
            println!("processing: {}", s.processing);
            println!("completed:  {}", s.completed);
            println!("failed:     {}", s.failed);
        }
    }
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

//! CLI layer: clap definitions and command execution.
//!
//! The binary's faces: `hook <event>` (the dispatcher, exit codes 0/1/2),
//! `queue` (processor, sweep, status), `checkpoint` (list, restore),
//! `rpc <method>` (the RPC surface with params on stdin), and small admin
//! commands (`init`, `status`, `search`).

use crate::checkpoint::{CheckpointManager, GitStash};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hooks::{self, HookEventKind};
use crate::memory::{MemoryStore, SearchQuery, SqliteMemory};
use crate::project::ProjectPaths;
use crate::queue::{IngestQueue, QueueProcessor};
use crate::rpc;
use crate::wsi::{TurnCounter, WsiStore};
use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

/// mnemon: orchestration memory and governance layer for AI coding
/// assistants.
///
/// Hook dispatcher, working-set index, durable DIGEST ingest queue, and
/// hybrid-search memory provider.
#[derive(Parser, Debug)]
#[command(name = "mnemon")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Project root (defaults to $PROJECT_DIR, then the current directory).
    #[arg(short, long, env = "PROJECT_DIR", global = true)]
    pub project_dir: Option<PathBuf>,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Dispatch a lifecycle hook event (reads the event JSON on stdin).
    ///
    /// Exit codes: 0 allow, 1 allow with advisory, 2 block.
    Hook {
        /// Event name: pre_tool, post_tool, post_tool_task, user_prompt,
        /// pre_compact, or stop.
        event: String,
    },

    /// Ingest queue operations.
    Queue {
        /// Queue action.
        #[command(subcommand)]
        action: QueueCommands,
    },

    /// Call an RPC method (reads the params JSON on stdin).
    Rpc {
        /// Method name (e.g. memory_search, solution_get, golden_paths).
        method: String,
    },

    /// Checkpoint operations.
    Checkpoint {
        /// Checkpoint action.
        #[command(subcommand)]
        action: CheckpointCommands,
    },

    /// Initialize the memory store schema.
    Init,

    /// Show project session and store status.
    Status,

    /// Search project memory.
    Search {
        /// Query text.
        query: String,

        /// Result count (clamped to 20).
        #[arg(short, long, default_value = "8")]
        k: usize,

        /// Search across all projects.
        #[arg(short, long)]
        global: bool,
    },
}

/// Checkpoint subcommands.
#[derive(Subcommand, Debug)]
pub enum CheckpointCommands {
    /// List retained checkpoints, newest first.
    List,

    /// Re-apply a checkpoint's snapshot to the working tree.
    Restore {
        /// Checkpoint id (from `checkpoint list`).
        id: String,
    },
}

/// Queue subcommands.
#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Drain pending jobs into the memory store.
    Process {
        /// Wall-clock budget in milliseconds.
        #[arg(long)]
        budget_ms: Option<u64>,
    },

    /// Remove stale non-JSON garbage from the queue directory.
    Sweep,

    /// Show pending and dead-letter counts.
    Status,
}

/// Result of executing a CLI command.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    /// Content for stdout.
    pub stdout: String,
    /// Advisory lines for stderr.
    pub stderr: Vec<String>,
    /// Process exit code.
    pub exit_code: u8,
}

/// Executes the parsed CLI command.
///
/// # Errors
///
/// Returns an error for admin/RPC commands that fail outright; the
/// `hook` path never errors (fail-open inside the dispatcher).
pub fn execute(cli: &Cli) -> Result<ExecOutcome> {
    match &cli.command {
        Commands::Hook { event } => cmd_hook(event, cli.project_dir.as_deref()),
        Commands::Queue { action } => cmd_queue(action, cli.project_dir.as_deref()),
        Commands::Checkpoint { action } => cmd_checkpoint(action, cli.project_dir.as_deref()),
        Commands::Rpc { method } => cmd_rpc(method, cli.project_dir.as_deref()),
        Commands::Init => cmd_init(cli.project_dir.as_deref()),
        Commands::Status => cmd_status(cli.project_dir.as_deref()),
        Commands::Search { query, k, global } => {
            cmd_search(query, *k, *global, cli.project_dir.as_deref())
        }
    }
}

/// Reads all of stdin; empty input becomes an empty JSON object.
fn read_stdin_json() -> Result<serde_json::Value> {
    let mut raw = String::new();
    std::io::stdin().read_to_string(&mut raw)?;
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(&raw).map_err(|e| Error::Config {
        message: format!("stdin is not valid JSON: {e}"),
    })
}

fn cmd_hook(event: &str, project_dir: Option<&std::path::Path>) -> Result<ExecOutcome> {
    let kind = match HookEventKind::parse(event) {
        Ok(kind) => kind,
        Err(error) => {
            // Unknown events fail open too: the host may be newer than us
            tracing::warn!(event, error = %error, "unknown hook event; allowing");
            return Ok(ExecOutcome::default());
        }
    };
    let mut payload = read_stdin_json().unwrap_or_else(|_| serde_json::json!({}));
    // The --project-dir flag (or $PROJECT_DIR) wins over a missing field
    if let (Some(dir), Some(obj)) = (project_dir, payload.as_object_mut())
        && !obj.contains_key("project_dir")
    {
        obj.insert(
            "project_dir".to_string(),
            dir.display().to_string().into(),
        );
    }

    let outcome = hooks::dispatch(kind, payload);
    Ok(ExecOutcome {
        stdout: String::new(),
        stderr: outcome.advisories,
        exit_code: outcome.exit_code,
    })
}

fn cmd_queue(
    action: &QueueCommands,
    project_dir: Option<&std::path::Path>,
) -> Result<ExecOutcome> {
    let paths = ProjectPaths::resolve(project_dir)?;
    let queue = IngestQueue::new(&paths.queue_dir);

    match action {
        QueueCommands::Process { budget_ms } => {
            let config = Config::load(&paths.root)?;
            let mut memory = SqliteMemory::open(&paths.db_path, &config)?;
            memory.init()?;
            let mut processor = QueueProcessor::new(&queue, &mut memory, &config)?;
            let report = processor.drain(budget_ms.map(Duration::from_millis));
            Ok(ExecOutcome {
                stdout: serde_json::json!({
                    "processed": report.processed,
                    "retried": report.retried,
                    "dead": report.dead,
                    "pending": queue.pending_count(),
                })
                .to_string(),
                ..ExecOutcome::default()
            })
        }
        QueueCommands::Sweep => {
            let removed = queue.sweep();
            Ok(ExecOutcome {
                stdout: serde_json::json!({"removed": removed}).to_string(),
                ..ExecOutcome::default()
            })
        }
        QueueCommands::Status => Ok(ExecOutcome {
            stdout: serde_json::json!({
                "pending": queue.pending_count(),
                "dead": queue.dead_count(),
            })
            .to_string(),
            ..ExecOutcome::default()
        }),
    }
}

fn cmd_checkpoint(
    action: &CheckpointCommands,
    project_dir: Option<&std::path::Path>,
) -> Result<ExecOutcome> {
    let paths = ProjectPaths::resolve(project_dir)?;
    let manager = CheckpointManager::new(&paths.checkpoints_dir, &GitStash);

    match action {
        CheckpointCommands::List => Ok(ExecOutcome {
            stdout: serde_json::to_string_pretty(&manager.list()).map_err(|e| Error::Config {
                message: e.to_string(),
            })?,
            ..ExecOutcome::default()
        }),
        CheckpointCommands::Restore { id } => {
            manager.restore(&paths.root, id)?;
            Ok(ExecOutcome {
                stdout: serde_json::json!({"ok": true, "restored": id}).to_string(),
                ..ExecOutcome::default()
            })
        }
    }
}

fn cmd_rpc(method: &str, project_dir: Option<&std::path::Path>) -> Result<ExecOutcome> {
    let paths = ProjectPaths::resolve(project_dir)?;
    let config = Config::load(&paths.root)?;
    let params = read_stdin_json()?;

    let mut memory = SqliteMemory::open(&paths.db_path, &config)?;
    memory.init()?;
    let result = rpc::dispatch_method(method, &params, &mut memory, &config);
    Ok(ExecOutcome {
        stdout: serde_json::to_string_pretty(&result).map_err(|e| Error::Config {
            message: e.to_string(),
        })?,
        ..ExecOutcome::default()
    })
}

fn cmd_init(project_dir: Option<&std::path::Path>) -> Result<ExecOutcome> {
    let paths = ProjectPaths::resolve(project_dir)?;
    let config = Config::load(&paths.root)?;
    let mut memory = SqliteMemory::open(&paths.db_path, &config)?;
    memory.init()?;
    Ok(ExecOutcome {
        stdout: serde_json::json!({
            "ok": true,
            "store": paths.db_path.display().to_string(),
            "dimension": memory.dimension(),
        })
        .to_string(),
        ..ExecOutcome::default()
    })
}

fn cmd_status(project_dir: Option<&std::path::Path>) -> Result<ExecOutcome> {
    let paths = ProjectPaths::resolve(project_dir)?;
    let config = Config::load(&paths.root)?;
    let queue = IngestQueue::new(&paths.queue_dir);
    let wsi = WsiStore::load(&paths.wsi_path, &config.wsi);
    let turn = TurnCounter::load(&paths.turn_path).value();

    let chunks = if paths.db_path.exists() {
        SqliteMemory::open(&paths.db_path, &config)
            .and_then(|s| s.chunk_count())
            .unwrap_or(0)
    } else {
        0
    };

    Ok(ExecOutcome {
        stdout: serde_json::to_string_pretty(&serde_json::json!({
            "project": paths.root.display().to_string(),
            "label": paths.label,
            "turn": turn,
            "wsi_entries": wsi.len(),
            "queue": {"pending": queue.pending_count(), "dead": queue.dead_count()},
            "store": {"path": paths.db_path.display().to_string(), "chunks": chunks},
            "vector_rag": config.vector_rag_enabled,
        }))
        .map_err(|e| Error::Config {
            message: e.to_string(),
        })?,
        ..ExecOutcome::default()
    })
}

fn cmd_search(
    query: &str,
    k: usize,
    global: bool,
    project_dir: Option<&std::path::Path>,
) -> Result<ExecOutcome> {
    let paths = ProjectPaths::resolve(project_dir)?;
    let config = Config::load(&paths.root)?;
    let mut memory = SqliteMemory::open(&paths.db_path, &config)?;
    memory.init()?;

    let search = SearchQuery {
        project_root: (!global).then(|| paths.root.clone()),
        query: query.to_string(),
        k,
        global,
        component: None,
        category: None,
        tags: Vec::new(),
    };
    let response = memory.search(&search)?;
    Ok(ExecOutcome {
        stdout: serde_json::to_string_pretty(&response).map_err(|e| Error::Config {
            message: e.to_string(),
        })?,
        ..ExecOutcome::default()
    })
}

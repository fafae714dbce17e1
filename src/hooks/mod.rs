//! Hook dispatcher: one short-lived process per lifecycle event.
//!
//! The exit code is the only machine-interpretable signal back to the
//! host: 0 allows silently, 1 allows with an advisory on stderr, 2
//! blocks. The fail-open guarantee is absolute: any internal error is
//! appended to the project error log and the event exits 0; only an
//! explicit policy Block produces exit 2.

pub mod events;

pub use events::{HookEvent, HookEventKind};

use crate::checkpoint::{CheckpointManager, GitStash};
use crate::config::Config;
use crate::digest::Digest;
use crate::error::{Error, Result};
use crate::io::append_line;
use crate::memory::SqliteMemory;
use crate::policy::{PolicyEngine, SessionState, TypecheckGate, rules};
use crate::project::{ProjectPaths, now_ms};
use crate::queue::{IngestJob, IngestQueue, JobSource, QueueProcessor};
use crate::transcript;
use crate::wsi::{FileHashCache, TurnCounter, WsiStore};
use std::path::Path;
use std::time::Duration;

/// Soft wall-clock budget for stop-event DIGEST extraction.
const STOP_SCAN_BUDGET_MS: u64 = 2_000;

/// Budget for the opportunistic queue drain at stop.
const STOP_DRAIN_BUDGET: Duration = Duration::from_secs(1);

/// Tools that mutate files (WSI touches on post-tool).
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Result of one dispatch.
#[derive(Debug, Default)]
pub struct HookOutcome {
    /// Host exit code: 0 allow, 1 warn, 2 block.
    pub exit_code: u8,
    /// Lines for the host's stderr.
    pub advisories: Vec<String>,
}

impl HookOutcome {
    /// Silent allow.
    #[must_use]
    pub fn allow() -> Self {
        Self::default()
    }

    /// Allow with advisories (exit 1 when any).
    #[must_use]
    pub fn warn(advisories: Vec<String>) -> Self {
        Self {
            exit_code: u8::from(!advisories.is_empty()),
            advisories,
        }
    }
}

/// Dispatches one lifecycle event. Never returns an error: failures are
/// logged to the project error log and degrade to a silent allow.
#[must_use]
pub fn dispatch(kind: HookEventKind, payload: serde_json::Value) -> HookOutcome {
    match run(kind, payload) {
        Ok(outcome) => outcome,
        Err(error) => {
            log_fail_open(kind, &error);
            HookOutcome::allow()
        }
    }
}

/// The fallible core of [`dispatch`].
fn run(kind: HookEventKind, payload: serde_json::Value) -> Result<HookOutcome> {
    let event = HookEvent::new(kind, payload)?;
    let paths = ProjectPaths::resolve(event.project_dir().as_deref())?;
    paths.ensure_dirs()?;
    let config = Config::load(&paths.root)?;

    let result = match kind {
        HookEventKind::PreTool => pre_tool(&event, &paths, &config),
        HookEventKind::PostTool => post_tool(&event, &paths, &config),
        HookEventKind::PostToolTask => post_tool_task(&event, &paths, &config),
        HookEventKind::UserPrompt => user_prompt(&event, &paths, &config),
        HookEventKind::PreCompact => pre_compact(&event, &paths, &config),
        HookEventKind::Stop => stop(&event, &paths, &config),
    };

    // With paths in hand, handler failures are logged here and degrade to
    // a silent allow; the outer catch only sees pre-resolution failures.
    match result {
        Ok(outcome) => Ok(outcome),
        Err(error) => {
            log_error(&paths, kind, &error);
            Ok(HookOutcome::allow())
        }
    }
}

/// Pre-tool: turn accounting, WSI pruning, policy evaluation, checkpoint.
fn pre_tool(event: &HookEvent, paths: &ProjectPaths, config: &Config) -> Result<HookOutcome> {
    let mut counter = TurnCounter::load(&paths.turn_path);
    let turn = counter.increment()?;

    let mut wsi = WsiStore::load(&paths.wsi_path, &config.wsi);
    wsi.prune(turn);
    if wsi.persist()? {
        tracing::warn!("WSI lock lost; proceeded with lock-free write");
    }

    let mut hashes = FileHashCache::load(&paths.hashes_path);
    let mut gate = TypecheckGate::load(&paths.gate_path);

    let engine = PolicyEngine::standard(config);
    let verdict = {
        let mut state = SessionState {
            turn,
            project: paths,
            config,
            hashes: &mut hashes,
            wsi: &wsi,
            gate: &mut gate,
        };
        engine.evaluate(event, &mut state)
    };
    hashes.persist()?;

    let mut advisories = verdict.warnings.clone();
    if let Some(trigger) = verdict.checkpoint_triggers.first() {
        let manager = CheckpointManager::new(&paths.checkpoints_dir, &GitStash);
        match manager.create(&paths.root, trigger) {
            Ok(record) => {
                advisories.push(format!(
                    "checkpoint {} created ({trigger})",
                    record.checkpoint_id
                ));
            }
            Err(error) => {
                // Snapshot failure degrades to a warning, never a block
                advisories.push(format!("checkpoint failed ({trigger}): {error}"));
            }
        }
    }

    if let Some((rule, reason)) = verdict.block {
        advisories.push(format!("[{rule}] {reason}"));
        return Ok(HookOutcome {
            exit_code: 2,
            advisories,
        });
    }
    Ok(HookOutcome::warn(advisories))
}

/// Post-tool: WSI touch for mutating tools, typecheck gate refresh.
fn post_tool(event: &HookEvent, paths: &ProjectPaths, config: &Config) -> Result<HookOutcome> {
    let Some(tool) = event.tool_name() else {
        return Ok(HookOutcome::allow());
    };
    if !EDIT_TOOLS.contains(&tool) {
        return Ok(HookOutcome::allow());
    }
    let Some(raw_path) = event.file_path() else {
        return Ok(HookOutcome::allow());
    };

    let turn = TurnCounter::load(&paths.turn_path).value();
    let key = paths
        .relativize(Path::new(raw_path))
        .to_string_lossy()
        .into_owned();

    let mut wsi = WsiStore::load(&paths.wsi_path, &config.wsi);
    wsi.touch(&key, "edited", turn);
    wsi.persist()?;

    let advisories = refresh_typecheck_gate(paths, config, &key, turn)?;
    Ok(HookOutcome::warn(advisories))
}

/// Runs the configured type checker after an edit and updates the gate.
fn refresh_typecheck_gate(
    paths: &ProjectPaths,
    config: &Config,
    file_key: &str,
    turn: u64,
) -> Result<Vec<String>> {
    if !config.policy.rule_enabled("typecheck_gate") {
        return Ok(Vec::new());
    }
    let Some(params) = config.policy.rule_params("typecheck_gate") else {
        return Ok(Vec::new());
    };
    let Some(command) = params.get("command").and_then(|v| v.as_array()) else {
        return Ok(Vec::new());
    };
    let command: Vec<String> = command
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    if command.is_empty() {
        return Ok(Vec::new());
    }

    let extensions: Vec<String> = params
        .get("extensions")
        .and_then(|v| v.as_array())
        .map(|a| {
            a.iter()
                .filter_map(|v| v.as_str().map(str::to_ascii_lowercase))
                .collect()
        })
        .unwrap_or_else(|| vec!["ts".to_string(), "tsx".to_string()]);
    let matches_ext = Path::new(file_key)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| extensions.contains(&ext));
    if !matches_ext {
        return Ok(Vec::new());
    }

    let timeout_ms = params
        .get("timeout_ms")
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(30_000);
    let outcome = rules::run_typecheck(
        &command,
        &paths.root,
        Duration::from_millis(timeout_ms),
    )?;

    let mut gate = TypecheckGate::load(&paths.gate_path);
    let mut advisories = Vec::new();
    if outcome.passed {
        gate.clear(file_key);
    } else {
        gate.record_failure(file_key, turn, &outcome.output);
        advisories.push(format!(
            "typecheck failed after editing {file_key}; further edits to it are gated"
        ));
    }
    gate.persist()?;
    Ok(advisories)
}

/// Post-tool-task: capture a DIGEST from a subagent's tool result.
fn post_tool_task(event: &HookEvent, paths: &ProjectPaths, config: &Config) -> Result<HookOutcome> {
    let text = event.response_text();
    let Some(payload) = transcript::extract_fenced_digest(&text) else {
        return Ok(HookOutcome::allow());
    };
    let advisories = handle_digest(&payload, paths, config)?;
    Ok(HookOutcome::warn(advisories))
}

/// User prompt: session marker plus queue-backpressure advisory.
fn user_prompt(event: &HookEvent, paths: &ProjectPaths, config: &Config) -> Result<HookOutcome> {
    let marker = serde_json::json!({
        "at": now_ms(),
        "chars": event.prompt().map_or(0, str::len),
    });
    crate::io::atomic_write_json(&paths.logs_dir.join("last_prompt.json"), &marker)?;

    let pending = IngestQueue::new(&paths.queue_dir).pending_count();
    let mut advisories = Vec::new();
    if pending > config.queue.high_watermark {
        advisories.push(format!(
            "ingest queue backlog: {pending} pending jobs (high watermark {})",
            config.queue.high_watermark
        ));
    }
    Ok(HookOutcome::warn(advisories))
}

/// Pre-compact: persist the compaction summary as an ingest job.
fn pre_compact(event: &HookEvent, paths: &ProjectPaths, config: &Config) -> Result<HookOutcome> {
    let Some(summary) = event.summary() else {
        return Ok(HookOutcome::allow());
    };
    if summary.trim().is_empty() || !config.vector_rag_enabled {
        return Ok(HookOutcome::allow());
    }

    let job = IngestJob::new(
        &paths.root,
        JobSource::ConversationSummary,
        &format!("logs/compaction/{}", now_ms()),
        summary.to_string(),
        serde_json::json!({"source": "conversation_summary"}),
    );
    let queue = IngestQueue::new(&paths.queue_dir);
    let advisories = enqueue_with_watermark(&queue, &job, config);
    Ok(HookOutcome::warn(advisories))
}

/// Stop: opportunistic backlog drain, final DIGEST extraction (the new
/// job stays pending for the next cycle), dead-letter count.
fn stop(event: &HookEvent, paths: &ProjectPaths, config: &Config) -> Result<HookOutcome> {
    let mut advisories = Vec::new();

    let queue = IngestQueue::new(&paths.queue_dir);
    if config.vector_rag_enabled {
        match SqliteMemory::open(&paths.db_path, config) {
            Ok(mut memory) => {
                if let Err(error) = memory.init() {
                    log_error(paths, HookEventKind::Stop, &error);
                } else {
                    match QueueProcessor::new(&queue, &mut memory, config) {
                        Ok(mut processor) => {
                            let report = processor.drain(Some(STOP_DRAIN_BUDGET));
                            tracing::debug!(?report, "stop-event drain");
                        }
                        Err(error) => log_error(paths, HookEventKind::Stop, &error),
                    }
                }
            }
            Err(error) => log_error(paths, HookEventKind::Stop, &error),
        }
    }

    if let Some(transcript_path) = event.transcript_path()
        && transcript_path.exists()
    {
        let mut scanner = config.scanner;
        scanner.time_budget_ms = Some(scanner.time_budget_ms.unwrap_or(STOP_SCAN_BUDGET_MS));
        match transcript::latest_digest(&transcript_path, &scanner) {
            Ok(Some(payload)) => match handle_digest(&payload, paths, config) {
                Ok(mut digest_advisories) => advisories.append(&mut digest_advisories),
                Err(error) => log_error(paths, HookEventKind::Stop, &error),
            },
            Ok(None) => {}
            Err(error) => log_error(paths, HookEventKind::Stop, &error),
        }
    }
    queue.sweep();

    let dead = queue.dead_count();
    if dead > 0 {
        advisories.push(format!(
            "{dead} ingest job(s) in the dead-letter directory (.claude/ingest-queue/dead/)"
        ));
    }
    Ok(HookOutcome::warn(advisories))
}

/// Shared DIGEST handling: NOTES append, WSI touches, ingest enqueue.
fn handle_digest(payload: &str, paths: &ProjectPaths, config: &Config) -> Result<Vec<String>> {
    let digest = Digest::parse(payload)?;
    digest.append_to_notes(paths)?;

    let turn = TurnCounter::load(&paths.turn_path).value();
    let mut wsi = WsiStore::load(&paths.wsi_path, &config.wsi);
    digest.apply_to_wsi(&mut wsi, turn);
    wsi.persist()?;

    if !config.vector_rag_enabled {
        return Ok(Vec::new());
    }
    let now = now_ms();
    let job = IngestJob::new(
        &paths.root,
        JobSource::Digest,
        &digest.ingest_path(now),
        digest.to_markdown(&chrono::Utc::now().to_rfc3339()),
        digest.ingest_meta(),
    );
    let queue = IngestQueue::new(&paths.queue_dir);
    Ok(enqueue_with_watermark(&queue, &job, config))
}

/// Enqueues without blocking; a failure is logged and the job dropped, a
/// deep backlog becomes an advisory.
fn enqueue_with_watermark(queue: &IngestQueue, job: &IngestJob, config: &Config) -> Vec<String> {
    match queue.enqueue(job) {
        Ok(pending) if pending > config.queue.high_watermark => vec![format!(
            "ingest queue backlog: {pending} pending jobs (high watermark {})",
            config.queue.high_watermark
        )],
        Ok(_) => Vec::new(),
        Err(error) => {
            tracing::warn!(error = %error, "enqueue failed; job dropped");
            Vec::new()
        }
    }
}

/// Appends a structured line to the project error log; falls back to
/// tracing when even that fails.
fn log_error(paths: &ProjectPaths, kind: HookEventKind, error: &Error) {
    let line = serde_json::json!({
        "at": now_ms(),
        "event": kind.as_str(),
        "error": error.to_string(),
    })
    .to_string();
    if append_line(&paths.error_log_path, &line).is_err() {
        tracing::error!(event = kind.as_str(), error = %error, "hook error (log unwritable)");
    }
}

/// Fail-open logging when paths may not even resolve. Writes to the
/// project error log only when its directory already exists; a failed
/// event must not scaffold directories in an arbitrary cwd.
fn log_fail_open(kind: HookEventKind, error: &Error) {
    match ProjectPaths::resolve(None) {
        Ok(paths) if paths.logs_dir.is_dir() => log_error(&paths, kind, error),
        _ => {
            tracing::error!(event = kind.as_str(), error = %error, "hook error before path resolution");
        }
    }
}

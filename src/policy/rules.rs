//! Shipped policy rules.
//!
//! - `md_spam`: block unsanctioned `*.md` creation
//! - `duplicate_read`: progressive block on re-reading identical content
//! - `typecheck_gate`: block edits to files with failing typechecks
//! - `destructive_op`: warn + checkpoint on destructive shell commands
//! - `routing`: warn on direct orchestrator edits to source files
//! - `periodic_checkpoint`: checkpoint every N pre-tool events
//!
//! All rules can be disabled or tuned through `policy.rules` in the
//! project config.

use crate::config::Config;
use crate::error::Result;
use crate::hooks::{HookEvent, HookEventKind};
use crate::io::atomic_write_json;
use crate::policy::{Decision, PolicyRule, SessionState};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Turn window for the duplicate-read rule.
const DUPLICATE_READ_WINDOW: u64 = 10;

/// Bound on bytes hashed per read (content beyond this cannot flip the
/// duplicate verdict in practice).
const MAX_HASH_BYTES: u64 = 1024 * 1024;

/// Default periodic-checkpoint interval in pre-tool events.
const CHECKPOINT_INTERVAL: u64 = 50;

/// Markdown files that may always be written.
const MD_ALLOWLIST: &[&str] = &[
    "FEATURE_MAP.md",
    "NOTES.md",
    "COMPACTION.md",
    "CHANGELOG.md",
    "README.md",
    "CLAUDE.md",
];

/// Default destructive-command patterns (configurable, not hard-coded).
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    r"(?i)\brm\s+(-[a-z]*[rf][a-z]*\s+)+",
    r"(?i)\bdrop\s+table\b",
    r"(?i)\bdelete\s+from\b",
    r"(?i)\btruncate\s+table\b",
    r"(?i)\bnpm\s+uninstall\b",
    r"(?i)\byarn\s+remove\b",
    r"(?i)\bpnpm\s+remove\b",
    r"(?i)\bprisma\s+migrate\s+(deploy|dev|reset)\b",
    r"(?i)\bdrizzle-kit\s+(push|drop)\b",
    r"(?i)\bgit\s+reset\s+--hard\b",
];

/// Extensions considered project source for the routing rule.
const SOURCE_EXTENSIONS: &[&str] = &[
    "ts", "tsx", "js", "jsx", "mjs", "rs", "py", "go", "java", "rb", "c", "cc", "cpp", "h",
    "hpp", "cs", "swift", "kt",
];

/// Tools that mutate files.
const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

/// Builds the shipped rule set with config-supplied parameters.
#[must_use]
pub fn standard_rules(config: &Config) -> Vec<Box<dyn PolicyRule>> {
    vec![
        Box::new(MdSpamRule::from_config(config)),
        Box::new(DuplicateReadRule),
        Box::new(TypecheckGateRule),
        Box::new(DestructiveOpRule::from_config(config)),
        Box::new(RoutingRule),
        Box::new(PeriodicCheckpointRule::from_config(config)),
    ]
}

// ==================== R1: duplicate read ====================

/// Progressive duplicate-read rule.
///
/// State machine over `(path, sha)` per the hash cache: counts 1..3 pass
/// (with warnings from 2), the fourth identical read within the turn
/// window blocks. A content change or a gap beyond the window resets.
pub struct DuplicateReadRule;

impl PolicyRule for DuplicateReadRule {
    fn id(&self) -> &'static str {
        "duplicate_read"
    }

    fn priority(&self) -> u8 {
        80
    }

    fn evaluate(&self, event: &HookEvent, state: &mut SessionState<'_>) -> Decision {
        if event.kind != HookEventKind::PreTool || event.tool_name() != Some("Read") {
            return Decision::Allow;
        }
        let Some(raw_path) = event.file_path() else {
            return Decision::Allow;
        };

        let absolute = resolve_in_project(state.project.root.as_path(), raw_path);
        let Some(sha) = hash_file_bounded(&absolute) else {
            return Decision::Allow; // unreadable now; let the tool surface the error
        };
        let key = state
            .project
            .relativize(&absolute)
            .to_string_lossy()
            .into_owned();
        let count = state
            .hashes
            .record_read(&key, &sha, state.turn, DUPLICATE_READ_WINDOW);

        match count {
            0 | 1 => Decision::Allow,
            2 => Decision::Warn(format!(
                "duplicate read of {key}; will block after 2 more"
            )),
            3 => Decision::Warn(format!(
                "duplicate read of {key}; will block after 1 more"
            )),
            _ => Decision::Block(format!(
                "duplicate read within {DUPLICATE_READ_WINDOW} turns ({key}); use Grep or read with offset/limit"
            )),
        }
    }
}

// ==================== R2: MD spam ====================

/// Blocks `Write` of markdown files outside the allow-list unless the
/// event carries an explicit user-request flag.
pub struct MdSpamRule {
    allowlist: Vec<String>,
}

impl MdSpamRule {
    fn from_config(config: &Config) -> Self {
        let mut allowlist: Vec<String> = MD_ALLOWLIST.iter().map(ToString::to_string).collect();
        if let Some(params) = config.policy.rule_params("md_spam")
            && let Some(extra) = params.get("allowlist").and_then(|v| v.as_array())
        {
            allowlist.extend(extra.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        Self { allowlist }
    }
}

impl PolicyRule for MdSpamRule {
    fn id(&self) -> &'static str {
        "md_spam"
    }

    fn priority(&self) -> u8 {
        90
    }

    fn evaluate(&self, event: &HookEvent, _state: &mut SessionState<'_>) -> Decision {
        if event.kind != HookEventKind::PreTool || event.tool_name() != Some("Write") {
            return Decision::Allow;
        }
        let Some(path) = event.file_path() else {
            return Decision::Allow;
        };
        if !path.to_ascii_lowercase().ends_with(".md") || event.user_requested() {
            return Decision::Allow;
        }
        let basename = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.allowlist.iter().any(|a| a == &basename) {
            return Decision::Allow;
        }
        Decision::Block(format!(
            "unauthorized .md creation: {path}; only {} are written without an explicit user request",
            self.allowlist.join(", ")
        ))
    }
}

// ==================== R3: routing enforcement ====================

/// Warns when the orchestrator edits project source directly instead of
/// delegating to a subagent role. Hook, config, and doc paths are exempt.
pub struct RoutingRule;

impl PolicyRule for RoutingRule {
    fn id(&self) -> &'static str {
        "routing"
    }

    fn priority(&self) -> u8 {
        40
    }

    fn evaluate(&self, event: &HookEvent, _state: &mut SessionState<'_>) -> Decision {
        if event.kind != HookEventKind::PreTool {
            return Decision::Allow;
        }
        if !event.tool_name().is_some_and(|t| EDIT_TOOLS.contains(&t)) {
            return Decision::Allow;
        }
        let Some(path) = event.file_path() else {
            return Decision::Allow;
        };
        if !is_source_path(path) || is_exempt_path(path) {
            return Decision::Allow;
        }
        // A delegated subagent role is fine; the orchestrator is not
        if event
            .agent_role()
            .is_some_and(|role| role != "orchestrator" && role != "main")
        {
            return Decision::Allow;
        }
        Decision::Warn(format!(
            "direct source edit by orchestrator ({path}); route through a delegated subagent"
        ))
    }
}

/// True when a path's extension marks project source.
fn is_source_path(path: &str) -> bool {
    Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext.as_str()))
}

/// Paths the routing rule never warns about.
fn is_exempt_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    normalized.contains(".claude/")
        || normalized.contains("docs/")
        || normalized.contains("hooks/")
        || normalized.contains("scripts/")
        || !normalized.contains('/') // single-file configs at the root
}

// ==================== R4: destructive operation ====================

/// Warns on destructive shell commands and requests a checkpoint first.
pub struct DestructiveOpRule {
    patterns: RegexSet,
}

impl DestructiveOpRule {
    fn from_config(config: &Config) -> Self {
        let configured: Option<Vec<String>> = config
            .policy
            .rule_params("destructive_op")
            .and_then(|p| p.get("patterns"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            });
        // A bad configured pattern falls back to the shipped defaults
        let patterns = configured
            .as_deref()
            .and_then(|p| RegexSet::new(p).ok())
            .or_else(|| RegexSet::new(DESTRUCTIVE_PATTERNS).ok())
            .unwrap_or_else(RegexSet::empty);
        Self { patterns }
    }

    fn matches(&self, event: &HookEvent) -> bool {
        event.kind == HookEventKind::PreTool
            && event.tool_name() == Some("Bash")
            && event.command().is_some_and(|c| self.patterns.is_match(c))
    }
}

impl PolicyRule for DestructiveOpRule {
    fn id(&self) -> &'static str {
        "destructive_op"
    }

    fn priority(&self) -> u8 {
        60
    }

    fn evaluate(&self, event: &HookEvent, _state: &mut SessionState<'_>) -> Decision {
        if self.matches(event) {
            Decision::Warn(
                "destructive command detected; a working-tree checkpoint was requested".to_string(),
            )
        } else {
            Decision::Allow
        }
    }

    fn checkpoint_trigger(&self, event: &HookEvent, _state: &SessionState<'_>) -> Option<String> {
        self.matches(event).then(|| "destructive-op".to_string())
    }
}

// ==================== R5: typecheck gate ====================

/// Persistent gate state: files whose last typecheck failed.
#[derive(Debug)]
pub struct TypecheckGate {
    path: PathBuf,
    failing: BTreeMap<String, GateEntry>,
}

/// One gated file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateEntry {
    /// Turn at which the failure was recorded.
    pub since_turn: u64,
    /// First line of the checker output.
    pub message: String,
}

impl TypecheckGate {
    /// Loads gate state, or starts empty.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let failing = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            failing,
        }
    }

    /// Gate entry for a file, if it is currently failing.
    #[must_use]
    pub fn entry(&self, file: &str) -> Option<&GateEntry> {
        self.failing.get(file)
    }

    /// True when nothing is gated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failing.is_empty()
    }

    /// Records a failing file.
    pub fn record_failure(&mut self, file: &str, turn: u64, message: &str) {
        self.failing.insert(
            file.to_string(),
            GateEntry {
                since_turn: turn,
                message: message.lines().next().unwrap_or("").to_string(),
            },
        );
    }

    /// Clears a file after a passing check.
    pub fn clear(&mut self, file: &str) {
        self.failing.remove(file);
    }

    /// Persists the gate state atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn persist(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.failing)
    }
}

/// Blocks edits to files whose last typecheck failed.
///
/// The gate is populated by the dispatcher's post-tool handling (which
/// runs the configured checker); this rule only reads the state.
pub struct TypecheckGateRule;

impl PolicyRule for TypecheckGateRule {
    fn id(&self) -> &'static str {
        "typecheck_gate"
    }

    fn priority(&self) -> u8 {
        70
    }

    fn evaluate(&self, event: &HookEvent, state: &mut SessionState<'_>) -> Decision {
        if event.kind != HookEventKind::PreTool {
            return Decision::Allow;
        }
        if !event.tool_name().is_some_and(|t| EDIT_TOOLS.contains(&t)) {
            return Decision::Allow;
        }
        let Some(path) = event.file_path() else {
            return Decision::Allow;
        };
        let key = state
            .project
            .relativize(Path::new(path))
            .to_string_lossy()
            .into_owned();
        state.gate.entry(&key).map_or(Decision::Allow, |entry| {
            Decision::Block(format!(
                "typecheck failing for {key} since turn {}: {}; fix it before further edits",
                entry.since_turn, entry.message
            ))
        })
    }
}

/// Result of running the configured type checker.
#[derive(Debug)]
pub struct TypecheckOutcome {
    /// Whether the check passed (timeouts count as passes; the gate fails
    /// open).
    pub passed: bool,
    /// First lines of output for the gate message.
    pub output: String,
}

/// Runs the configured checker with a hard timeout.
///
/// # Errors
///
/// Returns an error if the command cannot be spawned.
pub fn run_typecheck(
    command: &[String],
    cwd: &Path,
    timeout: std::time::Duration,
) -> Result<TypecheckOutcome> {
    let Some((program, args)) = command.split_first() else {
        return Ok(TypecheckOutcome {
            passed: true,
            output: String::new(),
        });
    };

    let mut child = std::process::Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .stdin(std::process::Stdio::null())
        .spawn()
        .map_err(|e| crate::error::IoError::Generic(format!("spawn {program}: {e}")))?;

    let deadline = std::time::Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut output = String::new();
                if let Some(mut stdout) = child.stdout.take() {
                    let _ = stdout.read_to_string(&mut output);
                }
                if let Some(mut stderr) = child.stderr.take() {
                    let _ = stderr.read_to_string(&mut output);
                }
                return Ok(TypecheckOutcome {
                    passed: status.success(),
                    output,
                });
            }
            Ok(None) => {
                if std::time::Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    tracing::warn!(command = %program, "typecheck timed out; gate fails open");
                    return Ok(TypecheckOutcome {
                        passed: true,
                        output: "typecheck timed out".to_string(),
                    });
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(e) => {
                return Err(crate::error::IoError::Generic(format!("wait {program}: {e}")).into());
            }
        }
    }
}

// ==================== R6: periodic checkpoint ====================

/// Requests a checkpoint every N pre-tool events.
pub struct PeriodicCheckpointRule {
    interval: u64,
}

impl PeriodicCheckpointRule {
    fn from_config(config: &Config) -> Self {
        let interval = config
            .policy
            .rule_params("periodic_checkpoint")
            .and_then(|p| p.get("interval"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(CHECKPOINT_INTERVAL)
            .max(1);
        Self { interval }
    }
}

impl PolicyRule for PeriodicCheckpointRule {
    fn id(&self) -> &'static str {
        "periodic_checkpoint"
    }

    fn priority(&self) -> u8 {
        10
    }

    fn evaluate(&self, _event: &HookEvent, _state: &mut SessionState<'_>) -> Decision {
        Decision::Allow
    }

    fn checkpoint_trigger(&self, event: &HookEvent, state: &SessionState<'_>) -> Option<String> {
        (event.kind == HookEventKind::PreTool
            && state.turn > 0
            && state.turn % self.interval == 0)
            .then(|| "periodic".to_string())
    }
}

// ==================== helpers ====================

/// Joins a possibly-relative tool path onto the project root.
fn resolve_in_project(root: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// SHA-256 of at most [`MAX_HASH_BYTES`] of a file; `None` if unreadable.
fn hash_file_bounded(path: &Path) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut reader = std::io::BufReader::new(file).take(MAX_HASH_BYTES);
    let mut buffer = Vec::new();
    reader.read_to_end(&mut buffer).ok()?;
    Some(crate::hash::sha256_hex(&buffer))
}

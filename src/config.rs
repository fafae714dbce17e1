//! Layered configuration.
//!
//! Defaults are overlaid by an optional `<project_root>/.claude/config.json`
//! and finally by environment variables. The file uses nested objects
//! (`wsi.max` is `{"wsi": {"max": 10}}`); unknown keys and unknown rule ids
//! are ignored.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Default bound on WSI entries.
pub const DEFAULT_WSI_MAX: usize = 10;

/// Default WSI entry TTL in turns.
pub const DEFAULT_WSI_TTL_TURNS: u64 = 20;

/// Default maximum ingest attempts before dead-lettering.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default transient-error pattern for the queue processor.
pub const DEFAULT_NONFATAL_PATTERN: &str =
    r"(?i)timed? ?out|timeout|ECONN|ETIMEDOUT|EAGAIN|connection refused|rate.?limit|locked|busy";

/// Default tail window for the transcript scanner (512 KiB).
pub const DEFAULT_TAIL_BYTES: u64 = 512 * 1024;

/// Default full-pass transcript cap (8 MiB).
pub const DEFAULT_MAX_TRANSCRIPT_BYTES: u64 = 8 * 1024 * 1024;

/// Default pending-job count that triggers a backpressure warning.
pub const DEFAULT_QUEUE_HIGH_WATERMARK: usize = 500;

/// Fixed embedding model identifier.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Fixed embedding dimension for the default model.
pub const DEFAULT_EMBEDDING_DIM: usize = 1536;

/// WSI tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsiConfig {
    /// Maximum number of WSI entries.
    pub max: usize,
    /// Entries older than this many turns are pruned.
    pub ttl_turns: u64,
}

impl Default for WsiConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_WSI_MAX,
            ttl_turns: DEFAULT_WSI_TTL_TURNS,
        }
    }
}

/// Per-rule configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Whether the rule is active.
    pub enabled: bool,
    /// Rule-specific parameters, interpreted by the rule itself.
    pub params: serde_json::Value,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            params: serde_json::Value::Null,
        }
    }
}

/// Policy engine configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Per-rule overrides keyed by rule id. Unknown ids are ignored.
    pub rules: HashMap<String, RuleConfig>,
}

impl PolicyConfig {
    /// Returns whether a rule is enabled (default true).
    #[must_use]
    pub fn rule_enabled(&self, id: &str) -> bool {
        self.rules.get(id).is_none_or(|r| r.enabled)
    }

    /// Returns the params object for a rule, if configured.
    #[must_use]
    pub fn rule_params(&self, id: &str) -> Option<&serde_json::Value> {
        self.rules
            .get(id)
            .map(|r| &r.params)
            .filter(|p| !p.is_null())
    }
}

/// Ingest queue tuning.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Attempts before a job is dead-lettered.
    pub max_attempts: u32,
    /// Regex matching error messages that should be retried.
    pub nonfatal_regex: String,
    /// Timeout for store calls made by the processor, in seconds.
    pub timeout_sec: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            nonfatal_regex: DEFAULT_NONFATAL_PATTERN.to_string(),
            timeout_sec: 30,
        }
    }
}

/// Hybrid-search component weights.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SearchWeights {
    /// Weight on vector similarity.
    pub vector: f64,
    /// Weight on the normalized BM25 rank.
    pub bm25: f64,
    /// Weight on exponential time decay.
    pub time: f64,
    /// Weight on the feedback ratio.
    pub feedback: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            vector: 0.60,
            bm25: 0.30,
            time: 0.10,
            feedback: 0.15,
        }
    }
}

/// Outcome bonus applied after the ranked query.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OutcomeBonus {
    /// Added when `meta.outcome_status == "success"`.
    pub success: f64,
    /// Added when `meta.outcome_status == "failure"` (negative).
    pub failure: f64,
}

impl Default for OutcomeBonus {
    fn default() -> Self {
        Self {
            success: 0.10,
            failure: -0.05,
        }
    }
}

/// Search tuning.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct SearchTuning {
    /// Component weights.
    pub weights: SearchWeights,
    /// Outcome bonus values.
    pub outcome_bonus: OutcomeBonus,
}

/// Embedding configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model identifier; part of the cache key.
    pub model: String,
    /// Vector dimension. Mixing dimensions is refused at index time.
    pub dim: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dim: DEFAULT_EMBEDDING_DIM,
        }
    }
}

/// Transcript scanner budgets.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// Bytes read from the end of the transcript in the tail pass.
    pub tail_bytes: u64,
    /// Transcripts larger than this skip the full pass.
    pub max_bytes: u64,
    /// When true, only the tail pass runs.
    pub fast_only: bool,
    /// Wall-clock budget in milliseconds (None = unbounded).
    pub time_budget_ms: Option<u64>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            tail_bytes: DEFAULT_TAIL_BYTES,
            max_bytes: DEFAULT_MAX_TRANSCRIPT_BYTES,
            fast_only: false,
            time_budget_ms: None,
        }
    }
}

/// Queue backpressure tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending-job count above which enqueues warn.
    pub high_watermark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high_watermark: DEFAULT_QUEUE_HIGH_WATERMARK,
        }
    }
}

/// Fixpack suggestion tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct FixpackConfig {
    /// Maximum suggestions returned by `solution_search`.
    pub max_suggestions: usize,
    /// Suggestion timeout in seconds.
    pub suggest_timeout_sec: u64,
}

impl Default for FixpackConfig {
    fn default() -> Self {
        Self {
            max_suggestions: 5,
            suggest_timeout_sec: 10,
        }
    }
}

/// Fully merged configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// WSI tuning.
    pub wsi: WsiConfig,
    /// Policy rule overrides.
    pub policy: PolicyConfig,
    /// Ingest queue tuning.
    pub ingest: IngestConfig,
    /// Search weights and bonuses.
    pub search: SearchTuning,
    /// Embedding model and dimension.
    pub embedding: EmbeddingConfig,
    /// Transcript scanner budgets.
    pub scanner: ScannerConfig,
    /// Queue backpressure tuning.
    pub queue: QueueConfig,
    /// Fixpack suggestion tuning.
    pub fixpack: FixpackConfig,
    /// Whether ingest enqueueing and opportunistic drains are active.
    #[serde(skip)]
    pub vector_rag_enabled: bool,
    /// Vector store location (path for the embedded SQLite store).
    #[serde(skip)]
    pub vector_store_url: Option<String>,
    /// API key handed to a remote embedding client; never persisted.
    #[serde(skip)]
    pub embedding_api_key: Option<String>,
}

impl Config {
    /// Loads configuration for a project: defaults, then
    /// `.claude/config.json`, then environment variables.
    ///
    /// A missing config file is fine; a malformed one is a `Config` error
    /// (the dispatcher converts that into a fail-open exit).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join(".claude").join("config.json");
        let mut config = if path.is_file() {
            let raw = std::fs::read_to_string(&path).map_err(|e| Error::Config {
                message: format!("cannot read {}: {e}", path.display()),
            })?;
            serde_json::from_str::<Self>(&raw).map_err(|e| Error::Config {
                message: format!("malformed {}: {e}", path.display()),
            })?
        } else {
            Self::default()
        };
        config.apply_env(&EnvSource::process());
        Ok(config)
    }

    /// Applies environment overrides from the given source.
    fn apply_env(&mut self, env: &EnvSource) {
        if let Some(v) = env.parse("WSI_MAX") {
            self.wsi.max = v;
        }
        if let Some(v) = env.parse("WSI_TTL_TURNS") {
            self.wsi.ttl_turns = v;
        }
        if let Some(v) = env.parse("STOP_TAIL_WINDOW_BYTES") {
            self.scanner.tail_bytes = v;
        }
        if let Some(v) = env.parse("STOP_HOOK_MAX_TRANSCRIPT_BYTES") {
            self.scanner.max_bytes = v;
        }
        if let Some(v) = env.get("STOP_TAIL_FAST_ONLY") {
            self.scanner.fast_only = is_truthy(&v);
        }
        if let Some(v) = env.parse("STOP_TIME_BUDGET_MS") {
            self.scanner.time_budget_ms = Some(v);
        }
        if let Some(v) = env.get("INGEST_NONFATAL_ERRORS_PATTERN") {
            self.ingest.nonfatal_regex = v;
        }
        if let Some(v) = env.parse("INGEST_MCP_TIMEOUT_SEC") {
            self.ingest.timeout_sec = v;
        }
        if let Some(v) = env.parse("FIXPACK_MAX_SUGGESTIONS") {
            self.fixpack.max_suggestions = v;
        }
        if let Some(v) = env.parse("FIXPACK_SUGGEST_TIMEOUT_SEC") {
            self.fixpack.suggest_timeout_sec = v;
        }
        self.vector_rag_enabled = env.get("ENABLE_VECTOR_RAG").is_some_and(|v| is_truthy(&v));
        self.vector_store_url = env.get("VECTOR_STORE_URL");
        self.embedding_api_key = env.get("EMBEDDING_API_KEY");
    }

    /// Compiles the transient-error matcher from the configured pattern.
    ///
    /// # Errors
    ///
    /// Returns a config error if the pattern does not compile.
    pub fn nonfatal_matcher(&self) -> Result<regex::Regex> {
        Ok(regex::Regex::new(&self.ingest.nonfatal_regex)?)
    }
}

/// Environment accessor, swappable for tests.
struct EnvSource {
    read: fn(&str) -> Option<String>,
}

impl EnvSource {
    fn process() -> Self {
        Self {
            read: |key| std::env::var(key).ok(),
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        (self.read)(key).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }
}

/// Interprets common truthy spellings for boolean env vars.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

//! RPC surface over the memory provider and solution registry.
//!
//! Every method takes a JSON params object and returns a JSON result;
//! failures come back as `{"error": {"kind": ..., "message": ...}}`.
//! Callable in-process and through the `mnemon rpc <method>` subcommand.

use crate::config::Config;
use crate::error::{Error, IngestError, StorageError, ValidationError};
use crate::memory::{DEFAULT_MIN_FEEDBACK, MemoryStore, SearchQuery, SqliteMemory};
use crate::solutions::{SolutionFilters, SolutionInput};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

/// Dispatches one RPC method.
#[must_use]
pub fn dispatch_method(
    method: &str,
    params: &Value,
    memory: &mut SqliteMemory,
    config: &Config,
) -> Value {
    match call(method, params, memory, config) {
        Ok(result) => result,
        Err(error) => json!({
            "error": {"kind": error_kind(&error), "message": error.to_string()}
        }),
    }
}

/// Method names this surface accepts.
pub const METHODS: &[&str] = &[
    "memory_ingest",
    "memory_search",
    "memory_feedback",
    "memory_projects",
    "memory_top_helpful",
    "memory_delete",
    "memory_reindex",
    "solution_search",
    "solution_get",
    "solution_preview",
    "solution_apply",
    "solution_upsert",
    "pattern_detect",
    "pattern_solutions",
    "pattern_link",
    "golden_paths",
];

fn call(
    method: &str,
    params: &Value,
    memory: &mut SqliteMemory,
    config: &Config,
) -> crate::error::Result<Value> {
    match method {
        "memory_ingest" => {
            let root = required_path(params, "project_root")?;
            let path = required_str(params, "path")?;
            let text = required_str(params, "text")?;
            let meta = params.get("meta").cloned().unwrap_or(Value::Null);
            let receipt = memory.ingest(&root, path, text, &meta)?;
            Ok(json!({"chunks": receipt.chunks, "project_id": receipt.project_id}))
        }
        "memory_search" => {
            let query = SearchQuery {
                project_root: params
                    .get("project_root")
                    .and_then(|v| v.as_str())
                    .map(PathBuf::from),
                query: required_str(params, "query")?.to_string(),
                k: usize_param(params, "k", 0),
                global: params
                    .get("global")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                component: opt_string(params, "component"),
                category: opt_string(params, "category"),
                tags: params
                    .get("tags")
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str().map(String::from))
                            .collect()
                    })
                    .unwrap_or_default(),
            };
            let response = memory.search(&query)?;
            Ok(serde_json::to_value(response).map_err(StorageError::from)?)
        }
        "memory_feedback" => {
            let chunk_id = required_i64(params, "chunk_id")?;
            let helpful = params
                .get("helpful")
                .and_then(Value::as_bool)
                .ok_or_else(|| missing("helpful"))?;
            let context = opt_string(params, "context");
            memory.record_feedback(chunk_id, helpful, context.as_deref())?;
            Ok(json!({"ok": true}))
        }
        "memory_projects" => {
            let projects = memory.list_projects()?;
            Ok(serde_json::to_value(projects).map_err(StorageError::from)?)
        }
        "memory_top_helpful" => {
            let limit = usize_param(params, "limit", 10);
            let min_feedback = params
                .get("min_feedback")
                .and_then(Value::as_i64)
                .unwrap_or(DEFAULT_MIN_FEEDBACK);
            let chunks = memory.top_helpful(limit, min_feedback)?;
            Ok(serde_json::to_value(chunks).map_err(StorageError::from)?)
        }
        "memory_delete" => {
            let root = required_path(params, "project_root")?;
            let path = required_str(params, "path")?;
            let deleted = memory.delete_by_path(&root, path)?;
            Ok(json!({"deleted": deleted}))
        }
        "memory_reindex" => {
            let root = required_path(params, "project_root")?;
            let chunks = memory.reindex(&root)?;
            Ok(json!({"chunks": chunks}))
        }
        "solution_search" => {
            let error_message = required_str(params, "error_message")?;
            let filters: SolutionFilters = params
                .get("filters")
                .map(|f| serde_json::from_value(f.clone()))
                .transpose()
                .map_err(|e| ValidationError::Invalid {
                    message: format!("bad filters: {e}"),
                })?
                .unwrap_or_default();
            let limit = usize_param(params, "limit", config.fixpack.max_suggestions);
            let matches = memory.find_solutions(error_message, &filters, limit)?;
            Ok(serde_json::to_value(matches).map_err(StorageError::from)?)
        }
        "solution_get" => {
            let id = required_i64(params, "id")?;
            let include_steps = params
                .get("include_steps")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let matched = memory.get_solution(id, include_steps)?;
            Ok(serde_json::to_value(matched).map_err(StorageError::from)?)
        }
        "solution_preview" => {
            let id = required_i64(params, "id")?;
            let root = params
                .get("project_root")
                .and_then(|v| v.as_str())
                .map(PathBuf::from);
            let preview = memory.preview_solution(id, root.as_deref())?;
            Ok(serde_json::to_value(preview).map_err(StorageError::from)?)
        }
        "solution_apply" => {
            let id = required_i64(params, "id")?;
            let success = params
                .get("success")
                .and_then(Value::as_bool)
                .ok_or_else(|| missing("success"))?;
            memory.record_application(id, success)?;
            Ok(json!({"ok": true}))
        }
        "solution_upsert" => {
            let input: SolutionInput = serde_json::from_value(params.clone()).map_err(|e| {
                ValidationError::Invalid {
                    message: format!("bad solution input: {e}"),
                }
            })?;
            let id = memory.create_solution(&input)?;
            Ok(json!({"id": id}))
        }
        "pattern_detect" => {
            let query_text = required_str(params, "query_text")?;
            let limit = usize_param(params, "limit", 3);
            let patterns = memory.pattern_detect(query_text, limit)?;
            Ok(serde_json::to_value(patterns).map_err(StorageError::from)?)
        }
        "pattern_solutions" => {
            let tag = required_str(params, "pattern_tag")?;
            let category = opt_string(params, "pattern_category");
            let limit = usize_param(params, "limit", 5);
            let matches = memory.get_solutions_for_pattern(tag, category.as_deref(), limit)?;
            Ok(serde_json::to_value(matches).map_err(StorageError::from)?)
        }
        "pattern_link" => {
            let tag = required_str(params, "pattern_tag")?;
            let category = required_str(params, "pattern_category")?;
            let solution_id = required_i64(params, "solution_id")?;
            let success = params
                .get("success")
                .and_then(Value::as_bool)
                .ok_or_else(|| missing("success"))?;
            memory.link_pattern_to_solution(tag, category, solution_id, success)?;
            Ok(json!({"ok": true}))
        }
        "golden_paths" => {
            let min_applications = params
                .get("min_applications")
                .and_then(Value::as_i64)
                .unwrap_or(3);
            let limit = usize_param(params, "limit", 20);
            let paths = memory.get_golden_paths(min_applications, limit)?;
            Ok(serde_json::to_value(paths).map_err(StorageError::from)?)
        }
        other => Err(ValidationError::Invalid {
            message: format!("unknown method: {other}"),
        }
        .into()),
    }
}

/// Stable error kind names for the wire.
fn error_kind(error: &Error) -> &'static str {
    match error {
        Error::Config { .. } => "config",
        Error::Transcript(_) => "transcript",
        Error::Validation(_) => "validation",
        Error::Ingest(IngestError::Transient(_)) => "transient",
        Error::Ingest(IngestError::Fatal(_)) => "fatal",
        Error::Storage(StorageError::DimensionMismatch { .. } | StorageError::Integrity(_)) => {
            "fatal"
        }
        Error::Storage(_) => "storage",
        Error::Hook(_) => "hook",
        Error::Io(_) => "io",
    }
}

fn missing(field: &str) -> Error {
    ValidationError::Invalid {
        message: format!("missing required param: {field}"),
    }
    .into()
}

fn required_str<'a>(params: &'a Value, field: &str) -> crate::error::Result<&'a str> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| missing(field))
}

fn required_path(params: &Value, field: &str) -> crate::error::Result<PathBuf> {
    required_str(params, field).map(|s| Path::new(s).to_path_buf())
}

fn required_i64(params: &Value, field: &str) -> crate::error::Result<i64> {
    params
        .get(field)
        .and_then(Value::as_i64)
        .ok_or_else(|| missing(field))
}

fn usize_param(params: &Value, field: &str, default: usize) -> usize {
    params
        .get(field)
        .and_then(Value::as_u64)
        .map_or(default, |v| usize::try_from(v).unwrap_or(default))
}

fn opt_string(params: &Value, field: &str) -> Option<String> {
    params
        .get(field)
        .and_then(|v| v.as_str())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (SqliteMemory, Config) {
        let config = Config::default();
        let mut memory = SqliteMemory::in_memory(&config).unwrap();
        memory.init().unwrap();
        (memory, config)
    }

    #[test]
    fn test_ingest_search_feedback_roundtrip() {
        let (mut memory, config) = setup();

        let result = dispatch_method(
            "memory_ingest",
            &json!({
                "project_root": "/work/acme",
                "path": "logs/digests/t1-1",
                "text": "Chose rename-based claims for the ingest queue.",
                "meta": {"task_id": "t1", "outcome_status": "success"}
            }),
            &mut memory,
            &config,
        );
        assert_eq!(result["chunks"], 1);

        let result = dispatch_method(
            "memory_search",
            &json!({"project_root": "/work/acme", "query": "rename claims", "k": 5}),
            &mut memory,
            &config,
        );
        assert_eq!(result["total"], 1);
        let chunk_id = result["results"][0]["meta"]["chunk_id"].as_i64().unwrap();
        assert_eq!(result["results"][0]["meta"]["task_id"], "t1");

        let result = dispatch_method(
            "memory_feedback",
            &json!({"chunk_id": chunk_id, "helpful": true}),
            &mut memory,
            &config,
        );
        assert_eq!(result["ok"], true);
    }

    #[test]
    fn test_missing_param_is_validation_error() {
        let (mut memory, config) = setup();
        let result = dispatch_method("memory_search", &json!({}), &mut memory, &config);
        assert_eq!(result["error"]["kind"], "validation");
        assert!(
            result["error"]["message"]
                .as_str()
                .unwrap()
                .contains("query")
        );
    }

    #[test]
    fn test_unknown_method() {
        let (mut memory, config) = setup();
        let result = dispatch_method("memory_destroy", &json!({}), &mut memory, &config);
        assert!(
            result["error"]["message"]
                .as_str()
                .unwrap()
                .contains("unknown method")
        );
    }

    #[test]
    fn test_solution_flow_over_rpc() {
        let (mut memory, config) = setup();

        let result = dispatch_method(
            "solution_upsert",
            &json!({
                "title": "Fix Redis DNS",
                "description": "Repoint REDIS_HOST.",
                "category": "runtime",
                "signatures": [{"text": "getaddrinfo ENOTFOUND redis"}],
                "steps": [{"order": 0, "kind": "cmd", "payload": "echo ${PROJECT_ROOT}"}],
                "checks": [{"order": 0, "cmd": "redis-cli ping", "expect_substring": "PONG"}]
            }),
            &mut memory,
            &config,
        );
        let id = result["id"].as_i64().unwrap();

        let result = dispatch_method(
            "solution_search",
            &json!({"error_message": "getaddrinfo ENOTFOUND redis"}),
            &mut memory,
            &config,
        );
        assert_eq!(result[0]["id"].as_i64(), Some(id));
        assert!(result[0]["similarity"].as_f64().unwrap() > 0.0);

        let result = dispatch_method(
            "solution_preview",
            &json!({"id": id, "project_root": "/work/acme"}),
            &mut memory,
            &config,
        );
        assert_eq!(result["steps"][0]["payload"], "echo /work/acme");

        let result = dispatch_method(
            "solution_apply",
            &json!({"id": id, "success": true}),
            &mut memory,
            &config,
        );
        assert_eq!(result["ok"], true);

        let result = dispatch_method(
            "pattern_link",
            &json!({
                "pattern_tag": "redis-connection",
                "pattern_category": "runtime",
                "solution_id": id,
                "success": true
            }),
            &mut memory,
            &config,
        );
        assert_eq!(result["ok"], true);

        let result = dispatch_method(
            "pattern_solutions",
            &json!({"pattern_tag": "redis-connection"}),
            &mut memory,
            &config,
        );
        assert_eq!(result[0]["id"].as_i64(), Some(id));

        let result = dispatch_method(
            "golden_paths",
            &json!({"min_applications": 1}),
            &mut memory,
            &config,
        );
        assert_eq!(result[0]["solution_id"].as_i64(), Some(id));
    }

    #[test]
    fn test_fatal_kind_for_dimension_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = dir.path().join("memory.db");
        let good = Config::default();
        let mut store = SqliteMemory::open(&db, &good).unwrap();
        store.init().unwrap();
        drop(store);

        let mut bad = Config::default();
        bad.embedding.dim = 1024;
        let mut store = SqliteMemory::open(&db, &bad).unwrap();
        let result = dispatch_method(
            "memory_ingest",
            &json!({"project_root": "/p", "path": "x", "text": "content"}),
            &mut store,
            &bad,
        );
        assert_eq!(result["error"]["kind"], "fatal");
    }

    #[test]
    fn test_memory_projects_and_delete() {
        let (mut memory, config) = setup();
        dispatch_method(
            "memory_ingest",
            &json!({"project_root": "/p", "path": "a.md", "text": "Some content here."}),
            &mut memory,
            &config,
        );

        let projects = dispatch_method("memory_projects", &json!({}), &mut memory, &config);
        assert_eq!(projects[0]["doc_count"], 1);

        let result = dispatch_method(
            "memory_delete",
            &json!({"project_root": "/p", "path": "a.md"}),
            &mut memory,
            &config,
        );
        assert_eq!(result["deleted"], 1);
    }
}

//! Seed a fixpack with a signature and a proven pattern link, then
//! drive detection and golden paths through the RPC surface.

#![allow(clippy::expect_used)]

use mnemon::rpc::dispatch_method;
use mnemon::{Config, SqliteMemory};
use serde_json::json;
use std::path::Path;

fn setup() -> (SqliteMemory, Config) {
    let config = Config::default();
    let mut memory = SqliteMemory::in_memory(&config).expect("store");
    memory.init().expect("init");
    (memory, config)
}

/// Seeds the fixture: a runtime solution with an ENOTFOUND signature, the
/// `redis-connection/runtime` pattern linked with 5 successes, and three
/// tagged chunks with strong helpful feedback.
fn seed(memory: &mut SqliteMemory, config: &Config) -> i64 {
    let result = dispatch_method(
        "solution_upsert",
        &json!({
            "title": "Repoint Redis host",
            "description": "Set REDIS_HOST to the compose service name and restart the worker.",
            "category": "runtime",
            "tags": ["redis", "dns"],
            "signatures": [{"text": "getaddrinfo ENOTFOUND", "regexes": ["ENOTFOUND"]}],
            "steps": [
                {"order": 0, "kind": "env", "payload": "REDIS_HOST=redis"},
                {"order": 1, "kind": "cmd", "payload": "${PACKAGE_MANAGER} run worker:restart"}
            ],
            "checks": [
                {"order": 0, "cmd": "redis-cli -h redis ping", "expect_substring": "PONG"}
            ]
        }),
        memory,
        config,
    );
    let id = result["id"].as_i64().expect("solution id");

    // Three chunks carrying the pattern tag make it detectable; feedback
    // gives the pattern a high helpful ratio
    for i in 0..3 {
        memory
            .ingest_document(
                Path::new("/work/acme"),
                &format!("logs/digests/redis-{i}"),
                &format!("Redis connection failure investigated, round {i}."),
                &json!({"tags": ["redis-connection"], "category": "runtime"}),
            )
            .expect("ingest");
    }
    let search = dispatch_method(
        "memory_search",
        &json!({"project_root": "/work/acme", "query": "redis connection failure", "k": 5}),
        memory,
        config,
    );
    for hit in search["results"].as_array().expect("results") {
        let chunk_id = hit["meta"]["chunk_id"].as_i64().expect("chunk id");
        dispatch_method(
            "memory_feedback",
            &json!({"chunk_id": chunk_id, "helpful": true}),
            memory,
            config,
        );
    }

    // Five successful applications of the pattern→solution link
    for _ in 0..5 {
        let result = dispatch_method(
            "pattern_link",
            &json!({
                "pattern_tag": "redis-connection",
                "pattern_category": "runtime",
                "solution_id": id,
                "success": true
            }),
            memory,
            config,
        );
        assert_eq!(result["ok"], true);
    }
    id
}

#[test]
fn pattern_detect_finds_the_golden_path() {
    let (mut memory, config) = setup();
    let id = seed(&mut memory, &config);

    let patterns = dispatch_method(
        "pattern_detect",
        &json!({"query_text": "Redis connection failing with getaddrinfo ENOTFOUND"}),
        &mut memory,
        &config,
    );
    let top = &patterns[0];
    assert_eq!(top["pattern_tag"], "redis-connection");
    assert_eq!(top["pattern_category"], "runtime");
    assert_eq!(top["top_solution_id"].as_i64(), Some(id));
    assert!(
        (top["top_solution_success_rate"].as_f64().expect("rate") - 1.0).abs() < f64::EPSILON
    );

    let paths = dispatch_method(
        "golden_paths",
        &json!({"min_applications": 3}),
        &mut memory,
        &config,
    );
    let golden = paths
        .as_array()
        .expect("paths")
        .iter()
        .find(|p| p["solution_id"].as_i64() == Some(id))
        .expect("the seeded pair is golden");
    assert!((golden["success_rate"].as_f64().expect("rate") - 1.0).abs() < f64::EPSILON);
    assert_eq!(golden["applications"], 5);
    assert!(golden["avg_helpful_ratio"].as_f64().expect("ratio") > 0.5);
}

#[test]
fn signature_search_ranks_the_solution_first() {
    let (mut memory, config) = setup();
    let id = seed(&mut memory, &config);

    // A decoy with an unrelated signature
    dispatch_method(
        "solution_upsert",
        &json!({
            "title": "Relax tsconfig strictness",
            "description": "Loosen noImplicitAny during migration.",
            "category": "tsconfig",
            "signatures": [{"text": "Parameter implicitly has an any type"}]
        }),
        &mut memory,
        &config,
    );

    let matches = dispatch_method(
        "solution_search",
        &json!({"error_message": "getaddrinfo ENOTFOUND redis-primary"}),
        &mut memory,
        &config,
    );
    assert_eq!(matches[0]["id"].as_i64(), Some(id));
    assert_eq!(matches[0]["category"], "runtime");
}

#[test]
fn pattern_solutions_rank_by_track_record() {
    let (mut memory, config) = setup();
    let strong = seed(&mut memory, &config);

    // A second, weaker solution on the same pattern
    let weak = dispatch_method(
        "solution_upsert",
        &json!({
            "title": "Restart everything",
            "description": "Blunt instrument.",
            "category": "runtime",
            "signatures": [{"text": "getaddrinfo ENOTFOUND"}]
        }),
        &mut memory,
        &config,
    )["id"]
        .as_i64()
        .expect("id");
    dispatch_method(
        "pattern_link",
        &json!({
            "pattern_tag": "redis-connection",
            "pattern_category": "runtime",
            "solution_id": weak,
            "success": false
        }),
        &mut memory,
        &config,
    );

    let ranked = dispatch_method(
        "pattern_solutions",
        &json!({"pattern_tag": "redis-connection", "pattern_category": "runtime"}),
        &mut memory,
        &config,
    );
    let ids: Vec<i64> = ranked
        .as_array()
        .expect("array")
        .iter()
        .map(|m| m["id"].as_i64().expect("id"))
        .collect();
    assert_eq!(ids, vec![strong, weak]);
}

#[test]
fn preview_is_a_dry_run_with_substitution() {
    let (mut memory, config) = setup();
    let id = seed(&mut memory, &config);

    let preview = dispatch_method(
        "solution_preview",
        &json!({"id": id, "project_root": "/work/acme"}),
        &mut memory,
        &config,
    );
    // The package manager placeholder falls back to npm
    assert_eq!(preview["steps"][1]["payload"], "npm run worker:restart");
    assert_eq!(preview["checks"][0]["cmd"], "redis-cli -h redis ping");
}

#[test]
fn solution_apply_updates_counters() {
    let (mut memory, config) = setup();
    let id = seed(&mut memory, &config);

    dispatch_method(
        "solution_apply",
        &json!({"id": id, "success": true}),
        &mut memory,
        &config,
    );
    dispatch_method(
        "solution_apply",
        &json!({"id": id, "success": false}),
        &mut memory,
        &config,
    );

    let solution = dispatch_method(
        "solution_get",
        &json!({"id": id, "include_steps": false}),
        &mut memory,
        &config,
    );
    assert_eq!(solution["success_count"], 1);
    assert_eq!(solution["failure_count"], 1);
}

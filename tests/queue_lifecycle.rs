//! Queue durability invariants: every job terminates exactly one way,
//! crashes never leave partial JSON, claims are exclusive, and a
//! fatal dimension mismatch dead-letters on the first attempt.

#![allow(clippy::expect_used)]

use mnemon::queue::{DrainReport, IngestJob, IngestQueue, JobSource, QueueProcessor};
use mnemon::{Config, SqliteMemory};
use std::path::Path;
use tempfile::TempDir;

fn job(root: &Path, path: &str, text: &str) -> IngestJob {
    IngestJob::new(
        root,
        JobSource::Digest,
        path,
        text.to_string(),
        serde_json::json!({"source": "digest"}),
    )
}

#[test]
fn dimension_mismatch_dead_letters_without_retry() {
    let dir = TempDir::new().expect("temp dir");
    let db = dir.path().join("memory.db");

    // Initialize the store at the fixed 1536 dimension
    let good = Config::default();
    let mut store = SqliteMemory::open(&db, &good).expect("open");
    store.init().expect("init");
    drop(store);

    // Reopen with a misconfigured 1024-dim embedder
    let mut bad = Config::default();
    bad.embedding.dim = 1024;
    let mut store = SqliteMemory::open(&db, &bad).expect("open misconfigured");

    let queue = IngestQueue::new(&dir.path().join("ingest-queue"));
    queue
        .enqueue(&job(dir.path(), "logs/digests/t1-1", "Some decision text."))
        .expect("enqueue");

    let mut processor = QueueProcessor::new(&queue, &mut store, &bad).expect("processor");
    let report = processor.drain(None);

    // Fatal on the first attempt: no retries scheduled
    assert_eq!(
        report,
        DrainReport {
            processed: 0,
            retried: 0,
            dead: 1
        }
    );
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.dead_count(), 1);

    // The dead-lettered file is intact, attempts untouched
    let dead_dir = dir.path().join("ingest-queue/dead");
    let dead_file = std::fs::read_dir(&dead_dir)
        .expect("dead dir")
        .flatten()
        .next()
        .expect("one dead file");
    let parsed: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dead_file.path()).expect("dead file readable"),
    )
    .expect("dead file is json");
    assert_eq!(parsed["attempts"], 0);
}

#[test]
fn every_pending_file_is_complete_json() {
    let dir = TempDir::new().expect("temp dir");
    let queue = IngestQueue::new(&dir.path().join("ingest-queue"));

    for i in 0..10 {
        queue
            .enqueue(&job(dir.path(), &format!("doc/{i}"), &format!("text {i}")))
            .expect("enqueue");
    }

    // Atomic enqueue: no reader ever observes partial JSON, and no temp
    // files remain after the renames
    for entry in std::fs::read_dir(dir.path().join("ingest-queue")).expect("dir") {
        let path = entry.expect("entry").path();
        if path.is_dir() {
            continue;
        }
        assert_eq!(
            path.extension().and_then(|e| e.to_str()),
            Some("json"),
            "unexpected file: {}",
            path.display()
        );
        let raw = std::fs::read_to_string(&path).expect("readable");
        serde_json::from_str::<IngestJob>(&raw).expect("complete job JSON");
    }
}

#[test]
fn claim_is_exclusive() {
    let dir = TempDir::new().expect("temp dir");
    let queue_dir = dir.path().join("ingest-queue");
    let first = IngestQueue::new(&queue_dir);
    let second = IngestQueue::new(&queue_dir);

    first
        .enqueue(&job(dir.path(), "doc/one", "only one claimant wins"))
        .expect("enqueue");

    let claimed = first.claim_next().expect("claim").expect("job available");
    // The rename moved the file; the other processor finds nothing
    assert!(second.claim_next().expect("claim").is_none());

    first.complete(claimed).expect("complete");
}

#[test]
fn success_path_terminates_with_deletion() {
    let dir = TempDir::new().expect("temp dir");
    let db = dir.path().join("memory.db");
    let config = Config::default();
    let mut store = SqliteMemory::open(&db, &config).expect("open");
    store.init().expect("init");

    let queue = IngestQueue::new(&dir.path().join("ingest-queue"));
    queue
        .enqueue(&job(dir.path(), "doc/a", "Persisted decision one."))
        .expect("enqueue");
    queue
        .enqueue(&job(dir.path(), "doc/b", "Persisted decision two."))
        .expect("enqueue");

    let mut processor = QueueProcessor::new(&queue, &mut store, &config).expect("processor");
    let report = processor.drain(None);

    assert_eq!(report.processed, 2);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(queue.dead_count(), 0);
    // Inflight is empty: success deletes the claimed file
    let inflight = dir.path().join("ingest-queue/inflight");
    assert_eq!(
        std::fs::read_dir(&inflight).expect("inflight dir").count(),
        0
    );
}

#[test]
fn retried_job_preserves_payload_and_counts_attempts() {
    let dir = TempDir::new().expect("temp dir");
    let queue = IngestQueue::new(&dir.path().join("ingest-queue"));
    queue
        .enqueue(&job(dir.path(), "doc/a", "retry payload"))
        .expect("enqueue");

    let claimed = queue.claim_next().expect("claim").expect("job");
    let original_text = claimed.job.text.clone();
    queue.retry(claimed).expect("retry");

    // The job file is back in pending with attempts bumped and the
    // payload intact (mtime pushed into the future blocks re-claim)
    let pending: Vec<_> = std::fs::read_dir(dir.path().join("ingest-queue"))
        .expect("dir")
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
        .collect();
    assert_eq!(pending.len(), 1);
    let parsed: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(pending[0].path()).expect("readable"),
    )
    .expect("json");
    assert_eq!(parsed["attempts"], 1);
    assert_eq!(parsed["text"], original_text);
    assert!(queue.claim_next().expect("claim").is_none());
}

#[test]
fn reingest_identical_content_is_idempotent() {
    let dir = TempDir::new().expect("temp dir");
    let db = dir.path().join("memory.db");
    let config = Config::default();
    let mut store = SqliteMemory::open(&db, &config).expect("open");
    store.init().expect("init");

    let queue = IngestQueue::new(&dir.path().join("ingest-queue"));
    let text = "The same digest delivered twice.";

    // At-least-once delivery: the same job content enqueued twice
    queue
        .enqueue(&job(dir.path(), "logs/digests/t1-1", text))
        .expect("enqueue");
    queue
        .enqueue(&job(dir.path(), "logs/digests/t1-1", text))
        .expect("enqueue");

    let mut processor = QueueProcessor::new(&queue, &mut store, &config).expect("processor");
    let report = processor.drain(None);
    assert_eq!(report.processed, 2);

    // Store content: one chunk, not two
    assert_eq!(store.chunk_count().expect("count"), 1);
}

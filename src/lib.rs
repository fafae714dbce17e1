//! # mnemon
//!
//! Orchestration memory and governance layer for AI coding assistants.
//!
//! mnemon sits between an interactive coding assistant and the user's
//! filesystem: it observes tool invocations through lifecycle hooks,
//! enforces policy at tool boundaries, captures structured session
//! summaries (DIGESTs), persists them through a crash-safe ingest queue
//! into a vector memory, and serves them back through hybrid search.
//!
//! ## Guarantees
//!
//! - **Hooks fail open**: an internal failure never blocks the host; the
//!   only exit code 2 is an explicit policy block.
//! - **At-least-once ingest**: captured DIGESTs are eventually ingested
//!   or moved to a dead-letter store; the store's uniqueness on
//!   `(project, path, content hash)` makes retries idempotent.
//! - **Deterministic search**: rankings are stable for a fixed memory
//!   state, with documented tie-breaks.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(missing_docs)]
// Note: unsafe is needed for memory-mapped I/O (memmap2)
#![warn(unsafe_code)]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod digest;
pub mod error;
pub mod hash;
pub mod hooks;
pub mod io;
pub mod memory;
pub mod policy;
pub mod project;
pub mod queue;
pub mod rpc;
pub mod solutions;
pub mod transcript;
pub mod wsi;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

// Session state
pub use project::ProjectPaths;
pub use wsi::{FileHashCache, TurnCounter, WsiEntry, WsiStore};

// Hooks and policy
pub use hooks::{HookEvent, HookEventKind, HookOutcome, dispatch};
pub use policy::{Decision, PolicyEngine, PolicyRule, SessionState};

// DIGEST pipeline
pub use digest::Digest;
pub use queue::{DrainReport, IngestJob, IngestQueue, JobSource, QueueProcessor};

// Memory provider
pub use memory::{
    EMBEDDING_DIM, Embedder, HashEmbedder, IngestReceipt, MemoryStore, ProjectRecord, SearchHit,
    SearchQuery, SearchResponse, SqliteMemory, chunk_text, cosine_similarity,
};

// Solution registry
pub use solutions::{
    GoldenPath, PatternMatch, Solution, SolutionFilters, SolutionInput, SolutionMatch,
};

// Configuration
pub use config::Config;

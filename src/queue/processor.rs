//! Queue processor: drains pending jobs into the memory provider.
//!
//! Failures are classified per job: transient errors go back to pending
//! with backoff, fatal ones (dimension/schema/auth) dead-letter
//! immediately, and the attempt cap dead-letters persistent offenders.
//! Processing errors never terminate the drain loop.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::MemoryStore;
use crate::queue::{ClaimedJob, IngestQueue};
use regex::Regex;
use std::time::{Duration, Instant};

/// Outcome counts for one drain run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Jobs ingested successfully.
    pub processed: usize,
    /// Jobs returned to pending with backoff.
    pub retried: usize,
    /// Jobs moved to the dead-letter directory.
    pub dead: usize,
}

/// Drains an [`IngestQueue`] into a [`MemoryStore`].
pub struct QueueProcessor<'a> {
    queue: &'a IngestQueue,
    store: &'a mut dyn MemoryStore,
    max_attempts: u32,
    nonfatal: Regex,
}

impl<'a> QueueProcessor<'a> {
    /// Creates a processor with the configured attempt cap and
    /// transient-error pattern.
    ///
    /// # Errors
    ///
    /// Returns a config error if the transient pattern does not compile.
    pub fn new(
        queue: &'a IngestQueue,
        store: &'a mut dyn MemoryStore,
        config: &Config,
    ) -> Result<Self> {
        Ok(Self {
            queue,
            store,
            max_attempts: config.ingest.max_attempts,
            nonfatal: config.nonfatal_matcher()?,
        })
    }

    /// Claims and processes jobs until the queue is empty (of eligible
    /// jobs) or the time budget is spent.
    #[must_use]
    pub fn drain(&mut self, budget: Option<Duration>) -> DrainReport {
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            if budget.is_some_and(|b| started.elapsed() >= b) {
                break;
            }
            let claimed = match self.queue.claim_next() {
                Ok(Some(claimed)) => claimed,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "queue claim failed; stopping drain");
                    break;
                }
            };
            self.process_one(claimed, &mut report);
        }
        report
    }

    /// Processes a single claimed job, updating the report.
    fn process_one(&mut self, claimed: ClaimedJob, report: &mut DrainReport) {
        let job_id = claimed.job.job_id.clone();
        let result = self.store.ingest(
            &claimed.job.project_root,
            &claimed.job.path_in_project,
            &claimed.job.text,
            &claimed.job.meta,
        );

        match result {
            Ok(receipt) => {
                tracing::debug!(job = %job_id, chunks = receipt.chunks, "job ingested");
                if let Err(e) = self.queue.complete(claimed) {
                    tracing::warn!(job = %job_id, error = %e, "completed job cleanup failed");
                }
                report.processed += 1;
            }
            Err(error) => self.handle_failure(claimed, &error, report),
        }
    }

    fn handle_failure(&self, claimed: ClaimedJob, error: &Error, report: &mut DrainReport) {
        let job_id = claimed.job.job_id.clone();
        let attempts = claimed.job.attempts;

        let fatal = !self.is_retryable(error);
        let exhausted = attempts + 1 >= self.max_attempts;

        if fatal || exhausted {
            tracing::warn!(job = %job_id, attempts, fatal, error = %error,
                "dead-lettering job");
            if let Err(e) = self.queue.dead(claimed) {
                tracing::warn!(job = %job_id, error = %e, "dead-letter move failed");
            }
            report.dead += 1;
        } else {
            tracing::debug!(job = %job_id, attempts, error = %error, "retrying job");
            if let Err(e) = self.queue.retry(claimed) {
                tracing::warn!(job = %job_id, error = %e, "retry requeue failed");
                report.dead += 1;
                return;
            }
            report.retried += 1;
        }
    }

    /// Classification: explicitly fatal kinds (dimension mismatch,
    /// integrity, validation) never retry; explicit transients always do;
    /// everything else is decided by the configured pattern.
    fn is_retryable(&self, error: &Error) -> bool {
        match error {
            _ if !error.is_transient() => false,
            Error::Ingest(_) => true,
            other => self.nonfatal.is_match(&other.to_string()),
        }
    }
}

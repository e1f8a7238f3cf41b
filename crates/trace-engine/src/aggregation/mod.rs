//! # Aggregation Scheduler
//!
//! Incrementally turns freshly completed calls into persisted summaries,
//! exactly once per call identifier. Each pass:
//!
//! 1. reads the watermark — the highest CDR sequence id already present
//!    among persisted summaries (0 if none);
//! 2. fetches up to `batch_size` CDRs strictly above it, ascending;
//! 3. builds traces in bulk for exactly those CDRs' call identifiers,
//!    handing over the already-fetched CDRs so they are not read twice;
//! 4. maps each trace to a summary draft, joined back to its source CDR
//!    (a missing source record skips that draft rather than failing the
//!    batch);
//! 5. bulk-checks which drafts already have a persisted summary and filters
//!    them out;
//! 6. inserts the rest, one by one, logging and continuing on per-item
//!    failures.
//!
//! The existence check in step 5 is the correctness mechanism: a given CDR
//! is summarized at most once across any number of runs, overlapping or
//! duplicate triggers included, regardless of the watermark's accuracy.
//! The watermark only limits rescanning.
//!
//! Re-entrancy: an in-process `AtomicBool` guard makes an overlapping
//! trigger a no-op (skipped, not queued). The guard is not shared across
//! process instances; concurrent instances fall back to the existence
//! check. Known limitation, not a design goal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::database::DatabaseManager;
use crate::error::Result;
use crate::trace::TraceBuilder;

/// Counts reported by one aggregation pass, for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationOutcome {
    /// Pass was skipped because another run was still active
    pub skipped_overlap: bool,
    /// CDR rows read past the watermark
    pub scanned: usize,
    /// Summaries actually inserted
    pub created: usize,
    /// Drafts dropped because a summary already existed
    pub already_present: usize,
}

/// Recurring job that persists call summaries for new CDRs
pub struct AggregationScheduler {
    db: DatabaseManager,
    builder: TraceBuilder,
    batch_size: usize,
    running: AtomicBool,
}

impl AggregationScheduler {
    pub fn new(db: DatabaseManager, builder: TraceBuilder, batch_size: usize) -> Self {
        Self {
            db,
            builder,
            batch_size,
            running: AtomicBool::new(false),
        }
    }

    /// Run one aggregation pass. Idempotent and safe to invoke manually or
    /// from a timer; an overlapping invocation returns immediately with
    /// `skipped_overlap` set.
    pub async fn run_aggregation_pass(&self) -> Result<AggregationOutcome> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Aggregation pass already active, skipping this trigger");
            return Ok(AggregationOutcome {
                skipped_overlap: true,
                ..Default::default()
            });
        }

        let result = self.run_pass_inner().await;
        self.running.store(false, Ordering::Release);
        result
    }

    async fn run_pass_inner(&self) -> Result<AggregationOutcome> {
        let watermark = self.db.max_summarized_cdr_sequence().await?;
        let cdrs = self.db.cdrs_after(watermark, self.batch_size as i64).await?;
        if cdrs.is_empty() {
            debug!("No CDRs past watermark {}", watermark);
            return Ok(AggregationOutcome::default());
        }

        let scanned = cdrs.len();
        let mut call_ids = Vec::with_capacity(cdrs.len());
        let mut cdrs_by_id = HashMap::new();
        for cdr in cdrs {
            if !cdrs_by_id.contains_key(&cdr.unique_id) {
                call_ids.push(cdr.unique_id.clone());
                cdrs_by_id.insert(cdr.unique_id.clone(), cdr);
            }
        }

        let traces = self
            .builder
            .build_traces(&call_ids, Some(cdrs_by_id.clone()))
            .await?;

        // Join each trace back to its source CDR; a trace without one
        // should not happen, but is guarded rather than failing the batch.
        let mut drafts = Vec::with_capacity(traces.len());
        for trace in traces {
            if cdrs_by_id.contains_key(&trace.call_id) {
                drafts.push(trace.summary);
            } else {
                warn!("Trace {} has no source CDR, skipping draft", trace.call_id);
            }
        }

        let draft_ids: Vec<String> = drafts.iter().map(|d| d.call_id.clone()).collect();
        let existing = self.db.existing_summary_call_ids(&draft_ids).await?;

        let mut created = 0usize;
        let mut already_present = 0usize;
        for draft in drafts {
            if existing.contains(&draft.call_id) {
                already_present += 1;
                continue;
            }
            // Per-item failures stay per-item; the record is retried on the
            // next pass because the watermark has not moved past it.
            match self.db.insert_summary(&draft).await {
                Ok(()) => created += 1,
                Err(e) => warn!("Failed to persist summary for {}: {}", draft.call_id, e),
            }
        }

        info!(
            "📊 Aggregation pass: {} CDRs scanned past watermark {}, {} summaries created, {} already present",
            scanned, watermark, created, already_present
        );

        Ok(AggregationOutcome {
            skipped_overlap: false,
            scanned,
            created,
            already_present,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overlapping_trigger_is_skipped_not_queued() {
        let db = DatabaseManager::new("sqlite::memory:").await.unwrap();
        let scheduler = AggregationScheduler::new(db.clone(), TraceBuilder::new(db), 100);

        // Simulate a run still in progress.
        scheduler.running.store(true, Ordering::Release);
        let outcome = scheduler.run_aggregation_pass().await.unwrap();
        assert!(outcome.skipped_overlap);
        assert_eq!(outcome.created, 0);

        // Guard released: the next trigger runs normally (empty store).
        scheduler.running.store(false, Ordering::Release);
        let outcome = scheduler.run_aggregation_pass().await.unwrap();
        assert!(!outcome.skipped_overlap);
        assert_eq!(outcome.scanned, 0);
    }
}

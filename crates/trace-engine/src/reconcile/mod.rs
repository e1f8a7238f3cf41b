//! # Reconciliation Engine
//!
//! Links application-originated call log entries to the telephony system's
//! own call-detail record once the external CDR writer — which runs on its
//! own schedule and may lag or never write at all — catches up.
//!
//! Two trigger paths feed one matching routine:
//!
//! - **Polling path**: a recurring sweep over every record still in
//!   `awaiting_cdr`, attempting a match for each.
//! - **Event-driven fast path**: a channel-destroyed notification carrying
//!   a client-supplied correlation id and/or a telephony channel id. The
//!   engine waits a short settle delay (the CDR writer needs a moment to
//!   persist), then matches just the affected records.
//!
//! Matching precedence, first successful lookup wins:
//!
//! 1. CDR `userfield == client_call_id`
//! 2. CDR `unique_id == sip_call_id`
//! 3. CDR `userfield == call_id` (legacy fallback)
//!
//! On a hit the record is promoted to `completed` with the CDR's unique id,
//! duration and disposition. On a miss it is left untouched for the next
//! sweep — a record with no CDR ever arriving stays `awaiting_cdr` forever,
//! which is accepted business behavior, deliberately without expiry.
//!
//! Both paths may process the same record concurrently; the status-guarded
//! update makes that safe — the second matcher simply finds the record
//! already resolved.

use dashmap::DashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database::{CallLogRecord, CdrRecord, DatabaseManager};
use crate::error::Result;

/// Counts reported by one reconciliation sweep, for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Awaiting records examined
    pub scanned: usize,
    /// Records promoted to completed
    pub completed: usize,
}

/// Matches pending call logs against newly arrived CDRs
pub struct ReconciliationEngine {
    db: DatabaseManager,
    settle_delay: Duration,
    /// Correlation ids the fast path is currently working on; a second
    /// notification for the same id is dropped instead of queued.
    in_flight: DashMap<String, ()>,
}

impl ReconciliationEngine {
    pub fn new(db: DatabaseManager, settle_delay: Duration) -> Self {
        Self {
            db,
            settle_delay,
            in_flight: DashMap::new(),
        }
    }

    /// Run one polling sweep over all awaiting records. Idempotent; safe to
    /// invoke on a schedule or manually. One record's failure never aborts
    /// the rest of the batch.
    pub async fn run_reconciliation_pass(&self) -> Result<ReconcileOutcome> {
        let records = self.db.awaiting_call_logs().await?;
        let scanned = records.len();
        let mut completed = 0usize;

        for record in records {
            match self.try_match_record(&record).await {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => {
                    // Transient per-record failure: logged, retried on the
                    // next scheduled pass.
                    warn!("Reconciliation failed for call log {}: {}", record.id, e);
                }
            }
        }

        if scanned > 0 {
            info!(
                "🔗 Reconciliation pass: {} awaiting records scanned, {} completed",
                scanned, completed
            );
        }
        Ok(ReconcileOutcome { scanned, completed })
    }

    /// Event-driven fast path: a near-real-time channel-destroyed signal.
    /// Waits the settle delay, then matches just the records correlated to
    /// the given ids. Returns how many records were completed.
    pub async fn on_channel_destroyed(
        &self,
        client_call_id: Option<&str>,
        sip_call_id: Option<&str>,
    ) -> Result<usize> {
        let mut correlation_ids = Vec::new();
        for id in [client_call_id, sip_call_id].into_iter().flatten() {
            // Dedupe concurrent notifications for the same channel.
            if self.in_flight.insert(id.to_string(), ()).is_none() {
                correlation_ids.push(id.to_string());
            }
        }
        if correlation_ids.is_empty() {
            return Ok(0);
        }

        // Give the external CDR writer time to persist its row.
        tokio::time::sleep(self.settle_delay).await;

        let mut completed = 0usize;
        for correlation_id in &correlation_ids {
            match self.db.awaiting_call_logs_for_correlation(correlation_id).await {
                Ok(records) => {
                    for record in records {
                        match self.try_match_record(&record).await {
                            Ok(true) => completed += 1,
                            Ok(false) => {
                                debug!(
                                    "No CDR yet for call log {} (fast path); polling sweep will retry",
                                    record.id
                                );
                            }
                            Err(e) => {
                                warn!("Fast-path reconciliation failed for {}: {}", record.id, e)
                            }
                        }
                    }
                }
                Err(e) => warn!("Fast-path lookup failed for {}: {}", correlation_id, e),
            }
            self.in_flight.remove(correlation_id);
        }
        Ok(completed)
    }

    /// The prioritized matching routine. Returns true when the record was
    /// promoted to completed by this call.
    async fn try_match_record(&self, record: &CallLogRecord) -> Result<bool> {
        let Some(cdr) = self.find_matching_cdr(record).await? else {
            return Ok(false);
        };

        let promoted = self
            .db
            .complete_call_log(
                &record.id,
                &cdr.unique_id,
                cdr.duration_seconds,
                &cdr.disposition,
            )
            .await?;
        if promoted {
            debug!(
                "Call log {} completed from CDR {} ({})",
                record.id, cdr.unique_id, cdr.disposition
            );
        }
        Ok(promoted)
    }

    async fn find_matching_cdr(&self, record: &CallLogRecord) -> Result<Option<CdrRecord>> {
        if let Some(client_call_id) = record.client_call_id.as_deref() {
            if let Some(cdr) = self.db.find_cdr_by_userfield(client_call_id).await? {
                return Ok(Some(cdr));
            }
        }
        if let Some(sip_call_id) = record.sip_call_id.as_deref() {
            if let Some(cdr) = self.db.find_cdr_by_unique_id(sip_call_id).await? {
                return Ok(Some(cdr));
            }
        }
        // Legacy writers put the call id in the userfield.
        if let Some(call_id) = record.call_id.as_deref() {
            if let Some(cdr) = self.db.find_cdr_by_userfield(call_id).await? {
                return Ok(Some(cdr));
            }
        }
        Ok(None)
    }
}

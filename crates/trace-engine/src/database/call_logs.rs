//! Call log reconciliation queries
//!
//! The reconciliation engine is the only writer of the
//! `awaiting_cdr -> completed` transition. The update is guarded on the
//! current status so the transition happens at most once even when the
//! polling sweep and the event-driven fast path race on the same record;
//! the loser simply finds zero rows to update.

use chrono::Utc;

use super::{CallLogRecord, DatabaseManager};
use crate::error::Result;

/// Lifecycle state of an application call log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallLogStatus {
    /// Waiting for the external CDR writer to produce a matching record.
    /// A record may stay in this state forever; that is accepted behavior,
    /// not an error.
    AwaitingCdr,
    Completed,
}

impl CallLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallLogStatus::AwaitingCdr => "awaiting_cdr",
            CallLogStatus::Completed => "completed",
        }
    }
}

const SELECT_CALL_LOG: &str =
    "SELECT id, client_call_id, sip_call_id, call_id, status, asterisk_unique_id, \
     duration_seconds, disposition, created_at, updated_at FROM call_logs";

impl DatabaseManager {
    /// All call logs still waiting for a CDR, oldest first.
    pub async fn awaiting_call_logs(&self) -> Result<Vec<CallLogRecord>> {
        let rows = sqlx::query_as::<_, CallLogRecord>(&format!(
            "{} WHERE status = 'awaiting_cdr' ORDER BY created_at ASC",
            SELECT_CALL_LOG
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Awaiting call logs matching one correlation id on either the
    /// client-supplied or the SIP channel key (fast path lookup).
    pub async fn awaiting_call_logs_for_correlation(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<CallLogRecord>> {
        let rows = sqlx::query_as::<_, CallLogRecord>(&format!(
            "{} WHERE status = 'awaiting_cdr' \
             AND (client_call_id = ? OR sip_call_id = ?) ORDER BY created_at ASC",
            SELECT_CALL_LOG
        ))
        .bind(correlation_id)
        .bind(correlation_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Promote one awaiting record to completed with the matched CDR's
    /// values. Returns false when the record was already completed (or
    /// gone), which concurrent matchers treat as success.
    pub async fn complete_call_log(
        &self,
        id: &str,
        asterisk_unique_id: &str,
        duration_seconds: i64,
        disposition: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE call_logs SET status = 'completed', asterisk_unique_id = ?, \
             duration_seconds = ?, disposition = ?, updated_at = ? \
             WHERE id = ? AND status = 'awaiting_cdr'",
        )
        .bind(asterisk_unique_id)
        .bind(duration_seconds)
        .bind(disposition)
        .bind(Utc::now())
        .bind(id)
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fetch one call log by id.
    pub async fn get_call_log(&self, id: &str) -> Result<Option<CallLogRecord>> {
        let row = sqlx::query_as::<_, CallLogRecord>(&format!(
            "{} WHERE id = ?",
            SELECT_CALL_LOG
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }
}

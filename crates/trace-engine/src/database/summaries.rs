//! Call summary persistence
//!
//! The aggregation scheduler is the only writer of `call_summaries`. Inserts
//! go through a bulk existence check first (`existing_summary_call_ids`), so
//! the primary-key constraint is a backstop rather than the idempotency
//! mechanism; re-running a batch must not error its way out.

use chrono::{DateTime, Utc};
use sqlx::QueryBuilder;
use sqlx::Row;
use std::collections::HashSet;
use tracing::debug;

use super::DatabaseManager;
use crate::error::Result;
use crate::trace::types::{CallStatus, CallSummary, HangupBy};

#[derive(sqlx::FromRow, Debug)]
struct SummaryRow {
    call_id: String,
    cdr_sequence_id: Option<i64>,
    started_at: DateTime<Utc>,
    ended_at: DateTime<Utc>,
    answered_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    caller: String,
    destination: Option<String>,
    status: String,
    answered: bool,
    queue_entered: bool,
    queue_name: Option<String>,
    queue_wait_seconds: Option<i64>,
    agent: Option<String>,
    hangup_by: Option<String>,
    ignored_agents: String,
    was_transferred: bool,
    transfer_target: Option<String>,
}

impl From<SummaryRow> for CallSummary {
    fn from(row: SummaryRow) -> Self {
        CallSummary {
            call_id: row.call_id,
            cdr_sequence_id: row.cdr_sequence_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            answered_at: row.answered_at,
            duration_seconds: row.duration_seconds,
            caller: row.caller,
            destination: row.destination,
            status: CallStatus::from_str_lossy(&row.status),
            answered: row.answered,
            queue_entered: row.queue_entered,
            queue_name: row.queue_name,
            queue_wait_seconds: row.queue_wait_seconds,
            agent: row.agent,
            hangup_by: row.hangup_by.as_deref().map(HangupBy::from_str_lossy),
            ignored_agents: serde_json::from_str(&row.ignored_agents).unwrap_or_default(),
            was_transferred: row.was_transferred,
            transfer_target: row.transfer_target,
        }
    }
}

const SELECT_SUMMARY: &str =
    "SELECT call_id, cdr_sequence_id, started_at, ended_at, answered_at, duration_seconds, \
     caller, destination, status, answered, queue_entered, queue_name, queue_wait_seconds, \
     agent, hangup_by, ignored_agents, was_transferred, transfer_target FROM call_summaries";

impl DatabaseManager {
    /// Highest CDR sequence id already represented among persisted
    /// summaries, 0 when none. This is the aggregation watermark — an
    /// optimization, not the correctness mechanism.
    pub async fn max_summarized_cdr_sequence(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(cdr_sequence_id), 0) FROM call_summaries")
            .fetch_one(self.pool())
            .await?;
        Ok(row.get(0))
    }

    /// Which of the given call ids already have a persisted summary.
    pub async fn existing_summary_call_ids(
        &self,
        call_ids: &[String],
    ) -> Result<HashSet<String>> {
        if call_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut qb = QueryBuilder::new("SELECT call_id FROM call_summaries WHERE call_id IN (");
        let mut separated = qb.separated(", ");
        for id in call_ids {
            separated.push_bind(id);
        }
        qb.push(")");
        let rows = qb.build().fetch_all(self.pool()).await?;
        Ok(rows.iter().map(|row| row.get::<String, _>(0)).collect())
    }

    /// Insert one summary row. Callers filter through
    /// [`Self::existing_summary_call_ids`] first.
    pub async fn insert_summary(&self, summary: &CallSummary) -> Result<()> {
        let ignored_agents =
            serde_json::to_string(&summary.ignored_agents).unwrap_or_else(|_| "[]".to_string());
        sqlx::query(
            "INSERT INTO call_summaries \
             (call_id, cdr_sequence_id, started_at, ended_at, answered_at, duration_seconds, \
              caller, destination, status, answered, queue_entered, queue_name, \
              queue_wait_seconds, agent, hangup_by, ignored_agents, was_transferred, \
              transfer_target) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&summary.call_id)
        .bind(summary.cdr_sequence_id)
        .bind(summary.started_at)
        .bind(summary.ended_at)
        .bind(summary.answered_at)
        .bind(summary.duration_seconds)
        .bind(&summary.caller)
        .bind(&summary.destination)
        .bind(summary.status.as_str())
        .bind(summary.answered)
        .bind(summary.queue_entered)
        .bind(&summary.queue_name)
        .bind(summary.queue_wait_seconds)
        .bind(&summary.agent)
        .bind(summary.hangup_by.map(|h| h.as_str()))
        .bind(ignored_agents)
        .bind(summary.was_transferred)
        .bind(&summary.transfer_target)
        .execute(self.pool())
        .await?;
        debug!("Persisted summary for call {}", summary.call_id);
        Ok(())
    }

    /// Fetch one persisted summary.
    pub async fn get_summary(&self, call_id: &str) -> Result<Option<CallSummary>> {
        let row = sqlx::query_as::<_, SummaryRow>(
            &format!("{} WHERE call_id = ?", SELECT_SUMMARY),
        )
        .bind(call_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(CallSummary::from))
    }

    /// Total number of persisted summaries.
    pub async fn count_summaries(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) FROM call_summaries")
            .fetch_one(self.pool())
            .await?;
        Ok(row.get(0))
    }
}

//! # Database Layer
//!
//! Async store access for the trace engine, built on sqlx with SQLite. One
//! [`DatabaseManager`] owns the connection pool and exposes the four
//! read-only event sources (IVR log, queue log, CDR store, application call
//! log) plus the two persisted outputs (`call_summaries`, `call_logs`).
//!
//! All reads used by the trace builder are bulk reads over a call-id set:
//! one `IN (...)` query per source per batch, never one query per call.
//! Dynamic id lists go through `sqlx::QueryBuilder` because the id set size
//! is only known at runtime.
//!
//! The schema is created idempotently at connect time, so `sqlite::memory:`
//! works out of the box for tests.

mod call_logs;
mod summaries;

pub use call_logs::CallLogStatus;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Row, SqlitePool};
use tracing::{debug, info};

use crate::error::Result;

/// Async database manager shared by the trace builder and both schedulers
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

/// IVR event log row
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct IvrEvent {
    pub id: i64,
    pub call_id: String,
    /// Raw encoding as written by the IVR; normalized lazily by the merge
    pub event_time: Option<String>,
    pub kind: String,
    pub node_id: Option<String>,
    pub node_name: Option<String>,
    pub digit: Option<String>,
    pub meta: Option<String>,
}

/// Queue event log row (Asterisk `queue_log` shape)
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct QueueEvent {
    pub id: i64,
    /// `"<unix-seconds>.<fractional>"` as the queue system writes it
    pub sequence_time: String,
    pub call_id: Option<String>,
    pub queue_name: String,
    pub agent: Option<String>,
    pub kind: String,
    pub data1: Option<String>,
    pub data2: Option<String>,
    pub data3: Option<String>,
    pub data4: Option<String>,
    pub data5: Option<String>,
}

/// Call-detail record, written by the external telephony process.
/// Append-only and immutable once observed.
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CdrRecord {
    /// Monotonic row id, the aggregation watermark key
    pub sequence_id: i64,
    /// Telephony-assigned unique id; this is the call identifier
    pub unique_id: String,
    pub call_time: String,
    pub duration_seconds: i64,
    pub disposition: String,
    pub source_number: Option<String>,
    pub dest_number: Option<String>,
    pub dest_channel: Option<String>,
    pub caller_id_text: Option<String>,
    /// Free-text field, used as a reconciliation correlation key
    pub userfield: Option<String>,
}

/// Insert shape for CDR rows (tests and ingest plumbing)
#[derive(Debug, Clone, Default)]
pub struct CdrInsert {
    pub unique_id: String,
    pub call_time: String,
    pub duration_seconds: i64,
    pub disposition: String,
    pub source_number: Option<String>,
    pub dest_number: Option<String>,
    pub dest_channel: Option<String>,
    pub caller_id_text: Option<String>,
    pub userfield: Option<String>,
}

/// Application-originated call log row
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct CallLogRecord {
    pub id: String,
    pub client_call_id: Option<String>,
    pub sip_call_id: Option<String>,
    pub call_id: Option<String>,
    pub status: String,
    pub asterisk_unique_id: Option<String>,
    pub duration_seconds: Option<i64>,
    pub disposition: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS ivr_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        call_id TEXT NOT NULL,
        event_time TEXT,
        kind TEXT NOT NULL,
        node_id TEXT,
        node_name TEXT,
        digit TEXT,
        meta TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_ivr_events_call_id ON ivr_events (call_id)",
    "CREATE TABLE IF NOT EXISTS queue_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        sequence_time TEXT NOT NULL,
        call_id TEXT,
        queue_name TEXT NOT NULL,
        agent TEXT,
        kind TEXT NOT NULL,
        data1 TEXT,
        data2 TEXT,
        data3 TEXT,
        data4 TEXT,
        data5 TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_queue_log_call_id ON queue_log (call_id)",
    "CREATE TABLE IF NOT EXISTS cdr (
        sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
        unique_id TEXT NOT NULL,
        call_time TEXT NOT NULL,
        duration_seconds INTEGER NOT NULL DEFAULT 0,
        disposition TEXT NOT NULL DEFAULT '',
        source_number TEXT,
        dest_number TEXT,
        dest_channel TEXT,
        caller_id_text TEXT,
        userfield TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_cdr_unique_id ON cdr (unique_id)",
    "CREATE INDEX IF NOT EXISTS idx_cdr_userfield ON cdr (userfield)",
    "CREATE TABLE IF NOT EXISTS call_logs (
        id TEXT PRIMARY KEY,
        client_call_id TEXT,
        sip_call_id TEXT,
        call_id TEXT,
        status TEXT NOT NULL DEFAULT 'awaiting_cdr',
        asterisk_unique_id TEXT,
        duration_seconds INTEGER,
        disposition TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_call_logs_status ON call_logs (status)",
    "CREATE TABLE IF NOT EXISTS call_summaries (
        call_id TEXT PRIMARY KEY,
        cdr_sequence_id INTEGER,
        started_at TEXT NOT NULL,
        ended_at TEXT NOT NULL,
        answered_at TEXT,
        duration_seconds INTEGER,
        caller TEXT NOT NULL DEFAULT '',
        destination TEXT,
        status TEXT NOT NULL,
        answered INTEGER NOT NULL DEFAULT 0,
        queue_entered INTEGER NOT NULL DEFAULT 0,
        queue_name TEXT,
        queue_wait_seconds INTEGER,
        agent TEXT,
        hangup_by TEXT,
        ignored_agents TEXT NOT NULL DEFAULT '[]',
        was_transferred INTEGER NOT NULL DEFAULT 0,
        transfer_target TEXT
    )",
];

impl DatabaseManager {
    /// Connect and create the schema if it does not exist yet.
    ///
    /// An in-memory database is pinned to a single pooled connection:
    /// every new `sqlite::memory:` connection would otherwise get its own
    /// private database.
    pub async fn new(database_url: &str) -> Result<Self> {
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!("📀 Trace engine database ready ({})", database_url);
        Ok(Self { pool })
    }

    /// The underlying pool (advanced usage and tests)
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // === Read-only event sources ===

    /// Bulk-fetch IVR events for a call-id set, in arrival order.
    pub async fn ivr_events_for_calls(&self, call_ids: &[String]) -> Result<Vec<IvrEvent>> {
        if call_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new(
            "SELECT id, call_id, event_time, kind, node_id, node_name, digit, meta \
             FROM ivr_events WHERE call_id IN (",
        );
        push_id_list(&mut qb, call_ids);
        qb.push(") ORDER BY id ASC");
        Ok(qb.build_query_as::<IvrEvent>().fetch_all(&self.pool).await?)
    }

    /// Bulk-fetch queue events for a call-id set, in arrival order.
    pub async fn queue_events_for_calls(&self, call_ids: &[String]) -> Result<Vec<QueueEvent>> {
        if call_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new(
            "SELECT id, sequence_time, call_id, queue_name, agent, kind, \
             data1, data2, data3, data4, data5 \
             FROM queue_log WHERE call_id IN (",
        );
        push_id_list(&mut qb, call_ids);
        qb.push(") ORDER BY id ASC");
        Ok(qb.build_query_as::<QueueEvent>().fetch_all(&self.pool).await?)
    }

    /// Bulk-fetch CDRs for a call-id set.
    pub async fn cdrs_for_calls(&self, call_ids: &[String]) -> Result<Vec<CdrRecord>> {
        if call_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new(
            "SELECT sequence_id, unique_id, call_time, duration_seconds, disposition, \
             source_number, dest_number, dest_channel, caller_id_text, userfield \
             FROM cdr WHERE unique_id IN (",
        );
        push_id_list(&mut qb, call_ids);
        qb.push(") ORDER BY sequence_id ASC");
        Ok(qb.build_query_as::<CdrRecord>().fetch_all(&self.pool).await?)
    }

    /// CDRs strictly after the watermark, ascending, at most `limit` rows.
    pub async fn cdrs_after(&self, watermark: i64, limit: i64) -> Result<Vec<CdrRecord>> {
        let rows = sqlx::query_as::<_, CdrRecord>(
            "SELECT sequence_id, unique_id, call_time, duration_seconds, disposition, \
             source_number, dest_number, dest_channel, caller_id_text, userfield \
             FROM cdr WHERE sequence_id > ? ORDER BY sequence_id ASC LIMIT ?",
        )
        .bind(watermark)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// First CDR whose free-text userfield equals the given key.
    pub async fn find_cdr_by_userfield(&self, userfield: &str) -> Result<Option<CdrRecord>> {
        let row = sqlx::query_as::<_, CdrRecord>(
            "SELECT sequence_id, unique_id, call_time, duration_seconds, disposition, \
             source_number, dest_number, dest_channel, caller_id_text, userfield \
             FROM cdr WHERE userfield = ? ORDER BY sequence_id ASC LIMIT 1",
        )
        .bind(userfield)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// First CDR with the given telephony-assigned unique id.
    pub async fn find_cdr_by_unique_id(&self, unique_id: &str) -> Result<Option<CdrRecord>> {
        let row = sqlx::query_as::<_, CdrRecord>(
            "SELECT sequence_id, unique_id, call_time, duration_seconds, disposition, \
             source_number, dest_number, dest_channel, caller_id_text, userfield \
             FROM cdr WHERE unique_id = ? ORDER BY sequence_id ASC LIMIT 1",
        )
        .bind(unique_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Bulk-fetch application call logs for a call-id set.
    pub async fn call_logs_for_calls(&self, call_ids: &[String]) -> Result<Vec<CallLogRecord>> {
        if call_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::new(
            "SELECT id, client_call_id, sip_call_id, call_id, status, asterisk_unique_id, \
             duration_seconds, disposition, created_at, updated_at \
             FROM call_logs WHERE call_id IN (",
        );
        push_id_list(&mut qb, call_ids);
        qb.push(") ORDER BY created_at ASC");
        Ok(qb
            .build_query_as::<CallLogRecord>()
            .fetch_all(&self.pool)
            .await?)
    }

    // === Ingest helpers (source writers and tests) ===

    /// Record an IVR event.
    pub async fn record_ivr_event(
        &self,
        call_id: &str,
        event_time: &str,
        kind: &str,
        node_name: Option<&str>,
        digit: Option<&str>,
        meta: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO ivr_events (call_id, event_time, kind, node_name, digit, meta) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(call_id)
        .bind(event_time)
        .bind(kind)
        .bind(node_name)
        .bind(digit)
        .bind(meta)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a queue event. `data` fills data1..data5 positionally.
    pub async fn record_queue_event(
        &self,
        sequence_time: &str,
        call_id: Option<&str>,
        queue_name: &str,
        agent: Option<&str>,
        kind: &str,
        data: &[&str],
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_log \
             (sequence_time, call_id, queue_name, agent, kind, data1, data2, data3, data4, data5) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(sequence_time)
        .bind(call_id)
        .bind(queue_name)
        .bind(agent)
        .bind(kind)
        .bind(data.first().copied())
        .bind(data.get(1).copied())
        .bind(data.get(2).copied())
        .bind(data.get(3).copied())
        .bind(data.get(4).copied())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a CDR row, returning its sequence id.
    pub async fn record_cdr(&self, cdr: &CdrInsert) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO cdr \
             (unique_id, call_time, duration_seconds, disposition, source_number, \
              dest_number, dest_channel, caller_id_text, userfield) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING sequence_id",
        )
        .bind(&cdr.unique_id)
        .bind(&cdr.call_time)
        .bind(cdr.duration_seconds)
        .bind(&cdr.disposition)
        .bind(&cdr.source_number)
        .bind(&cdr.dest_number)
        .bind(&cdr.dest_channel)
        .bind(&cdr.caller_id_text)
        .bind(&cdr.userfield)
        .fetch_one(&self.pool)
        .await?;
        let sequence_id: i64 = row.get(0);
        debug!("Recorded CDR {} for call {}", sequence_id, cdr.unique_id);
        Ok(sequence_id)
    }

    /// Create an application call log entry in the given state.
    pub async fn create_call_log(
        &self,
        client_call_id: Option<&str>,
        sip_call_id: Option<&str>,
        call_id: Option<&str>,
        status: CallLogStatus,
    ) -> Result<CallLogRecord> {
        let now = Utc::now();
        let record = CallLogRecord {
            id: uuid::Uuid::new_v4().to_string(),
            client_call_id: client_call_id.map(str::to_string),
            sip_call_id: sip_call_id.map(str::to_string),
            call_id: call_id.map(str::to_string),
            status: status.as_str().to_string(),
            asterisk_unique_id: None,
            duration_seconds: None,
            disposition: None,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO call_logs \
             (id, client_call_id, sip_call_id, call_id, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.client_call_id)
        .bind(&record.sip_call_id)
        .bind(&record.call_id)
        .bind(&record.status)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }
}

/// Push a bound id list into an `IN (...)` clause.
fn push_id_list<'a>(qb: &mut QueryBuilder<'a, sqlx::Sqlite>, ids: &'a [String]) {
    let mut separated = qb.separated(", ");
    for id in ids {
        separated.push_bind(id);
    }
}

//! # Call Trace Builder
//!
//! Reconstructs one chronological timeline per call identifier from the
//! four independently written event sources, then derives a summary from
//! it:
//!
//! ```text
//! ┌───────────┐ ┌───────────┐ ┌───────────┐ ┌───────────┐
//! │ IVR log   │ │ Queue log │ │ CDR store │ │ App log   │
//! └─────┬─────┘ └─────┬─────┘ └─────┬─────┘ └─────┬─────┘
//!       │ bulk fetch  │ bulk fetch  │ bulk fetch  │ bulk fetch
//!       └──────┬──────┴──────┬──────┴──────┬──────┘
//!              │   group by call id        │
//!              ▼                           ▼
//!        merge + stable sort by normalized timestamp
//!              │
//!              ▼
//!        status inference (see [`inference`])
//!              │
//!              ▼
//!        CallTrace { summary, timeline }
//! ```
//!
//! The builder is a pure read path: it fetches, merges, and derives, and
//! never writes anything back. Every requested id yields a trace, even one
//! with no corroborating events at all (those get safe defaults:
//! `status = Unknown`, `answered = false`, `queue_entered = false`) —
//! direct calls that never touched the IVR or a queue are normal, not an
//! error.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use callscope_trace_engine::database::DatabaseManager;
//! use callscope_trace_engine::trace::TraceBuilder;
//!
//! # async fn example() -> callscope_trace_engine::error::Result<()> {
//! let db = DatabaseManager::new("sqlite::memory:").await?;
//! let builder = TraceBuilder::new(db);
//!
//! let traces = builder
//!     .build_traces(&["1709285400.17".to_string()], None)
//!     .await?;
//! for trace in traces {
//!     println!(
//!         "call {} -> {} events, status {:?}",
//!         trace.call_id,
//!         trace.timeline.len(),
//!         trace.summary.status
//!     );
//! }
//! # Ok(())
//! # }
//! ```

pub mod inference;
pub mod types;

pub use types::{CallEvent, CallStatus, CallSummary, CallTrace, EventSource, HangupBy};

use chrono::{Duration, Utc};
use std::collections::HashMap;
use tracing::debug;

use crate::database::{CallLogRecord, CdrRecord, DatabaseManager, IvrEvent, QueueEvent};
use crate::error::Result;
use crate::time::normalize_timestamp;

/// Builds merged call traces from the four event sources
#[derive(Clone)]
pub struct TraceBuilder {
    db: DatabaseManager,
}

impl TraceBuilder {
    pub fn new(db: DatabaseManager) -> Self {
        Self { db }
    }

    /// Build one trace per requested call id, in request order.
    ///
    /// All four sources are fetched in one bulk query each for the whole id
    /// set, never per id. `preloaded_cdrs` lets the aggregation scheduler
    /// hand over CDRs it has already fetched so they are not read twice.
    pub async fn build_traces(
        &self,
        call_ids: &[String],
        preloaded_cdrs: Option<HashMap<String, CdrRecord>>,
    ) -> Result<Vec<CallTrace>> {
        if call_ids.is_empty() {
            return Ok(Vec::new());
        }

        let cdrs_by_id = match preloaded_cdrs {
            Some(cdrs) => cdrs,
            None => {
                let mut map = HashMap::new();
                for cdr in self.db.cdrs_for_calls(call_ids).await? {
                    // Keep the earliest CDR when duplicates exist.
                    map.entry(cdr.unique_id.clone()).or_insert(cdr);
                }
                map
            }
        };

        let ivr_by_id = group_by(self.db.ivr_events_for_calls(call_ids).await?, |e: &IvrEvent| {
            Some(e.call_id.clone())
        });
        let queue_by_id =
            group_by(self.db.queue_events_for_calls(call_ids).await?, |e: &QueueEvent| {
                e.call_id.clone()
            });
        let logs_by_id =
            group_by(self.db.call_logs_for_calls(call_ids).await?, |e: &CallLogRecord| {
                e.call_id.clone()
            });

        debug!(
            "Building {} traces ({} CDRs, {} IVR groups, {} queue groups)",
            call_ids.len(),
            cdrs_by_id.len(),
            ivr_by_id.len(),
            queue_by_id.len()
        );

        let empty_ivr: Vec<IvrEvent> = Vec::new();
        let empty_queue: Vec<QueueEvent> = Vec::new();
        let empty_logs: Vec<CallLogRecord> = Vec::new();

        let mut traces = Vec::with_capacity(call_ids.len());
        for call_id in call_ids {
            let trace = build_one_trace(
                call_id,
                cdrs_by_id.get(call_id),
                ivr_by_id.get(call_id).unwrap_or(&empty_ivr),
                queue_by_id.get(call_id).unwrap_or(&empty_queue),
                logs_by_id.get(call_id).unwrap_or(&empty_logs),
            );
            traces.push(trace);
        }
        Ok(traces)
    }
}

fn group_by<T, F>(items: Vec<T>, key: F) -> HashMap<String, Vec<T>>
where
    F: Fn(&T) -> Option<String>,
{
    let mut grouped: HashMap<String, Vec<T>> = HashMap::new();
    for item in items {
        if let Some(id) = key(&item) {
            grouped.entry(id).or_default().push(item);
        }
    }
    grouped
}

fn build_one_trace(
    call_id: &str,
    cdr: Option<&CdrRecord>,
    ivr_events: &[IvrEvent],
    queue_events: &[QueueEvent],
    call_logs: &[CallLogRecord],
) -> CallTrace {
    let now = Utc::now();
    let timeline = merge_timeline(cdr, ivr_events, queue_events, call_logs);

    // Exhaustive fallback chain for the call start; never null.
    let started_at = cdr
        .map(|cdr| normalize_timestamp(Some(&cdr.call_time)))
        .or_else(|| {
            ivr_events
                .first()
                .map(|e| normalize_timestamp(e.event_time.as_deref()))
        })
        .or_else(|| call_logs.first().map(|e| e.created_at))
        .or_else(|| {
            queue_events
                .first()
                .map(|e| normalize_timestamp(Some(&e.sequence_time)))
        })
        .or_else(|| timeline.first().map(|e| e.timestamp))
        .unwrap_or(now);

    let ended_at = match cdr {
        Some(cdr) => {
            normalize_timestamp(Some(&cdr.call_time)) + Duration::seconds(cdr.duration_seconds)
        }
        None => timeline.last().map(|e| e.timestamp).unwrap_or(started_at),
    };

    let mut summary = CallSummary::empty(call_id, now);
    summary.started_at = started_at;
    summary.ended_at = ended_at;
    if let Some(cdr) = cdr {
        summary.cdr_sequence_id = Some(cdr.sequence_id);
        summary.duration_seconds = Some(cdr.duration_seconds);
        summary.caller = cdr
            .source_number
            .clone()
            .or_else(|| cdr.caller_id_text.clone())
            .unwrap_or_default();
        summary.destination = cdr.dest_number.clone();
    }

    inference::infer_summary(&mut summary, &timeline, cdr);

    CallTrace {
        call_id: call_id.to_string(),
        summary,
        timeline,
    }
}

/// Merge the per-source sub-sequences into one timeline. Sources are
/// appended IVR, Queue, CDR, AppLog and sorted with a stable sort, so ties
/// on the normalized timestamp keep source arrival order.
fn merge_timeline(
    cdr: Option<&CdrRecord>,
    ivr_events: &[IvrEvent],
    queue_events: &[QueueEvent],
    call_logs: &[CallLogRecord],
) -> Vec<CallEvent> {
    let mut timeline = Vec::new();

    for event in ivr_events {
        let mut details = HashMap::new();
        if let Some(node_id) = &event.node_id {
            details.insert("node_id".to_string(), node_id.clone());
        }
        if let Some(node_name) = &event.node_name {
            details.insert("node_name".to_string(), node_name.clone());
        }
        if let Some(digit) = &event.digit {
            details.insert("digit".to_string(), digit.clone());
        }
        if let Some(meta) = &event.meta {
            details.insert("meta".to_string(), meta.clone());
        }
        timeline.push(CallEvent {
            timestamp: normalize_timestamp(event.event_time.as_deref()),
            source: EventSource::Ivr,
            kind: event.kind.clone(),
            details,
        });
    }

    for event in queue_events {
        timeline.push(CallEvent {
            timestamp: normalize_timestamp(Some(&event.sequence_time)),
            source: EventSource::Queue,
            kind: event.kind.clone(),
            details: inference::queue_event_details(
                &event.queue_name,
                event.agent.as_deref(),
                [
                    event.data1.as_deref(),
                    event.data2.as_deref(),
                    event.data3.as_deref(),
                    event.data4.as_deref(),
                    event.data5.as_deref(),
                ],
            ),
        });
    }

    if let Some(cdr) = cdr {
        let mut details = HashMap::new();
        details.insert("disposition".to_string(), cdr.disposition.clone());
        details.insert("duration".to_string(), cdr.duration_seconds.to_string());
        if let Some(source) = &cdr.source_number {
            details.insert("source".to_string(), source.clone());
        }
        if let Some(dest) = &cdr.dest_number {
            details.insert("destination".to_string(), dest.clone());
        }
        if let Some(channel) = &cdr.dest_channel {
            details.insert("dest_channel".to_string(), channel.clone());
        }
        if let Some(userfield) = &cdr.userfield {
            details.insert("userfield".to_string(), userfield.clone());
        }
        timeline.push(CallEvent {
            timestamp: normalize_timestamp(Some(&cdr.call_time)),
            source: EventSource::Cdr,
            kind: "CDR".to_string(),
            details,
        });
    }

    for record in call_logs {
        let mut details = HashMap::new();
        if let Some(client_call_id) = &record.client_call_id {
            details.insert("client_call_id".to_string(), client_call_id.clone());
        }
        if let Some(sip_call_id) = &record.sip_call_id {
            details.insert("sip_call_id".to_string(), sip_call_id.clone());
        }
        timeline.push(CallEvent {
            timestamp: record.created_at,
            source: EventSource::AppLog,
            kind: record.status.clone(),
            details,
        });
    }

    timeline.sort_by_key(|event| event.timestamp);
    timeline
}

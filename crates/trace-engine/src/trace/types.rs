//! Shared type definitions for call traces
//!
//! Everything in this module is ephemeral: traces are rebuilt from the event
//! stores on every request and never mutated after construction. The only
//! type that also exists in persisted form is [`CallSummary`], which the
//! aggregation scheduler writes once per call identifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Which source collection an event came from.
///
/// The merge appends sources in the declaration order below before its stable
/// sort, so events with equal timestamps keep this order in the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    Ivr,
    Queue,
    Cdr,
    AppLog,
}

/// One merged timeline entry for a call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEvent {
    /// Normalized instant, the ordering key
    pub timestamp: DateTime<Utc>,
    /// Source collection this event was read from
    pub source: EventSource,
    /// Source-specific event kind (`ENTERQUEUE`, `CONNECT`, `CDR`, ...)
    pub kind: String,
    /// Source-specific detail fields (queue name, agent, data1..data5, ...)
    pub details: HashMap<String, String>,
}

impl CallEvent {
    /// Convenience detail lookup
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.details.get(key).map(|s| s.as_str())
    }
}

/// Final outcome of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallStatus {
    Answered,
    NoAnswer,
    Abandon,
    Busy,
    Failed,
    Unknown,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Answered => "ANSWERED",
            CallStatus::NoAnswer => "NO_ANSWER",
            CallStatus::Abandon => "ABANDON",
            CallStatus::Busy => "BUSY",
            CallStatus::Failed => "FAILED",
            CallStatus::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "ANSWERED" => CallStatus::Answered,
            "NO_ANSWER" => CallStatus::NoAnswer,
            "ABANDON" => CallStatus::Abandon,
            "BUSY" => CallStatus::Busy,
            "FAILED" => CallStatus::Failed,
            _ => CallStatus::Unknown,
        }
    }

    /// Map an Asterisk-style CDR disposition string
    pub fn from_disposition(disposition: &str) -> Self {
        match disposition.trim() {
            "ANSWERED" => CallStatus::Answered,
            "NO ANSWER" => CallStatus::NoAnswer,
            "BUSY" => CallStatus::Busy,
            "FAILED" => CallStatus::Failed,
            _ => CallStatus::Unknown,
        }
    }
}

/// Inferred party responsible for ending the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HangupBy {
    Caller,
    Agent,
    /// Caller pressed an exit key while waiting in queue
    CallerKey,
    Timeout,
    System,
    Unknown,
}

impl HangupBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            HangupBy::Caller => "caller",
            HangupBy::Agent => "agent",
            HangupBy::CallerKey => "caller_key",
            HangupBy::Timeout => "timeout",
            HangupBy::System => "system",
            HangupBy::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(raw: &str) -> Self {
        match raw {
            "caller" => HangupBy::Caller,
            "agent" => HangupBy::Agent,
            "caller_key" => HangupBy::CallerKey,
            "timeout" => HangupBy::Timeout,
            "system" => HangupBy::System,
            _ => HangupBy::Unknown,
        }
    }
}

/// Derived summary for one call identifier.
///
/// Persisted exactly once per `call_id` by the aggregation scheduler and
/// never updated afterward: the originating CDR is immutable once observed,
/// so the summary derived from it is too.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    /// Row id of the originating CDR, when one exists
    pub cdr_sequence_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub caller: String,
    pub destination: Option<String>,
    pub status: CallStatus,
    pub answered: bool,
    pub queue_entered: bool,
    pub queue_name: Option<String>,
    pub queue_wait_seconds: Option<i64>,
    pub agent: Option<String>,
    pub hangup_by: Option<HangupBy>,
    /// Agents who were rung but did not pick up, in ring order,
    /// duplicates preserved (repeated ring attempts)
    pub ignored_agents: Vec<String>,
    pub was_transferred: bool,
    pub transfer_target: Option<String>,
}

impl CallSummary {
    /// A summary with safe defaults, used for calls with no corroborating
    /// events at all.
    pub fn empty(call_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            call_id: call_id.to_string(),
            cdr_sequence_id: None,
            started_at: now,
            ended_at: now,
            answered_at: None,
            duration_seconds: None,
            caller: String::new(),
            destination: None,
            status: CallStatus::Unknown,
            answered: false,
            queue_entered: false,
            queue_name: None,
            queue_wait_seconds: None,
            agent: None,
            hangup_by: None,
            ignored_agents: Vec::new(),
            was_transferred: false,
            transfer_target: None,
        }
    }
}

/// Merged timeline plus derived summary for one call identifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallTrace {
    pub call_id: String,
    pub summary: CallSummary,
    /// Chronological, non-decreasing in timestamp
    pub timeline: Vec<CallEvent>,
}

//! Convenient re-exports for common usage

pub use crate::aggregation::{AggregationOutcome, AggregationScheduler};
pub use crate::config::{AggregationConfig, DatabaseConfig, ReconcileConfig, TraceEngineConfig};
pub use crate::database::{
    CallLogRecord, CallLogStatus, CdrInsert, CdrRecord, DatabaseManager, IvrEvent, QueueEvent,
};
pub use crate::error::{Result, TraceEngineError};
pub use crate::reconcile::{ReconcileOutcome, ReconciliationEngine};
pub use crate::server::{CallScopeServer, CallScopeServerBuilder};
pub use crate::time::normalize_timestamp;
pub use crate::trace::{
    CallEvent, CallStatus, CallSummary, CallTrace, EventSource, HangupBy, TraceBuilder,
};

//! # CallScope Trace Engine
//!
//! Call-lifecycle reconstruction and aggregation for Asterisk-style
//! telephony deployments. Four independently written event sources — the
//! IVR event log, the queue event log, the call-detail-record store, and
//! the application call log — are merged per call identifier into a single
//! ordered timeline with a derived summary: who answered, how long the
//! caller waited, who hung up, whether the call was transferred, which
//! agents were skipped.
//!
//! ## Components
//!
//! - [`time`] — normalizes the sources' heterogeneous timestamp encodings
//!   into one comparable instant type.
//! - [`trace`] — the trace builder: bulk fetch, merge, and rule-based
//!   status inference producing [`trace::CallTrace`] values.
//! - [`aggregation`] — a recurring job that persists a
//!   [`trace::CallSummary`] exactly once per freshly completed call.
//! - [`reconcile`] — a recurring job (plus an event-driven fast path) that
//!   links application call-log entries to their CDR once the external CDR
//!   writer catches up.
//! - [`server`] — lifecycle management: timers, startup, graceful stop.
//! - [`database`] — the sqlx/SQLite store layer shared by everything above.
//!
//! The aggregation and reconciliation jobs run on independent timers and do
//! not depend on each other. All engine state besides the two persisted
//! outputs (`call_summaries`, `call_logs`) is ephemeral: traces are rebuilt
//! from the stores on every request.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use callscope_trace_engine::prelude::*;
//!
//! # async fn example() -> callscope_trace_engine::error::Result<()> {
//! let mut server = CallScopeServerBuilder::new()
//!     .with_config(TraceEngineConfig::default())
//!     .with_in_memory_database()
//!     .build()
//!     .await?;
//! server.start().await?;
//!
//! let traces = server
//!     .trace_builder()
//!     .build_traces(&["1709285400.17".to_string()], None)
//!     .await?;
//! println!("built {} traces", traces.len());
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod aggregation;
pub mod config;
pub mod database;
pub mod error;
pub mod prelude;
pub mod reconcile;
pub mod server;
pub mod time;
pub mod trace;

pub use config::TraceEngineConfig;
pub use error::{Result, TraceEngineError};
pub use server::{CallScopeServer, CallScopeServerBuilder};
pub use trace::{CallStatus, CallSummary, CallTrace, HangupBy, TraceBuilder};

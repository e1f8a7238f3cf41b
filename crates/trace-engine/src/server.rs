//! # Trace Engine Server
//!
//! High-level lifecycle management for the trace engine: owns the database,
//! the trace builder and both background jobs, and drives the two
//! independent timers. This is the primary entry point for embedding the
//! engine in a deployment.
//!
//! ## Server Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            CallScopeServer              │
//! ├────────────────────┬────────────────────┤
//! │ AggregationSched.  │ ReconciliationEng. │
//! │   (15s timer)      │ (10s timer + fast  │
//! │                    │        path)       │
//! ├────────────────────┴────────────────────┤
//! │              TraceBuilder               │
//! ├─────────────────────────────────────────┤
//! │         DatabaseManager (sqlx)          │
//! └─────────────────────────────────────────┘
//! ```
//!
//! The two timers never block each other and neither blocks the caller: a
//! pass that fails is logged and simply retried on its next tick. No
//! synchronous caller ever waits on a background pass.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use callscope_trace_engine::config::TraceEngineConfig;
//! use callscope_trace_engine::server::CallScopeServerBuilder;
//!
//! # async fn example() -> callscope_trace_engine::error::Result<()> {
//! let mut server = CallScopeServerBuilder::new()
//!     .with_config(TraceEngineConfig::default())
//!     .with_in_memory_database()
//!     .build()
//!     .await?;
//!
//! server.start().await?;
//!
//! // Manual passes are also fine; both are idempotent.
//! let outcome = server.aggregation().run_aggregation_pass().await?;
//! println!("created {} summaries", outcome.created);
//!
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info};

use crate::aggregation::AggregationScheduler;
use crate::config::TraceEngineConfig;
use crate::database::DatabaseManager;
use crate::error::{Result, TraceEngineError};
use crate::reconcile::ReconciliationEngine;
use crate::trace::TraceBuilder;

/// A complete trace engine server that manages scheduler lifecycles
pub struct CallScopeServer {
    db: DatabaseManager,
    builder: TraceBuilder,
    aggregation: Arc<AggregationScheduler>,
    reconcile: Arc<ReconciliationEngine>,
    config: TraceEngineConfig,

    /// Handle to the aggregation timer task
    aggregation_handle: Option<JoinHandle<()>>,

    /// Handle to the reconciliation timer task
    reconcile_handle: Option<JoinHandle<()>>,
}

impl CallScopeServer {
    /// Create a server from configuration. The database schema is created
    /// on the spot if missing.
    pub async fn new(config: TraceEngineConfig) -> Result<Self> {
        let db = DatabaseManager::new(&config.database.connection_url()).await?;
        let builder = TraceBuilder::new(db.clone());
        let aggregation = Arc::new(AggregationScheduler::new(
            db.clone(),
            builder.clone(),
            config.aggregation.batch_size,
        ));
        let reconcile = Arc::new(ReconciliationEngine::new(
            db.clone(),
            config.reconcile.settle_delay,
        ));

        info!("✅ Trace engine initialized");
        Ok(Self {
            db,
            builder,
            aggregation,
            reconcile,
            config,
            aggregation_handle: None,
            reconcile_handle: None,
        })
    }

    /// Create a server with an in-memory database
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(TraceEngineConfig::default()).await
    }

    /// Start both background timers. The timers are fully independent and
    /// never block each other.
    pub async fn start(&mut self) -> Result<()> {
        let aggregation = self.aggregation.clone();
        let aggregation_interval = self.config.aggregation.interval;
        let handle = tokio::spawn(async move {
            Self::aggregation_loop(aggregation, aggregation_interval).await;
        });
        self.aggregation_handle = Some(handle);
        info!(
            "✅ Started aggregation scheduler (every {:?})",
            self.config.aggregation.interval
        );

        let reconcile = self.reconcile.clone();
        let reconcile_interval = self.config.reconcile.interval;
        let handle = tokio::spawn(async move {
            Self::reconcile_loop(reconcile, reconcile_interval).await;
        });
        self.reconcile_handle = Some(handle);
        info!(
            "✅ Started reconciliation sweep (every {:?})",
            self.config.reconcile.interval
        );

        Ok(())
    }

    /// Stop the background timers gracefully
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping trace engine server...");

        if let Some(handle) = self.aggregation_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
        if let Some(handle) = self.reconcile_handle.take() {
            handle.abort();
            let _ = handle.await;
        }

        info!("✅ Trace engine server stopped");
        Ok(())
    }

    /// The trace builder (pure read path, no side effects)
    pub fn trace_builder(&self) -> &TraceBuilder {
        &self.builder
    }

    /// The aggregation scheduler, for manual passes
    pub fn aggregation(&self) -> &Arc<AggregationScheduler> {
        &self.aggregation
    }

    /// The reconciliation engine, for manual passes
    pub fn reconciliation(&self) -> &Arc<ReconciliationEngine> {
        &self.reconcile
    }

    /// The database manager (source ingest and advanced usage)
    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    /// The active configuration
    pub fn config(&self) -> &TraceEngineConfig {
        &self.config
    }

    /// Feed a channel-destroyed notification into the reconciliation fast
    /// path. Runs concurrently with the polling sweep; returns immediately.
    pub fn notify_channel_destroyed(
        &self,
        client_call_id: Option<String>,
        sip_call_id: Option<String>,
    ) {
        let reconcile = self.reconcile.clone();
        tokio::spawn(async move {
            if let Err(e) = reconcile
                .on_channel_destroyed(client_call_id.as_deref(), sip_call_id.as_deref())
                .await
            {
                error!("Fast-path reconciliation error: {}", e);
            }
        });
    }

    /// Internal aggregation timer loop
    async fn aggregation_loop(
        scheduler: Arc<AggregationScheduler>,
        period: std::time::Duration,
    ) {
        info!("🔄 Starting aggregation loop");
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            // Whole-pass failures are logged here; the next tick retries.
            if let Err(e) = scheduler.run_aggregation_pass().await {
                error!("Aggregation pass failed: {}", e);
            }
        }
    }

    /// Internal reconciliation timer loop
    async fn reconcile_loop(engine: Arc<ReconciliationEngine>, period: std::time::Duration) {
        info!("🔄 Starting reconciliation loop");
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            if let Err(e) = engine.run_reconciliation_pass().await {
                error!("Reconciliation pass failed: {}", e);
            }
        }
    }
}

/// Builder for [`CallScopeServer`] with a fluent API
pub struct CallScopeServerBuilder {
    config: Option<TraceEngineConfig>,
    database_path: Option<String>,
}

impl CallScopeServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            database_path: None,
        }
    }

    /// Set the configuration
    pub fn with_config(mut self, config: TraceEngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the database path
    pub fn with_database_path(mut self, path: String) -> Self {
        self.database_path = Some(path);
        self
    }

    /// Use an in-memory database
    pub fn with_in_memory_database(mut self) -> Self {
        self.database_path = None;
        self
    }

    /// Build the server
    pub async fn build(self) -> Result<CallScopeServer> {
        let mut config = self.config.ok_or_else(|| {
            TraceEngineError::Configuration("Configuration not provided".to_string())
        })?;
        if let Some(path) = self.database_path {
            config.database.database_path = Some(path);
        }
        CallScopeServer::new(config).await
    }
}

impl Default for CallScopeServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

//! # Trace Engine Configuration
//!
//! Typed configuration for the trace engine and its background schedulers.
//! All sections have sensible defaults so an in-memory engine can be built
//! with `TraceEngineConfig::default()`, which is what the tests do.
//!
//! ## Examples
//!
//! ```rust
//! use callscope_trace_engine::config::TraceEngineConfig;
//! use std::time::Duration;
//!
//! let mut config = TraceEngineConfig::default();
//! config.aggregation.interval = Duration::from_secs(30);
//! config.aggregation.batch_size = 250;
//!
//! assert_eq!(config.reconcile.interval, Duration::from_secs(10));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for the trace engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceEngineConfig {
    /// Database settings
    pub database: DatabaseConfig,

    /// Aggregation scheduler settings
    pub aggregation: AggregationConfig,

    /// Reconciliation engine settings
    pub reconcile: ReconcileConfig,
}

/// Database configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file. `None` selects an in-memory
    /// database, which is what tests and examples use.
    pub database_path: Option<String>,
}

/// Aggregation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// How often the aggregation pass fires
    pub interval: Duration,

    /// Maximum number of CDR rows consumed per pass
    pub batch_size: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }
}

/// Reconciliation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// How often the polling sweep fires
    pub interval: Duration,

    /// How long the event-driven fast path waits before matching, giving
    /// the external CDR writer time to persist its row
    pub settle_delay: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            settle_delay: Duration::from_secs(2),
        }
    }
}

impl DatabaseConfig {
    /// The sqlx connection URL for this configuration
    pub fn connection_url(&self) -> String {
        match &self.database_path {
            Some(path) => format!("sqlite:{}?mode=rwc", path),
            None => "sqlite::memory:".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment_intervals() {
        let config = TraceEngineConfig::default();
        assert_eq!(config.aggregation.interval, Duration::from_secs(15));
        assert_eq!(config.aggregation.batch_size, 100);
        assert_eq!(config.reconcile.interval, Duration::from_secs(10));
        assert_eq!(config.reconcile.settle_delay, Duration::from_secs(2));
    }

    #[test]
    fn in_memory_url_when_no_path() {
        let config = DatabaseConfig::default();
        assert_eq!(config.connection_url(), "sqlite::memory:");

        let on_disk = DatabaseConfig {
            database_path: Some("/var/lib/callscope/traces.db".to_string()),
        };
        assert_eq!(
            on_disk.connection_url(),
            "sqlite:/var/lib/callscope/traces.db?mode=rwc"
        );
    }
}

//! Stats runtime configuration from environment variables

use std::env;
use std::time::Duration;

/// Loaded from environment variables with defaults; unparseable or zero values
/// fall back to the default.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Directory holding the `*.sql` schema files
    pub schema_dir: String,

    /// Event channel buffer size
    pub channel_buffer: usize,

    /// Elapsed-time flush trigger in milliseconds
    pub refresh_interval_ms: u64,

    /// Periodic flush-check interval in milliseconds
    pub tick_interval_ms: u64,
}

/// Non-zero numeric setting; zero would panic `mpsc::channel` and `interval`
fn parse_positive_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + PartialEq + Default,
{
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|v: &T| *v != T::default())
        .unwrap_or(default)
}

impl StatsConfig {
    /// Environment variables:
    /// - `STATFLOW_DB_PATH` (default: statflow.db)
    /// - `STATFLOW_SCHEMA_DIR` (default: sql)
    /// - `STATS_CHANNEL_BUFFER` (default: 10000)
    /// - `STATS_REFRESH_INTERVAL_MS` (default: 60000)
    /// - `STATS_TICK_INTERVAL_MS` (default: 5000)
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("STATFLOW_DB_PATH").unwrap_or_else(|_| "statflow.db".to_string()),
            schema_dir: env::var("STATFLOW_SCHEMA_DIR").unwrap_or_else(|_| "sql".to_string()),
            channel_buffer: parse_positive_env("STATS_CHANNEL_BUFFER", 10_000),
            refresh_interval_ms: parse_positive_env("STATS_REFRESH_INTERVAL_MS", 60_000),
            tick_interval_ms: parse_positive_env("STATS_TICK_INTERVAL_MS", 5_000),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

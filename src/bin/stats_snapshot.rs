//! Print the statistics snapshot for a date as JSON
//!
//! Usage:
//!   cargo run --bin stats_snapshot [YYYY-MM-DD]
//!
//! Defaults to today (local time). Reads the database at `STATFLOW_DB_PATH`.

use chrono::NaiveDate;
use dotenv::dotenv;
use log::info;
use rusqlite::Connection;
use statflow::stats::{run_schema_migrations, SqliteStatsStore, StatsConfig, StatsEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let config = StatsConfig::from_env();
    let date = match std::env::args().nth(1) {
        Some(arg) => NaiveDate::parse_from_str(&arg, "%Y-%m-%d")
            .map_err(|e| format!("invalid date '{}': {}", arg, e))?,
        None => chrono::Local::now().date_naive(),
    };

    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);

    let store = Arc::new(SqliteStatsStore::new(&config.db_path)?);
    let engine = StatsEngine::new(store, config.refresh_interval());
    info!("📈 Building snapshot for {} from {}", date, config.db_path);

    let snapshot = engine.snapshot(date, false).await?;
    println!("{}", serde_json::to_string_pretty(snapshot.as_ref())?);
    Ok(())
}

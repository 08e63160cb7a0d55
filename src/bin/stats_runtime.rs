//! Stats Runtime
//!
//! Reads host events as JSON lines from stdin and feeds them to the stats
//! engine. Ctrl-C or end of input closes the event channel, which triggers the
//! final forced flush.
//!
//! Usage:
//!   host-events | cargo run --release --bin stats_runtime
//!
//! Each line is one event, e.g.
//!   {"type":"command_invoked","command":"help"}
//!
//! Environment variables:
//!   STATFLOW_DB_PATH - SQLite database path (default: statflow.db)
//!   STATFLOW_SCHEMA_DIR - Schema directory (default: sql)
//!   STATS_CHANNEL_BUFFER - Channel size (default: 10000)
//!   STATS_REFRESH_INTERVAL_MS - Elapsed flush trigger (default: 60000)
//!   STATS_TICK_INTERVAL_MS - Flush check interval (default: 5000)

use dotenv::dotenv;
use log::{error, info, warn};
use rusqlite::Connection;
use statflow::stats::{
    run_schema_migrations, SqliteStatsStore, StatsConfig, StatsEngine, StatsEvent, StatsStore,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

/// Forward stdin JSON lines into the channel until EOF or the receiver closes
async fn read_events(tx: mpsc::Sender<StatsEvent>) -> std::io::Result<u64> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut forwarded = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<StatsEvent>(line) {
            Ok(event) => {
                if tx.send(event).await.is_err() {
                    warn!("⚠️  Event channel closed, stopping reader");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!("⚠️  Skipping malformed event line: {}", e),
        }
    }

    Ok(forwarded)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Stats Runtime");

    let config = StatsConfig::from_env();
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Channel buffer: {} events", config.channel_buffer);
    info!("   ├─ Refresh interval: {}ms", config.refresh_interval_ms);
    info!("   └─ Tick interval: {}ms", config.tick_interval_ms);

    info!("🔧 Initializing database...");
    let mut conn = Connection::open(&config.db_path)?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    drop(conn);

    let store: Arc<dyn StatsStore> = Arc::new(SqliteStatsStore::new(&config.db_path)?);
    info!("✅ Database initialized");

    let engine = Arc::new(StatsEngine::new(store, config.refresh_interval()));
    let (tx, rx) = mpsc::channel::<StatsEvent>(config.channel_buffer);
    let ingestion = engine.start(rx, config.tick_interval());
    info!("✅ Stats engine started");

    let mut reader = tokio::spawn(read_events(tx));
    info!("🔄 Reading events from stdin, press CTRL+C to shutdown");

    tokio::select! {
        result = &mut reader => match result {
            Ok(Ok(count)) => info!("✅ End of input after {} events", count),
            Ok(Err(e)) => error!("❌ Failed reading stdin: {}", e),
            Err(e) => error!("❌ Reader task failed: {}", e),
        },
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("❌ Failed to listen for CTRL+C: {}", e);
            }
            warn!("⚠️  Received CTRL+C, shutting down...");
            // Dropping the reader drops the last sender
            reader.abort();
        }
    }

    if let Err(e) = ingestion.await {
        error!("❌ Ingestion task failed: {}", e);
    }

    info!("✅ Stats runtime stopped");
    Ok(())
}

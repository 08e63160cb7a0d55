//! # Usage statistics
//!
//! Counts chat-bot activity in memory and periodically flushes it into
//! time-bucketed SQLite tables, then derives read-only daily snapshots from the
//! stored history.
//!
//! ## Architecture
//!
//! 1. Host events (`StatsEvent`) arrive over an mpsc channel
//! 2. Counters accumulate per field (numerical) or per field and key (recorded)
//! 3. A flush fires on hour rollover, after the refresh interval, or when forced
//! 4. Drained counts become `UpsertRequest`s (insert first, merge after)
//! 5. Per-entity activity is merged into day-keyed maps
//! 6. Snapshots average the most recent stored days, cached per date
//!
//! ## Tables
//!
//! - `stats_hourly` → `HourlyField` (numerical, `YYYY-MM-DD HH:00:00`)
//! - `stats_daily` → `DailyField` (recorded JSON maps, `YYYY-MM-DD`)
//! - `stats_longterm` → `LongtermField` (numerical, `YYYY-MM-DD`)
//! - `channel` → entity metadata and activity
//! - `dialogue` → dialogue id to question text
//!
//! Schema lives in `/sql/`.

pub mod accumulator;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod events;
pub mod fields;
pub mod ingestion;
pub mod ledger;
pub mod snapshot;
pub mod source;
pub mod types;
pub mod upsert;

pub use accumulator::{merge_counts, Counts, NumericalAccumulator, RecordedAccumulator};
pub use clock::{BucketKeys, FlushReason, FlushScheduler, REFRESH_INTERVAL};
pub use config::StatsConfig;
pub use db::{run_schema_migrations, SqliteStatsStore, StatsStore, StoreError};
pub use engine::{FlushBatch, StatsEngine};
pub use events::StatsEvent;
pub use fields::{DailyField, HourlyField, LongtermField, StatField};
pub use ingestion::start_stats_ingestion;
pub use ledger::{ActivityLedger, ActivityUpdate};
pub use snapshot::{SnapshotCache, StatisticsSnapshot, RECENT_LENGTH};
pub use source::{EntityInfo, EntitySource, StaticEntitySource};
pub use upsert::{UpsertMode, UpsertRequest};

//! Chat-bot usage statistics: in-memory counters, bucketed SQLite
//! persistence and cached daily snapshots.

pub mod stats;

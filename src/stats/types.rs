//! Row types read back from the statistics store

use super::accumulator::Counts;
use super::fields::{DailyField, HourlyField, LongtermField};
use super::ledger::ActivityMap;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;

static EMPTY_COUNTS: Counts = BTreeMap::new();

/// One `stats_daily` row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DailyRecord {
    /// `YYYY-MM-DD`
    pub date: String,
    pub counts: BTreeMap<DailyField, Counts>,
}

impl DailyRecord {
    /// Counts for `field`, empty if the column was missing or malformed
    pub fn field(&self, field: DailyField) -> &Counts {
        self.counts.get(&field).unwrap_or(&EMPTY_COUNTS)
    }
}

/// One `stats_hourly` row
#[derive(Debug, Clone, PartialEq)]
pub struct HourlyRecord {
    pub time: NaiveDateTime,
    pub values: BTreeMap<HourlyField, i64>,
}

/// One `stats_longterm` row
#[derive(Debug, Clone, PartialEq)]
pub struct LongtermRecord {
    pub date: String,
    pub values: BTreeMap<LongtermField, i64>,
}

impl LongtermRecord {
    pub fn get(&self, field: LongtermField) -> i64 {
        self.values.get(&field).copied().unwrap_or(0)
    }
}

/// Stored entity (chat group/channel) metadata
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelRecord {
    /// `platform:channel_id`
    pub id: String,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub activity: ActivityMap,
}

/// Queued display-name update for a stored entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRename {
    pub id: String,
    pub name: String,
}

/// Dialogue id resolved to its question text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueQuestion {
    pub id: i64,
    pub original: String,
}

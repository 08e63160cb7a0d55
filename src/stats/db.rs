//! Statistics store trait and SQLite implementation
//!
//! Tables (see `/sql/` directory):
//! - `stats_hourly` / `stats_longterm` - numeric counters keyed by bucket
//! - `stats_daily` - JSON `key -> count` maps keyed by bucket
//! - `channel` - entity metadata + day-keyed `activity` JSON map
//! - `dialogue` - read-only, resolves matched dialogue ids to question text
//!
//! Every bucket write is insert-if-absent, additive-merge-if-present. The
//! request's `UpsertMode` picks the fast path; the other path is the fallback
//! when storage disagrees (row already there after a restart, or row removed
//! under us).

use super::accumulator::{merge_counts, Counts};
use super::fields::{DailyField, HourlyField, LongtermField, StatField};
use super::ledger::{merge_activity, ActivityMap, ActivityUpdate};
use super::types::{
    ChannelRecord, ChannelRename, DailyRecord, DialogueQuestion, HourlyRecord, LongtermRecord,
};
use super::upsert::{UpsertMode, UpsertRequest};
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const HOUR_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Serialization(serde_json::Error),
    Io(std::io::Error),
    Schema(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Serialization(e) => write!(f, "Serialization error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Schema(e) => write!(f, "Schema error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence sink and history source for the statistics engine
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Apply bucket upserts, all-or-nothing
    async fn apply_upserts(&self, requests: Vec<UpsertRequest>) -> Result<(), StoreError>;

    /// Merge activity deltas into `channel.activity`, creating missing rows
    async fn merge_activity(&self, updates: Vec<ActivityUpdate>) -> Result<(), StoreError>;

    /// Most recent daily rows strictly before `before`, newest first
    async fn recent_daily(
        &self,
        before: NaiveDate,
        limit: usize,
    ) -> Result<Vec<DailyRecord>, StoreError>;

    /// Most recent hourly rows strictly before `before`, newest first
    async fn recent_hourly(
        &self,
        before: NaiveDateTime,
        limit: usize,
    ) -> Result<Vec<HourlyRecord>, StoreError>;

    /// All longterm rows strictly before `before`, oldest first
    async fn longterm_before(&self, before: NaiveDate) -> Result<Vec<LongtermRecord>, StoreError>;

    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError>;

    async fn rename_channels(&self, renames: Vec<ChannelRename>) -> Result<(), StoreError>;

    async fn dialogue_questions(&self, ids: Vec<i64>) -> Result<Vec<DialogueQuestion>, StoreError>;
}

/// Run schema migrations from SQL files
///
/// Reads all .sql files from `schema_dir` in name order and executes them.
/// Every file must use `IF NOT EXISTS` so reruns are no-ops.
pub fn run_schema_migrations(conn: &mut Connection, schema_dir: &str) -> Result<(), StoreError> {
    let schema_path = Path::new(schema_dir);

    if !schema_path.exists() {
        return Err(StoreError::Schema(format!(
            "Schema directory not found: {}",
            schema_dir
        )));
    }

    conn.pragma_update(None, "journal_mode", "WAL")?;
    log::info!("📊 Enabled WAL mode for SQLite database");

    // Sorted so 00_, 01_, 02_ run in order
    let mut sql_files: Vec<_> = fs::read_dir(schema_path)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();

    sql_files.sort_by_key(|entry| entry.file_name());

    log::info!("🔧 Running schema migrations from: {}", schema_dir);

    for entry in sql_files {
        let path = entry.path();
        let filename = entry.file_name().to_string_lossy().to_string();

        log::info!("   ├─ Executing: {}", filename);
        let sql_content = fs::read_to_string(&path)?;
        conn.execute_batch(&sql_content)?;
        log::info!("   └─ ✅ Success: {}", filename);
    }

    log::info!("✅ All schema migrations completed successfully");
    Ok(())
}

/// SQLite implementation of StatsStore
///
/// Does not create the schema. Run `run_schema_migrations` first.
pub struct SqliteStatsStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStatsStore {
    pub fn new(db_path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(db_path)?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Parse a stored JSON column, falling back to empty on malformed data
fn parse_json_column<T: serde::de::DeserializeOwned + Default>(
    raw: Option<String>,
    context: &str,
) -> T {
    match raw {
        None => T::default(),
        Some(raw) if raw.trim().is_empty() => T::default(),
        Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
            log::warn!("⚠️  Malformed JSON in {}, treating as empty: {}", context, e);
            T::default()
        }),
    }
}

/// Read a counter cell, treating non-integer values as zero
fn integer_cell(
    row: &rusqlite::Row<'_>,
    index: usize,
    table: &str,
    column: &str,
    bucket: &str,
) -> rusqlite::Result<i64> {
    match row.get_ref(index)? {
        ValueRef::Integer(value) => Ok(value),
        ValueRef::Null => Ok(0),
        other => {
            log::warn!(
                "⚠️  Non-integer {:?} value in {}.{} [{}], treating as 0",
                other.data_type(),
                table,
                column,
                bucket
            );
            Ok(0)
        }
    }
}

fn bucket_exists(tx: &Transaction<'_>, table: &str, bucket: &str) -> Result<bool, StoreError> {
    let found = tx
        .query_row(
            &format!("SELECT 1 FROM {} WHERE time = ?1", table),
            [bucket],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn insert_bucket(tx: &Transaction<'_>, req: &UpsertRequest) -> Result<(), StoreError> {
    let mut columns = vec!["time"];
    let mut values = vec![Value::Text(req.bucket.clone())];

    for (column, delta) in &req.numeric {
        columns.push(*column);
        values.push(Value::Integer(*delta));
    }
    for (column, counts) in &req.recorded {
        columns.push(*column);
        values.push(Value::Text(serde_json::to_string(counts)?));
    }

    let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{}", i)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        req.table,
        columns.join(", "),
        placeholders.join(", ")
    );
    tx.execute(&sql, params_from_iter(values))?;
    Ok(())
}

fn merge_bucket(tx: &Transaction<'_>, req: &UpsertRequest) -> Result<(), StoreError> {
    if !req.numeric.is_empty() {
        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for (i, (column, delta)) in req.numeric.iter().enumerate() {
            assignments.push(format!("{col} = COALESCE({col}, 0) + ?{}", i + 1, col = column));
            values.push(Value::Integer(*delta));
        }
        values.push(Value::Text(req.bucket.clone()));

        let sql = format!(
            "UPDATE {} SET {} WHERE time = ?{}",
            req.table,
            assignments.join(", "),
            values.len()
        );
        tx.execute(&sql, params_from_iter(values))?;
    }

    for (column, delta) in &req.recorded {
        let raw: Option<String> = tx.query_row(
            &format!("SELECT {} FROM {} WHERE time = ?1", column, req.table),
            [&req.bucket],
            |row| row.get(0),
        )?;
        let mut stored: Counts =
            parse_json_column(raw, &format!("{}.{} [{}]", req.table, column, req.bucket));
        merge_counts(&mut stored, delta);

        tx.execute(
            &format!("UPDATE {} SET {} = ?1 WHERE time = ?2", req.table, column),
            rusqlite::params![serde_json::to_string(&stored)?, req.bucket],
        )?;
    }

    Ok(())
}

fn apply_upsert(tx: &Transaction<'_>, req: &UpsertRequest) -> Result<(), StoreError> {
    if req.is_empty() {
        return Ok(());
    }

    let exists = bucket_exists(tx, req.table, &req.bucket)?;
    match (req.mode, exists) {
        (UpsertMode::Insert, false) | (UpsertMode::Merge, true) => {}
        (UpsertMode::Insert, true) => {
            log::debug!("↪️  {} [{}] already stored, merging", req.table, req.bucket);
        }
        (UpsertMode::Merge, false) => {
            log::debug!("↪️  {} [{}] missing, inserting", req.table, req.bucket);
        }
    }

    if exists {
        merge_bucket(tx, req)
    } else {
        insert_bucket(tx, req)
    }
}

fn select_columns<F: StatField>() -> String {
    F::ALL
        .iter()
        .map(|f| f.column())
        .collect::<Vec<_>>()
        .join(", ")
}

#[async_trait]
impl StatsStore for SqliteStatsStore {
    async fn apply_upserts(&self, requests: Vec<UpsertRequest>) -> Result<(), StoreError> {
        if requests.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for req in &requests {
            apply_upsert(&tx, req)?;
            log::debug!(
                "✅ {} {} [{}] ({} numeric, {} recorded)",
                req.mode.as_str(),
                req.table,
                req.bucket,
                req.numeric.len(),
                req.recorded.len()
            );
        }
        tx.commit()?;
        Ok(())
    }

    async fn merge_activity(&self, updates: Vec<ActivityUpdate>) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for update in &updates {
            let raw: Option<Option<String>> = tx
                .query_row(
                    "SELECT activity FROM channel WHERE id = ?1",
                    [&update.entity_id],
                    |row| row.get(0),
                )
                .optional()?;

            match raw {
                Some(raw) => {
                    let mut activity: ActivityMap =
                        parse_json_column(raw, &format!("channel.activity [{}]", update.entity_id));
                    merge_activity(&mut activity, update.day, update.delta);
                    tx.execute(
                        "UPDATE channel SET activity = ?1 WHERE id = ?2",
                        rusqlite::params![serde_json::to_string(&activity)?, update.entity_id],
                    )?;
                }
                None => {
                    let mut activity = ActivityMap::new();
                    merge_activity(&mut activity, update.day, update.delta);
                    tx.execute(
                        "INSERT INTO channel (id, activity) VALUES (?1, ?2)",
                        rusqlite::params![update.entity_id, serde_json::to_string(&activity)?],
                    )?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn recent_daily(
        &self,
        before: NaiveDate,
        limit: usize,
    ) -> Result<Vec<DailyRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT time, {} FROM {} WHERE time < ?1 ORDER BY time DESC LIMIT ?2",
            select_columns::<DailyField>(),
            DailyField::TABLE
        ))?;

        let rows = stmt.query_map(
            rusqlite::params![super::clock::date_key(before), limit as i64],
            |row| {
                let date: String = row.get(0)?;
                let mut raw = Vec::with_capacity(DailyField::ALL.len());
                for i in 0..DailyField::ALL.len() {
                    raw.push(row.get::<_, Option<String>>(i + 1)?);
                }
                Ok((date, raw))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (date, raw) = row?;
            let mut counts = BTreeMap::new();
            for (field, raw) in DailyField::ALL.iter().zip(raw) {
                let parsed: Counts = parse_json_column(
                    raw,
                    &format!("{}.{} [{}]", DailyField::TABLE, field.column(), date),
                );
                counts.insert(*field, parsed);
            }
            records.push(DailyRecord { date, counts });
        }
        Ok(records)
    }

    async fn recent_hourly(
        &self,
        before: NaiveDateTime,
        limit: usize,
    ) -> Result<Vec<HourlyRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT time, {} FROM {} WHERE time < ?1 ORDER BY time DESC LIMIT ?2",
            select_columns::<HourlyField>(),
            HourlyField::TABLE
        ))?;

        let rows = stmt.query_map(
            rusqlite::params![before.format(HOUR_FORMAT).to_string(), limit as i64],
            |row| {
                let time: String = row.get(0)?;
                let mut values = BTreeMap::new();
                for (i, field) in HourlyField::ALL.iter().enumerate() {
                    let value =
                        integer_cell(row, i + 1, HourlyField::TABLE, field.column(), &time)?;
                    values.insert(*field, value);
                }
                Ok((time, values))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (time, values) = row?;
            match NaiveDateTime::parse_from_str(&time, HOUR_FORMAT) {
                Ok(time) => records.push(HourlyRecord { time, values }),
                Err(e) => {
                    log::warn!("⚠️  Skipping hourly row with bad time '{}': {}", time, e);
                }
            }
        }
        Ok(records)
    }

    async fn longterm_before(&self, before: NaiveDate) -> Result<Vec<LongtermRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT time, {} FROM {} WHERE time < ?1 ORDER BY time ASC",
            select_columns::<LongtermField>(),
            LongtermField::TABLE
        ))?;

        let rows = stmt.query_map([super::clock::date_key(before)], |row| {
            let date: String = row.get(0)?;
            let mut values = BTreeMap::new();
            for (i, field) in LongtermField::ALL.iter().enumerate() {
                let value = integer_cell(row, i + 1, LongtermField::TABLE, field.column(), &date)?;
                values.insert(*field, value);
            }
            Ok(LongtermRecord { date, values })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT id, name, assignee, activity FROM channel")?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, name, assignee, activity) = row?;
            let activity = parse_json_column(activity, &format!("channel.activity [{}]", id));
            records.push(ChannelRecord {
                id,
                name,
                assignee,
                activity,
            });
        }
        Ok(records)
    }

    async fn rename_channels(&self, renames: Vec<ChannelRename>) -> Result<(), StoreError> {
        if renames.is_empty() {
            return Ok(());
        }

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        for rename in &renames {
            tx.execute(
                "UPDATE channel SET name = ?1 WHERE id = ?2",
                rusqlite::params![rename.name, rename.id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn dialogue_questions(&self, ids: Vec<i64>) -> Result<Vec<DialogueQuestion>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.lock();
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT id, original FROM dialogue WHERE id IN ({})",
            placeholders.join(", ")
        ))?;

        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok(DialogueQuestion {
                id: row.get(0)?,
                original: row.get(1)?,
            })
        })?;

        let mut questions = Vec::new();
        for row in rows {
            questions.push(row?);
        }
        Ok(questions)
    }
}

/// Midnight of `date`, the exclusive upper bound for that date's hourly rows
pub fn start_of_day(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

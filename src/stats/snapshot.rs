//! Daily statistics snapshot
//!
//! Built from already-flushed history plus live entity listings; never reads
//! in-memory accumulators. Cached per calendar date. Concurrent requests for
//! the same date share one in-flight computation.
//!
//! ## Averaging
//!
//! `average` takes at most `RECENT_LENGTH` records (newest first), sums each key
//! and divides by `RECENT_LENGTH`, rounding to one decimal. The divisor is
//! fixed: a key present in only two of the last five days is averaged over
//! five, and missing days count as zero.

use super::accumulator::Counts;
use super::clock::{date_key, day_number};
use super::db::{start_of_day, StatsStore, StoreError};
use super::fields::{DailyField, HourlyField, LongtermField, StatField};
use super::ledger::ActivityMap;
use super::source::EntitySource;
use super::types::{ChannelRecord, ChannelRename, DailyRecord, HourlyRecord};
use chrono::{NaiveDate, Timelike};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Window size for every recent average
pub const RECENT_LENGTH: usize = 5;

/// Upper bound on one live source's listing call
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuestionStat {
    pub name: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GroupStat {
    pub id: String,
    pub platform: String,
    pub name: String,
    pub assignee: Option<String>,
    /// Recent average messages per day
    pub value: f64,
    /// Messages on the most recent recorded day
    pub last: i64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct BotRate {
    pub sent: f64,
    pub received: f64,
}

/// Derived read-only statistics for one date
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatisticsSnapshot {
    pub date: String,
    /// Date → longterm message count
    pub history: BTreeMap<String, i64>,
    /// Command → recent average invocations per day
    pub commands: BTreeMap<String, f64>,
    /// 24 slots, hourly field → recent average for that hour of day
    pub hours: Vec<BTreeMap<&'static str, f64>>,
    pub questions: Vec<QuestionStat>,
    pub groups: Vec<GroupStat>,
    /// Bot id → recent average sent/received per day
    pub bots: BTreeMap<String, BotRate>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Fixed-divisor recent average over `key -> count` maps
pub fn average<'a, K, I>(records: I) -> BTreeMap<K, f64>
where
    K: Ord + Clone + 'a,
    I: IntoIterator<Item = &'a BTreeMap<K, i64>>,
{
    let mut sums: BTreeMap<K, i64> = BTreeMap::new();
    for record in records.into_iter().take(RECENT_LENGTH) {
        for (key, value) in record {
            let sum = sums.entry(key.clone()).or_insert(0);
            *sum = sum.saturating_add(*value);
        }
    }

    sums.into_iter()
        .map(|(key, sum)| (key, round1(sum as f64 / RECENT_LENGTH as f64)))
        .collect()
}

/// Like `average`, but every declared field is present (0.0 when unseen)
pub fn average_fields<'a, F, I>(records: I) -> BTreeMap<&'static str, f64>
where
    F: StatField,
    I: IntoIterator<Item = &'a BTreeMap<F, i64>>,
{
    let averaged = average(records);
    F::ALL
        .iter()
        .map(|field| (field.column(), averaged.get(field).copied().unwrap_or(0.0)))
        .collect()
}

fn daily_average(daily: &[DailyRecord], field: DailyField) -> BTreeMap<String, f64> {
    average(daily.iter().map(|record| record.field(field)))
}

fn hour_slots(hourly: &[HourlyRecord]) -> Vec<BTreeMap<&'static str, f64>> {
    (0..24u32)
        .map(|hour| {
            average_fields::<HourlyField, _>(
                hourly
                    .iter()
                    .filter(|record| record.time.hour() == hour)
                    .map(|record| &record.values),
            )
        })
        .collect()
}

/// Matches produced by hooks or rich-media payloads are not user questions
fn is_internal_question(text: &str) -> bool {
    text.starts_with("hook:") || text.contains("[CQ:")
}

async fn build_questions(
    store: &dyn StatsStore,
    daily: &[DailyRecord],
) -> Result<Vec<QuestionStat>, StoreError> {
    let dialogue_map = daily_average(daily, DailyField::Dialogue);
    let mut rates: HashMap<i64, f64> = HashMap::new();
    for (key, value) in &dialogue_map {
        match key.parse::<i64>() {
            Ok(id) => {
                rates.insert(id, *value);
            }
            Err(_) => log::debug!("Skipping non-numeric dialogue id '{}'", key),
        }
    }

    let mut ids: Vec<i64> = rates.keys().copied().collect();
    ids.sort_unstable();
    let dialogues = store.dialogue_questions(ids).await?;

    let mut by_text: BTreeMap<String, f64> = BTreeMap::new();
    for dialogue in dialogues {
        if is_internal_question(&dialogue.original) {
            continue;
        }
        let rate = rates.get(&dialogue.id).copied().unwrap_or(0.0);
        *by_text.entry(dialogue.original).or_insert(0.0) += rate;
    }

    let mut questions: Vec<QuestionStat> = by_text
        .into_iter()
        .map(|(name, value)| QuestionStat {
            name,
            value: round1(value),
        })
        .collect();
    questions.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.name.cmp(&b.name)));
    Ok(questions)
}

/// Last-known rate from a stored activity map
///
/// Fixed-divisor average over the most recent `RECENT_LENGTH` active days
/// before `before_day`. Used when the recent daily rows carry no traffic for
/// the entity.
pub fn activity_rate(activity: &ActivityMap, before_day: i64) -> f64 {
    let sum: i64 = activity
        .range(..before_day)
        .rev()
        .filter(|(_, count)| **count > 0)
        .take(RECENT_LENGTH)
        .map(|(_, count)| *count)
        .fold(0i64, |acc, count| acc.saturating_add(count));
    round1(sum as f64 / RECENT_LENGTH as f64)
}

async fn build_groups(
    store: &dyn StatsStore,
    sources: &[Arc<dyn EntitySource>],
    daily: &[DailyRecord],
    channels: Vec<ChannelRecord>,
    date: NaiveDate,
) -> Vec<GroupStat> {
    let message_map = daily_average(daily, DailyField::GroupMessages);
    let latest = daily.first().map(|record| record.field(DailyField::GroupMessages));
    let last_of = |id: &str| {
        latest
            .and_then(|counts: &Counts| counts.get(id))
            .copied()
            .unwrap_or(0)
    };
    let today = day_number(date);
    let rate_of = |record: &ChannelRecord| {
        message_map
            .get(&record.id)
            .copied()
            .filter(|v| *v > 0.0)
            .unwrap_or_else(|| activity_rate(&record.activity, today))
    };

    let stored: HashMap<String, ChannelRecord> =
        channels.into_iter().map(|c| (c.id.clone(), c)).collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut renames = Vec::new();
    let mut groups = Vec::new();

    for source in sources {
        let platform = source.platform().to_string();
        let entities = match tokio::time::timeout(SOURCE_TIMEOUT, source.list_entities()).await {
            Ok(Ok(entities)) => entities,
            Ok(Err(e)) => {
                log::warn!("⚠️  Entity source '{}' failed, skipping: {}", platform, e);
                continue;
            }
            Err(_) => {
                log::warn!("⚠️  Entity source '{}' timed out, skipping", platform);
                continue;
            }
        };

        for entity in entities {
            let id = format!("{}:{}", platform, entity.id);
            let Some(record) = stored.get(&id) else {
                continue;
            };
            if !seen.insert(id.clone()) {
                continue;
            }

            if record.name.as_deref() != Some(entity.name.as_str()) {
                renames.push(ChannelRename {
                    id: id.clone(),
                    name: entity.name.clone(),
                });
            }
            groups.push(GroupStat {
                last: last_of(&id),
                value: rate_of(record),
                id,
                platform: platform.clone(),
                name: entity.name,
                assignee: record.assignee.clone(),
            });
        }
    }

    // Entities no live source reported (source down, bot left) keep their stored rate
    for (id, record) in &stored {
        if seen.contains(id) {
            continue;
        }
        let value = rate_of(record);
        if value <= 0.0 {
            continue;
        }
        let platform = id.split(':').next().unwrap_or_default().to_string();
        groups.push(GroupStat {
            id: id.clone(),
            platform,
            name: record.name.clone().unwrap_or_else(|| id.clone()),
            assignee: record.assignee.clone(),
            value,
            last: last_of(id),
        });
    }

    if !renames.is_empty() {
        let count = renames.len();
        match store.rename_channels(renames).await {
            Ok(()) => log::debug!("✏️  Updated {} channel names", count),
            Err(e) => log::warn!("⚠️  Failed to update channel names: {}", e),
        }
    }

    groups.sort_by(|a, b| b.value.total_cmp(&a.value).then_with(|| a.id.cmp(&b.id)));
    groups
}

fn build_bots(daily: &[DailyRecord]) -> BTreeMap<String, BotRate> {
    let mut bots: BTreeMap<String, BotRate> = BTreeMap::new();
    for (id, sent) in daily_average(daily, DailyField::BotSend) {
        bots.entry(id).or_default().sent = sent;
    }
    for (id, received) in daily_average(daily, DailyField::BotReceive) {
        bots.entry(id).or_default().received = received;
    }
    bots
}

/// Compute the snapshot for `date` from storage and live sources
pub async fn build_snapshot(
    store: &dyn StatsStore,
    sources: &[Arc<dyn EntitySource>],
    date: NaiveDate,
) -> Result<StatisticsSnapshot, StoreError> {
    let started = std::time::Instant::now();

    let (daily, hourly, longterm, channels) = tokio::try_join!(
        store.recent_daily(date, RECENT_LENGTH),
        store.recent_hourly(start_of_day(date), RECENT_LENGTH * 24),
        store.longterm_before(date),
        store.channels(),
    )?;

    let history = longterm
        .iter()
        .map(|record| (record.date.clone(), record.get(LongtermField::Message)))
        .collect();
    let commands = daily_average(&daily, DailyField::Command);
    let hours = hour_slots(&hourly);
    let bots = build_bots(&daily);
    let questions = build_questions(store, &daily).await?;
    let groups = build_groups(store, sources, &daily, channels, date).await;

    log::info!(
        "📈 Snapshot for {} built: {} days, {} hours, {} groups, {} questions | {}ms",
        date,
        daily.len(),
        hourly.len(),
        groups.len(),
        questions.len(),
        started.elapsed().as_millis()
    );

    Ok(StatisticsSnapshot {
        date: date_key(date),
        history,
        commands,
        hours,
        questions,
        groups,
        bots,
    })
}

type SnapshotCell = Arc<OnceCell<Arc<StatisticsSnapshot>>>;

/// Per-date snapshot cache with in-flight sharing
///
/// Holds one date at a time. A request for a different date (or a forced
/// refresh) replaces the slot; requests already awaiting the old cell still
/// complete against it.
#[derive(Default)]
pub struct SnapshotCache {
    slot: Mutex<Option<(NaiveDate, SnapshotCell)>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell_for(&self, date: NaiveDate, force: bool) -> SnapshotCell {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some((cached, cell)) if *cached == date && !force => Arc::clone(cell),
            _ => {
                let cell: SnapshotCell = Arc::new(OnceCell::new());
                *slot = Some((date, Arc::clone(&cell)));
                cell
            }
        }
    }

    /// Return the cached snapshot for `date`, running `compute` at most once
    ///
    /// A failed computation leaves the cell empty so the next request retries.
    pub async fn get_or_compute<C, Fut>(
        &self,
        date: NaiveDate,
        force: bool,
        compute: C,
    ) -> Result<Arc<StatisticsSnapshot>, StoreError>
    where
        C: FnOnce() -> Fut,
        Fut: Future<Output = Result<StatisticsSnapshot, StoreError>>,
    {
        let cell = self.cell_for(date, force);
        let snapshot = cell
            .get_or_try_init(|| async { compute().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(snapshot))
    }

    /// Date of the cached (or in-flight) snapshot
    pub fn cached_date(&self) -> Option<NaiveDate> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(date, _)| *date)
    }
}

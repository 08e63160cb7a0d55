//! Statistics engine
//!
//! Owns the in-memory accumulators, the activity ledger and the flush
//! scheduler behind one mutex, plus the snapshot cache and live entity
//! sources. Shared through `Arc`; no process-wide state.
//!
//! ## Flow
//!
//! ```text
//! StatsEvent
//!     ↓
//! StatsEngine::handle_event()   (flush check first, then count)
//!     ↓
//! accumulators + activity ledger
//!     ↓  take_due_batch()       (drain under lock)
//! FlushBatch
//!     ↓  write_batch()          (lock released)
//! StatsStore
//! ```

use super::clock::{BucketKeys, FlushReason, FlushScheduler};
use super::db::{StatsStore, StoreError};
use super::events::StatsEvent;
use super::fields::{DailyField, HourlyField, LongtermField};
use super::accumulator::{NumericalAccumulator, RecordedAccumulator};
use super::ingestion::start_stats_ingestion;
use super::ledger::{ActivityLedger, ActivityUpdate};
use super::snapshot::{build_snapshot, SnapshotCache, StatisticsSnapshot};
use super::source::EntitySource;
use super::upsert::UpsertRequest;
use chrono::{NaiveDate, NaiveDateTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type NowFn = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

struct EngineState {
    hourly: NumericalAccumulator<HourlyField>,
    daily: RecordedAccumulator<DailyField>,
    longterm: NumericalAccumulator<LongtermField>,
    activity: ActivityLedger,
    scheduler: FlushScheduler,
}

/// Everything drained by one flush, ready to be written
#[derive(Debug, Clone)]
pub struct FlushBatch {
    pub reason: FlushReason,
    /// Keys of the window the drained data was counted in
    pub keys: BucketKeys,
    pub upserts: Vec<UpsertRequest>,
    pub activity: Vec<ActivityUpdate>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.activity.is_empty()
    }
}

pub struct StatsEngine {
    state: Mutex<EngineState>,
    store: Arc<dyn StatsStore>,
    sources: RwLock<Vec<Arc<dyn EntitySource>>>,
    snapshots: SnapshotCache,
    now_fn: NowFn,
    stopped: AtomicBool,
}

impl StatsEngine {
    /// Create an engine on the local wall clock
    pub fn new(store: Arc<dyn StatsStore>, refresh_interval: Duration) -> Self {
        Self::with_clock(
            store,
            refresh_interval,
            Box::new(|| chrono::Local::now().naive_local()),
        )
    }

    /// Create an engine with a custom clock (deterministic tests)
    pub fn with_clock(
        store: Arc<dyn StatsStore>,
        refresh_interval: Duration,
        now_fn: NowFn,
    ) -> Self {
        let now = now_fn();
        Self {
            state: Mutex::new(EngineState {
                hourly: NumericalAccumulator::new(),
                daily: RecordedAccumulator::new(),
                longterm: NumericalAccumulator::new(),
                activity: ActivityLedger::new(),
                scheduler: FlushScheduler::new(refresh_interval, now),
            }),
            store,
            sources: RwLock::new(Vec::new()),
            snapshots: SnapshotCache::new(),
            now_fn,
            stopped: AtomicBool::new(false),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.now_fn)()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Register a live entity source for snapshot assembly
    pub fn add_entity_source(&self, source: Arc<dyn EntitySource>) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        log::info!("🔌 Registered entity source '{}'", source.platform());
        sources.push(source);
    }

    /// Count one event into the open window (no flush check)
    ///
    /// Returns `false` once the engine is stopped. The flag is read under the
    /// state lock, so an event counted here is always seen by the final flush.
    pub fn record(&self, event: &StatsEvent) -> bool {
        let mut state = self.lock_state();
        if self.is_stopped() {
            log::debug!("Dropping {} event after stop", event.kind());
            return false;
        }
        match event {
            StatsEvent::MessageReceived { bot_id, channel_id } => {
                state.hourly.increment(HourlyField::Total);
                state.daily.increment(DailyField::BotReceive, bot_id);
                match channel_id {
                    Some(channel) => {
                        state.hourly.increment(HourlyField::GroupMessages);
                        state.daily.increment(DailyField::GroupMessages, channel);
                        state.activity.increment(channel);
                    }
                    None => state.hourly.increment(HourlyField::PrivateMessages),
                }
            }
            StatsEvent::MessageSent { bot_id, .. } => {
                state.daily.increment(DailyField::BotSend, bot_id);
                state.longterm.increment(LongtermField::Message);
            }
            StatsEvent::CommandInvoked { command } => {
                state.hourly.increment(HourlyField::Command);
                state.daily.increment(DailyField::Command, command);
            }
            StatsEvent::DialogueMatched { dialogue_id } => {
                state.hourly.increment(HourlyField::Dialogue);
                state.daily.increment(DailyField::Dialogue, &dialogue_id.to_string());
            }
        }
        true
    }

    /// Drain accumulator state if a flush trigger fires now
    ///
    /// Returns `None` when nothing is due, or when the engine is stopped and
    /// the flush is not forced.
    pub fn take_due_batch(&self, forced: bool) -> Option<FlushBatch> {
        if !forced && self.is_stopped() {
            return None;
        }

        let now = self.now();
        let mut state = self.lock_state();
        let reason = state.scheduler.due(now, forced)?;
        let keys = state.scheduler.close_window(now);

        let mut upserts = Vec::with_capacity(3);
        upserts.extend(state.hourly.build_upsert(&keys.hour));
        upserts.extend(state.daily.build_upsert(&keys.date));
        upserts.extend(state.longterm.build_upsert(&keys.date));
        let activity = state.activity.drain_updates(keys.day);

        Some(FlushBatch {
            reason,
            keys,
            upserts,
            activity,
        })
    }

    /// Write a drained batch
    ///
    /// Both halves are attempted even if one fails. Failed counts are lost;
    /// they were cleared when the batch was taken.
    pub async fn write_batch(&self, batch: FlushBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            log::debug!(
                "⏭️  Nothing to flush for {} ({})",
                batch.keys.hour,
                batch.reason.as_str()
            );
            return Ok(());
        }

        let flush_start = std::time::Instant::now();
        let upsert_count = batch.upserts.len();
        let activity_count = batch.activity.len();
        for request in &batch.upserts {
            log::debug!(
                "   ├─ {} {} [{}]",
                request.mode.as_str(),
                request.table,
                request.bucket
            );
        }

        let upsert_result = if batch.upserts.is_empty() {
            Ok(())
        } else {
            self.store.apply_upserts(batch.upserts).await
        };
        if let Err(e) = &upsert_result {
            log::error!("❌ Failed to write {} stats upserts: {}", upsert_count, e);
        }

        let activity_result = if batch.activity.is_empty() {
            Ok(())
        } else {
            self.store.merge_activity(batch.activity).await
        };
        if let Err(e) = &activity_result {
            log::error!("❌ Failed to merge {} activity updates: {}", activity_count, e);
        }

        if upsert_result.is_ok() && activity_result.is_ok() {
            log::info!(
                "📊 Flush complete ({}): {} upserts, {} entities | {} | {}ms",
                batch.reason.as_str(),
                upsert_count,
                activity_count,
                batch.keys.hour,
                flush_start.elapsed().as_millis()
            );
        }

        upsert_result.and(activity_result)
    }

    /// Flush if a trigger fires; returns whether a flush ran
    pub async fn flush_if_due(&self) -> bool {
        match self.take_due_batch(false) {
            Some(batch) => {
                let _ = self.write_batch(batch).await;
                true
            }
            None => false,
        }
    }

    /// Forced flush regardless of triggers or stop state
    pub async fn flush_now(&self) -> Result<(), StoreError> {
        match self.take_due_batch(true) {
            Some(batch) => self.write_batch(batch).await,
            None => Ok(()),
        }
    }

    /// Flush check, then count the event into the (possibly new) window
    pub async fn handle_event(&self, event: StatsEvent) -> bool {
        if self.is_stopped() {
            log::debug!("Dropping {} event after stop", event.kind());
            return false;
        }
        self.flush_if_due().await;
        self.record(&event)
    }

    /// Disable normal flushing and write whatever is still pending
    pub async fn stop(&self) -> Result<(), StoreError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("🔄 Stopping stats engine, performing final flush...");
        let result = self.flush_now().await;
        match &result {
            Ok(()) => log::info!("✅ Final stats flush complete"),
            Err(e) => log::warn!("⚠️  Final stats flush incomplete: {}", e),
        }
        result
    }

    /// Statistics snapshot for `date`, cached per date
    pub async fn snapshot(
        &self,
        date: NaiveDate,
        force: bool,
    ) -> Result<Arc<StatisticsSnapshot>, StoreError> {
        let sources: Vec<Arc<dyn EntitySource>> = self
            .sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let store = self.store.as_ref();
        self.snapshots
            .get_or_compute(date, force, || build_snapshot(store, &sources, date))
            .await
    }

    pub async fn today_snapshot(
        &self,
        force: bool,
    ) -> Result<Arc<StatisticsSnapshot>, StoreError> {
        self.snapshot(self.now().date(), force).await
    }

    /// Spawn the ingestion loop for this engine
    pub fn start(
        self: &Arc<Self>,
        rx: mpsc::Receiver<StatsEvent>,
        tick_interval: Duration,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            start_stats_ingestion(rx, engine, tick_interval).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::types::{
        ChannelRecord, ChannelRename, DailyRecord, DialogueQuestion, HourlyRecord, LongtermRecord,
    };
    use crate::stats::upsert::UpsertMode;
    use async_trait::async_trait;

    /// Store that records writes and returns empty history
    #[derive(Default)]
    struct RecordingStore {
        upserts: Mutex<Vec<UpsertRequest>>,
        activity: Mutex<Vec<ActivityUpdate>>,
    }

    impl RecordingStore {
        fn take_upserts(&self) -> Vec<UpsertRequest> {
            std::mem::take(&mut *self.upserts.lock().unwrap())
        }
    }

    #[async_trait]
    impl StatsStore for RecordingStore {
        async fn apply_upserts(&self, requests: Vec<UpsertRequest>) -> Result<(), StoreError> {
            self.upserts.lock().unwrap().extend(requests);
            Ok(())
        }

        async fn merge_activity(&self, updates: Vec<ActivityUpdate>) -> Result<(), StoreError> {
            self.activity.lock().unwrap().extend(updates);
            Ok(())
        }

        async fn recent_daily(
            &self,
            _: NaiveDate,
            _: usize,
        ) -> Result<Vec<DailyRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn recent_hourly(
            &self,
            _: NaiveDateTime,
            _: usize,
        ) -> Result<Vec<HourlyRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn longterm_before(&self, _: NaiveDate) -> Result<Vec<LongtermRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn channels(&self) -> Result<Vec<ChannelRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn rename_channels(&self, _: Vec<ChannelRename>) -> Result<(), StoreError> {
            Ok(())
        }

        async fn dialogue_questions(
            &self,
            _: Vec<i64>,
        ) -> Result<Vec<DialogueQuestion>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    /// Engine on a settable clock
    type TestClock = Arc<Mutex<NaiveDateTime>>;

    fn test_engine(start: &str) -> (Arc<StatsEngine>, Arc<RecordingStore>, TestClock) {
        let store = Arc::new(RecordingStore::default());
        let clock = Arc::new(Mutex::new(at(start)));
        let clock_ref = Arc::clone(&clock);
        let engine = StatsEngine::with_clock(
            store.clone(),
            Duration::from_secs(60),
            Box::new(move || *clock_ref.lock().unwrap()),
        );
        (Arc::new(engine), store, clock)
    }

    fn command(name: &str) -> StatsEvent {
        StatsEvent::CommandInvoked {
            command: name.to_string(),
        }
    }

    fn find<'a>(upserts: &'a [UpsertRequest], table: &str) -> &'a UpsertRequest {
        upserts.iter().find(|u| u.table == table).unwrap()
    }

    #[tokio::test]
    async fn test_same_bucket_inserts_then_merges() {
        let (engine, store, clock) = test_engine("2024-01-01 10:00:00");

        for _ in 0..3 {
            engine.handle_event(command("help")).await;
        }
        *clock.lock().unwrap() = at("2024-01-01 10:01:01");
        assert!(engine.flush_if_due().await);

        let first = store.take_upserts();
        let daily = find(&first, "stats_daily");
        assert_eq!(daily.mode, UpsertMode::Insert);
        assert_eq!(daily.bucket, "2024-01-01");
        assert_eq!(daily.recorded["command"].get("help"), Some(&3));
        let hourly = find(&first, "stats_hourly");
        assert_eq!(hourly.mode, UpsertMode::Insert);
        assert_eq!(hourly.numeric.get("command"), Some(&3));

        engine.record(&command("help"));
        *clock.lock().unwrap() = at("2024-01-01 10:02:02");
        assert!(engine.flush_if_due().await);

        let second = store.take_upserts();
        let daily = find(&second, "stats_daily");
        assert_eq!(daily.mode, UpsertMode::Merge);
        assert_eq!(daily.recorded["command"].get("help"), Some(&1));
        assert_eq!(find(&second, "stats_hourly").mode, UpsertMode::Merge);
    }

    #[tokio::test]
    async fn test_not_due_within_interval() {
        let (engine, store, clock) = test_engine("2024-01-01 10:00:00");
        engine.record(&command("help"));

        *clock.lock().unwrap() = at("2024-01-01 10:00:30");
        assert!(!engine.flush_if_due().await);
        assert!(store.take_upserts().is_empty());
    }

    #[tokio::test]
    async fn test_hour_rollover_flushes_old_window_before_counting() {
        let (engine, store, clock) = test_engine("2024-01-01 10:59:50");
        engine.handle_event(command("help")).await;

        // 15 s later, but the hour changed
        *clock.lock().unwrap() = at("2024-01-01 11:00:05");
        engine.handle_event(command("echo")).await;

        let flushed = store.take_upserts();
        let hourly = find(&flushed, "stats_hourly");
        assert_eq!(hourly.bucket, "2024-01-01 10:00:00");
        assert_eq!(hourly.numeric.get("command"), Some(&1));
        let daily = find(&flushed, "stats_daily");
        assert_eq!(daily.recorded["command"].get("help"), Some(&1));
        assert_eq!(daily.recorded["command"].get("echo"), None);

        // The triggering event landed in the new window
        engine.flush_now().await.unwrap();
        let next = store.take_upserts();
        let hourly = find(&next, "stats_hourly");
        assert_eq!(hourly.bucket, "2024-01-01 11:00:00");
        assert_eq!(hourly.mode, UpsertMode::Insert);
        let daily = find(&next, "stats_daily");
        assert_eq!(daily.mode, UpsertMode::Merge);
        assert_eq!(daily.recorded["command"].get("echo"), Some(&1));
    }

    #[tokio::test]
    async fn test_message_events_fill_all_tables() {
        let (engine, store, _clock) = test_engine("2024-01-01 10:00:00");
        engine.record(&StatsEvent::MessageReceived {
            bot_id: "qq:1".to_string(),
            channel_id: Some("qq:500".to_string()),
        });
        engine.record(&StatsEvent::MessageReceived {
            bot_id: "qq:1".to_string(),
            channel_id: None,
        });
        engine.record(&StatsEvent::MessageSent {
            bot_id: "qq:1".to_string(),
            channel_id: Some("qq:500".to_string()),
        });
        engine.record(&StatsEvent::DialogueMatched { dialogue_id: 9 });

        engine.flush_now().await.unwrap();
        let upserts = store.take_upserts();

        let hourly = find(&upserts, "stats_hourly");
        assert_eq!(hourly.numeric.get("total"), Some(&2));
        assert_eq!(hourly.numeric.get("group_messages"), Some(&1));
        assert_eq!(hourly.numeric.get("private_messages"), Some(&1));
        assert_eq!(hourly.numeric.get("dialogue"), Some(&1));

        let daily = find(&upserts, "stats_daily");
        assert_eq!(daily.recorded["bot_receive"].get("qq:1"), Some(&2));
        assert_eq!(daily.recorded["bot_send"].get("qq:1"), Some(&1));
        assert_eq!(daily.recorded["group_messages"].get("qq:500"), Some(&1));
        assert_eq!(daily.recorded["dialogue"].get("9"), Some(&1));

        let longterm = find(&upserts, "stats_longterm");
        assert_eq!(longterm.numeric.get("message"), Some(&1));

        let activity = store.activity.lock().unwrap().clone();
        assert_eq!(
            activity,
            vec![ActivityUpdate {
                entity_id: "qq:500".to_string(),
                day: 19_723,
                delta: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_stop_forces_final_flush_and_disables_triggers() {
        let (engine, store, clock) = test_engine("2024-01-01 10:00:00");
        engine.record(&command("help"));

        engine.stop().await.unwrap();
        assert_eq!(store.take_upserts().len(), 2);
        assert!(engine.is_stopped());

        assert!(!engine.handle_event(command("help")).await);
        *clock.lock().unwrap() = at("2024-01-01 12:00:00");
        assert!(engine.take_due_batch(false).is_none());

        // Second stop is a no-op
        engine.stop().await.unwrap();
        assert!(store.take_upserts().is_empty());
    }

    #[tokio::test]
    async fn test_record_after_stop_is_not_counted() {
        let (engine, store, _clock) = test_engine("2024-01-01 10:00:00");
        assert!(engine.record(&command("help")));
        engine.stop().await.unwrap();
        store.take_upserts();

        // Direct counting skips the handle_event guard
        assert!(!engine.record(&command("help")));
        assert!(engine.take_due_batch(true).map_or(true, |batch| batch.is_empty()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_racing_stop_are_flushed_or_dropped() {
        let (engine, store, _clock) = test_engine("2024-01-01 10:00:00");

        let recorders: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    (0..2_000).filter(|_| engine.record(&command("help"))).count() as i64
                })
            })
            .collect();
        engine.stop().await.unwrap();
        let counted: i64 = recorders.into_iter().map(|h| h.join().unwrap()).sum();

        let flushed = store
            .take_upserts()
            .iter()
            .find(|u| u.table == "stats_hourly")
            .and_then(|u| u.numeric.get("command").copied())
            .unwrap_or(0);
        assert_eq!(flushed, counted);
    }

    #[tokio::test]
    async fn test_today_snapshot_uses_engine_clock() {
        let (engine, _store, _clock) = test_engine("2024-03-05 08:00:00");
        let snapshot = engine.today_snapshot(false).await.unwrap();
        assert_eq!(snapshot.date, "2024-03-05");
        assert_eq!(snapshot.hours.len(), 24);
        assert!(snapshot.groups.is_empty());
    }
}

//! End-to-end tests: events → engine → SQLite → snapshot
//!
//! Each test runs against its own migrated temp database and drives the engine
//! with a settable clock.

#[cfg(test)]
mod engine_integration_tests {
    use chrono::{NaiveDate, NaiveDateTime};
    use rusqlite::Connection;
    use statflow::stats::{
        run_schema_migrations, DailyField, EntityInfo, SqliteStatsStore, StaticEntitySource,
        StatsEngine, StatsEvent, StatsStore,
    };
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn create_test_db() -> (NamedTempFile, String) {
        let temp_file = NamedTempFile::new().unwrap();
        let db_path = temp_file.path().to_str().unwrap().to_string();

        let mut conn = Connection::open(&db_path).unwrap();
        run_schema_migrations(&mut conn, "sql").unwrap();
        (temp_file, db_path)
    }

    fn at(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn engine_on(
        store: Arc<SqliteStatsStore>,
        clock: &Arc<Mutex<NaiveDateTime>>,
    ) -> Arc<StatsEngine> {
        let clock = Arc::clone(clock);
        Arc::new(StatsEngine::with_clock(
            store,
            Duration::from_secs(60),
            Box::new(move || *clock.lock().unwrap()),
        ))
    }

    fn help() -> StatsEvent {
        StatsEvent::CommandInvoked {
            command: "help".to_string(),
        }
    }

    fn group_message() -> StatsEvent {
        StatsEvent::MessageReceived {
            bot_id: "qq:1".to_string(),
            channel_id: Some("qq:500".to_string()),
        }
    }

    async fn stored_help(store: &SqliteStatsStore) -> Option<i64> {
        let daily = store.recent_daily(date("2024-01-02"), 5).await.unwrap();
        daily
            .first()
            .and_then(|d| d.field(DailyField::Command).get("help").copied())
    }

    #[tokio::test]
    async fn test_help_counts_insert_then_merge() {
        let (_temp, db_path) = create_test_db();
        let store = Arc::new(SqliteStatsStore::new(&db_path).unwrap());
        let clock = Arc::new(Mutex::new(at("2024-01-01 10:00:00")));
        let engine = engine_on(store.clone(), &clock);

        for _ in 0..3 {
            engine.handle_event(help()).await;
        }
        *clock.lock().unwrap() = at("2024-01-01 10:01:01");
        assert!(engine.flush_if_due().await);
        assert_eq!(stored_help(&store).await, Some(3));

        engine.handle_event(help()).await;
        *clock.lock().unwrap() = at("2024-01-01 10:02:02");
        assert!(engine.flush_if_due().await);
        assert_eq!(stored_help(&store).await, Some(4));

        let hourly = store.recent_hourly(at("2024-01-02 00:00:00"), 24).await.unwrap();
        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].time, at("2024-01-01 10:00:00"));
    }

    #[tokio::test]
    async fn test_restart_in_same_bucket_merges() {
        let (_temp, db_path) = create_test_db();
        let store = Arc::new(SqliteStatsStore::new(&db_path).unwrap());
        let clock = Arc::new(Mutex::new(at("2024-01-01 10:00:00")));

        let first = engine_on(store.clone(), &clock);
        for _ in 0..3 {
            first.record(&help());
        }
        first.stop().await.unwrap();

        // Fresh accumulators insert again; the store folds it into the row
        let second = engine_on(store.clone(), &clock);
        second.record(&help());
        second.stop().await.unwrap();

        assert_eq!(stored_help(&store).await, Some(4));
    }

    #[tokio::test]
    async fn test_activity_ledger_accumulates_per_day() {
        let (_temp, db_path) = create_test_db();
        let store = Arc::new(SqliteStatsStore::new(&db_path).unwrap());
        let clock = Arc::new(Mutex::new(at("2024-01-01 23:59:00")));
        let engine = engine_on(store.clone(), &clock);

        engine.handle_event(group_message()).await;
        engine.handle_event(group_message()).await;

        // Day and hour roll over; the next event flushes the old window first
        *clock.lock().unwrap() = at("2024-01-02 00:00:10");
        engine.handle_event(group_message()).await;
        engine.flush_now().await.unwrap();

        let channels = store.channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "qq:500");
        assert_eq!(channels[0].activity.get(&19_723), Some(&2));
        assert_eq!(channels[0].activity.get(&19_724), Some(&1));
    }

    #[tokio::test]
    async fn test_snapshot_from_stored_history() {
        let (_temp, db_path) = create_test_db();
        let store = Arc::new(SqliteStatsStore::new(&db_path).unwrap());
        let clock = Arc::new(Mutex::new(at("2024-01-01 10:00:00")));
        let engine = engine_on(store.clone(), &clock);

        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute(
                "INSERT INTO dialogue (id, original, answer) VALUES (1, 'how are you', 'fine')",
                [],
            )
            .unwrap();
        }

        for _ in 0..4 {
            engine.handle_event(help()).await;
        }
        for _ in 0..3 {
            engine.handle_event(group_message()).await;
        }
        engine
            .handle_event(StatsEvent::MessageSent {
                bot_id: "qq:1".to_string(),
                channel_id: Some("qq:500".to_string()),
            })
            .await;
        engine
            .handle_event(StatsEvent::DialogueMatched { dialogue_id: 1 })
            .await;
        engine.stop().await.unwrap();

        engine.add_entity_source(Arc::new(StaticEntitySource::new(
            "qq",
            vec![EntityInfo {
                id: "500".to_string(),
                name: "Lobby".to_string(),
            }],
        )));

        let snapshot = engine.snapshot(date("2024-01-02"), false).await.unwrap();
        assert_eq!(snapshot.date, "2024-01-02");
        assert_eq!(snapshot.history.get("2024-01-01"), Some(&1));
        assert_eq!(snapshot.commands.get("help"), Some(&0.8));
        assert_eq!(snapshot.hours[10].get("total"), Some(&0.6));
        assert_eq!(snapshot.hours[10].get("command"), Some(&0.8));

        assert_eq!(snapshot.questions.len(), 1);
        assert_eq!(snapshot.questions[0].name, "how are you");
        assert_eq!(snapshot.questions[0].value, 0.2);

        assert_eq!(snapshot.groups.len(), 1);
        let group = &snapshot.groups[0];
        assert_eq!(group.id, "qq:500");
        assert_eq!(group.platform, "qq");
        assert_eq!(group.name, "Lobby");
        assert_eq!(group.value, 0.6);
        assert_eq!(group.last, 3);

        let bot = snapshot.bots.get("qq:1").unwrap();
        assert_eq!(bot.sent, 0.2);
        assert_eq!(bot.received, 0.6);

        // Live name drifted from the stored (empty) one
        let channels = store.channels().await.unwrap();
        assert_eq!(channels[0].name.as_deref(), Some("Lobby"));

        // Same date is served from cache
        let again = engine.snapshot(date("2024-01-02"), false).await.unwrap();
        assert!(Arc::ptr_eq(&snapshot, &again));

        let json = serde_json::to_value(snapshot.as_ref()).unwrap();
        assert_eq!(json["groups"][0]["name"], "Lobby");
        assert_eq!(json["hours"].as_array().unwrap().len(), 24);
    }
}

//! Stats ingestion - async channel processor for host events
//!
//! Every event runs the flush check before it is counted; the interval tick
//! runs the same check so a quiet process still closes its windows. Channel
//! close stops the engine, which performs the final forced flush.

use super::engine::StatsEngine;
use super::events::StatsEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Run until the event channel closes
pub async fn start_stats_ingestion(
    mut rx: mpsc::Receiver<StatsEvent>,
    engine: Arc<StatsEngine>,
    tick_interval: Duration,
) {
    log::info!("🚀 Starting stats ingestion");
    log::info!("   ├─ Tick interval: {}ms", tick_interval.as_millis());
    log::info!("   └─ Waiting for events...");

    let mut tick = interval(tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut event_count = 0u64;
    let mut last_log_time = std::time::Instant::now();

    loop {
        tokio::select! {
            received = rx.recv() => {
                let Some(event) = received else {
                    log::warn!("⚠️  Event channel closed, stopping ingestion");
                    let _ = engine.stop().await;
                    break;
                };

                engine.handle_event(event).await;
                event_count += 1;

                if last_log_time.elapsed().as_secs() >= 10 {
                    let elapsed = last_log_time.elapsed().as_secs_f64();
                    let events_per_sec = event_count as f64 / elapsed;
                    log::info!(
                        "📊 Ingestion rate: {:.1} events/sec (total: {})",
                        events_per_sec,
                        event_count
                    );
                    last_log_time = std::time::Instant::now();
                    event_count = 0;
                }
            }

            _ = tick.tick() => {
                if engine.flush_if_due().await {
                    log::debug!("⏱️  Tick flush ran | channel backlog: {}", rx.len());
                }
            }
        }
    }

    log::info!("✅ Stats ingestion stopped");
}

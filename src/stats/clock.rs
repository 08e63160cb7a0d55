//! Bucket clock and flush scheduler
//!
//! Bucket keys identify aggregation windows:
//! - hourly: `YYYY-MM-DD HH:00:00`
//! - daily / longterm: `YYYY-MM-DD`
//!
//! The scheduler keeps the window that is currently open. On flush the open
//! window's keys are handed out (they describe the data being flushed) and a
//! new window is opened at the flush time.

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::time::Duration;

/// Default elapsed-time trigger
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// `NaiveDate::num_days_from_ce()` of 1970-01-01
const UNIX_EPOCH_DAYS_FROM_CE: i64 = 719_163;

pub fn hour_key(at: NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:00:00").to_string()
}

pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// Days since 1970-01-01 for `date`; used as the activity map key
pub fn day_number(date: NaiveDate) -> i64 {
    i64::from(date.num_days_from_ce()) - UNIX_EPOCH_DAYS_FROM_CE
}

/// Keys of one aggregation window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub hour: String,
    pub date: String,
    pub day: i64,
}

impl BucketKeys {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            hour: hour_key(now),
            date: date_key(now.date()),
            day: day_number(now.date()),
        }
    }
}

/// Why a flush fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Forced,
    Elapsed,
    HourRollover,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Forced => "forced",
            FlushReason::Elapsed => "elapsed",
            FlushReason::HourRollover => "hour_rollover",
        }
    }
}

/// Decides when accumulator state moves to storage
#[derive(Debug, Clone)]
pub struct FlushScheduler {
    refresh_interval: Duration,
    last_flush_at: NaiveDateTime,
    window: BucketKeys,
}

impl FlushScheduler {
    pub fn new(refresh_interval: Duration, now: NaiveDateTime) -> Self {
        Self {
            refresh_interval,
            last_flush_at: now,
            window: BucketKeys::at(now),
        }
    }

    /// Returns the trigger that fires at `now`, if any
    ///
    /// Hour rollover is checked before elapsed time so a quiet hour still
    /// closes as soon as the next check runs.
    pub fn due(&self, now: NaiveDateTime, forced: bool) -> Option<FlushReason> {
        if forced {
            return Some(FlushReason::Forced);
        }
        if hour_key(now) != self.window.hour {
            return Some(FlushReason::HourRollover);
        }
        // A clock that moved backwards yields a negative span; treat as not elapsed
        let elapsed = (now - self.last_flush_at).to_std().unwrap_or_default();
        if elapsed > self.refresh_interval {
            return Some(FlushReason::Elapsed);
        }
        None
    }

    /// Close the open window at `now`, returning its keys
    pub fn close_window(&mut self, now: NaiveDateTime) -> BucketKeys {
        self.last_flush_at = now;
        std::mem::replace(&mut self.window, BucketKeys::at(now))
    }

    pub fn window(&self) -> &BucketKeys {
        &self.window
    }

    pub fn last_flush_at(&self) -> NaiveDateTime {
        self.last_flush_at
    }
}

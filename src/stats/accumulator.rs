//! In-memory counter accumulators
//!
//! Two shapes:
//! - `NumericalAccumulator` - one integer per field (hourly, longterm)
//! - `RecordedAccumulator` - one `key -> count` map per field (daily)
//!
//! Both remember the bucket key they last flushed under. The upsert builder
//! uses it to choose between insert and merge (see `upsert.rs`).
//!
//! Accumulators are plain owned state with no interior locking. The engine
//! serializes all access through a single mutex.

use super::fields::StatField;
use std::collections::BTreeMap;

/// Per-key counts for a recorded field (entity id, command name, ...)
pub type Counts = BTreeMap<String, i64>;

/// Scalar counter per field
#[derive(Debug, Clone)]
pub struct NumericalAccumulator<F: StatField> {
    data: BTreeMap<F, i64>,
    pub(super) last_bucket: Option<String>,
}

impl<F: StatField> NumericalAccumulator<F> {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            last_bucket: None,
        }
    }

    /// Add 1 to `field`
    pub fn increment(&mut self, field: F) {
        self.add(field, 1);
    }

    /// Add `count` to `field` (non-positive counts are ignored)
    pub fn add(&mut self, field: F, count: i64) {
        if count <= 0 {
            return;
        }
        let value = self.data.entry(field).or_insert(0);
        *value = value.saturating_add(count);
    }

    pub fn get(&self, field: F) -> i64 {
        self.data.get(&field).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(|v| *v == 0)
    }

    /// Return the accumulated values and reset to empty
    pub fn drain(&mut self) -> BTreeMap<F, i64> {
        let mut values = std::mem::take(&mut self.data);
        values.retain(|_, v| *v != 0);
        values
    }

    /// Bucket key of the last emitted upsert
    pub fn last_bucket(&self) -> Option<&str> {
        self.last_bucket.as_deref()
    }
}

impl<F: StatField> Default for NumericalAccumulator<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Nested `key -> count` map per field
#[derive(Debug, Clone)]
pub struct RecordedAccumulator<F: StatField> {
    data: BTreeMap<F, Counts>,
    pub(super) last_bucket: Option<String>,
}

impl<F: StatField> RecordedAccumulator<F> {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            last_bucket: None,
        }
    }

    /// Add 1 to the counter for `key` under `field`
    pub fn increment(&mut self, field: F, key: &str) {
        self.add(field, key, 1);
    }

    pub fn add(&mut self, field: F, key: &str, count: i64) {
        if count <= 0 {
            return;
        }
        let value = self
            .data
            .entry(field)
            .or_default()
            .entry(key.to_string())
            .or_insert(0);
        *value = value.saturating_add(count);
    }

    pub fn get(&self, field: F, key: &str) -> i64 {
        self.data
            .get(&field)
            .and_then(|counts| counts.get(key))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(|counts| counts.is_empty())
    }

    /// Return the accumulated maps and reset to empty
    pub fn drain(&mut self) -> BTreeMap<F, Counts> {
        let mut values = std::mem::take(&mut self.data);
        values.retain(|_, counts| !counts.is_empty());
        values
    }

    pub fn last_bucket(&self) -> Option<&str> {
        self.last_bucket.as_deref()
    }
}

impl<F: StatField> Default for RecordedAccumulator<F> {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge `delta` into `stored`: increment keys that exist, set the rest
///
/// Keys in `stored` that are absent from `delta` are left untouched.
pub fn merge_counts(stored: &mut Counts, delta: &Counts) {
    for (key, count) in delta {
        stored
            .entry(key.clone())
            .and_modify(|v| *v = v.saturating_add(*count))
            .or_insert(*count);
    }
}

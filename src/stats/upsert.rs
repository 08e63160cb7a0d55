//! Upsert builder
//!
//! Turns drained accumulator state plus a bucket key into a structured
//! `UpsertRequest`. The request keeps the insert-vs-merge decision explicit:
//!
//! - first flush for a bucket key → `UpsertMode::Insert` (initial values)
//! - later flushes for the same key → `UpsertMode::Merge`
//!   - numeric fields: `new = old + delta`
//!   - recorded fields: per-key merge (see `merge_counts`)
//!
//! Empty accumulators produce no request and do not claim the bucket key.

use super::accumulator::{Counts, NumericalAccumulator, RecordedAccumulator};
use super::fields::StatField;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertMode {
    /// First write for this bucket from this accumulator instance
    Insert,
    /// Additive merge into an existing bucket row
    Merge,
}

impl UpsertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertMode::Insert => "insert",
            UpsertMode::Merge => "merge",
        }
    }
}

/// One insert-or-merge operation against a time-bucketed table
#[derive(Debug, Clone, PartialEq)]
pub struct UpsertRequest {
    pub table: &'static str,
    pub bucket: String,
    pub mode: UpsertMode,
    /// Column → delta for numeric fields
    pub numeric: BTreeMap<&'static str, i64>,
    /// Column → per-key deltas for recorded fields
    pub recorded: BTreeMap<&'static str, Counts>,
}

impl UpsertRequest {
    pub fn is_empty(&self) -> bool {
        self.numeric.is_empty() && self.recorded.is_empty()
    }
}

fn claim_bucket(last_bucket: &mut Option<String>, bucket: &str) -> UpsertMode {
    if last_bucket.as_deref() == Some(bucket) {
        UpsertMode::Merge
    } else {
        *last_bucket = Some(bucket.to_string());
        UpsertMode::Insert
    }
}

impl<F: StatField> NumericalAccumulator<F> {
    /// Drain into an upsert for `bucket`, or `None` if nothing was counted
    pub fn build_upsert(&mut self, bucket: &str) -> Option<UpsertRequest> {
        let values = self.drain();
        if values.is_empty() {
            return None;
        }

        let mode = claim_bucket(&mut self.last_bucket, bucket);
        Some(UpsertRequest {
            table: F::TABLE,
            bucket: bucket.to_string(),
            mode,
            numeric: values.into_iter().map(|(f, v)| (f.column(), v)).collect(),
            recorded: BTreeMap::new(),
        })
    }
}

impl<F: StatField> RecordedAccumulator<F> {
    pub fn build_upsert(&mut self, bucket: &str) -> Option<UpsertRequest> {
        let values = self.drain();
        if values.is_empty() {
            return None;
        }

        let mode = claim_bucket(&mut self.last_bucket, bucket);
        Some(UpsertRequest {
            table: F::TABLE,
            bucket: bucket.to_string(),
            mode,
            numeric: BTreeMap::new(),
            recorded: values.into_iter().map(|(f, c)| (f.column(), c)).collect(),
        })
    }
}

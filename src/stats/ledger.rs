//! Per-entity activity ledger
//!
//! Pending increments per entity (chat group/channel). On flush they become
//! `ActivityUpdate`s that the store merges into the entity's day-keyed
//! activity map: `activity[day] = activity[day] + delta`.

use std::collections::BTreeMap;

/// Day number → message count, as stored in `channel.activity`
pub type ActivityMap = BTreeMap<i64, i64>;

/// One pending merge into an entity's activity map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityUpdate {
    pub entity_id: String,
    pub day: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityLedger {
    pending: BTreeMap<String, i64>,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, entity_id: &str) {
        let value = self.pending.entry(entity_id.to_string()).or_insert(0);
        *value = value.saturating_add(1);
    }

    pub fn pending(&self, entity_id: &str) -> i64 {
        self.pending.get(entity_id).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drain pending increments into updates keyed by `day`
    ///
    /// Pending state is cleared here, before the updates reach storage.
    pub fn drain_updates(&mut self, day: i64) -> Vec<ActivityUpdate> {
        std::mem::take(&mut self.pending)
            .into_iter()
            .filter(|(_, delta)| *delta > 0)
            .map(|(entity_id, delta)| ActivityUpdate {
                entity_id,
                day,
                delta,
            })
            .collect()
    }
}

/// Apply one update to a stored activity map
pub fn merge_activity(activity: &mut ActivityMap, day: i64, delta: i64) {
    let value = activity.entry(day).or_insert(0);
    *value = value.saturating_add(delta);
}

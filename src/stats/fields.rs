//! Declared counter fields
//!
//! Each statistics table owns a closed set of fields. Accumulators are generic
//! over one of these enums, so incrementing a field that the table does not
//! declare fails to compile instead of creating an ad hoc column at runtime.

use std::fmt::Debug;
use std::hash::Hash;

/// A closed set of counter fields bound to one table
pub trait StatField: Copy + Eq + Ord + Hash + Debug + Send + Sync + 'static {
    /// Table the field set is persisted to
    const TABLE: &'static str;

    /// Every declared field, in column order
    const ALL: &'static [Self];

    /// Column name in `TABLE`
    fn column(self) -> &'static str;
}

/// Hourly counters (`stats_hourly`, numeric)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HourlyField {
    Total,
    GroupMessages,
    PrivateMessages,
    Command,
    Dialogue,
}

impl StatField for HourlyField {
    const TABLE: &'static str = "stats_hourly";
    const ALL: &'static [Self] = &[
        HourlyField::Total,
        HourlyField::GroupMessages,
        HourlyField::PrivateMessages,
        HourlyField::Command,
        HourlyField::Dialogue,
    ];

    fn column(self) -> &'static str {
        match self {
            HourlyField::Total => "total",
            HourlyField::GroupMessages => "group_messages",
            HourlyField::PrivateMessages => "private_messages",
            HourlyField::Command => "command",
            HourlyField::Dialogue => "dialogue",
        }
    }
}

/// Daily per-key counters (`stats_daily`, JSON maps)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DailyField {
    Command,
    Dialogue,
    BotSend,
    BotReceive,
    GroupMessages,
}

impl StatField for DailyField {
    const TABLE: &'static str = "stats_daily";
    const ALL: &'static [Self] = &[
        DailyField::Command,
        DailyField::Dialogue,
        DailyField::BotSend,
        DailyField::BotReceive,
        DailyField::GroupMessages,
    ];

    fn column(self) -> &'static str {
        match self {
            DailyField::Command => "command",
            DailyField::Dialogue => "dialogue",
            DailyField::BotSend => "bot_send",
            DailyField::BotReceive => "bot_receive",
            DailyField::GroupMessages => "group_messages",
        }
    }
}

/// Longterm counters (`stats_longterm`, numeric)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LongtermField {
    Message,
}

impl StatField for LongtermField {
    const TABLE: &'static str = "stats_longterm";
    const ALL: &'static [Self] = &[LongtermField::Message];

    fn column(self) -> &'static str {
        match self {
            LongtermField::Message => "message",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn assert_unique_columns<F: StatField>() {
        let columns: HashSet<&str> = F::ALL.iter().map(|f| f.column()).collect();
        assert_eq!(columns.len(), F::ALL.len(), "duplicate column in {}", F::TABLE);
    }

    #[test]
    fn test_columns_are_unique_per_table() {
        assert_unique_columns::<HourlyField>();
        assert_unique_columns::<DailyField>();
        assert_unique_columns::<LongtermField>();
    }

    #[test]
    fn test_tables_are_distinct() {
        let tables = [HourlyField::TABLE, DailyField::TABLE, LongtermField::TABLE];
        let unique: HashSet<&str> = tables.iter().copied().collect();
        assert_eq!(unique.len(), 3);
    }
}

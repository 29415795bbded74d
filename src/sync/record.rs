use std::fmt;

use crate::granularity::Granularity;
use crate::schedule::{DirtyStamp, StampState, UpdateStamp};

/// One persisted slot state of a shard.
///
/// Stored as a column named `"<granularity name>,<slot>,<state code>"` whose
/// value is the stamp timestamp. Since the state is part of the column name,
/// an active and a rolled record for the same slot can coexist in the store;
/// readers resolve them by timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotStateRecord {
    pub granularity: Granularity,
    pub slot: u32,
    pub state: StampState,
    pub timestamp: i64,
}

impl SlotStateRecord {
    pub fn new(granularity: Granularity, slot: u32, state: StampState, timestamp: i64) -> Self {
        Self {
            granularity,
            slot,
            state,
            timestamp,
        }
    }

    /// Column name this record is stored under.
    pub fn column(&self) -> String {
        format!(
            "{},{},{}",
            self.granularity.name(),
            self.slot,
            self.state.code()
        )
    }

    /// Decodes a stored column and its timestamp. Returns `None` for unknown
    /// granularities or states, out of range slots, `Full` and malformed text.
    pub fn parse(column: &str, timestamp: i64) -> Option<Self> {
        let mut parts = column.split(',');
        let granularity = Granularity::from_name(parts.next()?)?;
        let slot = parts.next()?.parse::<u32>().ok()?;
        let state = StampState::from_code(parts.next()?)?;
        if parts.next().is_some() || granularity == Granularity::Full {
            return None;
        }
        if slot >= granularity.slot_count() {
            return None;
        }
        Some(Self::new(granularity, slot, state, timestamp))
    }

    /// The stamp this record describes, as pulled (clean).
    pub fn stamp(&self) -> UpdateStamp {
        UpdateStamp::new(self.timestamp, self.state, false)
    }
}

impl From<&DirtyStamp> for SlotStateRecord {
    fn from(d: &DirtyStamp) -> Self {
        Self::new(d.granularity, d.slot, d.stamp.state(), d.stamp.timestamp())
    }
}

impl fmt::Display for SlotStateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.column(), self.timestamp)
    }
}

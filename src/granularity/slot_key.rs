use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::shard::NUMBER_OF_SHARDS;
use super::Granularity;

/// Errors raised when constructing a [`SlotKey`] from out-of-range parts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotKeyError {
    #[error("slot {slot} out of range for {granularity} (max {max})")]
    SlotOutOfRange {
        granularity: Granularity,
        slot: u32,
        max: u32,
    },

    #[error("shard {shard} out of range (max {max})")]
    ShardOutOfRange { shard: u32, max: u32 },
}

/// Address of one slot of one shard at one granularity.
///
/// The canonical text form is `"<granularity name>,<slot>,<shard>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    granularity: Granularity,
    slot: u32,
    shard: u32,
}

impl SlotKey {
    /// Creates a key, validating the slot and shard bounds.
    pub fn new(granularity: Granularity, slot: u32, shard: u32) -> Result<Self, SlotKeyError> {
        if slot >= granularity.slot_count() {
            return Err(SlotKeyError::SlotOutOfRange {
                granularity,
                slot,
                max: granularity.slot_count() - 1,
            });
        }
        if shard >= NUMBER_OF_SHARDS {
            return Err(SlotKeyError::ShardOutOfRange {
                shard,
                max: NUMBER_OF_SHARDS - 1,
            });
        }
        Ok(Self {
            granularity,
            slot,
            shard,
        })
    }

    /// Builds a key from parts already known to be in range.
    pub(crate) fn from_parts(granularity: Granularity, slot: u32, shard: u32) -> Self {
        debug_assert!(slot < granularity.slot_count());
        debug_assert!(shard < NUMBER_OF_SHARDS);
        Self {
            granularity,
            slot,
            shard,
        }
    }

    /// Decodes the canonical text form. Returns `None` on anything malformed.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split(',');
        let granularity = Granularity::from_name(parts.next()?)?;
        let slot = parts.next()?.parse::<u32>().ok()?;
        let shard = parts.next()?.parse::<u32>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Self::new(granularity, slot, shard).ok()
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn shard(&self) -> u32 {
        self.shard
    }

    /// All finer-tier keys covered by this key.
    pub fn children_keys(&self) -> Vec<SlotKey> {
        self.granularity.children_keys(self.slot, self.shard)
    }

    /// The key one tier coarser that covers this key.
    pub fn parent(&self) -> Option<SlotKey> {
        let coarser = self.granularity.coarser().ok()?;
        let slot = coarser.slot_from_finer_slot(self.slot).ok()?;
        Some(Self::from_parts(coarser, slot, self.shard))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.granularity.name(), self.slot, self.shard)
    }
}

impl FromStr for SlotKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or(())
    }
}

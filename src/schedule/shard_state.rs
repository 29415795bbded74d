use std::collections::{BTreeMap, BTreeSet};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::trace;

use crate::granularity::shard::NUMBER_OF_SHARDS;
use crate::granularity::{Granularity, SlotKey};

use super::stamp::{StampState, UpdateStamp};

const ROLLUP_TIERS: usize = Granularity::ROLLUP.len();

/// A stamp that has changed locally and still has to be pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyStamp {
    pub granularity: Granularity,
    pub slot: u32,
    pub stamp: UpdateStamp,
}

/// Extra waits applied to a slot that is rolled again because late data
/// arrived after a recent rollup. All values are millis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RerollPolicy {
    /// A re-roll waits until the slot is at least this old.
    pub short_delay: i64,
    /// When the last sample arrived more than `short_delay` late, a re-roll
    /// also waits until ingest has been quiet for this long.
    pub long_delay_wait: i64,
    /// A rollup younger than this makes the next rollup a re-roll.
    pub window: i64,
}

impl RerollPolicy {
    /// Whether the next rollup of `stamp` at `now` is a re-roll.
    pub fn is_reroll(&self, stamp: &UpdateStamp, now: i64) -> bool {
        stamp.last_rollup() > 0 && now - stamp.last_rollup() < self.window
    }

    /// Whether a re-roll of `stamp` has to keep waiting at `now`.
    fn holds(&self, stamp: &UpdateStamp, now: i64) -> bool {
        if now - stamp.timestamp() <= self.short_delay {
            return true;
        }
        stamp.last_ingest() > 0
            && stamp.ingest_delay() > self.short_delay
            && now - stamp.last_ingest() <= self.long_delay_wait
    }
}

/// Authoritative in-memory table of update stamps.
///
/// Every shard is tracked, managed or not, so a peer's state is already
/// present when a shard is taken over. Each (shard, granularity) pair owns an
/// independent `DashMap`, so ingest writes, scheduling scans and sync merges
/// only contend on the same map shard.
pub struct ShardStateManager {
    managed: RwLock<BTreeSet<u32>>,
    tables: Vec<DashMap<u32, UpdateStamp>>,
}

impl std::fmt::Debug for ShardStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardStateManager")
            .field("managed", &*self.managed.read())
            .finish()
    }
}

impl ShardStateManager {
    pub fn new(managed: impl IntoIterator<Item = u32>) -> Self {
        let managed = managed
            .into_iter()
            .filter(|s| *s < NUMBER_OF_SHARDS)
            .collect();
        let tables = (0..NUMBER_OF_SHARDS as usize * ROLLUP_TIERS)
            .map(|_| DashMap::new())
            .collect();

        Self {
            managed: RwLock::new(managed),
            tables,
        }
    }

    fn table(&self, shard: u32, granularity: Granularity) -> Option<&DashMap<u32, UpdateStamp>> {
        if shard >= NUMBER_OF_SHARDS {
            return None;
        }
        // Full is never rolled up, so it has no table.
        let tier = granularity.index().checked_sub(1)?;
        self.tables.get(shard as usize * ROLLUP_TIERS + tier)
    }

    pub fn contains(&self, shard: u32) -> bool {
        self.managed.read().contains(&shard)
    }

    /// Starts managing `shard`. Returns false if it already was.
    pub fn add_shard(&self, shard: u32) -> bool {
        shard < NUMBER_OF_SHARDS && self.managed.write().insert(shard)
    }

    /// Stops managing `shard`. Returns false if it was not managed.
    pub fn remove_shard(&self, shard: u32) -> bool {
        self.managed.write().remove(&shard)
    }

    pub fn managed_shards(&self) -> Vec<u32> {
        self.managed.read().iter().copied().collect()
    }

    /// Marks `slot` active with at least `millis` as its timestamp. `now` is
    /// the ingest time of the sample.
    pub fn create_or_update(
        &self,
        granularity: Granularity,
        shard: u32,
        slot: u32,
        millis: i64,
        now: i64,
    ) -> Option<UpdateStamp> {
        let table = self.table(shard, granularity)?;
        let mut entry = table
            .entry(slot)
            .or_insert_with(|| UpdateStamp::new(millis, StampState::Active, true));
        entry.activate(millis);
        entry.record_ingest(now, millis);
        Some(*entry)
    }

    pub fn get_stamp(&self, key: &SlotKey) -> Option<UpdateStamp> {
        let table = self.table(key.shard(), key.granularity())?;
        table.get(&key.slot()).map(|s| *s)
    }

    /// Snapshot of one (granularity, shard) table. Empty for `Full`.
    pub fn slot_stamps(&self, granularity: Granularity, shard: u32) -> BTreeMap<u32, UpdateStamp> {
        self.table(shard, granularity)
            .map(|t| t.iter().map(|e| (*e.key(), *e.value())).collect())
            .unwrap_or_default()
    }

    /// Number of stamps tracked for `shard` across all rollup tiers.
    pub fn stamp_count(&self, shard: u32) -> usize {
        Granularity::ROLLUP
            .iter()
            .filter_map(|g| self.table(shard, *g))
            .map(|t| t.len())
            .sum()
    }

    /// Snapshot of every dirty stamp of `shard`. Flags are left untouched
    /// until the snapshot is confirmed written via [`Self::mark_clean`].
    pub fn dirty_stamps(&self, shard: u32) -> Vec<DirtyStamp> {
        let mut dirty = Vec::new();
        for g in Granularity::ROLLUP {
            let Some(table) = self.table(shard, g) else {
                continue;
            };
            for entry in table.iter() {
                if entry.is_dirty() {
                    dirty.push(DirtyStamp {
                        granularity: g,
                        slot: *entry.key(),
                        stamp: *entry.value(),
                    });
                }
            }
        }
        dirty
    }

    /// Clears the dirty flag of each pushed stamp that has not changed since.
    pub fn mark_clean(&self, shard: u32, pushed: &[DirtyStamp]) -> usize {
        let mut cleaned = 0;
        for d in pushed {
            let Some(table) = self.table(shard, d.granularity) else {
                continue;
            };
            if let Some(mut current) = table.get_mut(&d.slot) {
                if *current == d.stamp {
                    current.set_dirty(false);
                    cleaned += 1;
                }
            }
        }
        cleaned
    }

    /// Merges a stamp read from the shared store. The remote stamp is taken
    /// when the slot is unknown locally or when its timestamp is strictly
    /// newer; state plays no part. A remote rolled stamp always counts as a
    /// rollup for re-roll purposes. Returns true if local state changed.
    pub fn apply_remote(
        &self,
        shard: u32,
        granularity: Granularity,
        slot: u32,
        remote: UpdateStamp,
    ) -> bool {
        let Some(table) = self.table(shard, granularity) else {
            return false;
        };
        match table.entry(slot) {
            Entry::Vacant(v) => {
                let mut incoming = UpdateStamp::new(remote.timestamp(), remote.state(), false);
                if remote.state() == StampState::Rolled {
                    incoming.record_rollup(remote.timestamp());
                }
                v.insert(incoming);
                true
            }
            Entry::Occupied(mut o) => {
                if remote.timestamp() > o.get().timestamp() {
                    o.get_mut().merge_remote(remote);
                    true
                } else {
                    if remote.state() == StampState::Rolled {
                        o.get_mut().record_rollup(remote.timestamp());
                    }
                    false
                }
            }
        }
    }

    /// Active slots of (shard, granularity) idle for longer than `max_age`,
    /// with their stamp timestamps. With a `reroll` policy, slots rolled
    /// recently are held back until its delays have passed.
    pub fn eligible_slots(
        &self,
        shard: u32,
        granularity: Granularity,
        now: i64,
        max_age: i64,
        reroll: Option<&RerollPolicy>,
    ) -> Vec<(u32, i64)> {
        let Some(table) = self.table(shard, granularity) else {
            return Vec::new();
        };
        table
            .iter()
            .filter(|e| e.is_active() && now - e.timestamp() > max_age)
            .filter(|e| match reroll {
                Some(policy) if policy.is_reroll(e.value(), now) => {
                    let held = policy.holds(e.value(), now);
                    if held {
                        trace!(shard, granularity = %granularity, slot = *e.key(), "delaying re-roll");
                    }
                    !held
                }
                _ => true,
            })
            .map(|e| (*e.key(), e.timestamp()))
            .collect()
    }

    /// Marks `key` rolled at `now`. When `claimed` is set the roll only
    /// applies if the stamp is active and still at that generation, so any
    /// data that arrived during the rollup keeps the slot active, even data
    /// older than the slot's newest sample.
    pub fn roll(&self, key: &SlotKey, claimed: Option<u64>, now: i64) -> Option<UpdateStamp> {
        let table = self.table(key.shard(), key.granularity())?;
        let mut stamp = table.get_mut(&key.slot())?;
        if let Some(generation) = claimed {
            if stamp.generation() != generation || !stamp.is_active() {
                return None;
            }
        }
        stamp.roll(now);
        Some(*stamp)
    }

    /// Reactivates every coarser slot covering `key` that is missing or
    /// already rolled, so a re-rolled child is always followed by its
    /// parents. Returns the keys that changed.
    pub fn activate_coarser(&self, key: &SlotKey, now: i64) -> Vec<SlotKey> {
        let mut changed = Vec::new();
        let mut current = *key;
        while let Some(parent) = current.parent() {
            if let Some(table) = self.table(parent.shard(), parent.granularity()) {
                match table.entry(parent.slot()) {
                    Entry::Vacant(v) => {
                        v.insert(UpdateStamp::new(now, StampState::Active, true));
                        changed.push(parent);
                    }
                    Entry::Occupied(mut o) => {
                        if !o.get().is_active() {
                            o.get_mut().activate(now);
                            changed.push(parent);
                        }
                    }
                }
            }
            current = parent;
        }
        changed
    }
}

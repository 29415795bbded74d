pub mod poller;
pub mod shard_state;
pub mod stamp;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::granularity::shard::NUMBER_OF_SHARDS;
use crate::granularity::{Granularity, SlotKey};

pub use self::shard_state::{DirtyStamp, RerollPolicy, ShardStateManager};
pub use self::stamp::{StampState, UpdateStamp};

/// How long a shard stays in the recently-scheduled set.
const RECENTLY_SCHEDULED_TTL_MILLIS: i64 = 10 * 60 * 1000;

/// Queue position. Lower sorts first.
type QueuePos = (i64, i64);

/// Ready queue plus in-flight claims. Guarded by one mutex so that claiming
/// a key is atomic with respect to scheduling and descheduling.
#[derive(Debug, Default)]
struct ScheduleQueue {
    /// Scheduled keys ordered by stamp age, FIFO among equal ages.
    ordered: BTreeMap<QueuePos, SlotKey>,
    /// Index of `ordered` by key.
    scheduled: HashMap<SlotKey, QueuePos>,
    /// Claimed keys and the stamp generation seen at claim time.
    running: HashMap<SlotKey, Option<u64>>,
    seq: i64,
}

impl ScheduleQueue {
    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn insert(&mut self, key: SlotKey, pos: QueuePos) {
        self.ordered.insert(pos, key);
        self.scheduled.insert(key, pos);
    }

    fn remove(&mut self, key: &SlotKey) -> bool {
        match self.scheduled.remove(key) {
            Some(pos) => {
                self.ordered.remove(&pos);
                true
            }
            None => false,
        }
    }

    fn pop(&mut self) -> Option<SlotKey> {
        let (_, key) = self.ordered.pop_first()?;
        self.scheduled.remove(&key);
        Some(key)
    }

    fn is_busy(&self, key: &SlotKey) -> bool {
        self.scheduled.contains_key(key) || self.running.contains_key(key)
    }

    /// A key is blocked while it, or any finer key it covers, is scheduled
    /// or running. Parents always wait for their children.
    fn is_blocked(&self, key: &SlotKey) -> bool {
        self.is_busy(key) || key.children_keys().iter().any(|child| self.is_busy(child))
    }
}

/// Scheduling API over a [`ShardStateManager`], consumed by the rollup
/// executor.
///
/// Ingest marks slots dirty through [`ScheduleContext::update`]; the executor
/// turns stale dirty slots into work with
/// [`ScheduleContext::schedule_slots_older_than`], claims keys with
/// [`ScheduleContext::get_next_scheduled`] and reports back with
/// [`ScheduleContext::mark_rolled`] and [`ScheduleContext::clear_from_running`].
///
/// Claims carry no lease: a key claimed by an executor that never reports
/// back stays running until the process restarts.
pub struct ScheduleContext {
    state: ShardStateManager,
    clock: Arc<dyn Clock>,
    reroll: Option<RerollPolicy>,
    queue: Mutex<ScheduleQueue>,
    recently_scheduled: Mutex<HashMap<u32, i64>>,
    scan_offset: AtomicUsize,
}

impl std::fmt::Debug for ScheduleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("ScheduleContext")
            .field("state", &self.state)
            .field("scheduled", &queue.scheduled.len())
            .field("running", &queue.running.len())
            .finish()
    }
}

impl ScheduleContext {
    pub fn new(managed_shards: impl IntoIterator<Item = u32>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: ShardStateManager::new(managed_shards),
            clock,
            reroll: None,
            queue: Mutex::new(ScheduleQueue::default()),
            recently_scheduled: Mutex::new(HashMap::new()),
            scan_offset: AtomicUsize::new(0),
        }
    }

    /// Holds back re-rolls of recently rolled slots according to `policy`.
    pub fn with_reroll_policy(mut self, policy: RerollPolicy) -> Self {
        self.reroll = Some(policy);
        self
    }

    /// The underlying stamp table, shared with the sync workers.
    pub fn shard_state(&self) -> &ShardStateManager {
        &self.state
    }

    pub fn current_time_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Records new data collected at `millis` for `shard`: the slot covering
    /// `millis` becomes active on every rollup tier. A pending (unclaimed)
    /// schedule for that slot is withdrawn so it waits for the data to settle.
    pub fn update(&self, millis: i64, shard: u32) {
        if shard >= NUMBER_OF_SHARDS {
            warn!(shard, "ignoring update for out of range shard");
            return;
        }

        let now = self.clock.now_millis();
        let managed = self.state.contains(shard);
        for g in Granularity::ROLLUP {
            let slot = g.slot(millis);
            if !managed {
                self.state.create_or_update(g, shard, slot, millis, now);
                continue;
            }
            // Stamp and deschedule under one queue lock so a concurrent scan
            // never requeues the slot from its previous stamp.
            let key = SlotKey::from_parts(g, slot, shard);
            let mut queue = self.queue.lock();
            self.state.create_or_update(g, shard, slot, millis, now);
            if queue.remove(&key) {
                debug!(slot = %key, "descheduled");
            }
        }
        trace!(shard, millis, "slot updated");
    }

    /// Queues every active slot of a managed shard whose stamp is older than
    /// `max_age_millis` and which is not blocked by itself or a finer key
    /// being scheduled or running. Returns the number of keys queued.
    pub fn schedule_slots_older_than(&self, max_age_millis: i64) -> usize {
        let now = self.clock.now_millis();
        let mut shards = self.state.managed_shards();
        if shards.is_empty() {
            return 0;
        }
        // Rotate the scan start so no shard is consistently served last.
        let offset = self.scan_offset.fetch_add(1, Ordering::Relaxed) % shards.len();
        shards.rotate_left(offset);

        let mut queued = 0;
        let mut touched = Vec::new();
        {
            let mut queue = self.queue.lock();
            for shard in shards {
                let mut shard_queued = false;
                for g in Granularity::ROLLUP {
                    let eligible =
                        self.state
                            .eligible_slots(shard, g, now, max_age_millis, self.reroll.as_ref());
                    for (slot, timestamp) in eligible {
                        let key = SlotKey::from_parts(g, slot, shard);
                        if queue.is_blocked(&key) {
                            continue;
                        }
                        let seq = queue.next_seq();
                        queue.insert(key, (timestamp, seq));
                        queued += 1;
                        shard_queued = true;
                    }
                }
                if shard_queued {
                    touched.push(shard);
                }
            }
        }

        if !touched.is_empty() {
            let mut recent = self.recently_scheduled.lock();
            for shard in touched {
                recent.insert(shard, now);
            }
        }

        if queued > 0 {
            debug!(queued, max_age_millis, "scheduled slots");
        }
        queued
    }

    /// Claims the stalest scheduled key. Keys of shards no longer managed are
    /// dropped. Returns `None` when nothing is scheduled.
    pub fn get_next_scheduled(&self) -> Option<SlotKey> {
        let mut queue = self.queue.lock();
        while let Some(key) = queue.pop() {
            if !self.state.contains(key.shard()) {
                debug!(slot = %key, "shard no longer managed, dropping scheduled slot");
                continue;
            }
            let claimed = self.state.get_stamp(&key).map(|s| s.generation());
            queue.running.insert(key, claimed);
            return Some(key);
        }
        None
    }

    /// Releases the claim on `key`. Does not change the slot's stamp.
    pub fn clear_from_running(&self, key: &SlotKey) -> bool {
        self.queue.lock().running.remove(key).is_some()
    }

    /// Completion callback: the executor persisted a rollup for `key`.
    ///
    /// The stamp becomes rolled with a timestamp of at least now, unless any
    /// data reached the slot after it was claimed, however old its collection
    /// time, in which case it stays active and is scheduled again later. Coarser slots covering `key` are
    /// reactivated if they were already rolled. Returns true if rolled.
    pub fn mark_rolled(&self, key: &SlotKey) -> bool {
        let claimed = self.queue.lock().running.get(key).copied().flatten();
        let now = self.clock.now_millis();

        match self.state.roll(key, claimed, now) {
            Some(stamp) => {
                let reactivated = self.state.activate_coarser(key, now);
                if !reactivated.is_empty() {
                    debug!(
                        slot = %key,
                        parents = reactivated.len(),
                        "coarser slots reactivated after child rollup",
                    );
                }
                trace!(slot = %key, timestamp = stamp.timestamp(), "slot rolled");
                true
            }
            None => {
                debug!(slot = %key, "slot changed during rollup, leaving it active");
                false
            }
        }
    }

    /// Failure path: releases the claim and queues `key` again, at the head
    /// of the queue when `immediately` is set, otherwise at the tail.
    pub fn push_back_to_scheduled(&self, key: SlotKey, immediately: bool) {
        let mut queue = self.queue.lock();
        queue.running.remove(&key);
        if queue.scheduled.contains_key(&key) {
            return;
        }
        let seq = queue.next_seq();
        let pos = if immediately {
            (i64::MIN, -seq)
        } else {
            (i64::MAX, seq)
        };
        queue.insert(key, pos);
        debug!(slot = %key, immediately, "pushed back to scheduled");
    }

    /// Snapshot of one (granularity, shard) table. Empty for `Full`.
    pub fn get_slot_stamps(&self, granularity: Granularity, shard: u32) -> BTreeMap<u32, UpdateStamp> {
        self.state.slot_stamps(granularity, shard)
    }

    pub fn scheduled_count(&self) -> usize {
        self.queue.lock().scheduled.len()
    }

    pub fn running_count(&self) -> usize {
        self.queue.lock().running.len()
    }

    pub fn has_scheduled(&self) -> bool {
        self.scheduled_count() > 0
    }

    pub fn is_scheduled(&self, key: &SlotKey) -> bool {
        self.queue.lock().scheduled.contains_key(key)
    }

    pub fn is_running(&self, key: &SlotKey) -> bool {
        self.queue.lock().running.contains_key(key)
    }

    /// Starts scheduling rollups for `shard`.
    pub fn add_shard(&self, shard: u32) -> bool {
        self.state.add_shard(shard)
    }

    /// Stops scheduling rollups for `shard`. Keys already queued are dropped
    /// when they come up; running keys finish normally.
    pub fn remove_shard(&self, shard: u32) -> bool {
        self.state.remove_shard(shard)
    }

    pub fn managed_shards(&self) -> Vec<u32> {
        self.state.managed_shards()
    }

    /// Shards that had slots scheduled in the last ten minutes.
    pub fn recently_scheduled_shards(&self) -> Vec<u32> {
        let now = self.clock.now_millis();
        let mut recent = self.recently_scheduled.lock();
        recent.retain(|_, at| now - *at <= RECENTLY_SCHEDULED_TTL_MILLIS);
        let mut shards: Vec<u32> = recent.keys().copied().collect();
        shards.sort_unstable();
        shards
    }

    /// Human readable state of one slot, for diagnostics. Empty when the
    /// granularity is unknown or the slot has no stamp.
    pub fn metrics_state(&self, shard: u32, granularity: &str, slot: u32) -> Vec<String> {
        let Some(g) = Granularity::from_name(granularity) else {
            return Vec::new();
        };
        self.get_slot_stamps(g, shard)
            .get(&slot)
            .map(|stamp| {
                vec![format!(
                    "{},{},{}: {}",
                    g.name(),
                    slot,
                    stamp.state().code(),
                    stamp.timestamp()
                )]
            })
            .unwrap_or_default()
    }

    /// Keys currently scheduled or running, for diagnostics.
    pub fn in_flight(&self) -> HashSet<SlotKey> {
        let queue = self.queue.lock();
        queue
            .scheduled
            .keys()
            .chain(queue.running.keys())
            .copied()
            .collect()
    }
}

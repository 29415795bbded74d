use std::fmt;

/// Rollup state of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StampState {
    /// New data landed; the slot needs a rollup.
    Active,
    /// The executor persisted a rollup for the slot.
    Rolled,
}

impl StampState {
    /// Single-letter code used in persisted slot-state records.
    pub fn code(self) -> &'static str {
        match self {
            Self::Active => "A",
            Self::Rolled => "X",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Active),
            "X" => Some(Self::Rolled),
            _ => None,
        }
    }
}

impl fmt::Display for StampState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Last-change marker of one (shard, granularity, slot).
///
/// `dirty` marks a local change that has not been pushed to the shared store
/// yet. The remaining fields are local bookkeeping as well: `generation`
/// counts every change so a claim can tell whether the slot was touched while
/// it ran, and the rollup and ingest times drive the re-roll delays. None of
/// them take part in equality or are persisted.
#[derive(Debug, Clone, Copy)]
pub struct UpdateStamp {
    timestamp: i64,
    state: StampState,
    dirty: bool,
    generation: u64,
    last_rollup: i64,
    last_ingest: i64,
    ingest_delay: i64,
}

impl UpdateStamp {
    pub fn new(timestamp: i64, state: StampState, dirty: bool) -> Self {
        Self {
            timestamp,
            state,
            dirty,
            generation: 0,
            last_rollup: 0,
            last_ingest: 0,
            ingest_delay: 0,
        }
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn state(&self) -> StampState {
        self.state
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_active(&self) -> bool {
        self.state == StampState::Active
    }

    /// Number of changes applied to this stamp since it was created locally.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Time of the last rollup seen for the slot, local or remote. 0 if none.
    pub fn last_rollup(&self) -> i64 {
        self.last_rollup
    }

    /// Wall-clock time of the last local ingest into the slot. 0 if none.
    pub fn last_ingest(&self) -> i64 {
        self.last_ingest
    }

    /// How late the last ingested sample arrived, in millis.
    pub fn ingest_delay(&self) -> i64 {
        self.ingest_delay
    }

    pub(crate) fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    /// Notes that a sample collected at `millis` was ingested at `now`.
    pub(crate) fn record_ingest(&mut self, now: i64, millis: i64) {
        self.last_ingest = now;
        self.ingest_delay = (now - millis).max(0);
    }

    /// Notes a rollup performed elsewhere at `at`.
    pub(crate) fn record_rollup(&mut self, at: i64) {
        self.last_rollup = self.last_rollup.max(at);
    }

    /// Replaces the persisted part of the stamp with `remote`, keeping the
    /// local bookkeeping. The result is clean.
    pub(crate) fn merge_remote(&mut self, remote: UpdateStamp) {
        self.timestamp = remote.timestamp;
        self.state = remote.state;
        self.dirty = false;
        self.generation = self.generation.wrapping_add(1);
        if remote.state == StampState::Rolled {
            self.record_rollup(remote.timestamp);
        }
    }

    /// Records new data for the slot. The timestamp never moves backwards,
    /// and reactivating a rolled slot always moves it forward so the
    /// reactivation outranks the rolled record everywhere it is merged.
    pub(crate) fn activate(&mut self, millis: i64) {
        self.timestamp = match self.state {
            StampState::Active => self.timestamp.max(millis),
            StampState::Rolled => millis.max(self.timestamp + 1),
        };
        self.state = StampState::Active;
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Marks the slot rolled at `now`, moving the timestamp strictly forward
    /// so an older remote snapshot can never revert it.
    pub(crate) fn roll(&mut self, now: i64) {
        self.timestamp = now.max(self.timestamp + 1);
        self.state = StampState::Rolled;
        self.dirty = true;
        self.last_rollup = now;
    }
}

impl PartialEq for UpdateStamp {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp == other.timestamp && self.state == other.state
    }
}

impl Eq for UpdateStamp {}

impl fmt::Display for UpdateStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}{}",
            self.state,
            self.timestamp,
            if self.dirty { " dirty" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        assert_eq!(StampState::Active.code(), "A");
        assert_eq!(StampState::Rolled.code(), "X");
        assert_eq!(StampState::from_code("A"), Some(StampState::Active));
        assert_eq!(StampState::from_code("X"), Some(StampState::Rolled));
        assert_eq!(StampState::from_code("R"), None);
        assert_eq!(StampState::from_code(""), None);
    }

    #[test]
    fn test_activate_is_monotonic() {
        let mut stamp = UpdateStamp::new(5_000, StampState::Active, false);
        stamp.activate(4_000);
        assert_eq!(stamp.timestamp(), 5_000);
        assert!(stamp.is_dirty());
        stamp.activate(6_000);
        assert_eq!(stamp.timestamp(), 6_000);
    }

    #[test]
    fn test_roll_then_reactivate() {
        let mut stamp = UpdateStamp::new(5_000, StampState::Active, false);
        stamp.roll(5_000);
        assert_eq!(stamp.state(), StampState::Rolled);
        assert_eq!(stamp.timestamp(), 5_001);

        // Late data with an older collection time still reactivates.
        stamp.set_dirty(false);
        stamp.activate(1_000);
        assert_eq!(stamp.state(), StampState::Active);
        assert_eq!(stamp.timestamp(), 5_002);
        assert!(stamp.is_dirty());
    }

    #[test]
    fn test_every_activation_bumps_generation() {
        let mut stamp = UpdateStamp::new(5_000, StampState::Active, false);
        let before = stamp.generation();

        // An older sample leaves the timestamp alone but still counts.
        stamp.activate(4_000);
        assert_eq!(stamp.timestamp(), 5_000);
        assert_eq!(stamp.generation(), before + 1);

        stamp.roll(6_000);
        assert_eq!(stamp.generation(), before + 1);
        assert_eq!(stamp.last_rollup(), 6_000);
    }

    #[test]
    fn test_merge_remote_keeps_bookkeeping() {
        let mut stamp = UpdateStamp::new(5_000, StampState::Active, true);
        stamp.record_ingest(9_000, 5_000);
        stamp.merge_remote(UpdateStamp::new(7_000, StampState::Rolled, true));

        assert_eq!(stamp.state(), StampState::Rolled);
        assert_eq!(stamp.timestamp(), 7_000);
        assert!(!stamp.is_dirty());
        assert_eq!(stamp.generation(), 1);
        assert_eq!(stamp.last_rollup(), 7_000);
        assert_eq!(stamp.last_ingest(), 9_000);
        assert_eq!(stamp.ingest_delay(), 4_000);
    }

    #[test]
    fn test_equality_ignores_dirty() {
        let a = UpdateStamp::new(10, StampState::Rolled, true);
        let b = UpdateStamp::new(10, StampState::Rolled, false);
        assert_eq!(a, b);
        assert_ne!(a, UpdateStamp::new(10, StampState::Active, true));
        assert_ne!(a, UpdateStamp::new(11, StampState::Rolled, true));

        let mut touched = b;
        touched.record_rollup(10);
        touched.record_ingest(20, 10);
        assert_eq!(touched, b);
    }
}

pub mod shard;
pub mod slot_key;

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

pub use self::slot_key::{SlotKey, SlotKeyError};

/// Number of full-resolution slots in one revolution of the wheel.
pub const BASE_SLOTS: u32 = 4032;

/// Width of a full-resolution slot in milliseconds.
pub const MILLIS_PER_FULL_SLOT: i64 = 300_000;

/// Length of one wheel revolution (~14 days). Slot numbers recur with this
/// period, so a slot is only meaningful next to a nearby reference time.
pub const WHEEL_PERIOD_MILLIS: i64 = BASE_SLOTS as i64 * MILLIS_PER_FULL_SLOT;

/// Errors raised by granularity traversal and selection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GranularityError {
    #[error("nothing coarser than {0}")]
    NothingCoarser(Granularity),

    #[error("nothing finer than {0}")]
    NothingFiner(Granularity),

    #[error("invalid interval: from ({from}) must be before to ({to})")]
    InvalidInterval { from: i64, to: i64 },
}

/// Immutable description of a resolution tier.
struct Tier {
    name: &'static str,
    short_name: &'static str,
    millis_per_slot: i64,
    slot_count: u32,
}

static TIERS: [Tier; 6] = [
    Tier {
        name: "metrics_full",
        short_name: "full",
        millis_per_slot: 300_000,
        slot_count: 4032,
    },
    Tier {
        name: "metrics_5m",
        short_name: "5m",
        millis_per_slot: 300_000,
        slot_count: 4032,
    },
    Tier {
        name: "metrics_20m",
        short_name: "20m",
        millis_per_slot: 1_200_000,
        slot_count: 1008,
    },
    Tier {
        name: "metrics_60m",
        short_name: "60m",
        millis_per_slot: 3_600_000,
        slot_count: 336,
    },
    Tier {
        name: "metrics_240m",
        short_name: "240m",
        millis_per_slot: 14_400_000,
        slot_count: 84,
    },
    Tier {
        name: "metrics_1440m",
        short_name: "1440m",
        millis_per_slot: 86_400_000,
        slot_count: 14,
    },
];

/// One of the six resolution tiers, ordered finest to coarsest.
///
/// `Full` is raw resolution. It shares slot math with `Min5` but is never
/// itself the target of a rollup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Granularity {
    Full = 0,
    Min5 = 1,
    Min20 = 2,
    Min60 = 3,
    Min240 = 4,
    Min1440 = 5,
}

/// Inclusive millisecond interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Range {
    pub start: i64,
    pub stop: i64,
}

impl Range {
    pub fn new(start: i64, stop: i64) -> Self {
        Self { start, stop }
    }

    /// Returns true if `t` falls inside the range.
    pub fn contains(&self, t: i64) -> bool {
        t >= self.start && t <= self.stop
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} ({})", self.start, self.stop, self.stop - self.start)
    }
}

impl Granularity {
    /// Every tier, finest first.
    pub const ALL: [Granularity; 6] = [
        Granularity::Full,
        Granularity::Min5,
        Granularity::Min20,
        Granularity::Min60,
        Granularity::Min240,
        Granularity::Min1440,
    ];

    /// Tiers that are targets of rollups, finest first.
    pub const ROLLUP: [Granularity; 5] = [
        Granularity::Min5,
        Granularity::Min20,
        Granularity::Min60,
        Granularity::Min240,
        Granularity::Min1440,
    ];

    fn tier(self) -> &'static Tier {
        &TIERS[self as usize]
    }

    /// Position in the finest-to-coarsest ordering.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Storage name, e.g. `metrics_5m`.
    pub fn name(self) -> &'static str {
        self.tier().name
    }

    /// Short name, e.g. `5m`.
    pub fn short_name(self) -> &'static str {
        self.tier().short_name
    }

    pub fn millis_per_slot(self) -> i64 {
        self.tier().millis_per_slot
    }

    pub fn slot_count(self) -> u32 {
        self.tier().slot_count
    }

    /// Resolves a granularity from its storage name or short name.
    pub fn from_name(s: &str) -> Option<Granularity> {
        Self::ALL
            .iter()
            .copied()
            .find(|g| g.name() == s || g.short_name() == s)
    }

    /// The next coarser tier.
    pub fn coarser(self) -> Result<Granularity, GranularityError> {
        Self::ALL
            .get(self.index() + 1)
            .copied()
            .ok_or(GranularityError::NothingCoarser(self))
    }

    /// The next finer tier.
    pub fn finer(self) -> Result<Granularity, GranularityError> {
        self.index()
            .checked_sub(1)
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(GranularityError::NothingFiner(self))
    }

    pub fn is_coarser(self, other: Granularity) -> bool {
        self.index() > other.index()
    }

    /// Floors `millis` to the start of its slot. Identity at `Full`.
    pub fn snap_millis(self, millis: i64) -> i64 {
        if self == Granularity::Full {
            return millis;
        }
        millis - millis.rem_euclid(self.millis_per_slot())
    }

    /// Slot index of `millis` on this tier's wheel.
    pub fn slot(self, millis: i64) -> u32 {
        let full_slot = millis.rem_euclid(WHEEL_PERIOD_MILLIS) / MILLIS_PER_FULL_SLOT;
        // full_slot < BASE_SLOTS, so the product fits in i64 and the result in u32.
        (self.slot_count() as i64 * full_slot / BASE_SLOTS as i64) as u32
    }

    /// Maps a slot of the next finer tier onto this tier.
    pub fn slot_from_finer_slot(self, finer_slot: u32) -> Result<u32, GranularityError> {
        let finer = self.finer()?;
        Ok(finer_slot * self.slot_count() / finer.slot_count())
    }

    /// Reconstructs the time range of `slot` nearest at or before
    /// `reference_millis`. A slot numerically ahead of the reference's slot is
    /// taken from the previous wheel revolution.
    pub fn derive_range(self, slot: u32, reference_millis: i64) -> Range {
        let reference = self.snap_millis(reference_millis);
        let ref_slot = self.slot(reference);
        let slot_diff = if slot > ref_slot {
            self.slot_count() - slot + ref_slot
        } else {
            ref_slot - slot
        };
        let start = reference - slot_diff as i64 * self.millis_per_slot();
        Range::new(start, start + self.millis_per_slot() - 1)
    }

    /// Every finer-tier slot key covered by `slot`, all the way down to
    /// `Full`. Empty for `Full`.
    pub fn children_keys(self, slot: u32, shard: u32) -> Vec<SlotKey> {
        let mut keys = Vec::new();
        self.collect_children(slot, shard, &mut keys);
        keys
    }

    fn collect_children(self, slot: u32, shard: u32, out: &mut Vec<SlotKey>) {
        let Ok(finer) = self.finer() else {
            return;
        };
        let factor = finer.slot_count() / self.slot_count();
        for i in 0..factor {
            let child = slot * factor + i;
            out.push(SlotKey::from_parts(finer, child, shard));
            finer.collect_children(child, shard, out);
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How a read request's point count is mapped to a tier.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionAlgorithm {
    /// Smallest ratio between requested and provided points, whichever way
    /// round. Too many points is as bad as too few by the same factor.
    #[default]
    Geometric,
    /// Smallest absolute difference in point count.
    Linear,
    /// The linear pick, made coarser once if it would return more points
    /// than requested.
    LessThanEqual,
}

/// Picks a tier for roughly `points` data points over `[from, to)`.
/// `assumed_full_interval_millis` stands in for the raw sample interval.
/// Ties keep the finer tier.
pub fn granularity_from_points_in_interval(
    from: i64,
    to: i64,
    points: u32,
    assumed_full_interval_millis: i64,
    selection: SelectionAlgorithm,
) -> Result<Granularity, GranularityError> {
    if from >= to {
        return Err(GranularityError::InvalidInterval { from, to });
    }

    let duration = (to - from) as f64;
    let wanted = f64::from(points);
    let provided = |g: Granularity| {
        let interval = if g == Granularity::Full {
            assumed_full_interval_millis.max(1)
        } else {
            g.millis_per_slot()
        };
        duration / interval as f64
    };

    let g = match selection {
        SelectionAlgorithm::Geometric => geometric(wanted, provided),
        SelectionAlgorithm::Linear => linear(wanted, provided),
        SelectionAlgorithm::LessThanEqual => {
            let g = linear(wanted, &provided);
            if provided(g) > wanted {
                g.coarser().unwrap_or(g)
            } else {
                g
            }
        }
    };
    Ok(g)
}

fn linear(wanted: f64, provided: impl Fn(Granularity) -> f64) -> Granularity {
    let mut best = Granularity::Full;
    let mut closest = f64::MAX;
    for g in Granularity::ALL {
        let diff = (provided(g) - wanted).abs();
        if diff < closest {
            closest = diff;
            best = g;
        }
    }
    best
}

fn geometric(wanted: f64, provided: impl Fn(Granularity) -> f64) -> Granularity {
    let mut best = None;
    let mut smallest = f64::MAX;
    for g in Granularity::ALL {
        let points = provided(g);
        let ratio = if points > wanted {
            points / wanted
        } else {
            wanted / points
        };
        // Ratios fall until the best tier and rise after it.
        if ratio < smallest {
            smallest = ratio;
            best = Some(g);
        } else {
            break;
        }
    }
    // Zero points requested makes every ratio infinite.
    best.unwrap_or(Granularity::Min1440)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn test_tiers_divide_base() {
        for g in Granularity::ALL {
            assert_eq!(BASE_SLOTS % g.slot_count(), 0, "{g}");
            assert_eq!(
                g.millis_per_slot() * i64::from(g.slot_count()),
                WHEEL_PERIOD_MILLIS,
                "{g}"
            );
        }
    }

    #[test]
    fn test_coarser_finer_round_trip() {
        for g in &Granularity::ALL[1..5] {
            assert_eq!(g.coarser().expect("coarser").finer().expect("finer"), *g);
            assert_eq!(g.finer().expect("finer").coarser().expect("coarser"), *g);
        }
    }

    #[test]
    fn test_traversal_boundaries() {
        assert_eq!(
            Granularity::Min1440.coarser(),
            Err(GranularityError::NothingCoarser(Granularity::Min1440))
        );
        assert_eq!(
            Granularity::Full.finer(),
            Err(GranularityError::NothingFiner(Granularity::Full))
        );
    }

    #[test]
    fn test_is_coarser() {
        assert!(Granularity::Min20.is_coarser(Granularity::Min5));
        assert!(!Granularity::Min5.is_coarser(Granularity::Min5));
        assert!(!Granularity::Full.is_coarser(Granularity::Min1440));
    }

    #[test]
    fn test_snap_millis() {
        assert_eq!(Granularity::Full.snap_millis(1_234_567), 1_234_567);
        assert_eq!(Granularity::Min5.snap_millis(1_234_567), 1_200_000);
        assert_eq!(Granularity::Min60.snap_millis(3_599_999), 0);
        assert_eq!(Granularity::Min60.snap_millis(3_600_000), 3_600_000);
    }

    #[test]
    fn test_slot_values() {
        assert_eq!(Granularity::Min5.slot(0), 0);
        assert_eq!(Granularity::Min5.slot(1_234_000), 4);
        assert_eq!(Granularity::Min20.slot(1_234_000), 1);
        assert_eq!(Granularity::Min5.slot(WHEEL_PERIOD_MILLIS - 1), 4031);
        assert_eq!(Granularity::Min1440.slot(WHEEL_PERIOD_MILLIS - 1), 13);
        // The wheel wraps.
        assert_eq!(Granularity::Min5.slot(WHEEL_PERIOD_MILLIS + 600_000), 2);
    }

    #[test]
    fn test_slot_from_finer_slot() {
        assert_eq!(Granularity::Min20.slot_from_finer_slot(7), Ok(1));
        assert_eq!(Granularity::Min1440.slot_from_finer_slot(83), Ok(13));
        assert!(Granularity::Full.slot_from_finer_slot(0).is_err());
    }

    #[test]
    fn test_derive_range_round_trip() {
        let references = [0, 1_234_000, 1_386_823_200_000, WHEEL_PERIOD_MILLIS * 3 + 17];
        for g in Granularity::ALL {
            for reference in references {
                for slot in 0..g.slot_count() {
                    let range = g.derive_range(slot, reference);
                    assert_eq!(g.slot(range.start), slot, "{g} slot {slot} ref {reference}");
                    assert_eq!(range.stop - range.start, g.millis_per_slot() - 1);
                    assert!(range.start <= g.snap_millis(reference));
                    assert!(g.snap_millis(reference) - range.start < WHEEL_PERIOD_MILLIS);
                }
            }
        }
    }

    #[test]
    fn test_derive_range_wraps_to_previous_revolution() {
        let reference = WHEEL_PERIOD_MILLIS + 600_000; // slot 2 of the second revolution
        let range = Granularity::Min5.derive_range(4000, reference);
        assert_eq!(range.start, 4000 * MILLIS_PER_FULL_SLOT);

        let range = Granularity::Min5.derive_range(1, reference);
        assert_eq!(range.start, WHEEL_PERIOD_MILLIS + 300_000);
    }

    #[test]
    fn test_from_points_selects_full_for_one_day() {
        let g = granularity_from_points_in_interval(0, DAY, 1440, 60_000, SelectionAlgorithm::Linear)
            .expect("valid");
        assert_eq!(g, Granularity::Full);
    }

    #[test]
    fn test_from_points_selects_coarser_tiers() {
        let week = 7 * DAY;
        assert_eq!(
            granularity_from_points_in_interval(0, DAY, 288, 60_000, SelectionAlgorithm::Linear),
            Ok(Granularity::Min5)
        );
        assert_eq!(
            granularity_from_points_in_interval(0, week, 168, 60_000, SelectionAlgorithm::Linear),
            Ok(Granularity::Min60)
        );
        assert_eq!(
            granularity_from_points_in_interval(0, week, 7, 60_000, SelectionAlgorithm::Linear),
            Ok(Granularity::Min1440)
        );
    }

    #[test]
    fn test_from_points_ties_favor_finer() {
        // With a 5m assumed raw interval, Full and Min5 are equally close.
        assert_eq!(
            granularity_from_points_in_interval(0, DAY, 288, 300_000, SelectionAlgorithm::Linear),
            Ok(Granularity::Full)
        );
    }

    #[test]
    fn test_from_points_rejects_empty_interval() {
        assert_eq!(
            granularity_from_points_in_interval(10, 10, 100, 60_000, SelectionAlgorithm::Linear),
            Err(GranularityError::InvalidInterval { from: 10, to: 10 })
        );
    }

    #[test]
    fn test_geometric_prefers_more_points() {
        // 800 wanted: 1440 is 1.8x too many, 288 is 2.8x too few.
        assert_eq!(
            granularity_from_points_in_interval(0, DAY, 800, 60_000, SelectionAlgorithm::Linear),
            Ok(Granularity::Min5)
        );
        assert_eq!(
            granularity_from_points_in_interval(0, DAY, 800, 60_000, SelectionAlgorithm::Geometric),
            Ok(Granularity::Full)
        );
        assert_eq!(
            granularity_from_points_in_interval(0, DAY, 24, 60_000, SelectionAlgorithm::Geometric),
            Ok(Granularity::Min60)
        );
        assert_eq!(
            granularity_from_points_in_interval(0, DAY, 0, 60_000, SelectionAlgorithm::Geometric),
            Ok(Granularity::Min1440)
        );
    }

    #[test]
    fn test_less_than_equal_never_exceeds_points() {
        let select = |points| {
            granularity_from_points_in_interval(
                0,
                DAY,
                points,
                60_000,
                SelectionAlgorithm::LessThanEqual,
            )
        };
        assert_eq!(select(1000), Ok(Granularity::Min5));
        assert_eq!(select(288), Ok(Granularity::Min5));
        assert_eq!(select(1440), Ok(Granularity::Full));
        assert_eq!(select(1), Ok(Granularity::Min1440));
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Granularity::from_name("metrics_60m"), Some(Granularity::Min60));
        assert_eq!(Granularity::from_name("240m"), Some(Granularity::Min240));
        assert_eq!(Granularity::from_name("full"), Some(Granularity::Full));
        assert_eq!(Granularity::from_name("metrics_7m"), None);
        assert_eq!(Granularity::from_name(""), None);
    }

    #[test]
    fn test_children_keys() {
        assert!(Granularity::Full.children_keys(10, 1).is_empty());

        let five = Granularity::Min5.children_keys(10, 1);
        assert_eq!(five, vec![SlotKey::from_parts(Granularity::Full, 10, 1)]);

        let twenty = Granularity::Min20.children_keys(1, 3);
        assert_eq!(twenty.len(), 8);
        assert!(twenty.contains(&SlotKey::from_parts(Granularity::Min5, 4, 3)));
        assert!(twenty.contains(&SlotKey::from_parts(Granularity::Min5, 7, 3)));
        assert!(twenty.contains(&SlotKey::from_parts(Granularity::Full, 7, 3)));
        assert!(twenty.iter().all(|k| k.shard() == 3));

        let daily = Granularity::Min1440.children_keys(3, 0);
        assert_eq!(daily.len(), 6 + 24 + 72 + 288 + 288);
        let coarse: Vec<u32> = daily
            .iter()
            .filter(|k| k.granularity() == Granularity::Min240)
            .map(|k| k.slot())
            .collect();
        assert_eq!(coarse, (18..24).collect::<Vec<u32>>());
    }
}

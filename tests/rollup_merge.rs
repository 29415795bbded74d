use std::collections::BTreeMap;

use rollwheel::granularity::Granularity;
use rollwheel::rollup::{Numeric, Rollup};

const MINUTE: i64 = 60_000;
const EPSILON: f64 = 1e-6;

/// Deterministic pseudo-random values.
fn values(n: usize, seed: u64) -> Vec<i64> {
    let mut state = seed;
    (0..n)
        .map(|_| {
            state = state
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            ((state >> 33) % 10_000) as i64 - 5_000
        })
        .collect()
}

fn assert_close(a: &Rollup, b: &Rollup) {
    assert_eq!(a.count(), b.count());
    assert_eq!(a.min(), b.min());
    assert_eq!(a.max(), b.max());
    let (ma, mb) = (a.mean().expect("mean"), b.mean().expect("mean"));
    assert!((ma - mb).abs() < EPSILON, "mean {ma} vs {mb}");
    let (va, vb) = (a.variance().expect("variance"), b.variance().expect("variance"));
    assert!((va - vb).abs() <= EPSILON * va.abs().max(1.0), "variance {va} vs {vb}");
}

#[test]
fn test_partitions_merge_to_flat_build() {
    let samples = values(500, 7);
    let flat = Rollup::from_samples(samples.iter().copied());

    for split in [1, 13, 250, 499] {
        let (a, b) = samples.split_at(split);
        let mut merged = Rollup::from_samples(a.iter().copied());
        merged.merge_rollup(&Rollup::from_samples(b.iter().copied()));
        assert_close(&merged, &flat);

        // Order of the partials does not matter.
        let mut reversed = Rollup::from_samples(b.iter().copied());
        reversed.merge_rollup(&Rollup::from_samples(a.iter().copied()));
        assert_close(&reversed, &flat);
    }
}

#[test]
fn test_interleaved_partition() {
    let samples = values(300, 42);
    let evens: Vec<i64> = samples.iter().copied().step_by(2).collect();
    let odds: Vec<i64> = samples.iter().copied().skip(1).step_by(2).collect();

    let parts = [Rollup::from_samples(evens), Rollup::from_samples(odds)];
    let merged = Rollup::from_rollups(parts.iter());
    assert_close(&merged, &Rollup::from_samples(samples));
}

/// One day of one-minute samples rolled tier by tier ends up equal to a
/// rollup built straight from the samples.
#[test]
fn test_tier_by_tier_rollup_of_one_day() {
    let start = 1_386_806_400_000i64; // 00:00 UTC
    let raw = values(1440, 3);
    let samples: Vec<(i64, i64)> = raw
        .iter()
        .enumerate()
        .map(|(i, v)| (start + i as i64 * MINUTE, *v))
        .collect();

    let mut by_slot: BTreeMap<u32, Rollup> = BTreeMap::new();
    for (ts, value) in &samples {
        by_slot
            .entry(Granularity::Min5.slot(*ts))
            .or_default()
            .merge_sample(Numeric::from(*value));
    }
    assert_eq!(by_slot.len(), 288);

    let mut tier = Granularity::Min5;
    while let Ok(coarser) = tier.coarser() {
        let mut next: BTreeMap<u32, Rollup> = BTreeMap::new();
        for (slot, rollup) in &by_slot {
            let parent = coarser.slot_from_finer_slot(*slot).expect("finer tier");
            next.entry(parent).or_default().merge_rollup(rollup);
        }
        by_slot = next;
        tier = coarser;
    }

    assert_eq!(tier, Granularity::Min1440);
    assert_eq!(by_slot.len(), 1);
    let day = by_slot.values().next().expect("one daily slot");
    assert_close(day, &Rollup::from_samples(raw));
}

#[test]
fn test_mixed_integral_and_floating_samples() {
    let mut rollup = Rollup::from_samples([1i64, 2, 3]);
    rollup.merge_sample(Numeric::from(4.5f64));

    assert_eq!(rollup.count(), 4);
    // One floating sample turns the extremes floating too.
    assert_eq!(rollup.min(), Some(Numeric::Double(1.0)));
    assert_eq!(rollup.max(), Some(Numeric::Double(4.5)));
    let mean = rollup.mean().expect("mean");
    assert!((mean - 2.625).abs() < EPSILON);
}

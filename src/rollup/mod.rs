pub mod stat;

use std::fmt;

pub use self::stat::{Average, MaxValue, MinValue, Numeric, RollupStat, Variance};

/// Aggregate of one slot: sample count plus average, variance, min and max.
///
/// A rollup can be built from raw samples or from finer rollups; because
/// every statistic merges associatively, both paths give the same result.
/// A rollup with `count == 0` carries no statistics and every accessor
/// returns `None`.
#[derive(Debug, Clone, Default)]
pub struct Rollup {
    count: u64,
    average: Average,
    variance: Variance,
    min: MinValue,
    max: MaxValue,
}

impl Rollup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rollup from raw samples.
    pub fn from_samples<I, V>(samples: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Numeric>,
    {
        let mut rollup = Self::new();
        for sample in samples {
            rollup.merge_sample(sample.into());
        }
        rollup
    }

    /// Builds a rollup from finer rollups.
    pub fn from_rollups<'a, I>(children: I) -> Self
    where
        I: IntoIterator<Item = &'a Rollup>,
    {
        let mut rollup = Self::new();
        for child in children {
            rollup.merge_rollup(child);
        }
        rollup
    }

    pub fn merge_sample(&mut self, value: Numeric) {
        self.count += 1;
        self.average.merge_sample(value);
        self.variance.merge_sample(value);
        self.min.merge_sample(value);
        self.max.merge_sample(value);
    }

    pub fn merge_rollup(&mut self, other: &Rollup) {
        if other.count == 0 {
            return;
        }
        self.count += other.count;
        self.average.merge_rollup(&other.average);
        self.variance.merge_rollup(&other.variance);
        self.min.merge_rollup(&other.min);
        self.max.merge_rollup(&other.max);
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn average(&self) -> Option<Numeric> {
        self.average.value()
    }

    /// Mean as a float, independent of the average's integral mode.
    pub fn mean(&self) -> Option<f64> {
        self.average.mean()
    }

    pub fn variance(&self) -> Option<f64> {
        self.variance.value().map(Numeric::as_f64)
    }

    pub fn min(&self) -> Option<Numeric> {
        self.min.value()
    }

    pub fn max(&self) -> Option<Numeric> {
        self.max.value()
    }

    pub fn average_stat(&self) -> &Average {
        &self.average
    }

    pub fn variance_stat(&self) -> &Variance {
        &self.variance
    }

    pub fn min_stat(&self) -> &MinValue {
        &self.min
    }

    pub fn max_stat(&self) -> &MaxValue {
        &self.max
    }
}

impl PartialEq for Rollup {
    fn eq(&self, other: &Self) -> bool {
        self.count == other.count
            && self.average() == other.average()
            && self.variance() == other.variance()
            && self.min() == other.min()
            && self.max() == other.max()
    }
}

impl fmt::Display for Rollup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn show(v: Option<Numeric>) -> String {
            v.map_or_else(|| "-".to_string(), |v| v.to_string())
        }

        write!(
            f,
            "cnt:{}, avg:{}, var:{}, min:{}, max:{}",
            self.count,
            show(self.average()),
            show(self.variance.value()),
            show(self.min()),
            show(self.max()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rollup_has_no_stats() {
        let rollup = Rollup::from_samples(Vec::<i64>::new());
        assert!(!rollup.has_data());
        assert_eq!(rollup.average(), None);
        assert_eq!(rollup.variance(), None);
        assert_eq!(rollup.min(), None);
        assert_eq!(rollup.max(), None);
        assert_eq!(rollup.to_string(), "cnt:0, avg:-, var:-, min:-, max:-");
    }

    #[test]
    fn test_from_samples() {
        let rollup = Rollup::from_samples([3i64, 1, 2]);
        assert_eq!(rollup.count(), 3);
        assert_eq!(rollup.average(), Some(Numeric::Long(2)));
        assert_eq!(rollup.min(), Some(Numeric::Long(1)));
        assert_eq!(rollup.max(), Some(Numeric::Long(3)));
        let variance = rollup.variance().expect("has variance");
        assert!((variance - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_merge_equals_flat_build() {
        let a = Rollup::from_samples([5i64, 9, 11, 2]);
        let b = Rollup::from_samples([7i64, 1]);
        let merged = Rollup::from_rollups([&a, &b]);
        let flat = Rollup::from_samples([5i64, 9, 11, 2, 7, 1]);

        assert_eq!(merged.count(), flat.count());
        assert_eq!(merged.average(), flat.average());
        assert_eq!(merged.mean(), flat.mean());
        assert_eq!(merged.min(), flat.min());
        assert_eq!(merged.max(), flat.max());
        let (mv, fv) = (
            merged.variance().expect("variance"),
            flat.variance().expect("variance"),
        );
        assert!((mv - fv).abs() < 1e-9, "{mv} vs {fv}");
    }

    #[test]
    fn test_merge_ignores_empty_children() {
        let a = Rollup::from_samples([1.5f64, 2.5]);
        let empty = Rollup::new();
        let merged = Rollup::from_rollups([&empty, &a, &empty]);
        assert_eq!(merged, a);
    }

    #[test]
    fn test_equality_uses_values() {
        let a = Rollup::from_samples([1i64, 2, 3]);
        let b = Rollup::from_samples([3i64, 2, 1]);
        assert_eq!(a, b);

        let c = Rollup::from_samples([1i64, 2, 4]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_floating_point_is_per_statistic() {
        let mut rollup = Rollup::from_samples([4i64, 8]);
        assert!(!rollup.average_stat().is_floating_point());
        assert!(rollup.variance_stat().is_floating_point());

        rollup.merge_sample(Numeric::Double(0.5));
        assert!(rollup.average_stat().is_floating_point());
        assert!(rollup.min_stat().is_floating_point());
        assert!(rollup.max_stat().is_floating_point());
        assert_eq!(rollup.min(), Some(Numeric::Double(0.5)));
        assert_eq!(rollup.max(), Some(Numeric::Double(8.0)));
    }
}

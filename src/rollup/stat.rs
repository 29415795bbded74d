use std::fmt;

/// A raw sample value or statistic result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Numeric {
    Long(i64),
    Double(f64),
}

impl Numeric {
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Long(v) => v as f64,
            Self::Double(v) => v,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(self, Self::Double(_))
    }
}

impl From<i64> for Numeric {
    fn from(v: i64) -> Self {
        Self::Long(v)
    }
}

impl From<i32> for Numeric {
    fn from(v: i32) -> Self {
        Self::Long(i64::from(v))
    }
}

impl From<f64> for Numeric {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
        }
    }
}

/// A statistic that can absorb raw samples and partial aggregates of its own
/// kind. Merging is associative and commutative.
pub trait RollupStat {
    /// Incorporates one raw sample.
    fn merge_sample(&mut self, value: Numeric);

    /// Incorporates an already-aggregated statistic.
    fn merge_rollup(&mut self, other: &Self);

    /// True once any floating-point input has been seen.
    fn is_floating_point(&self) -> bool;

    /// Current value, `None` when no input has been merged.
    fn value(&self) -> Option<Numeric>;
}

/// Arithmetic mean. Integral input is summed exactly; the statistic switches
/// to a running mean permanently once a floating-point value arrives.
#[derive(Debug, Clone, Default)]
pub struct Average {
    count: u64,
    sum: i128,
    mean: f64,
    floating: bool,
}

impl Average {
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean as a float regardless of mode.
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        if self.floating {
            Some(self.mean)
        } else {
            Some(self.sum as f64 / self.count as f64)
        }
    }

    fn widen(&mut self) {
        if !self.floating {
            self.mean = self.mean().unwrap_or(0.0);
            self.floating = true;
        }
    }
}

impl RollupStat for Average {
    fn merge_sample(&mut self, value: Numeric) {
        match value {
            Numeric::Long(v) if !self.floating => {
                self.sum += i128::from(v);
                self.count += 1;
            }
            _ => {
                self.widen();
                self.count += 1;
                self.mean += (value.as_f64() - self.mean) / self.count as f64;
            }
        }
    }

    fn merge_rollup(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        if !self.floating && !other.floating {
            self.sum += other.sum;
            self.count += other.count;
            return;
        }

        let other_mean = other.mean().unwrap_or(0.0);
        self.widen();
        let total = self.count + other.count;
        self.mean += (other_mean - self.mean) * other.count as f64 / total as f64;
        self.count = total;
    }

    fn is_floating_point(&self) -> bool {
        self.floating
    }

    fn value(&self) -> Option<Numeric> {
        if self.count == 0 {
            return None;
        }
        if self.floating {
            return Some(Numeric::Double(self.mean));
        }
        // Integral mode reports the truncated integer mean.
        Some(Numeric::Long((self.sum / i128::from(self.count)) as i64))
    }
}

/// Population variance via Welford's algorithm, merged with the parallel
/// variance formula. Always floating point.
#[derive(Debug, Clone, Default)]
pub struct Variance {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RollupStat for Variance {
    fn merge_sample(&mut self, value: Numeric) {
        let x = value.as_f64();
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn merge_rollup(&mut self, other: &Self) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }

        let (count_a, count_b) = (self.count as f64, other.count as f64);
        let total = self.count + other.count;
        let delta = other.mean - self.mean;
        self.mean += delta * count_b / total as f64;
        self.m2 += other.m2 + delta * delta * count_a * count_b / total as f64;
        self.count = total;
    }

    fn is_floating_point(&self) -> bool {
        true
    }

    fn value(&self) -> Option<Numeric> {
        if self.count == 0 {
            return None;
        }
        Some(Numeric::Double(self.m2 / self.count as f64))
    }
}

/// Running extreme shared by [`MinValue`] and [`MaxValue`].
#[derive(Debug, Clone, Default)]
struct Extreme {
    value: Option<Numeric>,
    floating: bool,
}

impl Extreme {
    fn offer(
        &mut self,
        candidate: Numeric,
        keep: fn(f64, f64) -> bool,
        keep_long: fn(i64, i64) -> bool,
    ) {
        if candidate.is_floating_point() && !self.floating {
            self.floating = true;
            self.value = self.value.map(|v| Numeric::Double(v.as_f64()));
        }

        let candidate = if self.floating {
            Numeric::Double(candidate.as_f64())
        } else {
            candidate
        };

        let Some(current) = self.value else {
            self.value = Some(candidate);
            return;
        };

        let replace = match (current, candidate) {
            (Numeric::Long(cur), Numeric::Long(new)) => keep_long(new, cur),
            (cur, new) => keep(new.as_f64(), cur.as_f64()),
        };
        if replace {
            self.value = Some(candidate);
        }
    }

    fn absorb(
        &mut self,
        other: &Extreme,
        keep: fn(f64, f64) -> bool,
        keep_long: fn(i64, i64) -> bool,
    ) {
        if other.floating && !self.floating {
            self.floating = true;
            self.value = self.value.map(|v| Numeric::Double(v.as_f64()));
        }
        if let Some(v) = other.value {
            self.offer(v, keep, keep_long);
        }
    }
}

/// Smallest observed value.
#[derive(Debug, Clone, Default)]
pub struct MinValue(Extreme);

impl RollupStat for MinValue {
    fn merge_sample(&mut self, value: Numeric) {
        self.0.offer(value, |new, cur| new < cur, |new, cur| new < cur);
    }

    fn merge_rollup(&mut self, other: &Self) {
        self.0.absorb(&other.0, |new, cur| new < cur, |new, cur| new < cur);
    }

    fn is_floating_point(&self) -> bool {
        self.0.floating
    }

    fn value(&self) -> Option<Numeric> {
        self.0.value
    }
}

/// Largest observed value.
#[derive(Debug, Clone, Default)]
pub struct MaxValue(Extreme);

impl RollupStat for MaxValue {
    fn merge_sample(&mut self, value: Numeric) {
        self.0.offer(value, |new, cur| new > cur, |new, cur| new > cur);
    }

    fn merge_rollup(&mut self, other: &Self) {
        self.0.absorb(&other.0, |new, cur| new > cur, |new, cur| new > cur);
    }

    fn is_floating_point(&self) -> bool {
        self.0.floating
    }

    fn value(&self) -> Option<Numeric> {
        self.0.value
    }
}

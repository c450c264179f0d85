//! Evidence accumulators attached to region boundaries.

use serde::{Deserialize, Serialize};

use crate::domain::entities::safe_divide;

/// Aggregated boundary evidence from which a merge saliency is derived.
///
/// Implementations must be mergeable: when two regions contract, the stats of
/// their boundaries with a common neighbour are combined with [`absorb`].
///
/// [`absorb`]: BoundaryStat::absorb
pub trait BoundaryStat: Clone + Send + Sync + std::fmt::Debug {
    /// Record one evidence sample.
    fn push(&mut self, value: f64);
    /// Fold another accumulator for the same boundary into this one.
    fn absorb(&mut self, other: Self);
    /// Scalar priority; lower merges first.
    fn saliency(&self) -> f64;
    /// Number of samples seen (not necessarily retained).
    fn count(&self) -> usize;
}

/// Running sum and count; saliency is the mean (0.0 when empty).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MeanStat {
    pub sum: f64,
    pub count: usize,
}

impl BoundaryStat for MeanStat {
    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn absorb(&mut self, other: Self) {
        self.sum += other.sum;
        self.count += other.count;
    }

    fn saliency(&self) -> f64 {
        safe_divide(self.sum, self.count as f64, 0.0)
    }

    fn count(&self) -> usize {
        self.count
    }
}

/// Default number of samples kept per boundary by [`MedianStat`].
pub const DEFAULT_RESERVOIR_CAPACITY: usize = 256;

/// Bounded sample reservoir; saliency is the median of the retained samples.
///
/// While every sample fits the median is exact. Past capacity the reservoir
/// is thinned deterministically to evenly spaced order statistics, which keeps
/// the median approximately in place and the output reproducible.
#[derive(Debug, Clone, PartialEq)]
pub struct MedianStat {
    samples: Vec<f64>,
    capacity: usize,
    seen: usize,
}

impl MedianStat {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::new(),
            capacity: capacity.max(1),
            seen: 0,
        }
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn is_exact(&self) -> bool {
        self.seen == self.samples.len()
    }

    fn thin(&mut self) {
        if self.samples.len() <= self.capacity {
            return;
        }
        self.samples.sort_by(f64::total_cmp);
        let n = self.samples.len();
        let keep = self.capacity;
        // midpoints of `keep` equal-width rank buckets
        let thinned = (0..keep)
            .map(|i| self.samples[((2 * i + 1) * n) / (2 * keep)])
            .collect();
        self.samples = thinned;
    }
}

impl Default for MedianStat {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_RESERVOIR_CAPACITY)
    }
}

impl BoundaryStat for MedianStat {
    fn push(&mut self, value: f64) {
        self.samples.push(value);
        self.seen += 1;
        if self.samples.len() > 2 * self.capacity {
            self.thin();
        }
    }

    fn absorb(&mut self, other: Self) {
        self.samples.extend(other.samples);
        self.seen += other.seen;
        self.capacity = self.capacity.max(other.capacity);
        self.thin();
    }

    fn saliency(&self) -> f64 {
        median(&self.samples)
    }

    fn count(&self) -> usize {
        self.seen
    }
}

/// Median of a sample set; mean of the two middle values for even sizes.
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Boundary statistic selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatKind {
    /// Approximate median of a bounded reservoir.
    Median,
    /// Arithmetic mean.
    Mean,
}

impl Default for StatKind {
    fn default() -> Self {
        StatKind::Median
    }
}

impl TryFrom<i64> for StatKind {
    type Error = String;

    /// Numeric selector: 1 = median, 2 = mean.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StatKind::Median),
            2 => Ok(StatKind::Mean),
            other => Err(format!(
                "unsupported boundary statistic type {other} (1: median, 2: mean)"
            )),
        }
    }
}

//! Exact pairwise agreement counts between a segmentation and ground truth.
//!
//! Pair counts grow quadratically with region size, so all counters are
//! `u128`. A region of 2^32 cells still fits.

use std::collections::HashMap;
use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::domain::entities::{safe_divide, Label, LabeledImage, Mask, BACKGROUND};
use crate::domain::error::DomainResult;
use crate::domain::region_map::Region;

/// Truth label → number of region cells carrying it.
pub type TruthHistogram = HashMap<Label, u64>;

/// Same-cluster / different-cluster point-pair counts.
///
/// A pair is positive when both points share a candidate region and
/// true when both points share a ground-truth region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairCounts {
    pub tp: u128,
    pub tn: u128,
    pub fp: u128,
    pub fn_: u128,
}

impl PairCounts {
    pub fn total(&self) -> u128 {
        self.tp + self.tn + self.fp + self.fn_
    }

    pub fn precision(&self) -> f64 {
        safe_divide(self.tp as f64, (self.tp + self.fp) as f64, 0.0)
    }

    pub fn recall(&self) -> f64 {
        safe_divide(self.tp as f64, (self.tp + self.fn_) as f64, 0.0)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        safe_divide(2.0 * p * r, p + r, 0.0)
    }

    pub fn rand_index(&self) -> f64 {
        safe_divide((self.tp + self.tn) as f64, self.total() as f64, 0.0)
    }

    /// Counts from per-region truth histograms.
    ///
    /// Only pairs of points inside the union of the regions are counted.
    pub fn from_histograms<'a, I>(histograms: I) -> Self
    where
        I: IntoIterator<Item = &'a TruthHistogram>,
    {
        let mut tp = 0u128;
        let mut predicted = 0u128;
        let mut points = 0u128;
        let mut truth_totals: HashMap<Label, u128> = HashMap::new();

        for hist in histograms {
            let mut region_points = 0u128;
            for (&t, &n) in hist {
                let n = u128::from(n);
                tp += pairs(n);
                region_points += n;
                *truth_totals.entry(t).or_insert(0) += n;
            }
            predicted += pairs(region_points);
            points += region_points;
        }

        let actual: u128 = truth_totals.values().map(|&n| pairs(n)).sum();
        let total = pairs(points);
        Self {
            tp,
            fp: predicted - tp,
            fn_: actual - tp,
            tn: total + tp - predicted - actual,
        }
    }

    /// Counts for a set of regions against `truth`, ignoring truth background.
    pub fn from_regions(regions: &[&Region], truth: &LabeledImage) -> Self {
        let hists: Vec<TruthHistogram> = regions
            .iter()
            .map(|r| truth_histogram(r, truth, &[BACKGROUND]))
            .collect();
        Self::from_histograms(&hists)
    }
}

impl Add for PairCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            tp: self.tp + rhs.tp,
            tn: self.tn + rhs.tn,
            fp: self.fp + rhs.fp,
            fn_: self.fn_ + rhs.fn_,
        }
    }
}

impl AddAssign for PairCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// `n choose 2`
pub fn pairs(n: u128) -> u128 {
    if n < 2 {
        0
    } else {
        n * (n - 1) / 2
    }
}

/// Count the truth labels under a region's points, skipping `ignore`.
pub fn truth_histogram(region: &Region, truth: &LabeledImage, ignore: &[Label]) -> TruthHistogram {
    let mut hist = TruthHistogram::new();
    for &p in region.points() {
        let t = *truth.get(p);
        if !ignore.contains(&t) {
            *hist.entry(t).or_insert(0) += 1;
        }
    }
    hist
}

/// Whole-image pair counts between a segmentation and ground truth.
///
/// Cells outside `mask`, cells whose segment label is in `ignore_segment`, and
/// cells whose truth label is in `ignore_truth` are left out.
pub fn pair_counts_images(
    segmentation: &LabeledImage,
    truth: &LabeledImage,
    mask: Option<&Mask>,
    ignore_segment: &[Label],
    ignore_truth: &[Label],
) -> DomainResult<PairCounts> {
    segmentation.ensure_same_shape(truth, "ground truth")?;
    if let Some(m) = mask {
        segmentation.ensure_same_shape(m, "mask")?;
    }
    let mut hists: HashMap<Label, TruthHistogram> = HashMap::new();
    for p in 0..segmentation.len() {
        if mask.is_some_and(|m| *m.get(p) == BACKGROUND) {
            continue;
        }
        let (s, t) = (*segmentation.get(p), *truth.get(p));
        if ignore_segment.contains(&s) || ignore_truth.contains(&t) {
            continue;
        }
        *hists.entry(s).or_default().entry(t).or_insert(0) += 1;
    }
    Ok(PairCounts::from_histograms(hists.values()))
}

/// Pairwise score used to compare candidate partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Metric {
    /// Harmonic mean of pair precision and pair recall.
    #[default]
    PairF1,
    /// Classic Rand index.
    RandIndex,
}

impl TryFrom<i64> for Metric {
    type Error = String;

    /// Numeric selector: 1 = pair F1, 2 = Rand index.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Metric::PairF1),
            2 => Ok(Metric::RandIndex),
            other => Err(format!("unsupported metric {other} (1: pair F1, 2: Rand index)")),
        }
    }
}

impl Metric {
    pub fn score(&self, counts: &PairCounts) -> f64 {
        match self {
            Metric::PairF1 => counts.f1(),
            Metric::RandIndex => counts.rand_index(),
        }
    }
}

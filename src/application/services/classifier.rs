//! Merge orders driven by a trained boundary classifier.
//!
//! The classifier itself lives outside this crate. It receives a feature
//! vector per candidate boundary plus a size category and returns the
//! probability that the boundary is real; that probability is the saliency.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::application::services::merge_order::{MergeGate, MergeOrderGenerator, Step};
use crate::application::ApplicationResult;
use crate::domain::{
    BoundaryKey, BoundaryStat, BoundaryTable, DomainResult, EvidenceField, LabeledImage, Mask,
    MeanEvidenceCache, MeanStat, MedianStat, MergeOrder, RegionMap,
};

/// Number of values in [`BoundaryFeatures::values`].
pub const FEATURE_COUNT: usize = 8;

/// Trained boundary model.
pub trait BoundaryClassifier: Sync {
    /// Probability that the boundary between two regions is real.
    fn boundary_probability(&self, features: &[f64], category: usize) -> f64;

    /// Hard decision: `true` keeps the boundary.
    fn predict(&self, features: &[f64], category: usize) -> bool {
        self.boundary_probability(features, category) >= 0.5
    }
}

impl<F> BoundaryClassifier for F
where
    F: Fn(&[f64], usize) -> f64 + Sync,
{
    fn boundary_probability(&self, features: &[f64], category: usize) -> f64 {
        self(features, category)
    }
}

/// Boundary statistic carrying both mean and median evidence.
///
/// Saliency is the mean; the classifier overrides it anyway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvidenceStat {
    pub mean: MeanStat,
    pub median: MedianStat,
}

impl BoundaryStat for EvidenceStat {
    fn push(&mut self, value: f64) {
        self.mean.push(value);
        self.median.push(value);
    }

    fn absorb(&mut self, other: Self) {
        self.mean.absorb(other.mean);
        self.median.absorb(other.median);
    }

    fn saliency(&self) -> f64 {
        self.mean.saliency()
    }

    fn count(&self) -> usize {
        self.mean.count()
    }
}

/// Feature extraction settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureOptions {
    /// Replace size and length features by their logarithm.
    pub use_log: bool,
    /// Category 0 when the smaller normalized region size is below this.
    pub category_threshold: f64,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self {
            use_log: true,
            category_threshold: 0.001,
        }
    }
}

/// Normalizers derived from the grid: total volume and diagonal length.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Normalizers {
    area: f64,
    length: f64,
}

impl Normalizers {
    fn of(image: &LabeledImage) -> Self {
        let area = image.len().max(1) as f64;
        let length = image
            .shape()
            .iter()
            .map(|&d| (d * d) as f64)
            .sum::<f64>()
            .sqrt()
            .max(1.0);
        Self { area, length }
    }
}

/// Features and size category of one candidate boundary.
///
/// Layout: smaller size, larger size, merged size, boundary length (all
/// normalized, log-scaled if requested), mean and median boundary evidence,
/// mean evidence of the smaller and of the larger region.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundaryFeatures {
    pub values: Vec<f64>,
    pub category: usize,
}

fn boundary_features(
    table: &BoundaryTable<EvidenceStat>,
    regions: &RegionMap,
    key: BoundaryKey,
    field: &EvidenceField,
    cache: &MeanEvidenceCache,
    norm: Normalizers,
    options: &FeatureOptions,
) -> DomainResult<BoundaryFeatures> {
    let entry = table.find(key)?;
    let mut r0 = regions.find(key.first())?;
    let mut r1 = regions.find(key.second())?;
    if r0.size() > r1.size() {
        std::mem::swap(&mut r0, &mut r1);
    }

    let small = r0.size() as f64 / norm.area;
    let large = r1.size() as f64 / norm.area;
    let merged = small + large;
    let length = entry.stat.count() as f64 / norm.length;
    let scale = |v: f64| if options.use_log { v.max(f64::MIN_POSITIVE).ln() } else { v };

    let values = vec![
        scale(small),
        scale(large),
        scale(merged),
        scale(length),
        entry.stat.mean.saliency(),
        entry.stat.median.saliency(),
        cache.mean_evidence(r0, field),
        cache.mean_evidence(r1, field),
    ];
    let category = usize::from(small >= options.category_threshold);
    Ok(BoundaryFeatures { values, category })
}

/// Generate a merge order ranked by classifier probability.
///
/// All boundaries are scored up front in parallel; after every merge only
/// the re-created boundaries are scored again.
#[instrument(level = "debug", skip(image, mask, field, classifier, gate))]
pub fn generate_merge_order_with_classifier<C, G>(
    image: &LabeledImage,
    mask: Option<&Mask>,
    field: &EvidenceField,
    classifier: &C,
    options: &FeatureOptions,
    gate: &mut G,
) -> ApplicationResult<MergeOrder>
where
    C: BoundaryClassifier + ?Sized,
    G: MergeGate<EvidenceStat> + ?Sized,
{
    let norm = Normalizers::of(image);
    let cache = MeanEvidenceCache::new();
    let mut generator =
        MergeOrderGenerator::from_image(image, mask, field, false, EvidenceStat::default)?;

    let score = |table: &BoundaryTable<EvidenceStat>,
                 regions: &RegionMap,
                 key: BoundaryKey|
     -> DomainResult<f64> {
        let f = boundary_features(table, regions, key, field, &cache, norm, options)?;
        Ok(classifier.boundary_probability(&f.values, f.category))
    };

    let keys = generator.table().keys();
    let initial: Vec<DomainResult<f64>> = keys
        .par_iter()
        .map(|&key| score(generator.table(), generator.regions(), key))
        .collect();
    let mut scored = Vec::with_capacity(keys.len());
    for (&key, result) in keys.iter().zip(initial) {
        scored.push((key, result?));
    }
    generator.set_saliencies(&scored)?;
    debug!("generate_merge_order_with_classifier: scored {} boundaries", keys.len());

    loop {
        match generator.step(gate)? {
            Step::Merged { touched, .. } => generator.rescore(&touched, &score)?,
            Step::Deferred(_) => {}
            Step::Done => break,
        }
    }
    Ok(generator.into_parts().2)
}

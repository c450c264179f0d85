//! Batch evaluation of a pre-merge / merge-order / labelling configuration.

use std::fmt;

use rayon::prelude::*;
use tracing::{debug, info, instrument};

use crate::application::services::labeling::label_merge_order;
use crate::application::services::merge_order::{generate_merge_order, AlwaysMerge};
use crate::application::services::pre_merge::pre_merge;
use crate::application::{ApplicationError, ApplicationResult};
use crate::config::Settings;
use crate::domain::pair_stats::pair_counts_images;
use crate::domain::{safe_divide, BcLabel, EvidenceField, LabeledImage, Mask, PairCounts, BACKGROUND};

/// One image of a batch: initial over-segmentation plus its inputs.
#[derive(Debug, Clone)]
pub struct Sample {
    pub labels: LabeledImage,
    pub evidence: EvidenceField,
    pub truth: LabeledImage,
    pub mask: Option<Mask>,
}

/// Per-sample outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SampleStats {
    pub counts: PairCounts,
    pub regions: usize,
    pub merges: usize,
    pub splits: usize,
}

/// Aggregate metrics over a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub counts: PairCounts,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub rand_index: f64,
    pub region_count_mean: f64,
    pub region_count_std: f64,
    pub merges: usize,
    pub splits: usize,
    /// None when no event was labelled split.
    pub merge_split_ratio: Option<f64>,
}

impl Summary {
    pub fn from_samples(stats: &[SampleStats]) -> Self {
        let mut counts = PairCounts::default();
        let (mut merges, mut splits) = (0, 0);
        for s in stats {
            counts += s.counts;
            merges += s.merges;
            splits += s.splits;
        }
        let regions: Vec<f64> = stats.iter().map(|s| s.regions as f64).collect();
        let mean = safe_divide(regions.iter().sum(), regions.len() as f64, 0.0);
        let std = stddev(&regions, mean);
        Self {
            counts,
            precision: counts.precision(),
            recall: counts.recall(),
            f1: counts.f1(),
            rand_index: counts.rand_index(),
            region_count_mean: mean,
            region_count_std: std,
            merges,
            splits,
            merge_split_ratio: (splits > 0).then(|| merges as f64 / splits as f64),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Precision     = {}", self.precision)?;
        writeln!(f, "Recall        = {}", self.recall)?;
        writeln!(f, "F1            = {}", self.f1)?;
        writeln!(f, "Rand Index    = {}", self.rand_index)?;
        writeln!(f, "Region # mean = {}", self.region_count_mean)?;
        writeln!(f, "Region # sd   = {}", self.region_count_std)?;
        match self.merge_split_ratio {
            Some(ratio) => write!(f, "Merge/split ratio = {ratio}"),
            None => write!(f, "Merge/split ratio = undefined"),
        }
    }
}

/// Population standard deviation around `mean`.
fn stddev(values: &[f64], mean: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f64 = values.iter().map(|x| (x - mean) * (x - mean)).sum();
    (sum / values.len() as f64).sqrt()
}

/// Number of distinct foreground labels inside the mask.
pub fn region_count(labels: &LabeledImage, mask: Option<&Mask>) -> usize {
    let mut seen = std::collections::HashSet::new();
    for p in 0..labels.len() {
        if labels.is_included(mask, p) {
            seen.insert(*labels.get(p));
        }
    }
    seen.len()
}

/// Pre-merge, score, generate a merge order and label it for one sample.
#[instrument(level = "debug", skip_all)]
pub fn analyze_sample(sample: &Sample, settings: &Settings) -> ApplicationResult<SampleStats> {
    let mask = sample.mask.as_ref();
    let merged = pre_merge(&sample.labels, mask, &sample.evidence, &settings.pre_merge)?;
    let counts = pair_counts_images(&merged.labels, &sample.truth, mask, &[], &[BACKGROUND])?;
    let regions = region_count(&merged.labels, mask);

    let order = generate_merge_order(
        &merged.labels,
        mask,
        &sample.evidence,
        &settings.merge,
        &mut AlwaysMerge,
    )?;
    let labels = label_merge_order(
        &merged.labels,
        mask,
        order.events(),
        &sample.truth,
        &settings.classify,
    )?;
    let merges = labels.iter().filter(|&&l| l == BcLabel::Merge).count();
    debug!(
        "analyze_sample: regions={} events={} merges={}",
        regions,
        order.len(),
        merges
    );
    Ok(SampleStats {
        counts,
        regions,
        merges,
        splits: labels.len() - merges,
    })
}

/// Evaluate a batch in parallel and aggregate the metrics.
#[instrument(level = "debug", skip_all, fields(samples = samples.len()))]
pub fn analyze(samples: &[Sample], settings: &Settings) -> ApplicationResult<Summary> {
    settings.validate()?;
    let pool = settings.runtime.thread_pool()?;
    let results: Vec<ApplicationResult<SampleStats>> = pool.install(|| {
        samples
            .par_iter()
            .map(|s| analyze_sample(s, settings))
            .collect()
    });

    // Collect successes, propagate first error
    let mut stats = Vec::with_capacity(samples.len());
    for (i, result) in results.into_iter().enumerate() {
        stats.push(result.map_err(|e| ApplicationError::OperationFailed {
            context: format!("sample {i}"),
            source: Box::new(e),
        })?);
    }
    let summary = Summary::from_samples(&stats);
    info!(
        "analyze: samples={} f1={:.4} ri={:.4}",
        stats.len(),
        summary.f1,
        summary.rand_index
    );
    Ok(summary)
}

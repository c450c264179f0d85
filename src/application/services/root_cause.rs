//! Candidate correction sites in a labelled merge tree.
//!
//! A node is a root cause when it merges, its parent splits, and some
//! ground-truth region overlaps it with a Jaccard index of at least
//! `min_jaccard`. Flags never change the classification itself.

use std::collections::HashMap;

use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::application::services::labeling::{BoundaryLabeler, NodeLabel};
use crate::domain::{safe_divide, BcLabel, DomainResult, Label, LabeledImage, Mask, MergeTree};

/// Number of cells per truth label inside the mask, background excluded.
pub fn truth_sizes(truth: &LabeledImage, mask: Option<&Mask>) -> HashMap<Label, u64> {
    let mut sizes = HashMap::new();
    for p in 0..truth.len() {
        if truth.is_included(mask, p) {
            *sizes.entry(*truth.get(p)).or_insert(0) += 1;
        }
    }
    sizes
}

/// Best Jaccard index between region `label` and any truth region.
pub fn best_jaccard(
    labeler: &BoundaryLabeler<'_>,
    sizes: &HashMap<Label, u64>,
    label: Label,
) -> DomainResult<f64> {
    let region_size = labeler.regions().find(label)?.size() as f64;
    let hist = labeler.histogram(label)?;
    Ok(hist
        .iter()
        .map(|(t, &overlap)| {
            let overlap = overlap as f64;
            let truth_size = sizes.get(t).copied().unwrap_or(0) as f64;
            safe_divide(overlap, region_size + truth_size - overlap, 0.0)
        })
        .fold(0.0, f64::max))
}

/// Root-cause flag per node, in node order.
#[instrument(level = "debug", skip_all, fields(nodes = tree.len(), min_jaccard))]
pub fn root_causes(
    labeler: &BoundaryLabeler<'_>,
    tree: &MergeTree<NodeLabel>,
    min_jaccard: f64,
) -> DomainResult<Vec<bool>> {
    let sizes = truth_sizes(labeler.truth(), labeler.mask());
    let results: Vec<DomainResult<bool>> = tree
        .ids()
        .par_iter()
        .map(|&idx| {
            let node = tree.node(idx)?;
            let Some(parent) = node.parent else {
                return Ok(false);
            };
            if node.data.bc_label != BcLabel::Merge
                || tree.node(parent)?.data.bc_label != BcLabel::Split
            {
                return Ok(false);
            }
            Ok(best_jaccard(labeler, &sizes, node.label)? >= min_jaccard)
        })
        .collect();

    // Collect successes, propagate first error
    let mut flags = Vec::with_capacity(results.len());
    for result in results {
        flags.push(result?);
    }
    debug!("root_causes: flagged={}", flags.iter().filter(|&&f| f).count());
    Ok(flags)
}

//! Merge/split labelling of merge events against ground truth
//!
//! Every decision reduces to exact pair counts between a set of candidate
//! regions and the ground truth (background ignored). Truth histograms are
//! computed once per region label and shared between worker threads.
//!
//! Two evaluation modes:
//! - local: each event on its own, in parallel, optionally refined by
//!   replaying events with the best known partition per label
//! - global: bottom-up dynamic program over the merge tree followed by an
//!   optional path-consistency pass

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::application::ApplicationResult;
use crate::config::ClassifyConfig;
use crate::domain::pair_stats::truth_histogram;
use crate::domain::{
    BcLabel, DomainResult, Label, LabeledImage, Mask, MergeEvent, MergeTree, NodeId, PairCounts,
    RegionCache, RegionMap, TreeBuilder, TruthHistogram, BACKGROUND,
};

/// How merge events are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum EvalMode {
    /// Each event independently.
    #[default]
    Local,
    /// Tree dynamic program.
    Global,
}

impl TryFrom<i64> for EvalMode {
    type Error = String;

    /// Numeric selector: 0 = local, 1 = global.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EvalMode::Local),
            1 => Ok(EvalMode::Global),
            other => Err(format!("unsupported evaluation mode {other} (0: local, 1: global)")),
        }
    }
}

/// Path-consistency policy applied after the global dynamic program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Consistency {
    /// Keep the dynamic-program labels as they are.
    None,
    /// A merge node forces all its descendants to merge.
    #[default]
    PropagateMerge,
    /// A split node forces all its ancestors to split.
    PropagateSplit,
}

impl TryFrom<i64> for Consistency {
    type Error = String;

    /// Numeric selector: 0 = none, 1 = by merge, 2 = by split.
    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Consistency::None),
            1 => Ok(Consistency::PropagateMerge),
            2 => Ok(Consistency::PropagateSplit),
            other => Err(format!(
                "unsupported consistency type {other} (0: none, 1: by merge, 2: by split)"
            )),
        }
    }
}

/// Classification payload of a merge tree node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeLabel {
    pub bc_label: BcLabel,
    /// Nodes forming the best partition of this node's region.
    pub best_splits: Vec<NodeId>,
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bc_label)
    }
}

/// Scores of one locally evaluated event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalScore {
    pub bc_label: BcLabel,
    pub merge_score: f64,
    pub split_score: f64,
}

/// Labels merge events of one segmentation against one ground truth.
#[derive(Debug)]
pub struct BoundaryLabeler<'a> {
    regions: RegionMap,
    truth: &'a LabeledImage,
    mask: Option<&'a Mask>,
    config: ClassifyConfig,
    histograms: RegionCache<Arc<TruthHistogram>>,
}

impl<'a> BoundaryLabeler<'a> {
    /// Materialize every region of `events` over `image`.
    #[instrument(level = "debug", skip(image, mask, events, truth))]
    pub fn new(
        image: &LabeledImage,
        mask: Option<&'a Mask>,
        events: &[MergeEvent],
        truth: &'a LabeledImage,
        config: ClassifyConfig,
    ) -> ApplicationResult<Self> {
        config.validate()?;
        image.ensure_same_shape(truth, "ground truth")?;
        let regions = RegionMap::from_merge_order(image, mask, events, false)?;
        Ok(Self {
            regions,
            truth,
            mask,
            config,
            histograms: RegionCache::new(),
        })
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    pub fn truth(&self) -> &LabeledImage {
        self.truth
    }

    pub fn mask(&self) -> Option<&Mask> {
        self.mask
    }

    pub fn config(&self) -> &ClassifyConfig {
        &self.config
    }

    /// Truth label counts under region `label`, memoized.
    pub fn histogram(&self, label: Label) -> DomainResult<Arc<TruthHistogram>> {
        if let Some(h) = self.histograms.get(label) {
            return Ok(h);
        }
        let region = self.regions.find(label)?;
        Ok(self.histograms.get_or_compute(label, || {
            Arc::new(truth_histogram(region, self.truth, &[BACKGROUND]))
        }))
    }

    /// Pair counts of the partition formed by `labels`.
    pub fn pair_counts(&self, labels: &[Label]) -> DomainResult<PairCounts> {
        let hists = labels
            .iter()
            .map(|&l| self.histogram(l))
            .collect::<DomainResult<Vec<_>>>()?;
        Ok(PairCounts::from_histograms(hists.iter().map(|h| h.as_ref())))
    }

    fn score(&self, labels: &[Label]) -> DomainResult<f64> {
        Ok(self.config.metric.score(&self.pair_counts(labels)?))
    }

    /// Label every event with the configured mode.
    #[instrument(level = "debug", skip_all, fields(events = events.len(), mode = ?self.config.mode))]
    pub fn label_events(&self, events: &[MergeEvent]) -> DomainResult<Vec<BcLabel>> {
        let labels = match self.config.mode {
            EvalMode::Local => self
                .local(events)?
                .into_iter()
                .map(|s| s.bc_label)
                .collect(),
            EvalMode::Global => internal_labels(&self.global(events)?),
        };
        debug!(
            "label_events: merge={} split={}",
            labels.iter().filter(|&&l| l == BcLabel::Merge).count(),
            labels.iter().filter(|&&l| l == BcLabel::Split).count()
        );
        Ok(labels)
    }

    /// Evaluate each event on its own (parallel), then refine if configured.
    pub fn local(&self, events: &[MergeEvent]) -> DomainResult<Vec<LocalScore>> {
        let results: Vec<DomainResult<LocalScore>> = events
            .par_iter()
            .map(|event| self.score_event(event))
            .collect();

        // Collect successes, propagate first error
        let mut scores = Vec::with_capacity(events.len());
        for result in results {
            scores.push(result?);
        }

        if self.config.opt_split {
            self.refine_optimal_splits(events, &mut scores)?;
        }
        Ok(scores)
    }

    fn score_event(&self, event: &MergeEvent) -> DomainResult<LocalScore> {
        let merge = self.pair_counts(&[event.merged])?;
        let split = self.pair_counts(&[event.a, event.b])?;
        let merge_score = self.config.metric.score(&merge);
        let split_score = self.config.metric.score(&split);

        let wins = if self.config.tweak {
            merge_score >= split_score
        } else {
            merge_score > split_score
        };
        let precision_drop = split.precision() - merge.precision();
        let bc_label = if wins && precision_drop <= self.config.max_precision_drop {
            BcLabel::Merge
        } else {
            BcLabel::Split
        };
        Ok(LocalScore {
            bc_label,
            merge_score,
            split_score,
        })
    }

    /// Replay events tracking the best known partition of every label and
    /// flip merges that lose against the union of both inputs' partitions.
    #[instrument(level = "debug", skip_all)]
    fn refine_optimal_splits(
        &self,
        events: &[MergeEvent],
        scores: &mut [LocalScore],
    ) -> DomainResult<()> {
        let mut best: HashMap<Label, Vec<Label>> = HashMap::new();
        let mut flipped = 0usize;
        for (event, score) in events.iter().zip(scores.iter_mut()) {
            let mut parts = best.remove(&event.a).unwrap_or_else(|| vec![event.a]);
            parts.extend(best.remove(&event.b).unwrap_or_else(|| vec![event.b]));

            if score.bc_label == BcLabel::Merge {
                let refined = self.score(&parts)?;
                if score.merge_score > refined {
                    parts = vec![event.merged];
                } else {
                    score.bc_label = BcLabel::Split;
                    score.split_score = refined;
                    flipped += 1;
                }
            }
            best.insert(event.merged, parts);
        }
        debug!("refine_optimal_splits: flipped={}", flipped);
        Ok(())
    }

    /// Build the merge tree of `events` and run the dynamic program plus the
    /// configured consistency policy.
    pub fn global(&self, events: &[MergeEvent]) -> DomainResult<MergeTree<NodeLabel>> {
        let mut tree: MergeTree<NodeLabel> = TreeBuilder::new().build(events)?;
        self.warm_histograms(&tree)?;
        self.best_splits(&mut tree)?;
        match self.config.consistency {
            Consistency::None => {}
            Consistency::PropagateMerge => propagate_by_merge(&mut tree),
            Consistency::PropagateSplit => propagate_by_split(&mut tree),
        }
        Ok(tree)
    }

    fn warm_histograms<T>(&self, tree: &MergeTree<T>) -> DomainResult<()> {
        let labels: Vec<Label> = tree.iter().map(|(_, n)| n.label).collect();
        let results: Vec<DomainResult<Arc<TruthHistogram>>> =
            labels.par_iter().map(|&l| self.histogram(l)).collect();

        // Collect successes, propagate first error
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Bottom-up pass: merge wins when the node's own region scores higher
    /// than its children's best partitions together.
    #[instrument(level = "debug", skip_all, fields(nodes = tree.len()))]
    pub fn best_splits(&self, tree: &mut MergeTree<NodeLabel>) -> DomainResult<()> {
        let ids = tree.ids().to_vec();
        for idx in ids {
            let node = tree.node(idx)?;
            if node.is_leaf() {
                let node = tree.node_mut(idx)?;
                node.data.bc_label = BcLabel::Merge;
                node.data.best_splits = vec![idx];
                continue;
            }

            let mut splits: Vec<NodeId> = Vec::new();
            for &c in &node.children {
                splits.extend(tree.node(c)?.data.best_splits.iter().copied());
            }
            let split_labels = splits
                .iter()
                .map(|&j| tree.node(j).map(|n| n.label))
                .collect::<DomainResult<Vec<_>>>()?;
            let merge_score = self.score(&[node.label])?;
            let split_score = self.score(&split_labels)?;

            let node = tree.node_mut(idx)?;
            if merge_score > split_score {
                node.data.bc_label = BcLabel::Merge;
                node.data.best_splits = vec![idx];
            } else {
                node.data.bc_label = BcLabel::Split;
                node.data.best_splits = splits;
            }
        }
        Ok(())
    }
}

/// Breadth-first from every root: below a merge node everything merges.
#[instrument(level = "debug", skip_all)]
pub fn propagate_by_merge(tree: &mut MergeTree<NodeLabel>) {
    let mut queue: VecDeque<NodeId> = tree.roots().into();
    while let Some(idx) = queue.pop_front() {
        let Some(node) = tree.get(idx) else { continue };
        if node.data.bc_label == BcLabel::Merge {
            tree.for_each_descendant_mut(idx, |n| n.data.bc_label = BcLabel::Merge);
        } else {
            queue.extend(node.children.iter().copied());
        }
    }
}

/// Above a split node everything splits.
///
/// Parents are visited before children, so an ancestor that already splits
/// has its whole ancestor path split and the walk can stop there.
#[instrument(level = "debug", skip_all)]
pub fn propagate_by_split(tree: &mut MergeTree<NodeLabel>) {
    let ids: Vec<NodeId> = tree.ids().iter().rev().copied().collect();
    for idx in ids {
        if tree.get(idx).map(|n| n.data.bc_label) != Some(BcLabel::Split) {
            continue;
        }
        let mut current = tree.get(idx).and_then(|n| n.parent);
        while let Some(p) = current {
            let Some(parent) = tree.get_mut(p) else { break };
            if parent.data.bc_label == BcLabel::Split {
                break;
            }
            parent.data.bc_label = BcLabel::Split;
            current = parent.parent;
        }
    }
}

/// Labels of internal nodes in node order.
pub fn internal_labels(tree: &MergeTree<NodeLabel>) -> Vec<BcLabel> {
    tree.iter()
        .filter(|(_, n)| !n.is_leaf())
        .map(|(_, n)| n.data.bc_label)
        .collect()
}

/// Label the events of a merge order over `image` against `truth`.
pub fn label_merge_order(
    image: &LabeledImage,
    mask: Option<&Mask>,
    events: &[MergeEvent],
    truth: &LabeledImage,
    config: &ClassifyConfig,
) -> ApplicationResult<Vec<BcLabel>> {
    let labeler = BoundaryLabeler::new(image, mask, events, truth, config.clone())?;
    Ok(labeler.label_events(events)?)
}

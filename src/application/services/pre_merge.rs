//! Small-region elimination and label rewriting.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, instrument};

use crate::application::services::merge_order::{
    MergeOrderGenerator, SizeEvidenceGate, SizeThresholds,
};
use crate::application::ApplicationResult;
use crate::config::PreMergeConfig;
use crate::domain::{
    EvidenceField, Label, LabeledImage, Mask, MeanStat, MergeEvent, MergeOrder, BACKGROUND,
};

/// Result of a pre-merge pass.
#[derive(Debug, Clone)]
pub struct PreMerged {
    pub labels: LabeledImage,
    pub order: MergeOrder,
}

/// Merge away small regions and rewrite the label grid accordingly.
///
/// Boundaries are ranked by mean evidence; only pairs accepted by
/// [`SizeEvidenceGate`] merge.
#[instrument(level = "debug", skip(image, mask, field))]
pub fn pre_merge(
    image: &LabeledImage,
    mask: Option<&Mask>,
    field: &EvidenceField,
    config: &PreMergeConfig,
) -> ApplicationResult<PreMerged> {
    let thresholds = SizeThresholds::try_from(config.size_thresholds.as_slice())?;
    let mut gate = SizeEvidenceGate::new(thresholds, config.evidence_threshold, field);
    let mut generator = MergeOrderGenerator::from_image(image, mask, field, false, MeanStat::default)?;
    generator.run(&mut gate)?;
    let (regions, _, order) = generator.into_parts();

    let mut labels = apply_label_map(image, &final_label_map(order.events()));
    if config.relabel {
        relabel_consecutive(&mut labels);
    }
    debug!(
        "pre_merge: events={} regions={}",
        order.len(),
        regions.size()
    );
    Ok(PreMerged { labels, order })
}

/// Map every label taking part in `events` to the label it ends up in.
pub fn final_label_map(events: &[MergeEvent]) -> HashMap<Label, Label> {
    let mut map: HashMap<Label, Label> = HashMap::new();
    // walk backwards so each merged label is already resolved
    for event in events.iter().rev() {
        let target = map.get(&event.merged).copied().unwrap_or(event.merged);
        map.insert(event.a, target);
        map.insert(event.b, target);
    }
    map
}

/// Rewrite every cell through `map`; unmapped labels are kept.
pub fn apply_label_map(image: &LabeledImage, map: &HashMap<Label, Label>) -> LabeledImage {
    let mut out = image.clone();
    for label in out.as_mut_slice() {
        if let Some(&to) = map.get(label) {
            *label = to;
        }
    }
    out
}

/// Renumber foreground labels to `1..=k` in ascending order of the old label.
///
/// Background stays 0. Returns `k`.
pub fn relabel_consecutive(image: &mut LabeledImage) -> usize {
    let present: BTreeSet<Label> = image
        .as_slice()
        .iter()
        .copied()
        .filter(|&l| l != BACKGROUND)
        .collect();
    let map: HashMap<Label, Label> = present.iter().copied().zip(1..).collect();
    for label in image.as_mut_slice() {
        if let Some(&to) = map.get(label) {
            *label = to;
        }
    }
    map.len()
}

//! Integration tests for ground-truth labelling, consistency and analysis.

use rstest::rstest;

use segmerge::application::services::analysis::{analyze, Sample};
use segmerge::application::services::labeling::{
    internal_labels, label_merge_order, propagate_by_merge, propagate_by_split, BoundaryLabeler,
    Consistency, EvalMode, NodeLabel,
};
use segmerge::application::services::merge_order::{generate_merge_order, AlwaysMerge};
use segmerge::config::{ClassifyConfig, MergeConfig, Settings};
use segmerge::domain::{
    BcLabel, EvidenceField, Grid, LabeledImage, MergeEvent, MergeTree, Metric, StatKind,
    TreeBuilder,
};
use segmerge::util::testing;

#[ctor::ctor]
fn init() {
    testing::init_test_setup();
}

/// Blocky over-segmentation of a two-region truth with noisy evidence.
fn scene(seed: u64) -> (LabeledImage, EvidenceField, LabeledImage) {
    let (rows, cols) = (8, 8);
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (state >> 33) as f64 / (1u64 << 31) as f64
    };
    let mut labels = Vec::with_capacity(rows * cols);
    let mut truth = Vec::with_capacity(rows * cols);
    let mut evidence = Vec::with_capacity(rows * cols);
    for r in 0..rows {
        for c in 0..cols {
            // 2x2 superpixels
            labels.push((r / 2 * (cols / 2) + c / 2 + 1) as u32);
            truth.push(if c < 4 { 1 } else { 2 });
            let edge = if c == 3 || c == 4 { 0.8 } else { 0.0 };
            evidence.push(edge + 0.1 * next());
        }
    }
    (
        Grid::from_shape_vec(&[rows, cols], labels).unwrap(),
        Grid::from_shape_vec(&[rows, cols], evidence).unwrap(),
        Grid::from_shape_vec(&[rows, cols], truth).unwrap(),
    )
}

/// Mean statistic keeps every within-half boundary below the cross-half ones.
fn merge_order(image: &LabeledImage, field: &EvidenceField) -> Vec<MergeEvent> {
    let config = MergeConfig {
        statistic: StatKind::Mean,
        ..MergeConfig::default()
    };
    generate_merge_order(image, None, field, &config, &mut AlwaysMerge)
        .unwrap()
        .events()
        .to_vec()
}

/// Arbitrary but fixed label pattern on every node.
fn patterned_tree(events: &[MergeEvent]) -> MergeTree<NodeLabel> {
    let mut tree: MergeTree<NodeLabel> = TreeBuilder::new().build(events).unwrap();
    for (i, idx) in tree.ids().to_vec().into_iter().enumerate() {
        tree.node_mut(idx).unwrap().data.bc_label = if (i * 7) % 3 == 0 {
            BcLabel::Merge
        } else {
            BcLabel::Split
        };
    }
    tree
}

fn assert_merge_closed(tree: &MergeTree<NodeLabel>) {
    for (idx, node) in tree.iter() {
        if node.data.bc_label == BcLabel::Merge {
            for d in tree.descendants(idx) {
                assert_eq!(tree.node(d).unwrap().data.bc_label, BcLabel::Merge);
            }
        }
    }
}

fn assert_split_closed(tree: &MergeTree<NodeLabel>) {
    for (idx, node) in tree.iter() {
        if node.data.bc_label == BcLabel::Split {
            for a in tree.ancestors(idx) {
                assert_eq!(tree.node(a).unwrap().data.bc_label, BcLabel::Split);
            }
        }
    }
}

// ============================================================
// Consistency enforcement
// ============================================================

#[test]
fn given_arbitrary_labels_when_propagating_merge_then_descendants_of_merge_merge() {
    let (image, field, _) = scene(5);
    let mut tree = patterned_tree(&merge_order(&image, &field));
    propagate_by_merge(&mut tree);
    assert_merge_closed(&tree);
}

#[test]
fn given_arbitrary_labels_when_propagating_split_then_ancestors_of_split_split() {
    let (image, field, _) = scene(5);
    let mut tree = patterned_tree(&merge_order(&image, &field));
    propagate_by_split(&mut tree);
    assert_split_closed(&tree);
}

#[rstest]
#[case(Consistency::PropagateMerge)]
#[case(Consistency::PropagateSplit)]
fn given_global_mode_when_labelling_then_tree_is_path_consistent(#[case] consistency: Consistency) {
    let (image, field, truth) = scene(17);
    let events = merge_order(&image, &field);
    let config = ClassifyConfig {
        mode: EvalMode::Global,
        consistency,
        ..ClassifyConfig::default()
    };
    let labeler = BoundaryLabeler::new(&image, None, &events, &truth, config).unwrap();
    let tree = labeler.global(&events).unwrap();
    match consistency {
        Consistency::PropagateMerge => assert_merge_closed(&tree),
        _ => assert_split_closed(&tree),
    }
    assert_eq!(internal_labels(&tree).len(), events.len());
}

// ============================================================
// Labelling outcomes
// ============================================================

#[rstest]
#[case(EvalMode::Local, Metric::PairF1)]
#[case(EvalMode::Local, Metric::RandIndex)]
#[case(EvalMode::Global, Metric::PairF1)]
#[case(EvalMode::Global, Metric::RandIndex)]
fn given_two_truth_regions_when_labelling_then_final_merge_splits(
    #[case] mode: EvalMode,
    #[case] metric: Metric,
) {
    let (image, field, truth) = scene(23);
    let events = merge_order(&image, &field);
    let config = ClassifyConfig {
        mode,
        metric,
        ..ClassifyConfig::default()
    };
    let labels = label_merge_order(&image, None, &events, &truth, &config).unwrap();
    assert_eq!(labels.len(), events.len());
    // the last event joins the two truth halves
    assert_eq!(labels.last(), Some(&BcLabel::Split));
    assert!(labels.iter().any(|&l| l == BcLabel::Merge));
}

#[test]
fn given_identical_inputs_when_labelling_twice_then_identical_labels() {
    let (image, field, truth) = scene(99);
    let events = merge_order(&image, &field);
    let config = ClassifyConfig {
        opt_split: true,
        ..ClassifyConfig::default()
    };
    let first = label_merge_order(&image, None, &events, &truth, &config).unwrap();
    let second = label_merge_order(&image, None, &events, &truth, &config).unwrap();
    assert_eq!(first, second);
}

#[test]
fn given_order_with_unknown_label_when_labelling_then_invalid_order() {
    let (image, _, truth) = scene(1);
    let events = [MergeEvent::new(1, 999, 1000)];
    let result = label_merge_order(&image, None, &events, &truth, &ClassifyConfig::default());
    assert!(result.is_err());
}

// ============================================================
// Batch analysis
// ============================================================

//  superpixels      truth
//  1 1 2 2          1 1 1 1
//  1 1 2 2          1 1 1 1
//  3 3 3 3          2 2 2 2
//  3 3 3 3          2 2 2 2
fn sample() -> Sample {
    let labels = Grid::from_rows(&[
        vec![1, 1, 2, 2],
        vec![1, 1, 2, 2],
        vec![3, 3, 3, 3],
        vec![3, 3, 3, 3],
    ])
    .unwrap();
    let truth = Grid::from_rows(&[
        vec![1, 1, 1, 1],
        vec![1, 1, 1, 1],
        vec![2, 2, 2, 2],
        vec![2, 2, 2, 2],
    ])
    .unwrap();
    let evidence = Grid::from_rows(&[
        vec![0.1, 0.1, 0.1, 0.1],
        vec![0.1, 0.1, 0.1, 0.1],
        vec![0.9, 0.9, 0.9, 0.9],
        vec![0.9, 0.9, 0.9, 0.9],
    ])
    .unwrap();
    Sample {
        labels,
        evidence,
        truth,
        mask: None,
    }
}

#[test]
fn given_batch_when_analyzing_then_metrics_aggregate() {
    let mut settings = Settings::default();
    settings.pre_merge.size_thresholds = vec![1];
    settings.runtime.threads = Some(2);

    let summary = analyze(&[sample(), sample()], &settings).unwrap();
    assert_eq!(summary.precision, 1.0);
    assert_eq!(summary.region_count_mean, 3.0);
    assert_eq!(summary.region_count_std, 0.0);
    assert_eq!((summary.merges, summary.splits), (2, 2));
    assert_eq!(summary.merge_split_ratio, Some(1.0));
    assert!(summary.recall < 1.0);
}

#[test]
fn given_invalid_settings_when_analyzing_then_rejected_before_work() {
    let mut settings = Settings::default();
    settings.pre_merge.size_thresholds = vec![1, 2, 3];
    assert!(analyze(&[sample()], &settings).is_err());
}

//! Integration tests for the greedy merge-order generator.

use std::collections::HashSet;

use rstest::rstest;

use segmerge::application::services::merge_order::{
    generate_merge_order, AlwaysMerge, Candidate, GeneratorState, MergeOrderGenerator, Step,
};
use segmerge::application::services::pre_merge::{apply_label_map, final_label_map};
use segmerge::config::MergeConfig;
use segmerge::domain::{
    BoundaryKey, BoundaryTable, EvidenceField, Grid, LabeledImage, MeanStat, MergeEvent, RegionMap,
    StatKind, TreeBuilder, BACKGROUND,
};
use segmerge::util::testing;

#[ctor::ctor]
fn init() {
    testing::init_test_setup();
}

/// Deterministic pseudo-random label grid and evidence field.
fn noisy_grid(rows: usize, cols: usize, labels: u32, seed: u64) -> (LabeledImage, EvidenceField) {
    let mut state = seed;
    let mut next = move || {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        state >> 33
    };
    let mut label_values = Vec::with_capacity(rows * cols);
    let mut evidence = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        label_values.push((next() % labels as u64) as u32 + 1);
        evidence.push((next() % 1000) as f64 / 1000.0);
    }
    (
        Grid::from_shape_vec(&[rows, cols], label_values).unwrap(),
        Grid::from_shape_vec(&[rows, cols], evidence).unwrap(),
    )
}

fn mean_config() -> MergeConfig {
    MergeConfig {
        statistic: StatKind::Mean,
        contour_only: false,
        ..MergeConfig::default()
    }
}

// ============================================================
// End-to-end
// ============================================================

#[test]
fn given_three_regions_when_generating_then_weak_boundary_merges_first() {
    // A A B B C C with A–B evidence 0.2 and B–C evidence 0.8
    let labels = Grid::from_rows(&[vec![1, 1, 2, 2, 3, 3]]).unwrap();
    let field = Grid::from_rows(&[vec![0.0, 0.2, 0.2, 0.8, 0.8, 0.0]]).unwrap();
    let mut generator =
        MergeOrderGenerator::from_image(&labels, None, &field, false, MeanStat::default).unwrap();
    assert_eq!(generator.regions().size(), 3);

    let Step::Merged {
        event, saliency, ..
    } = generator.step(&mut AlwaysMerge).unwrap()
    else {
        panic!("expected a merge");
    };
    assert_eq!(event, MergeEvent::new(1, 2, 4));
    assert!((saliency - 0.2).abs() < 1e-12);
    assert_eq!(generator.regions().size(), 2);

    generator.run(&mut AlwaysMerge).unwrap();
    assert_eq!(generator.state(), GeneratorState::Done);
    assert_eq!(
        generator.order().events(),
        &[MergeEvent::new(1, 2, 4), MergeEvent::new(3, 4, 5)]
    );
    assert!((generator.order().saliencies()[1] - 0.8).abs() < 1e-12);
}

#[rstest]
#[case(StatKind::Mean)]
#[case(StatKind::Median)]
fn given_either_statistic_when_generating_then_single_region_remains(#[case] statistic: StatKind) {
    let (labels, field) = noisy_grid(8, 8, 12, 7);
    let config = MergeConfig {
        statistic,
        ..MergeConfig::default()
    };
    let order = generate_merge_order(&labels, None, &field, &config, &mut AlwaysMerge).unwrap();
    let r0 = RegionMap::from_image(&labels, None, true).unwrap().size();
    assert_eq!(order.len(), r0 - 1);
    assert!(order.saliencies().iter().all(|s| (0.0..=1.0).contains(s)));
}

// ============================================================
// Region count properties
// ============================================================

#[rstest]
#[case(3, 4, 1)]
#[case(6, 6, 5)]
#[case(10, 7, 20)]
fn given_labeled_grid_when_building_region_map_then_size_is_distinct_label_count(
    #[case] rows: usize,
    #[case] cols: usize,
    #[case] labels: u32,
) {
    let (image, _) = noisy_grid(rows, cols, labels, 11);
    let distinct: HashSet<u32> = image.as_slice().iter().copied().collect();
    let regions = RegionMap::from_image(&image, None, true).unwrap();
    assert_eq!(regions.size(), distinct.len());
}

#[test]
fn given_mask_and_background_when_building_region_map_then_excluded_labels_missing() {
    let image = Grid::from_rows(&[vec![1, 2, 0], vec![3, 3, 4]]).unwrap();
    let mask = Grid::from_rows(&[vec![1, 1, 1], vec![1, 1, 0]]).unwrap();
    let regions = RegionMap::from_image(&image, Some(&mask), false).unwrap();
    assert_eq!(regions.size(), 3);
    assert!(!regions.is_live(BACKGROUND));
    assert!(!regions.is_live(4));
}

#[test]
fn given_n_accepted_merges_when_stepping_then_region_count_drops_by_n() {
    let (labels, field) = noisy_grid(6, 6, 10, 3);
    let mut generator =
        MergeOrderGenerator::from_image(&labels, None, &field, true, MeanStat::default).unwrap();
    let r0 = generator.regions().size();
    let mut merges = 0;
    while let Step::Merged { .. } = generator.step(&mut AlwaysMerge).unwrap() {
        merges += 1;
        assert_eq!(generator.regions().size(), r0 - merges);
    }
    assert_eq!(merges, r0 - 1);
}

// ============================================================
// Incremental re-keying
// ============================================================

#[rstest]
#[case(1)]
#[case(4)]
#[case(9)]
fn given_k_merges_when_rebuilding_table_then_matches_incremental(#[case] k: usize) {
    let (labels, field) = noisy_grid(7, 7, 14, 42);
    let mut generator =
        MergeOrderGenerator::from_image(&labels, None, &field, false, MeanStat::default).unwrap();
    for _ in 0..k {
        assert!(matches!(
            generator.step(&mut AlwaysMerge).unwrap(),
            Step::Merged { .. }
        ));
    }

    let relabeled = apply_label_map(&labels, &final_label_map(generator.order().events()));
    let rebuilt = BoundaryTable::from_image(&relabeled, None, &field, MeanStat::default).unwrap();

    let incremental = generator.table().snapshot();
    let fresh = rebuilt.snapshot();
    let keys: Vec<BoundaryKey> = incremental.keys().copied().collect();
    assert_eq!(keys, fresh.keys().copied().collect::<Vec<_>>());
    for key in keys {
        assert!((incremental[&key] - fresh[&key]).abs() < 1e-9, "{key:?}");
        assert_eq!(
            generator.table().find(key).unwrap().stat.count,
            rebuilt.find(key).unwrap().stat.count
        );
    }
}

// ============================================================
// Determinism and forests
// ============================================================

#[test]
fn given_identical_inputs_when_generating_twice_then_identical_orders() {
    let (labels, field) = noisy_grid(9, 9, 25, 1234);
    let config = MergeConfig::default();
    let first = generate_merge_order(&labels, None, &field, &config, &mut AlwaysMerge).unwrap();
    let second = generate_merge_order(&labels, None, &field, &config, &mut AlwaysMerge).unwrap();
    assert_eq!(first.events(), second.events());
    let bits = |s: &[f64]| s.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(first.saliencies()), bits(second.saliencies()));
}

#[test]
fn given_disconnected_components_when_generating_then_forest_with_two_roots() {
    // background column separates {1, 2} from {3, 4}
    let labels = Grid::from_rows(&[vec![1, 2, 0, 3, 4], vec![1, 2, 0, 3, 4]]).unwrap();
    let field = Grid::filled(&[2, 5], 0.5);
    let order = generate_merge_order(&labels, None, &field, &mean_config(), &mut AlwaysMerge).unwrap();
    assert_eq!(
        order.events(),
        &[MergeEvent::new(1, 2, 5), MergeEvent::new(3, 4, 6)]
    );

    let tree = TreeBuilder::new().build::<()>(order.events()).unwrap();
    let roots: Vec<u32> = tree
        .roots()
        .into_iter()
        .map(|idx| tree.node(idx).unwrap().label)
        .collect();
    assert_eq!(roots, vec![5, 6]);
    assert_eq!(tree.node(tree.root().unwrap()).unwrap().label, 6);
}

#[test]
fn given_gate_rejecting_small_pair_when_neighbor_changes_then_pair_reconsidered() {
    // 1 | 2 | 3 with 1–2 weakest; reject it while 3 is still separate
    let labels = Grid::from_rows(&[vec![1, 2, 3]]).unwrap();
    let field = Grid::from_rows(&[vec![0.1, 0.1, 0.3]]).unwrap();
    let mut generator =
        MergeOrderGenerator::from_image(&labels, None, &field, false, MeanStat::default).unwrap();
    let mut gate = |_: &BoundaryTable<MeanStat>, regions: &RegionMap, c: &Candidate| {
        !(c.key == BoundaryKey::new(1, 2) && regions.is_live(3))
    };
    generator.run(&mut gate).unwrap();
    assert_eq!(
        generator.order().events(),
        &[MergeEvent::new(2, 3, 4), MergeEvent::new(1, 4, 5)]
    );
}

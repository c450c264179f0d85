//! Pair counts checked against a brute-force reference.

use rstest::rstest;

use segmerge::domain::pair_stats::{pair_counts_images, pairs};
use segmerge::domain::{Grid, LabeledImage, Metric, PairCounts, RegionMap, BACKGROUND};
use segmerge::util::testing;

#[ctor::ctor]
fn init() {
    testing::init_test_setup();
}

/// Enumerate every point pair.
fn brute_force(segmentation: &LabeledImage, truth: &LabeledImage) -> PairCounts {
    let s = segmentation.as_slice();
    let t = truth.as_slice();
    let mut counts = PairCounts::default();
    for i in 0..s.len() {
        for j in i + 1..s.len() {
            match (s[i] == s[j], t[i] == t[j]) {
                (true, true) => counts.tp += 1,
                (true, false) => counts.fp += 1,
                (false, true) => counts.fn_ += 1,
                (false, false) => counts.tn += 1,
            }
        }
    }
    counts
}

//  superpixels      truth
//  1 1 2 2          1 1 1 1
//  1 1 2 2          1 1 1 2
//  3 3 3 3          2 2 2 2
//  3 3 3 3          2 2 2 2
fn four_by_four() -> (LabeledImage, LabeledImage) {
    let segmentation = Grid::from_rows(&[
        vec![1, 1, 2, 2],
        vec![1, 1, 2, 2],
        vec![3, 3, 3, 3],
        vec![3, 3, 3, 3],
    ])
    .unwrap();
    let truth = Grid::from_rows(&[
        vec![1, 1, 1, 1],
        vec![1, 1, 1, 2],
        vec![2, 2, 2, 2],
        vec![2, 2, 2, 2],
    ])
    .unwrap();
    (segmentation, truth)
}

#[test]
fn given_small_grid_when_counting_pairs_then_matches_brute_force() {
    let (segmentation, truth) = four_by_four();
    let counts = pair_counts_images(&segmentation, &truth, None, &[], &[]).unwrap();
    let reference = brute_force(&segmentation, &truth);
    assert_eq!(counts, reference);
    assert_eq!(counts.total(), pairs(16));

    let precision = reference.tp as f64 / (reference.tp + reference.fp) as f64;
    let recall = reference.tp as f64 / (reference.tp + reference.fn_) as f64;
    let f1 = 2.0 * precision * recall / (precision + recall);
    let ri = (reference.tp + reference.tn) as f64 / pairs(16) as f64;
    assert!((counts.f1() - f1).abs() < 1e-12);
    assert!((counts.rand_index() - ri).abs() < 1e-12);
    assert!((Metric::PairF1.score(&counts) - f1).abs() < 1e-12);
    assert!((Metric::RandIndex.score(&counts) - ri).abs() < 1e-12);
}

#[test]
fn given_region_map_when_counting_from_regions_then_matches_image_counts() {
    let (segmentation, truth) = four_by_four();
    let regions = RegionMap::from_image(&segmentation, None, false).unwrap();
    let members: Vec<_> = [1, 2, 3].iter().map(|&l| regions.find(l).unwrap()).collect();
    let counts = PairCounts::from_regions(&members, &truth);
    assert_eq!(counts, brute_force(&segmentation, &truth));
}

#[test]
fn given_truth_background_when_ignored_then_pairs_left_out() {
    let segmentation = Grid::from_rows(&[vec![1, 1, 2, 2]]).unwrap();
    let truth = Grid::from_rows(&[vec![1, 0, 2, 2]]).unwrap();
    let counts = pair_counts_images(&segmentation, &truth, None, &[], &[BACKGROUND]).unwrap();
    // cells 0, 2, 3 remain: (2, 3) same/same, the rest differ on both sides
    assert_eq!(counts.tp, 1);
    assert_eq!(counts.tn, 2);
    assert_eq!(counts.fp + counts.fn_, 0);
}

#[rstest]
#[case(60_000, false)]
#[case(10_000_000_000, true)]
fn given_huge_region_when_counting_then_no_overflow(#[case] n: u128, #[case] beyond_u64: bool) {
    assert_eq!(pairs(n), n * (n - 1) / 2);
    assert_eq!(pairs(n) > u64::MAX as u128, beyond_u64);
}

#[test]
fn given_mismatched_shapes_when_counting_then_error() {
    let segmentation = Grid::from_rows(&[vec![1, 1, 2]]).unwrap();
    let truth = Grid::from_rows(&[vec![1, 1]]).unwrap();
    assert!(pair_counts_images(&segmentation, &truth, None, &[], &[]).is_err());
}

//! Application services
//!
//! Operations that orchestrate the domain structures: merge-order
//! generation, pre-merging, ground-truth labelling and batch analysis.

pub mod analysis;
pub mod classifier;
pub mod labeling;
pub mod merge_order;
pub mod pre_merge;
pub mod root_cause;

pub use analysis::{analyze, analyze_sample, Sample, SampleStats, Summary};
pub use classifier::{
    generate_merge_order_with_classifier, BoundaryClassifier, BoundaryFeatures, EvidenceStat,
    FeatureOptions,
};
pub use labeling::{
    internal_labels, label_merge_order, propagate_by_merge, propagate_by_split, BoundaryLabeler,
    Consistency, EvalMode, LocalScore, NodeLabel,
};
pub use merge_order::{
    generate_merge_order, AlwaysMerge, Candidate, GeneratorState, MergeGate, MergeOrderGenerator,
    SizeEvidenceGate, SizeThresholds, Step,
};
pub use pre_merge::{apply_label_map, final_label_map, pre_merge, relabel_consecutive, PreMerged};
pub use root_cause::{best_jaccard, root_causes, truth_sizes};

//! Domain layer: entities and core data structures
//!
//! This layer is independent of external concerns (no I/O, no config loading).

pub mod arena;
pub mod boundary_stat;
pub mod boundary_table;
pub mod builder;
pub mod cache;
pub mod entities;
pub mod error;
pub mod pair_stats;
pub mod region_map;
pub mod tree_traits;

pub use arena::{MergeTree, NodeId, TreeNode};
pub use boundary_stat::{BoundaryStat, MeanStat, MedianStat, StatKind};
pub use boundary_table::{BoundaryEntry, BoundaryKey, BoundaryTable};
pub use builder::TreeBuilder;
pub use cache::{MeanEvidenceCache, RegionCache};
pub use entities::*;
pub use error::{DomainError, DomainResult};
pub use pair_stats::{Metric, PairCounts, TruthHistogram};
pub use region_map::{Region, RegionMap};
pub use tree_traits::TreeNodeConvert;

//! Hierarchical region agglomeration.
//!
//! Starting from an over-segmented label grid and a boundary evidence field,
//! the crate produces greedy merge orders, builds merge trees from them and
//! labels every merge against a ground-truth segmentation.
//!
//! Layers:
//! - [`domain`]: region map, boundary table, merge tree, pair statistics
//! - [`application`]: merge-order generation, pre-merging, labelling, analysis
//! - [`config`]: layered settings

pub mod application;
pub mod config;
pub mod domain;
pub mod util;

pub use application::{ApplicationError, ApplicationResult};
pub use config::Settings;
pub use domain::{DomainError, DomainResult};

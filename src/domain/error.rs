//! Domain-level errors (no external dependencies)

use thiserror::Error;

use crate::domain::entities::Label;

/// Domain errors represent violated invariants of the core structures.
///
/// A missing region or boundary means the region map and the boundary table
/// disagree about which labels are live. Callers must not paper over these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("region not found: label {0} is not known to the region map")]
    RegionNotFound(Label),

    #[error("boundary not found: labels {0} and {1} are not adjacent")]
    BoundaryNotFound(Label, Label),

    #[error("label {0} is already in use")]
    LabelInUse(Label),

    #[error("label space exhausted: no label after {0}")]
    LabelSpaceExhausted(Label),

    #[error("grid shape mismatch for {what}: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("invalid merge order at event {index}: {message}")]
    InvalidOrder { index: usize, message: String },

    #[error("invalid tree node: {0}")]
    InvalidNode(usize),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

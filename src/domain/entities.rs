//! Domain entities: core data structures

use std::fmt;

use ndarray::{ArrayD, IxDyn};

use crate::domain::error::{DomainError, DomainResult};

/// Region identifier in a segmentation.
pub type Label = u32;

/// Reserved label for background / excluded cells.
pub const BACKGROUND: Label = 0;

/// Row-major offset of a cell inside a [`Grid`].
pub type Point = usize;

/// Dense D-dimensional grid backed by an [`ArrayD`] in standard layout.
///
/// Cells are addressed by their flat offset ([`Point`]) into
/// [`Grid::as_slice`]; every constructor keeps the array in standard layout so
/// that offset order is row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    data: ArrayD<T>,
}

/// Integer label per cell (superpixels, ground truth, masks).
pub type LabeledImage = Grid<Label>;
/// Scalar boundary evidence per cell, typically a probability in `[0, 1]`.
pub type EvidenceField = Grid<f64>;
/// Exclusion mask: cells with value 0 are ignored.
pub type Mask = Grid<Label>;

impl<T: Clone> Grid<T> {
    pub fn from_shape_vec(shape: &[usize], values: Vec<T>) -> DomainResult<Self> {
        let found = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| {
            DomainError::ShapeMismatch {
                what: "grid values",
                expected: shape.to_vec(),
                found: vec![found],
            }
        })?;
        Ok(Self { data })
    }

    /// Build a 2-D grid from equally long rows.
    pub fn from_rows(rows: &[Vec<T>]) -> DomainResult<Self> {
        let width = rows.first().map(|r| r.len()).unwrap_or(0);
        if let Some(bad) = rows.iter().find(|r| r.len() != width) {
            return Err(DomainError::ShapeMismatch {
                what: "grid row",
                expected: vec![width],
                found: vec![bad.len()],
            });
        }
        let values = rows.iter().flat_map(|r| r.iter().cloned()).collect();
        Self::from_shape_vec(&[rows.len(), width], values)
    }

    /// Copy `array` into standard layout.
    pub fn from_array(array: &ArrayD<T>) -> Self {
        Self {
            data: array.as_standard_layout().into_owned(),
        }
    }

    pub fn filled(shape: &[usize], value: T) -> Self {
        Self {
            data: ArrayD::from_elem(IxDyn(shape), value),
        }
    }
}

impl<T> Grid<T> {
    pub fn as_array(&self) -> &ArrayD<T> {
        &self.data
    }

    pub fn into_array(self) -> ArrayD<T> {
        self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Cells in row-major order.
    pub fn as_slice(&self) -> &[T] {
        // standard layout always yields a slice
        self.data.as_slice().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.data.as_slice_mut().unwrap_or(&mut [])
    }

    pub fn get(&self, point: Point) -> &T {
        &self.as_slice()[point]
    }

    /// Every pair of face-adjacent cells, once, as `(p, q)` with `p < q`.
    pub fn adjacent_pairs(&self) -> impl Iterator<Item = (Point, Point)> + '_ {
        let dims = self.data.shape();
        let strides = self.data.strides();
        self.data
            .indexed_iter()
            .enumerate()
            .flat_map(move |(p, (ix, _))| {
                (0..dims.len())
                    .filter(move |&axis| ix[axis] + 1 < dims[axis])
                    .map(move |axis| (p, p + strides[axis] as usize))
            })
    }

    /// Whether each cell lies on the grid border.
    pub fn border_flags(&self) -> Vec<bool> {
        let dims = self.data.shape();
        self.data
            .indexed_iter()
            .map(|(ix, _)| (0..dims.len()).any(|axis| ix[axis] == 0 || ix[axis] + 1 == dims[axis]))
            .collect()
    }

    pub fn ensure_same_shape<U>(&self, other: &Grid<U>, what: &'static str) -> DomainResult<()> {
        if self.shape() != other.shape() {
            return Err(DomainError::ShapeMismatch {
                what,
                expected: self.shape().to_vec(),
                found: other.shape().to_vec(),
            });
        }
        Ok(())
    }
}

impl<T: PartialEq> Grid<T> {
    /// Cells on the border or touching a cell with a different value.
    pub fn contour_flags(&self) -> Vec<bool> {
        let mut flags = self.border_flags();
        let cells = self.as_slice();
        for (p, q) in self.adjacent_pairs() {
            if cells[p] != cells[q] {
                flags[p] = true;
                flags[q] = true;
            }
        }
        flags
    }
}

impl Grid<Label> {
    /// Whether a cell takes part in region bookkeeping.
    pub fn is_included(&self, mask: Option<&Mask>, point: Point) -> bool {
        *self.get(point) != BACKGROUND && mask.map_or(true, |m| *m.get(point) != BACKGROUND)
    }
}

/// One contraction: regions `a` and `b` became region `merged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MergeEvent {
    pub a: Label,
    pub b: Label,
    pub merged: Label,
}

impl MergeEvent {
    pub fn new(a: Label, b: Label, merged: Label) -> Self {
        Self { a, b, merged }
    }
}

impl fmt::Display for MergeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.a, self.b, self.merged)
    }
}

impl From<(Label, Label, Label)> for MergeEvent {
    fn from((a, b, merged): (Label, Label, Label)) -> Self {
        Self { a, b, merged }
    }
}

/// Merge events in generation order, each with the saliency seen at selection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOrder {
    events: Vec<MergeEvent>,
    saliencies: Vec<f64>,
}

impl MergeOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: MergeEvent, saliency: f64) {
        self.events.push(event);
        self.saliencies.push(saliency);
    }

    pub fn events(&self) -> &[MergeEvent] {
        &self.events
    }

    pub fn saliencies(&self) -> &[f64] {
        &self.saliencies
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MergeEvent, f64)> + '_ {
        self.events.iter().zip(self.saliencies.iter().copied())
    }
}

/// Outcome assigned to a merge event or tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BcLabel {
    /// The merge is beneficial with respect to ground truth.
    #[default]
    Merge,
    /// The boundary should be kept.
    Split,
}

impl BcLabel {
    /// Signed encoding used by downstream consumers (+1 merge, -1 split).
    pub fn as_i8(self) -> i8 {
        match self {
            BcLabel::Merge => 1,
            BcLabel::Split => -1,
        }
    }
}

impl fmt::Display for BcLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BcLabel::Merge => write!(f, "merge"),
            BcLabel::Split => write!(f, "split"),
        }
    }
}

/// `num / den`, or `fallback` when the denominator is zero.
pub fn safe_divide(num: f64, den: f64, fallback: f64) -> f64 {
    if den == 0.0 {
        fallback
    } else {
        num / den
    }
}

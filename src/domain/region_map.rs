//! Label → region membership derived from a labeled grid.

use std::collections::{BTreeSet, HashMap};
use std::ops::ControlFlow;

use rayon::prelude::*;
use tracing::{debug, instrument, trace};

use crate::domain::entities::{
    safe_divide, EvidenceField, Label, LabeledImage, Mask, MergeEvent, Point, BACKGROUND,
};
use crate::domain::error::{DomainError, DomainResult};

/// The grid cells currently carrying one label.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    label: Label,
    points: Vec<Point>,
    size: usize,
    contour_only: bool,
}

impl Region {
    fn new(label: Label, contour_only: bool) -> Self {
        Self {
            label,
            points: Vec::new(),
            size: 0,
            contour_only,
        }
    }

    pub fn label(&self) -> Label {
        self.label
    }

    /// Stored member points; only boundary-adjacent ones in contour mode.
    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// Number of cells in the region, whether or not all are stored.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_contour_only(&self) -> bool {
        self.contour_only
    }

    /// Visit stored points until the visitor breaks.
    pub fn traverse<B, F>(&self, mut visit: F) -> ControlFlow<B>
    where
        F: FnMut(Point) -> ControlFlow<B>,
    {
        for &p in &self.points {
            visit(p)?;
        }
        ControlFlow::Continue(())
    }

    /// Mean of `field` over the stored points (0.0 for an empty region).
    pub fn mean_over(&self, field: &EvidenceField) -> f64 {
        let sum: f64 = self.points.iter().map(|&p| *field.get(p)).sum();
        safe_divide(sum, self.points.len() as f64, 0.0)
    }

    fn absorb(&mut self, other: &Region) {
        self.points.extend_from_slice(&other.points);
        self.size += other.size;
    }
}

/// Mapping from label to region for one segmentation.
///
/// Live regions partition the non-excluded cells. When built by replaying a
/// merge order, retired regions stay findable so every node of a hierarchy
/// can be inspected.
#[derive(Debug, Clone)]
pub struct RegionMap {
    regions: HashMap<Label, Region>,
    live: BTreeSet<Label>,
    max_label: Label,
    contour_only: bool,
    keep_history: bool,
    shape: Vec<usize>,
}

impl RegionMap {
    /// Collect regions from `image`, skipping background and masked cells.
    ///
    /// In contour mode only cells touching a differently labelled cell (or
    /// the grid border) are stored; sizes still count every cell.
    #[instrument(level = "debug", skip_all, fields(shape = ?image.shape(), contour_only))]
    pub fn from_image(
        image: &LabeledImage,
        mask: Option<&Mask>,
        contour_only: bool,
    ) -> DomainResult<Self> {
        if let Some(m) = mask {
            image.ensure_same_shape(m, "mask")?;
        }
        let mut regions: HashMap<Label, Region> = HashMap::new();
        let mut max_label = BACKGROUND;
        let contour = contour_only.then(|| image.contour_flags());

        for p in 0..image.len() {
            if !image.is_included(mask, p) {
                continue;
            }
            let label = *image.get(p);
            max_label = max_label.max(label);
            let region = regions
                .entry(label)
                .or_insert_with(|| Region::new(label, contour_only));
            region.size += 1;
            if contour.as_ref().map_or(true, |flags| flags[p]) {
                region.points.push(p);
            }
        }

        let live = regions.keys().copied().collect();
        debug!("from_image: {} regions, max label {}", regions.len(), max_label);
        Ok(Self {
            regions,
            live,
            max_label,
            contour_only,
            keep_history: false,
            shape: image.shape().to_vec(),
        })
    }

    /// Rebuild the regions of every hierarchy level by replaying `events`.
    ///
    /// Boundaries are not recomputed. Retired labels remain findable.
    ///
    /// Each level owns a copy of its points, so memory grows with the sum
    /// of region sizes over all levels: `O(depth × size)` for a chain-shaped
    /// order. Pass `contour_only` to bound it by contour length instead.
    #[instrument(level = "debug", skip_all, fields(events = events.len()))]
    pub fn from_merge_order(
        image: &LabeledImage,
        mask: Option<&Mask>,
        events: &[MergeEvent],
        contour_only: bool,
    ) -> DomainResult<Self> {
        let mut rmap = Self::from_image(image, mask, contour_only)?;
        rmap.keep_history = true;
        for (index, event) in events.iter().enumerate() {
            for label in [event.a, event.b] {
                if !rmap.live.contains(&label) {
                    return Err(DomainError::InvalidOrder {
                        index,
                        message: format!("label {label} is not live"),
                    });
                }
            }
            if event.a == event.b || rmap.regions.contains_key(&event.merged) {
                return Err(DomainError::InvalidOrder {
                    index,
                    message: format!("cannot merge {event}"),
                });
            }
            rmap.merge_as(event.a, event.b, event.merged)?;
        }
        Ok(rmap)
    }

    /// Look up a region; a miss means the caller's bookkeeping is broken.
    pub fn find(&self, label: Label) -> DomainResult<&Region> {
        self.regions
            .get(&label)
            .ok_or(DomainError::RegionNotFound(label))
    }

    /// Number of live regions.
    pub fn size(&self) -> usize {
        self.live.len()
    }

    pub fn is_live(&self, label: Label) -> bool {
        self.live.contains(&label)
    }

    /// Live labels in ascending order.
    pub fn labels(&self) -> impl Iterator<Item = Label> + '_ {
        self.live.iter().copied()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn is_contour_only(&self) -> bool {
        self.contour_only
    }

    /// Label the next merge will produce.
    pub fn next_label(&self) -> DomainResult<Label> {
        self.max_label
            .checked_add(1)
            .ok_or(DomainError::LabelSpaceExhausted(self.max_label))
    }

    /// Visit the stored points of region `label`.
    pub fn traverse<B, F>(&self, label: Label, visit: F) -> DomainResult<ControlFlow<B>>
    where
        F: FnMut(Point) -> ControlFlow<B>,
    {
        Ok(self.find(label)?.traverse(visit))
    }

    /// Contract live regions `a` and `b` into a fresh region.
    pub fn merge(&mut self, a: Label, b: Label) -> DomainResult<Label> {
        let merged = self.next_label()?;
        self.merge_as(a, b, merged)?;
        Ok(merged)
    }

    #[instrument(level = "trace", skip(self))]
    fn merge_as(&mut self, a: Label, b: Label, merged: Label) -> DomainResult<()> {
        if !self.live.contains(&a) {
            return Err(DomainError::RegionNotFound(a));
        }
        if !self.live.contains(&b) {
            return Err(DomainError::RegionNotFound(b));
        }
        if self.regions.contains_key(&merged) {
            return Err(DomainError::LabelInUse(merged));
        }

        let mut region = if self.keep_history {
            let ra = self.find(a)?;
            let rb = self.find(b)?;
            let (big, small) = if ra.points.len() >= rb.points.len() {
                (ra, rb)
            } else {
                (rb, ra)
            };
            let mut region = big.clone();
            region.absorb(small);
            region
        } else {
            let ra = self.regions.remove(&a).ok_or(DomainError::RegionNotFound(a))?;
            let rb = self.regions.remove(&b).ok_or(DomainError::RegionNotFound(b))?;
            let (mut big, small) = if ra.points.len() >= rb.points.len() {
                (ra, rb)
            } else {
                (rb, ra)
            };
            big.absorb(&small);
            big
        };

        region.label = merged;
        trace!("merge_as: {} + {} -> {} (size {})", a, b, merged, region.size);
        self.live.remove(&a);
        self.live.remove(&b);
        self.live.insert(merged);
        self.regions.insert(merged, region);
        self.max_label = self.max_label.max(merged);
        Ok(())
    }

    /// Mean evidence of every live region, computed in parallel.
    pub fn mean_evidence(&self, field: &EvidenceField) -> DomainResult<Vec<(Label, f64)>> {
        let labels: Vec<Label> = self.live.iter().copied().collect();
        labels
            .par_iter()
            .map(|&label| Ok((label, self.find(label)?.mean_over(field))))
            .collect()
    }
}

//! Greedy merge-order generation
//!
//! Repeatedly contracts the weakest boundary of a region adjacency graph.
//! Every accepted contraction is recorded as a [`MergeEvent`] together with
//! the saliency it was selected at.
//!
//! Rejected candidates are deferred, not dropped: the boundary is parked
//! (kept in the table, withdrawn from selection) and comes back as soon as
//! either of its regions takes part in a merge.

use tracing::{debug, instrument, trace};

use crate::application::{ApplicationError, ApplicationResult};
use crate::config::MergeConfig;
use crate::domain::{
    BoundaryKey, BoundaryStat, BoundaryTable, DomainResult, EvidenceField, LabeledImage, Mask,
    MeanEvidenceCache, MeanStat, MedianStat, MergeEvent, MergeOrder, RegionMap, StatKind,
};

/// Boundary offered to a [`MergeGate`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub key: BoundaryKey,
    pub saliency: f64,
}

/// Decides whether the weakest boundary is contracted now.
pub trait MergeGate<S> {
    fn accept(
        &mut self,
        table: &BoundaryTable<S>,
        regions: &RegionMap,
        candidate: &Candidate,
    ) -> DomainResult<bool>;
}

impl<S, F> MergeGate<S> for F
where
    F: FnMut(&BoundaryTable<S>, &RegionMap, &Candidate) -> bool,
{
    fn accept(
        &mut self,
        table: &BoundaryTable<S>,
        regions: &RegionMap,
        candidate: &Candidate,
    ) -> DomainResult<bool> {
        Ok(self(table, regions, candidate))
    }
}

/// Pure saliency order: every candidate merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysMerge;

impl<S> MergeGate<S> for AlwaysMerge {
    fn accept(&mut self, _: &BoundaryTable<S>, _: &RegionMap, _: &Candidate) -> DomainResult<bool> {
        Ok(true)
    }
}

/// One or two region size thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeThresholds {
    pub primary: usize,
    pub secondary: Option<usize>,
}

impl TryFrom<&[usize]> for SizeThresholds {
    type Error = ApplicationError;

    fn try_from(values: &[usize]) -> Result<Self, Self::Error> {
        match values {
            [primary] => Ok(Self {
                primary: *primary,
                secondary: None,
            }),
            [primary, secondary] => Ok(Self {
                primary: *primary,
                secondary: Some(*secondary),
            }),
            other => Err(ApplicationError::config(format!(
                "size_thresholds needs 1 or 2 values, got {}",
                other.len()
            ))),
        }
    }
}

/// Eliminates spurious small regions.
///
/// The smaller side of a candidate merges when it is below the primary
/// threshold. With a secondary threshold, a side below it also merges when
/// its mean evidence exceeds `evidence_threshold`; the smaller side is
/// checked first. Mean evidence is computed once per label.
#[derive(Debug)]
pub struct SizeEvidenceGate<'a> {
    thresholds: SizeThresholds,
    evidence_threshold: f64,
    field: &'a EvidenceField,
    cache: MeanEvidenceCache,
}

impl<'a> SizeEvidenceGate<'a> {
    pub fn new(thresholds: SizeThresholds, evidence_threshold: f64, field: &'a EvidenceField) -> Self {
        Self {
            thresholds,
            evidence_threshold,
            field,
            cache: MeanEvidenceCache::new(),
        }
    }

    pub fn cache(&self) -> &MeanEvidenceCache {
        &self.cache
    }
}

impl<S> MergeGate<S> for SizeEvidenceGate<'_> {
    fn accept(
        &mut self,
        _: &BoundaryTable<S>,
        regions: &RegionMap,
        candidate: &Candidate,
    ) -> DomainResult<bool> {
        let mut r0 = regions.find(candidate.key.first())?;
        let mut r1 = regions.find(candidate.key.second())?;
        if r0.size() > r1.size() {
            std::mem::swap(&mut r0, &mut r1);
        }
        if r0.size() < self.thresholds.primary {
            return Ok(true);
        }
        if let Some(secondary) = self.thresholds.secondary {
            for region in [r0, r1] {
                if region.size() < secondary
                    && self.cache.mean_evidence(region, self.field) > self.evidence_threshold
                {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }
}

/// Generator lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// Some boundary is queued for selection.
    Running,
    /// No candidate left.
    Done,
}

/// Outcome of one generator step.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The candidate merged; `touched` are the re-created boundaries.
    Merged {
        event: MergeEvent,
        saliency: f64,
        touched: Vec<BoundaryKey>,
    },
    /// The gate rejected the candidate; it is parked.
    Deferred(BoundaryKey),
    Done,
}

/// Drives a [`RegionMap`] and a [`BoundaryTable`] through successive
/// contractions. Strictly sequential.
#[derive(Debug, Clone)]
pub struct MergeOrderGenerator<S> {
    regions: RegionMap,
    table: BoundaryTable<S>,
    order: MergeOrder,
}

impl<S: BoundaryStat> MergeOrderGenerator<S> {
    pub fn new(regions: RegionMap, table: BoundaryTable<S>) -> Self {
        Self {
            regions,
            table,
            order: MergeOrder::new(),
        }
    }

    /// Build regions and boundaries together from a labeled grid.
    pub fn from_image<F>(
        image: &LabeledImage,
        mask: Option<&Mask>,
        field: &EvidenceField,
        contour_only: bool,
        make_stat: F,
    ) -> DomainResult<Self>
    where
        F: Fn() -> S,
    {
        let regions = RegionMap::from_image(image, mask, contour_only)?;
        let table = BoundaryTable::from_image(image, mask, field, make_stat)?;
        Ok(Self::new(regions, table))
    }

    pub fn state(&self) -> GeneratorState {
        if self.table.candidates() > 0 {
            GeneratorState::Running
        } else {
            GeneratorState::Done
        }
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    pub fn table(&self) -> &BoundaryTable<S> {
        &self.table
    }

    pub fn order(&self) -> &MergeOrder {
        &self.order
    }

    pub fn into_parts(self) -> (RegionMap, BoundaryTable<S>, MergeOrder) {
        (self.regions, self.table, self.order)
    }

    /// Select the weakest boundary and merge it if `gate` agrees.
    pub fn step<G>(&mut self, gate: &mut G) -> DomainResult<Step>
    where
        G: MergeGate<S> + ?Sized,
    {
        let Some((key, saliency)) = self.table.min_saliency() else {
            return Ok(Step::Done);
        };
        let candidate = Candidate { key, saliency };
        if !gate.accept(&self.table, &self.regions, &candidate)? {
            trace!("step: deferring {:?} at {}", key, saliency);
            self.table.park(key)?;
            return Ok(Step::Deferred(key));
        }

        let merged = self.regions.merge(key.first(), key.second())?;
        let touched = self.table.merge(key.first(), key.second(), merged)?;
        let event = MergeEvent::new(key.first(), key.second(), merged);
        self.order.push(event, saliency);
        trace!("step: {} at {}", event, saliency);
        Ok(Step::Merged {
            event,
            saliency,
            touched,
        })
    }

    /// Step until no candidate is left.
    #[instrument(level = "debug", skip_all, fields(regions = self.regions.size()))]
    pub fn run<G>(&mut self, gate: &mut G) -> DomainResult<&MergeOrder>
    where
        G: MergeGate<S> + ?Sized,
    {
        let mut deferred = 0usize;
        loop {
            match self.step(gate)? {
                Step::Merged { .. } => {}
                Step::Deferred(_) => deferred += 1,
                Step::Done => break,
            }
        }
        debug!(
            "run: events={} deferred={} remaining_regions={}",
            self.order.len(),
            deferred,
            self.regions.size()
        );
        Ok(&self.order)
    }

    /// Replace saliencies with externally computed values.
    pub fn set_saliencies(&mut self, scored: &[(BoundaryKey, f64)]) -> DomainResult<()> {
        for &(key, saliency) in scored {
            self.table.set_saliency(key, saliency)?;
        }
        Ok(())
    }

    /// Replace the saliency of `keys` with values computed by `score`.
    pub fn rescore<F>(&mut self, keys: &[BoundaryKey], mut score: F) -> DomainResult<()>
    where
        F: FnMut(&BoundaryTable<S>, &RegionMap, BoundaryKey) -> DomainResult<f64>,
    {
        for &key in keys {
            let saliency = score(&self.table, &self.regions, key)?;
            self.table.set_saliency(key, saliency)?;
        }
        Ok(())
    }
}

/// Generate a merge order using the statistic selected in `config`.
#[instrument(level = "debug", skip(image, mask, field, gate))]
pub fn generate_merge_order<G>(
    image: &LabeledImage,
    mask: Option<&Mask>,
    field: &EvidenceField,
    config: &MergeConfig,
    gate: &mut G,
) -> ApplicationResult<MergeOrder>
where
    G: MergeGate<MeanStat> + MergeGate<MedianStat>,
{
    let order = match config.statistic {
        StatKind::Mean => {
            let mut generator =
                MergeOrderGenerator::from_image(image, mask, field, config.contour_only, MeanStat::default)?;
            generator.run(gate)?;
            generator.into_parts().2
        }
        StatKind::Median => {
            let capacity = config.reservoir_capacity;
            let mut generator = MergeOrderGenerator::from_image(image, mask, field, config.contour_only, || {
                MedianStat::with_capacity(capacity)
            })?;
            generator.run(gate)?;
            generator.into_parts().2
        }
    };
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Grid, Label};

    // A | B | C with weak A-B and strong B-C boundaries
    fn three_regions() -> (LabeledImage, EvidenceField) {
        let labels = Grid::from_rows(&[vec![1, 1, 2, 2, 3, 3], vec![1, 1, 2, 2, 3, 3]]).unwrap();
        let field = Grid::from_rows(&[
            vec![0.0, 0.2, 0.2, 0.8, 0.8, 0.0],
            vec![0.0, 0.2, 0.2, 0.8, 0.8, 0.0],
        ])
        .unwrap();
        (labels, field)
    }

    fn mean_generator() -> MergeOrderGenerator<MeanStat> {
        let (labels, field) = three_regions();
        MergeOrderGenerator::from_image(&labels, None, &field, false, MeanStat::default).unwrap()
    }

    #[test]
    fn given_three_regions_when_stepping_then_weak_boundary_first() {
        let mut generator = mean_generator();
        let step = generator.step(&mut AlwaysMerge).unwrap();
        match step {
            Step::Merged { event, saliency, .. } => {
                assert_eq!(event, MergeEvent::new(1, 2, 4));
                assert!((saliency - 0.2).abs() < 1e-12);
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert_eq!(generator.regions().size(), 2);
        assert_eq!(generator.state(), GeneratorState::Running);
    }

    #[test]
    fn given_always_merge_when_running_then_single_region_left() {
        let mut generator = mean_generator();
        let order = generator.run(&mut AlwaysMerge).unwrap().clone();
        assert_eq!(order.len(), 2);
        assert_eq!(order.events()[1], MergeEvent::new(3, 4, 5));
        assert_eq!(generator.state(), GeneratorState::Done);
        assert_eq!(generator.regions().size(), 1);
    }

    #[test]
    fn given_rejecting_closure_when_running_then_pair_deferred_until_neighbour_merges() {
        let mut generator = mean_generator();
        // refuse to merge the weak boundary directly; only 2-3 may merge
        let mut gate = |_: &BoundaryTable<MeanStat>, _: &RegionMap, c: &Candidate| {
            c.key != BoundaryKey::new(1, 2)
        };
        assert_eq!(
            generator.step(&mut gate).unwrap(),
            Step::Deferred(BoundaryKey::new(1, 2))
        );
        let order = generator.run(&mut gate).unwrap().clone();
        let events: Vec<(Label, Label, Label)> =
            order.events().iter().map(|e| (e.a, e.b, e.merged)).collect();
        // 2-3 merges into 4, which re-queues the parked 1-2 boundary as 1-4
        assert_eq!(events, vec![(2, 3, 4), (1, 4, 5)]);
    }

    #[test]
    fn given_gate_rejecting_everything_when_running_then_no_events() {
        let mut generator = mean_generator();
        let mut gate = |_: &BoundaryTable<MeanStat>, _: &RegionMap, _: &Candidate| false;
        assert!(generator.run(&mut gate).unwrap().is_empty());
        assert_eq!(generator.table().len(), 2);
        assert_eq!(generator.state(), GeneratorState::Done);
    }

    #[test]
    fn given_wrong_threshold_arity_when_parsing_then_config_error() {
        assert!(SizeThresholds::try_from(&[][..]).is_err());
        assert!(SizeThresholds::try_from(&[1, 2, 3][..]).is_err());
        assert_eq!(
            SizeThresholds::try_from(&[5][..]).unwrap(),
            SizeThresholds {
                primary: 5,
                secondary: None
            }
        );
    }

    #[test]
    fn given_size_gate_when_both_regions_large_then_rejected() {
        let (labels, field) = three_regions();
        let regions = RegionMap::from_image(&labels, None, false).unwrap();
        let table: BoundaryTable<MeanStat> = BoundaryTable::new();
        let candidate = Candidate {
            key: BoundaryKey::new(1, 2),
            saliency: 0.2,
        };

        let mut small = SizeEvidenceGate::new(SizeThresholds::try_from(&[5][..]).unwrap(), 0.5, &field);
        assert!(small.accept(&table, &regions, &candidate).unwrap());

        let mut large = SizeEvidenceGate::new(SizeThresholds::try_from(&[3][..]).unwrap(), 0.5, &field);
        assert!(!large.accept(&table, &regions, &candidate).unwrap());

        // region 2 has mean evidence 0.5, region 1 has 0.1
        let mut evidence = SizeEvidenceGate::new(SizeThresholds::try_from(&[3, 5][..]).unwrap(), 0.3, &field);
        assert!(evidence.accept(&table, &regions, &candidate).unwrap());
        assert_eq!(evidence.cache().len(), 2);
    }
}

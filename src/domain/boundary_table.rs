//! Boundary statistics for every pair of adjacent regions.
//!
//! The table keeps three structures in lock-step:
//! - `entries`: one [`BoundaryStat`] per adjacent pair
//! - `queue`: candidate pairs ordered by `(saliency, key)`
//! - `adjacency`: label → neighbouring labels
//!
//! A pair is in `entries` iff the two regions touch. A pair may be absent
//! from `queue` when a merge gate has parked it.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, instrument, trace};

use crate::domain::boundary_stat::BoundaryStat;
use crate::domain::entities::{EvidenceField, Label, LabeledImage, Mask, Point};
use crate::domain::error::{DomainError, DomainResult};

/// Unordered pair of adjacent labels, stored as `(min, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoundaryKey(Label, Label);

impl BoundaryKey {
    pub fn new(a: Label, b: Label) -> Self {
        if a <= b {
            Self(a, b)
        } else {
            Self(b, a)
        }
    }

    pub fn first(&self) -> Label {
        self.0
    }

    pub fn second(&self) -> Label {
        self.1
    }

    pub fn touches(&self, label: Label) -> bool {
        self.0 == label || self.1 == label
    }

    /// The label on the other side of `label`.
    pub fn other(&self, label: Label) -> Option<Label> {
        match label {
            l if l == self.0 => Some(self.1),
            l if l == self.1 => Some(self.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Priority {
    saliency: f64,
    key: BoundaryKey,
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.saliency
            .total_cmp(&other.saliency)
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// Statistic and current saliency of one boundary.
#[derive(Debug, Clone)]
pub struct BoundaryEntry<S> {
    pub stat: S,
    pub saliency: f64,
    queued: bool,
}

impl<S> BoundaryEntry<S> {
    pub fn is_queued(&self) -> bool {
        self.queued
    }
}

/// Boundary statistics indexed for minimum lookup and incremental re-keying.
#[derive(Debug, Clone)]
pub struct BoundaryTable<S> {
    entries: HashMap<BoundaryKey, BoundaryEntry<S>>,
    queue: BTreeSet<Priority>,
    adjacency: HashMap<Label, BTreeSet<Label>>,
}

impl<S: BoundaryStat> Default for BoundaryTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: BoundaryStat> BoundaryTable<S> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            queue: BTreeSet::new(),
            adjacency: HashMap::new(),
        }
    }

    /// Collect one evidence sample per pair of face-adjacent cells whose
    /// labels differ; the sample is the mean evidence of the two cells.
    ///
    /// Cells that are background or masked never form boundaries.
    #[instrument(level = "debug", skip_all, fields(shape = ?image.shape()))]
    pub fn from_image<F>(
        image: &LabeledImage,
        mask: Option<&Mask>,
        field: &EvidenceField,
        make_stat: F,
    ) -> DomainResult<Self>
    where
        F: Fn() -> S,
    {
        image.ensure_same_shape(field, "evidence field")?;
        if let Some(m) = mask {
            image.ensure_same_shape(m, "mask")?;
        }

        let mut edges: BTreeMap<BoundaryKey, Vec<(Point, Point)>> = BTreeMap::new();
        for (p, q) in image.adjacent_pairs() {
            let (lp, lq) = (*image.get(p), *image.get(q));
            if lp != lq && image.is_included(mask, p) && image.is_included(mask, q) {
                edges.entry(BoundaryKey::new(lp, lq)).or_default().push((p, q));
            }
        }

        let mut table = Self::new();
        for (key, cells) in edges {
            let mut stat = make_stat();
            for (p, q) in cells {
                stat.push((*field.get(p) + *field.get(q)) / 2.0);
            }
            table.insert(key, stat);
        }
        debug!("from_image: {} boundaries", table.len());
        Ok(table)
    }

    /// Add or replace the statistic of `key` and queue it as a candidate.
    pub fn insert(&mut self, key: BoundaryKey, stat: S) {
        let saliency = stat.saliency();
        self.remove_entry(key);
        self.adjacency.entry(key.0).or_default().insert(key.1);
        self.adjacency.entry(key.1).or_default().insert(key.0);
        self.queue.insert(Priority { saliency, key });
        self.entries.insert(
            key,
            BoundaryEntry {
                stat,
                saliency,
                queued: true,
            },
        );
    }

    pub fn get(&self, key: BoundaryKey) -> Option<&BoundaryEntry<S>> {
        self.entries.get(&key)
    }

    /// Look up a boundary; a miss means region and boundary bookkeeping diverged.
    pub fn find(&self, key: BoundaryKey) -> DomainResult<&BoundaryEntry<S>> {
        self.entries
            .get(&key)
            .ok_or(DomainError::BoundaryNotFound(key.0, key.1))
    }

    pub fn contains(&self, key: BoundaryKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Number of adjacent pairs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of pairs currently eligible for selection.
    pub fn candidates(&self) -> usize {
        self.queue.len()
    }

    /// Weakest queued boundary; ties resolved by label order.
    pub fn min_saliency(&self) -> Option<(BoundaryKey, f64)> {
        self.queue.first().map(|p| (p.key, p.saliency))
    }

    /// Neighbours of `label` in ascending order.
    pub fn neighbors(&self, label: Label) -> impl Iterator<Item = Label> + '_ {
        self.adjacency
            .get(&label)
            .into_iter()
            .flat_map(|n| n.iter().copied())
    }

    pub fn degree(&self, label: Label) -> usize {
        self.adjacency.get(&label).map_or(0, |n| n.len())
    }

    /// All keys in ascending order.
    pub fn keys(&self) -> Vec<BoundaryKey> {
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Remove a boundary entirely.
    pub fn erase(&mut self, key: BoundaryKey) -> DomainResult<S> {
        let entry = self
            .remove_entry(key)
            .ok_or(DomainError::BoundaryNotFound(key.0, key.1))?;
        for (from, to) in [(key.0, key.1), (key.1, key.0)] {
            if let Some(n) = self.adjacency.get_mut(&from) {
                n.remove(&to);
                if n.is_empty() {
                    self.adjacency.remove(&from);
                }
            }
        }
        Ok(entry.stat)
    }

    /// Withdraw a boundary from selection while keeping its statistic.
    ///
    /// It becomes a candidate again when either side is merged.
    pub fn park(&mut self, key: BoundaryKey) -> DomainResult<()> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(DomainError::BoundaryNotFound(key.0, key.1))?;
        if entry.queued {
            self.queue.remove(&Priority {
                saliency: entry.saliency,
                key,
            });
            entry.queued = false;
        }
        Ok(())
    }

    /// Override the saliency of a boundary (e.g. from a trained classifier).
    pub fn set_saliency(&mut self, key: BoundaryKey, saliency: f64) -> DomainResult<()> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or(DomainError::BoundaryNotFound(key.0, key.1))?;
        if entry.queued {
            self.queue.remove(&Priority {
                saliency: entry.saliency,
                key,
            });
            self.queue.insert(Priority { saliency, key });
        }
        entry.saliency = saliency;
        Ok(())
    }

    /// Re-key every boundary of `a` and `b` onto `merged`.
    ///
    /// Stats of `(a, x)` and `(b, x)` are combined into `(merged, x)` and the
    /// `(a, b)` boundary disappears. Runs in `O((deg a + deg b) log n)`.
    /// Returns the re-created keys in ascending order.
    #[instrument(level = "trace", skip(self))]
    pub fn merge(&mut self, a: Label, b: Label, merged: Label) -> DomainResult<Vec<BoundaryKey>> {
        if self.adjacency.contains_key(&merged) {
            return Err(DomainError::LabelInUse(merged));
        }
        let mut combined: BTreeMap<Label, S> = BTreeMap::new();

        for (side, partner) in [(a, b), (b, a)] {
            let neighbors = self.adjacency.remove(&side).unwrap_or_default();
            for x in neighbors {
                if x == partner {
                    continue;
                }
                let key = BoundaryKey::new(side, x);
                let entry = self
                    .remove_entry(key)
                    .ok_or(DomainError::BoundaryNotFound(key.0, key.1))?;
                if let Some(n) = self.adjacency.get_mut(&x) {
                    n.remove(&side);
                }
                match combined.get_mut(&x) {
                    Some(stat) => stat.absorb(entry.stat),
                    None => {
                        combined.insert(x, entry.stat);
                    }
                }
            }
        }

        // the contracted boundary itself
        self.remove_entry(BoundaryKey::new(a, b));

        let mut touched = Vec::with_capacity(combined.len());
        for (x, stat) in combined {
            let key = BoundaryKey::new(merged, x);
            self.insert(key, stat);
            touched.push(key);
        }
        trace!("merge: {} + {} -> {}, {} boundaries re-keyed", a, b, merged, touched.len());
        Ok(touched)
    }

    /// Saliency per boundary, for comparisons and diagnostics.
    pub fn snapshot(&self) -> BTreeMap<BoundaryKey, f64> {
        self.entries.iter().map(|(k, e)| (*k, e.saliency)).collect()
    }

    fn remove_entry(&mut self, key: BoundaryKey) -> Option<BoundaryEntry<S>> {
        let entry = self.entries.remove(&key)?;
        if entry.queued {
            self.queue.remove(&Priority {
                saliency: entry.saliency,
                key,
            });
        }
        Some(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::boundary_stat::MeanStat;
    use crate::domain::entities::Grid;

    fn strip() -> (LabeledImage, EvidenceField) {
        let labels = Grid::from_rows(&[vec![1, 1, 2, 2, 3, 3]]).unwrap();
        let field = Grid::from_rows(&[vec![0.0, 0.2, 0.2, 0.8, 0.8, 0.0]]).unwrap();
        (labels, field)
    }

    #[test]
    fn given_strip_when_building_then_only_touching_pairs_exist() {
        let (labels, field) = strip();
        let table = BoundaryTable::from_image(&labels, None, &field, MeanStat::default).unwrap();
        assert_eq!(table.keys(), vec![BoundaryKey::new(1, 2), BoundaryKey::new(2, 3)]);
        let (key, saliency) = table.min_saliency().unwrap();
        assert_eq!(key, BoundaryKey::new(1, 2));
        assert!((saliency - 0.2).abs() < 1e-12);
    }

    #[test]
    fn given_equal_saliencies_when_selecting_then_lowest_labels_win() {
        let mut table = BoundaryTable::<MeanStat>::new();
        let mut stat = MeanStat::default();
        stat.push(0.5);
        table.insert(BoundaryKey::new(7, 9), stat);
        table.insert(BoundaryKey::new(3, 8), stat);
        table.insert(BoundaryKey::new(3, 4), stat);
        assert_eq!(table.min_saliency().unwrap().0, BoundaryKey::new(3, 4));
    }

    #[test]
    fn given_shared_neighbor_when_merging_then_stats_are_combined() {
        // 1 | 2
        // 3 | 3
        let labels = Grid::from_rows(&[vec![1, 2], vec![3, 3]]).unwrap();
        let field = Grid::from_rows(&[vec![0.1, 0.3], vec![0.5, 0.9]]).unwrap();
        let mut table = BoundaryTable::from_image(&labels, None, &field, MeanStat::default).unwrap();
        assert_eq!(table.len(), 3);

        let touched = table.merge(1, 2, 4).unwrap();
        assert_eq!(touched, vec![BoundaryKey::new(3, 4)]);
        assert_eq!(table.len(), 1);
        let entry = table.find(BoundaryKey::new(3, 4)).unwrap();
        assert_eq!(entry.stat.count, 2);
        // (0.1 + 0.5) / 2 and (0.3 + 0.9) / 2
        assert!((entry.saliency - 0.45).abs() < 1e-12);
        assert_eq!(table.neighbors(3).collect::<Vec<_>>(), vec![4]);
        assert_eq!(table.degree(1), 0);
    }

    #[test]
    fn given_parked_boundary_when_selecting_then_it_is_skipped_until_requeued() {
        let (labels, field) = strip();
        let mut table = BoundaryTable::from_image(&labels, None, &field, MeanStat::default).unwrap();
        table.park(BoundaryKey::new(1, 2)).unwrap();
        assert_eq!(table.min_saliency().unwrap().0, BoundaryKey::new(2, 3));
        assert_eq!(table.candidates(), 1);
        assert_eq!(table.len(), 2);

        table.merge(2, 3, 4).unwrap();
        assert_eq!(table.min_saliency().unwrap().0, BoundaryKey::new(1, 4));
    }

    #[test]
    fn given_missing_key_when_erasing_then_boundary_not_found() {
        let mut table = BoundaryTable::<MeanStat>::new();
        assert_eq!(
            table.erase(BoundaryKey::new(1, 2)).unwrap_err(),
            DomainError::BoundaryNotFound(1, 2)
        );
    }

    #[test]
    fn given_saliency_override_when_selecting_then_new_order_applies() {
        let (labels, field) = strip();
        let mut table = BoundaryTable::from_image(&labels, None, &field, MeanStat::default).unwrap();
        table.set_saliency(BoundaryKey::new(2, 3), 0.0).unwrap();
        assert_eq!(table.min_saliency(), Some((BoundaryKey::new(2, 3), 0.0)));
    }
}

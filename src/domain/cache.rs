//! Memoized per-region reductions shared between worker threads.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::domain::entities::{EvidenceField, Label};
use crate::domain::region_map::Region;

/// Thread-safe label → value memo.
///
/// Labels are never reused for a different point set, so entries never go
/// stale while a hierarchy is being built or inspected.
#[derive(Debug, Default)]
pub struct RegionCache<V> {
    values: RwLock<HashMap<Label, V>>,
}

impl<V: Clone> RegionCache<V> {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, label: Label) -> Option<V> {
        self.values.read().get(&label).cloned()
    }

    pub fn insert(&self, label: Label, value: V) {
        self.values.write().insert(label, value);
    }

    /// Return the cached value or compute it outside the lock.
    ///
    /// Two threads racing on the same label may both compute; the first
    /// stored value wins.
    pub fn get_or_compute<F>(&self, label: Label, compute: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(v) = self.get(label) {
            return v;
        }
        let value = compute();
        self.values.write().entry(label).or_insert(value).clone()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

/// Mean evidence per region label.
pub type MeanEvidenceCache = RegionCache<f64>;

impl MeanEvidenceCache {
    pub fn mean_evidence(&self, region: &Region, field: &EvidenceField) -> f64 {
        self.get_or_compute(region.label(), || region.mean_over(field))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn given_cached_value_when_computing_again_then_closure_not_called() {
        let cache = RegionCache::new();
        assert_eq!(cache.get_or_compute(3, || 0.25), 0.25);
        assert_eq!(cache.get_or_compute(3, || panic!("recomputed")), 0.25);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn given_parallel_workers_when_filling_then_every_label_cached_once() {
        let cache: RegionCache<u64> = RegionCache::new();
        (0..1000u32).into_par_iter().for_each(|i| {
            let label = i % 10;
            let v = cache.get_or_compute(label, || u64::from(label) * 2);
            assert_eq!(v, u64::from(label) * 2);
        });
        assert_eq!(cache.len(), 10);
    }
}

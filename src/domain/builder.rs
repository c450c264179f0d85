//! Replays a merge order into a [`MergeTree`].

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, instrument};

use crate::domain::arena::{MergeTree, NodeId, TreeNode};
use crate::domain::entities::{Label, MergeEvent};
use crate::domain::error::{DomainError, DomainResult};

/// Constructs merge hierarchies from event lists.
///
/// Leaves come first (in order of first appearance in the events, after any
/// explicitly seeded labels), followed by one internal node per event, so
/// the i-th internal node corresponds to the i-th event.
#[derive(Debug, Default)]
pub struct TreeBuilder {
    seed_labels: BTreeSet<Label>,
    label_to_node: HashMap<Label, NodeId>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also create leaves for `labels`, including regions that never merge.
    pub fn with_leaves<I>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = Label>,
    {
        self.seed_labels.extend(labels);
        self
    }

    /// Build a tree with default payloads.
    pub fn build<T: Default>(&mut self, events: &[MergeEvent]) -> DomainResult<MergeTree<T>> {
        self.build_with(events, |_| {})
    }

    /// Build a tree, calling `decorate` on every node right after creation.
    #[instrument(level = "debug", skip(self, events, decorate), fields(events = events.len()))]
    pub fn build_with<T, F>(&mut self, events: &[MergeEvent], mut decorate: F) -> DomainResult<MergeTree<T>>
    where
        T: Default,
        F: FnMut(&mut TreeNode<T>),
    {
        self.label_to_node.clear();
        let leaves = self.leaf_labels(events)?;
        let mut tree = MergeTree::with_capacity(leaves.len() + events.len());

        for label in leaves {
            let idx = tree.insert_leaf(label, T::default());
            decorate(tree.node_mut(idx)?);
            self.label_to_node.insert(label, idx);
        }

        for (index, event) in events.iter().enumerate() {
            let a = self.take(index, event.a)?;
            let b = self.take(index, event.b)?;
            let idx = tree.insert_internal(event.merged, [a, b], T::default())?;
            decorate(tree.node_mut(idx)?);
            self.label_to_node.insert(event.merged, idx);
        }

        debug!(
            "build_with: nodes={} roots={}",
            tree.len(),
            self.label_to_node.len()
        );
        Ok(tree)
    }

    fn take(&mut self, index: usize, label: Label) -> DomainResult<NodeId> {
        self.label_to_node
            .remove(&label)
            .ok_or_else(|| DomainError::InvalidOrder {
                index,
                message: format!("label {label} has no current node"),
            })
    }

    /// Original labels: seeded ones first, then inputs that no earlier event produced.
    fn leaf_labels(&self, events: &[MergeEvent]) -> DomainResult<Vec<Label>> {
        let mut leaves: Vec<Label> = self.seed_labels.iter().copied().collect();
        let mut known: HashSet<Label> = self.seed_labels.iter().copied().collect();
        for (index, event) in events.iter().enumerate() {
            for label in [event.a, event.b] {
                if known.insert(label) {
                    leaves.push(label);
                }
            }
            if !known.insert(event.merged) {
                return Err(DomainError::InvalidOrder {
                    index,
                    message: format!("merged label {} already in use", event.merged),
                });
            }
        }
        Ok(leaves)
    }
}

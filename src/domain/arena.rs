use std::collections::VecDeque;
use std::fmt;

use generational_arena::{Arena, Index};
use tracing::instrument;

use crate::domain::entities::Label;
use crate::domain::error::{DomainError, DomainResult};

/// Handle of a node inside a [`MergeTree`].
pub type NodeId = Index;

/// Tree node in the arena-based merge hierarchy.
#[derive(Debug, Clone)]
pub struct TreeNode<T> {
    /// Region label this node stands for
    pub label: Label,
    /// Caller payload (classification state, diagnostics, ...)
    pub data: T,
    /// Index of parent node in the arena, None for roots
    pub parent: Option<NodeId>,
    /// Indices of child nodes in the arena; empty for leaves, two for merges
    pub children: Vec<NodeId>,
}

impl<T> TreeNode<T> {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

impl<T> fmt::Display for TreeNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Arena-based binary hierarchy: leaves are original regions, internal
/// nodes are merge events.
///
/// Nodes are never removed, so arena slots are dense and a node's
/// [`position`](MergeTree::position) runs from 0 to `len() - 1` in creation
/// order. Children are always created before their parent.
#[derive(Debug, Clone)]
pub struct MergeTree<T> {
    arena: Arena<TreeNode<T>>,
    order: Vec<NodeId>,
}

impl<T> Default for MergeTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MergeTree<T> {
    pub fn new() -> Self {
        Self {
            arena: Arena::new(),
            order: Vec::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            arena: Arena::with_capacity(n),
            order: Vec::with_capacity(n),
        }
    }

    #[instrument(level = "trace", skip(self, data))]
    pub fn insert_leaf(&mut self, label: Label, data: T) -> NodeId {
        let idx = self.arena.insert(TreeNode {
            label,
            data,
            parent: None,
            children: Vec::new(),
        });
        self.order.push(idx);
        idx
    }

    /// Create the parent of two existing roots.
    #[instrument(level = "trace", skip(self, data))]
    pub fn insert_internal(
        &mut self,
        label: Label,
        children: [NodeId; 2],
        data: T,
    ) -> DomainResult<NodeId> {
        for &c in &children {
            let child = self
                .arena
                .get(c)
                .ok_or(DomainError::InvalidNode(c.into_raw_parts().0))?;
            if child.parent.is_some() || children[0] == children[1] {
                return Err(DomainError::InvalidNode(c.into_raw_parts().0));
            }
        }
        let idx = self.arena.insert(TreeNode {
            label,
            data,
            parent: None,
            children: children.to_vec(),
        });
        for c in children {
            if let Some(child) = self.arena.get_mut(c) {
                child.parent = Some(idx);
            }
        }
        self.order.push(idx);
        Ok(idx)
    }

    pub fn get(&self, idx: NodeId) -> Option<&TreeNode<T>> {
        self.arena.get(idx)
    }

    pub fn get_mut(&mut self, idx: NodeId) -> Option<&mut TreeNode<T>> {
        self.arena.get_mut(idx)
    }

    /// Like [`get`](Self::get) but a miss is an error.
    pub fn node(&self, idx: NodeId) -> DomainResult<&TreeNode<T>> {
        self.arena
            .get(idx)
            .ok_or(DomainError::InvalidNode(idx.into_raw_parts().0))
    }

    pub fn node_mut(&mut self, idx: NodeId) -> DomainResult<&mut TreeNode<T>> {
        self.arena
            .get_mut(idx)
            .ok_or(DomainError::InvalidNode(idx.into_raw_parts().0))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Creation rank of a node, `0..len()`.
    pub fn position(&self, idx: NodeId) -> usize {
        idx.into_raw_parts().0
    }

    /// Node created at `position`.
    pub fn at(&self, position: usize) -> Option<NodeId> {
        self.order.get(position).copied()
    }

    /// Node handles in creation order (children before parents).
    pub fn ids(&self) -> &[NodeId] {
        &self.order
    }

    /// Nodes in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &TreeNode<T>)> + '_ {
        self.order
            .iter()
            .filter_map(move |&idx| self.arena.get(idx).map(|n| (idx, n)))
    }

    /// Parentless nodes in creation order; more than one for a forest.
    pub fn roots(&self) -> Vec<NodeId> {
        self.iter()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(idx, _)| idx)
            .collect()
    }

    /// The most recently created root (the last merge of the hierarchy).
    pub fn root(&self) -> Option<NodeId> {
        self.roots().last().copied()
    }

    pub fn is_leaf(&self, idx: NodeId) -> bool {
        self.get(idx).map_or(false, |n| n.is_leaf())
    }

    /// Pre-order descendants of `idx`, excluding `idx` itself.
    #[instrument(level = "trace", skip(self))]
    pub fn descendants(&self, idx: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = Vec::new();
        if let Some(node) = self.get(idx) {
            stack.extend(node.children.iter().rev());
        }
        while let Some(current) = stack.pop() {
            if let Some(node) = self.get(current) {
                out.push(current);
                // Push children in reverse order for left-to-right traversal
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Ancestors of `idx` from parent up to the root.
    #[instrument(level = "trace", skip(self))]
    pub fn ancestors(&self, idx: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut current = self.get(idx).and_then(|n| n.parent);
        while let Some(p) = current {
            out.push(p);
            current = self.get(p).and_then(|n| n.parent);
        }
        out
    }

    /// Apply `f` to every descendant of `idx` (pre-order).
    pub fn for_each_descendant_mut<F>(&mut self, idx: NodeId, mut f: F)
    where
        F: FnMut(&mut TreeNode<T>),
    {
        for d in self.descendants(idx) {
            if let Some(node) = self.arena.get_mut(d) {
                f(node);
            }
        }
    }

    /// Apply `f` to every ancestor of `idx`, nearest first.
    pub fn for_each_ancestor_mut<F>(&mut self, idx: NodeId, mut f: F)
    where
        F: FnMut(&mut TreeNode<T>),
    {
        let mut current = self.get(idx).and_then(|n| n.parent);
        while let Some(p) = current {
            match self.arena.get_mut(p) {
                Some(node) => {
                    f(node);
                    current = node.parent;
                }
                None => break,
            }
        }
    }

    /// Breadth-first order over every tree of the forest.
    pub fn breadth_first(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.len());
        let mut queue: VecDeque<NodeId> = self.roots().into();
        while let Some(current) = queue.pop_front() {
            if let Some(node) = self.get(current) {
                out.push(current);
                queue.extend(node.children.iter().copied());
            }
        }
        out
    }

    #[instrument(level = "trace", skip(self))]
    pub fn iter_preorder(&self) -> TreeIterator<'_, T> {
        TreeIterator::new(self)
    }

    #[instrument(level = "trace", skip(self))]
    pub fn iter_postorder(&self) -> PostOrderIterator<'_, T> {
        PostOrderIterator::new(self)
    }

    /// Number of levels of the deepest tree (0 for an empty tree).
    #[instrument(level = "debug", skip(self))]
    pub fn depth(&self) -> usize {
        let mut max_depth = 0;
        let mut stack: Vec<(NodeId, usize)> = self.roots().into_iter().map(|r| (r, 1)).collect();
        while let Some((current, depth)) = stack.pop() {
            max_depth = max_depth.max(depth);
            if let Some(node) = self.get(current) {
                stack.extend(node.children.iter().map(|&c| (c, depth + 1)));
            }
        }
        max_depth
    }

    /// Labels of all leaves in creation order.
    pub fn leaf_labels(&self) -> Vec<Label> {
        self.iter()
            .filter(|(_, n)| n.is_leaf())
            .map(|(_, n)| n.label)
            .collect()
    }
}

pub struct TreeIterator<'a, T> {
    tree: &'a MergeTree<T>,
    stack: Vec<NodeId>,
}

impl<'a, T> TreeIterator<'a, T> {
    fn new(tree: &'a MergeTree<T>) -> Self {
        let mut stack = tree.roots();
        stack.reverse();
        Self { tree, stack }
    }
}

impl<'a, T> Iterator for TreeIterator<'a, T> {
    type Item = (NodeId, &'a TreeNode<T>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current_idx) = self.stack.pop() {
            if let Some(node) = self.tree.get(current_idx) {
                // Push children in reverse order for left-to-right traversal
                for &child in node.children.iter().rev() {
                    self.stack.push(child);
                }
                return Some((current_idx, node));
            }
        }
        None
    }
}

pub struct PostOrderIterator<'a, T> {
    tree: &'a MergeTree<T>,
    stack: Vec<(NodeId, bool)>,
}

impl<'a, T> PostOrderIterator<'a, T> {
    fn new(tree: &'a MergeTree<T>) -> Self {
        let stack = tree.roots().into_iter().rev().map(|r| (r, false)).collect();
        Self { tree, stack }
    }
}

impl<'a, T> Iterator for PostOrderIterator<'a, T> {
    type Item = (NodeId, &'a TreeNode<T>);

    fn next(&mut self) -> Option<Self::Item> {
        while let Some((current_idx, visited)) = self.stack.pop() {
            if let Some(node) = self.tree.get(current_idx) {
                if !visited {
                    self.stack.push((current_idx, true));
                    for &child in node.children.iter().rev() {
                        self.stack.push((child, false));
                    }
                } else {
                    return Some((current_idx, node));
                }
            }
        }
        None
    }
}

/*
termtree rendering of merge hierarchies, used for debugging output.
Built iteratively: children are finished before their parent in post-order,
so deep hierarchies do not recurse.
 */
use std::collections::HashMap;
use std::fmt::Display;

use termtree::Tree;
use tracing::instrument;

use crate::domain::arena::{MergeTree, NodeId};

pub trait TreeNodeConvert {
    fn to_tree_string(&self) -> Tree<String>;
}

impl<T: Display> TreeNodeConvert for MergeTree<T> {
    #[instrument(level = "debug", skip(self))]
    fn to_tree_string(&self) -> Tree<String> {
        let mut done: HashMap<NodeId, Tree<String>> = HashMap::new();
        for (idx, node) in self.iter_postorder() {
            let leaves: Vec<_> = node
                .children
                .iter()
                .filter_map(|c| done.remove(c))
                .collect();
            let text = format!("{} {}", node.label, node.data);
            done.insert(idx, Tree::new(text.trim_end().to_string()).with_leaves(leaves));
        }

        let mut roots: Vec<_> = self
            .roots()
            .into_iter()
            .filter_map(|r| done.remove(&r))
            .collect();
        match roots.len() {
            0 => Tree::new("Empty tree".to_string()),
            1 => roots.remove(0),
            _ => Tree::new("forest".to_string()).with_leaves(roots),
        }
    }
}

//! Assign engine buffer indices to the nodes of a tree.
//!
//! # Buffer layout
//! The engine keeps tip states and partial likelihoods in separate arrays, so
//! the numbering is fixed: for a tree with `n` tips,
//!
//! - tips get `0..n` (compact tip-state buffers),
//! - internal nodes get `n..2n-1` (partial-likelihood buffers),
//! - the root gets the last index, `2n-2`.
//!
//! ```text
//!            root (6)
//!           /        \
//!        (4)          (5)
//!       /   \        /   \
//!     A(0)  B(1)   C(2)  D(3)
//! ```
//!
//! # Two phases
//! 1. A post-order walk numbers every tip as it is reached, and queues the
//!    internal nodes in the same post-order. Once the walk is done the queued
//!    internal nodes are numbered after the tips, so children always receive
//!    smaller indices than their parent and the root comes last.
//! 2. With every index known, each node becomes a typed [`NodeRecord`] whose
//!    neighbours are expressed as buffer indices, parent first.
//!
//! Indices live only in the [`IndexedTree`]; the parsed tree is never mutated
//! and a new numbering is computed for every tree.

use crate::error::{LikelihoodError, Result};
use phylotree::tree::{Tree as PhyloTree, TreeError};
use std::collections::{HashMap, HashSet};

/// A node of an indexed tree, addressed by its buffer index.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeRecord {
    Tip {
        name: String,
    },
    Internal {
        /// Adjacent nodes in tree order: the parent first (absent at the
        /// root), then the children.
        neighbours: Vec<usize>,
        /// Buffer index of the node this one is reached from when walking down
        /// from the root. `None` at the root.
        arrived_from: Option<usize>,
    },
}

impl NodeRecord {
    pub fn is_tip(&self) -> bool {
        matches!(self, NodeRecord::Tip { .. })
    }
}

/// A tree numbered in engine buffer order.
#[derive(Debug, Clone)]
pub struct IndexedTree {
    tip_count: usize,
    records: Vec<NodeRecord>,
    edge_lengths: Vec<f64>,
    root: usize,
}

impl IndexedTree {
    /// Assemble an indexed tree from records already in buffer order.
    ///
    /// Used by [`NodeIndexer`]; also handy for building shapes a parsed tree
    /// cannot express.
    pub fn from_records(records: Vec<NodeRecord>, edge_lengths: Vec<f64>, root: usize) -> Self {
        let tip_count = records.iter().filter(|r| r.is_tip()).count();
        Self {
            tip_count,
            records,
            edge_lengths,
            root,
        }
    }

    pub fn tip_count(&self) -> usize {
        self.tip_count
    }

    /// Number of buffers (and transition matrices), `2n-1` for a bifurcating tree.
    pub fn node_count(&self) -> usize {
        self.records.len()
    }

    /// Buffer index of the root.
    pub fn root(&self) -> usize {
        self.root
    }

    pub fn record(&self, index: usize) -> Option<&NodeRecord> {
        self.records.get(index)
    }

    /// Length of the edge above each node, by buffer index. 0 for the root.
    pub fn edge_lengths(&self) -> &[f64] {
        &self.edge_lengths
    }

    /// Tip buffer indices with their names, in index order.
    pub fn tips(&self) -> impl Iterator<Item = (usize, &str)> {
        self.records.iter().enumerate().filter_map(|(idx, r)| match r {
            NodeRecord::Tip { name } => Some((idx, name.as_str())),
            NodeRecord::Internal { .. } => None,
        })
    }

    /// Internal nodes in index order, which is post-order.
    pub fn internal_nodes(&self) -> impl Iterator<Item = (usize, &[usize], Option<usize>)> {
        self.records.iter().enumerate().filter_map(|(idx, r)| match r {
            NodeRecord::Internal {
                neighbours,
                arrived_from,
            } => Some((idx, neighbours.as_slice(), *arrived_from)),
            NodeRecord::Tip { .. } => None,
        })
    }
}

/// Numbers trees against an alignment of a known size.
#[derive(Debug, Clone, Copy)]
pub struct NodeIndexer {
    expected_tips: usize,
}

impl NodeIndexer {
    /// `expected_tips` is the number of sequences in the alignment.
    pub fn new(expected_tips: usize) -> Self {
        Self { expected_tips }
    }

    /// Compute buffer indices, node records and edge lengths for `tree`.
    ///
    /// # Errors
    /// - [`LikelihoodError::TipCountMismatch`] before any traversal when the
    ///   tree has a different number of tips than expected
    /// - [`LikelihoodError::UnnamedTip`] for a tip without a name
    /// - [`LikelihoodError::InvalidBranchLength`] for a negative or NaN edge length
    pub fn index(&self, tree: &PhyloTree) -> Result<IndexedTree> {
        let tips = tree.get_leaves().len();
        if tips != self.expected_tips {
            return Err(LikelihoodError::TipCountMismatch {
                sequences: self.expected_tips,
                tips,
            });
        }

        let root_id = tree.get_root().map_err(tree_error)?;
        let order = postorder(tree, root_id)?;

        // Phase 1: tips as they are reached, internal nodes afterwards.
        let mut buffer_of: HashMap<usize, usize> = HashMap::with_capacity(order.len());
        let mut internal = Vec::with_capacity(order.len().saturating_sub(tips));
        for &node_id in &order {
            let node = tree.get(&node_id).map_err(tree_error)?;
            if node.children.is_empty() {
                buffer_of.insert(node_id, buffer_of.len());
            } else {
                internal.push(node_id);
            }
        }
        for node_id in internal {
            buffer_of.insert(node_id, buffer_of.len());
        }

        // Phase 2: typed records by buffer index.
        let mut slots: Vec<Option<(NodeRecord, f64)>> = vec![None; order.len()];
        let mut names: HashSet<&str> = HashSet::with_capacity(tips);
        for &node_id in &order {
            let node = tree.get(&node_id).map_err(tree_error)?;
            let index = buffer_of[&node_id];

            let length = if node_id == root_id {
                0.0
            } else {
                node.parent_edge.unwrap_or(0.0)
            };
            if !(length >= 0.0) {
                return Err(LikelihoodError::InvalidBranchLength { index, length });
            }

            let record = if node.children.is_empty() {
                match node.name.as_deref() {
                    Some(name) if !name.is_empty() => {
                        if !names.insert(name) {
                            return Err(LikelihoodError::DuplicateTaxon(name.to_string()));
                        }
                        NodeRecord::Tip {
                            name: name.to_string(),
                        }
                    }
                    _ => return Err(LikelihoodError::UnnamedTip(index)),
                }
            } else {
                let arrived_from = match node.parent {
                    Some(parent) if node_id != root_id => Some(buffer_of[&parent]),
                    _ => None,
                };
                let neighbours = arrived_from
                    .into_iter()
                    .chain(node.children.iter().map(|child| buffer_of[child]))
                    .collect();
                NodeRecord::Internal {
                    neighbours,
                    arrived_from,
                }
            };
            slots[index] = Some((record, length));
        }

        let (records, edge_lengths): (Vec<_>, Vec<_>) = slots.into_iter().flatten().unzip();
        let root = buffer_of[&root_id];
        tracing::trace!(tips, nodes = records.len(), root, "indexed tree");

        Ok(IndexedTree {
            tip_count: tips,
            records,
            edge_lengths,
            root,
        })
    }
}

/// Post-order node ids below `root`, children left to right.
fn postorder(tree: &PhyloTree, root: usize) -> Result<Vec<usize>> {
    let mut order = Vec::new();
    let mut stack = vec![(root, false)];

    while let Some((node_id, expanded)) = stack.pop() {
        if expanded {
            order.push(node_id);
            continue;
        }
        stack.push((node_id, true));
        let node = tree.get(&node_id).map_err(tree_error)?;
        for &child in node.children.iter().rev() {
            stack.push((child, false));
        }
    }

    Ok(order)
}

fn tree_error(e: TreeError) -> LikelihoodError {
    LikelihoodError::Tree(e.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use crate::io::NewickTrees;

    pub(crate) fn parse(newick: &str) -> PhyloTree {
        PhyloTree::from_newick(newick).unwrap()
    }

    /// Build a random bifurcating newick string by repeatedly joining two of
    /// the remaining subtrees, picked by `choices`.
    pub(crate) fn random_newick(tips: usize, choices: &[usize], lengths: &[f64]) -> String {
        let mut subtrees: Vec<String> = (0..tips)
            .map(|i| format!("t{i}:{}", lengths[i % lengths.len()]))
            .collect();
        let mut step = 0;
        while subtrees.len() > 1 {
            let a = choices[step % choices.len()] % subtrees.len();
            let left = subtrees.swap_remove(a);
            let b = choices[(step + 1) % choices.len()] % subtrees.len();
            let right = subtrees.swap_remove(b);
            let length = lengths[(step + tips) % lengths.len()];
            if subtrees.is_empty() {
                subtrees.push(format!("({left},{right})"));
            } else {
                subtrees.push(format!("({left},{right}):{length}"));
            }
            step += 2;
        }
        format!("{};", subtrees[0])
    }

    /// Example tree
    ///
    /// ```text
    ///            root
    ///           /    \
    ///        node1    node2
    ///        /   \    /   \
    ///       A     B  C     D
    /// ```
    ///
    /// Tips are numbered first (A=0 .. D=3), then node1=4, node2=5, root=6.
    #[test]
    fn test_balanced_tree_indices() {
        let tree = parse("((A:0.1,B:0.2):0.3,(C:0.4,D:0.5):0.6);");
        let indexed = NodeIndexer::new(4).index(&tree).unwrap();

        assert_eq!(indexed.tip_count(), 4);
        assert_eq!(indexed.node_count(), 7);
        assert_eq!(indexed.root(), 6);

        let tips: Vec<_> = indexed.tips().collect();
        assert_eq!(tips, vec![(0, "A"), (1, "B"), (2, "C"), (3, "D")]);

        assert_eq!(
            indexed.record(4),
            Some(&NodeRecord::Internal {
                neighbours: vec![6, 0, 1],
                arrived_from: Some(6),
            })
        );
        assert_eq!(
            indexed.record(6),
            Some(&NodeRecord::Internal {
                neighbours: vec![4, 5],
                arrived_from: None,
            })
        );
        assert_eq!(indexed.edge_lengths(), &[0.1, 0.2, 0.4, 0.5, 0.3, 0.6, 0.0]);
    }

    /// Caterpillar: tips deep in the tree must still be numbered before any
    /// internal node.
    ///
    /// ```text
    ///     root
    ///    /    \
    ///   A     n1
    ///        /  \
    ///       B    n2
    ///           /  \
    ///          C    D
    /// ```
    #[test]
    fn test_caterpillar_tips_first() {
        let tree = parse("(A:1,(B:1,(C:1,D:1):1):1);");
        let indexed = NodeIndexer::new(4).index(&tree).unwrap();

        let tips: Vec<_> = indexed.tips().map(|(idx, _)| idx).collect();
        assert_eq!(tips, vec![0, 1, 2, 3]);

        let internal: Vec<_> = indexed.internal_nodes().map(|(idx, _, _)| idx).collect();
        assert_eq!(internal, vec![4, 5, 6]);

        // n2 (C,D) is the deepest internal node, so it comes first
        let (_, neighbours, parent) = indexed.internal_nodes().next().unwrap();
        assert_eq!(neighbours, &[5, 2, 3]);
        assert_eq!(parent, Some(5));
        assert_eq!(indexed.root(), 6);
    }

    #[test]
    fn test_root_edge_is_zero() {
        let tree = parse("((A:0.1,B:0.1):0.2,C:0.3):5.0;");
        let indexed = NodeIndexer::new(3).index(&tree).unwrap();
        assert_eq!(indexed.edge_lengths()[indexed.root()], 0.0);
    }

    #[test]
    fn test_missing_length_is_zero() {
        let tree = parse("((A,B:0.1),C:0.3);");
        let indexed = NodeIndexer::new(3).index(&tree).unwrap();
        assert_eq!(indexed.edge_lengths()[0], 0.0);
        assert_eq!(indexed.edge_lengths()[3], 0.0);
    }

    #[test]
    fn test_tip_count_mismatch() {
        let tree = parse("((A:0.1,B:0.1):0.2,C:0.3);");
        let err = NodeIndexer::new(4).index(&tree).unwrap_err();
        assert!(matches!(
            err,
            LikelihoodError::TipCountMismatch { sequences: 4, tips: 3 }
        ));
    }

    #[test]
    fn test_negative_length_rejected() {
        let tree = parse("((A:-0.1,B:0.1):0.2,C:0.3);");
        let err = NodeIndexer::new(3).index(&tree).unwrap_err();
        assert!(matches!(err, LikelihoodError::InvalidBranchLength { index: 0, .. }));
    }

    #[test]
    fn test_single_tip_never_reaches_indexer() {
        let mut reader = NewickTrees::new("A;".as_bytes());
        assert!(matches!(reader.next(), Some(Err(LikelihoodError::TreeParse(_)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_duplicate_tip_rejected() {
        let tree = parse("((A:0.1,A:0.1):0.1,(C:0.1,D:0.1):0.1);");
        let err = NodeIndexer::new(4).index(&tree).unwrap_err();
        assert!(matches!(&err, LikelihoodError::DuplicateTaxon(name) if name == "A"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    /// The child-identification rule relies on the parent being the first
    /// neighbour of every non-root internal node.
    #[test]
    fn test_parent_is_first_neighbour() {
        let tree = parse("(((A:1,B:1):1,C:1):1,((D:1,E:1):1,(F:1,G:1):1):1);");
        let indexed = NodeIndexer::new(7).index(&tree).unwrap();
        for (idx, neighbours, parent) in indexed.internal_nodes() {
            match parent {
                Some(parent) => {
                    assert_eq!(neighbours[0], parent, "node {idx}");
                    assert!(parent > idx);
                }
                None => assert_eq!(idx, indexed.root()),
            }
        }
    }

    proptest! {
        #[test]
        fn prop_index_ranges(
            tips in 2usize..40,
            choices in prop::collection::vec(0usize..1000, 1..80),
            lengths in prop::collection::vec(0.0f64..2.0, 1..10),
        ) {
            let tree = parse(&random_newick(tips, &choices, &lengths));
            let indexed = NodeIndexer::new(tips).index(&tree).unwrap();

            prop_assert_eq!(indexed.node_count(), 2 * tips - 1);
            prop_assert_eq!(indexed.root(), 2 * tips - 2);

            let mut tip_indices: Vec<_> = indexed.tips().map(|(i, _)| i).collect();
            tip_indices.sort_unstable();
            prop_assert_eq!(tip_indices, (0..tips).collect::<Vec<_>>());

            let internal: Vec<_> = indexed.internal_nodes().map(|(i, _, _)| i).collect();
            prop_assert_eq!(internal, (tips..2 * tips - 1).collect::<Vec<_>>());

            let mut names: Vec<_> = indexed.tips().map(|(_, n)| n.to_string()).collect();
            names.sort();
            names.dedup();
            prop_assert_eq!(names.len(), tips);
        }
    }
}

//! Build the list of pairwise-combine operations for an indexed tree.
//!
//! # Overview
//! Every internal node's partial likelihood is computed from its two
//! children through the transition matrices of their edges. One
//! [`Operation`] describes one such step; the [`OperationSchedule`] lists
//! them so that each child buffer is filled (as a tip, or by an earlier
//! operation) before it is read, ending at the root.
//!
//! Internal indices are assigned in post-order, so walking the internal nodes
//! by increasing index already is a valid bottom-up order.
//!
//! # Identifying the two children
//! - At the root, both neighbours are children.
//! - Any other internal node must have exactly three neighbours; the first is
//!   the node it was reached from and is skipped, the other two are the
//!   children in tree order.
//!
//! There is no path for multifurcations: any other degree aborts the tree.
//!
//! Each node has one transition matrix for the edge above it, so a child's
//! matrix index equals its buffer index.

use crate::error::{LikelihoodError, Result};
use crate::indexer::IndexedTree;

/// "Combine two children into a destination buffer."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub destination: usize,
    /// Scale buffer to write, `None` for no scaling.
    pub scale_write: Option<usize>,
    /// Scale buffer to read, `None` for no scaling.
    pub scale_read: Option<usize>,
    pub child1: usize,
    pub child1_matrix: usize,
    pub child2: usize,
    pub child2_matrix: usize,
}

impl Operation {
    /// Unscaled operation using each child's own matrix.
    pub fn combine(destination: usize, child1: usize, child2: usize) -> Self {
        Self {
            destination,
            scale_write: None,
            scale_read: None,
            child1,
            child1_matrix: child1,
            child2,
            child2_matrix: child2,
        }
    }
}

/// Ordered operations for one tree, bottom-up, ending at the root.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSchedule {
    operations: Vec<Operation>,
    root: usize,
}

impl OperationSchedule {
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Buffer holding the root partials once the schedule has run.
    pub fn root(&self) -> usize {
        self.root
    }
}

/// Build the schedule for an indexed tree.
///
/// # Errors
/// - [`LikelihoodError::RootDegree`] when the root does not have two children
/// - [`LikelihoodError::InternalDegree`] for a non-root internal node without
///   exactly three neighbours
/// - [`LikelihoodError::NeighbourOrder`] when the first neighbour of a non-root
///   internal node is not its parent
/// - [`LikelihoodError::EmptySchedule`] for a tree without internal nodes
pub fn build_schedule(tree: &IndexedTree) -> Result<OperationSchedule> {
    let mut operations = Vec::with_capacity(tree.tip_count().saturating_sub(1));

    for (index, neighbours, arrived_from) in tree.internal_nodes() {
        let (left, right) = children(index, neighbours, arrived_from)?;
        operations.push(Operation::combine(index, left, right));
    }

    if operations.is_empty() {
        return Err(LikelihoodError::EmptySchedule);
    }

    Ok(OperationSchedule {
        operations,
        root: tree.root(),
    })
}

fn children(index: usize, neighbours: &[usize], arrived_from: Option<usize>) -> Result<(usize, usize)> {
    match (arrived_from, neighbours) {
        (None, &[left, right]) => Ok((left, right)),
        (None, _) => Err(LikelihoodError::RootDegree(neighbours.len())),
        (Some(parent), &[first, left, right]) => {
            if first != parent {
                return Err(LikelihoodError::NeighbourOrder(index));
            }
            Ok((left, right))
        }
        (Some(_), _) => Err(LikelihoodError::InternalDegree {
            index,
            degree: neighbours.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::tests::{parse, random_newick};
    use crate::indexer::{NodeIndexer, NodeRecord};
    use proptest::prelude::*;

    fn schedule_for(newick: &str, tips: usize) -> Result<OperationSchedule> {
        let tree = parse(newick);
        build_schedule(&NodeIndexer::new(tips).index(&tree)?)
    }

    /// ```text
    ///            root(6)
    ///           /      \
    ///        (4)        (5)
    ///       /   \      /   \
    ///     A(0)  B(1) C(2)  D(3)
    /// ```
    #[test]
    fn test_balanced_schedule() {
        let schedule = schedule_for("((A:0.1,B:0.1):0.1,(C:0.1,D:0.1):0.1);", 4).unwrap();
        assert_eq!(
            schedule.operations(),
            &[
                Operation::combine(4, 0, 1),
                Operation::combine(5, 2, 3),
                Operation::combine(6, 4, 5),
            ]
        );
        assert_eq!(schedule.root(), 6);
    }

    #[test]
    fn test_operation_uses_child_matrices() {
        let op = Operation::combine(3, 0, 1);
        assert_eq!(op.child1_matrix, 0);
        assert_eq!(op.child2_matrix, 1);
        assert_eq!(op.scale_write, None);
        assert_eq!(op.scale_read, None);
    }

    #[test]
    fn test_three_tip_schedule() {
        // Same shape as ((A,B),C)
        let schedule = schedule_for("((A:0.1,B:0.1):0.1,C:0.2);", 3).unwrap();
        assert_eq!(
            schedule.operations(),
            &[Operation::combine(3, 0, 1), Operation::combine(4, 3, 2)]
        );
    }

    #[test]
    fn test_multifurcating_internal_node() {
        let err = schedule_for("((A:1,B:1,C:1):1,D:1);", 4).unwrap_err();
        assert!(matches!(err, LikelihoodError::InternalDegree { degree: 4, .. }));
    }

    #[test]
    fn test_unary_internal_node() {
        let err = schedule_for("(((A:1):1,B:1):1,C:1);", 3).unwrap_err();
        assert!(matches!(err, LikelihoodError::InternalDegree { degree: 2, .. }));
    }

    #[test]
    fn test_trifurcating_root() {
        let err = schedule_for("(A:1,B:1,C:1);", 3).unwrap_err();
        assert!(matches!(err, LikelihoodError::RootDegree(3)));
    }

    #[test]
    fn test_single_tip_has_no_operations() {
        let tree = IndexedTree::from_records(vec![NodeRecord::Tip { name: "A".into() }], vec![0.0], 0);
        let err = build_schedule(&tree).unwrap_err();
        assert!(matches!(err, LikelihoodError::EmptySchedule));
    }

    #[test]
    fn test_neighbour_order_violation() {
        // Node 3 claims to be reached from the root (4) but lists a tip first.
        let records = vec![
            NodeRecord::Tip { name: "A".into() },
            NodeRecord::Tip { name: "B".into() },
            NodeRecord::Tip { name: "C".into() },
            NodeRecord::Internal {
                neighbours: vec![0, 4, 1],
                arrived_from: Some(4),
            },
            NodeRecord::Internal {
                neighbours: vec![3, 2],
                arrived_from: None,
            },
        ];
        let tree = IndexedTree::from_records(records, vec![0.1; 5], 4);
        let err = build_schedule(&tree).unwrap_err();
        assert!(matches!(err, LikelihoodError::NeighbourOrder(3)));
    }

    proptest! {
        #[test]
        fn prop_schedule_is_bottom_up(
            tips in 2usize..40,
            choices in prop::collection::vec(0usize..1000, 1..80),
            lengths in prop::collection::vec(0.0f64..2.0, 1..10),
        ) {
            let schedule = schedule_for(&random_newick(tips, &choices, &lengths), tips).unwrap();
            prop_assert_eq!(schedule.len(), tips - 1);

            let mut ready = vec![false; 2 * tips - 1];
            ready[..tips].fill(true);
            for op in schedule.operations() {
                prop_assert!(ready[op.child1], "child {} read before written", op.child1);
                prop_assert!(ready[op.child2], "child {} read before written", op.child2);
                prop_assert!(!ready[op.destination]);
                ready[op.destination] = true;
            }
            prop_assert_eq!(schedule.operations().last().map(|op| op.destination), Some(2 * tips - 2));
            prop_assert!(ready.iter().all(|&r| r));
        }
    }
}

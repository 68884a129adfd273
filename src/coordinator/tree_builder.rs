//! Layer-wise construction of one decision tree.
//!
//! The coordinator and every worker hold one `TreeBuilder` per weak model
//! and feed it the same merged splits in the same order, so the node
//! numbering and open-node ordering agree on both sides without further
//! coordination.

use std::sync::Arc;

use crate::error::{Result, TrainError};
use crate::loss::{GradientStatistics, Loss};
use crate::model::tree::{DecisionTree, TreeNode};

use super::protocol::SplitPerOpenNode;

/// Maps the gradient statistics of a node to its leaf value.
pub type LeafValueFn = Arc<dyn Fn(&GradientStatistics) -> f32 + Send + Sync>;

/// Leaf setter folding the shrinkage into the stored values, so prediction
/// updates and the final model need no further scaling.
pub fn shrunk_leaf_value(loss: Arc<dyn Loss>, shrinkage: f32) -> LeafValueFn {
    Arc::new(move |statistics| shrinkage * loss.leaf_value(statistics))
}

pub struct TreeBuilder {
    tree: DecisionTree,
    open_nodes: Vec<u32>,
    statistics: Vec<GradientStatistics>,
    leaf_value: LeafValueFn,
}

impl TreeBuilder {
    /// A tree holding a single open root leaf.
    pub fn new(leaf_value: LeafValueFn) -> Self {
        Self {
            tree: DecisionTree::single_leaf(0.0),
            open_nodes: vec![0],
            statistics: vec![GradientStatistics::default()],
            leaf_value,
        }
    }

    /// Seeds the root with the gradient statistics of the full training
    /// set for this weak model.
    pub fn set_root_statistics(&mut self, statistics: &GradientStatistics) {
        self.statistics[0] = *statistics;
        let value = (self.leaf_value)(statistics);
        self.tree.set_leaf_value(0, value);
    }

    pub fn num_open_nodes(&self) -> usize {
        self.open_nodes.len()
    }

    /// Node ids of the open leaves, in open-node position order.
    pub fn open_nodes(&self) -> &[u32] {
        &self.open_nodes
    }

    pub fn statistics(&self, node: u32) -> &GradientStatistics {
        &self.statistics[node as usize]
    }

    /// Leaf value of a node; 0 for internal nodes.
    pub fn node_value(&self, node: u32) -> f32 {
        match self.tree.node(node) {
            TreeNode::Leaf { value } => *value,
            TreeNode::Split { .. } => 0.0,
        }
    }

    /// Children of a split node, `(negative, positive)`.
    pub fn children(&self, node: u32) -> Result<(u32, u32)> {
        match self.tree.node(node) {
            TreeNode::Split {
                negative, positive, ..
            } => Ok((*negative, *positive)),
            TreeNode::Leaf { .. } => Err(TrainError::internal(format!(
                "node {node} has no children"
            ))),
        }
    }

    /// Applies one layer of merged splits, indexed by open-node position.
    /// Open nodes with a valid split become internal nodes with two fresh
    /// open leaves; the others close.
    pub fn apply_splits(&mut self, splits: &SplitPerOpenNode) -> Result<()> {
        if splits.len() != self.open_nodes.len() {
            return Err(TrainError::internal(format!(
                "got {} splits for {} open nodes",
                splits.len(),
                self.open_nodes.len()
            )));
        }

        let open_nodes = std::mem::take(&mut self.open_nodes);
        for (node, split) in open_nodes.into_iter().zip(splits) {
            let Some(split) = split else { continue };

            let negative_value = (self.leaf_value)(&split.negative);
            let positive_value = (self.leaf_value)(&split.positive);
            let negative = self.tree.push_leaf(negative_value);
            self.statistics.push(split.negative);
            let positive = self.tree.push_leaf(positive_value);
            self.statistics.push(split.positive);

            self.tree
                .make_split(node, split.condition.clone(), negative, positive);
            self.open_nodes.push(negative);
            self.open_nodes.push(positive);
        }
        Ok(())
    }

    pub fn tree(&self) -> &DecisionTree {
        &self.tree
    }

    pub fn into_tree(self) -> DecisionTree {
        self.tree
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::coordinator::protocol::Split;
    use crate::model::tree::SplitCondition;

    fn identity_leaf() -> LeafValueFn {
        Arc::new(|stats: &GradientStatistics| {
            if stats.sum_hessian > 0.0 {
                (stats.sum_gradient / stats.sum_hessian) as f32
            } else {
                0.0
            }
        })
    }

    fn stats(sum_gradient: f64, count: u64) -> GradientStatistics {
        GradientStatistics {
            count,
            weight_sum: count as f64,
            sum_gradient,
            sum_hessian: count as f64,
        }
    }

    fn split(attribute: usize) -> Split {
        Split {
            condition: SplitCondition::NumericalThreshold {
                attribute,
                threshold: 1.0,
            },
            score: 1.0,
            negative: stats(-4.0, 2),
            positive: stats(4.0, 2),
        }
    }

    #[test]
    fn test_root_value_from_statistics() {
        let mut builder = TreeBuilder::new(identity_leaf());
        builder.set_root_statistics(&stats(8.0, 4));
        assert_relative_eq!(builder.node_value(0), 2.0);
        assert_eq!(builder.num_open_nodes(), 1);
    }

    #[test]
    fn test_apply_creates_children_in_position_order() {
        let mut builder = TreeBuilder::new(identity_leaf());
        builder.set_root_statistics(&stats(0.0, 4));
        builder.apply_splits(&vec![Some(split(0))]).unwrap();

        assert_eq!(builder.open_nodes(), &[1, 2]);
        let (negative, positive) = builder.children(0).unwrap();
        assert_eq!((negative, positive), (1, 2));
        assert_relative_eq!(builder.node_value(1), -2.0);
        assert_relative_eq!(builder.node_value(2), 2.0);
        assert_eq!(builder.statistics(2).count, 2);
    }

    #[test]
    fn test_invalid_split_closes_node() {
        let mut builder = TreeBuilder::new(identity_leaf());
        builder.set_root_statistics(&stats(0.0, 4));
        builder.apply_splits(&vec![None]).unwrap();

        assert_eq!(builder.num_open_nodes(), 0);
        assert_eq!(builder.tree().num_nodes(), 1);
    }

    #[test]
    fn test_split_count_mismatch() {
        let mut builder = TreeBuilder::new(identity_leaf());
        builder.set_root_statistics(&stats(0.0, 4));
        assert!(builder.apply_splits(&vec![None, None]).is_err());
    }

    #[test]
    fn test_two_layers() {
        let mut builder = TreeBuilder::new(identity_leaf());
        builder.set_root_statistics(&stats(0.0, 8));
        builder.apply_splits(&vec![Some(split(0))]).unwrap();
        // Split only the negative child; the positive child closes.
        builder
            .apply_splits(&vec![Some(split(1)), None])
            .unwrap();

        assert_eq!(builder.open_nodes(), &[3, 4]);
        assert_eq!(builder.tree().num_nodes(), 5);
    }
}

//! Decision tree structure shared by the coordinator and the workers.

use serde::{Deserialize, Serialize};

/// Dense bitset over categorical values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CategoryMask {
    words: Vec<u64>,
}

impl CategoryMask {
    /// Creates an empty mask able to hold `num_values` categories.
    pub fn with_capacity(num_values: usize) -> Self {
        Self {
            words: vec![0; num_values.div_ceil(64)],
        }
    }

    pub fn insert(&mut self, value: u32) {
        let word = value as usize / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (value % 64);
    }

    pub fn contains(&self, value: u32) -> bool {
        let word = value as usize / 64;
        self.words
            .get(word)
            .is_some_and(|w| w & (1u64 << (value % 64)) != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A single attribute value, typed the way the dataset cache stores the
/// column.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttributeValue {
    Numerical(f32),
    Discretized(u32),
    Categorical(u32),
}

/// Split condition attached to a decision node. Evaluating to `true`
/// routes the example to the positive child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SplitCondition {
    NumericalThreshold { attribute: usize, threshold: f32 },
    CategoricalMask { attribute: usize, mask: CategoryMask },
    DiscretizedBucket { attribute: usize, bucket: u32 },
}

impl SplitCondition {
    /// The attribute the condition tests.
    pub fn attribute(&self) -> usize {
        match self {
            Self::NumericalThreshold { attribute, .. }
            | Self::CategoricalMask { attribute, .. }
            | Self::DiscretizedBucket { attribute, .. } => *attribute,
        }
    }

    /// Evaluates the condition against an attribute value. Returns `None`
    /// when the value type does not match the condition type.
    pub fn evaluate(&self, value: AttributeValue) -> Option<bool> {
        match (self, value) {
            (Self::NumericalThreshold { threshold, .. }, AttributeValue::Numerical(v)) => {
                Some(v >= *threshold)
            }
            (Self::CategoricalMask { mask, .. }, AttributeValue::Categorical(v)) => {
                Some(mask.contains(v))
            }
            (Self::DiscretizedBucket { bucket, .. }, AttributeValue::Discretized(v)) => {
                Some(v >= *bucket)
            }
            _ => None,
        }
    }
}

/// A node of a decision tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TreeNode {
    Leaf {
        value: f32,
    },
    Split {
        condition: SplitCondition,
        negative: u32,
        positive: u32,
    },
}

impl TreeNode {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf { .. })
    }
}

/// A decision tree stored as a flat node arena; node 0 is the root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
}

impl DecisionTree {
    /// Creates a tree holding a single root leaf.
    pub fn single_leaf(value: f32) -> Self {
        Self {
            nodes: vec![TreeNode::Leaf { value }],
        }
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, idx: u32) -> &TreeNode {
        &self.nodes[idx as usize]
    }

    /// Appends a leaf and returns its index.
    pub fn push_leaf(&mut self, value: f32) -> u32 {
        self.nodes.push(TreeNode::Leaf { value });
        (self.nodes.len() - 1) as u32
    }

    /// Turns `node` into a split with the given children.
    pub fn make_split(&mut self, node: u32, condition: SplitCondition, negative: u32, positive: u32) {
        self.nodes[node as usize] = TreeNode::Split {
            condition,
            negative,
            positive,
        };
    }

    /// Overwrites the value of a leaf node.
    pub fn set_leaf_value(&mut self, node: u32, value: f32) {
        if let TreeNode::Leaf { value: v } = &mut self.nodes[node as usize] {
            *v = value;
        }
    }

    /// Walks the tree for one example. `lookup` maps an attribute index to
    /// its value for the example.
    pub fn predict(&self, lookup: &dyn Fn(usize) -> AttributeValue) -> f32 {
        let mut node = 0u32;
        loop {
            match &self.nodes[node as usize] {
                TreeNode::Leaf { value } => return *value,
                TreeNode::Split {
                    condition,
                    negative,
                    positive,
                } => {
                    let goes_positive = condition
                        .evaluate(lookup(condition.attribute()))
                        .unwrap_or(false);
                    node = if goes_positive { *positive } else { *negative };
                }
            }
        }
    }
}

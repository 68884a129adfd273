//! Gradient boosted decision tree ensemble model.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::{LossKind, Task};
use crate::error::{Result, TrainError};
use crate::storage;

pub mod tree;

pub use tree::{AttributeValue, CategoryMask, DecisionTree, SplitCondition, TreeNode};

/// One training-log entry, recorded at the end of every iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogEntry {
    pub number_of_trees: u64,
    pub training_loss: f64,
    pub training_secondary_metrics: Vec<f64>,
}

/// Per-iteration training measurements.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLogs {
    pub secondary_metric_names: Vec<String>,
    pub entries: Vec<TrainingLogEntry>,
}

impl TrainingLogs {
    /// Exports the logs as a tab-separated table under `directory`.
    pub fn export(&self, directory: &Path) -> Result<()> {
        storage::create_dir_all(directory)?;
        let mut text = String::from("number_of_trees\ttraining_loss");
        for name in &self.secondary_metric_names {
            text.push_str(&format!("\ttraining_{name}"));
        }
        text.push('\n');
        for entry in &self.entries {
            text.push_str(&format!(
                "{}\t{}",
                entry.number_of_trees, entry.training_loss
            ));
            for metric in &entry.training_secondary_metrics {
                text.push_str(&format!("\t{metric}"));
            }
            text.push('\n');
        }
        storage::atomic_write(&directory.join("training_logs.tsv"), text.as_bytes())
    }
}

/// A gradient boosted decision tree ensemble.
///
/// Each iteration appends `num_trees_per_iter` trees (one per weak model;
/// more than one only for multi-class losses).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GbdtModel {
    pub task: Task,
    pub loss: LossKind,
    /// Bias of the ensemble, one value per weak model.
    pub initial_predictions: Vec<f32>,
    pub num_trees_per_iter: usize,
    /// When true, predictions are raw margins; the link function has not
    /// been folded in.
    pub output_logits: bool,
    pub trees: Vec<DecisionTree>,
    pub training_logs: TrainingLogs,
}

impl GbdtModel {
    pub fn new(task: Task, loss: LossKind) -> Self {
        Self {
            task,
            loss,
            initial_predictions: Vec::new(),
            num_trees_per_iter: 0,
            output_logits: false,
            trees: Vec::new(),
            training_logs: TrainingLogs::default(),
        }
    }

    /// Number of completed boosting iterations.
    pub fn num_iterations(&self) -> u64 {
        if self.num_trees_per_iter == 0 {
            return 0;
        }
        (self.trees.len() / self.num_trees_per_iter) as u64
    }

    /// Appends the trees of one completed iteration.
    pub fn push_iteration(&mut self, trees: Vec<DecisionTree>) -> Result<()> {
        if trees.len() != self.num_trees_per_iter {
            return Err(TrainError::internal(format!(
                "expected {} trees per iteration, got {}",
                self.num_trees_per_iter,
                trees.len()
            )));
        }
        self.trees.extend(trees);
        Ok(())
    }

    /// Raw (margin-space) prediction for one example, one value per weak
    /// model. `lookup` maps an attribute index to the example's value.
    pub fn predict_raw(&self, lookup: &dyn Fn(usize) -> AttributeValue) -> Vec<f32> {
        let mut out = self.initial_predictions.clone();
        for (tree_idx, tree) in self.trees.iter().enumerate() {
            let weak_model_idx = tree_idx % self.num_trees_per_iter.max(1);
            out[weak_model_idx] += tree.predict(lookup);
        }
        out
    }

    /// Serializes the model to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        storage::write_bincode(path, self).map_err(|e| {
            TrainError::failed_precondition(format!(
                "cannot save model to {}: {e}",
                path.display()
            ))
        })
    }

    /// Loads a model from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        storage::read_bincode(path).map_err(|e| {
            TrainError::failed_precondition(format!(
                "cannot load model from {}: {e}",
                path.display()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stump_model() -> GbdtModel {
        let mut model = GbdtModel::new(Task::Regression, LossKind::SquaredError);
        model.initial_predictions = vec![1.0];
        model.num_trees_per_iter = 1;
        model.trees = vec![DecisionTree::single_leaf(0.5)];
        model.training_logs.entries.push(TrainingLogEntry {
            number_of_trees: 1,
            training_loss: 0.25,
            training_secondary_metrics: vec![0.25],
        });
        model
    }

    #[test]
    fn test_num_iterations() {
        let model = stump_model();
        assert_eq!(model.num_iterations(), 1);
    }

    #[test]
    fn test_push_iteration_count_mismatch() {
        let mut model = stump_model();
        let err = model.push_iteration(vec![]).unwrap_err();
        assert!(err.to_string().contains("trees per iteration"));
    }

    #[test]
    fn test_predict_raw_sums_trees() {
        let model = stump_model();
        let out = model.predict_raw(&|_| AttributeValue::Numerical(0.0));
        assert_eq!(out, vec![1.5]);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model");
        let model = stump_model();
        model.save(&path).unwrap();
        let loaded = GbdtModel::load(&path).unwrap();
        assert_eq!(loaded, model);
    }

    #[test]
    fn test_load_missing_model_is_failed_precondition() {
        let temp = TempDir::new().unwrap();
        let err = GbdtModel::load(&temp.path().join("absent")).unwrap_err();
        assert!(matches!(err, TrainError::FailedPrecondition { .. }));
    }

    #[test]
    fn test_training_logs_export() {
        let temp = TempDir::new().unwrap();
        let model = stump_model();
        model.training_logs.export(temp.path()).unwrap();
        let text = std::fs::read_to_string(temp.path().join("training_logs.tsv")).unwrap();
        assert!(text.starts_with("number_of_trees\ttraining_loss"));
        assert!(text.contains("1\t0.25"));
    }
}

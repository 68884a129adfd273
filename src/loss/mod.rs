//! Loss functions driving the gradient boosting.
//!
//! The coordinator only touches losses through the [`Loss`] trait and the
//! name-keyed [`LossRegistry`]; the math itself runs on the workers.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{LossKind, TrainingConfig};
use crate::error::{Result, TrainError};

pub mod classification;
pub mod regression;

pub use classification::BinomialLogLikelihood;
pub use regression::SquaredError;

/// Aggregate of the label column over the training data. Computed once at
/// bootstrap, persisted in every checkpoint, used to re-seed the loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LabelStatistics {
    Regression {
        count: u64,
        weight_sum: f64,
        sum: f64,
        sum_squares: f64,
    },
    Classification {
        count: u64,
        /// Total weight per class value.
        class_weights: Vec<f64>,
    },
}

impl LabelStatistics {
    /// Number of training examples (unweighted).
    pub fn num_examples(&self) -> u64 {
        match self {
            Self::Regression { count, .. } => *count,
            Self::Classification { count, .. } => *count,
        }
    }
}

/// Gradient aggregate of the examples reaching one tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GradientStatistics {
    pub count: u64,
    pub weight_sum: f64,
    pub sum_gradient: f64,
    pub sum_hessian: f64,
}

impl GradientStatistics {
    pub fn add_example(&mut self, gradient: f64, hessian: f64, weight: f64) {
        self.count += 1;
        self.weight_sum += weight;
        self.sum_gradient += gradient * weight;
        self.sum_hessian += hessian * weight;
    }

    pub fn merge(&mut self, other: &GradientStatistics) {
        self.count += other.count;
        self.weight_sum += other.weight_sum;
        self.sum_gradient += other.sum_gradient;
        self.sum_hessian += other.sum_hessian;
    }

    /// Statistics of the complement of `other` within `self`.
    pub fn subtract(&self, other: &GradientStatistics) -> GradientStatistics {
        GradientStatistics {
            count: self.count.saturating_sub(other.count),
            weight_sum: self.weight_sum - other.weight_sum,
            sum_gradient: self.sum_gradient - other.sum_gradient,
            sum_hessian: self.sum_hessian - other.sum_hessian,
        }
    }
}

/// Training loss and secondary metrics for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    pub metrics: Vec<f64>,
}

/// A differentiable loss. One weak model is grown per output.
pub trait Loss: Send + Sync {
    fn kind(&self) -> LossKind;

    fn secondary_metric_names(&self) -> Vec<String>;

    /// Ensemble bias from the label statistics, one value per weak model.
    fn initial_predictions(&self, statistics: &LabelStatistics) -> Result<Vec<f32>>;

    /// Gradient and hessian of one example for one output.
    fn gradient_and_hessian(&self, label: f32, prediction: f32) -> (f64, f64);

    /// Newton leaf value (before shrinkage).
    fn leaf_value(&self, statistics: &GradientStatistics) -> f32 {
        if statistics.sum_hessian <= f64::EPSILON {
            return 0.0;
        }
        (statistics.sum_gradient / statistics.sum_hessian) as f32
    }

    /// Training loss and secondary metrics over the full dataset.
    fn evaluate(
        &self,
        labels: &[f32],
        predictions: &[Vec<f32>],
        weights: Option<&[f32]>,
    ) -> Evaluation;

    /// Applies the link function to raw margins in place.
    fn apply_link(&self, margins: &mut [f32]);
}

pub type LossFactory = fn(&TrainingConfig) -> Result<Arc<dyn Loss>>;

/// Process-wide name → constructor table for losses. Built once at
/// initialization; lookup only afterwards.
pub struct LossRegistry {
    factories: HashMap<String, LossFactory>,
}

impl LossRegistry {
    /// Registry with the built-in losses registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(LossKind::SquaredError.name(), |_| {
            Ok(Arc::new(SquaredError) as Arc<dyn Loss>)
        });
        registry.register(LossKind::BinomialLogLikelihood.name(), |_| {
            Ok(Arc::new(BinomialLogLikelihood) as Arc<dyn Loss>)
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: LossFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn create_by_name(
        &self,
        name: &str,
        config: &TrainingConfig,
    ) -> Result<Arc<dyn Loss>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| TrainError::invalid_argument(format!("unknown loss '{name}'")))?;
        factory(config)
    }

    pub fn create(&self, kind: LossKind, config: &TrainingConfig) -> Result<Arc<dyn Loss>> {
        self.create_by_name(kind.name(), config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_statistics_accumulation() {
        let mut stats = GradientStatistics::default();
        stats.add_example(1.0, 1.0, 1.0);
        stats.add_example(3.0, 1.0, 2.0);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.weight_sum, 3.0);
        assert_eq!(stats.sum_gradient, 7.0);
        assert_eq!(stats.sum_hessian, 3.0);

        let mut other = GradientStatistics::default();
        other.add_example(1.0, 1.0, 1.0);
        let rest = stats.subtract(&other);
        assert_eq!(rest.count, 1);
        assert_eq!(rest.sum_gradient, 6.0);
    }

    #[test]
    fn test_registry_builtins() {
        let registry = LossRegistry::with_builtins();
        let config = TrainingConfig::default();
        let loss = registry.create(LossKind::SquaredError, &config).unwrap();
        assert_eq!(loss.kind(), LossKind::SquaredError);
        assert!(registry.create_by_name("no_such_loss", &config).is_err());
    }
}

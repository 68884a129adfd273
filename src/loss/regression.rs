//! Squared-error loss for regression.

use crate::config::LossKind;
use crate::error::{Result, TrainError};

use super::{Evaluation, LabelStatistics, Loss};

/// Least-squares regression loss. The reported training loss is the RMSE.
pub struct SquaredError;

impl Loss for SquaredError {
    fn kind(&self) -> LossKind {
        LossKind::SquaredError
    }

    fn secondary_metric_names(&self) -> Vec<String> {
        vec!["rmse".to_string()]
    }

    fn initial_predictions(&self, statistics: &LabelStatistics) -> Result<Vec<f32>> {
        match statistics {
            LabelStatistics::Regression {
                weight_sum, sum, ..
            } => {
                let mean = if *weight_sum > 0.0 { sum / weight_sum } else { 0.0 };
                Ok(vec![mean as f32])
            }
            LabelStatistics::Classification { .. } => Err(TrainError::internal(
                "squared error loss received classification label statistics",
            )),
        }
    }

    fn gradient_and_hessian(&self, label: f32, prediction: f32) -> (f64, f64) {
        ((label - prediction) as f64, 1.0)
    }

    fn evaluate(
        &self,
        labels: &[f32],
        predictions: &[Vec<f32>],
        weights: Option<&[f32]>,
    ) -> Evaluation {
        let predictions = &predictions[0];
        let mut sum_squares = 0.0f64;
        let mut weight_sum = 0.0f64;
        for (idx, (&label, &prediction)) in labels.iter().zip(predictions).enumerate() {
            let weight = weights.map(|w| w[idx] as f64).unwrap_or(1.0);
            let residual = (label - prediction) as f64;
            sum_squares += weight * residual * residual;
            weight_sum += weight;
        }
        let rmse = if weight_sum > 0.0 {
            (sum_squares / weight_sum).sqrt()
        } else {
            0.0
        };
        Evaluation {
            loss: rmse,
            metrics: vec![rmse],
        }
    }

    fn apply_link(&self, _margins: &mut [f32]) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initial_predictions_is_mean() {
        let stats = LabelStatistics::Regression {
            count: 4,
            weight_sum: 4.0,
            sum: 10.0,
            sum_squares: 30.0,
        };
        let init = SquaredError.initial_predictions(&stats).unwrap();
        assert_relative_eq!(init[0], 2.5);
    }

    #[test]
    fn test_gradient_is_residual() {
        let (gradient, hessian) = SquaredError.gradient_and_hessian(3.0, 1.0);
        assert_relative_eq!(gradient, 2.0);
        assert_relative_eq!(hessian, 1.0);
    }

    #[test]
    fn test_evaluate_rmse() {
        let labels = vec![1.0, 3.0];
        let predictions = vec![vec![1.0, 1.0]];
        let eval = SquaredError.evaluate(&labels, &predictions, None);
        assert_relative_eq!(eval.loss, 2.0f64.sqrt(), epsilon = 1e-9);
        assert_eq!(eval.metrics.len(), 1);
    }

    #[test]
    fn test_rejects_classification_statistics() {
        let stats = LabelStatistics::Classification {
            count: 2,
            class_weights: vec![1.0, 1.0],
        };
        assert!(SquaredError.initial_predictions(&stats).is_err());
    }
}

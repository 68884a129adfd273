//! Binomial log-likelihood loss for binary classification.

use crate::config::LossKind;
use crate::error::{Result, TrainError};

use super::{Evaluation, LabelStatistics, Loss};

/// Binary classification on log-odds margins. Labels are the class values
/// 0 and 1; one weak model is grown per iteration.
pub struct BinomialLogLikelihood;

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Numerically stable `ln(1 + exp(x))`.
fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

impl Loss for BinomialLogLikelihood {
    fn kind(&self) -> LossKind {
        LossKind::BinomialLogLikelihood
    }

    fn secondary_metric_names(&self) -> Vec<String> {
        vec!["accuracy".to_string()]
    }

    fn initial_predictions(&self, statistics: &LabelStatistics) -> Result<Vec<f32>> {
        match statistics {
            LabelStatistics::Classification { class_weights, .. } => {
                if class_weights.len() != 2 {
                    return Err(TrainError::invalid_argument(format!(
                        "binomial log-likelihood needs exactly 2 classes, got {}",
                        class_weights.len()
                    )));
                }
                let total: f64 = class_weights.iter().sum();
                if total <= 0.0 {
                    return Err(TrainError::invalid_argument("empty label column"));
                }
                let p = (class_weights[1] / total).clamp(1e-9, 1.0 - 1e-9);
                Ok(vec![(p / (1.0 - p)).ln() as f32])
            }
            LabelStatistics::Regression { .. } => Err(TrainError::internal(
                "binomial log-likelihood received regression label statistics",
            )),
        }
    }

    fn gradient_and_hessian(&self, label: f32, prediction: f32) -> (f64, f64) {
        let p = sigmoid(prediction as f64);
        let gradient = label as f64 - p;
        let hessian = (p * (1.0 - p)).max(1e-9);
        (gradient, hessian)
    }

    fn evaluate(
        &self,
        labels: &[f32],
        predictions: &[Vec<f32>],
        weights: Option<&[f32]>,
    ) -> Evaluation {
        let predictions = &predictions[0];
        let mut log_likelihood = 0.0f64;
        let mut correct = 0.0f64;
        let mut weight_sum = 0.0f64;
        for (idx, (&label, &prediction)) in labels.iter().zip(predictions).enumerate() {
            let weight = weights.map(|w| w[idx] as f64).unwrap_or(1.0);
            let margin = prediction as f64;
            log_likelihood += weight * (label as f64 * margin - log1p_exp(margin));
            let predicted_positive = margin > 0.0;
            if predicted_positive == (label > 0.5) {
                correct += weight;
            }
            weight_sum += weight;
        }
        if weight_sum <= 0.0 {
            return Evaluation::default();
        }
        Evaluation {
            loss: -2.0 * log_likelihood / weight_sum,
            metrics: vec![correct / weight_sum],
        }
    }

    fn apply_link(&self, margins: &mut [f32]) {
        for margin in margins {
            *margin = sigmoid(*margin as f64) as f32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_initial_predictions_log_odds() {
        let stats = LabelStatistics::Classification {
            count: 4,
            class_weights: vec![1.0, 3.0],
        };
        let init = BinomialLogLikelihood.initial_predictions(&stats).unwrap();
        assert_relative_eq!(init[0], (3.0f32 / 1.0).ln(), epsilon = 1e-6);
    }

    #[test]
    fn test_gradient_at_zero_margin() {
        let (gradient, hessian) = BinomialLogLikelihood.gradient_and_hessian(1.0, 0.0);
        assert_relative_eq!(gradient, 0.5);
        assert_relative_eq!(hessian, 0.25);
    }

    #[test]
    fn test_evaluate_accuracy() {
        let labels = vec![1.0, 0.0, 1.0];
        let predictions = vec![vec![2.0, -1.0, -0.5]];
        let eval = BinomialLogLikelihood.evaluate(&labels, &predictions, None);
        assert_relative_eq!(eval.metrics[0], 2.0 / 3.0, epsilon = 1e-9);
        assert!(eval.loss > 0.0);
    }

    #[test]
    fn test_rejects_multiclass() {
        let stats = LabelStatistics::Classification {
            count: 3,
            class_weights: vec![1.0, 1.0, 1.0],
        };
        assert!(BinomialLogLikelihood.initial_predictions(&stats).is_err());
    }

    #[test]
    fn test_link_is_sigmoid() {
        let mut margins = vec![0.0f32];
        BinomialLogLikelihood.apply_link(&mut margins);
        assert_relative_eq!(margins[0], 0.5);
    }
}

//! Candidate-feature sampling and routing.
//!
//! For each open node of each weak model, a uniform sample of candidate
//! features is drawn (shuffle + truncate), then each sampled feature is
//! routed to one of its owning workers. The output is shaped
//! `samples[worker][weak_model][node] → features` so one `FindSplits`
//! request per worker falls out directly.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};

use super::feature_ownership::FeatureOwnership;
use super::protocol::FeaturesPerWeakModelAndNode;

/// `samples[worker][weak_model][node]` lists the features the worker must
/// evaluate for the node.
pub type SampledFeatures = Vec<FeaturesPerWeakModelAndNode>;

/// Number of features to sample per open node.
fn num_sampled_features(config: &TrainingConfig, num_features: usize) -> usize {
    if config.num_candidate_attributes > 0 {
        return (config.num_candidate_attributes as usize).min(num_features);
    }
    let ratio = config.num_candidate_attributes_ratio;
    if ratio > 0.0 && ratio <= 1.0 {
        return ((ratio * num_features as f64).ceil() as usize).min(num_features);
    }
    num_features
}

/// Uniform sample without replacement of `num_sampled` features.
fn sample_features<R: Rng>(features: &[usize], num_sampled: usize, rng: &mut R) -> Vec<usize> {
    let mut sampled = features.to_vec();
    if num_sampled >= features.len() {
        return sampled;
    }
    sampled.shuffle(rng);
    sampled.truncate(num_sampled);
    sampled
}

/// Picks one owning worker for `feature`, uniformly among the owners when
/// there is more than one.
pub fn select_owner_worker<R: Rng>(
    ownership: &FeatureOwnership,
    feature: usize,
    rng: &mut R,
) -> Result<usize> {
    let owners = ownership.owners_of_feature(feature);
    match owners {
        [] => Err(TrainError::internal(format!(
            "no owning worker for feature {feature}"
        ))),
        [single] => Ok(*single),
        owners => Ok(owners[rng.gen_range(0..owners.len())]),
    }
}

/// Samples and routes the candidate features for every open node of every
/// weak model.
pub fn sample_input_features<R: Rng>(
    config: &TrainingConfig,
    num_workers: usize,
    features: &[usize],
    ownership: &FeatureOwnership,
    open_nodes_per_weak_model: &[usize],
    rng: &mut R,
) -> Result<SampledFeatures> {
    let num_sampled = num_sampled_features(config, features.len());
    let duplicate = config.internal.duplicate_computation_on_all_workers;

    let mut samples: SampledFeatures = (0..num_workers)
        .map(|_| {
            open_nodes_per_weak_model
                .iter()
                .map(|&open_nodes| vec![Vec::new(); open_nodes])
                .collect()
        })
        .collect();

    for (weak_model_idx, &open_nodes) in open_nodes_per_weak_model.iter().enumerate() {
        for node_idx in 0..open_nodes {
            let sampled = sample_features(features, num_sampled, rng);
            for feature in sampled {
                if duplicate {
                    for worker_samples in samples.iter_mut() {
                        worker_samples[weak_model_idx][node_idx].push(feature);
                    }
                } else {
                    let worker_idx = select_owner_worker(ownership, feature, rng)?;
                    samples[worker_idx][weak_model_idx][node_idx].push(feature);
                }
            }
        }
    }

    Ok(samples)
}

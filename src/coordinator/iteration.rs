//! One-iteration state machine.
//!
//! An iteration grows one round of trees (one per weak model) layer by
//! layer:
//!
//! ```text
//! StartNewIter → (loop) FindSplits → Merge
//!              → if no open node: break
//!              → ApplySplitsLocally → EvaluateSplits → ShareSplits
//!              → EndIter
//! ```
//!
//! Every broadcast is a fanout of W asynchronous requests followed by a
//! gather of exactly W replies; a `request_restart_iter` reply drains the
//! phase and unwinds as `DataLoss`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use rand::Rng;
use uuid::Uuid;

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};
use crate::loss::{Evaluation, GradientStatistics, LabelStatistics, Loss};
use crate::model::{GbdtModel, TrainingLogEntry};

use super::client::DistributionClient;
use super::feature_ownership::FeatureOwnership;
use super::monitoring::{Monitoring, Stage};
use super::protocol::{
    num_valid_splits, ReplyPayload, RequestPayload, Split, SplitPerOpenNode, WorkerRequest,
};
use super::sampler::{sample_input_features, select_owner_worker};
use super::split_merge::merge_best_splits;
use super::tree_builder::{shrunk_leaf_value, TreeBuilder};

/// One tree being grown in the current iteration.
pub struct WeakModel {
    pub tree_builder: TreeBuilder,
}

pub type WeakModels = Vec<WeakModel>;

fn unexpected_reply(expected: &str, got: &ReplyPayload) -> TrainError {
    TrainError::internal(format!(
        "unexpected answer. Expecting {expected}, got {}",
        got.kind()
    ))
}

/// Asks one worker for the aggregate label statistics.
pub async fn emit_get_label_statistics(
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<LabelStatistics> {
    monitoring.begin_stage(Stage::GetLabelStatistics);
    let reply = client
        .blocking_request(&WorkerRequest::new(RequestPayload::GetLabelStatistics), None)
        .await?;
    let statistics = match reply.payload {
        ReplyPayload::GetLabelStatistics { label_statistics } => label_statistics,
        other => return Err(unexpected_reply("GetLabelStatistics", &other)),
    };
    monitoring.end_stage(Stage::GetLabelStatistics);
    Ok(statistics)
}

/// Broadcasts the label statistics so every worker seeds its predictions.
pub async fn emit_set_initial_predictions(
    label_statistics: &LabelStatistics,
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::SetInitialPredictions);
    client
        .broadcast(
            |_| {
                WorkerRequest::new(RequestPayload::SetInitialPredictions {
                    label_statistics: label_statistics.clone(),
                })
            },
            |reply| match reply.payload {
                ReplyPayload::SetInitialPredictions => Ok(()),
                other => Err(unexpected_reply("SetInitialPredictions", &other)),
            },
        )
        .await?;
    monitoring.end_stage(Stage::SetInitialPredictions);
    Ok(())
}

/// Warns the workers that training starts; they load their dataset shards
/// before answering.
pub async fn emit_start_training(
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::StartTraining);
    let begin = Instant::now();
    client
        .broadcast(
            |_| WorkerRequest::new(RequestPayload::StartTraining),
            |reply| match reply.payload {
                ReplyPayload::StartTraining => Ok(()),
                other => Err(unexpected_reply("StartTraining", &other)),
            },
        )
        .await?;
    tracing::info!("Workers ready to train in {:?}", begin.elapsed());
    monitoring.end_stage(Stage::StartTraining);
    Ok(())
}

/// Seeds the iteration on every worker and collects the per-weak-model
/// root statistics. All workers answer the same statistics; the first
/// reply is kept and the rest are discarded.
pub async fn emit_start_new_iter(
    iter_idx: u64,
    seed: u64,
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<Vec<GradientStatistics>> {
    monitoring.begin_stage(Stage::StartNewIter);
    let iter_uid = Uuid::new_v4().to_string();
    let mut root_label_statistics: Option<Vec<GradientStatistics>> = None;
    client
        .broadcast(
            |_| {
                WorkerRequest::new(RequestPayload::StartNewIter {
                    iter_idx,
                    iter_uid: iter_uid.clone(),
                    seed,
                })
            },
            |reply| match reply.payload {
                ReplyPayload::StartNewIter {
                    root_label_statistics: statistics,
                } => {
                    if root_label_statistics.is_none() {
                        root_label_statistics = Some(statistics);
                    }
                    Ok(())
                }
                other => Err(unexpected_reply("StartNewIter", &other)),
            },
        )
        .await?;
    monitoring.end_stage(Stage::StartNewIter);
    root_label_statistics
        .ok_or_else(|| TrainError::internal("StartNewIter completed without any reply"))
}

/// Samples candidate features, fans them out and merges the best split
/// proposals as the replies arrive.
pub async fn emit_find_splits<R: Rng>(
    config: &TrainingConfig,
    features: &[usize],
    ownership: &FeatureOwnership,
    weak_models: &WeakModels,
    client: &DistributionClient,
    rng: &mut R,
    monitoring: &mut Monitoring,
) -> Result<Vec<SplitPerOpenNode>> {
    monitoring.begin_stage(Stage::FindSplits);
    let begin = Instant::now();

    let open_nodes_per_weak_model: Vec<usize> = weak_models
        .iter()
        .map(|weak_model| weak_model.tree_builder.num_open_nodes())
        .collect();
    let mut sampled = sample_input_features(
        config,
        client.num_workers(),
        features,
        ownership,
        &open_nodes_per_weak_model,
        rng,
    )?;

    for (worker_idx, features_per_weak_model) in sampled.drain(..).enumerate() {
        client.async_request(
            &WorkerRequest::new(RequestPayload::FindSplits {
                features_per_weak_model,
            }),
            worker_idx,
        )?;
    }

    let mut merged: Vec<SplitPerOpenNode> = open_nodes_per_weak_model
        .iter()
        .map(|&open_nodes| vec![None; open_nodes])
        .collect();
    let num_weak_models = weak_models.len();

    client
        .gather(client.num_workers(), |reply| {
            monitoring.find_split_reply_time(reply.worker_idx, begin.elapsed());
            let splits_per_weak_model = match reply.payload {
                ReplyPayload::FindSplits {
                    splits_per_weak_model,
                } => splits_per_weak_model,
                other => return Err(unexpected_reply("FindSplits", &other)),
            };
            if splits_per_weak_model.len() != num_weak_models {
                return Err(TrainError::internal(
                    "unexpected number of weak model splits",
                ));
            }
            for (weak_model_idx, worker_splits) in splits_per_weak_model.into_iter().enumerate() {
                merge_best_splits(worker_splits, &mut merged[weak_model_idx])?;
            }
            Ok(())
        })
        .await?;

    monitoring.end_stage(Stage::FindSplits);
    Ok(merged)
}

/// Picks one owning worker per valid split; `active[worker][weak_model]`
/// lists the split positions the worker evaluates.
fn build_active_workers<R: Rng>(
    splits_per_weak_models: &[SplitPerOpenNode],
    ownership: &FeatureOwnership,
    rng: &mut R,
) -> Result<BTreeMap<usize, Vec<Vec<usize>>>> {
    let mut active_workers: BTreeMap<usize, Vec<Vec<usize>>> = BTreeMap::new();
    for (weak_model_idx, splits) in splits_per_weak_models.iter().enumerate() {
        for (split_idx, split) in splits.iter().enumerate() {
            let Some(split) = split else { continue };
            let worker_idx =
                select_owner_worker(ownership, split.condition.attribute(), rng)?;
            let worker_splits = active_workers
                .entry(worker_idx)
                .or_insert_with(|| vec![Vec::new(); splits_per_weak_models.len()]);
            worker_splits[weak_model_idx].push(split_idx);
        }
    }
    Ok(active_workers)
}

/// Sends each merged split to one owning worker for evaluation against its
/// example→node mapping. Returns the active worker set.
pub async fn emit_evaluate_splits<R: Rng>(
    splits_per_weak_models: &[SplitPerOpenNode],
    ownership: &FeatureOwnership,
    client: &DistributionClient,
    rng: &mut R,
    monitoring: &mut Monitoring,
) -> Result<Vec<usize>> {
    monitoring.begin_stage(Stage::EvaluateSplits);

    let active_workers = build_active_workers(splits_per_weak_models, ownership, rng)?;
    let active_worker_idxs: Vec<usize> = active_workers.keys().copied().collect();

    for (&worker_idx, split_idxs_per_weak_model) in &active_workers {
        let splits_per_weak_model: Vec<Vec<(usize, Split)>> = split_idxs_per_weak_model
            .iter()
            .enumerate()
            .map(|(weak_model_idx, split_idxs)| {
                split_idxs
                    .iter()
                    .map(|&split_idx| {
                        let split = splits_per_weak_models[weak_model_idx][split_idx]
                            .clone()
                            .ok_or_else(|| {
                                TrainError::internal("active split slot is empty")
                            })?;
                        Ok((split_idx, split))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        client.async_request(
            &WorkerRequest::new(RequestPayload::EvaluateSplits {
                splits_per_weak_model,
            }),
            worker_idx,
        )?;
    }

    client
        .gather(active_workers.len(), |reply| match reply.payload {
            ReplyPayload::EvaluateSplits => Ok(()),
            other => Err(unexpected_reply("EvaluateSplits", &other)),
        })
        .await?;

    monitoring.end_stage(Stage::EvaluateSplits);
    Ok(active_worker_idxs)
}

/// Broadcasts the merged splits and the active worker set; every worker
/// updates its example→node mapping.
pub async fn emit_share_splits(
    splits_per_weak_models: &[SplitPerOpenNode],
    active_workers: &[usize],
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::ShareSplits);
    client
        .broadcast(
            |_| {
                WorkerRequest::new(RequestPayload::ShareSplits {
                    splits_per_weak_model: splits_per_weak_models.to_vec(),
                    active_workers: active_workers.to_vec(),
                })
            },
            |reply| match reply.payload {
                ReplyPayload::ShareSplits => Ok(()),
                other => Err(unexpected_reply("ShareSplits", &other)),
            },
        )
        .await?;
    monitoring.end_stage(Stage::ShareSplits);
    Ok(())
}

/// Closes the iteration. Worker 0 computes and returns the training loss.
pub async fn emit_end_iter(
    iter_idx: u64,
    client: &DistributionClient,
    training_evaluation: &mut Evaluation,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::EndIter);
    let mut received_evaluation = false;
    client
        .broadcast(
            |worker_idx| {
                WorkerRequest::new(RequestPayload::EndIter {
                    iter_idx,
                    // The first worker is in charge of computing the loss.
                    compute_training_loss: worker_idx == 0,
                })
            },
            |reply| {
                let evaluation = match reply.payload {
                    ReplyPayload::EndIter { evaluation } => evaluation,
                    other => return Err(unexpected_reply("EndIter", &other)),
                };
                if let Some(evaluation) = evaluation {
                    if reply.worker_idx != 0 {
                        return Err(TrainError::internal("receiving a non requested loss"));
                    }
                    *training_evaluation = evaluation;
                    received_evaluation = true;
                }
                Ok(())
            },
        )
        .await?;
    if !received_evaluation {
        return Err(TrainError::internal(
            "EndIter completed without a training loss",
        ));
    }
    monitoring.end_stage(Stage::EndIter);
    Ok(())
}

/// Human-readable per-iteration training log line.
pub fn training_log(
    model: &GbdtModel,
    training_evaluation: &Evaluation,
    config: &TrainingConfig,
    metric_names: &[String],
    monitoring: &Monitoring,
) -> String {
    let mut log = format!(
        "num-trees:{}/{} train-loss:{}",
        model.num_iterations(),
        config.num_trees,
        training_evaluation.loss
    );
    for (metric_name, value) in metric_names.iter().zip(&training_evaluation.metrics) {
        log.push_str(&format!(" train-{metric_name}:{value}"));
    }
    log.push(' ');
    log.push_str(&monitoring.inline_logs());
    log
}

/// Runs one full iteration and appends the finished trees to the model.
#[allow(clippy::too_many_arguments)]
pub async fn run_iteration<R: Rng>(
    iter_idx: u64,
    config: &TrainingConfig,
    loss: &Arc<dyn Loss>,
    ownership: &FeatureOwnership,
    features: &[usize],
    metric_names: &[String],
    model: &mut GbdtModel,
    training_evaluation: &mut Evaluation,
    client: &DistributionClient,
    rng: &mut R,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.new_iter();
    let seed = rng.gen::<u64>();
    let root_label_statistics =
        emit_start_new_iter(iter_idx, seed, client, monitoring).await?;
    if root_label_statistics.len() != model.num_trees_per_iter {
        return Err(TrainError::internal(format!(
            "expected root statistics for {} weak models, got {}",
            model.num_trees_per_iter,
            root_label_statistics.len()
        )));
    }

    let leaf_value = shrunk_leaf_value(loss.clone(), config.shrinkage);
    let mut weak_models: WeakModels = root_label_statistics
        .iter()
        .map(|statistics| {
            let mut tree_builder = TreeBuilder::new(leaf_value.clone());
            tree_builder.set_root_statistics(statistics);
            WeakModel { tree_builder }
        })
        .collect();

    for _layer_idx in 0..config.max_depth.saturating_sub(1) {
        let splits_per_weak_models =
            emit_find_splits(config, features, ownership, &weak_models, client, rng, monitoring)
                .await?;

        let has_open_node = splits_per_weak_models
            .iter()
            .any(|splits| num_valid_splits(splits) > 0);
        if !has_open_node {
            break;
        }

        for (weak_model, splits) in weak_models.iter_mut().zip(&splits_per_weak_models) {
            weak_model.tree_builder.apply_splits(splits)?;
        }

        let active_workers =
            emit_evaluate_splits(&splits_per_weak_models, ownership, client, rng, monitoring)
                .await?;
        emit_share_splits(&splits_per_weak_models, &active_workers, client, monitoring).await?;
    }

    emit_end_iter(iter_idx, client, training_evaluation, monitoring).await?;

    let trees = weak_models
        .into_iter()
        .map(|weak_model| weak_model.tree_builder.into_tree())
        .collect();
    model.push_iteration(trees)?;

    if monitoring.should_display_logs() {
        tracing::info!(
            "{}",
            training_log(model, training_evaluation, config, metric_names, monitoring)
        );
    }

    model.training_logs.entries.push(TrainingLogEntry {
        number_of_trees: iter_idx + 1,
        training_loss: training_evaluation.loss,
        training_secondary_metrics: training_evaluation.metrics.clone(),
    });

    if let Some(log_directory) = &config.log_directory {
        let export_every = config.export_logs_during_training_in_trees;
        if export_every > 0 && (iter_idx + 1) % export_every == 0 {
            let begin = Instant::now();
            model.training_logs.export(log_directory)?;
            tracing::info!("Training logs exported in {:?}", begin.elapsed());
        }
    }

    Ok(())
}

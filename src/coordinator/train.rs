//! Outer training loop: work-directory bootstrap, checkpoint scheduling
//! and `DataLoss` recovery.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{
    check_deployment, link_training_config, DeploymentConfig, TrainingConfig,
    TrainingConfigLinking,
};
use crate::dataset::cache::{self, DatasetCacheReader};
use crate::distribute::{ManagerRegistry, WorkerRegistry};
use crate::error::{Result, TrainError};
use crate::loss::{Evaluation, LabelStatistics, Loss, LossRegistry};
use crate::model::GbdtModel;
use crate::storage;
use crate::worker;

use super::checkpoint;
use super::client::DistributionClient;
use super::feature_ownership::{assign_features_to_workers, FeatureOwnership};
use super::iteration;
use super::monitoring::Monitoring;
use super::protocol::WorkerWelcome;
use super::snapshot;

/// Splits a typed dataset path `<format>:<path>` into its parts.
fn parse_typed_path(typed_path: &str) -> Result<(&str, &str)> {
    typed_path.split_once(':').ok_or_else(|| {
        TrainError::invalid_argument(format!(
            "dataset path '{typed_path}' must be typed as '<format>:<path>'"
        ))
    })
}

/// Distributed gradient boosted trees learner.
///
/// Drives one training run to completion over a fleet of workers holding
/// disjoint subsets of the feature columns. Supports resuming a run from
/// its last committed checkpoint.
pub struct DistributedGbdtLearner {
    training: TrainingConfig,
    deployment: DeploymentConfig,
    worker_registry: WorkerRegistry,
    manager_registry: ManagerRegistry,
}

impl DistributedGbdtLearner {
    pub fn new(training: TrainingConfig, deployment: DeploymentConfig) -> Self {
        Self {
            training,
            deployment,
            worker_registry: worker::default_worker_registry(),
            manager_registry: ManagerRegistry::with_builtins(),
        }
    }

    /// Replaces the worker registry, e.g. to inject fault schedules.
    pub fn with_worker_registry(mut self, worker_registry: WorkerRegistry) -> Self {
        self.worker_registry = worker_registry;
        self
    }

    /// In-memory training is rejected: this learner only trains from a
    /// dataset cache path.
    pub fn train_from_memory(&self) -> Result<GbdtModel> {
        Err(TrainError::invalid_argument(
            "the distributed gradient boosted trees learner does not support \
             training from in-memory datasets. If the dataset is small, use a \
             non-distributed learner; if it is large, provide the dataset as a \
             typed path.",
        ))
    }

    /// Trains a model from a typed dataset path (`cache:<dir>` or
    /// `partial_cache:<dir>`).
    pub async fn train(&self, typed_dataset_path: &str) -> Result<GbdtModel> {
        let begin_training = Instant::now();

        let mut config = self.training.clone();
        config.set_default_hyper_parameters()?;
        check_deployment(&self.deployment)?;

        // Resolve the work directory: resuming reuses the cache path
        // directly, otherwise a unique run-id subdirectory is appended.
        let mut deployment = self.deployment.clone();
        let work_directory = if deployment.try_resume_training {
            deployment.cache_path.clone()
        } else {
            deployment.cache_path.join(format!(
                "{}_{}",
                rand::random::<u32>(),
                chrono::Utc::now().timestamp_micros()
            ))
        };
        deployment.distribute.working_directory = work_directory.clone();

        let (format, path) = parse_typed_path(typed_dataset_path)?;
        let dataset_cache_path = match format {
            "cache" => PathBuf::from(path),
            "partial_cache" => {
                let path = PathBuf::from(path);
                if cache::is_partial_dataset_cache(&path) {
                    tracing::info!("Finalizing partial dataset cache");
                    cache::finalize_partial_cache(&path)?;
                }
                path
            }
            other => {
                return Err(TrainError::invalid_argument(format!(
                    "unsupported dataset format '{other}'. Expected 'cache' or \
                     'partial_cache'"
                )));
            }
        };

        let model = train_with_cache(
            &config,
            &deployment,
            &dataset_cache_path,
            &work_directory,
            &self.worker_registry,
            &self.manager_registry,
        )
        .await?;
        tracing::info!("Training done in {:?}", begin_training.elapsed());
        Ok(model)
    }
}

fn initialize_directory_structure(work_directory: &Path) -> Result<()> {
    storage::create_dir_all(work_directory)?;
    storage::create_dir_all(&checkpoint::snapshot_dir(work_directory))?;
    storage::create_dir_all(&checkpoint::tmp_dir(work_directory))?;
    Ok(())
}

async fn train_with_cache(
    config: &TrainingConfig,
    deployment: &DeploymentConfig,
    cache_path: &Path,
    work_directory: &Path,
    worker_registry: &WorkerRegistry,
    manager_registry: &ManagerRegistry,
) -> Result<GbdtModel> {
    initialize_directory_structure(work_directory)?;

    let metadata = DatasetCacheReader::open(cache_path)?.metadata().clone();
    let config_link = link_training_config(config, &metadata)?;

    let loss_kind = config
        .loss
        .ok_or_else(|| TrainError::internal("loss was not resolved at bootstrap"))?;
    let loss = LossRegistry::with_builtins().create(loss_kind, config)?;

    // Allocate each feature to a worker.
    let ownership = assign_features_to_workers(
        &config_link.features,
        deployment.num_workers,
        &metadata,
        config.internal.duplicate_computation_on_all_workers,
    )?;

    let welcome = WorkerWelcome {
        work_directory: work_directory.to_path_buf(),
        cache_path: cache_path.to_path_buf(),
        train_config: config.clone(),
        config_link: config_link.clone(),
        deployment: deployment.clone(),
        owned_features: ownership.worker_features().to_vec(),
    };
    let worker_factory = worker_registry.factory(worker::TRAINER_WORKER)?;
    let manager = manager_registry.create_manager(
        &deployment.distribute,
        deployment.num_workers,
        worker_factory,
        welcome.to_blob()?,
    )?;
    let client = DistributionClient::new(manager);

    let mut monitoring = Monitoring::new();
    let mut rng = StdRng::seed_from_u64(config.random_seed);

    run_training(
        config,
        &config_link,
        &loss,
        &ownership,
        work_directory,
        &client,
        &mut rng,
        &mut monitoring,
    )
    .await
}

/// Initializes a fresh model: label statistics from one worker, initial
/// predictions from the loss, broadcast to every worker.
async fn bootstrap_model(
    config: &TrainingConfig,
    loss: &Arc<dyn Loss>,
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<(GbdtModel, LabelStatistics)> {
    let loss_kind = config
        .loss
        .ok_or_else(|| TrainError::internal("loss was not resolved at bootstrap"))?;
    let mut model = GbdtModel::new(config.task, loss_kind);
    model.training_logs.secondary_metric_names = loss.secondary_metric_names();
    model.output_logits = !config.apply_link_function;

    tracing::info!("Asking one worker for the initial label statistics");
    let label_statistics = iteration::emit_get_label_statistics(client, monitoring).await?;

    let initial_predictions = loss.initial_predictions(&label_statistics)?;
    model.num_trees_per_iter = initial_predictions.len();
    model.initial_predictions = initial_predictions;

    iteration::emit_set_initial_predictions(&label_statistics, client, monitoring).await?;
    Ok((model, label_statistics))
}

#[allow(clippy::too_many_arguments)]
async fn run_training(
    config: &TrainingConfig,
    config_link: &TrainingConfigLinking,
    loss: &Arc<dyn Loss>,
    ownership: &FeatureOwnership,
    work_directory: &Path,
    client: &DistributionClient,
    rng: &mut StdRng,
    monitoring: &mut Monitoring,
) -> Result<GbdtModel> {
    let metric_names = loss.secondary_metric_names();
    let features = &config_link.features;

    let mut iter_idx: u64;
    let mut minimum_iter_for_new_checkpoint: u64;
    let mut last_checkpoint_idx: Option<u64>;
    let mut model: GbdtModel;
    let mut label_statistics: LabelStatistics;

    match snapshot::greatest_snapshot(&checkpoint::snapshot_dir(work_directory))? {
        Some(snapshot_idx) => {
            // Resume from the last committed checkpoint.
            tracing::info!("Resume training from iteration #{snapshot_idx}");
            let (restored, metadata) =
                checkpoint::restore_manager_checkpoint(snapshot_idx, work_directory)?;
            checkpoint::emit_restore_checkpoint(
                snapshot_idx,
                metadata.num_shards,
                restored.num_trees_per_iter,
                client,
                monitoring,
            )
            .await?;
            model = restored;
            label_statistics = metadata.label_statistics;
            iter_idx = snapshot_idx;
            minimum_iter_for_new_checkpoint = snapshot_idx + 1;
            last_checkpoint_idx = Some(snapshot_idx);
        }
        None => {
            let (fresh, statistics) = bootstrap_model(config, loss, client, monitoring).await?;
            model = fresh;
            label_statistics = statistics;
            iter_idx = 0;
            minimum_iter_for_new_checkpoint = 0;
            last_checkpoint_idx = None;
        }
    }

    // Workers load their dataset shards before answering.
    iteration::emit_start_training(client, monitoring).await?;

    let mut training_evaluation = Evaluation::default();
    let mut time_last_checkpoint = Instant::now();

    tracing::info!("Start training");
    while iter_idx < config.num_trees {
        if iter_idx >= minimum_iter_for_new_checkpoint
            && checkpoint::should_create_checkpoint(iter_idx, time_last_checkpoint, config)
            && last_checkpoint_idx.is_none_or(|last| iter_idx > last)
        {
            time_last_checkpoint = Instant::now();
            last_checkpoint_idx = Some(iter_idx);
            checkpoint::create_checkpoint(
                iter_idx,
                &model,
                work_directory,
                &label_statistics,
                client,
                monitoring,
            )
            .await?;
        }

        let iter_result = iteration::run_iteration(
            iter_idx,
            config,
            loss,
            ownership,
            features,
            &metric_names,
            &mut model,
            &mut training_evaluation,
            client,
            rng,
            monitoring,
        )
        .await;

        match iter_result {
            Ok(()) => iter_idx += 1,
            Err(error) if error.is_data_loss() => {
                // A worker was restarted and is missing data.
                tracing::warn!("Iteration issue: {error}");
                tracing::warn!("Re-synchronizing the workers");
                match snapshot::greatest_snapshot(&checkpoint::snapshot_dir(work_directory))? {
                    Some(resync_iter_idx) => {
                        let (restored, metadata) = checkpoint::restore_manager_checkpoint(
                            resync_iter_idx,
                            work_directory,
                        )?;
                        checkpoint::emit_restore_checkpoint(
                            resync_iter_idx,
                            metadata.num_shards,
                            restored.num_trees_per_iter,
                            client,
                            monitoring,
                        )
                        .await?;
                        model = restored;
                        label_statistics = metadata.label_statistics;
                        iter_idx = resync_iter_idx;
                        minimum_iter_for_new_checkpoint = resync_iter_idx + 1;
                        last_checkpoint_idx = Some(resync_iter_idx);
                    }
                    None => {
                        tracing::warn!(
                            "No existing snapshot. Restarting training from the start."
                        );
                        let (fresh, statistics) =
                            bootstrap_model(config, loss, client, monitoring).await?;
                        model = fresh;
                        label_statistics = statistics;
                        iter_idx = 0;
                        minimum_iter_for_new_checkpoint = 0;
                        last_checkpoint_idx = None;
                    }
                }
            }
            Err(error) => return Err(error),
        }
    }

    if last_checkpoint_idx.is_none_or(|last| iter_idx > last) {
        checkpoint::create_checkpoint(
            iter_idx,
            &model,
            work_directory,
            &label_statistics,
            client,
            monitoring,
        )
        .await?;
    }

    tracing::info!(
        "Training done. Final model: {}",
        iteration::training_log(&model, &training_evaluation, config, &metric_names, monitoring)
    );
    if let Some(log_directory) = &config.log_directory {
        model.training_logs.export(log_directory)?;
    }

    client.shutdown().await?;
    Ok(model)
}

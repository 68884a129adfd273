//! Checkpoint creation and restoration.
//!
//! A checkpoint for iteration `i` lives under `<work>/checkpoint/<i>/` and
//! holds the full model snapshot, the checkpoint metadata and one
//! prediction shard file per worker-written shard. The checkpoint only
//! becomes visible once its snapshot marker exists.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::config::TrainingConfig;
use crate::error::{Result, TrainError};
use crate::loss::LabelStatistics;
use crate::model::GbdtModel;
use crate::storage;

use super::client::DistributionClient;
use super::monitoring::{Monitoring, Stage};
use super::protocol::{ReplyPayload, RequestPayload, WorkerRequest};
use super::snapshot;

pub const CHECKPOINT_DIR: &str = "checkpoint";
pub const SNAPSHOT_DIR: &str = "snapshot";
pub const TMP_DIR: &str = "tmp";
pub const MODEL_FILE: &str = "model";
pub const CHECKPOINT_METADATA_FILE: &str = "checkpoint";

pub fn checkpoint_dir(work_directory: &Path, iter_idx: u64) -> PathBuf {
    work_directory
        .join(CHECKPOINT_DIR)
        .join(iter_idx.to_string())
}

pub fn snapshot_dir(work_directory: &Path) -> PathBuf {
    work_directory.join(CHECKPOINT_DIR).join(SNAPSHOT_DIR)
}

pub fn tmp_dir(work_directory: &Path) -> PathBuf {
    work_directory.join(TMP_DIR)
}

/// `predictions-<shard_idx>-of-<num_shards>`
pub fn shard_filename(shard_idx: usize, num_shards: usize) -> String {
    format!("predictions-{shard_idx}-of-{num_shards}")
}

/// Even contiguous example ranges of `ceil(num_examples / num_shards)`
/// examples apiece.
pub fn example_range(num_examples: u64, num_shards: usize, shard_idx: usize) -> (u64, u64) {
    let per_shard = num_examples.div_ceil(num_shards as u64);
    let begin = (shard_idx as u64 * per_shard).min(num_examples);
    let end = ((shard_idx as u64 + 1) * per_shard).min(num_examples);
    (begin, end)
}

/// Metadata persisted next to the model snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub label_statistics: LabelStatistics,
    pub num_shards: usize,
}

/// Content of one worker-written prediction shard file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionShard {
    pub shard_idx: usize,
    pub begin_example: u64,
    pub end_example: u64,
    /// One value vector per weak model, covering the example range.
    pub values: Vec<Vec<f32>>,
    pub checksum: u64,
}

/// XxHash64 of the shard values.
pub fn prediction_checksum(values: &[Vec<f32>]) -> u64 {
    use std::hash::Hasher;
    let mut hasher = XxHash64::with_seed(0);
    for weak_model_values in values {
        for value in weak_model_values {
            hasher.write_u32(value.to_bits());
        }
    }
    hasher.finish()
}

impl PredictionShard {
    pub fn new(shard_idx: usize, begin_example: u64, end_example: u64, values: Vec<Vec<f32>>) -> Self {
        let checksum = prediction_checksum(&values);
        Self {
            shard_idx,
            begin_example,
            end_example,
            values,
            checksum,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let checksum = prediction_checksum(&self.values);
        if checksum != self.checksum {
            return Err(TrainError::data_loss(format!(
                "checksum mismatch on prediction shard {}: expected {}, got {checksum}",
                self.shard_idx, self.checksum
            )));
        }
        Ok(())
    }
}

/// True when the checkpoint cadence asks for a checkpoint at `iter_idx`.
pub fn should_create_checkpoint(
    iter_idx: u64,
    time_last_checkpoint: Instant,
    config: &TrainingConfig,
) -> bool {
    if config.checkpoint_interval_trees > 0
        && iter_idx % config.checkpoint_interval_trees as u64 == 0
    {
        return true;
    }
    if config.checkpoint_interval_seconds >= 0
        && time_last_checkpoint.elapsed().as_secs() >= config.checkpoint_interval_seconds as u64
    {
        return true;
    }
    false
}

/// Creates and commits the checkpoint of `iter_idx`.
pub async fn create_checkpoint(
    iter_idx: u64,
    model: &GbdtModel,
    work_directory: &Path,
    label_statistics: &LabelStatistics,
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::CreateCheckpoint);
    tracing::info!("Start creating checkpoint for iteration {iter_idx}");
    let begin = Instant::now();

    // Number of workers participating in the checkpoint. A larger value
    // reduces the per-worker cost but increases the chance of sending a
    // request to an interrupted worker.
    let num_shards = (client.num_workers() / 4).max(1);

    let directory = checkpoint_dir(work_directory, iter_idx);
    storage::create_dir_all(&directory)?;
    model.save(&directory.join(MODEL_FILE))?;

    emit_create_checkpoint(
        iter_idx,
        label_statistics.num_examples(),
        num_shards,
        work_directory,
        client,
    )
    .await?;

    let metadata = CheckpointMetadata {
        label_statistics: label_statistics.clone(),
        num_shards,
    };
    storage::write_bincode(&directory.join(CHECKPOINT_METADATA_FILE), &metadata)?;

    snapshot::add_snapshot(&snapshot_dir(work_directory), iter_idx)?;

    tracing::info!(
        "Checkpoint created in {:?} for iteration {iter_idx}",
        begin.elapsed()
    );
    monitoring.end_stage(Stage::CreateCheckpoint);
    Ok(())
}

/// Requests one prediction shard per `CreateCheckpoint` request and
/// renames the returned temporary files into the checkpoint directory. A
/// shard answered with `request_restart_iter` is resent to the next
/// worker, allowing `3 * num_shards` retries in total across the whole
/// checkpoint.
async fn emit_create_checkpoint(
    iter_idx: u64,
    num_examples: u64,
    num_shards: usize,
    work_directory: &Path,
    client: &DistributionClient,
) -> Result<()> {
    let max_retries = 3 * num_shards;
    let mut retries = 0usize;

    let shard_request = |shard_idx: usize| {
        let (begin_example, end_example) = example_range(num_examples, num_shards, shard_idx);
        WorkerRequest::with_request_id(
            RequestPayload::CreateCheckpoint {
                shard_idx,
                begin_example,
                end_example,
            },
            shard_idx as u64,
        )
    };

    for shard_idx in 0..num_shards {
        client.async_request_any(&shard_request(shard_idx))?;
    }

    let directory = checkpoint_dir(work_directory, iter_idx);
    let mut answered = 0usize;
    while answered < num_shards {
        let reply = client.next_reply().await?;
        if reply.request_restart_iter {
            let shard_idx = reply.request_id.ok_or_else(|| {
                TrainError::internal("checkpoint shard reply without request id")
            })? as usize;
            let new_worker_idx = (reply.worker_idx + 1) % client.num_workers();
            tracing::warn!(
                "Worker #{} does not have the right data to create the checkpoint. \
                 Trying worker #{new_worker_idx} instead",
                reply.worker_idx
            );

            retries += 1;
            if retries > max_retries {
                return Err(TrainError::data_loss(format!(
                    "impossible to create a checkpoint for iter #{iter_idx} because \
                     none of the workers are available"
                )));
            }
            client.async_request(&shard_request(shard_idx), new_worker_idx)?;
            continue;
        }

        match reply.payload {
            ReplyPayload::CreateCheckpoint { shard_idx, path } => {
                storage::rename(&path, &directory.join(shard_filename(shard_idx, num_shards)))?;
            }
            other => {
                return Err(TrainError::internal(format!(
                    "unexpected answer. Expecting CreateCheckpoint, got {}",
                    other.kind()
                )));
            }
        }
        answered += 1;
    }
    Ok(())
}

/// Loads the model and metadata of a committed checkpoint.
pub fn restore_manager_checkpoint(
    iter_idx: u64,
    work_directory: &Path,
) -> Result<(GbdtModel, CheckpointMetadata)> {
    tracing::info!("Restoring model from checkpoint at iteration {iter_idx}");
    let directory = checkpoint_dir(work_directory, iter_idx);
    let metadata: CheckpointMetadata =
        storage::read_bincode(&directory.join(CHECKPOINT_METADATA_FILE))?;
    let model = GbdtModel::load(&directory.join(MODEL_FILE))?;
    Ok((model, metadata))
}

/// Asks every worker to reload its prediction shards from the committed
/// checkpoint files.
pub async fn emit_restore_checkpoint(
    iter_idx: u64,
    num_shards: usize,
    num_weak_models: usize,
    client: &DistributionClient,
    monitoring: &mut Monitoring,
) -> Result<()> {
    monitoring.begin_stage(Stage::RestoreCheckpoint);
    client
        .broadcast(
            |_| {
                WorkerRequest::new(RequestPayload::RestoreCheckpoint {
                    iter_idx,
                    num_shards,
                    num_weak_models,
                })
            },
            |reply| match reply.payload {
                ReplyPayload::RestoreCheckpoint => Ok(()),
                other => Err(TrainError::internal(format!(
                    "unexpected answer. Expecting RestoreCheckpoint, got {}",
                    other.kind()
                ))),
            },
        )
        .await?;
    monitoring.end_stage(Stage::RestoreCheckpoint);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_filename_grammar() {
        assert_eq!(shard_filename(0, 2), "predictions-0-of-2");
        assert_eq!(shard_filename(7, 16), "predictions-7-of-16");
    }

    #[test]
    fn test_example_ranges_cover_all_examples() {
        let num_examples = 10;
        let num_shards = 3;
        let ranges: Vec<_> = (0..num_shards)
            .map(|shard| example_range(num_examples, num_shards, shard))
            .collect();
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn test_example_range_single_shard() {
        assert_eq!(example_range(5, 1, 0), (0, 5));
    }

    #[test]
    fn test_should_create_checkpoint_by_trees() {
        let config = TrainingConfig {
            checkpoint_interval_trees: 2,
            checkpoint_interval_seconds: -1,
            ..Default::default()
        };
        let now = Instant::now();
        assert!(should_create_checkpoint(0, now, &config));
        assert!(!should_create_checkpoint(1, now, &config));
        assert!(should_create_checkpoint(2, now, &config));
    }

    #[test]
    fn test_should_create_checkpoint_by_seconds() {
        let config = TrainingConfig {
            checkpoint_interval_trees: -1,
            checkpoint_interval_seconds: 0,
            ..Default::default()
        };
        assert!(should_create_checkpoint(1, Instant::now(), &config));

        let disabled = TrainingConfig {
            checkpoint_interval_trees: -1,
            checkpoint_interval_seconds: -1,
            ..Default::default()
        };
        assert!(!should_create_checkpoint(0, Instant::now(), &disabled));
    }

    #[test]
    fn test_prediction_shard_checksum() {
        let shard = PredictionShard::new(0, 0, 2, vec![vec![0.5, -1.0]]);
        shard.verify().unwrap();

        let mut corrupted = shard.clone();
        corrupted.values[0][1] = 2.0;
        assert!(corrupted.verify().is_err());
    }
}

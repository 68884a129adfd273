//! End-to-end distributed training scenarios over the in-process
//! transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use dgbt::config::{DeploymentConfig, Task, TrainingConfig};
use dgbt::coordinator::feature_ownership::assign_features_to_workers;
use dgbt::coordinator::DistributedGbdtLearner;
use dgbt::dataset::cache::{ColumnData, DatasetCacheBuilder, DatasetCacheReader};
use dgbt::distribute::WorkerRegistry;
use dgbt::model::tree::TreeNode;
use dgbt::model::GbdtModel;
use dgbt::worker::{
    trainer_worker_factory, RestartSchedule, RestartTrigger, TRAINER_WORKER,
};

const NUM_EXAMPLES: usize = 24;

/// Regression dataset with a strong split on `f0`: labels are 1.0 for the
/// low half of `f0` and 3.0 for the high half.
fn build_regression_cache(path: &Path) {
    let f0: Vec<f32> = (0..NUM_EXAMPLES).map(|i| (i % 12) as f32 + 1.0).collect();
    let f1: Vec<f32> = (0..NUM_EXAMPLES).map(|i| (i % 4) as f32).collect();
    let f2: Vec<u32> = (0..NUM_EXAMPLES).map(|i| (i % 3) as u32).collect();
    let label: Vec<f32> = f0.iter().map(|&v| if v >= 6.5 { 3.0 } else { 1.0 }).collect();

    DatasetCacheBuilder::new()
        .column("f0", ColumnData::Numerical(f0))
        .column("f1", ColumnData::Numerical(f1))
        .column("f2", ColumnData::Categorical(f2))
        .column("label", ColumnData::Numerical(label))
        .write(path)
        .unwrap();
}

fn build_classification_cache(path: &Path) {
    let f0: Vec<f32> = (0..NUM_EXAMPLES).map(|i| (i % 12) as f32 + 1.0).collect();
    let label: Vec<u32> = f0.iter().map(|&v| u32::from(v >= 6.5)).collect();

    DatasetCacheBuilder::new()
        .column("f0", ColumnData::Numerical(f0))
        .column("label", ColumnData::Categorical(label))
        .write(path)
        .unwrap();
}

fn training_config(num_trees: u64) -> TrainingConfig {
    TrainingConfig {
        label: "label".to_string(),
        num_trees,
        max_depth: 2,
        min_examples: 1,
        checkpoint_interval_trees: -1,
        checkpoint_interval_seconds: -1,
        random_seed: 42,
        ..Default::default()
    }
}

fn deployment_config(work_directory: &Path, num_workers: usize) -> DeploymentConfig {
    DeploymentConfig {
        cache_path: work_directory.to_path_buf(),
        num_workers,
        // Use the cache path directly so checkpoints land in a known place.
        try_resume_training: true,
        ..Default::default()
    }
}

async fn train(
    cache: &Path,
    work_directory: &Path,
    training: TrainingConfig,
    num_workers: usize,
) -> GbdtModel {
    let learner =
        DistributedGbdtLearner::new(training, deployment_config(work_directory, num_workers));
    learner
        .train(&format!("cache:{}", cache.display()))
        .await
        .unwrap()
}

fn snapshot_path(work_directory: &Path, iter_idx: u64) -> PathBuf {
    work_directory
        .join("checkpoint")
        .join("snapshot")
        .join(iter_idx.to_string())
}

/// Checkpoint completeness: a committed snapshot implies the model, the
/// metadata and every prediction shard exist.
fn assert_checkpoint_complete(work_directory: &Path, iter_idx: u64, num_shards: usize) {
    assert!(snapshot_path(work_directory, iter_idx).exists());
    let directory = work_directory.join("checkpoint").join(iter_idx.to_string());
    assert!(directory.join("model").exists());
    assert!(directory.join("checkpoint").exists());
    for shard_idx in 0..num_shards {
        let shard = directory.join(format!("predictions-{shard_idx}-of-{num_shards}"));
        assert!(shard.exists(), "missing {}", shard.display());
    }
}

fn assert_log_entries_monotone(model: &GbdtModel, expected: u64) {
    let trees: Vec<u64> = model
        .training_logs
        .entries
        .iter()
        .map(|entry| entry.number_of_trees)
        .collect();
    let expected: Vec<u64> = (1..=expected).collect();
    assert_eq!(trees, expected);
}

#[tokio::test]
async fn test_s1_bootstrap_and_single_iteration() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_regression_cache(&cache);

    // Ownership after the cost-score sort: f0 (12 unique numerical) and
    // f2 (3-value categorical) on worker 0, f1 on worker 1.
    let metadata = DatasetCacheReader::open(&cache).unwrap().metadata().clone();
    let ownership = assign_features_to_workers(&[0, 1, 2], 2, &metadata, false).unwrap();
    assert_eq!(ownership.features_of_worker(0), &[0, 2]);
    assert_eq!(ownership.features_of_worker(1), &[1]);

    let model = train(&cache, &work, training_config(1), 2).await;

    assert_eq!(model.trees.len(), 1);
    assert_eq!(model.num_trees_per_iter, 1);
    // One split decision at the root, two leaf children.
    let tree = &model.trees[0];
    assert_eq!(tree.num_nodes(), 3);
    match tree.node(0) {
        TreeNode::Split {
            negative, positive, ..
        } => {
            assert!(tree.node(*negative).is_leaf());
            assert!(tree.node(*positive).is_leaf());
        }
        TreeNode::Leaf { .. } => panic!("expected a split at the root"),
    }
    assert_eq!(model.training_logs.entries.len(), 1);
    // The labels are bimodal around the mean; one split halves the RMSE.
    assert!(model.training_logs.entries[0].training_loss < 1.0);
}

#[tokio::test]
async fn test_s2_checkpoint_and_resume() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_regression_cache(&cache);

    let mut config = training_config(3);
    config.checkpoint_interval_trees = 2;
    // First run stops after 3 iterations (simulated kill after iter=3).
    train(&cache, &work, config.clone(), 2).await;
    assert!(snapshot_path(&work, 2).exists());

    // Resume in the same work directory up to 5 trees.
    config.num_trees = 5;
    let resumed = train(&cache, &work, config.clone(), 2).await;

    assert_eq!(resumed.trees.len(), 5);
    assert_log_entries_monotone(&resumed, 5);
    assert!(snapshot_path(&work, 2).exists());
    assert!(snapshot_path(&work, 4).exists());
    assert_checkpoint_complete(&work, 2, 1);
    assert_checkpoint_complete(&work, 4, 1);

    // Idempotent restart: resuming produces the same model as a straight
    // run through all 5 iterations.
    let straight_work = temp.path().join("straight");
    let straight = train(&cache, &straight_work, config, 2).await;
    assert_eq!(resumed, straight);
}

#[tokio::test]
async fn test_s3_data_loss_mid_find_splits() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_regression_cache(&cache);

    let mut config = training_config(5);
    config.checkpoint_interval_trees = 2;

    // Worker 1 loses its state when FindSplits of iteration 3 arrives.
    let schedule = Arc::new(RestartSchedule::default());
    schedule.plan(RestartTrigger::OnFindSplits {
        iter_idx: 3,
        worker_idx: Some(1),
    });
    let mut registry = WorkerRegistry::new();
    registry.register(TRAINER_WORKER, trainer_worker_factory(schedule));

    let learner = DistributedGbdtLearner::new(config.clone(), deployment_config(&work, 2))
        .with_worker_registry(registry);
    let model = learner
        .train(&format!("cache:{}", cache.display()))
        .await
        .unwrap();

    // Training rewound to the marker-2 checkpoint and still finished with
    // exactly num_trees trees and no duplicated log entries.
    assert_eq!(model.trees.len(), 5);
    assert_log_entries_monotone(&model, 5);

    // The recovered run matches an undisturbed one.
    let clean_work = temp.path().join("clean");
    let clean = train(&cache, &clean_work, config, 2).await;
    assert_eq!(model, clean);
}

#[tokio::test]
async fn test_s4_checkpoint_shard_retry() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_regression_cache(&cache);

    let mut config = training_config(2);
    config.checkpoint_interval_trees = 1;

    // One worker answers its first checkpoint shard with a restart
    // request; the coordinator resends the shard to the next worker.
    let schedule = Arc::new(RestartSchedule::default());
    schedule.plan(RestartTrigger::OnCreateCheckpoint { worker_idx: None });
    let mut registry = WorkerRegistry::new();
    registry.register(TRAINER_WORKER, trainer_worker_factory(schedule));

    let learner = DistributedGbdtLearner::new(config, deployment_config(&work, 8))
        .with_worker_registry(registry);
    let model = learner
        .train(&format!("cache:{}", cache.display()))
        .await
        .unwrap();

    // W=8 gives 2 shards per checkpoint; the retried checkpoint is
    // complete despite the failed shard.
    assert_checkpoint_complete(&work, 0, 2);
    assert_eq!(model.trees.len(), 2);
    assert_log_entries_monotone(&model, 2);
}

#[tokio::test]
async fn test_s5_no_improvement_layer() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");

    // Constant labels: no split improves the loss at any depth.
    DatasetCacheBuilder::new()
        .column(
            "f0",
            ColumnData::Numerical((0..NUM_EXAMPLES).map(|i| i as f32).collect()),
        )
        .column("label", ColumnData::Numerical(vec![2.0; NUM_EXAMPLES]))
        .write(&cache)
        .unwrap();

    let mut config = training_config(1);
    config.max_depth = 3;
    let model = train(&cache, &work, config, 2).await;

    // The tree is a root stump and the iteration still produced a
    // training-log entry.
    assert_eq!(model.trees.len(), 1);
    assert_eq!(model.trees[0].num_nodes(), 1);
    assert_eq!(model.training_logs.entries.len(), 1);
    assert!(model.training_logs.entries[0].training_loss < 1e-9);
}

#[tokio::test]
async fn test_s6_duplicate_mode_matches_default() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    build_regression_cache(&cache);

    // Duplicate mode: every worker owns every feature; the reverse map
    // keeps worker 0 as the canonical owner.
    let metadata = DatasetCacheReader::open(&cache).unwrap().metadata().clone();
    let ownership = assign_features_to_workers(&[0, 1, 2], 3, &metadata, true).unwrap();
    for worker_idx in 0..3 {
        assert_eq!(ownership.features_of_worker(worker_idx), &[0, 1, 2]);
    }
    for feature in 0..3 {
        assert_eq!(ownership.owners_of_feature(feature), &[0]);
    }

    let mut config = training_config(3);
    config.max_depth = 3;
    config.internal.duplicate_computation_on_all_workers = true;
    let duplicate = train(&cache, &temp.path().join("dup"), config.clone(), 3).await;

    config.internal.duplicate_computation_on_all_workers = false;
    let default = train(&cache, &temp.path().join("default"), config, 3).await;

    // The redundant proposals are merged away: both modes grow the same
    // model.
    assert_eq!(duplicate, default);
}

#[tokio::test]
async fn test_determinism_under_seed() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    build_regression_cache(&cache);

    let mut config = training_config(4);
    config.max_depth = 3;
    // Exercise the sampler path as well.
    config.num_candidate_attributes = 2;

    let first = train(&cache, &temp.path().join("a"), config.clone(), 2).await;
    let second = train(&cache, &temp.path().join("b"), config, 2).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_single_worker_matches_fleet() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    build_regression_cache(&cache);

    let mut config = training_config(3);
    config.max_depth = 3;

    let single = train(&cache, &temp.path().join("w1"), config.clone(), 1).await;
    let fleet = train(&cache, &temp.path().join("w4"), config, 4).await;
    assert_eq!(single, fleet);
}

#[tokio::test]
async fn test_num_trees_zero_returns_initial_predictions_only() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_regression_cache(&cache);

    let model = train(&cache, &work, training_config(0), 2).await;

    assert!(model.trees.is_empty());
    assert!(model.training_logs.entries.is_empty());
    assert_eq!(model.initial_predictions.len(), 1);
    // Mean of 12 × 1.0 and 12 × 3.0.
    assert!((model.initial_predictions[0] - 2.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_max_depth_one_produces_stumps() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_regression_cache(&cache);

    let mut config = training_config(2);
    config.max_depth = 1;
    let model = train(&cache, &work, config, 2).await;

    assert_eq!(model.trees.len(), 2);
    for tree in &model.trees {
        assert_eq!(tree.num_nodes(), 1);
    }
    assert_log_entries_monotone(&model, 2);
}

#[tokio::test]
async fn test_binomial_classification() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");
    build_classification_cache(&cache);

    let mut config = training_config(3);
    config.task = Task::Classification;
    config.max_depth = 3;
    let model = train(&cache, &work, config, 2).await;

    assert_eq!(model.trees.len(), 3);
    assert_eq!(
        model.training_logs.secondary_metric_names,
        vec!["accuracy".to_string()]
    );
    let entries = &model.training_logs.entries;
    assert_eq!(entries.len(), 3);
    // The data is separable on f0: accuracy reaches 1 and the loss drops.
    assert!((entries.last().unwrap().training_secondary_metrics[0] - 1.0).abs() < 1e-9);
    assert!(entries.last().unwrap().training_loss < entries[0].training_loss);
}

#[tokio::test]
async fn test_partial_cache_input_is_finalized_and_trained() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");

    let f0: Vec<f32> = (0..NUM_EXAMPLES).map(|i| (i % 12) as f32).collect();
    let label: Vec<f32> = f0.iter().map(|&v| if v >= 6.0 { 3.0 } else { 1.0 }).collect();
    DatasetCacheBuilder::new()
        .column("f0", ColumnData::Numerical(f0))
        .column("label", ColumnData::Numerical(label))
        .write_partial(&cache)
        .unwrap();

    let learner =
        DistributedGbdtLearner::new(training_config(1), deployment_config(&work, 2));
    let model = learner
        .train(&format!("partial_cache:{}", cache.display()))
        .await
        .unwrap();

    assert_eq!(model.trees.len(), 1);
    // The finalized cache is now a committed cache.
    assert!(DatasetCacheReader::open(&cache).is_ok());
}

#[tokio::test]
async fn test_weighted_training_runs() {
    let temp = TempDir::new().unwrap();
    let cache = temp.path().join("cache");
    let work = temp.path().join("work");

    let f0: Vec<f32> = (0..NUM_EXAMPLES).map(|i| (i % 12) as f32).collect();
    let label: Vec<f32> = f0.iter().map(|&v| if v >= 6.0 { 3.0 } else { 1.0 }).collect();
    let weight: Vec<f32> = (0..NUM_EXAMPLES).map(|i| 1.0 + (i % 2) as f32).collect();
    DatasetCacheBuilder::new()
        .column("f0", ColumnData::Numerical(f0))
        .column("label", ColumnData::Numerical(label))
        .column("weight", ColumnData::Numerical(weight))
        .write(&cache)
        .unwrap();

    let mut config = training_config(2);
    config.weight = Some("weight".to_string());
    config.features = vec!["f0".to_string()];
    let model = train(&cache, &work, config, 2).await;

    assert_eq!(model.trees.len(), 2);
    assert_log_entries_monotone(&model, 2);
}

//! Worker-side implementation of the training protocol.
//!
//! A worker holds the label and weight columns, its owned feature
//! columns, the full per-weak-model prediction vectors, the per-iteration
//! gradients and an example→node map per weak model. All of this is
//! in-memory state: a restarted worker answers `request_restart_iter` to
//! any request that needs what it lost, and heals through
//! `RestoreCheckpoint` (or `SetInitialPredictions` when no checkpoint
//! exists yet).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::Task;
use crate::coordinator::checkpoint::{
    checkpoint_dir, shard_filename, tmp_dir, PredictionShard,
};
use crate::coordinator::protocol::{
    FeaturesPerWeakModelAndNode, ReplyPayload, RequestPayload, Split, SplitPerOpenNode,
    WorkerReply, WorkerRequest, WorkerWelcome,
};
use crate::coordinator::split_merge::replace_if_better;
use crate::coordinator::tree_builder::{shrunk_leaf_value, TreeBuilder};
use crate::dataset::cache::{ColumnData, ColumnKind, DatasetCacheReader};
use crate::distribute::{AbstractWorker, Blob, WorkerFactory, WorkerRegistry};
use crate::error::{Result, TrainError};
use crate::loss::{Evaluation, GradientStatistics, LabelStatistics, Loss, LossRegistry};
use crate::storage;

mod share;
mod split;

pub use share::{evaluation_filename, share_dir, SplitEvaluation};
pub use split::{find_best_split, SplitSearchConfig};

/// Registry name of the training worker.
pub const TRAINER_WORKER: &str = "dgbt_trainer";

/// Worker registry with the training worker registered.
pub fn default_worker_registry() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register(TRAINER_WORKER, trainer_worker_factory(Arc::default()));
    registry
}

/// Factory wiring a shared restart schedule into every spawned worker.
pub fn trainer_worker_factory(schedule: Arc<RestartSchedule>) -> WorkerFactory {
    Arc::new(move || {
        Box::new(TrainerWorker::new(schedule.clone())) as Box<dyn AbstractWorker>
    })
}

/// A point in the protocol at which a worker simulates a process restart
/// (all in-memory state dropped, dataset kept).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartTrigger {
    OnStartNewIter {
        iter_idx: u64,
        worker_idx: Option<usize>,
    },
    OnFindSplits {
        iter_idx: u64,
        worker_idx: Option<usize>,
    },
    OnCreateCheckpoint {
        worker_idx: Option<usize>,
    },
}

/// Fault injection for exercising the iteration-restart protocol with the
/// in-process transport. Each planned trigger fires exactly once.
#[derive(Debug, Default)]
pub struct RestartSchedule {
    planned: Mutex<Vec<RestartTrigger>>,
}

impl RestartSchedule {
    pub fn plan(&self, trigger: RestartTrigger) {
        self.planned
            .lock()
            .expect("restart schedule lock")
            .push(trigger);
    }

    /// Removes and reports the first trigger accepted by `matches`.
    fn take(&self, matches: impl Fn(&RestartTrigger) -> bool) -> bool {
        let mut planned = self.planned.lock().expect("restart schedule lock");
        if let Some(position) = planned.iter().position(|t| matches(t)) {
            planned.remove(position);
            true
        } else {
            false
        }
    }
}

fn worker_matches(planned: Option<usize>, worker_idx: usize) -> bool {
    planned.is_none() || planned == Some(worker_idx)
}

struct WorkerDataset {
    num_examples: usize,
    labels: Vec<f32>,
    weights: Option<Vec<f32>>,
    /// Owned feature columns, keyed by attribute index.
    features: HashMap<usize, ColumnData>,
    /// Number of label classes; 0 for regression labels.
    label_classes: usize,
}

struct IterationState {
    iter_idx: u64,
    iter_uid: String,
    /// `gradients[weak_model][example] = (gradient, hessian)`.
    gradients: Vec<Vec<(f64, f64)>>,
    builders: Vec<TreeBuilder>,
    /// `example_to_node[weak_model][example]` is a node id of the
    /// builder's tree.
    example_to_node: Vec<Vec<u32>>,
}

pub struct TrainerWorker {
    schedule: Arc<RestartSchedule>,
    worker_idx: usize,
    welcome: Option<WorkerWelcome>,
    loss: Option<Arc<dyn Loss>>,
    dataset: Option<WorkerDataset>,
    /// `predictions[weak_model][example]`, margin space.
    predictions: Option<Vec<Vec<f32>>>,
    iteration: Option<IterationState>,
}

impl TrainerWorker {
    pub fn new(schedule: Arc<RestartSchedule>) -> Self {
        Self {
            schedule,
            worker_idx: 0,
            welcome: None,
            loss: None,
            dataset: None,
            predictions: None,
            iteration: None,
        }
    }

    fn reply(&self, request_id: Option<u64>, payload: ReplyPayload) -> WorkerReply {
        WorkerReply::new(self.worker_idx, request_id, payload)
    }

    fn restart_reply(&self, request_id: Option<u64>) -> WorkerReply {
        WorkerReply::restart_iteration(self.worker_idx, request_id)
    }

    /// Drops everything a process restart would lose. The dataset cache is
    /// on disk, so the loaded columns survive.
    fn simulate_restart(&mut self) {
        tracing::warn!("worker #{} simulating a restart", self.worker_idx);
        self.predictions = None;
        self.iteration = None;
    }

    fn welcome(&self) -> Result<&WorkerWelcome> {
        self.welcome
            .as_ref()
            .ok_or_else(|| TrainError::internal("worker was not set up"))
    }

    fn loss(&self) -> Result<Arc<dyn Loss>> {
        self.loss
            .clone()
            .ok_or_else(|| TrainError::internal("worker was not set up"))
    }

    fn ensure_dataset(&mut self) -> Result<()> {
        if self.dataset.is_some() {
            return Ok(());
        }
        let welcome = self.welcome()?;
        let reader = DatasetCacheReader::open(&welcome.cache_path)?;
        let num_examples = reader.num_examples() as usize;

        let label_column = reader.load_column(welcome.config_link.label)?;
        let labels: Vec<f32> = (0..num_examples)
            .map(|example| label_column.label_value(example))
            .collect();
        let label_classes = match reader.metadata().columns[welcome.config_link.label].kind {
            ColumnKind::Categorical { num_values } => num_values as usize,
            _ => 0,
        };

        let weights = match welcome.config_link.weight {
            Some(weight_idx) => {
                let column = reader.load_column(weight_idx)?;
                Some(
                    (0..num_examples)
                        .map(|example| column.label_value(example))
                        .collect(),
                )
            }
            None => None,
        };

        let mut features = HashMap::new();
        for &feature in &welcome.owned_features[self.worker_idx] {
            features.insert(feature, reader.load_column(feature)?);
        }

        tracing::info!(
            "worker #{} loaded {} examples and {} feature columns",
            self.worker_idx,
            num_examples,
            features.len()
        );
        self.dataset = Some(WorkerDataset {
            num_examples,
            labels,
            weights,
            features,
            label_classes,
        });
        Ok(())
    }

    fn dataset(&self) -> Result<&WorkerDataset> {
        self.dataset
            .as_ref()
            .ok_or_else(|| TrainError::internal("dataset is not loaded"))
    }

    fn get_label_statistics(&mut self, request_id: Option<u64>) -> Result<WorkerReply> {
        self.ensure_dataset()?;
        let task = self.welcome()?.train_config.task;
        let dataset = self.dataset()?;

        let weight_of =
            |example: usize| dataset.weights.as_ref().map(|w| w[example] as f64).unwrap_or(1.0);
        let label_statistics = match task {
            Task::Regression => {
                let mut weight_sum = 0.0;
                let mut sum = 0.0;
                let mut sum_squares = 0.0;
                for (example, &label) in dataset.labels.iter().enumerate() {
                    let weight = weight_of(example);
                    weight_sum += weight;
                    sum += weight * label as f64;
                    sum_squares += weight * (label as f64) * (label as f64);
                }
                LabelStatistics::Regression {
                    count: dataset.num_examples as u64,
                    weight_sum,
                    sum,
                    sum_squares,
                }
            }
            Task::Classification => {
                let mut class_weights = vec![0.0f64; dataset.label_classes.max(2)];
                for (example, &label) in dataset.labels.iter().enumerate() {
                    let class = label as usize;
                    if class >= class_weights.len() {
                        return Err(TrainError::internal(format!(
                            "label class {class} out of range"
                        )));
                    }
                    class_weights[class] += weight_of(example);
                }
                LabelStatistics::Classification {
                    count: dataset.num_examples as u64,
                    class_weights,
                }
            }
        };
        Ok(self.reply(request_id, ReplyPayload::GetLabelStatistics { label_statistics }))
    }

    fn set_initial_predictions(
        &mut self,
        request_id: Option<u64>,
        label_statistics: &LabelStatistics,
    ) -> Result<WorkerReply> {
        self.ensure_dataset()?;
        let initial = self.loss()?.initial_predictions(label_statistics)?;
        let num_examples = self.dataset()?.num_examples;
        self.predictions = Some(
            initial
                .iter()
                .map(|&value| vec![value; num_examples])
                .collect(),
        );
        self.iteration = None;
        Ok(self.reply(request_id, ReplyPayload::SetInitialPredictions))
    }

    fn start_training(&mut self, request_id: Option<u64>) -> Result<WorkerReply> {
        self.ensure_dataset()?;
        Ok(self.reply(request_id, ReplyPayload::StartTraining))
    }

    fn start_new_iter(
        &mut self,
        request_id: Option<u64>,
        iter_idx: u64,
        iter_uid: String,
    ) -> Result<WorkerReply> {
        let worker_idx = self.worker_idx;
        if self.schedule.take(|trigger| {
            matches!(trigger, RestartTrigger::OnStartNewIter { iter_idx: planned, worker_idx: planned_worker }
                if *planned == iter_idx && worker_matches(*planned_worker, worker_idx))
        }) {
            self.simulate_restart();
        }

        if self.predictions.is_none() {
            return Ok(self.restart_reply(request_id));
        }
        let loss = self.loss()?;
        let shrinkage = self.welcome()?.train_config.shrinkage;
        let dataset = self.dataset()?;
        let predictions = self
            .predictions
            .as_ref()
            .ok_or_else(|| TrainError::internal("missing predictions"))?;

        let leaf_value = shrunk_leaf_value(loss.clone(), shrinkage);
        let num_weak_models = predictions.len();
        let num_examples = dataset.num_examples;

        let mut gradients = Vec::with_capacity(num_weak_models);
        let mut root_statistics = Vec::with_capacity(num_weak_models);
        for weak_model_idx in 0..num_weak_models {
            let mut statistics = GradientStatistics::default();
            let mut per_example = Vec::with_capacity(num_examples);
            for example in 0..num_examples {
                let (gradient, hessian) = loss.gradient_and_hessian(
                    dataset.labels[example],
                    predictions[weak_model_idx][example],
                );
                let weight = dataset
                    .weights
                    .as_ref()
                    .map(|w| w[example] as f64)
                    .unwrap_or(1.0);
                statistics.add_example(gradient, hessian, weight);
                per_example.push((gradient, hessian));
            }
            gradients.push(per_example);
            root_statistics.push(statistics);
        }

        let builders = root_statistics
            .iter()
            .map(|statistics| {
                let mut builder = TreeBuilder::new(leaf_value.clone());
                builder.set_root_statistics(statistics);
                builder
            })
            .collect();

        self.iteration = Some(IterationState {
            iter_idx,
            iter_uid,
            gradients,
            builders,
            example_to_node: vec![vec![0; num_examples]; num_weak_models],
        });
        Ok(self.reply(
            request_id,
            ReplyPayload::StartNewIter {
                root_label_statistics: root_statistics,
            },
        ))
    }

    fn find_splits(
        &mut self,
        request_id: Option<u64>,
        features_per_weak_model: &FeaturesPerWeakModelAndNode,
    ) -> Result<WorkerReply> {
        let worker_idx = self.worker_idx;
        if let Some(current_iter) = self.iteration.as_ref().map(|state| state.iter_idx) {
            if self.schedule.take(|trigger| {
                matches!(trigger, RestartTrigger::OnFindSplits { iter_idx, worker_idx: planned_worker }
                    if *iter_idx == current_iter && worker_matches(*planned_worker, worker_idx))
            }) {
                self.simulate_restart();
            }
        }

        let Some(iteration) = self.iteration.as_ref() else {
            return Ok(self.restart_reply(request_id));
        };
        let config = &self.welcome()?.train_config;
        let search = SplitSearchConfig {
            min_examples: config.min_examples,
            use_hessian_gain: config.use_hessian_gain,
        };
        let dataset = self.dataset()?;

        if features_per_weak_model.len() != iteration.builders.len() {
            return Err(TrainError::internal(
                "unexpected number of weak models in FindSplits",
            ));
        }

        let mut splits_per_weak_model: Vec<SplitPerOpenNode> =
            Vec::with_capacity(features_per_weak_model.len());
        for (weak_model_idx, features_per_node) in features_per_weak_model.iter().enumerate() {
            let builder = &iteration.builders[weak_model_idx];
            if features_per_node.len() != builder.num_open_nodes() {
                return Err(TrainError::internal(
                    "unexpected number of open nodes in FindSplits",
                ));
            }

            let mut best_splits: SplitPerOpenNode = vec![None; features_per_node.len()];
            for (position, features) in features_per_node.iter().enumerate() {
                if features.is_empty() {
                    continue;
                }
                let node = builder.open_nodes()[position];
                let examples: Vec<usize> = iteration.example_to_node[weak_model_idx]
                    .iter()
                    .enumerate()
                    .filter_map(|(example, &at)| (at == node).then_some(example))
                    .collect();
                let parent = builder.statistics(node);

                let mut ordered_features = features.clone();
                ordered_features.sort_unstable();
                ordered_features.dedup();
                for &attribute in &ordered_features {
                    let column = dataset.features.get(&attribute).ok_or_else(|| {
                        TrainError::internal(format!(
                            "worker #{worker_idx} was asked to split on feature {attribute} \
                             it does not own"
                        ))
                    })?;
                    if let Some(candidate) = find_best_split(
                        attribute,
                        column,
                        &examples,
                        &iteration.gradients[weak_model_idx],
                        dataset.weights.as_deref(),
                        parent,
                        &search,
                    ) {
                        replace_if_better(&mut best_splits[position], candidate);
                    }
                }
            }
            splits_per_weak_model.push(best_splits);
        }

        Ok(self.reply(
            request_id,
            ReplyPayload::FindSplits {
                splits_per_weak_model,
            },
        ))
    }

    fn evaluate_split(
        dataset: &WorkerDataset,
        example_to_node: &[u32],
        node: u32,
        split: &Split,
    ) -> Result<SplitEvaluation> {
        let attribute = split.condition.attribute();
        let column = dataset.features.get(&attribute).ok_or_else(|| {
            TrainError::internal(format!(
                "asked to evaluate a split on feature {attribute} this worker does not own"
            ))
        })?;
        let mut evaluation = SplitEvaluation::new(dataset.num_examples);
        for example in 0..dataset.num_examples {
            if example_to_node[example] != node {
                continue;
            }
            let goes_positive = split
                .condition
                .evaluate(column.attribute_value(example))
                .ok_or_else(|| {
                    TrainError::internal(format!(
                        "split condition type mismatch on feature {attribute}"
                    ))
                })?;
            if goes_positive {
                evaluation.set(example);
            }
        }
        Ok(evaluation)
    }

    fn evaluate_splits(
        &mut self,
        request_id: Option<u64>,
        splits_per_weak_model: &[Vec<(usize, Split)>],
    ) -> Result<WorkerReply> {
        let Some(iteration) = self.iteration.as_ref() else {
            return Ok(self.restart_reply(request_id));
        };
        let dataset = self.dataset()?;
        let work_directory = &self.welcome()?.work_directory;
        let share_directory = share_dir(work_directory, &iteration.iter_uid);
        storage::create_dir_all(&share_directory)?;

        for (weak_model_idx, splits) in splits_per_weak_model.iter().enumerate() {
            let builder = iteration.builders.get(weak_model_idx).ok_or_else(|| {
                TrainError::internal("unexpected number of weak models in EvaluateSplits")
            })?;
            for (position, split) in splits {
                let node = *builder.open_nodes().get(*position).ok_or_else(|| {
                    TrainError::internal("split position out of range in EvaluateSplits")
                })?;
                let evaluation = Self::evaluate_split(
                    dataset,
                    &iteration.example_to_node[weak_model_idx],
                    node,
                    split,
                )?;
                storage::write_bincode(
                    &share_directory.join(evaluation_filename(weak_model_idx, *position)),
                    &evaluation,
                )?;
            }
        }
        Ok(self.reply(request_id, ReplyPayload::EvaluateSplits))
    }

    fn share_splits(
        &mut self,
        request_id: Option<u64>,
        splits_per_weak_model: &[SplitPerOpenNode],
    ) -> Result<WorkerReply> {
        let worker_idx = self.worker_idx;
        let Some(iteration) = self.iteration.as_mut() else {
            return Ok(self.restart_reply(request_id));
        };
        let dataset = self
            .dataset
            .as_ref()
            .ok_or_else(|| TrainError::internal("dataset is not loaded"))?;
        let work_directory = &self
            .welcome
            .as_ref()
            .ok_or_else(|| TrainError::internal("worker was not set up"))?
            .work_directory;
        let share_directory = share_dir(work_directory, &iteration.iter_uid);

        if splits_per_weak_model.len() != iteration.builders.len() {
            return Err(TrainError::internal(
                "unexpected number of weak models in ShareSplits",
            ));
        }

        for (weak_model_idx, splits) in splits_per_weak_model.iter().enumerate() {
            let open_before = iteration.builders[weak_model_idx].open_nodes().to_vec();
            if splits.len() != open_before.len() {
                return Err(TrainError::internal(
                    "unexpected number of splits in ShareSplits",
                ));
            }

            // Resolve the routing of every valid split before touching the
            // tree: own features are evaluated locally, the rest is read
            // from the evaluation the active worker published.
            let mut evaluations: Vec<Option<SplitEvaluation>> =
                Vec::with_capacity(splits.len());
            for (position, split) in splits.iter().enumerate() {
                match split {
                    Some(split)
                        if dataset.features.contains_key(&split.condition.attribute()) =>
                    {
                        evaluations.push(Some(Self::evaluate_split(
                            dataset,
                            &iteration.example_to_node[weak_model_idx],
                            open_before[position],
                            split,
                        )?));
                    }
                    Some(_) => {
                        let evaluation: SplitEvaluation = storage::read_bincode(
                            &share_directory.join(evaluation_filename(weak_model_idx, position)),
                        )
                        .map_err(|e| {
                            TrainError::internal(format!(
                                "worker #{worker_idx} cannot read the shared evaluation of \
                                 split {weak_model_idx}/{position}: {e}"
                            ))
                        })?;
                        evaluations.push(Some(evaluation));
                    }
                    None => evaluations.push(None),
                }
            }

            iteration.builders[weak_model_idx].apply_splits(splits)?;

            for (position, evaluation) in evaluations.iter().enumerate() {
                let Some(evaluation) = evaluation else { continue };
                let node = open_before[position];
                let (negative, positive) =
                    iteration.builders[weak_model_idx].children(node)?;
                let example_to_node = &mut iteration.example_to_node[weak_model_idx];
                for example in 0..dataset.num_examples {
                    if example_to_node[example] == node {
                        example_to_node[example] = if evaluation.get(example) {
                            positive
                        } else {
                            negative
                        };
                    }
                }
            }
        }
        Ok(self.reply(request_id, ReplyPayload::ShareSplits))
    }

    fn end_iter(
        &mut self,
        request_id: Option<u64>,
        iter_idx: u64,
        compute_training_loss: bool,
    ) -> Result<WorkerReply> {
        let Some(iteration) = self.iteration.take() else {
            return Ok(self.restart_reply(request_id));
        };
        if iteration.iter_idx != iter_idx {
            return Err(TrainError::internal(format!(
                "EndIter for iteration {iter_idx} but iteration {} is active",
                iteration.iter_idx
            )));
        }
        let loss = self.loss()?;
        let dataset = self
            .dataset
            .as_ref()
            .ok_or_else(|| TrainError::internal("dataset is not loaded"))?;
        let predictions = self
            .predictions
            .as_mut()
            .ok_or_else(|| TrainError::internal("missing predictions"))?;

        for (weak_model_idx, builder) in iteration.builders.iter().enumerate() {
            let example_to_node = &iteration.example_to_node[weak_model_idx];
            let values = &mut predictions[weak_model_idx];
            for example in 0..dataset.num_examples {
                values[example] += builder.node_value(example_to_node[example]);
            }
        }

        let evaluation: Option<Evaluation> = compute_training_loss.then(|| {
            loss.evaluate(
                &dataset.labels,
                predictions.as_slice(),
                dataset.weights.as_deref(),
            )
        });

        // The shared evaluations of this iteration are dead now that every
        // worker has applied them.
        if self.worker_idx == 0 {
            if let Some(welcome) = &self.welcome {
                let _ = std::fs::remove_dir_all(share_dir(
                    &welcome.work_directory,
                    &iteration.iter_uid,
                ));
            }
        }

        Ok(self.reply(request_id, ReplyPayload::EndIter { evaluation }))
    }

    fn create_checkpoint(
        &mut self,
        request_id: Option<u64>,
        shard_idx: usize,
        begin_example: u64,
        end_example: u64,
    ) -> Result<WorkerReply> {
        let worker_idx = self.worker_idx;
        if self.schedule.take(|trigger| {
            matches!(trigger, RestartTrigger::OnCreateCheckpoint { worker_idx: planned_worker }
                if worker_matches(*planned_worker, worker_idx))
        }) {
            self.simulate_restart();
        }

        let Some(predictions) = self.predictions.as_ref() else {
            return Ok(self.restart_reply(request_id));
        };
        let work_directory = &self.welcome()?.work_directory;

        let begin = begin_example as usize;
        let end = end_example as usize;
        if predictions.iter().any(|values| end > values.len()) || begin > end {
            return Err(TrainError::internal(format!(
                "checkpoint shard range [{begin}, {end}) out of bounds"
            )));
        }
        let values: Vec<Vec<f32>> = predictions
            .iter()
            .map(|per_example| per_example[begin..end].to_vec())
            .collect();
        let shard = PredictionShard::new(shard_idx, begin_example, end_example, values);

        let path = storage::temp_path(&tmp_dir(work_directory), "predictions");
        storage::write_bincode(&path, &shard)?;
        Ok(self.reply(request_id, ReplyPayload::CreateCheckpoint { shard_idx, path }))
    }

    fn restore_checkpoint(
        &mut self,
        request_id: Option<u64>,
        iter_idx: u64,
        num_shards: usize,
        num_weak_models: usize,
    ) -> Result<WorkerReply> {
        self.ensure_dataset()?;
        let num_examples = self.dataset()?.num_examples;
        let directory = checkpoint_dir(&self.welcome()?.work_directory, iter_idx);

        let mut predictions = vec![vec![0.0f32; num_examples]; num_weak_models];
        for shard_idx in 0..num_shards {
            let shard: PredictionShard =
                storage::read_bincode(&directory.join(shard_filename(shard_idx, num_shards)))?;
            shard.verify()?;
            if shard.values.len() != num_weak_models {
                return Err(TrainError::internal(format!(
                    "prediction shard {shard_idx} has {} weak models, expected \
                     {num_weak_models}",
                    shard.values.len()
                )));
            }
            let begin = shard.begin_example as usize;
            for (weak_model_idx, values) in shard.values.iter().enumerate() {
                if begin + values.len() > num_examples {
                    return Err(TrainError::internal(format!(
                        "prediction shard {shard_idx} overflows the example range"
                    )));
                }
                predictions[weak_model_idx][begin..begin + values.len()]
                    .copy_from_slice(values);
            }
        }

        self.predictions = Some(predictions);
        self.iteration = None;
        Ok(self.reply(request_id, ReplyPayload::RestoreCheckpoint))
    }

    fn dispatch(&mut self, request: WorkerRequest) -> Result<WorkerReply> {
        let request_id = request.request_id;
        match request.payload {
            RequestPayload::GetLabelStatistics => self.get_label_statistics(request_id),
            RequestPayload::SetInitialPredictions { label_statistics } => {
                self.set_initial_predictions(request_id, &label_statistics)
            }
            RequestPayload::StartTraining => self.start_training(request_id),
            RequestPayload::StartNewIter {
                iter_idx,
                iter_uid,
                seed: _,
            } => self.start_new_iter(request_id, iter_idx, iter_uid),
            RequestPayload::FindSplits {
                features_per_weak_model,
            } => self.find_splits(request_id, &features_per_weak_model),
            RequestPayload::EvaluateSplits {
                splits_per_weak_model,
            } => self.evaluate_splits(request_id, &splits_per_weak_model),
            RequestPayload::ShareSplits {
                splits_per_weak_model,
                active_workers: _,
            } => self.share_splits(request_id, &splits_per_weak_model),
            RequestPayload::EndIter {
                iter_idx,
                compute_training_loss,
            } => self.end_iter(request_id, iter_idx, compute_training_loss),
            RequestPayload::CreateCheckpoint {
                shard_idx,
                begin_example,
                end_example,
            } => self.create_checkpoint(request_id, shard_idx, begin_example, end_example),
            RequestPayload::RestoreCheckpoint {
                iter_idx,
                num_shards,
                num_weak_models,
            } => self.restore_checkpoint(request_id, iter_idx, num_shards, num_weak_models),
        }
    }
}

impl AbstractWorker for TrainerWorker {
    fn setup(&mut self, welcome: &[u8], worker_idx: usize, _num_workers: usize) -> Result<()> {
        let welcome = WorkerWelcome::from_blob(welcome)?;
        let loss_kind = welcome
            .train_config
            .loss
            .ok_or_else(|| TrainError::internal("welcome carries no resolved loss"))?;
        self.loss = Some(LossRegistry::with_builtins().create(loss_kind, &welcome.train_config)?);
        self.welcome = Some(welcome);
        self.worker_idx = worker_idx;
        Ok(())
    }

    fn run_request(&mut self, request: &[u8]) -> Result<Blob> {
        let request = WorkerRequest::from_blob(request)?;
        self.dispatch(request)?.to_blob()
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::{DeploymentConfig, TrainingConfig, TrainingConfigLinking};
    use crate::dataset::cache::DatasetCacheBuilder;

    fn worker_on_cache(temp: &TempDir) -> TrainerWorker {
        DatasetCacheBuilder::new()
            .column("x", ColumnData::Numerical(vec![1.0, 2.0, 3.0, 4.0]))
            .column("y", ColumnData::Numerical(vec![1.0, 1.0, 3.0, 3.0]))
            .write(&temp.path().join("cache"))
            .unwrap();

        let mut config = TrainingConfig {
            label: "y".to_string(),
            min_examples: 1,
            ..Default::default()
        };
        config.set_default_hyper_parameters().unwrap();
        let welcome = WorkerWelcome {
            work_directory: temp.path().join("work"),
            cache_path: temp.path().join("cache"),
            train_config: config,
            config_link: TrainingConfigLinking {
                label: 1,
                weight: None,
                features: vec![0],
            },
            deployment: DeploymentConfig::default(),
            owned_features: vec![vec![0]],
        };
        storage::create_dir_all(&temp.path().join("work").join("tmp")).unwrap();

        let mut worker = TrainerWorker::new(Arc::default());
        worker
            .setup(&welcome.to_blob().unwrap(), 0, 1)
            .unwrap();
        worker
    }

    fn run(worker: &mut TrainerWorker, payload: RequestPayload) -> WorkerReply {
        let request = WorkerRequest::new(payload);
        let blob = worker.run_request(&request.to_blob().unwrap()).unwrap();
        WorkerReply::from_blob(&blob).unwrap()
    }

    #[test]
    fn test_label_statistics_and_initial_predictions() {
        let temp = TempDir::new().unwrap();
        let mut worker = worker_on_cache(&temp);

        let reply = run(&mut worker, RequestPayload::GetLabelStatistics);
        let statistics = match reply.payload {
            ReplyPayload::GetLabelStatistics { label_statistics } => label_statistics,
            other => panic!("unexpected payload {}", other.kind()),
        };
        assert_eq!(statistics.num_examples(), 4);

        let reply = run(
            &mut worker,
            RequestPayload::SetInitialPredictions {
                label_statistics: statistics,
            },
        );
        assert!(matches!(reply.payload, ReplyPayload::SetInitialPredictions));
        // Mean label is 2.0.
        let predictions = worker.predictions.as_ref().unwrap();
        assert_eq!(predictions.len(), 1);
        assert!((predictions[0][0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_stateful_request_without_state_asks_for_restart() {
        let temp = TempDir::new().unwrap();
        let mut worker = worker_on_cache(&temp);

        let reply = run(
            &mut worker,
            RequestPayload::StartNewIter {
                iter_idx: 0,
                iter_uid: "uid".to_string(),
                seed: 1,
            },
        );
        assert!(reply.request_restart_iter);
    }

    #[test]
    fn test_start_new_iter_reports_root_statistics() {
        let temp = TempDir::new().unwrap();
        let mut worker = worker_on_cache(&temp);

        let reply = run(&mut worker, RequestPayload::GetLabelStatistics);
        let statistics = match reply.payload {
            ReplyPayload::GetLabelStatistics { label_statistics } => label_statistics,
            other => panic!("unexpected payload {}", other.kind()),
        };
        run(
            &mut worker,
            RequestPayload::SetInitialPredictions {
                label_statistics: statistics,
            },
        );

        let reply = run(
            &mut worker,
            RequestPayload::StartNewIter {
                iter_idx: 0,
                iter_uid: "uid".to_string(),
                seed: 1,
            },
        );
        let root = match reply.payload {
            ReplyPayload::StartNewIter {
                root_label_statistics,
            } => root_label_statistics,
            other => panic!("unexpected payload {}", other.kind()),
        };
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].count, 4);
        // Residuals against the mean sum to zero.
        assert!(root[0].sum_gradient.abs() < 1e-6);
    }

    #[test]
    fn test_restart_schedule_fires_once() {
        let schedule = RestartSchedule::default();
        schedule.plan(RestartTrigger::OnCreateCheckpoint { worker_idx: None });
        assert!(schedule.take(|t| matches!(t, RestartTrigger::OnCreateCheckpoint { .. })));
        assert!(!schedule.take(|t| matches!(t, RestartTrigger::OnCreateCheckpoint { .. })));
    }

    #[test]
    fn test_restart_schedule_worker_filter() {
        assert!(worker_matches(None, 3));
        assert!(worker_matches(Some(3), 3));
        assert!(!worker_matches(Some(2), 3));
    }
}

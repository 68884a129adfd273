//! Training and deployment configuration.
//!
//! Configuration is split the same way the training protocol is: the
//! `TrainingConfig` describes *what* to learn and is forwarded to every
//! worker, the `DeploymentConfig` describes *where* and *how wide* the run
//! executes. Linking resolves column names against the dataset cache
//! metadata once, at bootstrap.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::dataset::cache::{CacheMetadata, ColumnKind};
use crate::error::{Result, TrainError};

/// Learning task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    #[default]
    Regression,
    Classification,
}

/// Loss function selector. The concrete implementations live behind the
/// loss registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    SquaredError,
    BinomialLogLikelihood,
}

impl LossKind {
    /// Registry name of the loss.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SquaredError => "squared_error",
            Self::BinomialLogLikelihood => "binomial_log_likelihood",
        }
    }

    /// Default loss for a task.
    pub fn default_for_task(task: Task) -> Self {
        match task {
            Task::Regression => Self::SquaredError,
            Task::Classification => Self::BinomialLogLikelihood,
        }
    }
}

/// Debug-only options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InternalConfig {
    /// Assign every feature to every worker. Debugging only.
    pub duplicate_computation_on_all_workers: bool,
}

/// What to learn. Forwarded to every worker in the welcome blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub task: Task,
    /// Label column name.
    pub label: String,
    /// Optional numerical weight column name.
    pub weight: Option<String>,
    /// Input feature column names. Empty selects every column that is
    /// neither the label nor the weight.
    pub features: Vec<String>,
    /// Loss function. `None` selects the task default at bootstrap.
    pub loss: Option<LossKind>,
    /// Number of boosting iterations.
    pub num_trees: u64,
    /// Maximum tree depth. A tree of depth 1 is a stump.
    pub max_depth: u32,
    pub shrinkage: f32,
    /// Minimum number of examples in each child of a split.
    pub min_examples: u64,
    pub use_hessian_gain: bool,
    pub apply_link_function: bool,
    /// Number of candidate features per open node. `0` selects all.
    pub num_candidate_attributes: i64,
    /// Candidate-feature ratio, used when `num_candidate_attributes == 0`
    /// and the ratio is in `(0, 1]`.
    pub num_candidate_attributes_ratio: f64,
    /// Checkpoint every n trees. Negative disables.
    pub checkpoint_interval_trees: i64,
    /// Checkpoint every n seconds. Negative disables.
    pub checkpoint_interval_seconds: i64,
    /// Export training logs every n trees during training. `0` disables.
    pub export_logs_during_training_in_trees: u64,
    pub random_seed: u64,
    /// Directory receiving exported training logs. `None` disables export.
    pub log_directory: Option<PathBuf>,
    pub internal: InternalConfig,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            task: Task::Regression,
            label: String::new(),
            weight: None,
            features: Vec::new(),
            loss: None,
            num_trees: 300,
            max_depth: 6,
            shrinkage: 0.1,
            min_examples: 5,
            use_hessian_gain: false,
            apply_link_function: true,
            num_candidate_attributes: 0,
            num_candidate_attributes_ratio: -1.0,
            checkpoint_interval_trees: -1,
            checkpoint_interval_seconds: 600,
            export_logs_during_training_in_trees: 0,
            random_seed: 123_456,
            log_directory: None,
            internal: InternalConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Fills the defaults that depend on other fields and rejects
    /// out-of-range values.
    pub fn set_default_hyper_parameters(&mut self) -> Result<()> {
        if self.loss.is_none() {
            let loss = LossKind::default_for_task(self.task);
            tracing::info!("Default loss set to {}", loss.name());
            self.loss = Some(loss);
        }
        if self.label.is_empty() {
            return Err(TrainError::invalid_argument("label column is not set"));
        }
        if self.max_depth == 0 {
            return Err(TrainError::invalid_argument("max_depth must be >= 1"));
        }
        if !(self.shrinkage > 0.0 && self.shrinkage <= 1.0) {
            return Err(TrainError::invalid_argument(
                "shrinkage must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Transport selection. The `working_directory` must be left empty by the
/// caller; the coordinator fills it with the resolved work directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributeConfig {
    pub implementation: String,
    pub working_directory: PathBuf,
}

impl Default for DistributeConfig {
    fn default() -> Self {
        Self {
            implementation: "multi_thread".to_string(),
            working_directory: PathBuf::new(),
        }
    }
}

/// Where and how wide the run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Cache directory for ensemble distributed training. Must be set.
    pub cache_path: PathBuf,
    pub num_workers: usize,
    /// Reuse `cache_path` directly instead of appending a unique run-id
    /// subdirectory, resuming any committed checkpoint found there.
    pub try_resume_training: bool,
    pub distribute: DistributeConfig,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            cache_path: PathBuf::new(),
            num_workers: 1,
            try_resume_training: false,
            distribute: DistributeConfig::default(),
        }
    }
}

/// Bootstrap-time deployment checks.
pub fn check_deployment(deployment: &DeploymentConfig) -> Result<()> {
    if deployment.cache_path.as_os_str().is_empty() {
        return Err(TrainError::invalid_argument(
            "deployment.cache_path is empty. Provide a cache directory for \
             ensemble distributed training.",
        ));
    }
    if !deployment.distribute.working_directory.as_os_str().is_empty() {
        return Err(TrainError::invalid_argument(
            "deployment.distribute.working_directory should be empty. Use \
             deployment.cache_path to specify the cache directory.",
        ));
    }
    if deployment.num_workers == 0 {
        return Err(TrainError::invalid_argument(
            "deployment.num_workers must be >= 1",
        ));
    }
    Ok(())
}

/// Column names resolved to cache column indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfigLinking {
    pub label: usize,
    pub weight: Option<usize>,
    pub features: Vec<usize>,
}

/// Resolves the training config against the dataset cache metadata.
pub fn link_training_config(
    config: &TrainingConfig,
    metadata: &CacheMetadata,
) -> Result<TrainingConfigLinking> {
    let column_index = |name: &str| -> Result<usize> {
        metadata
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| {
                TrainError::invalid_argument(format!("unknown column '{name}' in dataset cache"))
            })
    };

    let label = column_index(&config.label)?;
    match (config.task, &metadata.columns[label].kind) {
        (Task::Regression, ColumnKind::Numerical { .. }) => {}
        (Task::Classification, ColumnKind::Categorical { .. }) => {}
        (task, kind) => {
            return Err(TrainError::invalid_argument(format!(
                "label column '{}' of kind {kind:?} is incompatible with task {task:?}",
                config.label
            )));
        }
    }

    let weight = match &config.weight {
        Some(name) => {
            let idx = column_index(name)?;
            if !matches!(metadata.columns[idx].kind, ColumnKind::Numerical { .. }) {
                return Err(TrainError::invalid_argument(
                    "only weighting with a numerical column is supported",
                ));
            }
            Some(idx)
        }
        None => None,
    };

    let features = if config.features.is_empty() {
        (0..metadata.columns.len())
            .filter(|&idx| idx != label && Some(idx) != weight)
            .collect()
    } else {
        let mut features = Vec::with_capacity(config.features.len());
        for name in &config.features {
            let idx = column_index(name)?;
            if idx == label {
                return Err(TrainError::invalid_argument(format!(
                    "label column '{name}' cannot also be a feature"
                )));
            }
            features.push(idx);
        }
        features
    };
    if features.is_empty() {
        return Err(TrainError::invalid_argument("no input feature columns"));
    }

    Ok(TrainingConfigLinking {
        label,
        weight,
        features,
    })
}

/// On-disk run description consumed by the `dgbt-train` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Typed dataset path, e.g. `cache:/data/prepared`.
    pub dataset: String,
    /// Where the trained model is written.
    pub output: Option<PathBuf>,
    pub training: TrainingConfig,
    pub deployment: DeploymentConfig,
}

impl RunConfig {
    /// Loads a run configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| TrainError::io(path, e))?;
        toml::from_str(&text).map_err(|e| {
            TrainError::invalid_argument(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

//! Protocol message types exchanged between the coordinator and workers.
//!
//! Every request carries an optional `request_id` for correlation; every
//! reply carries the originating worker index and may carry the
//! `request_restart_iter` flag, the signal that the worker has lost its
//! state and the current iteration must be replayed.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{DeploymentConfig, TrainingConfig, TrainingConfigLinking};
use crate::distribute::Blob;
use crate::error::{Result, TrainError};
use crate::loss::{Evaluation, GradientStatistics, LabelStatistics};
use crate::model::tree::SplitCondition;

/// Welcome blob handed to every worker on transport initialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerWelcome {
    pub work_directory: PathBuf,
    pub cache_path: PathBuf,
    pub train_config: TrainingConfig,
    pub config_link: TrainingConfigLinking,
    pub deployment: DeploymentConfig,
    /// `owned_features[worker]` lists the features the worker owns.
    pub owned_features: Vec<Vec<usize>>,
}

impl WorkerWelcome {
    pub fn to_blob(&self) -> Result<Blob> {
        bincode::serialize(self)
            .map_err(|e| TrainError::serialization(format!("failed to encode welcome: {e}")))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        bincode::deserialize(blob)
            .map_err(|e| TrainError::serialization(format!("failed to decode welcome: {e}")))
    }
}

/// A candidate split proposed for one open node. A valid split always
/// carries a strictly positive score and the gradient statistics of both
/// children, which is what a worker needs to re-root after the split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub condition: SplitCondition,
    pub score: f32,
    pub negative: GradientStatistics,
    pub positive: GradientStatistics,
}

/// Best split (`Some`) or no improvement (`None`) for each open node,
/// indexed by open-node position within a weak model. Lifetime: one layer.
pub type SplitPerOpenNode = Vec<Option<Split>>;

/// Number of valid splits in a per-node sequence.
pub fn num_valid_splits(splits: &SplitPerOpenNode) -> usize {
    splits.iter().filter(|s| s.is_some()).count()
}

/// `features[weak_model][open_node]` lists candidate features.
pub type FeaturesPerWeakModelAndNode = Vec<Vec<Vec<usize>>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestPayload {
    GetLabelStatistics,
    SetInitialPredictions {
        label_statistics: LabelStatistics,
    },
    StartTraining,
    StartNewIter {
        iter_idx: u64,
        iter_uid: String,
        seed: u64,
    },
    FindSplits {
        features_per_weak_model: FeaturesPerWeakModelAndNode,
    },
    EvaluateSplits {
        /// Per weak model: `(open-node position, split)` pairs this worker
        /// must evaluate against its example→node mapping.
        splits_per_weak_model: Vec<Vec<(usize, Split)>>,
    },
    ShareSplits {
        splits_per_weak_model: Vec<SplitPerOpenNode>,
        active_workers: Vec<usize>,
    },
    EndIter {
        iter_idx: u64,
        compute_training_loss: bool,
    },
    CreateCheckpoint {
        shard_idx: usize,
        begin_example: u64,
        end_example: u64,
    },
    RestoreCheckpoint {
        iter_idx: u64,
        num_shards: usize,
        num_weak_models: usize,
    },
}

impl RequestPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetLabelStatistics => "GetLabelStatistics",
            Self::SetInitialPredictions { .. } => "SetInitialPredictions",
            Self::StartTraining => "StartTraining",
            Self::StartNewIter { .. } => "StartNewIter",
            Self::FindSplits { .. } => "FindSplits",
            Self::EvaluateSplits { .. } => "EvaluateSplits",
            Self::ShareSplits { .. } => "ShareSplits",
            Self::EndIter { .. } => "EndIter",
            Self::CreateCheckpoint { .. } => "CreateCheckpoint",
            Self::RestoreCheckpoint { .. } => "RestoreCheckpoint",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub request_id: Option<u64>,
    pub payload: RequestPayload,
}

impl WorkerRequest {
    pub fn new(payload: RequestPayload) -> Self {
        Self {
            request_id: None,
            payload,
        }
    }

    pub fn with_request_id(payload: RequestPayload, request_id: u64) -> Self {
        Self {
            request_id: Some(request_id),
            payload,
        }
    }

    pub fn to_blob(&self) -> Result<Blob> {
        bincode::serialize(self)
            .map_err(|e| TrainError::serialization(format!("failed to encode request: {e}")))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        bincode::deserialize(blob)
            .map_err(|e| TrainError::serialization(format!("failed to decode request: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplyPayload {
    GetLabelStatistics {
        label_statistics: LabelStatistics,
    },
    SetInitialPredictions,
    StartTraining,
    StartNewIter {
        /// Root gradient statistics, one entry per weak model. All workers
        /// answer the same values; the coordinator keeps the first reply.
        root_label_statistics: Vec<GradientStatistics>,
    },
    FindSplits {
        splits_per_weak_model: Vec<SplitPerOpenNode>,
    },
    EvaluateSplits,
    ShareSplits,
    EndIter {
        /// Training loss and metrics; present only for the worker asked to
        /// compute them.
        evaluation: Option<Evaluation>,
    },
    CreateCheckpoint {
        shard_idx: usize,
        /// Temporary path of the written shard; the coordinator renames it
        /// into the checkpoint directory.
        path: PathBuf,
    },
    RestoreCheckpoint,
    /// Placeholder payload of a `request_restart_iter` reply.
    RestartIteration,
}

impl ReplyPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GetLabelStatistics { .. } => "GetLabelStatistics",
            Self::SetInitialPredictions => "SetInitialPredictions",
            Self::StartTraining => "StartTraining",
            Self::StartNewIter { .. } => "StartNewIter",
            Self::FindSplits { .. } => "FindSplits",
            Self::EvaluateSplits => "EvaluateSplits",
            Self::ShareSplits => "ShareSplits",
            Self::EndIter { .. } => "EndIter",
            Self::CreateCheckpoint { .. } => "CreateCheckpoint",
            Self::RestoreCheckpoint => "RestoreCheckpoint",
            Self::RestartIteration => "RestartIteration",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerReply {
    pub worker_idx: usize,
    pub request_id: Option<u64>,
    pub request_restart_iter: bool,
    pub payload: ReplyPayload,
}

impl WorkerReply {
    pub fn new(worker_idx: usize, request_id: Option<u64>, payload: ReplyPayload) -> Self {
        Self {
            worker_idx,
            request_id,
            request_restart_iter: false,
            payload,
        }
    }

    /// Reply of a worker that has lost the state needed for the request.
    pub fn restart_iteration(worker_idx: usize, request_id: Option<u64>) -> Self {
        Self {
            worker_idx,
            request_id,
            request_restart_iter: true,
            payload: ReplyPayload::RestartIteration,
        }
    }

    pub fn to_blob(&self) -> Result<Blob> {
        bincode::serialize(self)
            .map_err(|e| TrainError::serialization(format!("failed to encode reply: {e}")))
    }

    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        bincode::deserialize(blob)
            .map_err(|e| TrainError::serialization(format!("failed to decode reply: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = WorkerRequest::with_request_id(
            RequestPayload::CreateCheckpoint {
                shard_idx: 1,
                begin_example: 0,
                end_example: 100,
            },
            1,
        );
        let decoded = WorkerRequest::from_blob(&request.to_blob().unwrap()).unwrap();
        assert_eq!(decoded.request_id, Some(1));
        assert_eq!(decoded.payload.kind(), "CreateCheckpoint");
    }

    #[test]
    fn test_restart_reply() {
        let reply = WorkerReply::restart_iteration(3, Some(7));
        let decoded = WorkerReply::from_blob(&reply.to_blob().unwrap()).unwrap();
        assert!(decoded.request_restart_iter);
        assert_eq!(decoded.worker_idx, 3);
        assert_eq!(decoded.request_id, Some(7));
    }

    #[test]
    fn test_num_valid_splits() {
        use crate::model::tree::SplitCondition;

        let splits: SplitPerOpenNode = vec![
            None,
            Some(Split {
                condition: SplitCondition::NumericalThreshold {
                    attribute: 0,
                    threshold: 1.0,
                },
                score: 0.5,
                negative: GradientStatistics::default(),
                positive: GradientStatistics::default(),
            }),
        ];
        assert_eq!(num_valid_splits(&splits), 1);
    }
}

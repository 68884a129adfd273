//! Assignment of feature columns to workers.
//!
//! Built once at bootstrap from the dataset cache metadata; immutable for
//! the life of the run. The forward map (`worker → features`) is shipped
//! to the workers in the welcome blob; the reverse map routes split work
//! to an owning worker.

use crate::dataset::cache::{CacheMetadata, ColumnKind};
use crate::error::{Result, TrainError};

#[derive(Debug, Clone)]
pub struct FeatureOwnership {
    worker_to_feature: Vec<Vec<usize>>,
    feature_to_worker: Vec<Vec<usize>>,
}

impl FeatureOwnership {
    pub fn num_workers(&self) -> usize {
        self.worker_to_feature.len()
    }

    pub fn features_of_worker(&self, worker_idx: usize) -> &[usize] {
        &self.worker_to_feature[worker_idx]
    }

    /// Workers owning `feature`; usually a single entry.
    pub fn owners_of_feature(&self, feature: usize) -> &[usize] {
        self.feature_to_worker
            .get(feature)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The full forward map, for the worker welcome blob.
    pub fn worker_features(&self) -> &[Vec<usize>] {
        &self.worker_to_feature
    }
}

/// Expected split-finding cost of a column. Orders the columns as
/// boolean < categorical == discretized numerical < dense numerical.
fn feature_cost_score(kind: &ColumnKind) -> i64 {
    match kind {
        ColumnKind::Boolean => 0,
        ColumnKind::Categorical { num_values } => *num_values as i64 + (1i64 << 32),
        ColumnKind::DiscretizedNumerical { num_buckets } => *num_buckets as i64 + (1i64 << 32),
        ColumnKind::Numerical { num_unique_values } => *num_unique_values as i64 + (2i64 << 32),
    }
}

/// Assigns each feature to one worker: features are sorted by descending
/// cost score (stable, so ties keep the original feature order) and dealt
/// round-robin. In `duplicate` mode every worker receives every feature
/// and the reverse map records only worker 0, keeping routing
/// deterministic.
pub fn assign_features_to_workers(
    features: &[usize],
    num_workers: usize,
    metadata: &CacheMetadata,
    duplicate: bool,
) -> Result<FeatureOwnership> {
    let max_feature = features.iter().copied().max().unwrap_or(0);
    for &feature in features {
        if feature >= metadata.columns.len() {
            return Err(TrainError::internal(format!(
                "feature {feature} out of range ({} cached columns)",
                metadata.columns.len()
            )));
        }
    }

    let mut ownership = FeatureOwnership {
        worker_to_feature: vec![Vec::new(); num_workers],
        feature_to_worker: vec![Vec::new(); max_feature + 1],
    };

    if duplicate {
        tracing::warn!(
            "Assigning all the features to all the workers. This option should \
             only be used for debugging."
        );
        for &feature in features {
            ownership.feature_to_worker[feature].push(0);
            for worker in &mut ownership.worker_to_feature {
                worker.push(feature);
            }
        }
        return Ok(ownership);
    }

    let mut scored: Vec<(i64, usize)> = features
        .iter()
        .map(|&feature| (feature_cost_score(&metadata.columns[feature].kind), feature))
        .collect();
    scored.sort_by_key(|(score, _)| std::cmp::Reverse(*score));

    for (rank, (_, feature)) in scored.into_iter().enumerate() {
        let worker_idx = rank % num_workers;
        ownership.worker_to_feature[worker_idx].push(feature);
        ownership.feature_to_worker[feature].push(worker_idx);
    }

    Ok(ownership)
}

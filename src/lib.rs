//! Distributed gradient boosted decision trees.
//!
//! Trains a GBDT ensemble on datasets too large for one process: a single
//! coordinator sequences the work of a fleet of workers that hold
//! disjoint subsets of the feature columns. Each tree is grown layer by
//! layer; per-worker split proposals are merged centrally, committed back
//! to every worker, and the run checkpoints its progress so it survives
//! worker and coordinator restarts.
//!
//! # Example
//!
//! ```no_run
//! use dgbt::{DeploymentConfig, DistributedGbdtLearner, TrainingConfig};
//!
//! # async fn run() -> dgbt::Result<()> {
//! let training = TrainingConfig {
//!     label: "income".to_string(),
//!     num_trees: 100,
//!     ..Default::default()
//! };
//! let deployment = DeploymentConfig {
//!     cache_path: "/tmp/dgbt".into(),
//!     num_workers: 8,
//!     ..Default::default()
//! };
//!
//! let learner = DistributedGbdtLearner::new(training, deployment);
//! let model = learner.train("cache:/data/prepared").await?;
//! model.save("/tmp/model".as_ref())?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod dataset;
pub mod distribute;
pub mod error;
pub mod loss;
pub mod model;
pub mod storage;
pub mod worker;

pub use config::{DeploymentConfig, LossKind, RunConfig, Task, TrainingConfig};
pub use coordinator::DistributedGbdtLearner;
pub use error::{Result, TrainError};
pub use model::GbdtModel;

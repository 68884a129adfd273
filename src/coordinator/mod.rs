//! The distributed training coordinator.
//!
//! A single logical process that sequences the work of the fleet: it
//! allocates features to workers, drives the per-iteration barrier
//! protocol, merges split proposals, checkpoints its progress and rewinds
//! to the last committed checkpoint when a worker comes back missing
//! state.

pub mod checkpoint;
pub mod client;
pub mod feature_ownership;
pub mod iteration;
pub mod monitoring;
pub mod protocol;
pub mod sampler;
pub mod snapshot;
pub mod split_merge;
pub mod train;
pub mod tree_builder;

pub use client::DistributionClient;
pub use feature_ownership::{assign_features_to_workers, FeatureOwnership};
pub use monitoring::{Monitoring, Stage};
pub use train::DistributedGbdtLearner;

//! Dataset access for distributed training.

pub mod cache;

pub use cache::{
    CacheMetadata, ColumnData, ColumnKind, ColumnMetadata, DatasetCacheBuilder,
    DatasetCacheReader,
};

//! Columnar on-disk dataset cache.
//!
//! The cache is the only dataset form the distributed trainer reads.
//! Layout:
//!
//! ```text
//! <cache>/metadata            committed cache metadata
//! <cache>/partial_metadata    marker of a partially written cache
//! <cache>/columns/<idx>       one file per column
//! ```
//!
//! A cache is committed iff its `metadata` file exists. A partially
//! written cache (columns present, metadata not yet computed) is turned
//! into a committed one by [`finalize_partial_cache`].

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrainError};
use crate::model::tree::AttributeValue;
use crate::storage;

pub const METADATA_FILE: &str = "metadata";
pub const PARTIAL_METADATA_FILE: &str = "partial_metadata";
pub const COLUMN_DIR: &str = "columns";

/// Type and cardinality of one cached column. The cardinalities feed the
/// feature allocator's cost scores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Numerical { num_unique_values: u64 },
    DiscretizedNumerical { num_buckets: u64 },
    Categorical { num_values: u64 },
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub num_examples: u64,
    pub columns: Vec<ColumnMetadata>,
}

/// Marker of a cache whose columns exist but whose metadata has not been
/// computed yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialCacheMetadata {
    pub num_examples: u64,
    pub column_names: Vec<String>,
}

/// The values of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnData {
    Numerical(Vec<f32>),
    DiscretizedNumerical {
        /// Ascending bucket boundaries; `boundaries.len() + 1` buckets.
        boundaries: Vec<f32>,
        buckets: Vec<u32>,
    },
    Categorical(Vec<u32>),
    Boolean(Vec<bool>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Numerical(v) => v.len(),
            Self::DiscretizedNumerical { buckets, .. } => buckets.len(),
            Self::Categorical(v) => v.len(),
            Self::Boolean(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed value for one example, as seen by split conditions. Boolean
    /// columns behave as 0/1 numericals.
    pub fn attribute_value(&self, example: usize) -> AttributeValue {
        match self {
            Self::Numerical(v) => AttributeValue::Numerical(v[example]),
            Self::DiscretizedNumerical { buckets, .. } => {
                AttributeValue::Discretized(buckets[example])
            }
            Self::Categorical(v) => AttributeValue::Categorical(v[example]),
            Self::Boolean(v) => AttributeValue::Numerical(if v[example] { 1.0 } else { 0.0 }),
        }
    }

    /// The value of one example read as a label.
    pub fn label_value(&self, example: usize) -> f32 {
        match self {
            Self::Numerical(v) => v[example],
            Self::DiscretizedNumerical { buckets, .. } => buckets[example] as f32,
            Self::Categorical(v) => v[example] as f32,
            Self::Boolean(v) => {
                if v[example] {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }

    /// Computes the column's metadata kind.
    fn kind(&self) -> ColumnKind {
        match self {
            Self::Numerical(v) => {
                let unique: BTreeSet<u32> = v.iter().map(|x| x.to_bits()).collect();
                ColumnKind::Numerical {
                    num_unique_values: unique.len() as u64,
                }
            }
            Self::DiscretizedNumerical { boundaries, .. } => ColumnKind::DiscretizedNumerical {
                num_buckets: boundaries.len() as u64 + 1,
            },
            Self::Categorical(v) => ColumnKind::Categorical {
                num_values: v.iter().max().map(|&m| m as u64 + 1).unwrap_or(0),
            },
            Self::Boolean(_) => ColumnKind::Boolean,
        }
    }
}

fn column_path(cache: &Path, idx: usize) -> PathBuf {
    cache.join(COLUMN_DIR).join(idx.to_string())
}

/// Returns true if `path` holds a committed dataset cache.
pub fn is_dataset_cache(path: &Path) -> bool {
    path.join(METADATA_FILE).exists()
}

/// Returns true if `path` holds a partially written dataset cache.
pub fn is_partial_dataset_cache(path: &Path) -> bool {
    path.join(PARTIAL_METADATA_FILE).exists()
}

/// Builds a dataset cache from in-memory columns.
#[derive(Default)]
pub struct DatasetCacheBuilder {
    columns: Vec<(String, ColumnData)>,
}

impl DatasetCacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>, data: ColumnData) -> Self {
        self.columns.push((name.into(), data));
        self
    }

    fn check_columns(&self) -> Result<u64> {
        let first = self
            .columns
            .first()
            .ok_or_else(|| TrainError::invalid_argument("dataset cache has no columns"))?;
        let num_examples = first.1.len();
        for (name, data) in &self.columns {
            if data.len() != num_examples {
                return Err(TrainError::invalid_argument(format!(
                    "column '{name}' has {} values, expected {num_examples}",
                    data.len()
                )));
            }
        }
        Ok(num_examples as u64)
    }

    fn write_columns(&self, path: &Path) -> Result<()> {
        storage::create_dir_all(&path.join(COLUMN_DIR))?;
        for (idx, (_, data)) in self.columns.iter().enumerate() {
            storage::write_bincode(&column_path(path, idx), data)?;
        }
        Ok(())
    }

    /// Writes a committed cache to `path`.
    pub fn write(self, path: &Path) -> Result<CacheMetadata> {
        let num_examples = self.check_columns()?;
        self.write_columns(path)?;
        let metadata = CacheMetadata {
            num_examples,
            columns: self
                .columns
                .iter()
                .map(|(name, data)| ColumnMetadata {
                    name: name.clone(),
                    kind: data.kind(),
                })
                .collect(),
        };
        storage::write_bincode(&path.join(METADATA_FILE), &metadata)?;
        Ok(metadata)
    }

    /// Writes an uncommitted (partial) cache to `path`. Column values are
    /// on disk but per-column metadata has not been computed.
    pub fn write_partial(self, path: &Path) -> Result<()> {
        let num_examples = self.check_columns()?;
        self.write_columns(path)?;
        let partial = PartialCacheMetadata {
            num_examples,
            column_names: self.columns.iter().map(|(name, _)| name.clone()).collect(),
        };
        storage::write_bincode(&path.join(PARTIAL_METADATA_FILE), &partial)
    }
}

/// Computes the metadata of a partially written cache and commits it in
/// place.
pub fn finalize_partial_cache(path: &Path) -> Result<CacheMetadata> {
    let partial: PartialCacheMetadata =
        storage::read_bincode(&path.join(PARTIAL_METADATA_FILE))?;

    let mut columns = Vec::with_capacity(partial.column_names.len());
    for (idx, name) in partial.column_names.iter().enumerate() {
        let data: ColumnData = storage::read_bincode(&column_path(path, idx))?;
        if data.len() as u64 != partial.num_examples {
            return Err(TrainError::invalid_argument(format!(
                "partial cache column '{name}' has {} values, expected {}",
                data.len(),
                partial.num_examples
            )));
        }
        columns.push(ColumnMetadata {
            name: name.clone(),
            kind: data.kind(),
        });
    }

    let metadata = CacheMetadata {
        num_examples: partial.num_examples,
        columns,
    };
    storage::write_bincode(&path.join(METADATA_FILE), &metadata)?;
    std::fs::remove_file(path.join(PARTIAL_METADATA_FILE))
        .map_err(|e| TrainError::io(path.join(PARTIAL_METADATA_FILE), e))?;
    Ok(metadata)
}

/// Read access to a committed dataset cache.
pub struct DatasetCacheReader {
    path: PathBuf,
    metadata: CacheMetadata,
}

impl DatasetCacheReader {
    pub fn open(path: &Path) -> Result<Self> {
        if !is_dataset_cache(path) {
            return Err(TrainError::invalid_argument(format!(
                "{} is not a committed dataset cache",
                path.display()
            )));
        }
        let metadata = storage::read_bincode(&path.join(METADATA_FILE))?;
        Ok(Self {
            path: path.to_path_buf(),
            metadata,
        })
    }

    pub fn metadata(&self) -> &CacheMetadata {
        &self.metadata
    }

    pub fn num_examples(&self) -> u64 {
        self.metadata.num_examples
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.metadata.columns.iter().position(|c| c.name == name)
    }

    pub fn load_column(&self, idx: usize) -> Result<ColumnData> {
        if idx >= self.metadata.columns.len() {
            return Err(TrainError::internal(format!(
                "column index {idx} out of range ({} columns)",
                self.metadata.columns.len()
            )));
        }
        storage::read_bincode(&column_path(&self.path, idx))
    }
}

//! Filesystem helpers shared by the coordinator and the workers.
//!
//! The work directory is a single-writer resource: the coordinator writes
//! into it directly, workers write only into temporary paths that are later
//! renamed. All multi-byte artifacts are bincode-encoded and written
//! atomically (temporary file + rename).

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, TrainError};

/// Recursively creates a directory.
pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| TrainError::io(path, e))
}

/// Writes `data` to `path` atomically: the bytes land in a sibling
/// temporary file which is then renamed over the destination.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| TrainError::invalid_argument(format!("invalid path: {}", path.display())))?;
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
    fs::write(&temp_path, data).map_err(|e| TrainError::io(&temp_path, e))?;
    rename(&temp_path, path)
}

/// Renames `from` to `to`.
pub fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| TrainError::io(from, e))
}

/// Serializes `value` with bincode and writes it atomically to `path`.
pub fn write_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = bincode::serialize(value).map_err(|e| {
        TrainError::serialization(format!("failed to encode {}: {e}", path.display()))
    })?;
    atomic_write(path, &data)
}

/// Reads and bincode-decodes a value from `path`.
pub fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(|e| TrainError::io(path, e))?;
    bincode::deserialize(&data).map_err(|e| {
        TrainError::serialization(format!("failed to decode {}: {e}", path.display()))
    })
}

/// Lists the file names (not full paths) contained in a directory.
pub fn list_dir(path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = fs::read_dir(path).map_err(|e| TrainError::io(path, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| TrainError::io(path, e))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

/// Returns true if `path` exists.
pub fn exists(path: &Path) -> bool {
    path.exists()
}

/// Returns a unique temporary file path under `dir`.
pub fn temp_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}-{}", uuid::Uuid::new_v4()))
}

//! Marker-file commit protocol for checkpoints.
//!
//! A checkpoint is committed by atomically creating a marker file whose
//! name is the decimal iteration index. Markers are only ever created,
//! never deleted, during a run, so the greatest marker is the current
//! committed iteration. No locks are required as long as there is at most
//! one coordinator per work directory.

use std::path::Path;

use crate::error::Result;
use crate::storage;

/// Commits the checkpoint of `iter_idx` by creating its marker.
pub fn add_snapshot(directory: &Path, iter_idx: u64) -> Result<()> {
    storage::create_dir_all(directory)?;
    storage::atomic_write(&directory.join(iter_idx.to_string()), &[])
}

/// The greatest committed iteration, or `None` when no checkpoint has
/// been committed yet.
pub fn greatest_snapshot(directory: &Path) -> Result<Option<u64>> {
    if !directory.exists() {
        return Ok(None);
    }
    let names = storage::list_dir(directory)?;
    Ok(names.iter().filter_map(|name| name.parse::<u64>().ok()).max())
}

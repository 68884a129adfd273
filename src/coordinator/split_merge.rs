//! Element-wise merging of per-worker split proposals.
//!
//! Merging runs incrementally as replies arrive. Because the comparison
//! is commutative and associative with a deterministic tie-break, the
//! arrival order of worker replies cannot change the merged result.

use crate::error::{Result, TrainError};

use super::protocol::{Split, SplitPerOpenNode};

/// True when `candidate` beats the `current` slot content: a valid split
/// beats an empty slot, a higher score beats a lower one, and on a score
/// tie the lower attribute index wins.
pub fn challenger_wins(current: &Option<Split>, candidate: &Split) -> bool {
    if !candidate.score.is_finite() {
        return false;
    }
    match current {
        None => true,
        Some(current) => {
            if candidate.score != current.score {
                candidate.score > current.score
            } else {
                candidate.condition.attribute() < current.condition.attribute()
            }
        }
    }
}

/// Replaces `slot` with `candidate` if it wins.
pub fn replace_if_better(slot: &mut Option<Split>, candidate: Split) {
    if challenger_wins(slot, &candidate) {
        *slot = Some(candidate);
    }
}

/// Merges one worker's proposals into the accumulated best splits.
pub fn merge_best_splits(
    worker_splits: SplitPerOpenNode,
    merged: &mut SplitPerOpenNode,
) -> Result<()> {
    if worker_splits.len() != merged.len() {
        return Err(TrainError::internal(format!(
            "split count mismatch: worker proposed {}, expected {}",
            worker_splits.len(),
            merged.len()
        )));
    }
    for (slot, candidate) in merged.iter_mut().zip(worker_splits) {
        if let Some(candidate) = candidate {
            replace_if_better(slot, candidate);
        }
    }
    Ok(())
}

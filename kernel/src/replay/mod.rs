// Deterministic Chain Replay
//
// Orders the rows of one entity oldest to newest by following
// `previous_version` links from the sentinel, enforcing invariants
// first.

use std::collections::HashMap;

use serde::Serialize;

use crate::chain::{EntityId, VersionId, VersionedRecord};
use crate::invariants::{InvariantEngine, InvariantViolation};

/// Errors that can occur during replay.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("broken chain for {0}: rows do not link from the empty version")]
    BrokenChain(EntityId),
}

/// Replay the rows of one entity into chain order.
///
/// This is the only supported way to derive an entity's history.
pub fn replay_chain(
    rows: Vec<VersionedRecord>,
    invariants: &InvariantEngine,
) -> Result<Vec<VersionedRecord>, ReplayError> {
    invariants.evaluate(&rows)?;

    let Some(entity_id) = rows.first().map(|r| r.entity_id.clone()) else {
        return Ok(rows);
    };

    let total = rows.len();
    let mut by_previous: HashMap<VersionId, VersionedRecord> = rows
        .into_iter()
        .map(|r| (r.previous_version.clone(), r))
        .collect();

    let mut ordered = Vec::with_capacity(total);
    let mut cursor = VersionId::empty();
    while let Some(row) = by_previous.remove(&cursor) {
        cursor = row.version.clone();
        ordered.push(row);
    }

    // an engine without the linkage invariant can let a fork through
    if ordered.len() != total {
        return Err(ReplayError::BrokenChain(entity_id));
    }

    Ok(ordered)
}

/// Outcome of verifying one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainSummary {
    pub entity_id: EntityId,
    pub rows: usize,
    pub current_version: VersionId,
    pub active: bool,
}

/// Summarize a replayed chain; `None` for an empty one.
pub fn summarize(chain: &[VersionedRecord]) -> Option<ChainSummary> {
    let last = chain.last()?;
    Some(ChainSummary {
        entity_id: last.entity_id.clone(),
        rows: chain.len(),
        current_version: last.version.clone(),
        active: last.active,
    })
}

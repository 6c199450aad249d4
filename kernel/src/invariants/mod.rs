// Invariant Framework
//
// Invariants are pure rules over the full row set of one entity. They
// are checked whenever a chain is replayed, so corruption written by a
// buggy writer is surfaced instead of silently read.

use std::collections::{HashMap, HashSet};

use crate::chain::{VersionId, VersionedRecord};

/// Result of invariant evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantResult {
    Pass,
    Fail(String),
}

/// Trait implemented by all invariants.
///
/// Invariants must be:
/// - Pure
/// - Deterministic
/// - Side-effect free
pub trait Invariant: Send + Sync {
    fn name(&self) -> &'static str;

    /// `history` holds every row of one entity, in any order.
    fn validate(&self, history: &[VersionedRecord]) -> InvariantResult;
}

/// Invariant engine that evaluates a set of invariants.
#[derive(Default)]
pub struct InvariantEngine {
    invariants: Vec<Box<dyn Invariant>>,
}

impl InvariantEngine {
    /// Create an engine with no invariants.
    pub fn new() -> Self {
        Self {
            invariants: Vec::new(),
        }
    }

    /// Engine with every built-in chain invariant registered.
    pub fn chain_invariants() -> Self {
        let mut engine = Self::new();
        engine.register(SingleEntity);
        engine.register(UniqueVersions);
        engine.register(SingleLatest);
        engine.register(LinkedChain);
        engine
    }

    /// Register an invariant.
    pub fn register<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    pub fn len(&self) -> usize {
        self.invariants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invariants.is_empty()
    }

    /// Evaluate all invariants.
    ///
    /// Stops at the first failure.
    pub fn evaluate(&self, history: &[VersionedRecord]) -> Result<(), InvariantViolation> {
        for invariant in &self.invariants {
            match invariant.validate(history) {
                InvariantResult::Pass => continue,
                InvariantResult::Fail(reason) => {
                    return Err(InvariantViolation {
                        invariant: invariant.name(),
                        reason,
                    })
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for InvariantEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.invariants.iter().map(|i| i.name()).collect();
        f.debug_struct("InvariantEngine")
            .field("invariants", &names)
            .finish()
    }
}

/// Returned when an invariant is violated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invariant `{invariant}` violated: {reason}")]
pub struct InvariantViolation {
    pub invariant: &'static str,
    pub reason: String,
}

/// All rows carry the same entity id.
pub struct SingleEntity;

impl Invariant for SingleEntity {
    fn name(&self) -> &'static str {
        "single-entity"
    }

    fn validate(&self, history: &[VersionedRecord]) -> InvariantResult {
        match history.split_first() {
            Some((head, rest)) => match rest.iter().find(|r| r.entity_id != head.entity_id) {
                Some(stray) => InvariantResult::Fail(format!(
                    "row {} belongs to {}, not {}",
                    stray.version, stray.entity_id, head.entity_id
                )),
                None => InvariantResult::Pass,
            },
            None => InvariantResult::Pass,
        }
    }
}

/// No version id appears twice.
pub struct UniqueVersions;

impl Invariant for UniqueVersions {
    fn name(&self) -> &'static str {
        "unique-versions"
    }

    fn validate(&self, history: &[VersionedRecord]) -> InvariantResult {
        let mut seen = HashSet::new();
        for row in history {
            if !seen.insert(&row.version) {
                return InvariantResult::Fail(format!("version {} written twice", row.version));
            }
        }
        InvariantResult::Pass
    }
}

/// At most one row is flagged latest, and a non-empty chain has one.
pub struct SingleLatest;

impl Invariant for SingleLatest {
    fn name(&self) -> &'static str {
        "single-latest"
    }

    fn validate(&self, history: &[VersionedRecord]) -> InvariantResult {
        let latest = history.iter().filter(|r| r.latest).count();
        match (history.is_empty(), latest) {
            (true, _) | (false, 1) => InvariantResult::Pass,
            (false, n) => InvariantResult::Fail(format!("{n} rows flagged latest")),
        }
    }
}

/// Rows form one unbranched list from the sentinel to the latest row.
///
/// Exactly one row points at the empty version, no row has two
/// successors, every `previous_version` names a row in the chain, and
/// the walk from the first row ends at the row flagged latest.
pub struct LinkedChain;

impl Invariant for LinkedChain {
    fn name(&self) -> &'static str {
        "linked-chain"
    }

    fn validate(&self, history: &[VersionedRecord]) -> InvariantResult {
        if history.is_empty() {
            return InvariantResult::Pass;
        }

        let firsts = history.iter().filter(|r| r.is_first_version()).count();
        if firsts != 1 {
            return InvariantResult::Fail(format!("{firsts} rows point at the empty version"));
        }

        let versions: HashSet<&VersionId> = history.iter().map(|r| &r.version).collect();
        let mut successors: HashMap<&VersionId, &VersionedRecord> = HashMap::new();
        for row in history.iter().filter(|r| !r.is_first_version()) {
            if !versions.contains(&row.previous_version) {
                return InvariantResult::Fail(format!(
                    "row {} points at unknown version {}",
                    row.version, row.previous_version
                ));
            }
            if successors.insert(&row.previous_version, row).is_some() {
                return InvariantResult::Fail(format!(
                    "version {} has more than one successor",
                    row.previous_version
                ));
            }
        }

        // walk from the first row; a cycle would leave rows unreached
        let mut cursor = history.iter().find(|r| r.is_first_version());
        let mut reached = 0;
        let mut tail = None;
        while let Some(row) = cursor {
            reached += 1;
            if reached > history.len() {
                break;
            }
            tail = Some(row);
            cursor = successors.get(&row.version).copied();
        }

        if reached != history.len() {
            return InvariantResult::Fail(format!(
                "{} of {} rows unreachable from the first version",
                history.len().saturating_sub(reached),
                history.len()
            ));
        }

        match tail {
            Some(row) if row.latest => InvariantResult::Pass,
            Some(row) => InvariantResult::Fail(format!(
                "chain ends at {}, which is not flagged latest",
                row.version
            )),
            None => InvariantResult::Pass,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Fields;

    fn chain(len: usize) -> Vec<VersionedRecord> {
        let mut rows = vec![VersionedRecord::first(Fields::new(), None)];
        for _ in 1..len {
            let mut next = rows[rows.len() - 1].successor(Fields::new(), true, None);
            next.latest = true;
            if let Some(prev) = rows.last_mut() {
                prev.latest = false;
            }
            rows.push(next);
        }
        rows
    }

    #[test]
    fn well_formed_chain_passes_every_invariant() {
        let engine = InvariantEngine::chain_invariants();
        assert_eq!(engine.len(), 4);

        let mut rows = chain(4);
        rows.reverse();
        assert!(engine.evaluate(&rows).is_ok());
        assert!(engine.evaluate(&[]).is_ok());
    }

    #[test]
    fn two_latest_rows_are_rejected() {
        let mut rows = chain(3);
        rows[0].latest = true;

        let err = InvariantEngine::chain_invariants()
            .evaluate(&rows)
            .unwrap_err();
        assert_eq!(err.invariant, "single-latest");
    }

    #[test]
    fn forked_chain_is_rejected() {
        let mut rows = chain(2);
        rows[1].latest = false;
        let fork = rows[0].successor(Fields::new(), true, None);
        rows.push(fork);

        let err = InvariantEngine::chain_invariants()
            .evaluate(&rows)
            .unwrap_err();
        assert_eq!(err.invariant, "linked-chain");
        assert!(err.reason.contains("more than one successor"));
    }

    #[test]
    fn chain_must_end_at_latest_row() {
        let mut rows = chain(3);
        rows[2].latest = false;
        rows[1].latest = true;

        let err = LinkedChain.validate(&rows);
        assert!(matches!(err, InvariantResult::Fail(reason) if reason.contains("not flagged latest")));
    }

    #[test]
    fn dangling_link_is_rejected() {
        let rows = chain(3);
        let orphan = vec![rows[0].clone(), rows[2].clone()];

        let result = LinkedChain.validate(&orphan);
        assert!(matches!(result, InvariantResult::Fail(reason) if reason.contains("unknown version")));
    }

    #[test]
    fn custom_invariants_run_after_builtins() {
        struct NeverDeleted;

        impl Invariant for NeverDeleted {
            fn name(&self) -> &'static str {
                "never-deleted"
            }

            fn validate(&self, history: &[VersionedRecord]) -> InvariantResult {
                if history.iter().any(|r| !r.active) {
                    InvariantResult::Fail("entity was deleted".into())
                } else {
                    InvariantResult::Pass
                }
            }
        }

        let mut engine = InvariantEngine::chain_invariants();
        engine.register(NeverDeleted);

        let mut rows = chain(2);
        rows[1].active = false;

        let err = engine.evaluate(&rows).unwrap_err();
        assert!(err.to_string().contains("never-deleted"));
    }
}

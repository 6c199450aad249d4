// Record Storage Abstraction
//
// Defines the contract between the mutation pipeline / query layer and
// a backing store. Implementations persist rows for each kind in its
// own table.
//
// Properties required from implementations:
// - Append-only: rows are never rewritten except for the `latest` flip
//   of the row being superseded
// - Atomic: `append` either flips and inserts, or changes nothing
// - CAS on version: `append` only succeeds if the expected version is
//   still the entity's latest row

use crate::chain::{EntityId, VersionId, VersionedRecord};
use crate::query::Selection;
use crate::replay::ReplayError;
use crate::schema::drift::ActualColumn;
use crate::schema::{Kind, ValidationError};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("version conflict on {kind} {entity_id}: expected {expected}, latest is {actual}")]
    VersionConflict {
        kind: String,
        entity_id: EntityId,
        expected: VersionId,
        actual: VersionId,
    },

    #[error("no {kind} entity with id {entity_id}")]
    EntityNotFound { kind: String, entity_id: EntityId },

    #[error("row {entity_id}/{version} already exists in {kind}")]
    Duplicate {
        kind: String,
        entity_id: EntityId,
        version: VersionId,
    },

    #[error("integrity violation in {kind}: {detail}")]
    Integrity { kind: String, detail: String },

    #[error("kind `{0}` has no table; run bootstrap first")]
    UnknownKind(String),

    #[error("unit of work exceeded its {budget_ms}ms budget")]
    Timeout { budget_ms: u64 },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Replay(#[from] ReplayError),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Storage backend for versioned rows.
pub trait RecordStore: Send + Sync {
    /// Create the table for `kind` unless it exists. Never alters an
    /// existing table. Returns whether a table was created.
    fn ensure_kind(&self, kind: &Kind) -> Result<bool, StoreError>;

    /// Columns of the existing table for `kind`, `None` if absent.
    fn describe(&self, kind: &Kind) -> Result<Option<Vec<ActualColumn>>, StoreError>;

    /// Insert the first row of a new entity.
    fn insert_first(&self, kind: &Kind, record: &VersionedRecord) -> Result<(), StoreError>;

    /// Supersede `expected` with `record` in one unit of work.
    ///
    /// Implementations must, atomically:
    /// - fail with `EntityNotFound` if the entity has no latest row
    /// - fail with `VersionConflict` if the latest row is not `expected`
    /// - flip `expected` to `latest = false` and insert `record`
    fn append(
        &self,
        kind: &Kind,
        expected: &VersionId,
        record: &VersionedRecord,
    ) -> Result<(), StoreError>;

    /// Rows admitted by the selection's scope and condition.
    fn select(&self, kind: &Kind, selection: &Selection) -> Result<Vec<VersionedRecord>, StoreError>;

    /// Every row of one entity, in store order.
    fn rows_of(&self, kind: &Kind, entity_id: &EntityId) -> Result<Vec<VersionedRecord>, StoreError>;
}

// Mutation Pipeline
//
// The only writer of chain columns. Callers hand in field values and,
// for updates, the record they last read; the pipeline builds the next
// row and asks the store to append it against that record's version.
//
// A stale `existing` fails with a version conflict. Nothing is retried
// here: the caller re-reads and decides.

use tracing::{debug, error, warn};

use crate::chain::{EntityId, VersionedRecord};
use crate::invariants::InvariantEngine;
use crate::schema::{Fields, Kind, Value};
use crate::store::{RecordStore, StoreError};

/// Field changes for an update.
///
/// Fields not named keep their current value. `active` of `None`
/// carries the existing row's flag forward.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    pub fields: Fields,
    pub active: Option<bool>,
}

impl Changes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = Some(active);
        self
    }
}

impl From<Fields> for Changes {
    fn from(fields: Fields) -> Self {
        Self {
            fields,
            active: None,
        }
    }
}

/// Versioned entity store over a record backend.
#[derive(Debug)]
pub struct VersionedStore<S> {
    store: S,
    invariants: InvariantEngine,
}

impl<S: RecordStore> VersionedStore<S> {
    /// Store with the built-in chain invariants.
    pub fn new(store: S) -> Self {
        Self::with_invariants(store, InvariantEngine::chain_invariants())
    }

    pub fn with_invariants(store: S, invariants: InvariantEngine) -> Self {
        Self { store, invariants }
    }

    pub fn backend(&self) -> &S {
        &self.store
    }

    pub fn invariants(&self) -> &InvariantEngine {
        &self.invariants
    }

    /// Start a new entity.
    pub fn create(
        &self,
        kind: &Kind,
        fields: Fields,
        actor: Option<&EntityId>,
    ) -> Result<VersionedRecord, StoreError> {
        kind.validate_fields(&fields)?;

        let record = VersionedRecord::first(kind.complete_fields(fields), actor.cloned());
        self.store.insert_first(kind, &record)?;

        debug!(
            kind = kind.name(),
            entity_id = %record.entity_id,
            version = %record.version,
            "created"
        );
        Ok(record)
    }

    /// Append a version of `existing` with `changes` applied.
    pub fn update(
        &self,
        kind: &Kind,
        existing: &VersionedRecord,
        changes: impl Into<Changes>,
        actor: Option<&EntityId>,
    ) -> Result<VersionedRecord, StoreError> {
        let changes = changes.into();
        kind.validate_fields(&changes.fields)?;

        let mut fields = existing.fields.clone();
        fields.extend(changes.fields);
        let active = changes.active.unwrap_or(existing.active);

        self.append(kind, existing, fields, active, actor)
    }

    /// Append a tombstone for `existing`. Fields carry forward unchanged.
    pub fn delete(
        &self,
        kind: &Kind,
        existing: &VersionedRecord,
        actor: Option<&EntityId>,
    ) -> Result<VersionedRecord, StoreError> {
        self.append(kind, existing, existing.fields.clone(), false, actor)
    }

    fn append(
        &self,
        kind: &Kind,
        existing: &VersionedRecord,
        fields: Fields,
        active: bool,
        actor: Option<&EntityId>,
    ) -> Result<VersionedRecord, StoreError> {
        let record = existing.successor(kind.complete_fields(fields), active, actor.cloned());

        match self.store.append(kind, &existing.version, &record) {
            Ok(()) => {
                debug!(
                    kind = kind.name(),
                    entity_id = %record.entity_id,
                    version = %record.version,
                    previous = %record.previous_version,
                    active,
                    "appended version"
                );
                Ok(record)
            }
            Err(err @ StoreError::VersionConflict { .. }) => {
                warn!(kind = kind.name(), entity_id = %existing.entity_id, "{err}");
                Err(err)
            }
            Err(err @ StoreError::Integrity { .. }) => {
                error!(kind = kind.name(), entity_id = %existing.entity_id, "{err}");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn video() -> Kind {
        Kind::new("video").text("title").boolean("deleted")
    }

    fn store() -> VersionedStore<MemoryStore> {
        let store = VersionedStore::new(MemoryStore::new());
        store.backend().ensure_kind(&video()).unwrap();
        store
    }

    fn titled(title: &str) -> Fields {
        Changes::new().set("title", title).fields
    }

    #[test]
    fn create_starts_a_chain() {
        let store = store();
        let actor = crate::chain::new_identity();

        let record = store.create(&video(), titled("A"), Some(&actor)).unwrap();

        assert!(record.is_first_version());
        assert!(record.is_current());
        assert_eq!(record.changed_by_id, Some(actor));
    }

    #[test]
    fn update_merges_fields_and_carries_active() {
        let store = store();
        let first = store
            .create(&video(), Changes::new().set("title", "A").set("deleted", false).fields, None)
            .unwrap();

        let second = store
            .update(&video(), &first, Changes::new().set("title", "B"), None)
            .unwrap();

        assert_eq!(second.previous_version, first.version);
        assert_eq!(second.text("title"), Some("B"));
        assert_eq!(second.boolean("deleted"), Some(false));
        assert!(second.active);
    }

    #[test]
    fn delete_then_undelete() {
        let store = store();
        let first = store.create(&video(), titled("A"), None).unwrap();

        let tombstone = store.delete(&video(), &first, None).unwrap();
        assert!(!tombstone.active);
        assert_eq!(tombstone.text("title"), Some("A"));

        // plain updates keep a deleted entity deleted
        let still_deleted = store
            .update(&video(), &tombstone, titled("B"), None)
            .unwrap();
        assert!(!still_deleted.active);

        let revived = store
            .update(&video(), &still_deleted, Changes::new().active(true), None)
            .unwrap();
        assert!(revived.active);
        assert_eq!(store.backend().row_count(&video()), 4);
    }

    #[test]
    fn stale_record_conflicts() {
        let store = store();
        let first = store.create(&video(), titled("A"), None).unwrap();
        store.update(&video(), &first, titled("B"), None).unwrap();

        let err = store.update(&video(), &first, titled("C"), None).unwrap_err();
        assert!(err.is_conflict());

        let err = store.delete(&video(), &first, None).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn invalid_fields_are_rejected_before_writing() {
        let store = store();
        let first = store.create(&video(), titled("A"), None).unwrap();

        let err = store
            .update(&video(), &first, Changes::new().set("title", 7_i64), None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));

        let err = store
            .create(&video(), Changes::new().set("nope", "x").fields, None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Validation(_)));
        assert_eq!(store.backend().row_count(&video()), 1);
    }
}

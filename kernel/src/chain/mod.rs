// Version Chain Model
//
// Identity and linkage rules for insert-only versioned records.
// Every mutation of an entity produces a new row whose
// `previous_version` points at the row it supersedes; the first row
// points at the empty-version sentinel.
//
// This module is pure: no I/O and no shared state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{Fields, Value};

/// Length of every identifier stored in a chain column.
pub const ID_LEN: usize = 32;

/// `previous_version` of the first row of every entity.
pub const EMPTY_VERSION: &str = "00000000000000000000000000000000";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("malformed identifier {value:?}: expected {ID_LEN} ascii alphanumeric characters")]
    MalformedId { value: String },
}

fn check_id(value: String) -> Result<String, ChainError> {
    if value.len() == ID_LEN && value.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(value)
    } else {
        Err(ChainError::MalformedId { value })
    }
}

/// Stable identifier shared by every version of one logical entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityId(String);

impl EntityId {
    pub fn parse(value: impl Into<String>) -> Result<Self, ChainError> {
        check_id(value.into()).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single row in a version chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionId(String);

impl VersionId {
    pub fn parse(value: impl Into<String>) -> Result<Self, ChainError> {
        check_id(value.into()).map(Self)
    }

    /// The empty-version sentinel.
    pub fn empty() -> Self {
        Self(EMPTY_VERSION.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.0 == EMPTY_VERSION
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityId {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromStr for VersionId {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityId {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl TryFrom<String> for VersionId {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

impl From<VersionId> for String {
    fn from(id: VersionId) -> Self {
        id.0
    }
}

/// Allocate a fresh entity identity.
pub fn new_identity() -> EntityId {
    EntityId(Uuid::new_v4().simple().to_string())
}

/// Allocate a fresh version identifier (random 128-bit).
pub fn new_version() -> VersionId {
    VersionId(Uuid::new_v4().simple().to_string())
}

/// Audit timestamp for a row written now.
///
/// Truncated to microseconds, the precision the backing stores keep.
pub fn audit_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub fn is_first_version(record: &VersionedRecord) -> bool {
    record.previous_version.is_empty()
}

/// One row of a version chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub entity_id: EntityId,
    pub version: VersionId,
    pub previous_version: VersionId,
    pub active: bool,
    pub latest: bool,
    pub changed_by_id: Option<EntityId>,
    pub changed_on: DateTime<Utc>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl VersionedRecord {
    /// First row of a brand new entity.
    pub fn first(fields: Fields, changed_by_id: Option<EntityId>) -> Self {
        Self {
            entity_id: new_identity(),
            version: new_version(),
            previous_version: VersionId::empty(),
            active: true,
            latest: true,
            changed_by_id,
            changed_on: audit_now(),
            fields,
        }
    }

    /// Row that supersedes `self` in the chain.
    ///
    /// `self` is left untouched; flipping its `latest` flag is the
    /// store's job, inside the same unit of work as the insert.
    pub fn successor(&self, fields: Fields, active: bool, changed_by_id: Option<EntityId>) -> Self {
        Self {
            entity_id: self.entity_id.clone(),
            version: new_version(),
            previous_version: self.version.clone(),
            active,
            latest: true,
            changed_by_id,
            changed_on: audit_now(),
            fields,
        }
    }

    pub fn is_first_version(&self) -> bool {
        is_first_version(self)
    }

    /// Latest and active: the entity's present state.
    pub fn is_current(&self) -> bool {
        self.latest && self.active
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, field: &str) -> Option<i64> {
        match self.fields.get(field) {
            Some(Value::Integer(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn boolean(&self, field: &str) -> Option<bool> {
        match self.fields.get(field) {
            Some(Value::Boolean(b)) => Some(*b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(title: &str) -> Fields {
        let mut fields = Fields::new();
        fields.insert("title".into(), Value::Text(title.into()));
        fields
    }

    #[test]
    fn identifiers_are_32_chars_and_distinct() {
        let a = new_identity();
        let b = new_identity();
        assert_eq!(a.as_str().len(), ID_LEN);
        assert_ne!(a, b);

        let v = new_version();
        assert_eq!(v.as_str().len(), ID_LEN);
        assert!(!v.is_empty());
    }

    #[test]
    fn first_row_points_at_sentinel() {
        let record = VersionedRecord::first(fields("A"), None);

        assert!(record.is_first_version());
        assert_eq!(record.previous_version.as_str(), EMPTY_VERSION);
        assert!(record.is_current());
        assert_eq!(record.text("title"), Some("A"));
    }

    #[test]
    fn successor_links_to_predecessor() {
        let first = VersionedRecord::first(fields("A"), None);
        let second = first.successor(fields("B"), true, None);

        assert_eq!(second.entity_id, first.entity_id);
        assert_eq!(second.previous_version, first.version);
        assert_ne!(second.version, first.version);
        assert!(!second.is_first_version());
        assert!(second.latest);
        // predecessor is not rewritten by the pure model
        assert!(first.latest);
    }

    #[test]
    fn malformed_identifiers_are_rejected() {
        assert!(EntityId::parse("short").is_err());
        assert!(VersionId::parse("g".repeat(31) + "-").is_err());
        assert!(VersionId::parse(EMPTY_VERSION).unwrap().is_empty());
    }

    #[test]
    fn record_serializes_fields_inline() {
        let record = VersionedRecord::first(fields("A"), None);
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["title"], "A");
        assert_eq!(json["previous_version"], EMPTY_VERSION);

        let back: VersionedRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}

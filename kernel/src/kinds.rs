// Entity Catalog
//
// Typed models for the kinds the application stores. Each model maps to
// and from the dynamic field map, so the generic store stays untyped
// while callers work with structs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chain::{EntityId, VersionId, VersionedRecord};
use crate::pipeline::VersionedStore;
use crate::schema::{FieldType, Fields, Kind, ValidationError, Value};
use crate::store::{RecordStore, StoreError};

/// A typed model stored as a versioned kind.
pub trait Entity: Sized {
    /// Table name of the kind.
    const KIND: &'static str;

    fn kind() -> Kind;

    fn from_fields(fields: &Fields) -> Result<Self, ValidationError>;

    fn into_fields(self) -> Fields;
}

/// Rust types that can back a declared field.
pub trait FieldValue: Sized {
    const FIELD_TYPE: FieldType;

    fn from_value(value: &Value) -> Option<Self>;

    fn into_value(self) -> Value;
}

impl FieldValue for String {
    const FIELD_TYPE: FieldType = FieldType::Text;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Text(self)
    }
}

impl FieldValue for i64 {
    const FIELD_TYPE: FieldType = FieldType::Integer;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Integer(self)
    }
}

impl FieldValue for bool {
    const FIELD_TYPE: FieldType = FieldType::Boolean;

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    fn into_value(self) -> Value {
        Value::Boolean(self)
    }
}

/// Read one optional field; absent and NULL both read as `None`.
fn read<T: FieldValue>(fields: &Fields, kind: &str, field: &str) -> Result<Option<T>, ValidationError> {
    match fields.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => T::from_value(value)
            .map(Some)
            .ok_or_else(|| ValidationError::TypeMismatch {
                kind: kind.to_string(),
                field: field.to_string(),
                expected: T::FIELD_TYPE,
                found: value.type_name(),
            }),
    }
}

macro_rules! entities {
    ($(
        $(#[$meta:meta])*
        $name:ident => $kind:literal { $($field:ident: $ty:ty),* $(,)? }
    )*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
            pub struct $name {
                $(pub $field: Option<$ty>,)*
            }

            impl Entity for $name {
                const KIND: &'static str = $kind;

                fn kind() -> Kind {
                    Kind::new($kind)
                        $(.field(stringify!($field), <$ty as FieldValue>::FIELD_TYPE))*
                }

                fn from_fields(fields: &Fields) -> Result<Self, ValidationError> {
                    Ok(Self {
                        $($field: read::<$ty>(fields, $kind, stringify!($field))?,)*
                    })
                }

                fn into_fields(self) -> Fields {
                    let mut fields = Fields::new();
                    $(
                        fields.insert(
                            stringify!($field).to_string(),
                            self.$field.map_or(Value::Null, FieldValue::into_value),
                        );
                    )*
                    fields
                }
            }
        )*

        /// Every kind the application declares, in bootstrap order.
        pub fn catalog() -> Vec<Kind> {
            vec![$(<$name as Entity>::kind()),*]
        }
    };
}

entities! {
    /// An uploaded video.
    Video => "video" {
        id: String,
        title: String,
        user_id: String,
        user_tag: String,
        video_path: String,
        deleted: bool,
        original_content: bool,
        update_complete: bool,
    }

    /// A user watched a video.
    View => "view" {
        video_id: String,
        user_id: String,
    }

    /// A user clapped for a video.
    Clap => "clap" {
        video_id: String,
        user_id: String,
    }

    Bookmark => "bookmark" {
        video_id: String,
        user_id: String,
    }

    User => "user" {
        id: String,
        device_id: String,
        nick: String,
        name: String,
        interest: String,
    }
}

/// Look up a catalog kind by table name.
pub fn kind_by_name(name: &str) -> Option<Kind> {
    catalog().into_iter().find(|k| k.name() == name)
}

/// A typed entity together with its chain metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Versioned<E> {
    pub entity_id: EntityId,
    pub version: VersionId,
    pub previous_version: VersionId,
    pub active: bool,
    pub latest: bool,
    pub changed_by_id: Option<EntityId>,
    pub changed_on: DateTime<Utc>,
    #[serde(flatten)]
    pub entity: E,
}

impl<E: Entity> Versioned<E> {
    pub fn from_record(record: VersionedRecord) -> Result<Self, ValidationError> {
        let entity = E::from_fields(&record.fields)?;
        Ok(Self {
            entity_id: record.entity_id,
            version: record.version,
            previous_version: record.previous_version,
            active: record.active,
            latest: record.latest,
            changed_by_id: record.changed_by_id,
            changed_on: record.changed_on,
            entity,
        })
    }
}

impl<S: RecordStore> VersionedStore<S> {
    /// Typed [`create`](Self::create).
    pub fn create_entity<E: Entity>(
        &self,
        entity: E,
        actor: Option<&EntityId>,
    ) -> Result<Versioned<E>, StoreError> {
        let record = self.create(&E::kind(), entity.into_fields(), actor)?;
        Ok(Versioned::from_record(record)?)
    }

    /// Current state of one entity by id.
    pub fn get_entity<E: Entity>(&self, entity_id: &EntityId) -> Result<Option<Versioned<E>>, StoreError> {
        self.get_current(&E::kind(), "entity_id", entity_id.as_str())?
            .map(Versioned::from_record)
            .transpose()
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Condition, ListOptions};
    use crate::store::MemoryStore;

    #[test]
    fn catalog_declares_every_kind() {
        let names: Vec<_> = catalog().iter().map(|k| k.name().to_string()).collect();
        assert_eq!(names, vec!["video", "view", "clap", "bookmark", "user"]);

        for kind in catalog() {
            kind.validate().unwrap();
        }

        let video = Video::kind();
        assert_eq!(video.field_type("update_complete"), Some(FieldType::Boolean));
        assert_eq!(video.field_type("video_path"), Some(FieldType::Text));
        assert!(kind_by_name("clap").is_some());
        assert!(kind_by_name("comment").is_none());
    }

    #[test]
    fn model_round_trips_through_fields() {
        let video = Video {
            title: Some("A".into()),
            deleted: Some(false),
            ..Video::default()
        };

        let fields = video.clone().into_fields();
        assert_eq!(fields.get("user_tag"), Some(&Value::Null));
        assert_eq!(Video::from_fields(&fields).unwrap(), video);
    }

    #[test]
    fn mistyped_field_is_reported() {
        let mut fields = Fields::new();
        fields.insert("deleted".into(), Value::from("yes"));

        let err = Video::from_fields(&fields).unwrap_err();
        assert!(matches!(err, ValidationError::TypeMismatch { field, .. } if field == "deleted"));
    }

    #[test]
    fn typed_store_helpers() {
        let store = VersionedStore::new(MemoryStore::new());
        for kind in catalog() {
            store.backend().ensure_kind(&kind).unwrap();
        }

        let clap = store
            .create_entity(
                Clap {
                    video_id: Some("v1".into()),
                    user_id: Some("u1".into()),
                },
                None,
            )
            .unwrap();
        store
            .create_entity(
                Clap {
                    video_id: Some("v2".into()),
                    user_id: Some("u1".into()),
                },
                None,
            )
            .unwrap();

        let fetched = store.get_entity::<Clap>(&clap.entity_id).unwrap().unwrap();
        assert_eq!(fetched.entity.video_id.as_deref(), Some("v1"));

        let claps: Vec<_> = store
            .list_current(
                &Clap::kind(),
                Condition::eq("user_id", "u1"),
                ListOptions::default().order_by("video_id", true),
            )
            .unwrap()
            .typed::<Clap>()
            .collect::<Result<_, _>>()
            .unwrap();
        let videos: Vec<_> = claps.iter().filter_map(|c| c.entity.video_id.as_deref()).collect();
        assert_eq!(videos, vec!["v2", "v1"]);
    }
}

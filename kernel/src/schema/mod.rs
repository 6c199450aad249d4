// Schema Adapter
//
// Entity kinds are declared once as a name plus a fixed set of typed
// fields. This module validates caller-supplied field values against
// that declaration and maps a kind onto a backing-store table
// definition: the seven version-chain columns plus one column per
// declared field.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chain::{ChainError, EMPTY_VERSION};

pub mod drift;
pub mod policy;

/// Kind-specific field values of one record, keyed by field name.
pub type Fields = BTreeMap<String, Value>;

/// Version-chain columns present in every table, in declaration order.
pub const CHAIN_COLUMNS: [&str; 7] = [
    "entity_id",
    "version",
    "previous_version",
    "active",
    "latest",
    "changed_by_id",
    "changed_on",
];

/// Semantic type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Integer,
    Boolean,
}

impl FieldType {
    /// Column type used in the table definition.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Text => "TEXT",
            FieldType::Integer => "INTEGER",
            FieldType::Boolean => "SMALLINT",
        }
    }

    /// Parse a textual value (CLI input, query strings) as this type.
    pub fn parse(&self, field: &str, raw: &str) -> Result<Value, ValidationError> {
        let unparsable = || ValidationError::UnparsableValue {
            field: field.to_string(),
            raw: raw.to_string(),
            expected: *self,
        };

        if raw == "null" {
            return Ok(Value::Null);
        }

        match self {
            FieldType::Text => Ok(Value::Text(raw.to_string())),
            FieldType::Integer => raw.parse().map(Value::Integer).map_err(|_| unparsable()),
            FieldType::Boolean => match raw {
                "true" | "1" => Ok(Value::Boolean(true)),
                "false" | "0" => Ok(Value::Boolean(false)),
                _ => Err(unparsable()),
            },
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
        };
        f.write_str(name)
    }
}

/// A single field value. `Null` is accepted for every type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Text(String),
}

impl Value {
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(FieldType::Boolean),
            Value::Integer(_) => Some(FieldType::Integer),
            Value::Text(_) => Some(FieldType::Text),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Text(_) => "text",
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Rejected before any write is attempted.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("kind `{kind}` has no field `{field}`")]
    UnknownField { kind: String, field: String },

    #[error("field `{kind}.{field}` expects {expected}, got {found}")]
    TypeMismatch {
        kind: String,
        field: String,
        expected: FieldType,
        found: &'static str,
    },

    #[error("field `{field}` of kind `{kind}` collides with a version-chain column")]
    ReservedField { kind: String, field: String },

    #[error("field `{field}` declared twice on kind `{kind}`")]
    DuplicateField { kind: String, field: String },

    #[error("invalid name {name:?}: use lowercase letters, digits and underscores")]
    InvalidName { name: String },

    #[error("cannot parse {raw:?} as {expected} for field `{field}`")]
    UnparsableValue {
        field: String,
        raw: String,
        expected: FieldType,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Declaration of one kind-specific field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

/// A named entity type with a fixed field schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kind {
    name: String,
    fields: Vec<FieldDef>,
}

impl Kind {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            field_type,
        });
        self
    }

    pub fn text(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Text)
    }

    pub fn integer(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Integer)
    }

    pub fn boolean(self, name: impl Into<String>) -> Self {
        self.field(name, FieldType::Boolean)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.field_type)
    }

    /// Type of a column that may appear in a lookup or condition.
    ///
    /// Identifier chain columns compare as text; `changed_on`,
    /// `active` and `latest` are owned by the store and not filterable.
    pub fn column_type(&self, column: &str) -> Option<FieldType> {
        match column {
            "entity_id" | "version" | "previous_version" | "changed_by_id" => {
                Some(FieldType::Text)
            }
            _ => self.field_type(column),
        }
    }

    /// Check the declaration itself: names, duplicates, reserved columns.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_name(&self.name)?;

        for (i, def) in self.fields.iter().enumerate() {
            check_name(&def.name)?;

            if CHAIN_COLUMNS.contains(&def.name.as_str()) {
                return Err(ValidationError::ReservedField {
                    kind: self.name.clone(),
                    field: def.name.clone(),
                });
            }

            if self.fields[..i].iter().any(|prev| prev.name == def.name) {
                return Err(ValidationError::DuplicateField {
                    kind: self.name.clone(),
                    field: def.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Reject unknown or mistyped values. Missing fields are stored as NULL.
    pub fn validate_fields(&self, fields: &Fields) -> Result<(), ValidationError> {
        for (name, value) in fields {
            let expected = self
                .field_type(name)
                .ok_or_else(|| ValidationError::UnknownField {
                    kind: self.name.clone(),
                    field: name.clone(),
                })?;

            self.check_value(name, expected, value)?;
        }
        Ok(())
    }

    /// Every declared field, with NULL for those not supplied. This is the
    /// map a store writes and reads back.
    pub fn complete_fields(&self, mut fields: Fields) -> Fields {
        for def in &self.fields {
            fields.entry(def.name.clone()).or_insert(Value::Null);
        }
        fields
    }

    /// Check a single value against a lookup column.
    pub fn validate_column(&self, column: &str, value: &Value) -> Result<FieldType, ValidationError> {
        let expected = self
            .column_type(column)
            .ok_or_else(|| ValidationError::UnknownField {
                kind: self.name.clone(),
                field: column.to_string(),
            })?;

        self.check_value(column, expected, value)?;
        Ok(expected)
    }

    fn check_value(&self, name: &str, expected: FieldType, value: &Value) -> Result<(), ValidationError> {
        match value.field_type() {
            None => Ok(()),
            Some(found) if found == expected => Ok(()),
            Some(_) => Err(ValidationError::TypeMismatch {
                kind: self.name.clone(),
                field: name.to_string(),
                expected,
                found: value.type_name(),
            }),
        }
    }
}

fn check_name(name: &str) -> Result<(), ValidationError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {
            chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            name: name.to_string(),
        })
    }
}

/// Quote an identifier for interpolation into SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// One column of a table definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub sql_type: String,
    pub constraint: String,
}

/// Backing-store table for one kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDefinition {
    pub table: String,
    pub columns: Vec<ColumnDef>,
}

impl TableDefinition {
    pub fn for_kind(kind: &Kind) -> Self {
        let chain = [
            ("entity_id", "CHAR(32)", "NOT NULL".to_string()),
            ("version", "CHAR(32)", "NOT NULL".to_string()),
            (
                "previous_version",
                "CHAR(32)",
                format!("DEFAULT '{EMPTY_VERSION}'"),
            ),
            ("active", "BOOLEAN", "DEFAULT 1".to_string()),
            ("latest", "BOOLEAN", "DEFAULT 1".to_string()),
            ("changed_by_id", "CHAR(32)", "NULL".to_string()),
            ("changed_on", "TIMESTAMP", String::new()),
        ];

        let mut columns: Vec<ColumnDef> = chain
            .into_iter()
            .map(|(name, sql_type, constraint)| ColumnDef {
                name: name.to_string(),
                sql_type: sql_type.to_string(),
                constraint,
            })
            .collect();

        columns.extend(kind.fields().iter().map(|def| ColumnDef {
            name: def.name.clone(),
            sql_type: def.field_type.sql_type().to_string(),
            constraint: String::new(),
        }));

        Self {
            table: kind.name().to_string(),
            columns,
        }
    }

    pub fn index_name(&self) -> String {
        format!("{}_latest_ind", self.table)
    }

    pub fn create_table_sql(&self) -> String {
        let mut lines: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let mut line = format!("{} {}", quote_ident(&c.name), c.sql_type);
                if !c.constraint.is_empty() {
                    line.push(' ');
                    line.push_str(&c.constraint);
                }
                line
            })
            .collect();
        lines.push("PRIMARY KEY (\"entity_id\", \"version\")".to_string());

        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(&self.table),
            lines.join(",\n    ")
        )
    }

    pub fn create_index_sql(&self) -> String {
        format!(
            "CREATE INDEX {} ON {} (\"entity_id\", \"latest\", \"active\")",
            quote_ident(&self.index_name()),
            quote_ident(&self.table)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> Kind {
        Kind::new("video")
            .text("title")
            .integer("duration")
            .boolean("deleted")
    }

    #[test]
    fn table_definition_has_chain_columns_then_fields() {
        let def = TableDefinition::for_kind(&video());
        let names: Vec<_> = def.columns.iter().map(|c| c.name.as_str()).collect();

        assert_eq!(&names[..7], &CHAIN_COLUMNS);
        assert_eq!(&names[7..], &["title", "duration", "deleted"]);
        assert_eq!(def.columns[9].sql_type, "SMALLINT");
    }

    #[test]
    fn ddl_declares_primary_key_and_index() {
        let def = TableDefinition::for_kind(&video());
        let sql = def.create_table_sql();

        assert!(sql.starts_with("CREATE TABLE \"video\""));
        assert!(sql.contains("PRIMARY KEY (\"entity_id\", \"version\")"));
        assert!(sql.contains(&format!("DEFAULT '{EMPTY_VERSION}'")));
        assert!(def
            .create_index_sql()
            .contains("\"video_latest_ind\" ON \"video\" (\"entity_id\", \"latest\", \"active\")"));
    }

    #[test]
    fn unknown_and_mistyped_fields_are_rejected() {
        let kind = video();

        let mut fields = Fields::new();
        fields.insert("title".into(), Value::Integer(3));
        assert!(matches!(
            kind.validate_fields(&fields),
            Err(ValidationError::TypeMismatch { .. })
        ));

        let mut fields = Fields::new();
        fields.insert("colour".into(), "red".into());
        assert!(matches!(
            kind.validate_fields(&fields),
            Err(ValidationError::UnknownField { .. })
        ));

        let mut fields = Fields::new();
        fields.insert("title".into(), Value::Null);
        fields.insert("deleted".into(), true.into());
        assert!(kind.validate_fields(&fields).is_ok());
    }

    #[test]
    fn declaration_rejects_reserved_and_duplicate_names() {
        let reserved = Kind::new("video").text("version");
        assert!(matches!(
            reserved.validate(),
            Err(ValidationError::ReservedField { .. })
        ));

        let dup = Kind::new("video").text("title").integer("title");
        assert!(matches!(dup.validate(), Err(ValidationError::DuplicateField { .. })));

        assert!(Kind::new("Video").validate().is_err());
        assert!(video().validate().is_ok());
    }

    #[test]
    fn textual_values_parse_by_declared_type() {
        assert_eq!(FieldType::Integer.parse("n", "42").unwrap(), Value::Integer(42));
        assert_eq!(FieldType::Boolean.parse("b", "true").unwrap(), Value::Boolean(true));
        assert_eq!(FieldType::Text.parse("t", "null").unwrap(), Value::Null);
        assert!(FieldType::Boolean.parse("b", "yes").is_err());
    }

    #[test]
    fn complete_fields_fills_missing_fields_with_null() {
        let mut fields = Fields::new();
        fields.insert("title".into(), "A".into());

        let complete = video().complete_fields(fields);

        assert_eq!(complete.len(), 3);
        assert_eq!(complete["title"], Value::from("A"));
        assert_eq!(complete["duration"], Value::Null);
        assert_eq!(complete["deleted"], Value::Null);
    }

    #[test]
    fn chain_identifiers_are_lookup_columns() {
        let kind = video();
        assert_eq!(kind.column_type("entity_id"), Some(FieldType::Text));
        assert_eq!(kind.column_type("latest"), None);
        assert!(kind.validate_column("duration", &Value::Integer(1)).is_ok());
        assert!(kind.validate_column("changed_on", &Value::Null).is_err());
    }
}

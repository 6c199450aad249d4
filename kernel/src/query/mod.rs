// Query Layer
//
// Typed conditions over declared fields, pagination options, and the
// single-pass cursor handed back by list queries. Reads default to the
// current rows (latest and active); history scopes are explicit.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::iter::FusedIterator;
use std::marker::PhantomData;

use tracing::{debug, error};

use crate::chain::{EntityId, VersionedRecord};
use crate::kinds::{Entity, Versioned};
use crate::pipeline::VersionedStore;
use crate::replay::{replay_chain, summarize, ChainSummary};
use crate::schema::{Kind, ValidationError, Value};
use crate::store::{RecordStore, StoreError};

/// Filter predicate, conjoined with the scope restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    All,
    Eq(String, Value),
    Ne(String, Value),
    Lt(String, Value),
    Gt(String, Value),
    IsNull(String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Eq(column.into(), value.into())
    }

    pub fn ne(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Ne(column.into(), value.into())
    }

    pub fn lt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Lt(column.into(), value.into())
    }

    pub fn gt(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Gt(column.into(), value.into())
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Condition::IsNull(column.into())
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All => other,
            Condition::And(mut parts) => {
                parts.push(other);
                Condition::And(parts)
            }
            this => Condition::And(vec![this, other]),
        }
    }

    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Or(mut parts) => {
                parts.push(other);
                Condition::Or(parts)
            }
            this => Condition::Or(vec![this, other]),
        }
    }

    /// Every referenced column must exist on the kind and every value
    /// must match its declared type.
    pub fn validate(&self, kind: &Kind) -> Result<(), ValidationError> {
        match self {
            Condition::All => Ok(()),
            Condition::Eq(c, v) | Condition::Ne(c, v) | Condition::Lt(c, v) | Condition::Gt(c, v) => {
                kind.validate_column(c, v).map(|_| ())
            }
            Condition::IsNull(c) => kind.validate_column(c, &Value::Null).map(|_| ()),
            Condition::And(parts) | Condition::Or(parts) => {
                parts.iter().try_for_each(|p| p.validate(kind))
            }
        }
    }

    /// Render as a parameterized SQL expression. Values are pushed onto
    /// `params` in placeholder order; column names are quoted.
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        use crate::schema::quote_ident;

        match self {
            Condition::All => "1 = 1".to_string(),
            Condition::Eq(c, Value::Null) | Condition::IsNull(c) => {
                format!("{} IS NULL", quote_ident(c))
            }
            Condition::Ne(c, Value::Null) => format!("{} IS NOT NULL", quote_ident(c)),
            Condition::Eq(c, v) => bind(params, "=", c, v),
            Condition::Ne(c, v) => bind(params, "<>", c, v),
            Condition::Lt(c, v) => bind(params, "<", c, v),
            Condition::Gt(c, v) => bind(params, ">", c, v),
            Condition::And(parts) => join_sql(parts, " AND ", "1 = 1", params),
            Condition::Or(parts) => join_sql(parts, " OR ", "1 = 0", params),
        }
    }

    /// In-process evaluation with the same NULL semantics as the SQL form.
    pub fn matches(&self, record: &VersionedRecord) -> bool {
        match self {
            Condition::All => true,
            Condition::Eq(c, Value::Null) | Condition::IsNull(c) => column_value(record, c).is_null(),
            Condition::Ne(c, Value::Null) => !column_value(record, c).is_null(),
            Condition::Eq(c, v) => compare(&column_value(record, c), v) == Some(Ordering::Equal),
            Condition::Ne(c, v) => matches!(
                compare(&column_value(record, c), v),
                Some(Ordering::Less | Ordering::Greater)
            ),
            Condition::Lt(c, v) => compare(&column_value(record, c), v) == Some(Ordering::Less),
            Condition::Gt(c, v) => compare(&column_value(record, c), v) == Some(Ordering::Greater),
            Condition::And(parts) => parts.iter().all(|p| p.matches(record)),
            Condition::Or(parts) => parts.iter().any(|p| p.matches(record)),
        }
    }
}

fn bind(params: &mut Vec<Value>, op: &str, column: &str, value: &Value) -> String {
    params.push(value.clone());
    format!("{} {} ?", crate::schema::quote_ident(column), op)
}

fn join_sql(parts: &[Condition], sep: &str, empty: &str, params: &mut Vec<Value>) -> String {
    if parts.is_empty() {
        return empty.to_string();
    }
    let rendered: Vec<String> = parts
        .iter()
        .map(|p| format!("({})", p.to_sql(params)))
        .collect();
    rendered.join(sep)
}

/// Value of a filterable column on a record; absent fields read as NULL.
pub fn column_value(record: &VersionedRecord, column: &str) -> Value {
    match column {
        "entity_id" => Value::Text(record.entity_id.to_string()),
        "version" => Value::Text(record.version.to_string()),
        "previous_version" => Value::Text(record.previous_version.to_string()),
        "changed_by_id" => record
            .changed_by_id
            .as_ref()
            .map(|id| Value::Text(id.to_string()))
            .unwrap_or(Value::Null),
        _ => record.fields.get(column).cloned().unwrap_or(Value::Null),
    }
}

/// SQL comparison: NULL compares with nothing, booleans compare as 0/1,
/// integers sort before text.
pub fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    fn rank(v: &Value) -> Option<(u8, i64, &str)> {
        match v {
            Value::Null => None,
            Value::Boolean(b) => Some((0, i64::from(*b), "")),
            Value::Integer(i) => Some((0, *i, "")),
            Value::Text(s) => Some((1, 0, s.as_str())),
        }
    }
    Some(rank(a)?.cmp(&rank(b)?))
}

/// Sort order for NULL-aware sorting (NULL first, as the SQL store does).
pub fn sort_order(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare(a, b).unwrap_or(Ordering::Equal),
    }
}

/// Which rows of each chain a read considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scope {
    /// `latest AND active`: the present state of live entities.
    #[default]
    Current,

    /// `latest`: present state, tombstones included.
    Latest,

    /// Every row ever written.
    History,
}

impl Scope {
    pub fn sql(&self) -> &'static str {
        match self {
            Scope::Current => "\"latest\" = 1 AND \"active\" = 1",
            Scope::Latest => "\"latest\" = 1",
            Scope::History => "1 = 1",
        }
    }

    pub fn admits(&self, record: &VersionedRecord) -> bool {
        match self {
            Scope::Current => record.latest && record.active,
            Scope::Latest => record.latest,
            Scope::History => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// Pagination and ordering. Without `order_by` rows come back in
/// backing-store order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order_by: Option<OrderBy>,
}

impl ListOptions {
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>, descending: bool) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            descending,
        });
        self
    }

    pub fn validate(&self, kind: &Kind) -> Result<(), ValidationError> {
        match &self.order_by {
            Some(order) => kind.validate_column(&order.column, &Value::Null).map(|_| ()),
            None => Ok(()),
        }
    }
}

/// Everything a backend needs to run one read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub scope: Scope,
    pub condition: Condition,
    pub options: ListOptions,
}

impl Default for Condition {
    fn default() -> Self {
        Condition::All
    }
}

/// Single-pass, forward-only sequence of query results.
///
/// The result set is fetched eagerly within the query's unit of work, so
/// the connection is released before the cursor is handed out; only the
/// typed conversion in [`typed`](Self::typed) is lazy. Once exhausted it
/// stays exhausted; querying again requires a new call.
#[derive(Debug)]
pub struct CurrentRows {
    rows: VecDeque<VersionedRecord>,
}

impl CurrentRows {
    pub fn new(rows: Vec<VersionedRecord>) -> Self {
        Self { rows: rows.into() }
    }

    pub fn is_exhausted(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows not yet yielded.
    pub fn remaining(&self) -> usize {
        self.rows.len()
    }

    /// Lazily materialize each row as a typed entity.
    pub fn typed<E: Entity>(self) -> TypedRows<E> {
        TypedRows {
            rows: self,
            _entity: PhantomData,
        }
    }
}

impl Iterator for CurrentRows {
    type Item = VersionedRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.pop_front()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.rows.len(), Some(self.rows.len()))
    }
}

impl ExactSizeIterator for CurrentRows {}
impl FusedIterator for CurrentRows {}

/// Typed view over [`CurrentRows`]; each row is converted when pulled.
#[derive(Debug)]
pub struct TypedRows<E> {
    rows: CurrentRows,
    _entity: PhantomData<E>,
}

impl<E: Entity> Iterator for TypedRows<E> {
    type Item = Result<Versioned<E>, ValidationError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rows.next().map(Versioned::from_record)
    }
}

impl<E: Entity> FusedIterator for TypedRows<E> {}

impl<S: RecordStore> VersionedStore<S> {
    /// The single current row of `kind` where `key = value`.
    ///
    /// `Ok(None)` is the not-found outcome. More than one match means the
    /// single-current invariant is broken; it is logged and surfaced.
    pub fn get_current(
        &self,
        kind: &Kind,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<Option<VersionedRecord>, StoreError> {
        let value = value.into();
        kind.validate_column(key, &value)?;

        let selection = Selection {
            scope: Scope::Current,
            condition: Condition::Eq(key.to_string(), value),
            options: ListOptions::default().limit(2),
        };
        let mut rows = self.backend().select(kind, &selection)?;

        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => {
                let same_entity = rows.windows(2).all(|w| w[0].entity_id == w[1].entity_id);
                error!(
                    kind = kind.name(),
                    key,
                    matches = n,
                    same_entity,
                    "more than one current row matched a single-row lookup"
                );
                Err(StoreError::Integrity {
                    kind: kind.name().to_string(),
                    detail: format!(
                        "{n} current rows match {key} (same entity: {same_entity})"
                    ),
                })
            }
        }
    }

    /// All current rows of `kind` matching `condition`.
    pub fn list_current(
        &self,
        kind: &Kind,
        condition: Condition,
        options: ListOptions,
    ) -> Result<CurrentRows, StoreError> {
        self.list(kind, Scope::Current, condition, options)
    }

    /// Like [`list_current`](Self::list_current) with an explicit scope.
    pub fn list(
        &self,
        kind: &Kind,
        scope: Scope,
        condition: Condition,
        options: ListOptions,
    ) -> Result<CurrentRows, StoreError> {
        condition.validate(kind)?;
        options.validate(kind)?;

        let selection = Selection {
            scope,
            condition,
            options,
        };
        let rows = self.backend().select(kind, &selection)?;
        debug!(kind = kind.name(), rows = rows.len(), ?scope, "list");

        Ok(CurrentRows::new(rows))
    }

    /// Every row of one entity, oldest first, tombstones included.
    pub fn history(&self, kind: &Kind, entity_id: &EntityId) -> Result<Vec<VersionedRecord>, StoreError> {
        let rows = self.backend().rows_of(kind, entity_id)?;
        if rows.is_empty() {
            return Ok(rows);
        }
        Ok(replay_chain(rows, self.invariants())?)
    }

    /// Check the chain invariants of one entity and summarize it.
    pub fn verify(&self, kind: &Kind, entity_id: &EntityId) -> Result<ChainSummary, StoreError> {
        let chain = self.history(kind, entity_id)?;
        summarize(&chain).ok_or_else(|| StoreError::EntityNotFound {
            kind: kind.name().to_string(),
            entity_id: entity_id.clone(),
        })
    }
}

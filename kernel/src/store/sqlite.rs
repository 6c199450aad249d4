// SQLite Record Store
//
// File-backed store. Each operation opens its own connection and drops
// it on every exit path; nothing is held between operations. Mutations
// run in IMMEDIATE transactions, so the compare-and-set of the latest
// row and the insert of its successor happen under the write lock and
// commit or roll back together.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, OpenFlags, TransactionBehavior};
use tracing::{debug, info};

use super::{RecordStore, StoreError};
use crate::chain::{EntityId, VersionId, VersionedRecord};
use crate::config::StoreConfig;
use crate::query::Selection;
use crate::schema::drift::ActualColumn;
use crate::schema::{quote_ident, FieldType, Fields, Kind, TableDefinition, Value};

/// VM instructions between checks of the statement deadline.
const PROGRESS_INTERVAL: i32 = 1_000;

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Boolean(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Integer(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    busy_timeout: Duration,
    statement_timeout: Duration,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and switch it to WAL,
    /// which lets readers proceed while a writer holds the lock.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let store = Self {
            path: config.database_path.clone(),
            busy_timeout: config.busy_timeout(),
            statement_timeout: config.statement_timeout(),
        };

        let mode = store.unit_of_work("open", |conn| {
            Ok(conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?)
        })?;
        info!(path = %store.path.display(), journal_mode = %mode, "sqlite store opened");

        Ok(store)
    }

    /// Open with default timeouts.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open(&StoreConfig {
            database_path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        })
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)?;
        conn.busy_timeout(self.busy_timeout)?;

        let deadline = Instant::now() + self.statement_timeout;
        conn.progress_handler(PROGRESS_INTERVAL, Some(move || Instant::now() >= deadline));

        Ok(conn)
    }

    /// Run `work` on a fresh connection. The connection is dropped when
    /// this returns, whatever the outcome; an uncommitted transaction is
    /// rolled back by that drop.
    fn unit_of_work<T>(
        &self,
        op: &'static str,
        work: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let started = Instant::now();
        let result = self
            .connect()
            .and_then(|mut conn| work(&mut conn))
            .map_err(|err| self.classify(err));

        debug!(
            op,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "sqlite unit of work"
        );
        result
    }

    fn classify(&self, err: StoreError) -> StoreError {
        use rusqlite::Error::SqliteFailure;

        match err {
            StoreError::Sqlite(SqliteFailure(e, _))
                if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
            {
                StoreError::Timeout {
                    budget_ms: self.busy_timeout.as_millis() as u64,
                }
            }
            StoreError::Sqlite(SqliteFailure(e, _)) if e.code == ErrorCode::OperationInterrupted => {
                StoreError::Timeout {
                    budget_ms: self.statement_timeout.as_millis() as u64,
                }
            }
            StoreError::Sqlite(SqliteFailure(_, Some(msg))) if msg.starts_with("no such table: ") => {
                StoreError::UnknownKind(msg["no such table: ".len()..].to_string())
            }
            other => other,
        }
    }
}

fn column_list(def: &TableDefinition) -> String {
    def.columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_sql(def: &TableDefinition) -> String {
    let placeholders = vec!["?"; def.columns.len()].join(", ");
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&def.table),
        column_list(def),
        placeholders
    )
}

fn select_sql(def: &TableDefinition, filter: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {}",
        column_list(def),
        quote_ident(&def.table),
        filter
    )
}

/// Row values in table-definition order.
fn row_params(kind: &Kind, record: &VersionedRecord) -> Vec<Value> {
    let mut params = vec![
        Value::Text(record.entity_id.to_string()),
        Value::Text(record.version.to_string()),
        Value::Text(record.previous_version.to_string()),
        Value::Boolean(record.active),
        Value::Boolean(record.latest),
        record
            .changed_by_id
            .as_ref()
            .map(|id| Value::Text(id.to_string()))
            .unwrap_or(Value::Null),
        Value::Text(record.changed_on.to_rfc3339_opts(SecondsFormat::Micros, true)),
    ];
    params.extend(
        kind.fields()
            .iter()
            .map(|def| record.fields.get(&def.name).cloned().unwrap_or(Value::Null)),
    );
    params
}

fn query_rows(
    conn: &Connection,
    kind: &Kind,
    sql: &str,
    params: &[Value],
) -> Result<Vec<VersionedRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();

    let raw = stmt
        .query_map(params_from_iter(params.iter()), |row| {
            (0..width)
                .map(|i| row.get::<_, SqlValue>(i))
                .collect::<rusqlite::Result<Vec<_>>>()
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter().map(|row| decode(kind, row)).collect()
}

fn decode(kind: &Kind, row: Vec<SqlValue>) -> Result<VersionedRecord, StoreError> {
    decode_row(kind, row).map_err(|detail| StoreError::Integrity {
        kind: kind.name().to_string(),
        detail,
    })
}

fn decode_row(kind: &Kind, row: Vec<SqlValue>) -> Result<VersionedRecord, String> {
    let mut values = row.into_iter();
    let mut next = |column: &str| values.next().ok_or_else(|| format!("row has no `{column}` column"));

    let entity_id = EntityId::parse(required_text("entity_id", next("entity_id")?)?)
        .map_err(|e| e.to_string())?;
    let version =
        VersionId::parse(required_text("version", next("version")?)?).map_err(|e| e.to_string())?;
    let previous_version = VersionId::parse(required_text("previous_version", next("previous_version")?)?)
        .map_err(|e| e.to_string())?;
    let active = flag("active", next("active")?)?;
    let latest = flag("latest", next("latest")?)?;
    let changed_by_id = match next("changed_by_id")? {
        SqlValue::Null => None,
        other => Some(
            EntityId::parse(required_text("changed_by_id", other)?).map_err(|e| e.to_string())?,
        ),
    };
    let changed_on = required_text("changed_on", next("changed_on")?)?;
    let changed_on = DateTime::parse_from_rfc3339(&changed_on)
        .map_err(|e| format!("changed_on {changed_on:?}: {e}"))?
        .with_timezone(&Utc);

    let mut fields = Fields::new();
    for def in kind.fields() {
        let value = field_value(&def.name, def.field_type, next(&def.name)?)?;
        fields.insert(def.name.clone(), value);
    }

    Ok(VersionedRecord {
        entity_id,
        version,
        previous_version,
        active,
        latest,
        changed_by_id,
        changed_on,
        fields,
    })
}

fn required_text(column: &str, value: SqlValue) -> Result<String, String> {
    match value {
        SqlValue::Text(s) => Ok(s),
        other => Err(format!("`{column}` holds {}, expected text", other.data_type())),
    }
}

fn flag(column: &str, value: SqlValue) -> Result<bool, String> {
    match value {
        SqlValue::Integer(i) => Ok(i != 0),
        other => Err(format!("`{column}` holds {}, expected 0/1", other.data_type())),
    }
}

fn field_value(column: &str, field_type: FieldType, value: SqlValue) -> Result<Value, String> {
    match (field_type, value) {
        (_, SqlValue::Null) => Ok(Value::Null),
        (FieldType::Text, SqlValue::Text(s)) => Ok(Value::Text(s)),
        (FieldType::Integer, SqlValue::Integer(i)) => Ok(Value::Integer(i)),
        (FieldType::Boolean, SqlValue::Integer(i)) => Ok(Value::Boolean(i != 0)),
        (expected, other) => Err(format!(
            "`{column}` holds {}, expected {expected}",
            other.data_type()
        )),
    }
}

impl RecordStore for SqliteStore {
    fn ensure_kind(&self, kind: &Kind) -> Result<bool, StoreError> {
        kind.validate()?;
        let def = TableDefinition::for_kind(kind);

        let created = self.unit_of_work("ensure_kind", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&def.table],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Ok(false);
            }

            tx.execute_batch(&format!(
                "{};\n{};",
                def.create_table_sql(),
                def.create_index_sql()
            ))?;
            tx.commit()?;
            Ok(true)
        })?;

        if created {
            info!(kind = kind.name(), columns = def.columns.len(), "created table");
        }
        Ok(created)
    }

    fn describe(&self, kind: &Kind) -> Result<Option<Vec<ActualColumn>>, StoreError> {
        self.unit_of_work("describe", |conn| {
            let mut stmt = conn.prepare("SELECT name, type FROM pragma_table_info(?1)")?;
            let columns = stmt
                .query_map([kind.name()], |row| {
                    Ok(ActualColumn {
                        name: row.get(0)?,
                        sql_type: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(if columns.is_empty() { None } else { Some(columns) })
        })
    }

    fn insert_first(&self, kind: &Kind, record: &VersionedRecord) -> Result<(), StoreError> {
        let def = TableDefinition::for_kind(kind);
        let params = row_params(kind, record);

        self.unit_of_work("insert_first", |conn| {
            match conn.execute(&insert_sql(&def), params_from_iter(params.iter())) {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    Err(StoreError::Duplicate {
                        kind: kind.name().to_string(),
                        entity_id: record.entity_id.clone(),
                        version: record.version.clone(),
                    })
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    fn append(
        &self,
        kind: &Kind,
        expected: &VersionId,
        record: &VersionedRecord,
    ) -> Result<(), StoreError> {
        let def = TableDefinition::for_kind(kind);
        let table = quote_ident(&def.table);
        let params = row_params(kind, record);
        let entity_id = record.entity_id.as_str();

        self.unit_of_work("append", |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let latest: Vec<String> = {
                let mut stmt = tx.prepare(&format!(
                    "SELECT \"version\" FROM {table} WHERE \"entity_id\" = ?1 AND \"latest\" = 1"
                ))?;
                let rows = stmt
                    .query_map([entity_id], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };

            match latest.as_slice() {
                [] => {
                    return Err(StoreError::EntityNotFound {
                        kind: kind.name().to_string(),
                        entity_id: record.entity_id.clone(),
                    })
                }
                [current] if current == expected.as_str() => {}
                [current] => {
                    return Err(StoreError::VersionConflict {
                        kind: kind.name().to_string(),
                        entity_id: record.entity_id.clone(),
                        expected: expected.clone(),
                        actual: VersionId::parse(current.as_str()).map_err(|e| {
                            StoreError::Integrity {
                                kind: kind.name().to_string(),
                                detail: e.to_string(),
                            }
                        })?,
                    })
                }
                many => {
                    return Err(StoreError::Integrity {
                        kind: kind.name().to_string(),
                        detail: format!("{} latest rows for entity {entity_id}", many.len()),
                    })
                }
            }

            let flipped = tx.execute(
                &format!(
                    "UPDATE {table} SET \"latest\" = 0 \
                     WHERE \"entity_id\" = ?1 AND \"version\" = ?2 AND \"latest\" = 1"
                ),
                [entity_id, expected.as_str()],
            )?;
            if flipped != 1 {
                return Err(StoreError::Integrity {
                    kind: kind.name().to_string(),
                    detail: format!("latest flip touched {flipped} rows for entity {entity_id}"),
                });
            }

            tx.execute(&insert_sql(&def), params_from_iter(params.iter()))?;
            tx.commit()?;
            Ok(())
        })
    }

    fn select(&self, kind: &Kind, selection: &Selection) -> Result<Vec<VersionedRecord>, StoreError> {
        let def = TableDefinition::for_kind(kind);
        let mut params = Vec::new();
        let condition = selection.condition.to_sql(&mut params);
        let mut sql = select_sql(&def, &format!("{} AND ({})", selection.scope.sql(), condition));

        let options = &selection.options;
        if let Some(order) = &options.order_by {
            let direction = if order.descending { "DESC" } else { "ASC" };
            sql.push_str(&format!(" ORDER BY {} {}", quote_ident(&order.column), direction));
        }
        match (options.limit, options.offset) {
            (Some(limit), _) => {
                sql.push_str(" LIMIT ?");
                params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
            }
            (None, Some(_)) => sql.push_str(" LIMIT -1"),
            (None, None) => {}
        }
        if let Some(offset) = options.offset {
            sql.push_str(" OFFSET ?");
            params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        }

        self.unit_of_work("select", |conn| query_rows(conn, kind, &sql, &params))
    }

    fn rows_of(&self, kind: &Kind, entity_id: &EntityId) -> Result<Vec<VersionedRecord>, StoreError> {
        let def = TableDefinition::for_kind(kind);
        let sql = select_sql(&def, "\"entity_id\" = ?");
        let params = [Value::Text(entity_id.to_string())];

        self.unit_of_work("rows_of", |conn| query_rows(conn, kind, &sql, &params))
    }
}

// In-Memory Record Store
//
// Process-local store with the same contract as the SQLite store. One
// lock guards all tables, so every append is trivially atomic.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

use super::{RecordStore, StoreError};
use crate::chain::{EntityId, VersionId, VersionedRecord};
use crate::query::{column_value, sort_order, Selection};
use crate::schema::drift::ActualColumn;
use crate::schema::{Kind, TableDefinition};

#[derive(Debug)]
struct Table {
    columns: Vec<ActualColumn>,
    rows: Vec<VersionedRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows ever written for `kind`, history included.
    pub fn row_count(&self, kind: &Kind) -> usize {
        self.tables
            .read()
            .get(kind.name())
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

fn unknown(kind: &Kind) -> StoreError {
    StoreError::UnknownKind(kind.name().to_string())
}

impl RecordStore for MemoryStore {
    fn ensure_kind(&self, kind: &Kind) -> Result<bool, StoreError> {
        kind.validate()?;

        let mut tables = self.tables.write();
        if tables.contains_key(kind.name()) {
            return Ok(false);
        }

        let columns = TableDefinition::for_kind(kind)
            .columns
            .into_iter()
            .map(|c| ActualColumn {
                name: c.name,
                sql_type: c.sql_type,
            })
            .collect();
        tables.insert(
            kind.name().to_string(),
            Table {
                columns,
                rows: Vec::new(),
            },
        );

        info!(kind = kind.name(), "created in-memory table");
        Ok(true)
    }

    fn describe(&self, kind: &Kind) -> Result<Option<Vec<ActualColumn>>, StoreError> {
        Ok(self
            .tables
            .read()
            .get(kind.name())
            .map(|t| t.columns.clone()))
    }

    fn insert_first(&self, kind: &Kind, record: &VersionedRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let table = tables.get_mut(kind.name()).ok_or_else(|| unknown(kind))?;

        if table
            .rows
            .iter()
            .any(|r| r.entity_id == record.entity_id && r.version == record.version)
        {
            return Err(StoreError::Duplicate {
                kind: kind.name().to_string(),
                entity_id: record.entity_id.clone(),
                version: record.version.clone(),
            });
        }

        table.rows.push(record.clone());
        Ok(())
    }

    fn append(
        &self,
        kind: &Kind,
        expected: &VersionId,
        record: &VersionedRecord,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        let table = tables.get_mut(kind.name()).ok_or_else(|| unknown(kind))?;

        let latest: Vec<usize> = table
            .rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.entity_id == record.entity_id && r.latest)
            .map(|(i, _)| i)
            .collect();

        let index = match latest.as_slice() {
            [] => {
                return Err(StoreError::EntityNotFound {
                    kind: kind.name().to_string(),
                    entity_id: record.entity_id.clone(),
                })
            }
            [i] if &table.rows[*i].version == expected => *i,
            [i] => {
                return Err(StoreError::VersionConflict {
                    kind: kind.name().to_string(),
                    entity_id: record.entity_id.clone(),
                    expected: expected.clone(),
                    actual: table.rows[*i].version.clone(),
                })
            }
            many => {
                return Err(StoreError::Integrity {
                    kind: kind.name().to_string(),
                    detail: format!(
                        "{} latest rows for entity {}",
                        many.len(),
                        record.entity_id
                    ),
                })
            }
        };

        table.rows[index].latest = false;
        table.rows.push(record.clone());
        Ok(())
    }

    fn select(&self, kind: &Kind, selection: &Selection) -> Result<Vec<VersionedRecord>, StoreError> {
        let tables = self.tables.read();
        let table = tables.get(kind.name()).ok_or_else(|| unknown(kind))?;

        let mut rows: Vec<VersionedRecord> = table
            .rows
            .iter()
            .filter(|r| selection.scope.admits(r) && selection.condition.matches(r))
            .cloned()
            .collect();

        let options = &selection.options;
        if let Some(order) = &options.order_by {
            rows.sort_by(|a, b| {
                let ordering = sort_order(
                    &column_value(a, &order.column),
                    &column_value(b, &order.column),
                );
                if order.descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
        }

        let offset = options.offset.unwrap_or(0) as usize;
        let limit = options.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    fn rows_of(&self, kind: &Kind, entity_id: &EntityId) -> Result<Vec<VersionedRecord>, StoreError> {
        let tables = self.tables.read();
        let table = tables.get(kind.name()).ok_or_else(|| unknown(kind))?;

        Ok(table
            .rows
            .iter()
            .filter(|r| &r.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

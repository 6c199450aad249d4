// Schema Drift Detection
//
// Compares a kind's declaration with the columns of the table that
// already exists for it. Existing tables are never altered, so drift
// is only reported and classified by severity.

use serde::{Deserialize, Serialize};

use crate::schema::{Kind, TableDefinition};

/// Severity of detected drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftSeverity {
    /// The table has more than the code declares; reads and writes still work.
    Info,

    /// A column exists with a different type than declared.
    Warning,

    /// A declared column is missing; writes to this kind will fail.
    Critical,
}

impl DriftSeverity {
    fn rank(&self) -> u8 {
        match self {
            DriftSeverity::Info => 0,
            DriftSeverity::Warning => 1,
            DriftSeverity::Critical => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftType {
    MissingColumn,
    TypeMismatch,
    UndeclaredColumn,
}

/// A column as reported by the backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActualColumn {
    pub name: String,
    pub sql_type: String,
}

/// A single drift finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftFinding {
    pub table: String,
    pub column: String,
    pub drift_type: DriftType,
    pub severity: DriftSeverity,
    pub message: String,
}

/// Full drift report for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub findings: Vec<DriftFinding>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn highest_severity(&self) -> Option<DriftSeverity> {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max_by_key(|s| s.rank())
    }
}

/// Detect and classify drift between the declared kind and the actual table.
pub fn detect_drift(kind: &Kind, actual: &[ActualColumn]) -> DriftReport {
    let expected = TableDefinition::for_kind(kind);
    let mut findings = Vec::new();

    for column in &expected.columns {
        match actual.iter().find(|a| a.name == column.name) {
            None => findings.push(DriftFinding {
                table: expected.table.clone(),
                column: column.name.clone(),
                drift_type: DriftType::MissingColumn,
                severity: DriftSeverity::Critical,
                message: format!("declared column `{}` does not exist", column.name),
            }),
            Some(found) if !found.sql_type.eq_ignore_ascii_case(&column.sql_type) => {
                findings.push(DriftFinding {
                    table: expected.table.clone(),
                    column: column.name.clone(),
                    drift_type: DriftType::TypeMismatch,
                    severity: DriftSeverity::Warning,
                    message: format!(
                        "column `{}` is {} but {} is declared",
                        column.name, found.sql_type, column.sql_type
                    ),
                })
            }
            Some(_) => {}
        }
    }

    for column in actual {
        if !expected.columns.iter().any(|c| c.name == column.name) {
            findings.push(DriftFinding {
                table: expected.table.clone(),
                column: column.name.clone(),
                drift_type: DriftType::UndeclaredColumn,
                severity: DriftSeverity::Info,
                message: format!("column `{}` is not declared on the kind", column.name),
            });
        }
    }

    DriftReport { findings }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns_of(kind: &Kind) -> Vec<ActualColumn> {
        TableDefinition::for_kind(kind)
            .columns
            .into_iter()
            .map(|c| ActualColumn {
                name: c.name,
                sql_type: c.sql_type,
            })
            .collect()
    }

    #[test]
    fn matching_table_is_clean() {
        let kind = Kind::new("clap").text("video_id").text("user_id");
        let report = detect_drift(&kind, &columns_of(&kind));
        assert!(report.is_clean());
        assert!(report.highest_severity().is_none());
    }

    #[test]
    fn missing_column_is_critical() {
        let old = Kind::new("video").text("title");
        let new = Kind::new("video").text("title").text("user_tag");

        let report = detect_drift(&new, &columns_of(&old));
        assert_eq!(report.findings.len(), 1);
        assert_eq!(report.findings[0].drift_type, DriftType::MissingColumn);
        assert_eq!(report.highest_severity(), Some(DriftSeverity::Critical));
    }

    #[test]
    fn extra_and_retyped_columns_are_classified() {
        let old = Kind::new("video").text("title").integer("deleted").text("legacy");
        let new = Kind::new("video").text("title").boolean("deleted");

        let report = detect_drift(&new, &columns_of(&old));
        let types: Vec<_> = report.findings.iter().map(|f| &f.drift_type).collect();

        assert_eq!(types, vec![&DriftType::TypeMismatch, &DriftType::UndeclaredColumn]);
        assert_eq!(report.highest_severity(), Some(DriftSeverity::Warning));
    }
}

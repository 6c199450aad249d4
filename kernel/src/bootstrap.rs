// Startup Bootstrap
//
// Runs once per process before any mutation:
// describe → create missing tables → drift → policy → decision plan
//
// Existing tables are never altered. Drift is only reported, and the
// policy decides whether startup may continue.

use serde::Serialize;
use tracing::{info, warn};

use crate::schema::drift::{detect_drift, DriftReport};
use crate::schema::policy::{evaluate_drift_policy, DecisionPlan, DriftAction, DriftPolicy};
use crate::schema::Kind;
use crate::store::{RecordStore, StoreError};

/// What bootstrap did, per kind.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    /// Kinds whose tables were created by this run.
    pub created: Vec<String>,

    /// Kinds whose tables already existed.
    pub existing: Vec<String>,

    pub drift: Vec<DriftReport>,
    pub decision_plan: DecisionPlan,
}

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("store error during bootstrap: {0}")]
    Store(#[from] StoreError),

    #[error("schema drift aborted startup: {}", .reasons.join("; "))]
    Aborted {
        reasons: Vec<String>,
        report: Box<BootstrapReport>,
    },
}

/// Make every kind's table available, checking existing ones for drift.
pub fn bootstrap<S: RecordStore>(
    store: &S,
    kinds: &[Kind],
    policy: &DriftPolicy,
) -> Result<BootstrapReport, BootstrapError> {
    let mut report = BootstrapReport::default();

    for kind in kinds {
        kind.validate().map_err(StoreError::from)?;

        match store.describe(kind)? {
            None => {
                // a concurrent bootstrap may win the race; that is fine
                if store.ensure_kind(kind)? {
                    report.created.push(kind.name().to_string());
                } else {
                    report.existing.push(kind.name().to_string());
                }
            }
            Some(columns) => {
                report.existing.push(kind.name().to_string());

                let drift = detect_drift(kind, &columns);
                if drift.is_clean() {
                    continue;
                }

                let plan = evaluate_drift_policy(&drift, policy);
                for decision in &plan.decisions {
                    let finding = &decision.finding;
                    match decision.action {
                        DriftAction::Proceed => info!(
                            table = %finding.table,
                            column = %finding.column,
                            reason = %decision.reason,
                            "{}",
                            finding.message
                        ),
                        DriftAction::Warn | DriftAction::Abort => warn!(
                            table = %finding.table,
                            column = %finding.column,
                            action = ?decision.action,
                            reason = %decision.reason,
                            "{}",
                            finding.message
                        ),
                    }
                }

                report.drift.push(drift);
                report.decision_plan.extend(plan);
            }
        }
    }

    let reasons: Vec<String> = report
        .decision_plan
        .aborts()
        .map(|d| format!("{}.{}: {}", d.finding.table, d.finding.column, d.finding.message))
        .collect();
    if !reasons.is_empty() {
        return Err(BootstrapError::Aborted {
            reasons,
            report: Box::new(report),
        });
    }

    info!(
        created = report.created.len(),
        existing = report.existing.len(),
        "bootstrap complete"
    );
    Ok(report)
}

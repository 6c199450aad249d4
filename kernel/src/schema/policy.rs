// Drift Policy
//
// Maps drift severity to what bootstrap does about it. Tables are never
// altered; the only choices are to carry on, carry on loudly, or refuse
// to start.

use serde::{Deserialize, Serialize};

use crate::schema::drift::{DriftFinding, DriftReport, DriftSeverity};

/// What bootstrap does for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriftAction {
    /// Log at info level and continue.
    Proceed,

    /// Log at warn level and continue.
    Warn,

    /// Abort startup.
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftRule {
    pub severity: DriftSeverity,
    pub action: DriftAction,
    pub reason: String,
}

/// Policy configuration, part of the store config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftPolicy {
    pub rules: Vec<DriftRule>,
}

impl Default for DriftPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl DriftPolicy {
    /// Built-in policy, used when the config names none.
    pub fn default_policy() -> Self {
        Self {
            rules: vec![
                DriftRule {
                    severity: DriftSeverity::Info,
                    action: DriftAction::Proceed,
                    reason: "undeclared columns are ignored".into(),
                },
                DriftRule {
                    severity: DriftSeverity::Warning,
                    action: DriftAction::Warn,
                    reason: "column type differs from declaration".into(),
                },
                DriftRule {
                    severity: DriftSeverity::Critical,
                    action: DriftAction::Abort,
                    reason: "declared column missing, writes would fail".into(),
                },
            ],
        }
    }

    /// First matching rule wins; unmatched severities warn.
    fn rule_for(&self, severity: DriftSeverity) -> (DriftAction, String) {
        self.rules
            .iter()
            .find(|r| r.severity == severity)
            .map(|r| (r.action, r.reason.clone()))
            .unwrap_or((DriftAction::Warn, "no rule for severity".into()))
    }
}

/// A single policy decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftDecision {
    pub finding: DriftFinding,
    pub action: DriftAction,
    pub reason: String,
}

/// Output of policy evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DecisionPlan {
    pub decisions: Vec<DriftDecision>,
}

impl DecisionPlan {
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    pub fn aborts(&self) -> impl Iterator<Item = &DriftDecision> {
        self.decisions
            .iter()
            .filter(|d| d.action == DriftAction::Abort)
    }

    pub fn extend(&mut self, other: DecisionPlan) {
        self.decisions.extend(other.decisions);
    }
}

pub fn evaluate_drift_policy(report: &DriftReport, policy: &DriftPolicy) -> DecisionPlan {
    let decisions = report
        .findings
        .iter()
        .map(|finding| {
            let (action, reason) = policy.rule_for(finding.severity);
            DriftDecision {
                finding: finding.clone(),
                action,
                reason,
            }
        })
        .collect();

    DecisionPlan { decisions }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::drift::DriftType;

    fn finding(severity: DriftSeverity) -> DriftFinding {
        DriftFinding {
            table: "video".into(),
            column: "title".into(),
            drift_type: DriftType::MissingColumn,
            severity,
            message: "test".into(),
        }
    }

    #[test]
    fn default_policy_maps_severity_to_action() {
        let report = DriftReport {
            findings: vec![
                finding(DriftSeverity::Info),
                finding(DriftSeverity::Warning),
                finding(DriftSeverity::Critical),
            ],
        };

        let plan = evaluate_drift_policy(&report, &DriftPolicy::default_policy());
        let actions: Vec<_> = plan.decisions.iter().map(|d| d.action).collect();

        assert_eq!(
            actions,
            vec![DriftAction::Proceed, DriftAction::Warn, DriftAction::Abort]
        );
        assert_eq!(plan.aborts().count(), 1);
    }

    #[test]
    fn policy_loads_from_json() {
        let json = r#"{ "rules": [
            { "severity": "critical", "action": "warn", "reason": "tolerate during rollout" }
        ] }"#;
        let policy: DriftPolicy = serde_json::from_str(json).unwrap();

        let report = DriftReport {
            findings: vec![finding(DriftSeverity::Critical)],
        };
        let plan = evaluate_drift_policy(&report, &policy);

        assert_eq!(plan.aborts().count(), 0);
        assert_eq!(plan.decisions[0].reason, "tolerate during rollout");
    }

    #[test]
    fn empty_report_produces_empty_plan() {
        let report = DriftReport { findings: vec![] };
        let plan = evaluate_drift_policy(&report, &DriftPolicy::default());
        assert!(plan.is_empty());
    }
}

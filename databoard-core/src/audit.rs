//! Audit trail and final data quality report.
//!
//! The executor appends one [`OperationRecord`] per completed rule to an
//! [`AuditTrail`]; once every rule has finished (or been skipped) the trail is
//! sealed into an [`AuditReport`] together with the final collection counts,
//! the post-run integrity check and the data quality metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::store::{EntityStore, Predicate};
use crate::{ReconcileError, Result};

/// Outcome state of a rule within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuleState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl RuleState {
    /// Returns true once the rule can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuleState::Succeeded | RuleState::Failed | RuleState::Skipped
        )
    }
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleState::Pending => write!(f, "pending"),
            RuleState::Running => write!(f, "running"),
            RuleState::Succeeded => write!(f, "succeeded"),
            RuleState::Failed => write!(f, "failed"),
            RuleState::Skipped => write!(f, "skipped"),
        }
    }
}

/// One entry of the state-transition journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub rule_id: String,
    pub from: RuleState,
    pub to: RuleState,
}

/// Before/after record of one completed rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    /// Human readable operation name
    pub operation: String,
    pub rule_id: String,
    /// Target collection
    pub collection: String,
    pub before: u64,
    pub after: u64,
    pub removed: u64,
    /// Percentage of `before` removed, rounded to 2 decimals
    pub removal_rate: f64,
    pub justification: String,
    pub timestamp: DateTime<Utc>,
    /// Wall time spent in the rule, including its counts
    pub duration_ms: u64,
}

impl OperationRecord {
    /// Builds a record from executor counts.
    ///
    /// `after` is never greater than `before` for a completed rule; the
    /// executor fails such rules before recording them.
    pub fn new(
        operation: impl Into<String>,
        rule_id: impl Into<String>,
        collection: impl Into<String>,
        before: u64,
        after: u64,
        justification: impl Into<String>,
    ) -> Self {
        let removed = before.saturating_sub(after);
        Self {
            operation: operation.into(),
            rule_id: rule_id.into(),
            collection: collection.into(),
            before,
            after,
            removed,
            removal_rate: removal_rate(before, removed),
            justification: justification.into(),
            timestamp: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Builder method to set the measured duration.
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Percentage of `before` that was removed, rounded to 2 decimals.
pub fn removal_rate(before: u64, removed: u64) -> f64 {
    percentage(removed, before)
}

/// `part / whole` as a percentage rounded to 2 decimals; 0 for an empty whole.
pub fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    let rate = part as f64 / whole as f64 * 100.0;
    (rate * 100.0).round() / 100.0
}

/// Share of a collection's records that satisfy a predicate after the run
#[derive(Debug, Clone, PartialEq)]
pub struct QualityMetric {
    pub name: String,
    pub collection: String,
    pub satisfied: Predicate,
}

impl QualityMetric {
    pub fn new(
        name: impl Into<String>,
        collection: impl Into<String>,
        satisfied: Predicate,
    ) -> Self {
        Self {
            name: name.into(),
            collection: collection.into(),
            satisfied,
        }
    }

    /// Checks the collection and predicate against the store's schemas.
    pub fn validate(&self, store: &dyn EntityStore) -> Result<()> {
        store.validate_predicate(&self.collection, &self.satisfied)
    }

    /// Percentage of records satisfying the predicate, rounded to 2 decimals.
    pub async fn measure(&self, store: &dyn EntityStore) -> Result<f64> {
        let total = store.count(&self.collection, None).await?;
        let satisfied = store
            .count(&self.collection, Some(&self.satisfied))
            .await?;
        Ok(percentage(satisfied, total))
    }
}

/// Residual dangling references for one foreign key relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub relation: String,
    pub child: String,
    pub parent: String,
    pub field: String,
    pub count: u64,
}

/// Residual duplicate primary keys in one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyViolation {
    pub collection: String,
    pub count: u64,
}

/// Residual out-of-bound values for one bounds rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundViolation {
    pub rule_id: String,
    pub collection: String,
    pub field: String,
    pub count: u64,
}

/// A rule that ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRule {
    pub rule_id: String,
    pub error: String,
}

/// A rule that ended in `Skipped`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRule {
    pub rule_id: String,
    pub reason: String,
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Succeeded,
    PartiallyFailed,
    Failed,
}

impl RunStatus {
    /// `Failed` if anything failed, `PartiallyFailed` if anything was
    /// skipped, otherwise `Succeeded`.
    pub fn from_counts(failed: usize, skipped: usize) -> Self {
        if failed > 0 {
            RunStatus::Failed
        } else if skipped > 0 {
            RunStatus::PartiallyFailed
        } else {
            RunStatus::Succeeded
        }
    }
}

/// Post-run integrity findings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityFindings {
    pub relations: Vec<IntegrityViolation>,
    pub keys: Vec<KeyViolation>,
    pub bounds: Vec<BoundViolation>,
}

/// Append-only log of a run in progress
#[derive(Debug, Clone)]
pub struct AuditTrail {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    operations: Vec<OperationRecord>,
    transitions: Vec<StateTransition>,
    failed: Vec<FailedRule>,
    skipped: Vec<SkippedRule>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    /// Starts a new trail with a fresh run id.
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            operations: Vec::new(),
            transitions: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }

    /// Run id shared by every record of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Appends a completed operation.
    pub fn record(&mut self, operation: OperationRecord) {
        self.operations.push(operation);
    }

    /// Journals a rule state change.
    pub fn transition(&mut self, rule_id: &str, from: RuleState, to: RuleState) {
        self.transitions.push(StateTransition {
            rule_id: rule_id.to_string(),
            from,
            to,
        });
    }

    /// Records a failed rule.
    pub fn fail(&mut self, rule_id: &str, error: impl std::fmt::Display) {
        self.failed.push(FailedRule {
            rule_id: rule_id.to_string(),
            error: error.to_string(),
        });
    }

    /// Records a skipped rule.
    pub fn skip(&mut self, rule_id: &str, reason: impl Into<String>) {
        self.skipped.push(SkippedRule {
            rule_id: rule_id.to_string(),
            reason: reason.into(),
        });
    }

    /// Seals the trail into a report.
    pub fn finish(
        self,
        final_counts: BTreeMap<String, u64>,
        integrity: IntegrityFindings,
        data_quality_metrics: BTreeMap<String, f64>,
        integrity_error: Option<String>,
    ) -> AuditReport {
        let mut failed_rules = self.failed;
        let mut status = RunStatus::from_counts(failed_rules.len(), self.skipped.len());
        if integrity_error.is_some() {
            status = RunStatus::Failed;
        }
        failed_rules.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));

        AuditReport {
            run_id: self.run_id,
            run_timestamp: self.started_at,
            finished_at: Utc::now(),
            total_removed: self.operations.iter().map(|op| op.removed).sum(),
            operations: self.operations,
            final_counts,
            integrity_violations: integrity.relations,
            key_violations: integrity.keys,
            bound_violations: integrity.bounds,
            data_quality_metrics,
            integrity_error,
            status,
            failed_rule_ids: failed_rules.iter().map(|f| f.rule_id.clone()).collect(),
            failed_rules,
            skipped_rules: self.skipped,
            transitions: self.transitions,
        }
    }
}

/// Final data quality report of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub operations: Vec<OperationRecord>,
    pub final_counts: BTreeMap<String, u64>,
    pub total_removed: u64,
    pub integrity_violations: Vec<IntegrityViolation>,
    pub key_violations: Vec<KeyViolation>,
    pub bound_violations: Vec<BoundViolation>,
    /// Post-run metric percentages by name
    pub data_quality_metrics: BTreeMap<String, f64>,
    /// Set when the post-run integrity check itself could not complete
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_error: Option<String>,
    pub status: RunStatus,
    pub failed_rule_ids: Vec<String>,
    pub failed_rules: Vec<FailedRule>,
    pub skipped_rules: Vec<SkippedRule>,
    pub transitions: Vec<StateTransition>,
}

impl AuditReport {
    /// Sum of residual integrity, key and bound violations.
    pub fn residual_violations(&self) -> u64 {
        self.integrity_violations.iter().map(|v| v.count).sum::<u64>()
            + self.key_violations.iter().map(|v| v.count).sum::<u64>()
            + self.bound_violations.iter().map(|v| v.count).sum::<u64>()
    }

    /// Fails with [`ReconcileError::IntegrityAnomaly`] when any residual
    /// violation remains.
    ///
    /// # Errors
    /// Returns the anomaly error carrying the total violation count.
    pub fn ensure_consistent(&self) -> Result<()> {
        match self.residual_violations() {
            0 => Ok(()),
            violations => Err(ReconcileError::IntegrityAnomaly { violations }),
        }
    }

    /// Operation record of a rule, if it completed.
    pub fn operation(&self, rule_id: &str) -> Option<&OperationRecord> {
        self.operations.iter().find(|op| op.rule_id == rule_id)
    }

    /// Integrity finding for a relation by name.
    pub fn integrity_violation(&self, relation: &str) -> Option<&IntegrityViolation> {
        self.integrity_violations
            .iter()
            .find(|v| v.relation == relation)
    }

    /// Final state of a rule according to the transition journal.
    pub fn final_state(&self, rule_id: &str) -> Option<RuleState> {
        self.transitions
            .iter()
            .rev()
            .find(|t| t.rule_id == rule_id)
            .map(|t| t.to)
    }

    /// Serializes the report as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Serialization`] if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ReconcileError::Serialization {
            context: "Failed to serialize audit report".to_string(),
            source: e,
        })
    }
}

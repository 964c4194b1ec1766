//! Pipeline executor.
//!
//! Runs the batches of an [`ExecutionPlan`] one after another. Rules inside a
//! batch run concurrently on the current task; every rule is wrapped in a
//! timeout that covers its before/after counts as well as its own work.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::plan::{ExecutionPlan, check_relation_order};
use crate::audit::{
    AuditReport, AuditTrail, BoundViolation, IntegrityFindings, OperationRecord, QualityMetric,
    RuleState,
};
use crate::cascade::{RelationGraph, check_primary_keys};
use crate::config::CleaningConfig;
use crate::rules::{CleaningRule, RuleAction};
use crate::store::EntityStore;
use crate::{ReconcileError, Result};

/// Executor limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Time budget per rule, counts included
    pub rule_timeout: Duration,
    /// Largest batch size
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            rule_timeout: Duration::from_secs(30),
            max_concurrency: 4,
        }
    }
}

impl From<&CleaningConfig> for ExecutorConfig {
    fn from(config: &CleaningConfig) -> Self {
        Self {
            rule_timeout: config.rule_timeout(),
            max_concurrency: config.max_concurrency,
        }
    }
}

/// A validated rule set with its relations and execution plan
#[derive(Debug, Clone)]
pub struct Pipeline {
    rules: Vec<CleaningRule>,
    relations: RelationGraph,
    plan: ExecutionPlan,
    config: ExecutorConfig,
    metrics: Vec<QualityMetric>,
}

impl Pipeline {
    /// Plans a rule set with default executor limits.
    ///
    /// # Errors
    /// Returns a configuration error for duplicate rule ids, unknown
    /// dependencies or a dependency cycle.
    pub fn new(rules: Vec<CleaningRule>, relations: RelationGraph) -> Result<Self> {
        Self::with_config(rules, relations, ExecutorConfig::default())
    }

    /// Plans a rule set with the given executor limits.
    ///
    /// # Errors
    /// Returns a configuration error for duplicate rule ids, unknown
    /// dependencies, a dependency cycle, a zero limit, or a relation rule
    /// that does not depend on the cascades feeding it.
    pub fn with_config(
        rules: Vec<CleaningRule>,
        relations: RelationGraph,
        config: ExecutorConfig,
    ) -> Result<Self> {
        if config.rule_timeout.is_zero() {
            return Err(ReconcileError::configuration(
                "rule timeout must be greater than 0",
            ));
        }
        let plan = ExecutionPlan::build(&rules, config.max_concurrency)?;
        check_relation_order(&rules)?;
        debug!(
            "Planned {} rules in {} levels",
            plan.rule_count(),
            plan.levels.len()
        );
        Ok(Self {
            rules,
            relations,
            plan,
            config,
            metrics: Vec::new(),
        })
    }

    /// Builder method to add post-run quality metrics.
    pub fn with_metrics(mut self, metrics: Vec<QualityMetric>) -> Self {
        self.metrics.extend(metrics);
        self
    }

    /// The resolved execution plan.
    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Rules in declaration order.
    pub fn rules(&self) -> &[CleaningRule] {
        &self.rules
    }

    /// Looks up a rule by id.
    pub fn rule(&self, id: &str) -> Option<&CleaningRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// Declared relations.
    pub fn relations(&self) -> &RelationGraph {
        &self.relations
    }

    /// Executor limits.
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Checks relations and rules against the store's schemas.
    ///
    /// # Errors
    /// Returns the first configuration error found.
    pub fn validate(&self, store: &dyn EntityStore) -> Result<()> {
        self.relations.validate(store)?;
        self.rules.iter().try_for_each(|rule| rule.validate(store))?;
        self.metrics.iter().try_for_each(|metric| metric.validate(store))
    }

    /// Runs every rule to completion.
    ///
    /// # Errors
    /// Returns an error only for configuration problems detected before any
    /// rule runs; failures during the run are part of the report.
    pub async fn run(&self, store: &dyn EntityStore) -> Result<AuditReport> {
        self.run_with_cancel(store, CancellationToken::new()).await
    }

    /// Runs every rule to completion unless `cancel` fires.
    ///
    /// Cancellation is checked before each batch: rules already running
    /// finish, rules not yet started are skipped, and the report is built
    /// from what completed.
    ///
    /// # Errors
    /// Returns an error only for configuration problems detected before any
    /// rule runs; failures during the run are part of the report.
    pub async fn run_with_cancel(
        &self,
        store: &dyn EntityStore,
        cancel: CancellationToken,
    ) -> Result<AuditReport> {
        self.validate(store)?;

        let mut trail = AuditTrail::new();
        info!(
            "Starting reconciliation run {} ({} rules, {} store)",
            trail.run_id(),
            self.rules.len(),
            store.backend()
        );

        let by_id: HashMap<&str, &CleaningRule> =
            self.rules.iter().map(|r| (r.id.as_str(), r)).collect();
        let mut states: HashMap<&str, RuleState> = self
            .rules
            .iter()
            .map(|r| (r.id.as_str(), RuleState::Pending))
            .collect();

        for batch in self.plan.batches() {
            if cancel.is_cancelled() {
                warn!("Run {} cancelled; remaining rules skipped", trail.run_id());
                break;
            }

            let mut running = FuturesUnordered::new();
            for id in batch {
                let Some(rule) = by_id.get(id.as_str()).copied() else {
                    continue;
                };
                if let Some(reason) = blocked_reason(rule, &states) {
                    warn!("Skipping rule '{}': {}", rule.id, reason);
                    set_state(&mut states, &mut trail, &rule.id, RuleState::Skipped);
                    trail.skip(&rule.id, reason);
                    continue;
                }
                set_state(&mut states, &mut trail, &rule.id, RuleState::Running);
                running.push(self.execute(rule, store));
            }

            while let Some((rule, outcome)) = running.next().await {
                match outcome {
                    Ok(operation) => {
                        info!(
                            "Rule '{}' on '{}': {} -> {} ({} removed, {}%): {}",
                            rule.id,
                            rule.target,
                            operation.before,
                            operation.after,
                            operation.removed,
                            operation.removal_rate,
                            rule.justification
                        );
                        set_state(&mut states, &mut trail, &rule.id, RuleState::Succeeded);
                        trail.record(operation);
                    }
                    Err(e) => {
                        error!("Rule '{}' failed: {}", rule.id, e);
                        set_state(&mut states, &mut trail, &rule.id, RuleState::Failed);
                        trail.fail(&rule.id, &e);
                    }
                }
            }
        }

        for id in self.plan.order() {
            if states.get(id).is_some_and(|state| !state.is_terminal()) {
                set_state(&mut states, &mut trail, id, RuleState::Skipped);
                trail.skip(id, "cancelled");
            }
        }

        let report = match self.integrity_check(store).await {
            Ok((counts, findings, metrics)) => trail.finish(counts, findings, metrics, None),
            Err(e) => {
                error!("Post-run integrity check failed: {}", e);
                trail.finish(
                    BTreeMap::new(),
                    IntegrityFindings::default(),
                    BTreeMap::new(),
                    Some(e.to_string()),
                )
            }
        };

        let residual = report.residual_violations();
        if residual > 0 {
            warn!(
                "Run {} left {} residual integrity violations",
                report.run_id, residual
            );
        }
        info!(
            "Run {} finished with status {:?}: {} records removed, {} rules failed, {} skipped",
            report.run_id,
            report.status,
            report.total_removed,
            report.failed_rules.len(),
            report.skipped_rules.len()
        );
        Ok(report)
    }

    async fn execute<'a>(
        &self,
        rule: &'a CleaningRule,
        store: &dyn EntityStore,
    ) -> (&'a CleaningRule, Result<OperationRecord>) {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.config.rule_timeout, measure(rule, store))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::RuleTimeout {
                rule: rule.id.clone(),
                timeout: self.config.rule_timeout,
            }),
        };
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        (rule, outcome.map(|op| op.with_duration_ms(elapsed)))
    }

    /// Final counts, the read-only relation, key and bound checks, and the
    /// quality metrics.
    async fn integrity_check(
        &self,
        store: &dyn EntityStore,
    ) -> Result<(BTreeMap<String, u64>, IntegrityFindings, BTreeMap<String, f64>)> {
        let mut counts = BTreeMap::new();
        for collection in store.collections() {
            let count = store.count(&collection, None).await?;
            counts.insert(collection, count);
        }

        let relations = self.relations.check_integrity(store).await?;
        let keys = check_primary_keys(store).await?;

        let mut bounds = Vec::new();
        for rule in &self.rules {
            if let Some((field, predicate)) = rule.bound_violations() {
                let count = store.count(&rule.target, Some(&predicate)).await?;
                if count > 0 {
                    warn!(
                        "Integrity check: {} records of '{}' violate bounds of rule '{}'",
                        count, rule.target, rule.id
                    );
                }
                bounds.push(BoundViolation {
                    rule_id: rule.id.clone(),
                    collection: rule.target.clone(),
                    field: field.to_string(),
                    count,
                });
            }
        }

        let mut metrics = BTreeMap::new();
        for metric in &self.metrics {
            let value = metric.measure(store).await?;
            debug!("Quality metric '{}': {}%", metric.name, value);
            metrics.insert(metric.name.clone(), value);
        }

        Ok((
            counts,
            IntegrityFindings {
                relations,
                keys,
                bounds,
            },
            metrics,
        ))
    }
}

/// Counts, applies and counts again; fails the rule if the count grew.
async fn measure(rule: &CleaningRule, store: &dyn EntityStore) -> Result<OperationRecord> {
    let scope = rule.count_scope.as_ref();
    let before = store.count(&rule.target, scope).await?;
    let reported = rule.apply(store).await?;
    let after = store.count(&rule.target, scope).await?;

    if after > before {
        return Err(ReconcileError::rule_failed(
            &rule.id,
            format!(
                "count of '{}' increased from {} to {}",
                rule.target, before, after
            ),
        ));
    }
    // Unscoped flag rules report mutated records, not removed ones.
    let removes = !matches!(rule.action, RuleAction::Flag { .. }) || scope.is_some();
    if removes && reported != before - after {
        warn!(
            "Rule '{}' reported {} records but the count of '{}' dropped by {}",
            rule.id,
            reported,
            rule.target,
            before - after
        );
    }

    Ok(OperationRecord::new(
        &rule.name,
        &rule.id,
        &rule.target,
        before,
        after,
        &rule.justification,
    ))
}

/// Why a rule cannot start, if any predecessor did not succeed.
fn blocked_reason(rule: &CleaningRule, states: &HashMap<&str, RuleState>) -> Option<String> {
    rule.depends_on
        .iter()
        .find_map(|dependency| match states.get(dependency.as_str()) {
            Some(RuleState::Succeeded) => None,
            Some(RuleState::Failed) => Some(format!("dependency '{}' failed", dependency)),
            Some(RuleState::Skipped) => Some(format!("dependency '{}' was skipped", dependency)),
            Some(state) => Some(format!("dependency '{}' is still {}", dependency, state)),
            None => Some(format!("dependency '{}' is not declared", dependency)),
        })
}

fn set_state<'a>(
    states: &mut HashMap<&'a str, RuleState>,
    trail: &mut AuditTrail,
    id: &'a str,
    to: RuleState,
) {
    let from = states.insert(id, to).unwrap_or(RuleState::Pending);
    debug!("Rule '{}': {} -> {}", id, from, to);
    trail.transition(id, from, to);
}

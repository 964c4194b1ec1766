//! Cleaning rules.
//!
//! A [`CleaningRule`] is one idempotent operation on one target collection,
//! with a justification that ends up in the audit report and the ids of the
//! rules it must run after. What the rule does is described by a
//! [`RuleAction`]; every action except [`RuleAction::Custom`] is plain data,
//! so rules can be validated against store schemas before anything runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cascade::{self, ForeignKey};
use crate::dedup::{DedupPolicy, DedupResolver};
use crate::store::{CmpOp, EntityStore, Mutation, Predicate};
use crate::{ReconcileError, Result};

/// One end of a numeric bound
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limit {
    pub value: f64,
    pub inclusive: bool,
}

impl Limit {
    /// Limit that admits `value` itself.
    pub fn inclusive(value: f64) -> Self {
        Self {
            value,
            inclusive: true,
        }
    }

    /// Limit that excludes `value` itself.
    pub fn exclusive(value: f64) -> Self {
        Self {
            value,
            inclusive: false,
        }
    }
}

/// Valid range for a numeric field; null is never valid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: Option<Limit>,
    pub max: Option<Limit>,
}

impl Bound {
    /// `value > 0`
    pub fn positive() -> Self {
        Self {
            min: Some(Limit::exclusive(0.0)),
            max: None,
        }
    }

    /// `value >= 0`
    pub fn non_negative() -> Self {
        Self {
            min: Some(Limit::inclusive(0.0)),
            max: None,
        }
    }

    /// Arbitrary range.
    pub fn range(min: Option<Limit>, max: Option<Limit>) -> Self {
        Self { min, max }
    }

    /// Builder method to add an inclusive upper limit.
    pub fn at_most(mut self, max: f64) -> Self {
        self.max = Some(Limit::inclusive(max));
        self
    }

    /// Records violating the bound: null, below `min`, or above `max`.
    pub fn violation_predicate(&self, field: &str) -> Predicate {
        let mut violation = Predicate::is_null(field);
        if let Some(min) = self.min {
            let op = if min.inclusive { CmpOp::Lt } else { CmpOp::Le };
            violation = violation.or(Predicate::compare(field, op, min.value));
        }
        if let Some(max) = self.max {
            let op = if max.inclusive { CmpOp::Gt } else { CmpOp::Ge };
            violation = violation.or(Predicate::compare(field, op, max.value));
        }
        violation
    }

    /// Human readable form, e.g. `0 < quantity <= 1000`.
    pub fn describe(&self, field: &str) -> String {
        let mut text = String::new();
        if let Some(min) = self.min {
            let op = if min.inclusive { "<=" } else { "<" };
            text.push_str(&format!("{} {} ", min.value, op));
        }
        text.push_str(field);
        if let Some(max) = self.max {
            let op = if max.inclusive { "<=" } else { "<" };
            text.push_str(&format!(" {} {}", op, max.value));
        }
        text
    }
}

/// Extension point for rules that cannot be expressed as data.
///
/// # Object Safety
/// This trait is object-safe; custom logic is stored as `Arc<dyn RuleLogic>`.
#[async_trait]
pub trait RuleLogic: Send + Sync + std::fmt::Debug {
    /// Applies the rule to `target` and returns how many records it removed
    /// (or, for update-style logic, touched).
    ///
    /// # Errors
    /// Returns error if the store fails or the logic cannot complete.
    async fn apply(&self, store: &dyn EntityStore, target: &str) -> Result<u64>;

    /// Collections other than the target that the logic reads.
    fn reads(&self) -> Vec<String> {
        Vec::new()
    }

    /// Checks the logic against store schemas before a run.
    ///
    /// # Errors
    /// Returns a configuration error if the logic cannot work on this store.
    fn validate(&self, _store: &dyn EntityStore, _target: &str) -> Result<()> {
        Ok(())
    }
}

/// What a rule does to its target collection
#[derive(Debug, Clone)]
pub enum RuleAction {
    /// Delete every record matching the predicate
    DeleteWhere(Predicate),
    /// Delete records whose numeric field is null or out of bounds
    EnforceBounds { field: String, bound: Bound },
    /// Keep one record per key
    Deduplicate(DedupPolicy),
    /// Delete children whose reference does not resolve; the target is the
    /// relation's child
    Cascade(ForeignKey),
    /// Delete parents that no child references; the target is the
    /// relation's parent
    RequireChildren(ForeignKey),
    /// Update matching records instead of deleting them
    Flag {
        predicate: Predicate,
        mutations: Vec<Mutation>,
    },
    /// Arbitrary logic
    Custom(Arc<dyn RuleLogic>),
}

impl RuleAction {
    /// Short description for listings and plans.
    pub fn describe(&self) -> String {
        match self {
            RuleAction::DeleteWhere(_) => "delete where predicate holds".to_string(),
            RuleAction::EnforceBounds { field, bound } => {
                format!("enforce {}", bound.describe(field))
            }
            RuleAction::Deduplicate(policy) => format!("deduplicate {}", policy),
            RuleAction::Cascade(relation) => format!("cascade {}", relation.name),
            RuleAction::RequireChildren(relation) => {
                format!("require children via {}", relation.name)
            }
            RuleAction::Flag { mutations, .. } => {
                let fields: Vec<&str> = mutations.iter().map(Mutation::field).collect();
                format!("flag by setting {}", fields.join(", "))
            }
            RuleAction::Custom(logic) => format!("custom {:?}", logic),
        }
    }
}

/// A single idempotent cleaning operation
#[derive(Debug, Clone)]
pub struct CleaningRule {
    pub id: String,
    /// Operation name used in the audit trail
    pub name: String,
    /// Collection whose count the executor tracks
    pub target: String,
    pub action: RuleAction,
    pub justification: String,
    pub depends_on: Vec<String>,
    /// Restricts the executor's before/after counts, e.g. to active records
    pub count_scope: Option<Predicate>,
}

impl CleaningRule {
    /// Creates a rule with no dependencies.
    ///
    /// The operation name defaults to the id.
    pub fn new(id: impl Into<String>, target: impl Into<String>, action: RuleAction) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            target: target.into(),
            action,
            justification: String::new(),
            depends_on: Vec::new(),
            count_scope: None,
        }
    }

    /// Rule deleting every record of `target` that matches `predicate`.
    pub fn delete_where(
        id: impl Into<String>,
        target: impl Into<String>,
        predicate: Predicate,
    ) -> Self {
        Self::new(id, target, RuleAction::DeleteWhere(predicate))
    }

    /// Rule deleting records whose `field` is null or outside `bound`.
    pub fn enforce_bounds(
        id: impl Into<String>,
        target: impl Into<String>,
        field: impl Into<String>,
        bound: Bound,
    ) -> Self {
        Self::new(
            id,
            target,
            RuleAction::EnforceBounds {
                field: field.into(),
                bound,
            },
        )
    }

    /// Rule keeping one record of `target` per key.
    pub fn deduplicate(
        id: impl Into<String>,
        target: impl Into<String>,
        policy: DedupPolicy,
    ) -> Self {
        Self::new(id, target, RuleAction::Deduplicate(policy))
    }

    /// Rule deleting the relation's orphaned children.
    pub fn cascade(id: impl Into<String>, relation: ForeignKey) -> Self {
        let target = relation.child.clone();
        Self::new(id, target, RuleAction::Cascade(relation))
    }

    /// Rule deleting the relation's parents without children.
    pub fn require_children(id: impl Into<String>, relation: ForeignKey) -> Self {
        let target = relation.parent.clone();
        Self::new(id, target, RuleAction::RequireChildren(relation))
    }

    /// Rule updating records of `target` that match `predicate`.
    pub fn flag(
        id: impl Into<String>,
        target: impl Into<String>,
        predicate: Predicate,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self::new(
            id,
            target,
            RuleAction::Flag {
                predicate,
                mutations,
            },
        )
    }

    /// Rule running custom logic against `target`.
    pub fn custom(
        id: impl Into<String>,
        target: impl Into<String>,
        logic: Arc<dyn RuleLogic>,
    ) -> Self {
        Self::new(id, target, RuleAction::Custom(logic))
    }

    /// Builder method to set the operation name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to set the justification.
    pub fn justified_by(mut self, justification: impl Into<String>) -> Self {
        self.justification = justification.into();
        self
    }

    /// Builder method to add dependencies.
    pub fn after<I, S>(mut self, rule_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(rule_ids.into_iter().map(Into::into));
        self
    }

    /// Builder method to restrict the executor's counts.
    pub fn counted_over(mut self, scope: Predicate) -> Self {
        self.count_scope = Some(scope);
        self
    }

    /// Collections the rule reads besides its target.
    pub fn reads(&self) -> BTreeSet<String> {
        let mut reads = match &self.action {
            RuleAction::DeleteWhere(predicate) | RuleAction::Flag { predicate, .. } => {
                predicate.referenced_collections()
            }
            RuleAction::EnforceBounds { .. } | RuleAction::Deduplicate(_) => BTreeSet::new(),
            RuleAction::Cascade(relation) => BTreeSet::from([relation.parent.clone()]),
            RuleAction::RequireChildren(relation) => BTreeSet::from([relation.child.clone()]),
            RuleAction::Custom(logic) => logic.reads().into_iter().collect(),
        };
        if let Some(scope) = &self.count_scope {
            reads.extend(scope.referenced_collections());
        }
        reads.remove(&self.target);
        reads
    }

    /// Returns true if the two rules must not run at the same time.
    pub fn conflicts_with(&self, other: &CleaningRule) -> bool {
        self.target == other.target
            || self.reads().contains(&other.target)
            || other.reads().contains(&self.target)
    }

    /// Validates the rule against store schemas.
    ///
    /// # Errors
    /// Returns a configuration error for an empty id or justification, an
    /// unknown collection, or a predicate, mutation, policy or relation that
    /// does not fit the schemas.
    pub fn validate(&self, store: &dyn EntityStore) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ReconcileError::configuration("Rule id must not be empty"));
        }
        if self.justification.trim().is_empty() {
            return Err(ReconcileError::configuration(format!(
                "Rule '{}' has no justification",
                self.id
            )));
        }

        let schema = store.require_schema(&self.target)?;
        if let Some(scope) = &self.count_scope {
            store.validate_predicate(&self.target, scope)?;
        }

        match &self.action {
            RuleAction::DeleteWhere(predicate) => store.validate_predicate(&self.target, predicate),
            RuleAction::EnforceBounds { field, .. } => match schema.kind_of(field) {
                Some(kind) if kind.is_numeric() => Ok(()),
                Some(kind) => Err(ReconcileError::invalid_predicate(
                    &self.target,
                    format!("bounds on {} field '{}'", kind, field),
                )),
                None => Err(ReconcileError::invalid_predicate(
                    &self.target,
                    format!("bounds on undeclared field '{}'", field),
                )),
            },
            RuleAction::Deduplicate(policy) => policy.validate(schema),
            RuleAction::Cascade(relation) => {
                self.expect_target(&relation.child, relation)?;
                relation.validate(store)
            }
            RuleAction::RequireChildren(relation) => {
                self.expect_target(&relation.parent, relation)?;
                relation.validate(store)
            }
            RuleAction::Flag {
                predicate,
                mutations,
            } => {
                store.validate_predicate(&self.target, predicate)?;
                store.validate_mutations(&self.target, mutations)
            }
            RuleAction::Custom(logic) => logic.validate(store, &self.target),
        }
    }

    fn expect_target(&self, expected: &str, relation: &ForeignKey) -> Result<()> {
        if self.target != expected {
            return Err(ReconcileError::configuration(format!(
                "Rule '{}' targets '{}' but relation '{}' acts on '{}'",
                self.id, self.target, relation.name, expected
            )));
        }
        Ok(())
    }

    /// Predicate of residual violations for bounds rules.
    pub fn bound_violations(&self) -> Option<(&str, Predicate)> {
        match &self.action {
            RuleAction::EnforceBounds { field, bound } => {
                Some((field.as_str(), bound.violation_predicate(field)))
            }
            _ => None,
        }
    }

    /// Runs the rule and returns its self-reported count.
    ///
    /// # Errors
    /// Returns error if the store fails or custom logic fails.
    pub async fn apply(&self, store: &dyn EntityStore) -> Result<u64> {
        match &self.action {
            RuleAction::DeleteWhere(predicate) => store.delete(&self.target, predicate).await,
            RuleAction::EnforceBounds { field, bound } => {
                store
                    .delete(&self.target, &bound.violation_predicate(field))
                    .await
            }
            RuleAction::Deduplicate(policy) => {
                DedupResolver::new(policy.clone())
                    .resolve(store, &self.target)
                    .await
            }
            RuleAction::Cascade(relation) => cascade::remove_orphans(store, relation).await,
            RuleAction::RequireChildren(relation) => {
                cascade::remove_childless(store, relation).await
            }
            RuleAction::Flag {
                predicate,
                mutations,
            } => store.update(&self.target, predicate, mutations).await,
            RuleAction::Custom(logic) => logic.apply(store, &self.target).await,
        }
    }
}

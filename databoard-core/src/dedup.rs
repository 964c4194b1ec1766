//! Duplicate resolution: keep exactly one record per key.
//!
//! Records are grouped by the policy's key fields; records with a null or
//! blank key value take no part. Each group of two or more is ordered by a
//! [`TieBreak`] and everything after the first record is removed.
//!
//! The tie-break is a total order. After the declared sort keys it falls
//! back to the primary key and then to the complete field map, so the same
//! set of records yields the same survivor whatever order the store returns
//! them in.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

use crate::models::{CollectionSchema, Record, RowId, Value};
use crate::store::{EntityStore, Predicate};
use crate::{ReconcileError, Result};

/// One step of a tie-break ordering
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    /// Smallest value wins; nulls last
    Ascending(String),
    /// Largest value wins; nulls last
    Descending(String),
    /// Listed values win in list order; unlisted values and nulls after
    Rank { field: String, order: Vec<Value> },
}

impl SortKey {
    /// Field read by this sort key.
    pub fn field(&self) -> &str {
        match self {
            SortKey::Ascending(field) | SortKey::Descending(field) => field,
            SortKey::Rank { field, .. } => field,
        }
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        let (left, right) = (a.get(self.field()), b.get(self.field()));
        match self {
            // Value's own order already sorts null last.
            SortKey::Ascending(_) => left.cmp(right),
            SortKey::Descending(_) => match (left.is_null(), right.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => right.cmp(left),
            },
            SortKey::Rank { order, .. } => {
                let rank = |v: &Value| order.iter().position(|o| o == v).unwrap_or(order.len());
                rank(left).cmp(&rank(right))
            }
        }
    }
}

impl std::fmt::Display for SortKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SortKey::Ascending(field) => write!(f, "{} asc", field),
            SortKey::Descending(field) => write!(f, "{} desc", field),
            SortKey::Rank { field, order } => {
                let listed: Vec<String> = order.iter().map(|v| v.to_string()).collect();
                write!(f, "{} rank [{}]", field, listed.join(", "))
            }
        }
    }
}

/// Grouping key and tie-break ordering for a deduplication rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DedupPolicy {
    /// Fields whose combined value identifies a group
    pub key: Vec<String>,
    /// Preference order inside a group, best first
    pub order: Vec<SortKey>,
}

impl DedupPolicy {
    /// Groups by the given key fields.
    pub fn by<I, S>(key: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            key: key.into_iter().map(Into::into).collect(),
            order: Vec::new(),
        }
    }

    /// Builder method to append a sort key.
    pub fn prefer(mut self, key: SortKey) -> Self {
        self.order.push(key);
        self
    }

    /// Validates the policy against the collection schema.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidPredicate`] for an empty key or an
    /// undeclared field.
    pub fn validate(&self, schema: &CollectionSchema) -> Result<()> {
        if self.key.is_empty() {
            return Err(ReconcileError::invalid_predicate(
                &schema.name,
                "deduplication without key fields",
            ));
        }
        let fields = self
            .key
            .iter()
            .map(String::as_str)
            .chain(self.order.iter().map(SortKey::field));
        for field in fields {
            if !schema.has_field(field) {
                return Err(ReconcileError::invalid_predicate(
                    &schema.name,
                    format!("deduplication on undeclared field '{}'", field),
                ));
            }
        }
        Ok(())
    }

    /// Tie-break comparator for a collection with the given primary key.
    pub fn tie_break<'a>(&'a self, primary_key: &'a str) -> TieBreak<'a> {
        TieBreak {
            order: &self.order,
            primary_key,
        }
    }
}

impl std::fmt::Display for DedupPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "one per ({})", self.key.join(", "))?;
        if !self.order.is_empty() {
            let order: Vec<String> = self.order.iter().map(ToString::to_string).collect();
            write!(f, " keeping {}", order.join(", "))?;
        }
        Ok(())
    }
}

/// Total order used to pick the survivor of a duplicate group
#[derive(Debug, Clone, Copy)]
pub struct TieBreak<'a> {
    order: &'a [SortKey],
    primary_key: &'a str,
}

impl TieBreak<'_> {
    /// `Less` means `a` is preferred over `b`.
    pub fn compare(&self, a: &Record, b: &Record) -> Ordering {
        self.order
            .iter()
            .map(|key| key.compare(a, b))
            .find(|o| o.is_ne())
            .unwrap_or_else(|| {
                a.get(self.primary_key)
                    .cmp(b.get(self.primary_key))
                    .then_with(|| a.fields.cmp(&b.fields))
            })
    }
}

/// Outcome of grouping a collection, before anything is removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupPlan {
    /// Groups with a usable key
    pub groups: usize,
    /// Groups with more than one record
    pub duplicate_groups: usize,
    /// Records skipped because a key field was null or blank
    pub unkeyed: usize,
    /// Survivors of duplicate groups
    pub retained: Vec<RowId>,
    /// Records to remove, ascending
    pub removed: Vec<RowId>,
}

/// Applies a [`DedupPolicy`] to a collection
#[derive(Debug, Clone)]
pub struct DedupResolver {
    policy: DedupPolicy,
}

impl DedupResolver {
    /// Creates a resolver for the given policy.
    pub fn new(policy: DedupPolicy) -> Self {
        Self { policy }
    }

    /// Decides which records survive without touching the store.
    pub fn plan(&self, schema: &CollectionSchema, records: &[Record]) -> DedupPlan {
        let mut plan = DedupPlan::default();
        let mut groups: BTreeMap<Vec<&Value>, Vec<&Record>> = BTreeMap::new();

        for record in records {
            let key: Vec<&Value> = self.policy.key.iter().map(|f| record.get(f)).collect();
            if key.iter().any(|v| v.is_blank()) {
                plan.unkeyed += 1;
                continue;
            }
            groups.entry(key).or_default().push(record);
        }

        let tie_break = self.policy.tie_break(&schema.primary_key);
        plan.groups = groups.len();
        for mut members in groups.into_values().filter(|m| m.len() > 1) {
            plan.duplicate_groups += 1;
            members.sort_by(|a, b| tie_break.compare(a, b));
            plan.retained.push(members[0].row_id);
            plan.removed
                .extend(members[1..].iter().map(|record| record.row_id));
        }
        plan.retained.sort_unstable();
        plan.removed.sort_unstable();
        plan
    }

    /// Removes every duplicate from `collection` and returns how many went.
    ///
    /// # Errors
    /// Returns error if the collection is unknown, the policy names an
    /// undeclared field, or the store fails.
    pub async fn resolve(&self, store: &dyn EntityStore, collection: &str) -> Result<u64> {
        let schema = store.require_schema(collection)?;
        self.policy.validate(schema)?;

        let records = store.select(collection, None).await?;
        let plan = self.plan(schema, &records);
        debug!(
            "Dedup of '{}' by ({}): {} groups, {} with duplicates, {} records unkeyed",
            collection,
            self.policy.key.join(", "),
            plan.groups,
            plan.duplicate_groups,
            plan.unkeyed
        );

        if plan.removed.is_empty() {
            return Ok(0);
        }
        store
            .delete(collection, &Predicate::rows(plan.removed))
            .await
    }
}

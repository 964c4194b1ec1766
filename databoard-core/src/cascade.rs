//! Referential cascade validation.
//!
//! Foreign key relations are declared statically and form a graph from parent
//! collections to child collections. The graph must be acyclic; its
//! topological order drives cascades so that a parent is cleaned before any
//! of its children are checked against it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use tracing::{debug, info, warn};

use crate::audit::{IntegrityViolation, KeyViolation};
use crate::models::Value;
use crate::store::{EntityStore, Predicate};
use crate::{ReconcileError, Result};

/// A reference from `child.field` to the primary key of `parent`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub name: String,
    pub child: String,
    pub field: String,
    pub parent: String,
    pub parent_key: String,
    /// Null references are allowed
    #[serde(default)]
    pub nullable: bool,
}

impl ForeignKey {
    /// Declares a non-nullable relation named `child.field -> parent.parent_key`.
    pub fn new(
        child: impl Into<String>,
        field: impl Into<String>,
        parent: impl Into<String>,
        parent_key: impl Into<String>,
    ) -> Self {
        let (child, field, parent, parent_key) =
            (child.into(), field.into(), parent.into(), parent_key.into());
        Self {
            name: format!("{}.{} -> {}.{}", child, field, parent, parent_key),
            child,
            field,
            parent,
            parent_key,
            nullable: false,
        }
    }

    /// Builder method to rename the relation.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builder method to allow null references.
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Child records whose reference does not resolve.
    ///
    /// Null references are violations unless the relation is nullable.
    pub fn orphan_predicate(&self) -> Predicate {
        let dangling =
            Predicate::in_collection(&self.field, &self.parent, &self.parent_key).not();
        if self.nullable {
            dangling
        } else {
            Predicate::is_null(&self.field).or(dangling)
        }
    }

    /// Parent records that no child references.
    pub fn childless_predicate(&self) -> Predicate {
        Predicate::in_collection(&self.parent_key, &self.child, &self.field).not()
    }

    /// Validates the relation against the schemas of a store.
    ///
    /// # Errors
    /// Returns [`ReconcileError::UnknownCollection`] for undeclared
    /// collections and a configuration error for undeclared fields or a
    /// parent key that is not the parent's primary key.
    pub fn validate(&self, store: &dyn EntityStore) -> Result<()> {
        let child = store.require_schema(&self.child)?;
        let parent = store.require_schema(&self.parent)?;

        if !child.has_field(&self.field) {
            return Err(ReconcileError::configuration(format!(
                "Relation '{}' references undeclared field '{}.{}'",
                self.name, self.child, self.field
            )));
        }
        if parent.primary_key != self.parent_key {
            return Err(ReconcileError::configuration(format!(
                "Relation '{}' must reference the primary key of '{}' ('{}')",
                self.name, self.parent, parent.primary_key
            )));
        }
        Ok(())
    }
}

/// Removes child records of `relation` whose reference does not resolve.
///
/// # Errors
/// Returns error if either collection is unknown or the store fails.
pub async fn remove_orphans(store: &dyn EntityStore, relation: &ForeignKey) -> Result<u64> {
    let removed = store
        .delete(&relation.child, &relation.orphan_predicate())
        .await?;
    debug!("Cascade '{}' removed {} orphans", relation.name, removed);
    Ok(removed)
}

/// Removes parent records of `relation` that no child references.
///
/// # Errors
/// Returns error if either collection is unknown or the store fails.
pub async fn remove_childless(store: &dyn EntityStore, relation: &ForeignKey) -> Result<u64> {
    let removed = store
        .delete(&relation.parent, &relation.childless_predicate())
        .await?;
    debug!(
        "Relation '{}' removed {} parents without children",
        relation.name, removed
    );
    Ok(removed)
}

/// Acyclic graph of foreign key relations
#[derive(Debug, Clone, Default)]
pub struct RelationGraph {
    relations: Vec<ForeignKey>,
    order: Vec<String>,
}

impl RelationGraph {
    /// Builds the graph and its topological order.
    ///
    /// # Errors
    /// Returns [`ReconcileError::CyclicRelationGraph`] if the relations form a
    /// cycle, and a configuration error for duplicate relation names.
    pub fn new(relations: Vec<ForeignKey>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for relation in &relations {
            if !names.insert(relation.name.as_str()) {
                return Err(ReconcileError::configuration(format!(
                    "Relation '{}' declared twice",
                    relation.name
                )));
            }
        }
        let order = topological_order(&relations)?;
        debug!("Relation graph order: {}", order.join(" -> "));
        Ok(Self { relations, order })
    }

    /// Declared relations in declaration order.
    pub fn relations(&self) -> &[ForeignKey] {
        &self.relations
    }

    /// Collections in parent-before-child order.
    pub fn collection_order(&self) -> &[String] {
        &self.order
    }

    /// Relations ordered so that every parent is cascaded before its
    /// children are checked; ties keep declaration order.
    pub fn cascade_order(&self) -> Vec<&ForeignKey> {
        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();
        let mut ordered: Vec<&ForeignKey> = self.relations.iter().collect();
        ordered.sort_by_key(|r| position.get(r.child.as_str()).copied().unwrap_or(usize::MAX));
        ordered
    }

    /// Validates every relation against the schemas of a store.
    ///
    /// # Errors
    /// Returns the first configuration error found.
    pub fn validate(&self, store: &dyn EntityStore) -> Result<()> {
        self.relations.iter().try_for_each(|r| r.validate(store))
    }

    /// Removes orphans for every relation in cascade order.
    ///
    /// Returns removed counts per relation name.
    ///
    /// # Errors
    /// Stops at the first store error; earlier cascades stay applied.
    pub async fn cascade(&self, store: &dyn EntityStore) -> Result<Vec<(String, u64)>> {
        let mut removed = Vec::with_capacity(self.relations.len());
        for relation in self.cascade_order() {
            removed.push((relation.name.clone(), remove_orphans(store, relation).await?));
        }
        Ok(removed)
    }

    /// Read-only scan of every relation for dangling references.
    ///
    /// Every relation is reported, including those without violations.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn check_integrity(&self, store: &dyn EntityStore) -> Result<Vec<IntegrityViolation>> {
        let mut findings = Vec::with_capacity(self.relations.len());
        for relation in self.cascade_order() {
            let count = store
                .count(&relation.child, Some(&relation.orphan_predicate()))
                .await?;
            if count > 0 {
                warn!(
                    "Integrity check: {} dangling references for '{}'",
                    count, relation.name
                );
            }
            findings.push(IntegrityViolation {
                relation: relation.name.clone(),
                child: relation.child.clone(),
                parent: relation.parent.clone(),
                field: relation.field.clone(),
                count,
            });
        }
        info!(
            "Integrity check covered {} relations, {} violations",
            findings.len(),
            findings.iter().map(|f| f.count).sum::<u64>()
        );
        Ok(findings)
    }
}

/// Counts surplus records per duplicated primary key in every collection.
///
/// Null keys are not counted as duplicates of each other.
///
/// # Errors
/// Returns error if the store cannot be read.
pub async fn check_primary_keys(store: &dyn EntityStore) -> Result<Vec<KeyViolation>> {
    let mut findings = Vec::new();
    for collection in store.collections() {
        let schema = store.require_schema(&collection)?;
        let records = store.select(&collection, None).await?;

        let mut seen: BTreeMap<&Value, u64> = BTreeMap::new();
        for record in &records {
            let key = record.get(&schema.primary_key);
            if !key.is_null() {
                *seen.entry(key).or_default() += 1;
            }
        }
        let count = seen.values().map(|n| n - 1).sum();
        if count > 0 {
            warn!("Integrity check: {} duplicate keys in '{}'", count, collection);
        }
        findings.push(KeyViolation { collection, count });
    }
    Ok(findings)
}

/// Kahn's algorithm over collections; ties resolve by first appearance.
fn topological_order(relations: &[ForeignKey]) -> Result<Vec<String>> {
    let mut nodes: Vec<&str> = Vec::new();
    for relation in relations {
        for name in [relation.parent.as_str(), relation.child.as_str()] {
            if !nodes.contains(&name) {
                nodes.push(name);
            }
        }
    }
    let index: HashMap<&str, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for relation in relations {
        let (parent, child) = (index[relation.parent.as_str()], index[relation.child.as_str()]);
        children[parent].push(child);
        in_degree[child] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(nodes[node].to_string());
        for &child in &children[node] {
            in_degree[child] -= 1;
            if in_degree[child] == 0 {
                ready.push(Reverse(child));
            }
        }
    }

    if order.len() < nodes.len() {
        return Err(ReconcileError::CyclicRelationGraph {
            collections: find_cycle(relations, &nodes, &in_degree),
        });
    }
    Ok(order)
}

/// Walks parent links among the nodes Kahn's algorithm could not release
/// until a collection repeats, and returns that loop parent-first.
fn find_cycle(relations: &[ForeignKey], nodes: &[&str], in_degree: &[usize]) -> Vec<String> {
    let stuck = |name: &str| {
        nodes
            .iter()
            .position(|n| *n == name)
            .is_some_and(|i| in_degree[i] > 0)
    };
    let Some(start) = nodes.iter().zip(in_degree).find(|(_, d)| **d > 0).map(|(n, _)| *n) else {
        return Vec::new();
    };

    let mut path: Vec<&str> = vec![start];
    let mut current = start;
    loop {
        let parent = relations
            .iter()
            .find(|r| r.child == current && stuck(&r.parent))
            .map(|r| r.parent.as_str());
        let Some(parent) = parent else {
            return path.into_iter().map(String::from).collect();
        };
        if let Some(i) = path.iter().position(|n| *n == parent) {
            let mut cycle: Vec<String> = path[i..].iter().map(|n| n.to_string()).collect();
            cycle.push(parent.to_string());
            cycle.reverse();
            return cycle;
        }
        path.push(parent);
        current = parent;
    }
}

//! Execution planning: dependency levels and conflict-free batches.
//!
//! Rules are ordered with Kahn's algorithm, using declaration order to break
//! ties so that the same rule set always produces the same plan. A rule's
//! level is the length of the longest dependency path leading to it. Within a
//! level, rules are packed into batches that never contain two conflicting
//! rules (see [`CleaningRule::conflicts_with`]); a batch is the unit the
//! executor runs concurrently.
//!
//! Relation rules are also checked against the foreign key graph: a cascade
//! into a child collection must come after every cascade into its parent, and
//! a required-children rule after every cascade into the children.

use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use crate::rules::{CleaningRule, RuleAction};
use crate::{ReconcileError, Result};

/// Rule ids of one dependency level, split into batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanLevel {
    pub depth: usize,
    pub batches: Vec<Vec<String>>,
}

/// Resolved execution order of a rule set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub levels: Vec<PlanLevel>,
}

impl ExecutionPlan {
    /// Builds the plan.
    ///
    /// # Errors
    /// Returns [`ReconcileError::DuplicateRule`],
    /// [`ReconcileError::UnknownDependency`] or
    /// [`ReconcileError::CyclicRuleGraph`] for an inconsistent rule set, and
    /// a configuration error when `max_concurrency` is zero.
    pub fn build(rules: &[CleaningRule], max_concurrency: usize) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(ReconcileError::configuration(
                "max_concurrency must be greater than 0",
            ));
        }

        let mut index: HashMap<&str, usize> = HashMap::with_capacity(rules.len());
        for (i, rule) in rules.iter().enumerate() {
            if index.insert(rule.id.as_str(), i).is_some() {
                return Err(ReconcileError::DuplicateRule {
                    rule: rule.id.clone(),
                });
            }
        }

        let mut dependants: Vec<Vec<usize>> = vec![Vec::new(); rules.len()];
        let mut in_degree = vec![0usize; rules.len()];
        for (i, rule) in rules.iter().enumerate() {
            for dependency in &rule.depends_on {
                let Some(&d) = index.get(dependency.as_str()) else {
                    return Err(ReconcileError::UnknownDependency {
                        rule: rule.id.clone(),
                        dependency: dependency.clone(),
                    });
                };
                dependants[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut depth = vec![0usize; rules.len()];
        let mut ordered = Vec::with_capacity(rules.len());
        while let Some(Reverse(i)) = ready.pop() {
            ordered.push(i);
            for &next in &dependants[i] {
                depth[next] = depth[next].max(depth[i] + 1);
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if ordered.len() < rules.len() {
            let stuck = rules
                .iter()
                .zip(&in_degree)
                .filter(|(_, d)| **d > 0)
                .map(|(rule, _)| rule.id.clone())
                .collect();
            return Err(ReconcileError::CyclicRuleGraph { rules: stuck });
        }

        let max_depth = depth.iter().copied().max().unwrap_or(0);
        let mut levels = Vec::new();
        for level in 0..=max_depth {
            // Declaration order within the level.
            let members: Vec<&CleaningRule> = rules
                .iter()
                .zip(&depth)
                .filter(|(_, d)| **d == level)
                .map(|(rule, _)| rule)
                .collect();
            if members.is_empty() {
                continue;
            }
            levels.push(PlanLevel {
                depth: level,
                batches: pack_batches(&members, max_concurrency),
            });
        }

        Ok(Self { levels })
    }

    /// Every rule id in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.levels
            .iter()
            .flat_map(|level| level.batches.iter())
            .flat_map(|batch| batch.iter().map(String::as_str))
            .collect()
    }

    /// Number of planned rules.
    pub fn rule_count(&self) -> usize {
        self.levels
            .iter()
            .flat_map(|level| level.batches.iter())
            .map(Vec::len)
            .sum()
    }

    /// Batches across all levels, in execution order.
    pub fn batches(&self) -> impl Iterator<Item = &Vec<String>> {
        self.levels.iter().flat_map(|level| level.batches.iter())
    }
}

/// Rejects relation rules that could run before the cascades they rely on.
///
/// `rules` must already form a valid plan.
///
/// # Errors
/// Returns a configuration error naming the first misordered pair.
pub(crate) fn check_relation_order(rules: &[CleaningRule]) -> Result<()> {
    let by_id: HashMap<&str, &CleaningRule> = rules.iter().map(|r| (r.id.as_str(), r)).collect();

    for rule in rules {
        let upstream = match &rule.action {
            RuleAction::Cascade(relation) => relation.parent.as_str(),
            RuleAction::RequireChildren(relation) => relation.child.as_str(),
            _ => continue,
        };
        let ancestors = ancestors_of(rule, &by_id);
        let missing = rules.iter().find(|other| {
            matches!(&other.action, RuleAction::Cascade(relation) if relation.child == upstream)
                && other.id != rule.id
                && !ancestors.contains(other.id.as_str())
        });
        if let Some(missing) = missing {
            return Err(ReconcileError::configuration(format!(
                "rule '{}' must depend on cascade rule '{}' into '{}'",
                rule.id, missing.id, upstream
            )));
        }
    }
    Ok(())
}

/// Transitive dependencies of a rule.
fn ancestors_of<'a>(
    rule: &'a CleaningRule,
    by_id: &HashMap<&str, &'a CleaningRule>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack: Vec<&'a CleaningRule> = vec![rule];
    while let Some(current) = stack.pop() {
        for dependency in &current.depends_on {
            if seen.insert(dependency.as_str()) {
                if let Some(next) = by_id.get(dependency.as_str()) {
                    stack.push(next);
                }
            }
        }
    }
    seen
}

/// Places each rule in the earliest batch after its last conflict that still
/// has room.
fn pack_batches(members: &[&CleaningRule], max_concurrency: usize) -> Vec<Vec<String>> {
    let mut batches: Vec<Vec<&CleaningRule>> = Vec::new();
    for rule in members {
        let start = batches
            .iter()
            .rposition(|batch| batch.iter().any(|other| other.conflicts_with(rule)))
            .map_or(0, |last| last + 1);
        match (start..batches.len()).find(|&b| batches[b].len() < max_concurrency) {
            Some(b) => batches[b].push(rule),
            None => batches.push(vec![rule]),
        }
    }
    batches
        .into_iter()
        .map(|batch| batch.into_iter().map(|rule| rule.id.clone()).collect())
        .collect()
}

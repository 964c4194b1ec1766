//! Predicates and mutations understood by every entity store.
//!
//! Predicates are data, not closures, so that the same rule can be evaluated
//! in memory or compiled to SQL. Evaluation follows SQL three-valued logic:
//! comparisons against null are unknown, and only rows for which the
//! predicate is definitely true match.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::models::{CollectionSchema, FieldKind, Record, RowId, Value};
use crate::{ReconcileError, Result};

/// Comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// SQL spelling of the operator.
    pub fn sql(&self) -> &'static str {
        match self {
            CmpOp::Eq => "=",
            CmpOp::Ne => "<>",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    fn holds(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::{Equal, Greater, Less};
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        }
    }
}

/// Row filter over a single collection
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Every row
    All,
    /// Field is null
    IsNull(String),
    /// Field is null or text that is empty after trimming
    IsBlank(String),
    /// `field <op> value`; never true when the field is null
    Compare {
        field: String,
        op: CmpOp,
        value: Value,
    },
    /// `left <op> right` between two fields of the same record; never true
    /// when either is null
    CompareFields {
        left: String,
        op: CmpOp,
        right: String,
    },
    /// Case-insensitive substring match on a text field.
    ///
    /// Only ASCII letters are folded, as SQLite's `LOWER` and `LIKE` do.
    Contains { field: String, needle: String },
    /// Field value appears in `column` of another collection,
    /// optionally restricted by `filter` on that collection
    InCollection {
        field: String,
        collection: String,
        column: String,
        filter: Option<Box<Predicate>>,
    },
    /// Store-assigned row identity is one of the given ids
    RowIn(BTreeSet<RowId>),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// `field IS NULL`
    pub fn is_null(field: impl Into<String>) -> Self {
        Predicate::IsNull(field.into())
    }

    /// `field IS NULL OR trim(field) = ''`
    pub fn is_blank(field: impl Into<String>) -> Self {
        Predicate::IsBlank(field.into())
    }

    /// `field <op> value`
    pub fn compare(field: impl Into<String>, op: CmpOp, value: impl Into<Value>) -> Self {
        Predicate::Compare {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// `field = value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(field, CmpOp::Eq, value)
    }

    /// `left <op> right` over two fields
    pub fn compare_fields(left: impl Into<String>, op: CmpOp, right: impl Into<String>) -> Self {
        Predicate::CompareFields {
            left: left.into(),
            op,
            right: right.into(),
        }
    }

    /// Case-insensitive `field LIKE '%needle%'`
    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.into(),
            needle: needle.into(),
        }
    }

    /// `field IN (SELECT column FROM collection)`
    pub fn in_collection(
        field: impl Into<String>,
        collection: impl Into<String>,
        column: impl Into<String>,
    ) -> Self {
        Predicate::InCollection {
            field: field.into(),
            collection: collection.into(),
            column: column.into(),
            filter: None,
        }
    }

    /// `field IN (SELECT column FROM collection WHERE filter)`
    pub fn in_filtered_collection(
        field: impl Into<String>,
        collection: impl Into<String>,
        column: impl Into<String>,
        filter: Predicate,
    ) -> Self {
        Predicate::InCollection {
            field: field.into(),
            collection: collection.into(),
            column: column.into(),
            filter: Some(Box::new(filter)),
        }
    }

    /// Rows with the given store row ids.
    pub fn rows(ids: impl IntoIterator<Item = RowId>) -> Self {
        Predicate::RowIn(ids.into_iter().collect())
    }

    /// Logical negation.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Conjunction with another predicate.
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    /// Disjunction with another predicate.
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    /// Collections other than the filtered one that this predicate reads.
    pub fn referenced_collections(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::InCollection {
                collection, filter, ..
            } => {
                out.insert(collection.clone());
                if let Some(filter) = filter {
                    filter.collect_references(out);
                }
            }
            Predicate::Not(inner) => inner.collect_references(out),
            Predicate::And(parts) | Predicate::Or(parts) => {
                for part in parts {
                    part.collect_references(out);
                }
            }
            _ => {}
        }
    }

    /// Validates field references against the schemas of a store.
    ///
    /// `lookup` resolves a collection name to its schema.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidPredicate`] for undeclared fields or
    /// collections and for comparison values that do not fit the field kind.
    pub fn validate<'a, F>(&self, schema: &CollectionSchema, lookup: &F) -> Result<()>
    where
        F: Fn(&str) -> Option<&'a CollectionSchema>,
    {
        let require = |field: &str| {
            schema.kind_of(field).ok_or_else(|| {
                ReconcileError::invalid_predicate(
                    &schema.name,
                    format!("undeclared field '{}'", field),
                )
            })
        };

        match self {
            Predicate::All | Predicate::RowIn(_) => Ok(()),
            Predicate::IsNull(field) | Predicate::IsBlank(field) => require(field).map(|_| ()),
            Predicate::Compare { field, value, .. } => {
                let kind = require(field)?;
                if value.is_null() {
                    return Err(ReconcileError::invalid_predicate(
                        &schema.name,
                        format!("comparison of '{}' against null never matches", field),
                    ));
                }
                if !value.fits(kind) && !(kind.is_numeric() && value.as_f64().is_some()) {
                    return Err(ReconcileError::invalid_predicate(
                        &schema.name,
                        format!("value {:?} does not fit {} field '{}'", value, kind, field),
                    ));
                }
                Ok(())
            }
            Predicate::CompareFields { left, right, .. } => {
                let (left_kind, right_kind) = (require(left)?, require(right)?);
                if left_kind != right_kind && !(left_kind.is_numeric() && right_kind.is_numeric())
                {
                    return Err(ReconcileError::invalid_predicate(
                        &schema.name,
                        format!(
                            "cannot compare {} field '{}' with {} field '{}'",
                            left_kind, left, right_kind, right
                        ),
                    ));
                }
                Ok(())
            }
            Predicate::Contains { field, .. } => {
                let kind = require(field)?;
                if kind != FieldKind::Text {
                    return Err(ReconcileError::invalid_predicate(
                        &schema.name,
                        format!("substring match on non-text field '{}'", field),
                    ));
                }
                Ok(())
            }
            Predicate::InCollection {
                field,
                collection,
                column,
                filter,
            } => {
                require(field)?;
                let other = lookup(collection).ok_or_else(|| {
                    ReconcileError::invalid_predicate(
                        &schema.name,
                        format!("undeclared collection '{}'", collection),
                    )
                })?;
                if !other.has_field(column) {
                    return Err(ReconcileError::invalid_predicate(
                        &schema.name,
                        format!("undeclared field '{}.{}'", collection, column),
                    ));
                }
                match filter {
                    Some(filter) => filter.validate(other, lookup),
                    None => Ok(()),
                }
            }
            Predicate::Not(inner) => inner.validate(schema, lookup),
            Predicate::And(parts) | Predicate::Or(parts) => {
                parts.iter().try_for_each(|p| p.validate(schema, lookup))
            }
        }
    }
}

/// Field assignment applied by update operations
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Set `field` to `value`
    Set { field: String, value: Value },
    /// Set `field` to the record's own value of `from`
    Copy { field: String, from: String },
}

impl Mutation {
    /// `SET field = value`
    pub fn set(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Mutation::Set {
            field: field.into(),
            value: value.into(),
        }
    }

    /// `SET field = from`
    pub fn copy(field: impl Into<String>, from: impl Into<String>) -> Self {
        Mutation::Copy {
            field: field.into(),
            from: from.into(),
        }
    }

    /// Target field of the mutation.
    pub fn field(&self) -> &str {
        match self {
            Mutation::Set { field, .. } | Mutation::Copy { field, .. } => field,
        }
    }

    /// Validates the mutation against a collection schema.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidPredicate`] when the field is
    /// undeclared, is the primary key, or the value does not fit.
    pub fn validate(&self, schema: &CollectionSchema) -> Result<()> {
        let field = self.field();
        let kind = schema.kind_of(field).ok_or_else(|| {
            ReconcileError::invalid_predicate(
                &schema.name,
                format!("mutation of undeclared field '{}'", field),
            )
        })?;
        if field == schema.primary_key {
            return Err(ReconcileError::invalid_predicate(
                &schema.name,
                format!("mutation of primary key '{}'", field),
            ));
        }
        match self {
            Mutation::Set { value, .. } if !value.fits(kind) => {
                Err(ReconcileError::invalid_predicate(
                    &schema.name,
                    format!("value {:?} does not fit {} field '{}'", value, kind, field),
                ))
            }
            Mutation::Set { .. } => Ok(()),
            Mutation::Copy { from, .. } => {
                let source = schema.kind_of(from).ok_or_else(|| {
                    ReconcileError::invalid_predicate(
                        &schema.name,
                        format!("copy from undeclared field '{}'", from),
                    )
                })?;
                let widening = source == FieldKind::Integer && kind == FieldKind::Float;
                if source != kind && !widening {
                    return Err(ReconcileError::invalid_predicate(
                        &schema.name,
                        format!(
                            "cannot copy {} field '{}' into {} field '{}'",
                            source, from, kind, field
                        ),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Applies mutations to a record in place.
    ///
    /// Every copied value is read from the record as it was before the
    /// update, matching SQL `UPDATE ... SET` semantics.
    pub fn apply_all(mutations: &[Mutation], record: &mut Record) {
        let assignments: Vec<(String, Value)> = mutations
            .iter()
            .map(|m| match m {
                Mutation::Set { field, value } => (field.clone(), value.clone()),
                Mutation::Copy { field, from } => (field.clone(), record.get(from).clone()),
            })
            .collect();
        record.fields.extend(assignments);
    }
}

/// Predicate with every cross-collection lookup resolved to a value set.
///
/// Built by an in-memory evaluator once per operation so that each row is
/// checked against the same snapshot of the referenced collections.
#[derive(Debug)]
pub(crate) enum ResolvedPredicate {
    All,
    IsNull(String),
    IsBlank(String),
    Compare {
        field: String,
        op: CmpOp,
        value: Value,
    },
    CompareFields {
        left: String,
        op: CmpOp,
        right: String,
    },
    Contains {
        field: String,
        needle: String,
    },
    InSet {
        field: String,
        values: HashSet<Value>,
    },
    RowIn(BTreeSet<RowId>),
    Not(Box<ResolvedPredicate>),
    And(Vec<ResolvedPredicate>),
    Or(Vec<ResolvedPredicate>),
}

impl ResolvedPredicate {
    /// Resolves cross-collection lookups against `collections`.
    ///
    /// Null values in the referenced column are dropped, which keeps
    /// `NOT IN` semantics identical to the SQL backend.
    pub(crate) fn resolve(
        predicate: &Predicate,
        collections: &HashMap<String, Vec<Record>>,
    ) -> Result<Self> {
        Ok(match predicate {
            Predicate::All => ResolvedPredicate::All,
            Predicate::IsNull(f) => ResolvedPredicate::IsNull(f.clone()),
            Predicate::IsBlank(f) => ResolvedPredicate::IsBlank(f.clone()),
            Predicate::Compare { field, op, value } => ResolvedPredicate::Compare {
                field: field.clone(),
                op: *op,
                value: value.clone(),
            },
            Predicate::CompareFields { left, op, right } => ResolvedPredicate::CompareFields {
                left: left.clone(),
                op: *op,
                right: right.clone(),
            },
            Predicate::Contains { field, needle } => ResolvedPredicate::Contains {
                field: field.clone(),
                needle: needle.to_ascii_lowercase(),
            },
            Predicate::InCollection {
                field,
                collection,
                column,
                filter,
            } => {
                let rows = collections
                    .get(collection)
                    .ok_or_else(|| ReconcileError::unknown_collection(collection))?;
                let filter = filter
                    .as_deref()
                    .map(|f| Self::resolve(f, collections))
                    .transpose()?;
                let values = rows
                    .iter()
                    .filter(|r| filter.as_ref().is_none_or(|f| f.matches(r)))
                    .map(|r| r.get(column))
                    .filter(|v| !v.is_null())
                    .cloned()
                    .collect();
                ResolvedPredicate::InSet {
                    field: field.clone(),
                    values,
                }
            }
            Predicate::RowIn(ids) => ResolvedPredicate::RowIn(ids.clone()),
            Predicate::Not(inner) => {
                ResolvedPredicate::Not(Box::new(Self::resolve(inner, collections)?))
            }
            Predicate::And(parts) => ResolvedPredicate::And(
                parts
                    .iter()
                    .map(|p| Self::resolve(p, collections))
                    .collect::<Result<_>>()?,
            ),
            Predicate::Or(parts) => ResolvedPredicate::Or(
                parts
                    .iter()
                    .map(|p| Self::resolve(p, collections))
                    .collect::<Result<_>>()?,
            ),
        })
    }

    /// True only when the predicate is definitely true for the record.
    pub(crate) fn matches(&self, record: &Record) -> bool {
        self.eval(record) == Some(true)
    }

    /// Three-valued evaluation; `None` is SQL's UNKNOWN.
    fn eval(&self, record: &Record) -> Option<bool> {
        match self {
            ResolvedPredicate::All => Some(true),
            ResolvedPredicate::IsNull(field) => Some(record.get(field).is_null()),
            ResolvedPredicate::IsBlank(field) => Some(record.get(field).is_blank()),
            ResolvedPredicate::Compare { field, op, value } => {
                let current = record.get(field);
                if current.is_null() {
                    None
                } else {
                    Some(op.holds(current.cmp(value)))
                }
            }
            ResolvedPredicate::CompareFields { left, op, right } => {
                match (record.get(left), record.get(right)) {
                    (Value::Null, _) | (_, Value::Null) => None,
                    (a, b) => Some(op.holds(a.cmp(b))),
                }
            }
            ResolvedPredicate::Contains { field, needle } => match record.get(field) {
                Value::Null => None,
                Value::Text(s) => Some(s.to_ascii_lowercase().contains(needle.as_str())),
                other => Some(other.to_string().to_ascii_lowercase().contains(needle.as_str())),
            },
            ResolvedPredicate::InSet { field, values } => {
                let current = record.get(field);
                if current.is_null() {
                    None
                } else {
                    Some(values.contains(current))
                }
            }
            ResolvedPredicate::RowIn(ids) => Some(ids.contains(&record.row_id)),
            ResolvedPredicate::Not(inner) => inner.eval(record).map(|b| !b),
            ResolvedPredicate::And(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.eval(record) {
                        Some(false) => return Some(false),
                        None => unknown = true,
                        Some(true) => {}
                    }
                }
                if unknown { None } else { Some(true) }
            }
            ResolvedPredicate::Or(parts) => {
                let mut unknown = false;
                for part in parts {
                    match part.eval(record) {
                        Some(true) => return Some(true),
                        None => unknown = true,
                        Some(false) => {}
                    }
                }
                if unknown { None } else { Some(false) }
            }
        }
    }
}

#[cfg(test)]
mod tests;

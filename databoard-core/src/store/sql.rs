//! Compiles predicates into parameterised SQLite `WHERE` clauses.
//!
//! Identifiers are always double-quoted and values are always bound, never
//! interpolated. Null handling matches the in-memory evaluator: comparisons
//! with null are unknown, and `IN (SELECT ...)` sub-selects exclude nulls so
//! that `NOT IN` never collapses to unknown for every row.

use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;

use super::predicate::Predicate;
use crate::models::{RowId, Value};

/// Largest number of row ids bound into one `rowid IN (...)` list.
pub(crate) const ROW_ID_CHUNK: usize = 500;

/// Quotes an identifier for SQLite.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A SQL fragment with its positional parameters
#[derive(Debug, Default)]
pub(crate) struct WhereClause {
    pub(crate) sql: String,
    pub(crate) params: Vec<Value>,
}

impl WhereClause {
    pub(crate) fn compile(predicate: &Predicate) -> Self {
        let mut clause = WhereClause::default();
        let sql = clause.push(predicate);
        WhereClause { sql, ..clause }
    }

    fn push(&mut self, predicate: &Predicate) -> String {
        match predicate {
            Predicate::All => "1 = 1".to_string(),
            Predicate::IsNull(field) => format!("{} IS NULL", quote_ident(field)),
            Predicate::IsBlank(field) => {
                let col = quote_ident(field);
                format!("({col} IS NULL OR TRIM({col}) = '')")
            }
            Predicate::Compare { field, op, value } => {
                self.params.push(value.clone());
                format!("{} {} ?", quote_ident(field), op.sql())
            }
            Predicate::CompareFields { left, op, right } => {
                format!("{} {} {}", quote_ident(left), op.sql(), quote_ident(right))
            }
            Predicate::Contains { field, needle } => {
                self.params.push(Value::Text(format!(
                    "%{}%",
                    escape_like(&needle.to_ascii_lowercase())
                )));
                format!("LOWER({}) LIKE ? ESCAPE '\\'", quote_ident(field))
            }
            Predicate::InCollection {
                field,
                collection,
                column,
                filter,
            } => {
                let col = quote_ident(column);
                let mut sql = format!(
                    "{} IN (SELECT {col} FROM {} WHERE {col} IS NOT NULL",
                    quote_ident(field),
                    quote_ident(collection),
                );
                if let Some(filter) = filter {
                    let inner = self.push(filter);
                    sql.push_str(" AND ");
                    sql.push_str(&inner);
                }
                sql.push(')');
                sql
            }
            Predicate::RowIn(ids) => {
                if ids.is_empty() {
                    return "0 = 1".to_string();
                }
                let placeholders = vec!["?"; ids.len()].join(", ");
                self.params.extend(ids.iter().map(|id| Value::Int(*id)));
                format!("rowid IN ({placeholders})")
            }
            Predicate::Not(inner) => format!("NOT ({})", self.push(inner)),
            Predicate::And(parts) => self.join(parts, " AND ", "1 = 1"),
            Predicate::Or(parts) => self.join(parts, " OR ", "0 = 1"),
        }
    }

    fn join(&mut self, parts: &[Predicate], separator: &str, empty: &str) -> String {
        if parts.is_empty() {
            return empty.to_string();
        }
        let compiled: Vec<String> = parts.iter().map(|p| self.push(p)).collect();
        format!("({})", compiled.join(separator))
    }
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Splits a large top-level `RowIn` into bounded chunks.
///
/// Any other predicate is returned as a single part.
pub(crate) fn chunk_row_ids(predicate: &Predicate) -> Vec<Predicate> {
    match predicate {
        Predicate::RowIn(ids) if ids.len() > ROW_ID_CHUNK => {
            let ids: Vec<RowId> = ids.iter().copied().collect();
            ids.chunks(ROW_ID_CHUNK)
                .map(|chunk| Predicate::rows(chunk.iter().copied()))
                .collect()
        }
        other => vec![other.clone()],
    }
}

/// Binds a typed value as the next positional parameter.
pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &Value,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Int(i) => query.bind(*i),
        Value::Float(f) => query.bind(*f),
        Value::Text(s) => query.bind(s.clone()),
        Value::Date(d) => query.bind(*d),
        Value::Timestamp(t) => query.bind(*t),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::CmpOp;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_compile_compare_binds_value() {
        let clause = WhereClause::compile(
            &Predicate::is_null("unit_price")
                .or(Predicate::compare("unit_price", CmpOp::Le, 0.0)),
        );
        assert_eq!(
            clause.sql,
            "(\"unit_price\" IS NULL OR \"unit_price\" <= ?)"
        );
        assert_eq!(clause.params, vec![Value::Float(0.0)]);
    }

    #[test]
    fn test_compile_orphan_subselect_excludes_nulls() {
        let clause = WhereClause::compile(
            &Predicate::in_collection("order_id", "orders", "order_id").not(),
        );
        assert_eq!(
            clause.sql,
            "NOT (\"order_id\" IN (SELECT \"order_id\" FROM \"orders\" WHERE \"order_id\" IS NOT NULL))"
        );
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_compile_filtered_subselect_params_in_order() {
        let clause = WhereClause::compile(
            &Predicate::eq("status", "open").and(Predicate::in_filtered_collection(
                "customer_id",
                "customers",
                "customer_id",
                Predicate::contains("email", "50%_Off"),
            )),
        );
        assert!(clause.sql.contains("AND LOWER(\"email\") LIKE ? ESCAPE"));
        assert_eq!(
            clause.params,
            vec![Value::text("open"), Value::text("%50\\%\\_off%")]
        );
    }

    #[test]
    fn test_compile_field_comparison_binds_nothing() {
        let clause = WhereClause::compile(&Predicate::is_null("updated_at").or(
            Predicate::compare_fields("updated_at", CmpOp::Lt, "created_at"),
        ));
        assert_eq!(
            clause.sql,
            "(\"updated_at\" IS NULL OR \"updated_at\" < \"created_at\")"
        );
        assert!(clause.params.is_empty());
    }

    #[test]
    fn test_contains_needle_folds_ascii_only() {
        let clause = WhereClause::compile(&Predicate::contains("name", "ÉTÉ Sale"));
        assert_eq!(clause.params, vec![Value::text("%ÉtÉ sale%")]);
    }

    #[test]
    fn test_row_id_chunking() {
        let predicate = Predicate::rows(1..=(ROW_ID_CHUNK as i64 * 2 + 1));
        let chunks = chunk_row_ids(&predicate);
        assert_eq!(chunks.len(), 3);

        let empty = WhereClause::compile(&Predicate::rows(Vec::<RowId>::new()));
        assert_eq!(empty.sql, "0 = 1");

        assert_eq!(chunk_row_ids(&Predicate::All), vec![Predicate::All]);
    }
}

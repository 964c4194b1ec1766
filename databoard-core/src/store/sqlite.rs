//! SQLite entity store backed by an `sqlx` pool.
//!
//! # Connection Modes
//! - File-based: `sqlite:///path/to/shop.db`, `sqlite://./shop.db`, or a bare
//!   `*.db` / `*.sqlite` / `*.sqlite3` path
//! - In-memory: `sqlite::memory:` or `:memory:`
//!
//! Every mutation runs in its own transaction. The transaction is committed
//! only after every statement succeeded; dropping it (on error or when the
//! executor's timeout cancels the future) rolls it back.
//!
//! The pool holds a single connection: SQLite serialises writers anyway, and
//! an in-memory database only exists on the connection that created it.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::EntityStore;
use super::predicate::{Mutation, Predicate};
use super::sql::{WhereClause, bind_value, chunk_row_ids, quote_ident};
use crate::error::redact_database_url;
use crate::models::{CollectionSchema, FieldKind, Fields, Record, RowId, Value};
use crate::{ReconcileError, Result};

const ROW_ID_COLUMN: &str = "__row_id";

/// Entity store over the tables of a SQLite database
pub struct SqliteStore {
    pool: SqlitePool,
    schemas: Vec<CollectionSchema>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("collections", &self.collections())
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens a SQLite database and verifies that every declared collection
    /// exists as a table with the declared columns.
    ///
    /// # Errors
    /// Returns error if:
    /// - Connection string format is invalid
    /// - The database cannot be opened
    /// - A declared table or column is missing
    pub async fn connect(connection_string: &str, schemas: Vec<CollectionSchema>) -> Result<Self> {
        validate_sqlite_connection_string(connection_string)?;
        let normalized = normalize_connection_string(connection_string);

        let options = SqliteConnectOptions::from_str(&normalized).map_err(|e| {
            ReconcileError::configuration(format!("Invalid SQLite connection string: {}", e))
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await
            .map_err(|e| {
                ReconcileError::store_unavailable(
                    format!(
                        "Failed to open SQLite database {}",
                        redact_database_url(&normalized)
                    ),
                    e,
                )
            })?;

        info!(
            "Opened SQLite store at {}",
            redact_database_url(&normalized)
        );
        Self::from_pool(pool, schemas).await
    }

    /// Wraps an existing pool.
    ///
    /// The pool should hold a single connection when it points at an
    /// in-memory database.
    ///
    /// # Errors
    /// Returns error if a declared table or column is missing.
    pub async fn from_pool(pool: SqlitePool, schemas: Vec<CollectionSchema>) -> Result<Self> {
        for schema in &schemas {
            schema.validate()?;
        }
        let store = Self { pool, schemas };
        store.verify_schema().await?;
        Ok(store)
    }

    /// Checks every declared collection against `PRAGMA table_info`.
    ///
    /// # Errors
    /// Returns a configuration error naming the first missing table or column.
    pub async fn verify_schema(&self) -> Result<()> {
        for schema in &self.schemas {
            let rows = sqlx::query(&format!(
                "PRAGMA table_info({})",
                quote_ident(&schema.name)
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                ReconcileError::store_unavailable(
                    format!("Failed to read columns of '{}'", schema.name),
                    e,
                )
            })?;

            if rows.is_empty() {
                return Err(ReconcileError::configuration(format!(
                    "Table '{}' does not exist in the SQLite database",
                    schema.name
                )));
            }

            let columns: Vec<String> = rows
                .iter()
                .filter_map(|row| row.try_get::<String, _>("name").ok())
                .collect();
            for field in schema.field_names() {
                if !columns.iter().any(|c| c == field) {
                    return Err(ReconcileError::configuration(format!(
                        "Table '{}' has no column '{}'",
                        schema.name, field
                    )));
                }
            }
            debug!(
                "Verified table '{}' ({} columns)",
                schema.name,
                columns.len()
            );
        }
        Ok(())
    }

    /// Inserts a row and returns its `rowid`.
    ///
    /// # Errors
    /// Returns error for undeclared fields, values that do not fit, or a
    /// failed statement.
    pub async fn insert(&self, collection: &str, fields: Fields) -> Result<RowId> {
        let schema = self.require_schema(collection)?;
        for (name, value) in &fields {
            let kind = schema.kind_of(name).ok_or_else(|| {
                ReconcileError::invalid_predicate(
                    collection,
                    format!("insert of undeclared field '{}'", name),
                )
            })?;
            if !value.fits(kind) {
                return Err(ReconcileError::invalid_predicate(
                    collection,
                    format!("value {:?} does not fit {} field '{}'", value, kind, name),
                ));
            }
        }

        let sql = if fields.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote_ident(collection))
        } else {
            let columns: Vec<String> = fields.keys().map(|k| quote_ident(k)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(collection),
                columns.join(", "),
                vec!["?"; fields.len()].join(", ")
            )
        };

        let mut query = sqlx::query(&sql);
        for value in fields.values() {
            query = bind_value(query, value);
        }
        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| unavailable(collection, e))?;
        Ok(result.last_insert_rowid())
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn select_sql(&self, schema: &CollectionSchema, clause: &WhereClause) -> String {
        let columns: Vec<String> = schema.field_names().map(quote_ident).collect();
        format!(
            "SELECT rowid AS {}, {} FROM {} WHERE {} ORDER BY rowid",
            ROW_ID_COLUMN,
            columns.join(", "),
            quote_ident(&schema.name),
            clause.sql
        )
    }
}

fn unavailable(collection: &str, error: sqlx::Error) -> ReconcileError {
    ReconcileError::store_unavailable(format!("SQLite operation on '{}' failed", collection), error)
}

/// Decodes one column into a typed value.
///
/// SQLite is loosely typed, so each kind falls back to parsing the text
/// representation when the native decode does not apply.
fn decode_field(row: &SqliteRow, schema: &CollectionSchema, name: &str, kind: FieldKind) -> Result<Value> {
    let native = match kind {
        FieldKind::Integer => row.try_get::<Option<i64>, _>(name).ok().map(Value::from),
        FieldKind::Float => row
            .try_get::<Option<f64>, _>(name)
            .ok()
            .or_else(|| {
                row.try_get::<Option<i64>, _>(name)
                    .ok()
                    .map(|v| v.map(|i| i as f64))
            })
            .map(Value::from),
        FieldKind::Boolean => row
            .try_get::<Option<i64>, _>(name)
            .ok()
            .map(|v| Value::from(v.map(|i| i != 0))),
        FieldKind::Text | FieldKind::Date | FieldKind::Timestamp => None,
    };
    if let Some(value) = native {
        return Ok(value);
    }

    let text: Option<String> = match row.try_get(name) {
        Ok(text) => text,
        Err(e) => match row.try_get::<Option<f64>, _>(name) {
            Ok(number) => number.map(|n| n.to_string()),
            Err(_) => {
                return Err(ReconcileError::store_unavailable(
                    format!("Failed to decode '{}.{}'", schema.name, name),
                    e,
                ));
            }
        },
    };
    match text {
        None => Ok(Value::Null),
        Some(text) => Value::from_json(kind, &serde_json::Value::String(text)).map_err(|message| {
            ReconcileError::store_unavailable(
                format!("Failed to decode '{}.{}'", schema.name, name),
                std::io::Error::new(std::io::ErrorKind::InvalidData, message),
            )
        }),
    }
}

fn decode_record(row: &SqliteRow, schema: &CollectionSchema) -> Result<Record> {
    let row_id: i64 = row
        .try_get(ROW_ID_COLUMN)
        .map_err(|e| unavailable(&schema.name, e))?;
    let mut fields = Fields::new();
    for def in &schema.fields {
        fields.insert(def.name.clone(), decode_field(row, schema, &def.name, def.kind)?);
    }
    Ok(Record::new(row_id, fields))
}

#[async_trait]
impl EntityStore for SqliteStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn collections(&self) -> Vec<String> {
        self.schemas.iter().map(|s| s.name.clone()).collect()
    }

    fn schema(&self, collection: &str) -> Option<&CollectionSchema> {
        self.schemas.iter().find(|s| s.name == collection)
    }

    async fn count(&self, collection: &str, predicate: Option<&Predicate>) -> Result<u64> {
        let all = Predicate::All;
        let predicate = predicate.unwrap_or(&all);
        self.validate_predicate(collection, predicate)?;

        let clause = WhereClause::compile(predicate);
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quote_ident(collection),
            clause.sql
        );
        let mut query = sqlx::query(&sql);
        for value in &clause.params {
            query = bind_value(query, value);
        }
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| unavailable(collection, e))?;
        let count: i64 = row.try_get(0).map_err(|e| unavailable(collection, e))?;
        Ok(count.max(0) as u64)
    }

    async fn select(
        &self,
        collection: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<Record>> {
        let all = Predicate::All;
        let predicate = predicate.unwrap_or(&all);
        self.validate_predicate(collection, predicate)?;
        let schema = self.require_schema(collection)?;

        let clause = WhereClause::compile(predicate);
        let sql = self.select_sql(schema, &clause);
        let mut query = sqlx::query(&sql);
        for value in &clause.params {
            query = bind_value(query, value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| unavailable(collection, e))?;
        rows.iter().map(|row| decode_record(row, schema)).collect()
    }

    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64> {
        self.validate_predicate(collection, predicate)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable(collection, e))?;
        let mut removed = 0u64;
        for part in chunk_row_ids(predicate) {
            let clause = WhereClause::compile(&part);
            let sql = format!(
                "DELETE FROM {} WHERE {}",
                quote_ident(collection),
                clause.sql
            );
            let mut query = sqlx::query(&sql);
            for value in &clause.params {
                query = bind_value(query, value);
            }
            let result = query
                .execute(&mut *tx)
                .await
                .map_err(|e| unavailable(collection, e))?;
            removed += result.rows_affected();
        }
        tx.commit().await.map_err(|e| unavailable(collection, e))?;

        debug!("Deleted {} rows from '{}'", removed, collection);
        Ok(removed)
    }

    async fn update(
        &self,
        collection: &str,
        predicate: &Predicate,
        mutations: &[Mutation],
    ) -> Result<u64> {
        self.validate_predicate(collection, predicate)?;
        self.validate_mutations(collection, mutations)?;

        let clause = WhereClause::compile(predicate);
        let assignments: Vec<String> = mutations
            .iter()
            .map(|m| match m {
                Mutation::Set { field, .. } => format!("{} = ?", quote_ident(field)),
                Mutation::Copy { field, from } => {
                    format!("{} = {}", quote_ident(field), quote_ident(from))
                }
            })
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {}",
            quote_ident(collection),
            assignments.join(", "),
            clause.sql
        );

        let mut query = sqlx::query(&sql);
        for mutation in mutations {
            if let Mutation::Set { value, .. } = mutation {
                query = bind_value(query, value);
            }
        }
        for value in &clause.params {
            query = bind_value(query, value);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| unavailable(collection, e))?;
        let result = query
            .execute(&mut *tx)
            .await
            .map_err(|e| unavailable(collection, e))?;
        tx.commit().await.map_err(|e| unavailable(collection, e))?;

        debug!("Updated {} rows in '{}'", result.rows_affected(), collection);
        Ok(result.rows_affected())
    }
}

/// Validates SQLite connection string format.
///
/// # Errors
/// Returns a configuration error if the string is not a `sqlite:` URL, a
/// database file path, or `:memory:`.
pub fn validate_sqlite_connection_string(connection_string: &str) -> Result<()> {
    if connection_string == ":memory:" {
        return Ok(());
    }

    if connection_string.ends_with(".db")
        || connection_string.ends_with(".sqlite")
        || connection_string.ends_with(".sqlite3")
    {
        return Ok(());
    }

    if connection_string.starts_with("sqlite:") {
        if connection_string.contains(":memory:") || connection_string.contains("mode=memory") {
            return Ok(());
        }
        if let Ok(url) = url::Url::parse(connection_string) {
            if url.scheme() != "sqlite" {
                return Err(ReconcileError::configuration(
                    "Connection string must use sqlite:// scheme",
                ));
            }
            return Ok(());
        }
        if connection_string.starts_with("sqlite://") {
            return Ok(());
        }
    }

    Err(ReconcileError::configuration(
        "Invalid SQLite connection string format: expected sqlite:// URL, file path, or :memory:",
    ))
}

fn normalize_connection_string(connection_string: &str) -> String {
    if connection_string == ":memory:" {
        return "sqlite::memory:".to_string();
    }
    if connection_string.starts_with("sqlite:") {
        return connection_string.to_string();
    }
    format!("sqlite://{}", connection_string)
}

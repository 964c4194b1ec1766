//! Entity store abstraction over a mutable relational dataset.
//!
//! The reconciliation engine only ever talks to an [`EntityStore`]: it counts,
//! selects, deletes and updates records by predicate. Where the records live
//! (process memory, a SQLite file) is the store's business.
//!
//! # Module Structure
//! - `predicate`: predicate and mutation types shared by all stores
//! - `memory`: in-process store used by the CLI for JSON datasets and by tests
//! - `sqlite`: `sqlx`-backed store (feature `sqlite`)

use crate::models::{CollectionSchema, Record};
use crate::{ReconcileError, Result};
use async_trait::async_trait;

pub mod memory;
pub mod predicate;
#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "sqlite")]
mod sql;

pub use memory::MemoryStore;
pub use predicate::{CmpOp, Mutation, Predicate};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

/// Main trait for entity stores with object-safe design.
///
/// # Atomicity
/// Every mutating call is all-or-nothing: a failure leaves the collection
/// exactly as it was before the call.
///
/// # Object Safety
/// This trait is object-safe, allowing for dynamic dispatch through
/// `&dyn EntityStore` or `Arc<dyn EntityStore>`.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Short backend name for logs ("memory", "sqlite").
    fn backend(&self) -> &'static str;

    /// Names of all declared collections, in declaration order.
    fn collections(&self) -> Vec<String>;

    /// Schema of a declared collection.
    fn schema(&self, collection: &str) -> Option<&CollectionSchema>;

    /// Counts records, optionally restricted by a predicate.
    ///
    /// # Errors
    /// Returns error if the collection cannot be reached or the predicate is
    /// invalid for it.
    async fn count(&self, collection: &str, predicate: Option<&Predicate>) -> Result<u64>;

    /// Selects records in insertion order, optionally restricted by a predicate.
    ///
    /// # Errors
    /// Returns error if the collection cannot be reached or the predicate is
    /// invalid for it.
    async fn select(&self, collection: &str, predicate: Option<&Predicate>)
    -> Result<Vec<Record>>;

    /// Deletes every record matching the predicate and returns how many went.
    ///
    /// # Errors
    /// Returns error if the collection cannot be reached or the predicate is
    /// invalid for it. Nothing is deleted on error.
    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64>;

    /// Applies mutations to every record matching the predicate and returns
    /// how many records were touched.
    ///
    /// # Errors
    /// Returns error if the collection cannot be reached or the predicate or
    /// a mutation is invalid for it. Nothing is updated on error.
    async fn update(
        &self,
        collection: &str,
        predicate: &Predicate,
        mutations: &[Mutation],
    ) -> Result<u64>;

    /// Resolves a collection schema or fails with `UnknownCollection`.
    fn require_schema(&self, collection: &str) -> Result<&CollectionSchema> {
        self.schema(collection)
            .ok_or_else(|| ReconcileError::unknown_collection(collection))
    }

    /// Validates a predicate against the declared schemas.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidPredicate`] if it references an
    /// undeclared field or collection.
    fn validate_predicate(&self, collection: &str, predicate: &Predicate) -> Result<()> {
        let schema = self.require_schema(collection)?;
        predicate.validate(schema, &|name: &str| self.schema(name))
    }

    /// Validates mutations against the declared schema.
    ///
    /// # Errors
    /// Returns [`ReconcileError::InvalidPredicate`] for undeclared or
    /// mistyped fields.
    fn validate_mutations(&self, collection: &str, mutations: &[Mutation]) -> Result<()> {
        let schema = self.require_schema(collection)?;
        if mutations.is_empty() {
            return Err(ReconcileError::invalid_predicate(
                collection,
                "update without mutations",
            ));
        }
        mutations.iter().try_for_each(|m| m.validate(schema))
    }
}

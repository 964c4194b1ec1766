//! Core data-quality reconciliation engine for DataBoard.
//!
//! This crate cleans an e-commerce dataset held in an [`EntityStore`]: it
//! removes invalid and duplicate records, cascades deletions along foreign
//! key relations, and reports every change in an [`AuditReport`].
//!
//! # Guarantees
//! - Every rule runs between two counts taken by the executor; the report's
//!   removed counts come from those counts, not from the rule
//! - Store mutations are all-or-nothing per rule
//! - Rules only start once every rule they depend on has succeeded
//! - Connection strings are redacted before they reach logs or errors
//!
//! # Architecture
//! - [`store`]: the Entity Store trait with in-memory and SQLite backends
//! - [`rules`], [`dedup`], [`cascade`]: what a cleaning rule can do
//! - [`pipeline`]: dependency planning and concurrent execution
//! - [`audit`]: the audit trail and final report
//! - [`catalog`]: the e-commerce schemas, relations and rules

pub mod audit;
pub mod cascade;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod error;
pub mod logging;
pub mod models;
pub mod pipeline;
pub mod rules;
pub mod store;

// Re-export commonly used types
pub use audit::{AuditReport, AuditTrail, OperationRecord, QualityMetric, RuleState, RunStatus};
pub use cascade::{ForeignKey, RelationGraph};
pub use config::{CleaningConfig, ConfigValidationError};
pub use dedup::{DedupPolicy, DedupResolver, SortKey};
pub use error::{ReconcileError, Result, redact_database_url};
pub use models::{CollectionSchema, FieldKind, Fields, Record, RowId, Value};
pub use pipeline::{ExecutionPlan, ExecutorConfig, Pipeline};
pub use rules::{Bound, CleaningRule, Limit, RuleAction, RuleLogic};
pub use store::{CmpOp, EntityStore, MemoryStore, Mutation, Predicate};

#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

//! Pipeline planning and execution.
//!
//! A [`Pipeline`] is built from a rule set and the declared relations. Building
//! it resolves the dependency graph into an [`ExecutionPlan`]; running it
//! executes the plan against an [`EntityStore`](crate::store::EntityStore) and
//! returns an [`AuditReport`](crate::audit::AuditReport).
//!
//! # Example
//! ```rust,no_run
//! use databoard_core::catalog;
//! use databoard_core::config::CleaningConfig;
//! use databoard_core::store::MemoryStore;
//!
//! # async fn example() -> databoard_core::Result<()> {
//! let store = MemoryStore::new(catalog::schemas())?;
//! let pipeline = catalog::pipeline(&CleaningConfig::default())?;
//! let report = pipeline.run(&store).await?;
//! println!("{} records removed", report.total_removed);
//! # Ok(())
//! # }
//! ```

mod executor;
mod plan;

pub use executor::{ExecutorConfig, Pipeline};
pub use plan::{ExecutionPlan, PlanLevel};

//! Input datasets.
//!
//! A run reads either a directory of JSON files (one `<collection>.json` array
//! per collection) into memory, or works directly on a SQLite database.

use databoard_core::models::CollectionSchema;
use databoard_core::{EntityStore, MemoryStore, ReconcileError, Result, redact_database_url};
use std::path::Path;
use tracing::{info, warn};

#[cfg(feature = "sqlite")]
use databoard_core::SqliteStore;

/// An opened entity store
#[derive(Debug)]
pub enum DataSource {
    /// JSON dataset loaded into memory
    Memory(MemoryStore),
    /// SQLite database cleaned in place
    #[cfg(feature = "sqlite")]
    Sqlite(SqliteStore),
}

impl DataSource {
    /// Opens `input`: a directory is read as a JSON dataset, anything else is
    /// treated as a SQLite connection string or database path.
    ///
    /// # Errors
    /// Returns error if the dataset cannot be read or the database cannot be
    /// opened with the given schemas.
    pub async fn open(input: &str, schemas: Vec<CollectionSchema>) -> Result<Self> {
        let path = Path::new(input);
        if path.is_dir() {
            return load_json_dir(path, schemas).map(DataSource::Memory);
        }

        #[cfg(feature = "sqlite")]
        {
            info!("Opening SQLite database {}", redact_database_url(input));
            SqliteStore::connect(input, schemas)
                .await
                .map(DataSource::Sqlite)
        }
        #[cfg(not(feature = "sqlite"))]
        {
            let _ = schemas;
            Err(ReconcileError::configuration(format!(
                "{} is not a dataset directory and SQLite support is not compiled in",
                redact_database_url(input)
            )))
        }
    }

    /// The store behind this source.
    pub fn store(&self) -> &dyn EntityStore {
        match self {
            DataSource::Memory(store) => store,
            #[cfg(feature = "sqlite")]
            DataSource::Sqlite(store) => store,
        }
    }

    /// Releases the source; closes the SQLite pool.
    pub async fn close(self) {
        match self {
            DataSource::Memory(_) => {}
            #[cfg(feature = "sqlite")]
            DataSource::Sqlite(store) => store.close().await,
        }
    }
}

/// Loads `<dir>/<collection>.json` for every schema.
///
/// A missing file leaves its collection empty.
///
/// # Errors
/// Returns error if a file cannot be read, is not a JSON array, or holds a
/// row that does not fit its schema.
pub fn load_json_dir(dir: &Path, schemas: Vec<CollectionSchema>) -> Result<MemoryStore> {
    let names: Vec<String> = schemas.iter().map(|s| s.name.clone()).collect();
    let store = MemoryStore::new(schemas)?;

    for name in names {
        let path = dir.join(format!("{}.json", name));
        if !path.exists() {
            warn!("No {} in dataset; '{}' starts empty", path.display(), name);
            continue;
        }
        let text = std::fs::read_to_string(&path).map_err(|e| ReconcileError::Io {
            context: format!("Failed to read {}", path.display()),
            source: e,
        })?;
        let rows: Vec<serde_json::Value> =
            serde_json::from_str(&text).map_err(|e| ReconcileError::Serialization {
                context: format!("{} is not a JSON array of objects", path.display()),
                source: e,
            })?;
        let loaded = store.load_json_rows(&name, &rows)?;
        info!("Loaded {} records into '{}'", loaded, name);
    }

    Ok(store)
}

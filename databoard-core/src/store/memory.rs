//! In-process entity store.
//!
//! All collections live behind a single `RwLock`. Reads take a shared lock;
//! mutations resolve their predicate against a snapshot of every collection,
//! compute the surviving rows, and only then replace the target collection, so
//! an error never leaves a half-applied change behind.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use super::EntityStore;
use super::predicate::{Mutation, Predicate, ResolvedPredicate};
use crate::models::{CollectionSchema, Fields, Record, RowId, Value};
use crate::{ReconcileError, Result};

type Collections = HashMap<String, Vec<Record>>;

/// Entity store holding every collection in memory
#[derive(Debug)]
pub struct MemoryStore {
    schemas: Vec<CollectionSchema>,
    data: RwLock<Collections>,
    next_row_id: AtomicI64,
}

impl MemoryStore {
    /// Creates an empty store for the given collections.
    ///
    /// # Errors
    /// Returns a configuration error if a schema is inconsistent or two
    /// collections share a name.
    pub fn new(schemas: Vec<CollectionSchema>) -> Result<Self> {
        let mut data = Collections::new();
        for schema in &schemas {
            schema.validate()?;
            if data.insert(schema.name.clone(), Vec::new()).is_some() {
                return Err(ReconcileError::configuration(format!(
                    "Collection '{}' declared twice",
                    schema.name
                )));
            }
        }
        Ok(Self {
            schemas,
            data: RwLock::new(data),
            next_row_id: AtomicI64::new(1),
        })
    }

    /// Appends a record and returns its row id.
    ///
    /// Undeclared fields are rejected; missing declared fields become null.
    /// Primary keys are not checked for uniqueness: loading dirty data is the
    /// point.
    ///
    /// # Errors
    /// Returns an error for unknown collections, undeclared fields, or
    /// values that do not fit their field kind.
    pub fn insert(&self, collection: &str, fields: Fields) -> Result<RowId> {
        let schema = self.require_schema(collection)?;
        let mut row = Fields::new();
        for def in &schema.fields {
            row.insert(def.name.clone(), Value::Null);
        }
        for (name, value) in fields {
            let kind = schema.kind_of(&name).ok_or_else(|| {
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
            row.insert(name, value);
        }

        let row_id = self.next_row_id.fetch_add(1, Ordering::Relaxed);
        let mut data = self.write(collection)?;
        data.entry(collection.to_string())
            .or_default()
            .push(Record::new(row_id, row));
        Ok(row_id)
    }

    /// Loads JSON objects into a collection.
    ///
    /// # Errors
    /// Returns an error on the first row that does not fit the schema; rows
    /// before it stay loaded.
    pub fn load_json_rows(&self, collection: &str, rows: &[serde_json::Value]) -> Result<usize> {
        let schema = self.require_schema(collection)?;
        let parsed = rows
            .iter()
            .map(|row| schema.fields_from_json(row))
            .collect::<Result<Vec<_>>>()?;
        let loaded = parsed.len();
        for fields in parsed {
            self.insert(collection, fields)?;
        }
        debug!("Loaded {} rows into '{}'", loaded, collection);
        Ok(loaded)
    }

    fn read(&self, collection: &str) -> Result<RwLockReadGuard<'_, Collections>> {
        self.data.read().map_err(|_| poisoned(collection))
    }

    fn write(&self, collection: &str) -> Result<RwLockWriteGuard<'_, Collections>> {
        self.data.write().map_err(|_| poisoned(collection))
    }
}

fn poisoned(collection: &str) -> ReconcileError {
    ReconcileError::store_unavailable(
        format!("memory store lock poisoned while accessing '{}'", collection),
        std::io::Error::other("lock poisoned"),
    )
}

fn rows_of<'a>(data: &'a Collections, collection: &str) -> Result<&'a Vec<Record>> {
    data.get(collection)
        .ok_or_else(|| ReconcileError::unknown_collection(collection))
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
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
        let data = self.read(collection)?;
        let resolved = ResolvedPredicate::resolve(predicate, &data)?;
        let count = rows_of(&data, collection)?
            .iter()
            .filter(|r| resolved.matches(r))
            .count();
        Ok(count as u64)
    }

    async fn select(
        &self,
        collection: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<Record>> {
        let all = Predicate::All;
        let predicate = predicate.unwrap_or(&all);
        self.validate_predicate(collection, predicate)?;
        let data = self.read(collection)?;
        let resolved = ResolvedPredicate::resolve(predicate, &data)?;
        Ok(rows_of(&data, collection)?
            .iter()
            .filter(|r| resolved.matches(r))
            .cloned()
            .collect())
    }

    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64> {
        self.validate_predicate(collection, predicate)?;
        let mut data = self.write(collection)?;
        let resolved = ResolvedPredicate::resolve(predicate, &data)?;
        let (removed, kept): (Vec<Record>, Vec<Record>) = rows_of(&data, collection)?
            .iter()
            .cloned()
            .partition(|r| resolved.matches(r));

        if !removed.is_empty() {
            data.insert(collection.to_string(), kept);
        }
        debug!("Deleted {} rows from '{}'", removed.len(), collection);
        Ok(removed.len() as u64)
    }

    async fn update(
        &self,
        collection: &str,
        predicate: &Predicate,
        mutations: &[Mutation],
    ) -> Result<u64> {
        self.validate_predicate(collection, predicate)?;
        self.validate_mutations(collection, mutations)?;
        let mut data = self.write(collection)?;
        let resolved = ResolvedPredicate::resolve(predicate, &data)?;

        let mut affected = 0u64;
        let updated: Vec<Record> = rows_of(&data, collection)?
            .iter()
            .cloned()
            .map(|mut record| {
                if resolved.matches(&record) {
                    affected += 1;
                    Mutation::apply_all(mutations, &mut record);
                }
                record
            })
            .collect();

        if affected > 0 {
            data.insert(collection.to_string(), updated);
        }
        debug!("Updated {} rows in '{}'", affected, collection);
        Ok(affected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldKind;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::new(vec![
            CollectionSchema::new("customers", "customer_id", FieldKind::Text)
                .with_field("email", FieldKind::Text),
            CollectionSchema::new("orders", "order_id", FieldKind::Text)
                .with_field("customer_id", FieldKind::Text)
                .with_field("total", FieldKind::Float),
        ])
        .unwrap();
        store
            .load_json_rows(
                "customers",
                &[
                    json!({"customer_id": "C1", "email": "a@shop.io"}),
                    json!({"customer_id": "C2", "email": null}),
                ],
            )
            .unwrap();
        store
            .load_json_rows(
                "orders",
                &[
                    json!({"order_id": "O1", "customer_id": "C1", "total": 10.0}),
                    json!({"order_id": "O1", "customer_id": "C1", "total": 12.0}),
                    json!({"order_id": "O2", "customer_id": "C9", "total": -1.0}),
                    json!({"order_id": "O3", "customer_id": null, "total": null}),
                ],
            )
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_count_and_select() {
        let store = store();
        assert_eq!(store.count("orders", None).await.unwrap(), 4);

        let orphans = Predicate::in_collection("customer_id", "customers", "customer_id").not();
        let rows = store.select("orders", Some(&orphans)).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("order_id"), &Value::text("O2"));
    }

    #[tokio::test]
    async fn test_row_ids_distinguish_duplicate_keys() {
        let store = store();
        let dupes = store
            .select("orders", Some(&Predicate::eq("order_id", "O1")))
            .await
            .unwrap();
        assert_eq!(dupes.len(), 2);
        assert_ne!(dupes[0].row_id, dupes[1].row_id);

        let removed = store
            .delete("orders", &Predicate::rows([dupes[1].row_id]))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        let left = store
            .select("orders", Some(&Predicate::eq("order_id", "O1")))
            .await
            .unwrap();
        assert_eq!(left, vec![dupes[0].clone()]);
    }

    #[tokio::test]
    async fn test_delete_preserves_insertion_order() {
        let store = store();
        let removed = store
            .delete("orders", &Predicate::compare("total", crate::store::CmpOp::Lt, 0.0))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let ids: Vec<_> = store
            .select("orders", None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.get("order_id").to_string())
            .collect();
        assert_eq!(ids, vec!["O1", "O1", "O3"]);
    }

    #[tokio::test]
    async fn test_invalid_predicate_changes_nothing() {
        let store = store();
        let err = store
            .delete("orders", &Predicate::is_null("shipping"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidPredicate { .. }));
        assert_eq!(store.count("orders", None).await.unwrap(), 4);

        let err = store.count("refunds", None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::UnknownCollection { .. }));
    }

    #[tokio::test]
    async fn test_update_by_predicate() {
        let store = store();
        let affected = store
            .update(
                "customers",
                &Predicate::is_null("email"),
                &[Mutation::set("email", "unknown@shop.io")],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(
            store
                .count("customers", Some(&Predicate::is_null("email")))
                .await
                .unwrap(),
            0
        );

        assert!(
            store
                .update("customers", &Predicate::All, &[])
                .await
                .is_err()
        );
        assert!(
            store
                .update(
                    "customers",
                    &Predicate::All,
                    &[Mutation::set("customer_id", "X")]
                )
                .await
                .is_err()
        );
    }

    #[test]
    fn test_insert_rejects_bad_rows() {
        let store = store();
        let mut fields = Fields::new();
        fields.insert("nickname".into(), Value::text("x"));
        assert!(store.insert("customers", fields).is_err());

        let mut fields = Fields::new();
        fields.insert("total".into(), Value::text("lots"));
        assert!(store.insert("orders", fields).is_err());

        assert!(
            MemoryStore::new(vec![
                CollectionSchema::new("a", "id", FieldKind::Integer),
                CollectionSchema::new("a", "id", FieldKind::Integer),
            ])
            .is_err()
        );
    }

    #[test]
    fn test_trait_is_object_safe() {
        let store = store();
        let dyn_store: &dyn EntityStore = &store;
        assert_eq!(dyn_store.backend(), "memory");
        assert_eq!(dyn_store.collections(), vec!["customers", "orders"]);
    }
}

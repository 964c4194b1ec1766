//! End-to-end reconciliation scenarios over the in-memory store.
//!
//! This test suite covers:
//! - The full e-commerce catalog on a small dirty dataset
//! - Duplicate and blank primary keys in every collection
//! - Idempotence and determinism of a run
//! - Dependency ordering, cycle rejection and count conservation
//! - Timeouts, cancellation and store failures
//! - Same-collection rules never overlapping in time

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use chrono::NaiveDate;
use databoard_core::{
    AuditReport, Bound, CleaningConfig, CleaningRule, EntityStore, ExecutorConfig, ForeignKey,
    MemoryStore, Mutation, Pipeline, Predicate, Record, ReconcileError, RelationGraph, Result,
    RuleLogic, RuleState, RunStatus, Value, catalog, models::CollectionSchema,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn config() -> CleaningConfig {
    CleaningConfig::new().with_reference_date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
}

fn dataset() -> Vec<(&'static str, Vec<serde_json::Value>)> {
    vec![
        (
            "customers",
            vec![
                json!({"customer_id": "C1", "name": "Alice", "email": "alice@shop.io", "created_at": "2022-01-01T00:00:00"}),
                json!({"customer_id": "C1", "name": "Alice B.", "email": "alice@shop.io", "created_at": "2022-06-01T00:00:00"}),
                json!({"customer_id": "C2", "name": "Bob", "email": "bob@shop.io", "created_at": "2022-02-01T00:00:00"}),
                json!({"customer_id": "C3", "name": "Test User", "email": "qa@shop.io", "created_at": "2022-02-01T00:00:00"}),
                json!({"customer_id": "C4", "name": "Bobby", "email": "bob@shop.io", "created_at": "2022-03-01T00:00:00"}),
                json!({"customer_id": "C5", "name": "Carol", "email": "carol@example.com", "created_at": "2022-03-01T00:00:00"}),
                json!({"customer_id": " ", "name": "Nobody", "email": "nobody@shop.io", "created_at": "2022-03-01T00:00:00"}),
            ],
        ),
        (
            "products",
            vec![
                json!({"product_id": "P1", "name": "Widget", "category": "tools", "is_active": true, "created_at": "2022-01-01T00:00:00"}),
                json!({"product_id": "P2", "name": "Gadget", "category": "tools", "is_active": true, "created_at": "2022-01-01T00:00:00"}),
                json!({"product_id": "P3", "name": "Gizmo", "category": "toys", "is_active": true, "created_at": "2023-12-01T00:00:00"}),
            ],
        ),
        (
            "orders",
            vec![
                json!({"order_id": "O1", "customer_id": "C1", "order_date": "2023-01-01", "status": "shipped"}),
                json!({"order_id": "O1", "customer_id": "C1", "order_date": "2023-06-01", "status": "shipped"}),
                json!({"order_id": "O2", "customer_id": "C2", "order_date": "2023-05-01", "status": "shipped"}),
                json!({"order_id": "O3", "customer_id": "C4", "order_date": "2023-05-02", "status": "shipped"}),
                json!({"order_id": "O4", "customer_id": "C1", "order_date": "2030-01-01", "status": "new"}),
                json!({"order_id": "O5", "customer_id": "C2", "order_date": "2023-07-01", "status": "new"}),
                json!({"order_id": "O6", "customer_id": "C2", "order_date": "2023-08-01", "status": "new"}),
                json!({"order_id": "O7", "customer_id": "C2", "order_date": "2023-09-01", "status": "new"}),
            ],
        ),
        (
            "order_items",
            vec![
                json!({"item_id": "I1", "order_id": "O1", "product_id": "P1", "quantity": 2, "unit_price": 10.0}),
                json!({"item_id": "I2", "order_id": "O2", "product_id": "P1", "quantity": 1, "unit_price": 5.0}),
                json!({"item_id": "I3", "order_id": "O3", "product_id": "P1", "quantity": 1, "unit_price": 5.0}),
                json!({"item_id": "I4", "order_id": "O9", "product_id": "P1", "quantity": 1, "unit_price": 5.0}),
                json!({"item_id": "I5", "order_id": "O5", "product_id": "P1", "quantity": 1, "unit_price": -3.0}),
                json!({"item_id": "I6", "order_id": "O2", "product_id": "P9", "quantity": 1, "unit_price": 5.0}),
                json!({"item_id": "I7", "order_id": "O2", "product_id": "P1", "quantity": 0, "unit_price": 5.0}),
                json!({"item_id": "I8", "order_id": "O7", "product_id": "P1", "quantity": 1, "unit_price": 0.5}),
            ],
        ),
        (
            "payments",
            vec![
                json!({"payment_id": "PA1", "order_id": "O1", "attempt": 1, "status": "failed", "paid_amount": 10.0, "payment_date": "2023-06-01T10:00:00"}),
                json!({"payment_id": "PA2", "order_id": "O1", "attempt": 2, "status": "paid", "paid_amount": 20.0, "payment_date": "2023-06-01T11:00:00"}),
                json!({"payment_id": "PA3", "order_id": "O2", "attempt": 1, "status": "pending", "paid_amount": 5.0, "payment_date": "2023-05-01T10:00:00"}),
                json!({"payment_id": "PA4", "order_id": "O2", "attempt": 2, "status": "pending", "paid_amount": 5.0, "payment_date": "2023-05-02T10:00:00"}),
                json!({"payment_id": "PA5", "order_id": "O5", "attempt": 1, "status": "paid", "paid_amount": 1.0, "payment_date": "2023-07-01T10:00:00"}),
                json!({"payment_id": "PA6", "order_id": "O2", "attempt": 3, "status": "paid", "paid_amount": -1.0, "payment_date": "2023-05-03T10:00:00"}),
                json!({"payment_id": "PA7", "order_id": "O7", "attempt": 1, "status": "paid", "paid_amount": 0.5, "payment_date": "2023-09-01T10:00:00"}),
            ],
        ),
    ]
}

fn load(reversed: bool) -> MemoryStore {
    load_rows(dataset(), reversed)
}

fn load_rows(rows: Vec<(&'static str, Vec<serde_json::Value>)>, reversed: bool) -> MemoryStore {
    let store = MemoryStore::new(catalog::schemas()).unwrap();
    for (collection, mut rows) in rows {
        if reversed {
            rows.reverse();
        }
        store.load_json_rows(collection, &rows).unwrap();
    }
    store
}

async fn ids(store: &dyn EntityStore, collection: &str, key: &str) -> Vec<String> {
    let mut ids: Vec<String> = store
        .select(collection, None)
        .await
        .unwrap()
        .iter()
        .map(|r| r.get(key).to_string())
        .collect();
    ids.sort();
    ids
}

/// Records without row ids, sorted, for comparing runs.
async fn snapshot(store: &dyn EntityStore) -> Vec<(String, Vec<String>)> {
    let mut collections = Vec::new();
    for collection in store.collections() {
        let mut rows: Vec<String> = store
            .select(&collection, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r: Record| serde_json::to_string(&r.fields).unwrap())
            .collect();
        rows.sort();
        collections.push((collection, rows));
    }
    collections
}

async fn run_catalog(store: &MemoryStore) -> AuditReport {
    catalog::pipeline(&config()).unwrap().run(store).await.unwrap()
}

#[tokio::test]
async fn test_catalog_cleans_dataset() {
    let store = load(false);
    let report = run_catalog(&store).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert!(report.failed_rules.is_empty());
    assert_eq!(report.residual_violations(), 0);
    assert!(report.ensure_consistent().is_ok());

    assert_eq!(ids(&store, "customers", "customer_id").await, vec!["C1", "C2"]);
    assert_eq!(ids(&store, "orders", "order_id").await, vec!["O1", "O2"]);
    assert_eq!(ids(&store, "order_items", "item_id").await, vec!["I1", "I2"]);
    assert_eq!(ids(&store, "payments", "payment_id").await, vec!["PA2", "PA4"]);
    assert_eq!(report.final_counts["products"], 3);

    let archived = store
        .select("products", Some(&Predicate::eq("is_active", false)))
        .await
        .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(archived[0].get("product_id"), &Value::text("P2"));

    let archive = report.operation("products.archive_inactive").unwrap();
    assert_eq!((archive.before, archive.after, archive.removed), (3, 2, 1));

    // The later duplicate of C1 survives.
    let alice = store
        .select("customers", Some(&Predicate::eq("customer_id", "C1")))
        .await
        .unwrap();
    assert_eq!(alice[0].get("name"), &Value::text("Alice B."));
}

#[tokio::test]
async fn test_test_orders_removed_with_their_items_and_payments() {
    let store = load(false);
    let report = run_catalog(&store).await;

    assert_eq!(report.operation("orders.remove_test_orders").unwrap().removed, 1);
    assert_eq!(
        store
            .count("order_items", Some(&Predicate::eq("order_id", "O7")))
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        store
            .count("payments", Some(&Predicate::eq("order_id", "O7")))
            .await
            .unwrap(),
        0
    );
    // Orders without items are left to the required-items rule.
    assert_eq!(report.operation("orders.require_items").unwrap().removed, 2);
}

#[tokio::test]
async fn test_quality_metrics_reported() {
    let store = load(false);
    let report = run_catalog(&store).await;

    assert_eq!(report.data_quality_metrics.len(), 2);
    assert_eq!(report.data_quality_metrics["complete_orders_percentage"], 100.0);
    // O1 has a paid payment, O2 only a pending one.
    assert_eq!(report.data_quality_metrics["payment_completion_rate"], 50.0);
}

#[tokio::test]
async fn test_update_times_normalized() {
    let store = load(false);
    let report = run_catalog(&store).await;

    assert_eq!(report.operation("customers.normalize_updated_at").unwrap().removed, 2);
    assert_eq!(report.operation("products.normalize_updated_at").unwrap().removed, 3);
    for collection in ["customers", "products"] {
        for record in store.select(collection, None).await.unwrap() {
            assert_eq!(record.get("updated_at"), record.get("created_at"));
        }
    }
}

#[tokio::test]
async fn test_duplicate_and_blank_keys_removed_in_every_collection() {
    let mut rows = dataset();
    for (collection, records) in rows.iter_mut() {
        match *collection {
            "order_items" => {
                records.push(json!({"item_id": "I1", "order_id": "O1", "product_id": "P1", "quantity": 3, "unit_price": 10.0}));
                records.push(json!({"item_id": null, "order_id": "O1", "product_id": "P1", "quantity": 1, "unit_price": 5.0}));
            }
            "payments" => {
                records.push(json!({"payment_id": "PA2", "order_id": "O2", "attempt": 1, "status": "failed", "paid_amount": 5.0, "payment_date": "2023-05-01T09:00:00"}));
            }
            _ => {}
        }
    }
    let store = load_rows(rows, false);
    let report = run_catalog(&store).await;

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.residual_violations(), 0);
    assert!(report.key_violations.iter().all(|v| v.count == 0));
    assert_eq!(report.operation("order_items.remove_invalid_ids").unwrap().removed, 1);
    assert_eq!(report.operation("order_items.dedup_by_id").unwrap().removed, 1);
    assert_eq!(report.operation("payments.dedup_by_id").unwrap().removed, 1);

    assert_eq!(ids(&store, "orders", "order_id").await, vec!["O1", "O2"]);
    assert_eq!(ids(&store, "order_items", "item_id").await, vec!["I1", "I2"]);
    assert_eq!(ids(&store, "payments", "payment_id").await, vec!["PA2", "PA4"]);

    // The paid PA2 outranks the failed one.
    let pa2 = store
        .select("payments", Some(&Predicate::eq("payment_id", "PA2")))
        .await
        .unwrap();
    assert_eq!(pa2[0].get("order_id"), &Value::text("O1"));
}

#[tokio::test]
async fn test_most_recent_order_wins() {
    let store = load(false);
    run_catalog(&store).await;

    let o1 = store
        .select("orders", Some(&Predicate::eq("order_id", "O1")))
        .await
        .unwrap();
    assert_eq!(o1.len(), 1);
    assert_eq!(
        o1[0].get("order_date"),
        &Value::from(NaiveDate::from_ymd_opt(2023, 6, 1).unwrap())
    );
}

#[tokio::test]
async fn test_orphan_items_removed() {
    let store = load(false);
    let report = run_catalog(&store).await;

    assert_eq!(
        store
            .count("order_items", Some(&Predicate::eq("order_id", "O9")))
            .await
            .unwrap(),
        0
    );
    let relation = report
        .integrity_violation("order_items.order_id -> orders.order_id")
        .unwrap();
    assert_eq!(relation.count, 0);
    assert!(report.integrity_violations.iter().all(|v| v.count == 0));
}

#[tokio::test]
async fn test_second_run_changes_nothing() {
    let store = load(false);
    let first = run_catalog(&store).await;
    let after_first = snapshot(&store).await;

    let second = run_catalog(&store).await;
    assert_eq!(second.total_removed, 0);
    assert!(second.operations.iter().all(|op| op.removed == 0));
    assert_eq!(second.final_counts, first.final_counts);
    assert_eq!(snapshot(&store).await, after_first);
}

#[tokio::test]
async fn test_input_order_does_not_matter() {
    let forward = load(false);
    let reversed = load(true);
    run_catalog(&forward).await;
    run_catalog(&reversed).await;

    assert_eq!(snapshot(&forward).await, snapshot(&reversed).await);
}

#[tokio::test]
async fn test_counts_are_conserved() {
    let store = load(false);
    let report = run_catalog(&store).await;

    assert_eq!(report.operations.len(), 25);
    for op in &report.operations {
        assert!(op.after <= op.before, "{} grew", op.rule_id);
        assert_eq!(op.before - op.after, op.removed, "{}", op.rule_id);
    }
    assert_eq!(
        report.total_removed,
        report.operations.iter().map(|op| op.removed).sum::<u64>()
    );
}

#[tokio::test]
async fn test_no_rule_runs_before_its_dependencies() {
    let store = load(false);
    let pipeline = catalog::pipeline(&config()).unwrap();
    let report = pipeline.run(&store).await.unwrap();

    for rule in pipeline.rules() {
        let started = report
            .transitions
            .iter()
            .position(|t| t.rule_id == rule.id && t.to == RuleState::Running)
            .unwrap();
        for dependency in &rule.depends_on {
            let finished = report
                .transitions
                .iter()
                .position(|t| &t.rule_id == dependency && t.to == RuleState::Succeeded)
                .unwrap();
            assert!(finished < started, "{} started before {}", rule.id, dependency);
        }
    }
}

fn items_store() -> MemoryStore {
    let store = MemoryStore::new(vec![
        CollectionSchema::new("orders", "order_id", databoard_core::FieldKind::Text),
        CollectionSchema::new("order_items", "item_id", databoard_core::FieldKind::Text)
            .with_field("order_id", databoard_core::FieldKind::Text)
            .with_field("unit_price", databoard_core::FieldKind::Float),
    ])
    .unwrap();
    store
        .load_json_rows("orders", &[json!({"order_id": "O1"})])
        .unwrap();
    store
        .load_json_rows(
            "order_items",
            &[
                json!({"item_id": "I1", "order_id": "O1", "unit_price": 3.0}),
                json!({"item_id": "I2", "order_id": "O1", "unit_price": -3.0}),
                json!({"item_id": "I3", "order_id": "O9", "unit_price": 3.0}),
            ],
        )
        .unwrap();
    store
}

fn item_relations() -> RelationGraph {
    RelationGraph::new(vec![ForeignKey::new(
        "order_items",
        "order_id",
        "orders",
        "order_id",
    )])
    .unwrap()
}

#[tokio::test]
async fn test_price_rule_runs_before_dependent_cascade() {
    let store = items_store();
    let rules = vec![
        CleaningRule::cascade(
            "items.cascade",
            ForeignKey::new("order_items", "order_id", "orders", "order_id"),
        )
        .justified_by("items need orders")
        .after(["items.price"]),
        CleaningRule::enforce_bounds("items.price", "order_items", "unit_price", Bound::positive())
            .justified_by("prices are positive"),
    ];
    let pipeline = Pipeline::new(rules, item_relations()).unwrap();
    assert_eq!(pipeline.plan().order(), vec!["items.price", "items.cascade"]);

    let report = pipeline.run(&store).await.unwrap();
    assert_eq!(report.operations[0].rule_id, "items.price");
    assert_eq!(report.operations[0].removed, 1);
    assert_eq!(report.operations[1].rule_id, "items.cascade");
    assert_eq!(report.operations[1].removed, 1);
    assert_eq!(store.count("order_items", None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_cycle_rejected_before_any_rule_runs() {
    let rules = vec![
        CleaningRule::delete_where("a", "order_items", Predicate::All)
            .justified_by("t")
            .after(["b"]),
        CleaningRule::delete_where("b", "order_items", Predicate::All)
            .justified_by("t")
            .after(["a"]),
    ];
    let err = Pipeline::new(rules, item_relations()).unwrap_err();
    assert!(matches!(err, ReconcileError::CyclicRuleGraph { .. }));
    assert!(err.is_configuration());
}

/// Records start and end instants of every apply call.
#[derive(Debug)]
struct Recorder {
    name: &'static str,
    events: Arc<Mutex<Vec<(&'static str, Instant, Instant)>>>,
    delay: Duration,
}

#[async_trait]
impl RuleLogic for Recorder {
    async fn apply(&self, _store: &dyn EntityStore, _target: &str) -> Result<u64> {
        let start = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.events
            .lock()
            .unwrap()
            .push((self.name, start, Instant::now()));
        Ok(0)
    }
}

#[tokio::test(start_paused = true)]
async fn test_same_collection_rules_never_overlap() {
    let store = items_store();
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorder = |name: &'static str, target: &str| {
        CleaningRule::custom(
            name,
            target,
            Arc::new(Recorder {
                name,
                events: Arc::clone(&events),
                delay: Duration::from_secs(1),
            }),
        )
        .justified_by("t")
    };
    let rules = vec![
        recorder("items.a", "order_items"),
        recorder("items.b", "order_items"),
        recorder("orders.a", "orders"),
    ];
    let pipeline = Pipeline::new(rules, item_relations()).unwrap();
    let report = pipeline.run(&store).await.unwrap();
    assert_eq!(report.status, RunStatus::Succeeded);

    let events = events.lock().unwrap().clone();
    let span = |name: &str| {
        events
            .iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, s, e)| (*s, *e))
            .unwrap()
    };
    let (a_start, a_end) = span("items.a");
    let (b_start, b_end) = span("items.b");
    assert!(a_end <= b_start || b_end <= a_start);

    // Rules on different collections share a batch.
    let (o_start, _) = span("orders.a");
    assert_eq!(o_start, a_start);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_rule_and_skips_dependants() {
    let store = items_store();
    let events = Arc::new(Mutex::new(Vec::new()));
    let slow = CleaningRule::custom(
        "items.slow",
        "order_items",
        Arc::new(Recorder {
            name: "items.slow",
            events: Arc::clone(&events),
            delay: Duration::from_secs(120),
        }),
    )
    .justified_by("t");
    let rules = vec![
        slow,
        CleaningRule::delete_where("items.after_slow", "order_items", Predicate::All)
            .justified_by("t")
            .after(["items.slow"]),
        CleaningRule::delete_where("orders.sibling", "orders", Predicate::eq("order_id", "O7"))
            .justified_by("t"),
    ];
    let config = ExecutorConfig {
        rule_timeout: Duration::from_secs(10),
        max_concurrency: 4,
    };
    let pipeline = Pipeline::with_config(rules, item_relations(), config).unwrap();
    let report = pipeline.run(&store).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed_rule_ids, vec!["items.slow"]);
    assert_eq!(report.final_state("items.after_slow"), Some(RuleState::Skipped));
    assert_eq!(report.final_state("orders.sibling"), Some(RuleState::Succeeded));
    assert_eq!(store.count("order_items", None).await.unwrap(), 3);
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancellation_skips_remaining_rules() {
    let store = load(false);
    let pipeline = catalog::pipeline(&config()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline.run_with_cancel(&store, cancel).await.unwrap();
    assert_eq!(report.status, RunStatus::PartiallyFailed);
    assert_eq!(report.skipped_rules.len(), 25);
    assert!(report.skipped_rules.iter().all(|s| s.reason == "cancelled"));
    assert!(report.operations.is_empty());
    assert_eq!(report.final_counts["customers"], 7);
}

/// Delegates to a memory store but cannot delete from one collection.
struct FlakyStore {
    inner: MemoryStore,
    broken: &'static str,
}

#[async_trait]
impl EntityStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    fn collections(&self) -> Vec<String> {
        self.inner.collections()
    }

    fn schema(&self, collection: &str) -> Option<&CollectionSchema> {
        self.inner.schema(collection)
    }

    async fn count(&self, collection: &str, predicate: Option<&Predicate>) -> Result<u64> {
        self.inner.count(collection, predicate).await
    }

    async fn select(
        &self,
        collection: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<Record>> {
        self.inner.select(collection, predicate).await
    }

    async fn delete(&self, collection: &str, predicate: &Predicate) -> Result<u64> {
        if collection == self.broken {
            return Err(ReconcileError::store_unavailable(
                format!("Lost connection while deleting from '{}'", collection),
                std::io::Error::other("connection reset"),
            ));
        }
        self.inner.delete(collection, predicate).await
    }

    async fn update(
        &self,
        collection: &str,
        predicate: &Predicate,
        mutations: &[Mutation],
    ) -> Result<u64> {
        self.inner.update(collection, predicate, mutations).await
    }
}

#[tokio::test]
async fn test_store_failure_fails_rule_and_keeps_report() {
    let store = FlakyStore {
        inner: load(false),
        broken: "order_items",
    };
    let report = catalog::pipeline(&config())
        .unwrap()
        .run(&store)
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.failed_rule_ids.contains(&"order_items.enforce_quantity".to_string()));
    assert!(
        report
            .failed_rules
            .iter()
            .any(|f| f.error.contains("Lost connection"))
    );
    // Customers are cleaned regardless.
    assert!(report.operation("customers.dedup_by_email").is_some());
    assert_eq!(
        report.final_state("order_items.cascade_orders"),
        Some(RuleState::Skipped)
    );
    assert_eq!(report.final_counts["order_items"], 8);
}

//! Tests for predicate validation and three-valued evaluation.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::*;
use crate::models::{FieldKind, Fields};

fn orders_schema() -> CollectionSchema {
    CollectionSchema::new("orders", "order_id", FieldKind::Text)
        .with_field("customer_id", FieldKind::Text)
        .with_field("total", FieldKind::Float)
        .with_field("note", FieldKind::Text)
}

fn customers_schema() -> CollectionSchema {
    CollectionSchema::new("customers", "customer_id", FieldKind::Text)
        .with_field("email", FieldKind::Text)
}

fn record(row_id: RowId, pairs: &[(&str, Value)]) -> Record {
    let fields: Fields = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Record::new(row_id, fields)
}

fn resolve(predicate: &Predicate, collections: &HashMap<String, Vec<Record>>) -> ResolvedPredicate {
    ResolvedPredicate::resolve(predicate, collections).unwrap()
}

#[test]
fn test_validate_rejects_undeclared_field() {
    let schema = orders_schema();
    let customers = customers_schema();
    let lookup = |name: &str| (name == "customers").then_some(&customers);

    let err = Predicate::is_null("missing")
        .validate(&schema, &lookup)
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidPredicate { .. }));

    let err = Predicate::in_collection("customer_id", "customers", "id")
        .validate(&schema, &lookup)
        .unwrap_err();
    assert!(err.to_string().contains("customers.id"));

    let err = Predicate::in_collection("customer_id", "shoppers", "customer_id")
        .validate(&schema, &lookup)
        .unwrap_err();
    assert!(err.to_string().contains("shoppers"));

    assert!(
        Predicate::in_collection("customer_id", "customers", "customer_id")
            .validate(&schema, &lookup)
            .is_ok()
    );
}

#[test]
fn test_validate_rejects_mistyped_comparison() {
    let schema = orders_schema();
    let no_schema: Option<&CollectionSchema> = None;
    let lookup = |_: &str| no_schema;

    assert!(
        Predicate::compare("total", CmpOp::Lt, "cheap")
            .validate(&schema, &lookup)
            .is_err()
    );
    assert!(
        Predicate::compare("total", CmpOp::Lt, 0i64)
            .validate(&schema, &lookup)
            .is_ok()
    );
    assert!(
        Predicate::compare("total", CmpOp::Eq, Value::Null)
            .validate(&schema, &lookup)
            .is_err()
    );
    assert!(
        Predicate::contains("total", "1")
            .validate(&schema, &lookup)
            .is_err()
    );
}

#[test]
fn test_comparison_against_null_is_unknown() {
    let collections = HashMap::new();
    let row = record(1, &[("total", Value::Null)]);

    let lt = resolve(&Predicate::compare("total", CmpOp::Lt, 0.0), &collections);
    assert!(!lt.matches(&row));

    // NOT(unknown) stays unknown, exactly as in SQL.
    let not_lt = resolve(
        &Predicate::compare("total", CmpOp::Lt, 0.0).not(),
        &collections,
    );
    assert!(!not_lt.matches(&row));

    let null_or_negative = resolve(
        &Predicate::is_null("total").or(Predicate::compare("total", CmpOp::Lt, 0.0)),
        &collections,
    );
    assert!(null_or_negative.matches(&row));
}

#[test]
fn test_in_collection_ignores_null_parent_values() {
    let mut collections = HashMap::new();
    collections.insert(
        "customers".to_string(),
        vec![
            record(1, &[("customer_id", Value::text("C1"))]),
            record(2, &[("customer_id", Value::Null)]),
        ],
    );

    let orphan = resolve(
        &Predicate::in_collection("customer_id", "customers", "customer_id").not(),
        &collections,
    );

    assert!(!orphan.matches(&record(10, &[("customer_id", Value::text("C1"))])));
    assert!(orphan.matches(&record(11, &[("customer_id", Value::text("C9"))])));
    assert!(!orphan.matches(&record(12, &[("customer_id", Value::Null)])));
}

#[test]
fn test_filtered_in_collection() {
    let mut collections = HashMap::new();
    collections.insert(
        "customers".to_string(),
        vec![
            record(1, &[("customer_id", Value::text("C1")), ("email", Value::text("a@shop.io"))]),
            record(2, &[("customer_id", Value::text("C2")), ("email", Value::text("qa@test.io"))]),
        ],
    );

    let predicate = Predicate::in_filtered_collection(
        "customer_id",
        "customers",
        "customer_id",
        Predicate::contains("email", "TEST"),
    );
    let resolved = resolve(&predicate, &collections);

    assert!(resolved.matches(&record(10, &[("customer_id", Value::text("C2"))])));
    assert!(!resolved.matches(&record(11, &[("customer_id", Value::text("C1"))])));
    assert_eq!(
        predicate.referenced_collections().into_iter().collect::<Vec<_>>(),
        vec!["customers".to_string()]
    );
}

#[test]
fn test_resolve_unknown_collection_fails() {
    let err = ResolvedPredicate::resolve(
        &Predicate::in_collection("customer_id", "customers", "customer_id"),
        &HashMap::new(),
    )
    .unwrap_err();
    assert!(matches!(err, ReconcileError::UnknownCollection { .. }));
}

#[test]
fn test_row_in_and_contains() {
    let collections = HashMap::new();
    let rows = resolve(&Predicate::rows([2, 3]), &collections);
    assert!(rows.matches(&record(2, &[])));
    assert!(!rows.matches(&record(4, &[])));

    let contains = resolve(&Predicate::contains("note", "Test"), &collections);
    assert!(contains.matches(&record(1, &[("note", Value::text("a TEST order"))])));
    assert!(!contains.matches(&record(1, &[("note", Value::Null)])));
}

#[test]
fn test_contains_folds_ascii_case_only() {
    let collections = HashMap::new();
    let contains = resolve(&Predicate::contains("note", "été"), &collections);
    assert!(contains.matches(&record(1, &[("note", Value::text("Summer été"))])));
    assert!(!contains.matches(&record(1, &[("note", Value::text("SUMMER ÉTÉ"))])));

    let ascii = resolve(&Predicate::contains("note", "sale"), &collections);
    assert!(ascii.matches(&record(1, &[("note", Value::text("ÉTÉ SALE"))])));
}

#[test]
fn test_compare_fields() {
    let schema = CollectionSchema::new("customers", "customer_id", FieldKind::Text)
        .with_field("created_at", FieldKind::Timestamp)
        .with_field("updated_at", FieldKind::Timestamp)
        .with_field("email", FieldKind::Text);
    let lookup = |_: &str| None;

    let stale = Predicate::compare_fields("updated_at", CmpOp::Lt, "created_at");
    assert!(stale.validate(&schema, &lookup).is_ok());
    assert!(
        Predicate::compare_fields("email", CmpOp::Eq, "created_at")
            .validate(&schema, &lookup)
            .is_err()
    );
    assert!(
        Predicate::compare_fields("updated_at", CmpOp::Lt, "deleted_at")
            .validate(&schema, &lookup)
            .is_err()
    );

    let at = |m: u32| {
        Value::from(
            chrono::NaiveDate::from_ymd_opt(2023, m, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
        )
    };
    let (earlier, later) = (at(1), at(6));
    let resolved = resolve(&stale, &HashMap::new());
    assert!(resolved.matches(&record(
        1,
        &[("created_at", later.clone()), ("updated_at", earlier.clone())]
    )));
    assert!(!resolved.matches(&record(
        2,
        &[("created_at", earlier.clone()), ("updated_at", later.clone())]
    )));
    assert!(!resolved.matches(&record(3, &[("created_at", later), ("updated_at", Value::Null)])));
    // unknown stays unknown under negation
    let fresh = resolve(&stale.not(), &HashMap::new());
    assert!(!fresh.matches(&record(4, &[("created_at", earlier)])));
}

#[test]
fn test_and_or_builders_flatten() {
    let p = Predicate::is_null("a")
        .and(Predicate::is_null("b"))
        .and(Predicate::is_null("c"));
    assert!(matches!(p, Predicate::And(ref parts) if parts.len() == 3));

    let p = Predicate::is_null("a")
        .or(Predicate::is_null("b"))
        .or(Predicate::is_null("c"));
    assert!(matches!(p, Predicate::Or(ref parts) if parts.len() == 3));
}

#[test]
fn test_mutation_validation() {
    let schema = orders_schema();
    assert!(Mutation::set("note", "archived").validate(&schema).is_ok());
    assert!(Mutation::set("order_id", "X").validate(&schema).is_err());
    assert!(Mutation::set("total", "lots").validate(&schema).is_err());
    assert!(Mutation::set("nope", 1i64).validate(&schema).is_err());

    let mut row = record(1, &[("note", Value::Null)]);
    Mutation::apply_all(&[Mutation::set("note", "archived")], &mut row);
    assert_eq!(row.get("note"), &Value::text("archived"));
}

#[test]
fn test_copy_mutation_reads_pre_update_values() {
    let schema = orders_schema().with_field("memo", FieldKind::Text);
    assert!(Mutation::copy("note", "customer_id").validate(&schema).is_ok());
    assert!(Mutation::copy("note", "total").validate(&schema).is_err());
    assert!(Mutation::copy("note", "missing").validate(&schema).is_err());
    assert!(Mutation::copy("order_id", "note").validate(&schema).is_err());

    let mut row = record(
        1,
        &[("note", Value::text("old")), ("memo", Value::text("m"))],
    );
    Mutation::apply_all(
        &[Mutation::copy("memo", "note"), Mutation::copy("note", "memo")],
        &mut row,
    );
    assert_eq!(row.get("memo"), &Value::text("old"));
    assert_eq!(row.get("note"), &Value::text("m"));
}

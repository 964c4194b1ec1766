//! E-commerce rule catalog.
//!
//! Schemas, relations and cleaning rules for the five DataBoard collections:
//! `customers`, `products`, `orders`, `order_items` and `payments`. Rule
//! thresholds come from [`CleaningConfig`].

use async_trait::async_trait;
use chrono::NaiveTime;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::audit::QualityMetric;
use crate::cascade::{ForeignKey, RelationGraph};
use crate::config::CleaningConfig;
use crate::dedup::{DedupPolicy, SortKey};
use crate::models::{CollectionSchema, FieldKind, RowId, Value};
use crate::pipeline::{ExecutorConfig, Pipeline};
use crate::rules::{Bound, CleaningRule, RuleLogic};
use crate::store::{CmpOp, EntityStore, Mutation, Predicate};
use crate::{ReconcileError, Result};

/// Collection schemas.
pub fn schemas() -> Vec<CollectionSchema> {
    vec![
        CollectionSchema::new("customers", "customer_id", FieldKind::Text)
            .with_field("name", FieldKind::Text)
            .with_field("email", FieldKind::Text)
            .with_field("created_at", FieldKind::Timestamp)
            .with_field("updated_at", FieldKind::Timestamp),
        CollectionSchema::new("products", "product_id", FieldKind::Text)
            .with_field("name", FieldKind::Text)
            .with_field("category", FieldKind::Text)
            .with_field("is_active", FieldKind::Boolean)
            .with_field("created_at", FieldKind::Timestamp)
            .with_field("updated_at", FieldKind::Timestamp),
        CollectionSchema::new("orders", "order_id", FieldKind::Text)
            .with_field("customer_id", FieldKind::Text)
            .with_field("order_date", FieldKind::Date)
            .with_field("status", FieldKind::Text),
        CollectionSchema::new("order_items", "item_id", FieldKind::Text)
            .with_field("order_id", FieldKind::Text)
            .with_field("product_id", FieldKind::Text)
            .with_field("quantity", FieldKind::Integer)
            .with_field("unit_price", FieldKind::Float),
        CollectionSchema::new("payments", "payment_id", FieldKind::Text)
            .with_field("order_id", FieldKind::Text)
            .with_field("attempt", FieldKind::Integer)
            .with_field("status", FieldKind::Text)
            .with_field("paid_amount", FieldKind::Float)
            .with_field("payment_date", FieldKind::Timestamp),
    ]
}

/// Foreign key relations, all non-nullable.
pub fn relations() -> Vec<ForeignKey> {
    vec![
        customer_of_order(),
        order_of_item(),
        product_of_item(),
        order_of_payment(),
    ]
}

fn customer_of_order() -> ForeignKey {
    ForeignKey::new("orders", "customer_id", "customers", "customer_id")
}

fn order_of_item() -> ForeignKey {
    ForeignKey::new("order_items", "order_id", "orders", "order_id")
}

fn product_of_item() -> ForeignKey {
    ForeignKey::new("order_items", "product_id", "products", "product_id")
}

fn order_of_payment() -> ForeignKey {
    ForeignKey::new("payments", "order_id", "orders", "order_id")
}

/// Customers whose email or name contains a test marker.
fn test_account_predicate(markers: &[String]) -> Predicate {
    Predicate::Or(
        markers
            .iter()
            .flat_map(|marker| {
                [
                    Predicate::contains("email", marker.as_str()),
                    Predicate::contains("name", marker.as_str()),
                ]
            })
            .collect(),
    )
}

/// Records whose `updated_at` is missing or earlier than `created_at`.
fn stale_updated_at() -> Predicate {
    Predicate::is_null("created_at").not().and(
        Predicate::is_null("updated_at").or(Predicate::compare_fields(
            "updated_at",
            CmpOp::Lt,
            "created_at",
        )),
    )
}

/// Deletes parents whose children add up to less than a minimum total.
///
/// The total of a parent is the sum of `quantity * unit_price` over its
/// children. Parents without children are left alone.
#[derive(Debug)]
struct TotalBelow {
    relation: ForeignKey,
    quantity: String,
    unit_price: String,
    min_total: f64,
}

#[async_trait]
impl RuleLogic for TotalBelow {
    async fn apply(&self, store: &dyn EntityStore, target: &str) -> Result<u64> {
        let children = store.select(&self.relation.child, None).await?;
        let mut totals: HashMap<Value, f64> = HashMap::new();
        for child in &children {
            let reference = child.get(&self.relation.field);
            if reference.is_null() {
                continue;
            }
            let total = totals.entry(reference.clone()).or_insert(0.0);
            if let (Some(quantity), Some(price)) = (
                child.get(&self.quantity).as_f64(),
                child.get(&self.unit_price).as_f64(),
            ) {
                *total += quantity * price;
            }
        }

        let below: Vec<RowId> = store
            .select(target, None)
            .await?
            .iter()
            .filter(|parent| {
                totals
                    .get(parent.get(&self.relation.parent_key))
                    .is_some_and(|total| *total < self.min_total)
            })
            .map(|parent| parent.row_id)
            .collect();
        debug!(
            "{} records of '{}' total less than {}",
            below.len(),
            target,
            self.min_total
        );
        if below.is_empty() {
            return Ok(0);
        }
        store.delete(target, &Predicate::rows(below)).await
    }

    fn reads(&self) -> Vec<String> {
        vec![self.relation.child.clone()]
    }

    fn validate(&self, store: &dyn EntityStore, target: &str) -> Result<()> {
        if target != self.relation.parent {
            return Err(ReconcileError::configuration(format!(
                "order total rule targets '{}' but relation '{}' has parent '{}'",
                target, self.relation.name, self.relation.parent
            )));
        }
        let children = store.require_schema(&self.relation.child)?;
        for field in [&self.relation.field, &self.quantity, &self.unit_price] {
            if children.kind_of(field).is_none() {
                return Err(ReconcileError::invalid_predicate(
                    &self.relation.child,
                    format!("unknown field '{}'", field),
                ));
            }
        }
        let parents = store.require_schema(target)?;
        if parents.kind_of(&self.relation.parent_key).is_none() {
            return Err(ReconcileError::invalid_predicate(
                target,
                format!("unknown field '{}'", self.relation.parent_key),
            ));
        }
        Ok(())
    }
}

/// Active products created before the cutoff that appear in no order placed
/// on or after it.
fn inactive_product_predicate(config: &CleaningConfig) -> Predicate {
    let cutoff = config.inactivity_cutoff();
    let recent_orders = Predicate::compare("order_date", CmpOp::Ge, cutoff);
    let recently_sold = Predicate::in_filtered_collection(
        "product_id",
        "order_items",
        "product_id",
        Predicate::in_filtered_collection("order_id", "orders", "order_id", recent_orders),
    );
    Predicate::eq("is_active", true)
        .and(recently_sold.not())
        .and(Predicate::compare(
            "created_at",
            CmpOp::Lt,
            cutoff.and_time(NaiveTime::MIN),
        ))
}

/// The cleaning rules in declaration order.
pub fn rules(config: &CleaningConfig) -> Vec<CleaningRule> {
    let priority: Vec<Value> = config
        .payment_status_priority
        .iter()
        .map(|s| Value::text(s.as_str()))
        .collect();
    let orders_settled = if config.require_order_items {
        "orders.require_items"
    } else {
        "orders.remove_test_orders"
    };
    let items_settled = if config.require_order_items {
        "orders.require_items"
    } else {
        "order_items.cascade_orders"
    };

    let mut rules = vec![
        CleaningRule::delete_where(
            "customers.remove_invalid_ids",
            "customers",
            Predicate::is_blank("customer_id"),
        )
        .named("Remove customers without id")
        .justified_by("Customers without an id cannot be referenced by orders"),
        CleaningRule::delete_where(
            "customers.remove_test_accounts",
            "customers",
            test_account_predicate(&config.test_account_markers),
        )
        .named("Remove test accounts")
        .justified_by("Test accounts distort customer and revenue metrics"),
        CleaningRule::deduplicate(
            "customers.dedup_by_id",
            "customers",
            DedupPolicy::by(["customer_id"]).prefer(SortKey::Descending("created_at".into())),
        )
        .named("Deduplicate customers by id")
        .justified_by("A customer id must identify one customer; the latest record wins")
        .after(["customers.remove_invalid_ids"]),
        CleaningRule::deduplicate(
            "customers.dedup_by_email",
            "customers",
            DedupPolicy::by(["email"])
                .prefer(SortKey::Ascending("created_at".into()))
                .prefer(SortKey::Ascending("customer_id".into())),
        )
        .named("Deduplicate customers by email")
        .justified_by("One person registered twice; the earliest account is kept")
        .after(["customers.dedup_by_id"]),
        CleaningRule::flag(
            "customers.normalize_updated_at",
            "customers",
            stale_updated_at(),
            vec![Mutation::copy("updated_at", "created_at")],
        )
        .named("Normalize customer update times")
        .justified_by("A record cannot be updated before it was created")
        .counted_over(stale_updated_at())
        .after(["customers.dedup_by_email"]),
        CleaningRule::delete_where(
            "products.remove_invalid_ids",
            "products",
            Predicate::is_blank("product_id"),
        )
        .named("Remove products without id")
        .justified_by("Products without an id cannot be referenced by order items"),
        CleaningRule::deduplicate(
            "products.dedup_by_id",
            "products",
            DedupPolicy::by(["product_id"]).prefer(SortKey::Descending("created_at".into())),
        )
        .named("Deduplicate products by id")
        .justified_by("A product id must identify one product; the latest record wins")
        .after(["products.remove_invalid_ids"]),
        CleaningRule::flag(
            "products.normalize_updated_at",
            "products",
            stale_updated_at(),
            vec![Mutation::copy("updated_at", "created_at")],
        )
        .named("Normalize product update times")
        .justified_by("A record cannot be updated before it was created")
        .counted_over(stale_updated_at())
        .after(["products.dedup_by_id"]),
        CleaningRule::delete_where(
            "orders.remove_future_dates",
            "orders",
            Predicate::compare("order_date", CmpOp::Gt, config.latest_order_date()),
        )
        .named("Remove future-dated orders")
        .justified_by("Orders cannot be placed in the future"),
        CleaningRule::deduplicate(
            "orders.dedup_by_id",
            "orders",
            DedupPolicy::by(["order_id"])
                .prefer(SortKey::Descending("order_date".into()))
                .prefer(SortKey::Descending("customer_id".into())),
        )
        .named("Deduplicate orders by id")
        .justified_by("An order id must identify one order; the most recent record wins")
        .after(["orders.remove_future_dates"]),
        CleaningRule::cascade("orders.cascade_customers", customer_of_order())
            .named("Remove orders of unknown customers")
            .justified_by("Every order must belong to an existing customer")
            .after([
                "customers.remove_invalid_ids",
                "customers.remove_test_accounts",
                "customers.dedup_by_id",
                "customers.dedup_by_email",
                "orders.dedup_by_id",
            ]),
        CleaningRule::delete_where(
            "order_items.remove_invalid_ids",
            "order_items",
            Predicate::is_blank("item_id"),
        )
        .named("Remove order items without id")
        .justified_by("Order items without an id cannot be told apart"),
        CleaningRule::enforce_bounds(
            "order_items.enforce_quantity",
            "order_items",
            "quantity",
            Bound::positive().at_most(config.max_quantity as f64),
        )
        .named("Enforce item quantity bounds")
        .justified_by("Quantities must be positive and plausible"),
        CleaningRule::enforce_bounds(
            "order_items.enforce_unit_price",
            "order_items",
            "unit_price",
            Bound::positive().at_most(config.max_unit_price),
        )
        .named("Enforce item price bounds")
        .justified_by("Prices must be positive and plausible"),
        CleaningRule::deduplicate(
            "order_items.dedup_by_id",
            "order_items",
            DedupPolicy::by(["item_id"]),
        )
        .named("Deduplicate order items by id")
        .justified_by("An item id must identify one order line")
        .after([
            "order_items.remove_invalid_ids",
            "order_items.enforce_quantity",
            "order_items.enforce_unit_price",
        ]),
        CleaningRule::cascade("order_items.cascade_products", product_of_item())
            .named("Remove items of unknown products")
            .justified_by("Every order item must reference an existing product")
            .after([
                "products.remove_invalid_ids",
                "products.dedup_by_id",
                "order_items.dedup_by_id",
            ]),
        CleaningRule::custom(
            "orders.remove_test_orders",
            "orders",
            Arc::new(TotalBelow {
                relation: order_of_item(),
                quantity: "quantity".into(),
                unit_price: "unit_price".into(),
                min_total: config.min_order_total,
            }),
        )
        .named("Remove test orders")
        .justified_by("Orders with a token total are test purchases, not real sales")
        .after([
            "orders.cascade_customers",
            "order_items.enforce_quantity",
            "order_items.enforce_unit_price",
            "order_items.cascade_products",
        ]),
        CleaningRule::cascade("order_items.cascade_orders", order_of_item())
            .named("Remove items of removed orders")
            .justified_by("Every order item must belong to an existing order")
            .after([
                "orders.cascade_customers",
                "order_items.enforce_quantity",
                "order_items.enforce_unit_price",
                "order_items.cascade_products",
                "orders.remove_test_orders",
            ]),
    ];

    if config.require_order_items {
        rules.push(
            CleaningRule::require_children("orders.require_items", order_of_item())
                .named("Remove orders without items")
                .justified_by("An order without items has no revenue and no fulfilment")
                .after(["order_items.cascade_orders"]),
        );
    }

    rules.extend([
        CleaningRule::delete_where(
            "payments.remove_invalid_ids",
            "payments",
            Predicate::is_blank("payment_id"),
        )
        .named("Remove payments without id")
        .justified_by("Payments without an id cannot be reconciled"),
        CleaningRule::enforce_bounds(
            "payments.enforce_amount",
            "payments",
            "paid_amount",
            Bound::non_negative(),
        )
        .named("Enforce payment amount bounds")
        .justified_by("Paid amounts must be recorded and cannot be negative"),
        CleaningRule::deduplicate(
            "payments.dedup_by_id",
            "payments",
            payment_preference(DedupPolicy::by(["payment_id"]), &priority),
        )
        .named("Deduplicate payments by id")
        .justified_by("A payment id must identify one payment; the most settled record wins")
        .after(["payments.remove_invalid_ids", "payments.enforce_amount"]),
        CleaningRule::cascade("payments.cascade_orders", order_of_payment())
            .named("Remove payments of removed orders")
            .justified_by("Every payment must belong to an existing order")
            .after([orders_settled, "payments.dedup_by_id"]),
        CleaningRule::deduplicate(
            "payments.dedup_by_order",
            "payments",
            payment_preference(DedupPolicy::by(["order_id"]), &priority),
        )
        .named("Deduplicate payments by order")
        .justified_by("One payment per order; the most settled, latest attempt wins")
        .after([
            "payments.enforce_amount",
            "payments.dedup_by_id",
            "payments.cascade_orders",
        ]),
        CleaningRule::flag(
            "products.archive_inactive",
            "products",
            inactive_product_predicate(config),
            vec![Mutation::set("is_active", false)],
        )
        .named("Archive inactive products")
        .justified_by("Products without recent sales are hidden from the active catalog")
        .counted_over(Predicate::eq("is_active", true))
        .after([items_settled]),
    ]);

    rules
}

/// Most settled status first, then the latest payment date and attempt.
fn payment_preference(policy: DedupPolicy, priority: &[Value]) -> DedupPolicy {
    policy
        .prefer(SortKey::Rank {
            field: "status".into(),
            order: priority.to_vec(),
        })
        .prefer(SortKey::Descending("payment_date".into()))
        .prefer(SortKey::Descending("attempt".into()))
}

/// Post-run quality metrics over `orders`.
///
/// - `complete_orders_percentage`: orders with at least one item and a known
///   customer
/// - `payment_completion_rate`: orders with a paid payment
pub fn metrics() -> Vec<QualityMetric> {
    vec![
        QualityMetric::new(
            "complete_orders_percentage",
            "orders",
            Predicate::in_collection("order_id", "order_items", "order_id").and(
                Predicate::in_collection("customer_id", "customers", "customer_id"),
            ),
        ),
        QualityMetric::new(
            "payment_completion_rate",
            "orders",
            Predicate::in_filtered_collection(
                "order_id",
                "payments",
                "order_id",
                Predicate::eq("status", "paid"),
            ),
        ),
    ]
}

/// Builds the catalog pipeline for a configuration.
///
/// # Errors
/// Returns a configuration error if the configuration is invalid.
pub fn pipeline(config: &CleaningConfig) -> Result<Pipeline> {
    config.validate()?;
    Ok(Pipeline::with_config(
        rules(config),
        RelationGraph::new(relations())?,
        ExecutorConfig::from(config),
    )?
    .with_metrics(metrics()))
}

//! Reconciliation configuration.
//!
//! Thresholds for the e-commerce rule catalog and executor limits. Every
//! field has a default, so a partial JSON file is enough to override a few
//! values.

use chrono::{NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::{ReconcileError, Result};

/// Validation errors for cleaning configuration.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("rule_timeout_secs must be greater than 0")]
    ZeroTimeout,
    #[error("max_concurrency must be greater than 0")]
    ZeroConcurrency,
    #[error("max_quantity must be greater than 0, got {0}")]
    InvalidMaxQuantity(i64),
    #[error("max_unit_price must be greater than 0, got {0}")]
    InvalidMaxUnitPrice(f64),
    #[error("future_date_grace_days must not be negative, got {0}")]
    NegativeGraceDays(i64),
    #[error("future_date_grace_days of {0} puts the latest order date out of range")]
    GraceDaysOutOfRange(i64),
    #[error("product_inactivity_days of {0} puts the activity cutoff out of range")]
    InactivityDaysOutOfRange(i64),
    #[error("min_order_total must be a finite, non-negative amount, got {0}")]
    InvalidMinOrderTotal(f64),
    #[error("product_inactivity_days must be greater than 0, got {0}")]
    InvalidInactivityDays(i64),
    #[error("payment_status_priority contains '{0}' more than once")]
    DuplicateStatus(String),
    #[error("test_account_markers must not contain blank markers")]
    BlankMarker,
}

impl From<ConfigValidationError> for ReconcileError {
    fn from(error: ConfigValidationError) -> Self {
        ReconcileError::configuration(error.to_string())
    }
}

/// Cleaning configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningConfig {
    /// Per-rule time budget in seconds
    pub rule_timeout_secs: u64,
    /// Largest number of rules run at the same time
    pub max_concurrency: usize,
    /// Orders dated after `reference_date + grace` are future-dated
    pub future_date_grace_days: i64,
    /// "Today" for date rules; the current UTC date when unset
    pub reference_date: Option<NaiveDate>,
    /// Largest plausible order item quantity
    pub max_quantity: i64,
    /// Largest plausible order item unit price
    pub max_unit_price: f64,
    /// Payment statuses in order of preference when deduplicating
    pub payment_status_priority: Vec<String>,
    /// Substrings marking test customer accounts, matched with ASCII case
    /// folding
    pub test_account_markers: Vec<String>,
    /// Products without sales in this many days are archived
    pub product_inactivity_days: i64,
    /// Remove orders that have no order items
    pub require_order_items: bool,
    /// Orders whose item total is below this amount are test orders
    pub min_order_total: f64,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self {
            rule_timeout_secs: 30,
            max_concurrency: 4,
            future_date_grace_days: 1,
            reference_date: None,
            max_quantity: 1000,
            max_unit_price: 1_000_000.0,
            payment_status_priority: vec!["paid".to_string(), "pending".to_string()],
            test_account_markers: vec!["test".to_string(), "example".to_string()],
            product_inactivity_days: 365,
            require_order_items: true,
            min_order_total: 1.0,
        }
    }
}

impl CleaningConfig {
    /// Creates a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a config from a JSON file; missing fields keep their defaults.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, is not valid JSON, or fails
    /// validation.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ReconcileError::Io {
            context: format!("Failed to read config file {}", path.display()),
            source: e,
        })?;
        let config: Self =
            serde_json::from_str(&text).map_err(|e| ReconcileError::Serialization {
                context: format!("Failed to parse config file {}", path.display()),
                source: e,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Builder method to set the concurrency limit.
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Builder method to set the future date grace period.
    pub fn with_future_date_grace_days(mut self, days: i64) -> Self {
        self.future_date_grace_days = days;
        self
    }

    /// Builder method to pin "today".
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    /// Builder method to set the quantity ceiling.
    pub fn with_max_quantity(mut self, max_quantity: i64) -> Self {
        self.max_quantity = max_quantity;
        self
    }

    /// Builder method to set the unit price ceiling.
    pub fn with_max_unit_price(mut self, max_unit_price: f64) -> Self {
        self.max_unit_price = max_unit_price;
        self
    }

    /// Builder method to set payment status preference.
    pub fn with_payment_status_priority<I, S>(mut self, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.payment_status_priority = statuses.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set test account markers.
    pub fn with_test_account_markers<I, S>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.test_account_markers = markers.into_iter().map(Into::into).collect();
        self
    }

    /// Builder method to set the product inactivity window.
    pub fn with_product_inactivity_days(mut self, days: i64) -> Self {
        self.product_inactivity_days = days;
        self
    }

    /// Builder method to enable/disable removal of orders without items.
    pub fn with_require_order_items(mut self, enabled: bool) -> Self {
        self.require_order_items = enabled;
        self
    }

    /// Builder method to set the test order threshold.
    pub fn with_min_order_total(mut self, min_order_total: f64) -> Self {
        self.min_order_total = min_order_total;
        self
    }

    /// Per-rule timeout.
    pub fn rule_timeout(&self) -> Duration {
        Duration::from_secs(self.rule_timeout_secs)
    }

    /// Reference date, defaulting to today (UTC).
    pub fn reference_date(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    /// Latest acceptable order date.
    ///
    /// Saturates at the last representable date; [`Self::validate`] rejects
    /// grace periods that would overflow.
    pub fn latest_order_date(&self) -> NaiveDate {
        self.checked_latest_order_date().unwrap_or(NaiveDate::MAX)
    }

    /// Start of the product activity window.
    ///
    /// Saturates at the first representable date; [`Self::validate`] rejects
    /// windows that would overflow.
    pub fn inactivity_cutoff(&self) -> NaiveDate {
        self.checked_inactivity_cutoff().unwrap_or(NaiveDate::MIN)
    }

    fn checked_latest_order_date(&self) -> Option<NaiveDate> {
        TimeDelta::try_days(self.future_date_grace_days)
            .and_then(|grace| self.reference_date().checked_add_signed(grace))
    }

    fn checked_inactivity_cutoff(&self) -> Option<NaiveDate> {
        TimeDelta::try_days(self.product_inactivity_days)
            .and_then(|window| self.reference_date().checked_sub_signed(window))
    }

    /// Validates the configuration.
    ///
    /// Returns an error if any limit is outside its valid range.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        if self.rule_timeout_secs == 0 {
            return Err(ConfigValidationError::ZeroTimeout);
        }
        if self.max_concurrency == 0 {
            return Err(ConfigValidationError::ZeroConcurrency);
        }
        if self.max_quantity <= 0 {
            return Err(ConfigValidationError::InvalidMaxQuantity(self.max_quantity));
        }
        if !(self.max_unit_price > 0.0) {
            return Err(ConfigValidationError::InvalidMaxUnitPrice(
                self.max_unit_price,
            ));
        }
        if self.future_date_grace_days < 0 {
            return Err(ConfigValidationError::NegativeGraceDays(
                self.future_date_grace_days,
            ));
        }
        if self.checked_latest_order_date().is_none() {
            return Err(ConfigValidationError::GraceDaysOutOfRange(
                self.future_date_grace_days,
            ));
        }
        if self.product_inactivity_days <= 0 {
            return Err(ConfigValidationError::InvalidInactivityDays(
                self.product_inactivity_days,
            ));
        }
        if self.checked_inactivity_cutoff().is_none() {
            return Err(ConfigValidationError::InactivityDaysOutOfRange(
                self.product_inactivity_days,
            ));
        }
        if !self.min_order_total.is_finite() || self.min_order_total < 0.0 {
            return Err(ConfigValidationError::InvalidMinOrderTotal(
                self.min_order_total,
            ));
        }
        for (i, status) in self.payment_status_priority.iter().enumerate() {
            if self.payment_status_priority[..i].contains(status) {
                return Err(ConfigValidationError::DuplicateStatus(status.clone()));
            }
        }
        if self.test_account_markers.iter().any(|m| m.trim().is_empty()) {
            return Err(ConfigValidationError::BlankMarker);
        }
        Ok(())
    }
}

//! Core data models for entity collections.
//!
//! Records are field maps of typed [`Value`]s validated against a
//! [`CollectionSchema`]. Values carry a total order so that duplicate
//! resolution never depends on input order.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Store-assigned identity of a stored record.
///
/// Distinct from the primary key: two records that share a duplicated
/// primary key still have different row ids.
pub type RowId = i64;

/// Field map of a record, ordered by field name.
pub type Fields = BTreeMap<String, Value>;

/// Declared type of a collection field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Integer,
    Float,
    Text,
    Boolean,
    Date,
    Timestamp,
}

impl FieldKind {
    /// Returns true for integer and float fields.
    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Float)
    }
}

impl std::fmt::Display for FieldKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldKind::Integer => write!(f, "integer"),
            FieldKind::Float => write!(f, "float"),
            FieldKind::Text => write!(f, "text"),
            FieldKind::Boolean => write!(f, "boolean"),
            FieldKind::Date => write!(f, "date"),
            FieldKind::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// A typed field value.
///
/// Serializes to plain JSON (`null`, numbers, strings, booleans, ISO-8601
/// dates). Deserialization is schema driven through [`Value::from_json`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
];

impl Value {
    /// Text value helper.
    pub fn text(value: impl Into<String>) -> Self {
        Value::Text(value.into())
    }

    /// Returns true for [`Value::Null`].
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Null or text that is empty after trimming.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// Returns the numeric value as `f64` for integer and float values.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the text content of a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns true if this value may be stored in a field of `kind`.
    ///
    /// Null fits every kind; integers are accepted by float fields.
    pub fn fits(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Value::Null, _)
                | (Value::Bool(_), FieldKind::Boolean)
                | (Value::Int(_), FieldKind::Integer | FieldKind::Float)
                | (Value::Float(_), FieldKind::Float)
                | (Value::Text(_), FieldKind::Text)
                | (Value::Date(_), FieldKind::Date)
                | (Value::Timestamp(_), FieldKind::Timestamp)
        )
    }

    /// Converts a JSON value into a typed value for a field of `kind`.
    ///
    /// Numbers given as strings and dates given as timestamps are accepted,
    /// since exported datasets are rarely consistent about either.
    ///
    /// # Errors
    /// Returns a description of the mismatch when the value cannot be
    /// represented as `kind`.
    pub fn from_json(kind: FieldKind, json: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value as Json;

        let mismatch = || format!("expected {} value, got {}", kind, json);

        match (kind, json) {
            (_, Json::Null) => Ok(Value::Null),
            (FieldKind::Boolean, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (FieldKind::Boolean, Json::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Ok(Value::Bool(true)),
                "false" | "f" | "0" | "no" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (FieldKind::Integer, Json::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(mismatch),
            (FieldKind::Integer, Json::String(s)) => {
                s.trim().parse::<i64>().map(Value::Int).map_err(|_| mismatch())
            }
            (FieldKind::Float, Json::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(mismatch),
            (FieldKind::Float, Json::String(s)) => {
                s.trim().parse::<f64>().map(Value::Float).map_err(|_| mismatch())
            }
            (FieldKind::Text, Json::String(s)) => Ok(Value::Text(s.clone())),
            (FieldKind::Text, Json::Number(n)) => Ok(Value::Text(n.to_string())),
            (FieldKind::Date, Json::String(s)) => parse_date(s).map(Value::Date).ok_or_else(mismatch),
            (FieldKind::Timestamp, Json::String(s)) => {
                parse_timestamp(s).map(Value::Timestamp).ok_or_else(mismatch)
            }
            _ => Err(mismatch()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Bool(_) => 0,
            Value::Int(_) | Value::Float(_) => 1,
            Value::Text(_) => 2,
            Value::Date(_) => 3,
            Value::Timestamp(_) => 4,
            Value::Null => 5,
        }
    }
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_timestamp(s).map(|ts| ts.date()))
}

fn parse_timestamp(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Total order over values.
///
/// Values of different types order by type; integers and floats compare
/// numerically; floats use IEEE total ordering; null sorts after everything.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) if a == b => Ordering::Equal,
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b),
            (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a).reverse(),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// Exact ordering of an integer against a float, without rounding the
/// integer through `f64`.
fn cmp_int_float(i: i64, f: f64) -> Ordering {
    // 2^63 is exactly representable; every i64 lies in [-2^63, 2^63).
    const TWO_63: f64 = 9_223_372_036_854_775_808.0;
    if f.is_nan() {
        return if f.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if f >= TWO_63 {
        return Ordering::Less;
    }
    if f < -TWO_63 {
        return Ordering::Greater;
    }
    let whole = f.trunc();
    match i.cmp(&(whole as i64)) {
        Ordering::Equal => 0.0f64.partial_cmp(&(f - whole)).unwrap_or(Ordering::Equal),
        unequal => unequal,
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        // Int and Float compare equal numerically, so both hash as f64 bits
        // with zero normalized.
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => (*i as f64).to_bits().hash(state),
            Value::Float(f) if *f == 0.0 => 0.0f64.to_bits().hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::Text(s) => s.hash(state),
            Value::Date(d) => d.hash(state),
            Value::Timestamp(t) => t.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Timestamp(t) => write!(f, "{}", t.format("%Y-%m-%dT%H:%M:%S")),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<NaiveDate> for Value {
    fn from(value: NaiveDate) -> Self {
        Value::Date(value)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Collection field declaration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
}

/// Schema of an entity collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    /// Creates a schema whose primary key field has the given kind.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>, kind: FieldKind) -> Self {
        let primary_key = primary_key.into();
        Self {
            name: name.into(),
            fields: vec![FieldDef {
                name: primary_key.clone(),
                kind,
            }],
            primary_key,
        }
    }

    /// Builder method to declare an additional field.
    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            kind,
        });
        self
    }

    /// Looks up a field declaration.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Returns the declared kind of a field.
    pub fn kind_of(&self, name: &str) -> Option<FieldKind> {
        self.field(name).map(|f| f.kind)
    }

    /// Returns true if the field is declared.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Validates that the schema is self-consistent.
    ///
    /// # Errors
    /// Returns a configuration error when the primary key is undeclared or a
    /// field is declared twice.
    pub fn validate(&self) -> crate::Result<()> {
        if !self.has_field(&self.primary_key) {
            return Err(crate::ReconcileError::configuration(format!(
                "Collection '{}' declares primary key '{}' which is not a field",
                self.name, self.primary_key
            )));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(crate::ReconcileError::configuration(format!(
                    "Collection '{}' declares field '{}' twice",
                    self.name, field.name
                )));
            }
        }
        Ok(())
    }

    /// Converts a JSON object into typed fields.
    ///
    /// Undeclared keys are ignored; missing declared fields become null.
    ///
    /// # Errors
    /// Returns an error if the row is not an object or a value does not fit
    /// its field kind.
    pub fn fields_from_json(&self, row: &serde_json::Value) -> crate::Result<Fields> {
        let object = row.as_object().ok_or_else(|| {
            crate::ReconcileError::configuration(format!(
                "Row for collection '{}' is not a JSON object",
                self.name
            ))
        })?;

        let mut fields = Fields::new();
        for def in &self.fields {
            let parsed = match object.get(&def.name) {
                Some(json) => Value::from_json(def.kind, json),
                None => Ok(Value::Null),
            };
            let value = parsed.map_err(|message| {
                crate::ReconcileError::configuration(format!(
                    "Field '{}.{}': {}",
                    self.name, def.name, message
                ))
            })?;
            fields.insert(def.name.clone(), value);
        }
        Ok(fields)
    }
}

/// A stored record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    #[serde(skip)]
    pub row_id: RowId,
    #[serde(flatten)]
    pub fields: Fields,
}

static NULL: Value = Value::Null;

impl Record {
    /// Creates a record with the given row id.
    pub fn new(row_id: RowId, fields: Fields) -> Self {
        Self { row_id, fields }
    }

    /// Returns a field value; undeclared or missing fields read as null.
    pub fn get(&self, field: &str) -> &Value {
        self.fields.get(field).unwrap_or(&NULL)
    }
}

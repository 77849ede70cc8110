use std::cmp::Ordering;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::document::ID_FIELD;
use crate::{Document, DocumentId, Result, StoreError};

/// A single predicate on a top-level document field.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The field equals the value.
    Eq { field: String, value: Value },
    /// The field is of the same JSON type as the value and not less than it.
    Gte { field: String, value: Value },
}

/// Builder for document filters.
///
/// All conditions must hold for a document to match. An empty filter
/// matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    /// Creates a new empty filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a filter matching a single document by ID.
    pub fn by_id(id: DocumentId) -> Self {
        Self::new().eq(ID_FIELD, id)
    }

    /// Requires `field == value`.
    pub fn eq(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Eq {
            field: field.into(),
            value: to_value(value),
        });
        self
    }

    /// Requires `field >= value`.
    pub fn gte(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.conditions.push(Condition::Gte {
            field: field.into(),
            value: to_value(value),
        });
        self
    }

    /// Returns the conditions of this filter.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns true if the document satisfies every condition.
    pub fn matches(&self, document: &Document) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq { field, value } => document.get(field) == Some(value),
            Condition::Gte { field, value } => document
                .get(field)
                .and_then(|actual| compare(actual, value))
                .is_some_and(|ord| ord != Ordering::Less),
        })
    }
}

/// A single field mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    /// Adds `by` to an integer field, creating it when missing.
    Inc { field: String, by: i64 },
    /// Replaces a field.
    Set { field: String, value: Value },
    /// Appends to an array field, creating it when missing.
    Push { field: String, value: Value },
}

/// Builder for document updates. Operations apply in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    ops: Vec<UpdateOp>,
}

impl Update {
    /// Creates a new empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `by` to an integer field.
    pub fn inc(mut self, field: impl Into<String>, by: i64) -> Self {
        self.ops.push(UpdateOp::Inc {
            field: field.into(),
            by,
        });
        self
    }

    /// Sets a field to a value.
    pub fn set(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.ops.push(UpdateOp::Set {
            field: field.into(),
            value: to_value(value),
        });
        self
    }

    /// Appends a value to an array field.
    pub fn push(mut self, field: impl Into<String>, value: impl Serialize) -> Self {
        self.ops.push(UpdateOp::Push {
            field: field.into(),
            value: to_value(value),
        });
        self
    }

    /// Returns the operations of this update.
    pub fn ops(&self) -> &[UpdateOp] {
        &self.ops
    }

    /// Applies the update to a document body.
    ///
    /// Returns whether the body changed. The body is left untouched when
    /// any operation fails.
    pub fn apply(&self, body: &mut Map<String, Value>) -> Result<bool> {
        let mut updated = body.clone();

        for op in &self.ops {
            match op {
                UpdateOp::Inc { field, by } => {
                    reject_id_change(field)?;
                    let current = match updated.get(field) {
                        None | Some(Value::Null) => 0,
                        Some(value) => value.as_i64().ok_or_else(|| {
                            StoreError::InvalidUpdate(format!(
                                "cannot increment non-integer field '{field}'"
                            ))
                        })?,
                    };
                    let next = current.checked_add(*by).ok_or_else(|| {
                        StoreError::InvalidUpdate(format!("increment overflows field '{field}'"))
                    })?;
                    updated.insert(field.clone(), Value::from(next));
                }
                UpdateOp::Set { field, value } => {
                    reject_id_change(field)?;
                    updated.insert(field.clone(), value.clone());
                }
                UpdateOp::Push { field, value } => {
                    reject_id_change(field)?;
                    match updated
                        .entry(field.clone())
                        .or_insert_with(|| Value::Array(Vec::new()))
                    {
                        Value::Array(items) => items.push(value.clone()),
                        _ => {
                            return Err(StoreError::InvalidUpdate(format!(
                                "cannot push to non-array field '{field}'"
                            )));
                        }
                    }
                }
            }
        }

        let modified = updated != *body;
        *body = updated;
        Ok(modified)
    }
}

fn reject_id_change(field: &str) -> Result<()> {
    if field == ID_FIELD {
        return Err(StoreError::InvalidUpdate(
            "the _id field is immutable".to_string(),
        ));
    }
    Ok(())
}

// Serializing plain values into JSON only fails for maps with non-string
// keys, which filters and updates never carry.
fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Orders two JSON values of the same type. Mixed types are unordered.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                Some(x.cmp(&y))
            } else {
                x.as_f64()?.partial_cmp(&y.as_f64()?)
            }
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

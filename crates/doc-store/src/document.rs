use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{DocumentId, Result, StoreError};

/// Field holding a document's identifier inside its body.
pub const ID_FIELD: &str = "_id";

/// Name of a collection of documents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Collection(String);

impl Collection {
    /// Creates a collection name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the collection name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Collection {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A JSON document stored in a collection.
///
/// The body always carries the document's ID under [`ID_FIELD`], so typed
/// records can round-trip their identity with `#[serde(rename = "_id")]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    body: Map<String, Value>,
}

impl Document {
    /// Creates a document with a freshly generated ID from a JSON object.
    ///
    /// An `_id` already present in the body is kept as the document ID.
    pub fn new(body: Value) -> Result<Self> {
        let Value::Object(mut body) = body else {
            return Err(StoreError::InvalidDocument(
                "document body must be a JSON object".to_string(),
            ));
        };

        let id = match body.get(ID_FIELD) {
            Some(raw) => serde_json::from_value(raw.clone())?,
            None => DocumentId::new(),
        };
        body.insert(ID_FIELD.to_string(), serde_json::to_value(id)?);

        Ok(Self { id, body })
    }

    /// Serializes a typed record into a document.
    pub fn encode<T: Serialize>(record: &T) -> Result<Self> {
        Self::new(serde_json::to_value(record)?)
    }

    /// Deserializes the document body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.body.clone()))?)
    }

    /// Rebuilds a document from stored parts, trusting the stored ID.
    pub(crate) fn from_parts(id: DocumentId, mut body: Map<String, Value>) -> Result<Self> {
        body.insert(ID_FIELD.to_string(), serde_json::to_value(id)?);
        Ok(Self { id, body })
    }

    /// Returns the document ID.
    pub fn id(&self) -> DocumentId {
        self.id
    }

    /// Returns the document body.
    pub fn body(&self) -> &Map<String, Value> {
        &self.body
    }

    /// Returns a field of the body.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.body.get(field)
    }

    pub(crate) fn body_mut(&mut self) -> &mut Map<String, Value> {
        &mut self.body
    }

    /// Consumes the document, returning the body as a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.body)
    }
}

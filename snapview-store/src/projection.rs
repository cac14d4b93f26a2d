//! Projection events fed in by the event store.
//!
//! Wire format (JSON):
//! ```text
//! {
//!   "event":      "accountCreated",          informational tag
//!   "collection": "accounts",                target store
//!   "method":     "upsert" | "delete",       anything else means upsert
//!   "fields": [
//!     { "name": "id",   "value": 42,    "primary": true },
//!     { "name": "name", "value": "Ann" }
//!   ]
//! }
//! ```
//!
//! Record keys are derived from the primary field value:
//! `key-` followed by the value's canonical JSON text.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Prefix shared by every record key. The watermark key lives outside it.
pub const RECORD_PREFIX: &[u8] = b"key-";

/// A materialized row: field name to value.
pub type Record = Map<String, Value>;

/// Mutation kind carried by a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Upsert,
    Delete,
}

impl Method {
    /// Map a wire method name. Only `"delete"` deletes.
    pub fn from_name(name: &str) -> Self {
        match name {
            "delete" => Method::Delete,
            _ => Method::Upsert,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Upsert => "upsert",
            Method::Delete => "delete",
        }
    }
}

impl<'de> Deserialize<'de> for Method {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = Option::<String>::deserialize(deserializer)?;
        Ok(name.as_deref().map(Method::from_name).unwrap_or_default())
    }
}

/// Read an explicit `null` as the type's default, like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A single field update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(default)]
    pub value: Value,
    #[serde(
        default,
        rename = "primary",
        alias = "is_primary",
        deserialize_with = "null_as_default"
    )]
    pub is_primary: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_primary: false,
        }
    }

    pub fn primary(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            is_primary: true,
            ..Self::new(name, value)
        }
    }
}

/// A decoded change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    /// Routing tag from the producer; not used for storage.
    #[serde(
        default,
        rename = "event",
        alias = "event_name",
        deserialize_with = "null_as_default"
    )]
    pub event_name: String,
    pub collection: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default, deserialize_with = "null_as_default")]
    pub fields: Vec<Field>,
}

impl Projection {
    /// Start an upsert against `collection`.
    pub fn upsert(collection: impl Into<String>) -> Self {
        Self {
            event_name: String::new(),
            collection: collection.into(),
            method: Method::Upsert,
            fields: Vec::new(),
        }
    }

    /// Start a delete against `collection`.
    pub fn delete(collection: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            ..Self::upsert(collection)
        }
    }

    pub fn with_event(mut self, event_name: impl Into<String>) -> Self {
        self.event_name = event_name.into();
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(Field::new(name, value));
        self
    }

    pub fn with_primary(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push(Field::primary(name, value));
        self
    }

    /// Decode a JSON payload. Rejects payloads without a target collection.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let projection: Projection = serde_json::from_slice(bytes)?;
        if projection.collection.is_empty() {
            return Err(DecodeError::MissingCollection);
        }
        Ok(projection)
    }

    /// Encode to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// The field used for key derivation.
    ///
    /// When several fields are marked primary the last one wins.
    pub fn primary_field(&self) -> Option<&Field> {
        self.fields.iter().rev().find(|field| field.is_primary)
    }

    /// Physical record key for this projection.
    pub fn key(&self) -> Vec<u8> {
        derive_key(self.primary_field().map(|field| &field.value))
    }
}

/// Build a record key from a primary value.
///
/// Without a primary value every projection of a collection lands on the
/// bare prefix, so the collection behaves as a single anonymous record.
/// Producers that omit the primary field on purpose get singleton
/// collections; producers that omit it by mistake overwrite one record.
pub fn derive_key(primary: Option<&Value>) -> Vec<u8> {
    let mut key = RECORD_PREFIX.to_vec();
    if let Some(value) = primary {
        // Value's Display is compact JSON with sorted object keys.
        key.extend_from_slice(value.to_string().as_bytes());
    }
    key
}

/// Overwrite `record` fields by name, leaving unmentioned fields intact.
pub fn merge_fields(record: &mut Record, fields: &[Field]) {
    for field in fields {
        record.insert(field.name.clone(), field.value.clone());
    }
}

/// Projection decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed projection: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Projection has no target collection")]
    MissingCollection,
}

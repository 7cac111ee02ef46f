//! Stored documents and identifier validation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::projection::ProjectionSpec;

/// Name of the primary key attribute of every record.
pub const ID_FIELD: &str = "_id";

/// A stored document: a JSON object whose `_id` attribute is its primary
/// key.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a JSON value. Returns `None` unless it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Record(map)),
            _ => None,
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str(ID_FIELD)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copy of this record holding only `_id` and the attributes in `spec`.
    /// An all-fields spec returns the whole record.
    pub fn project(&self, spec: &ProjectionSpec) -> Record {
        if spec.is_all() {
            return self.clone();
        }

        Record(
            self.0
                .iter()
                .filter(|(field, _)| field.as_str() == ID_FIELD || spec.contains(field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        )
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Record {
    fn from(map: Map<String, Value>) -> Self {
        Record(map)
    }
}

/// 24 hexadecimal characters: the textual form of a 12-byte object id.
pub fn is_object_id(id: &str) -> bool {
    id.len() == 24 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Which identifiers the store accepts. Ids that fail the check never reach
/// the store and load as "not found".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdFormat {
    /// 24-character hex object ids.
    #[default]
    ObjectId,
    /// Any non-empty string.
    Any,
}

impl IdFormat {
    pub fn accepts(&self, id: &str) -> bool {
        match self {
            IdFormat::ObjectId => is_object_id(id),
            IdFormat::Any => !id.is_empty(),
        }
    }
}

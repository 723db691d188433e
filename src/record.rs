//! A schemaless document record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::data::KeyedEntry;
use crate::fields::FieldSet;
use crate::key::ObjectId;

/// A record as returned by a document store: a JSON object whose `_id` field
/// identifies it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    data: Map<String, Value>,
}

impl Record {
    /// The field every record is identified by. It is returned whether or not
    /// a projection asks for it.
    pub const ID_FIELD: &'static str = "_id";

    pub fn new(data: Map<String, Value>) -> Self {
        Record { data }
    }

    /// Build a record from a JSON value; `None` if the value isn't an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(data) => Some(Record { data }),
            _ => None,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.data.get(Self::ID_FIELD).and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.data.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    pub fn into_inner(self) -> Map<String, Value> {
        self.data
    }

    /// Keep only the fields in `fields`, plus `_id`.
    pub fn project(&self, fields: &FieldSet) -> Record {
        let data = self
            .data
            .iter()
            .filter(|(name, _)| name.as_str() == Self::ID_FIELD || fields.contains(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        Record { data }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(data: Map<String, Value>) -> Self {
        Record { data }
    }
}

impl KeyedEntry<String> for Record {
    fn entry_key(&self) -> Option<String> {
        self.id().map(str::to_owned)
    }
}

impl KeyedEntry<ObjectId> for Record {
    fn entry_key(&self) -> Option<ObjectId> {
        self.id().and_then(|id| ObjectId::parse(id).ok())
    }
}

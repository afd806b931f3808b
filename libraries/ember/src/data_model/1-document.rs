//! # Document
//! Documents are what the remote store hands back: an id assigned by the store, plus a bag of JSON fields.
//! Ember doesn't know anything about the shape of those fields. Applications pick out the ones they care about.
//!
//! Timestamps travel as RFC 3339 strings. A field that the store has been asked to fill with its own clock
//! reads as `null` until the store resolves it, so timestamp accessors return `Option`.

use std::collections::BTreeSet;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

pub type Fields = serde_json::Map<String, Value>;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn string(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    /// `None` for absent fields, pending server timestamps (`null`) and anything that isn't RFC 3339.
    pub fn timestamp(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get(field).and_then(decode_timestamp)
    }
}

/// A document that hasn't been written yet.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NewDocument {
    pub fields: Fields,
    /// Fields the store fills in with its own clock when it commits the write.
    pub server_timestamps: BTreeSet<String>,
}

impl NewDocument {
    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            server_timestamps: BTreeSet::new(),
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        self.server_timestamps.remove(&field);
        self.fields.insert(field, value.into());
        self
    }

    pub fn with_server_timestamp(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        self.fields.remove(&field);
        self.server_timestamps.insert(field);
        self
    }

    /// The fields as they look before the store has resolved its timestamps.
    pub fn pending_fields(&self) -> Fields {
        let mut fields = self.fields.clone();
        for field in &self.server_timestamps {
            fields.insert(field.clone(), Value::Null);
        }
        fields
    }

    /// The fields with every server timestamp resolved to `now`.
    pub fn resolved_fields(&self, now: DateTime<Utc>) -> Fields {
        let mut fields = self.fields.clone();
        for field in &self.server_timestamps {
            fields.insert(field.clone(), encode_timestamp(now));
        }
        fields
    }
}

pub fn encode_timestamp(timestamp: DateTime<Utc>) -> Value {
    Value::String(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true))
}

pub fn decode_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

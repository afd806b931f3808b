//! # Query
//! A query selects documents from one collection using equality filters, optionally ordered by one field.
//! That is all the application needs, and it maps directly onto what managed stores can serve.
//!
//! Stores typically need a composite index to serve a filtered *and* ordered query. When that index is
//! missing the query fails, and the caller can retry with [`Query::without_order`] and sort locally.

use std::cmp::Ordering;

use serde_json::Value;

use crate::data_model::{Document, decode_timestamp};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Same filters, no ordering clause.
    pub fn without_order(&self) -> Self {
        Self {
            collection: self.collection.clone(),
            filters: self.filters.clone(),
            order_by: None,
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.filters
            .iter()
            .all(|filter| document.get(&filter.field) == Some(&filter.value))
    }

    pub fn needs_composite_index(&self) -> bool {
        match &self.order_by {
            Some(order) => self.filters.iter().any(|f| f.field != order.field),
            None => false,
        }
    }

    /// Sorts `documents` the way a store serving this query would. Unordered queries are left alone.
    pub fn sort(&self, documents: &mut [Document]) {
        let Some(order) = &self.order_by else {
            return;
        };
        documents.sort_by(|a, b| {
            let ordering = compare_field(a, b, &order.field);
            match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            }
        });
    }
}

/// Absent and `null` sort lowest, then timestamps, numbers and strings are each compared naturally.
pub fn compare_field(a: &Document, b: &Document, field: &str) -> Ordering {
    compare_values(a.get(field), b.get(field))
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(a)), Some(Value::Bool(b))) => a.cmp(b),
        (Some(Value::Number(a)), Some(Value::Number(b))) => {
            let a = a.as_f64().unwrap_or_default();
            let b = b.as_f64().unwrap_or_default();
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Some(a @ Value::String(sa)), Some(b @ Value::String(sb))) => {
            match (decode_timestamp(a), decode_timestamp(b)) {
                (Some(ta), Some(tb)) => ta.cmp(&tb),
                _ => sa.cmp(sb),
            }
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

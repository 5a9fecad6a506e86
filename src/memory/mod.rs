pub mod merge;
pub mod schema;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};

pub use schema::{Discarded, MemorySchema, FEEDBACK_SCHEMA, PERSONA_SCHEMA, RELATIONAL_SCHEMA};

/// A schema-conformant memory instance. Only [`MemoryStore`] produces these,
/// so every schema field is present and nothing else is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MemoryRecord(Map<String, Value>);

impl MemoryRecord {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn list(&self, field: &str) -> &[Value] {
        self.0
            .get(field)
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// `text` sub-key of each entry in a dated-text list.
    pub fn texts(&self, field: &str) -> Vec<&str> {
        self.list(field)
            .iter()
            .filter_map(|r| r.get("text").and_then(Value::as_str))
            .collect()
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

/// Validation and merge for one schema, with the date used to repair
/// malformed date sub-fields.
#[derive(Debug, Clone, Copy)]
pub struct MemoryStore {
    schema: &'static MemorySchema,
    fallback_date: NaiveDate,
}

impl MemoryStore {
    pub fn new(schema: &'static MemorySchema, fallback_date: NaiveDate) -> Self {
        Self {
            schema,
            fallback_date,
        }
    }

    pub fn schema(&self) -> &'static MemorySchema {
        self.schema
    }

    pub fn empty(&self) -> MemoryRecord {
        MemoryRecord(self.schema.defaults())
    }

    /// Normalize an arbitrary value into a conforming instance. Idempotent.
    pub fn validate(&self, value: &Value) -> MemoryRecord {
        MemoryRecord(self.schema.validate(value, self.fallback_date))
    }

    /// Coerce a partial update, keeping only the fields it actually carries.
    pub fn normalize_partial(&self, value: &Value) -> (Map<String, Value>, Vec<Discarded>) {
        self.schema.normalize_partial(value, self.fallback_date)
    }

    /// Merge a partial update into `current`, returning the new instance.
    /// `current` is never mutated, so a failed caller keeps its last valid state.
    pub fn merge(&self, current: &MemoryRecord, incoming: &Value) -> MemoryRecord {
        let (update, _) = self.normalize_partial(incoming);
        MemoryRecord(self.schema.merge_fields(&current.0, &update))
    }

    /// True when every field still holds its default.
    pub fn is_empty(&self, record: &MemoryRecord) -> bool {
        record.0 == self.schema.defaults()
    }
}

//! Persisted row representation.

use crate::orm::value::key_text;
use serde::Serialize;
use serde_json::{Map, Value};

/// Inbound or decoded field mapping.
pub type Data = Map<String, Value>;

/// One stored row decoded with its model's declared column types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub model: String,
    pub pk: Value,
    /// Every stored column, relation keys included.
    pub values: Data,
}

impl Record {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Textual primary key.
    pub fn key(&self) -> String {
        key_text(&self.pk)
    }
}

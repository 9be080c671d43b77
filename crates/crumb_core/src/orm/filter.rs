//! Query filter value objects.
//!
//! Filters are built by callers and applied in the order supplied. String
//! filters compare case-insensitively when the target field is flagged so.

use crate::orm::value::now_text;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    Equal { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    /// Strictly less than.
    Less { field: String, value: Value },
    /// Strictly greater than.
    More { field: String, value: Value },
    StartsWith { field: String, value: String },
    EndsWith { field: String, value: String },
    Contains { field: String, value: String },
}

impl Filter {
    pub fn equal(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equal {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn one_of<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self::In {
            field: field.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn less(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Less {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn more(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::More {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn starts_with(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::StartsWith {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ends_with(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::EndsWith {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Datetime field strictly before now.
    pub fn past(field: impl Into<String>) -> Self {
        Self::less(field, now_text())
    }

    /// Datetime field strictly after now.
    pub fn future(field: impl Into<String>) -> Self {
        Self::more(field, now_text())
    }

    pub fn field(&self) -> &str {
        match self {
            Self::Equal { field, .. }
            | Self::In { field, .. }
            | Self::Less { field, .. }
            | Self::More { field, .. }
            | Self::StartsWith { field, .. }
            | Self::EndsWith { field, .. }
            | Self::Contains { field, .. } => field,
        }
    }
}

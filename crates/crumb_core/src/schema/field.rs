//! Scalar field and relation declarations.
//!
//! # Responsibility
//! - Describe stored columns (type, nullability, uniqueness, generation).
//! - Describe forward relations and the reverse side derived from them.
//! - Check runtime JSON values against a declared scalar type.
//!
//! # Invariants
//! - A field is required iff it is non-nullable, not generated, not an
//!   auto-timestamp and has no default.
//! - A relation's key column type always equals the target primary key type.

use chrono::{DateTime, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Native type of one stored column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Int,
    Float,
    /// Short string.
    Str,
    /// Long free-form string.
    Text,
    Bool,
    /// String restricted to a fixed set of choices.
    Enum(Vec<String>),
    /// Calendar date as `YYYY-MM-DD`.
    Date,
    /// RFC 3339 timestamp.
    DateTime,
    Uuid,
}

impl ScalarType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Text => "text",
            Self::Bool => "bool",
            Self::Enum(_) => "enum",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Uuid => "uuid",
        }
    }

    /// Returns whether values of this type are stored as text.
    pub fn is_textual(&self) -> bool {
        !matches!(self, Self::Int | Self::Float | Self::Bool)
    }

    /// Returns whether a non-null JSON value conforms to this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::Int => value.as_i64().is_some(),
            Self::Float => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Str | Self::Text | Self::Enum(_) => value.is_string(),
            Self::Date => value
                .as_str()
                .is_some_and(|text| NaiveDate::parse_from_str(text, DATE_FORMAT).is_ok()),
            Self::DateTime => value
                .as_str()
                .is_some_and(|text| DateTime::parse_from_rfc3339(text).is_ok()),
            Self::Uuid => value
                .as_str()
                .is_some_and(|text| Uuid::parse_str(text).is_ok()),
        }
    }
}

/// Declarative value constraint checked after the type check.
#[derive(Debug, Clone)]
pub enum Validator {
    MinLength(usize),
    MaxLength(usize),
    MinValue(f64),
    MaxValue(f64),
    Pattern(Regex),
}

impl Validator {
    /// Checks one non-null value. Values of a shape the validator does not
    /// understand pass untouched; the type check owns those.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        match self {
            Self::MinLength(min) => match value.as_str() {
                Some(text) if text.chars().count() < *min => Err(format!(
                    "ensure this value has at least {min} characters"
                )),
                _ => Ok(()),
            },
            Self::MaxLength(max) => match value.as_str() {
                Some(text) if text.chars().count() > *max => Err(format!(
                    "ensure this value has at most {max} characters"
                )),
                _ => Ok(()),
            },
            Self::MinValue(min) => match value.as_f64() {
                Some(number) if number < *min => {
                    Err(format!("ensure this value is greater than or equal to {min}"))
                }
                _ => Ok(()),
            },
            Self::MaxValue(max) => match value.as_f64() {
                Some(number) if number > *max => {
                    Err(format!("ensure this value is less than or equal to {max}"))
                }
                _ => Ok(()),
            },
            Self::Pattern(pattern) => match value.as_str() {
                Some(text) if !pattern.is_match(text) => {
                    Err(format!("value does not match pattern `{}`", pattern.as_str()))
                }
                _ => Ok(()),
            },
        }
    }
}

/// One stored scalar column.
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: ScalarType,
    pub nullable: bool,
    pub unique: bool,
    /// Value is produced by storage or the engine (auto-increment, generated UUID).
    pub generated: bool,
    /// Refreshed with the current time on every write.
    pub auto_now: bool,
    /// Filled with the current time on insert only.
    pub auto_now_add: bool,
    pub default: Option<Value>,
    /// Equality, uniqueness and string filters ignore case.
    pub case_insensitive: bool,
    pub validators: Vec<Validator>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: ScalarType) -> Self {
        Self {
            name: name.into(),
            ty,
            nullable: false,
            unique: false,
            generated: false,
            auto_now: false,
            auto_now_add: false,
            default: None,
            case_insensitive: false,
            validators: Vec::new(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn auto_now(mut self) -> Self {
        self.auto_now = true;
        self
    }

    pub fn auto_now_add(mut self) -> Self {
        self.auto_now_add = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    pub fn validator(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    pub fn is_auto_timestamp(&self) -> bool {
        self.auto_now || self.auto_now_add
    }

    pub fn is_required(&self) -> bool {
        !self.nullable && !self.generated && !self.is_auto_timestamp() && self.default.is_none()
    }
}

/// Cardinality of a declared relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    ForeignKey,
    /// Accepted by the registry but rejected when a description is built.
    ManyToMany,
}

/// Relation declared on the owning model, which stores the key column.
#[derive(Debug, Clone)]
pub struct RelationDef {
    /// Object-valued accessor, e.g. `author`.
    pub name: String,
    pub kind: RelationKind,
    /// Target model name.
    pub target: String,
    /// Key-valued column, e.g. `author_id`.
    pub source_field: String,
    /// Reverse accessor registered on the target model.
    pub related_name: Option<String>,
    pub nullable: bool,
    pub(crate) key_type: Option<ScalarType>,
}

impl RelationDef {
    fn declare(name: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source_field: format!("{name}_id"),
            name,
            kind,
            target: target.into(),
            related_name: None,
            nullable: false,
            key_type: None,
        }
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::declare(name, RelationKind::OneToOne, target)
    }

    pub fn foreign_key(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::declare(name, RelationKind::ForeignKey, target)
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::declare(name, RelationKind::ManyToMany, target)
    }

    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        self.related_name = Some(name.into());
        self
    }

    pub fn source_field(mut self, name: impl Into<String>) -> Self {
        self.source_field = name.into();
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Type of the key column. Known once the relation belongs to a registry.
    pub fn key_type(&self) -> Option<&ScalarType> {
        self.key_type.as_ref()
    }

    pub fn is_required(&self) -> bool {
        !self.nullable
    }
}

/// Reverse side of a relation, derived on the target model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseRelation {
    /// Accessor on the target model (the forward relation's `related_name`).
    pub name: String,
    pub kind: RelationKind,
    /// Model declaring the forward relation.
    pub source_model: String,
    /// Forward relation name on the source model.
    pub relation_field: String,
    /// Key column on the source model.
    pub source_field: String,
}

impl ReverseRelation {
    pub fn is_many(&self) -> bool {
        self.kind == RelationKind::ForeignKey
    }
}

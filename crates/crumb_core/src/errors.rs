//! Validation error tree and repository error types.
//!
//! # Responsibility
//! - Model recoverable validation problems as a tree mirroring the payload.
//! - Separate fatal configuration problems from bad user input.
//!
//! # Invariants
//! - Validation returns the complete tree, never a first-error-only result.
//! - `ConfigError` values signal programming errors and are never collected
//!   into an `ObjectErrors` tree.

use crate::db::DbError;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Key under which cross-field errors are reported.
pub const ROOT_KEY: &str = "__root__";

pub type RepoResult<T> = Result<T, RepoError>;

/// Category of a recoverable field problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldErrorKind {
    /// Payload key is not declared on the model, or is hidden.
    UnexpectedKey,
    /// Runtime value type does not match the declared type.
    InvalidType,
    /// `null` supplied for a non-nullable field.
    FieldRequired,
    /// Required field absent from a creation payload.
    RequiredMissed {
        field: String,
        related: Option<String>,
    },
    NotUnique,
    /// Referenced row does not exist.
    NotFoundFk,
    /// Rejected by a declared or custom validator.
    ValidationFailed { key: String },
}

/// Leaf of the error tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    kind: FieldErrorKind,
    message: String,
}

impl FieldError {
    pub fn new(kind: FieldErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn unexpected_key(message: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::UnexpectedKey, message)
    }

    pub fn invalid_type(message: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::InvalidType, message)
    }

    pub fn field_required() -> Self {
        Self::new(FieldErrorKind::FieldRequired, "this field is required")
    }

    pub fn required_missed(field: impl Into<String>, related: Option<String>) -> Self {
        let field = field.into();
        let message = match &related {
            Some(related) => format!("required field missed: {field} or {related}"),
            None => format!("required field missed: {field}"),
        };
        Self::new(FieldErrorKind::RequiredMissed { field, related }, message)
    }

    pub fn not_unique() -> Self {
        Self::new(FieldErrorKind::NotUnique, "value is not unique")
    }

    pub fn not_found_fk() -> Self {
        Self::new(FieldErrorKind::NotFoundFk, "referenced record does not exist")
    }

    pub fn validation_failed(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(FieldErrorKind::ValidationFailed { key: key.into() }, message)
    }

    pub fn kind(&self) -> &FieldErrorKind {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stable machine-readable code.
    pub fn key(&self) -> &str {
        match &self.kind {
            FieldErrorKind::UnexpectedKey => "unexpected_key",
            FieldErrorKind::InvalidType => "invalid_type",
            FieldErrorKind::FieldRequired => "required_field",
            FieldErrorKind::RequiredMissed { .. } => "required_missed",
            FieldErrorKind::NotUnique => "not_unique",
            FieldErrorKind::NotFoundFk => "not_found_fk",
            FieldErrorKind::ValidationFailed { key } => key.as_str(),
        }
    }
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key(), self.message)
    }
}

impl Error for FieldError {}

impl Serialize for FieldError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("key", self.key())?;
        map.serialize_entry("msg", &self.message)?;
        if let FieldErrorKind::RequiredMissed { field, related } = &self.kind {
            map.serialize_entry("field_name", field)?;
            map.serialize_entry("related", related)?;
        }
        map.end()
    }
}

/// One node of the error tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorNode {
    Field(FieldError),
    Object(ObjectErrors),
    List(ListFieldError),
}

impl ErrorNode {
    pub fn as_field(&self) -> Option<&FieldError> {
        match self {
            Self::Field(error) => Some(error),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectErrors> {
        match self {
            Self::Object(errors) => Some(errors),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&ListFieldError> {
        match self {
            Self::List(errors) => Some(errors),
            _ => None,
        }
    }
}

impl From<FieldError> for ErrorNode {
    fn from(value: FieldError) -> Self {
        Self::Field(value)
    }
}

impl From<ObjectErrors> for ErrorNode {
    fn from(value: ObjectErrors) -> Self {
        Self::Object(value)
    }
}

impl From<ListFieldError> for ErrorNode {
    fn from(value: ListFieldError) -> Self {
        Self::List(value)
    }
}

impl Serialize for ErrorNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Field(error) => error.serialize(serializer),
            Self::Object(errors) => errors.serialize(serializer),
            Self::List(errors) => errors.serialize(serializer),
        }
    }
}

/// Errors of one mapping: per-field nodes plus cross-field root errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectErrors {
    errors: BTreeMap<String, ErrorNode>,
    root: Vec<FieldError>,
}

impl ObjectErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches an error to `field`; `__root__` appends a root error instead.
    pub fn add(&mut self, field: impl Into<String>, error: impl Into<ErrorNode>) -> &mut Self {
        let field = field.into();
        match error.into() {
            ErrorNode::Field(error) if field == ROOT_KEY => self.root.push(error),
            node => {
                self.errors.insert(field, node);
            }
        }
        self
    }

    pub fn add_root(&mut self, error: FieldError) -> &mut Self {
        self.root.push(error);
        self
    }

    /// Builder-style variant of [`ObjectErrors::add`].
    pub fn with(mut self, field: impl Into<String>, error: impl Into<ErrorNode>) -> Self {
        self.add(field, error);
        self
    }

    pub fn merge(&mut self, other: ObjectErrors) -> &mut Self {
        self.errors.extend(other.errors);
        self.root.extend(other.root);
        self
    }

    pub fn get(&self, field: &str) -> Option<&ErrorNode> {
        self.errors.get(field)
    }

    pub fn field(&self, field: &str) -> Option<&FieldError> {
        self.get(field).and_then(ErrorNode::as_field)
    }

    pub fn root(&self) -> &[FieldError] {
        &self.root
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &ErrorNode)> {
        self.errors.iter().map(|(name, node)| (name.as_str(), node))
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.root.is_empty()
    }

    /// Total count of leaf errors in this subtree.
    pub fn len(&self) -> usize {
        self.root.len()
            + self
                .errors
                .values()
                .map(|node| match node {
                    ErrorNode::Field(_) => 1,
                    ErrorNode::Object(errors) => errors.len(),
                    ErrorNode::List(errors) => errors.iter().map(|(_, e)| e.len()).sum(),
                })
                .sum::<usize>()
    }

    pub fn into_result(self) -> Result<(), ObjectErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Display for ObjectErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let fields: Vec<&str> = self.errors.keys().map(String::as_str).collect();
        write!(
            f,
            "validation failed with {} error(s) on [{}]",
            self.len(),
            fields.join(", ")
        )?;
        if !self.root.is_empty() {
            write!(f, " and {} root error(s)", self.root.len())?;
        }
        Ok(())
    }
}

impl Error for ObjectErrors {}

impl Serialize for ObjectErrors {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (field, node) in &self.errors {
            map.serialize_entry(field, node)?;
        }
        if !self.root.is_empty() {
            map.serialize_entry(ROOT_KEY, &self.root)?;
        }
        map.end()
    }
}

/// Positional errors of a repeated child collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFieldError {
    items: BTreeMap<usize, ObjectErrors>,
}

impl ListFieldError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, index: usize, errors: ObjectErrors) {
        self.items.insert(index, errors);
    }

    /// Returns the errors of row `index`, creating an empty entry when absent.
    pub fn entry(&mut self, index: usize) -> &mut ObjectErrors {
        self.items.entry(index).or_default()
    }

    pub fn get(&self, index: usize) -> Option<&ObjectErrors> {
        self.items.get(&index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.items.contains_key(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ObjectErrors)> {
        self.items.iter().map(|(index, errors)| (*index, errors))
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}

impl Display for ListFieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let rows: Vec<String> = self.items.keys().map(usize::to_string).collect();
        write!(f, "invalid rows: [{}]", rows.join(", "))
    }
}

impl Error for ListFieldError {}

impl Serialize for ListFieldError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.items.len()))?;
        for (index, errors) in &self.items {
            map.serialize_entry(&index.to_string(), errors)?;
        }
        map.end()
    }
}

/// Fatal programming/configuration problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    DuplicateModel(String),
    UnknownModel(String),
    UnknownField {
        model: String,
        field: String,
    },
    /// Many-to-many relations have no defined cascade semantics.
    ManyToMany {
        model: String,
        field: String,
    },
    InvalidModel {
        model: String,
        reason: String,
    },
    NotAValuesList(String),
    NotARelation {
        model: String,
        field: String,
    },
    ReadOnly {
        model: String,
        method: &'static str,
    },
    InstanceRequired {
        model: String,
        method: &'static str,
    },
    InstanceNotExpected {
        model: String,
    },
    OwnerRequired {
        model: String,
    },
    /// Both representations of one relation were supplied.
    AmbiguousPair {
        model: String,
        field: String,
        pair: String,
    },
    /// An existing-child key was supplied while the parent is being created.
    PkOnCreate {
        model: String,
        field: String,
    },
    UnexpectedListColumn {
        model: String,
        column: String,
    },
    MissingListColumns {
        model: String,
        columns: Vec<String>,
    },
    InvalidOrdering(i64),
    InvalidSort {
        model: String,
        field: String,
    },
    InvalidFilter {
        model: String,
        field: String,
        reason: String,
    },
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateModel(model) => write!(f, "model `{model}` is declared twice"),
            Self::UnknownModel(model) => write!(f, "model `{model}` is not registered"),
            Self::UnknownField { model, field } => {
                write!(f, "field `{field}` is not declared on `{model}`")
            }
            Self::ManyToMany { model, field } => write!(
                f,
                "many-to-many relation `{model}.{field}` is not supported"
            ),
            Self::InvalidModel { model, reason } => {
                write!(f, "model `{model}` is misconfigured: {reason}")
            }
            Self::NotAValuesList(model) => write!(f, "model `{model}` is not a values list"),
            Self::NotARelation { model, field } => {
                write!(f, "field `{model}.{field}` is not a relation")
            }
            Self::ReadOnly { model, method } => {
                write!(f, "repository of `{model}` is read-only; `{method}` refused")
            }
            Self::InstanceRequired { model, method } => {
                write!(f, "`{method}` on `{model}` requires a loaded instance")
            }
            Self::InstanceNotExpected { model } => write!(
                f,
                "repository of `{model}` already holds an instance; create a new one"
            ),
            Self::OwnerRequired { model } => {
                write!(f, "values list `{model}` requires an owner row")
            }
            Self::AmbiguousPair { model, field, pair } => write!(
                f,
                "`{model}.{field}` and `{model}.{pair}` were supplied together"
            ),
            Self::PkOnCreate { model, field } => write!(
                f,
                "`{model}.{field}` items may carry `pk` only when editing"
            ),
            Self::UnexpectedListColumn { model, column } => {
                write!(f, "column `{column}` cannot be written to values list `{model}`")
            }
            Self::MissingListColumns { model, columns } => write!(
                f,
                "values list `{model}` misses required columns [{}]",
                columns.join(", ")
            ),
            Self::InvalidOrdering(value) => write!(f, "ordering must be >= 1, got {value}"),
            Self::InvalidSort { model, field } => {
                write!(f, "cannot sort `{model}` by unknown field `{field}`")
            }
            Self::InvalidFilter {
                model,
                field,
                reason,
            } => write!(f, "invalid filter on `{model}.{field}`: {reason}"),
        }
    }
}

impl Error for ConfigError {}

/// Error returned by repository operations.
#[derive(Debug)]
pub enum RepoError {
    /// Recoverable validation failure carrying the complete tree.
    Invalid(ObjectErrors),
    /// Recoverable failure of a standalone values-list validation.
    InvalidRows(ListFieldError),
    NotFound {
        model: String,
        key: String,
    },
    /// A repository hook refused the operation.
    Rejected(String),
    Config(ConfigError),
    Db(DbError),
    /// Persisted state cannot be decoded into the declared types.
    InvalidData(String),
}

impl RepoError {
    pub fn object_errors(&self) -> Option<&ObjectErrors> {
        match self {
            Self::Invalid(errors) => Some(errors),
            _ => None,
        }
    }

    pub fn config_error(&self) -> Option<&ConfigError> {
        match self {
            Self::Config(error) => Some(error),
            _ => None,
        }
    }

    /// Short error code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Invalid(_) | Self::InvalidRows(_) => "invalid",
            Self::NotFound { .. } => "not_found",
            Self::Rejected(_) => "rejected",
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::InvalidData(_) => "invalid_data",
        }
    }
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(errors) => write!(f, "{errors}"),
            Self::InvalidRows(errors) => write!(f, "{errors}"),
            Self::NotFound { model, key } => write!(f, "{model} not found: {key}"),
            Self::Rejected(reason) => write!(f, "operation rejected: {reason}"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Invalid(err) => Some(err),
            Self::InvalidRows(err) => Some(err),
            Self::Config(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound { .. } | Self::Rejected(_) | Self::InvalidData(_) => None,
        }
    }
}

impl From<ObjectErrors> for RepoError {
    fn from(value: ObjectErrors) -> Self {
        Self::Invalid(value)
    }
}

impl From<ListFieldError> for RepoError {
    fn from(value: ListFieldError) -> Self {
        Self::InvalidRows(value)
    }
}

impl From<ConfigError> for RepoError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

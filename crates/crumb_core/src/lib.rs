//! Core persistence engine for Crumb.
//! Declarative models are validated, persisted and reconciled here, together
//! with every related row a nested payload carries.

pub mod db;
pub mod errors;
pub mod logging;
pub mod orm;
pub mod repo;
pub mod schema;

pub use db::{open_db, open_db_in_memory, DbError, DbResult, Migration};
pub use errors::{
    ConfigError, ErrorNode, FieldError, FieldErrorKind, ListFieldError, ObjectErrors, RepoError,
    RepoResult,
};
pub use logging::{default_log_level, init_logging, init_logging_with, logging_status, LoggingConfig};
pub use orm::{Data, Filter, Record, Selection};
pub use repo::{
    NoHooks, Repository, RepositoryHooks, ValuesListData, ValuesListRepository, WriteContext,
};
pub use schema::{
    describe, FieldCategory, FieldDef, ModelDef, Registry, RelationDef, ScalarType,
    SchemaDescription, Validator,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

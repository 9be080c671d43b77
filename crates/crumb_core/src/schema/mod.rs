//! Declarative model schema: fields, relations, registry and the derived
//! per-model field taxonomy.

pub mod field;
pub mod model;
pub mod taxonomy;

pub use field::{FieldDef, RelationDef, RelationKind, ReverseRelation, ScalarType, Validator};
pub use model::{Column, ModelDef, ModelKind, Registry, ORDERING_FIELD, OWNER_RELATION, PK_ALIAS};
pub use taxonomy::{describe, FieldCategory, SchemaDescription};

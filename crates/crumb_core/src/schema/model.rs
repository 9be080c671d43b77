//! Model declarations and the frozen model registry.
//!
//! # Responsibility
//! - Hold per-model ORM metadata plus repository options.
//! - Resolve relation targets and derive reverse relations once.
//!
//! # Invariants
//! - Registered models are immutable; descriptions are cached per model.
//! - The primary key is always the first declared field.
//! - Values-list models have a string primary key, an `ordering` integer
//!   column and an `owner` foreign key.

use crate::errors::ConfigError;
use crate::repo::hooks::{NoHooks, RepositoryHooks};
use crate::schema::field::{FieldDef, RelationDef, RelationKind, ReverseRelation, ScalarType};
use crate::schema::taxonomy::SchemaDescription;
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Column name holding the dense 1-based position of a values-list row.
pub const ORDERING_FIELD: &str = "ordering";
/// Relation name linking a values-list row to its owner.
pub const OWNER_RELATION: &str = "owner";
/// Payload alias for the primary key of an existing child row.
pub const PK_ALIAS: &str = "pk";

/// Repository flavor of a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Regular,
    /// Ordered child rows addressed by `(owner key, ordering)`.
    ValuesList,
}

/// Stored column view over a scalar field or a relation key.
#[derive(Debug, Clone, Copy)]
pub struct Column<'m> {
    pub name: &'m str,
    pub ty: &'m ScalarType,
    pub case_insensitive: bool,
}

/// Model metadata plus the options of its repository.
pub struct ModelDef {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
    pub reverse: Vec<ReverseRelation>,
    /// Never accepted from inbound payloads.
    pub hidden_fields: BTreeSet<String>,
    /// Non-column inputs accepted and routed to the `extra` bucket.
    pub extra_allowed: BTreeMap<String, ScalarType>,
    /// Computed values; accepted and routed to the `extra` bucket.
    pub calculated: BTreeMap<String, ScalarType>,
    pub read_only: bool,
    pub kind: ModelKind,
    pub hooks: Arc<dyn RepositoryHooks>,
    description: OnceCell<SchemaDescription>,
}

impl ModelDef {
    /// Declares a model whose table shares its name.
    pub fn new(name: impl Into<String>, pk: FieldDef) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            fields: vec![pk],
            relations: Vec::new(),
            reverse: Vec::new(),
            hidden_fields: BTreeSet::new(),
            extra_allowed: BTreeMap::new(),
            calculated: BTreeMap::new(),
            read_only: false,
            kind: ModelKind::Regular,
            hooks: Arc::new(NoHooks),
            description: OnceCell::new(),
        }
    }

    /// Declares an ordered child-row model owned by `owner`, reachable from
    /// the owner through `related_name`.
    ///
    /// The synthetic key, owner link and ordering are repository-maintained
    /// and therefore hidden from inbound payloads.
    pub fn values_list(
        name: impl Into<String>,
        owner: impl Into<String>,
        related_name: impl Into<String>,
    ) -> Self {
        let mut model = Self::new(name, FieldDef::new("id", ScalarType::Str))
            .field(FieldDef::new(ORDERING_FIELD, ScalarType::Int))
            .relation(RelationDef::foreign_key(OWNER_RELATION, owner).related_name(related_name));
        model.kind = ModelKind::ValuesList;
        for hidden in ["id", OWNER_RELATION, "owner_id", ORDERING_FIELD] {
            model.hidden_fields.insert(hidden.to_string());
        }
        model
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    pub fn relation(mut self, relation: RelationDef) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn hidden(mut self, name: impl Into<String>) -> Self {
        self.hidden_fields.insert(name.into());
        self
    }

    pub fn extra_allowed(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.extra_allowed.insert(name.into(), ty);
        self
    }

    pub fn calculated(mut self, name: impl Into<String>, ty: ScalarType) -> Self {
        self.calculated.insert(name.into(), ty);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn hooks(mut self, hooks: impl RepositoryHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn pk_field(&self) -> &FieldDef {
        &self.fields[0]
    }

    pub fn pk_name(&self) -> &str {
        &self.fields[0].name
    }

    pub fn field_def(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn relation_def(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|relation| relation.name == name)
    }

    /// Finds the relation whose key column is `source_field`.
    pub fn relation_by_source(&self, source_field: &str) -> Option<&RelationDef> {
        self.relations
            .iter()
            .find(|relation| relation.source_field == source_field)
    }

    pub fn reverse_def(&self, name: &str) -> Option<&ReverseRelation> {
        self.reverse.iter().find(|reverse| reverse.name == name)
    }

    pub fn is_case_insensitive(&self, name: &str) -> bool {
        self.column(name).is_some_and(|column| column.case_insensitive)
    }

    /// Resolves a stored column; `pk` aliases the primary key.
    pub fn column(&self, name: &str) -> Option<Column<'_>> {
        let name = if name == PK_ALIAS { self.pk_name() } else { name };
        if let Some(field) = self.field_def(name) {
            return Some(Column {
                name: field.name.as_str(),
                ty: &field.ty,
                case_insensitive: field.case_insensitive,
            });
        }
        self.relation_by_source(name).and_then(|relation| {
            relation.key_type.as_ref().map(|ty| Column {
                name: relation.source_field.as_str(),
                ty,
                case_insensitive: false,
            })
        })
    }

    /// All stored columns: scalar fields first, then relation keys.
    pub fn columns(&self) -> Vec<Column<'_>> {
        let scalars = self.fields.iter().map(|field| Column {
            name: field.name.as_str(),
            ty: &field.ty,
            case_insensitive: field.case_insensitive,
        });
        let keys = self
            .relations
            .iter()
            .filter(|relation| relation.kind != RelationKind::ManyToMany)
            .filter_map(|relation| {
                relation.key_type.as_ref().map(|ty| Column {
                    name: relation.source_field.as_str(),
                    ty,
                    case_insensitive: false,
                })
            });
        scalars.chain(keys).collect()
    }

    pub(crate) fn description_cell(&self) -> &OnceCell<SchemaDescription> {
        &self.description
    }

    fn check_values_list_shape(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidModel {
            model: self.name.clone(),
            reason: reason.to_string(),
        };
        if self.pk_field().ty != ScalarType::Str || self.pk_field().generated {
            return Err(invalid("values list key must be a non-generated string"));
        }
        match self.field_def(ORDERING_FIELD) {
            Some(field) if field.ty == ScalarType::Int => {}
            _ => return Err(invalid("values list needs an integer `ordering` field")),
        }
        match self.relation_def(OWNER_RELATION) {
            Some(relation) if relation.kind == RelationKind::ForeignKey => Ok(()),
            _ => Err(invalid("values list needs an `owner` foreign key")),
        }
    }
}

impl Debug for ModelDef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelDef")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("fields", &self.fields)
            .field("relations", &self.relations)
            .field("reverse", &self.reverse)
            .field("hidden_fields", &self.hidden_fields)
            .field("kind", &self.kind)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Frozen set of models addressable by name.
///
/// Usually held in a process-wide `once_cell::sync::Lazy` so that schema
/// descriptions are computed once for the process lifetime.
#[derive(Debug)]
pub struct Registry {
    models: BTreeMap<String, ModelDef>,
}

impl Registry {
    /// Registers models, resolves relation key types and derives reverse sides.
    ///
    /// # Errors
    /// - Duplicate model names or unknown relation targets.
    /// - Reverse accessor names clashing with declared fields.
    /// - Values-list models missing their key/ordering/owner columns.
    pub fn new(models: impl IntoIterator<Item = ModelDef>) -> Result<Self, ConfigError> {
        let mut registered: BTreeMap<String, ModelDef> = BTreeMap::new();
        for model in models {
            if registered.contains_key(&model.name) {
                return Err(ConfigError::DuplicateModel(model.name));
            }
            registered.insert(model.name.clone(), model);
        }

        let mut derived: Vec<(String, ReverseRelation)> = Vec::new();
        let mut key_types: Vec<(String, usize, ScalarType)> = Vec::new();
        for model in registered.values() {
            for (index, relation) in model.relations.iter().enumerate() {
                let target = registered
                    .get(&relation.target)
                    .ok_or_else(|| ConfigError::UnknownModel(relation.target.clone()))?;
                key_types.push((model.name.clone(), index, target.pk_field().ty.clone()));

                if relation.kind == RelationKind::ManyToMany {
                    continue;
                }
                if let Some(related_name) = &relation.related_name {
                    derived.push((
                        relation.target.clone(),
                        ReverseRelation {
                            name: related_name.clone(),
                            kind: relation.kind,
                            source_model: model.name.clone(),
                            relation_field: relation.name.clone(),
                            source_field: relation.source_field.clone(),
                        },
                    ));
                }
            }
        }

        for (model_name, index, key_type) in key_types {
            if let Some(model) = registered.get_mut(&model_name) {
                model.relations[index].key_type = Some(key_type);
            }
        }

        for (target, reverse) in derived {
            let Some(model) = registered.get_mut(&target) else {
                return Err(ConfigError::UnknownModel(target));
            };
            let clashes = model.field_def(&reverse.name).is_some()
                || model.relation_def(&reverse.name).is_some()
                || model.relation_by_source(&reverse.name).is_some()
                || model.reverse_def(&reverse.name).is_some();
            if clashes {
                return Err(ConfigError::InvalidModel {
                    model: target,
                    reason: format!("reverse accessor `{}` clashes with a field", reverse.name),
                });
            }
            model.reverse.push(reverse);
        }

        for model in registered.values() {
            if model.kind == ModelKind::ValuesList {
                model.check_values_list_shape()?;
            }
        }

        Ok(Self {
            models: registered,
        })
    }

    pub fn model(&self, name: &str) -> Result<&ModelDef, ConfigError> {
        self.models
            .get(name)
            .ok_or_else(|| ConfigError::UnknownModel(name.to_string()))
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.values()
    }
}

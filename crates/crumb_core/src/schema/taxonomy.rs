//! Field taxonomy and cached schema descriptions.
//!
//! # Responsibility
//! - Classify every declared field of a model into one `FieldCategory`.
//! - Derive the `required` and `pairs` maps used by validation.
//!
//! # Invariants
//! - Every declared field maps to exactly one category.
//! - A description is computed at most once per registered model.
//! - Many-to-many relations never produce a description.

use crate::errors::ConfigError;
use crate::schema::field::RelationKind;
use crate::schema::model::{ModelDef, ModelKind, Registry};
use log::debug;
use std::collections::BTreeMap;

/// Role of one payload key with respect to its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldCategory {
    /// Stored scalar column.
    Scalar,
    /// Related row supplied in-line as a nested mapping.
    ObjectRelation(RelationKind),
    /// Related row supplied as its key.
    KeyRelation(RelationKind),
    /// One-to-one owned by the other side.
    ReverseSingle,
    /// One-to-many owned by the other side.
    ReverseMany,
    Hidden,
    Calculated,
    ExtraAllowed,
}

impl FieldCategory {
    pub fn is_relation(self) -> bool {
        matches!(
            self,
            Self::ObjectRelation(_) | Self::KeyRelation(_) | Self::ReverseSingle | Self::ReverseMany
        )
    }
}

/// Required-field map: field name to its paired alternative, if any.
pub type RequiredMap = BTreeMap<String, Option<String>>;
/// Pair map: each relation representation to its alternate.
pub type PairMap = BTreeMap<String, String>;

/// Materialized taxonomy of one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaDescription {
    pub model: String,
    pub all: BTreeMap<String, FieldCategory>,
    pub required: RequiredMap,
    pub pairs: PairMap,
}

impl SchemaDescription {
    pub fn category(&self, name: &str) -> Option<FieldCategory> {
        self.all.get(name).copied()
    }

    /// Field names of one category, in name order.
    pub fn fields_in(&self, category: FieldCategory) -> impl Iterator<Item = &str> {
        self.all
            .iter()
            .filter(move |(_, current)| **current == category)
            .map(|(name, _)| name.as_str())
    }

    /// Fresh copies of the required and pair maps for one validation pass.
    pub fn required_and_pairs(&self) -> (RequiredMap, PairMap) {
        (self.required.clone(), self.pairs.clone())
    }
}

/// Returns the cached description of `model_name`, building it on first use.
///
/// # Errors
/// - `UnknownModel` when the model is not registered.
/// - `ManyToMany` when the model declares a many-to-many relation.
/// - `InvalidModel` when a values-list model exposes non-tabular fields.
pub fn describe<'r>(
    registry: &'r Registry,
    model_name: &str,
) -> Result<&'r SchemaDescription, ConfigError> {
    let model = registry.model(model_name)?;
    describe_model(model)
}

pub(crate) fn describe_model(model: &ModelDef) -> Result<&SchemaDescription, ConfigError> {
    model.description_cell().get_or_try_init(|| {
        let description = build_description(model)?;
        debug!(
            "event=schema_describe module=schema status=ok model={} fields={} required={}",
            model.name,
            description.all.len(),
            description.required.len()
        );
        Ok(description)
    })
}

fn build_description(model: &ModelDef) -> Result<SchemaDescription, ConfigError> {
    let hidden = |name: &str| model.hidden_fields.contains(name);
    let mut all = BTreeMap::new();
    let mut required = RequiredMap::new();
    let mut pairs = PairMap::new();

    for relation in &model.relations {
        if relation.kind == RelationKind::ManyToMany {
            return Err(ConfigError::ManyToMany {
                model: model.name.clone(),
                field: relation.name.clone(),
            });
        }

        let object_visible = !hidden(&relation.name);
        let key_visible = !hidden(&relation.source_field);
        all.insert(
            relation.name.clone(),
            if object_visible {
                FieldCategory::ObjectRelation(relation.kind)
            } else {
                FieldCategory::Hidden
            },
        );
        all.insert(
            relation.source_field.clone(),
            if key_visible {
                FieldCategory::KeyRelation(relation.kind)
            } else {
                FieldCategory::Hidden
            },
        );

        if object_visible && key_visible {
            pairs.insert(relation.name.clone(), relation.source_field.clone());
            pairs.insert(relation.source_field.clone(), relation.name.clone());
        }
        if relation.is_required() {
            match (object_visible, key_visible) {
                (true, true) => {
                    required.insert(relation.name.clone(), Some(relation.source_field.clone()));
                    required.insert(relation.source_field.clone(), Some(relation.name.clone()));
                }
                (true, false) => {
                    required.insert(relation.name.clone(), None);
                }
                (false, true) => {
                    required.insert(relation.source_field.clone(), None);
                }
                (false, false) => {}
            }
        }
    }

    for reverse in &model.reverse {
        let category = if hidden(&reverse.name) {
            FieldCategory::Hidden
        } else if reverse.is_many() {
            FieldCategory::ReverseMany
        } else {
            FieldCategory::ReverseSingle
        };
        all.insert(reverse.name.clone(), category);
    }

    for field in &model.fields {
        if all.contains_key(&field.name) {
            continue;
        }
        if hidden(&field.name) {
            all.insert(field.name.clone(), FieldCategory::Hidden);
            continue;
        }
        all.insert(field.name.clone(), FieldCategory::Scalar);
        if field.is_required() {
            required.insert(field.name.clone(), None);
        }
    }

    for name in model.calculated.keys() {
        all.entry(name.clone()).or_insert(FieldCategory::Calculated);
    }
    for name in model.extra_allowed.keys() {
        all.entry(name.clone()).or_insert(FieldCategory::ExtraAllowed);
    }

    if model.kind == ModelKind::ValuesList {
        let tabular = all.values().all(|category| {
            matches!(
                category,
                FieldCategory::Scalar
                    | FieldCategory::Hidden
                    | FieldCategory::ExtraAllowed
                    | FieldCategory::KeyRelation(RelationKind::ForeignKey)
                    | FieldCategory::ObjectRelation(RelationKind::ForeignKey)
            )
        });
        if !tabular {
            return Err(ConfigError::InvalidModel {
                model: model.name.clone(),
                reason: "values list may only hold scalar and foreign key columns".to_string(),
            });
        }
    }

    Ok(SchemaDescription {
        model: model.name.clone(),
        all,
        required,
        pairs,
    })
}

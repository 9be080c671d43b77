//! Recursive payload validation producing the complete error tree.
//!
//! # Responsibility
//! - Enforce required fields and relation pairing on creation.
//! - Check scalar types, nullability, declared validators and uniqueness.
//! - Check relation keys exist and recurse into nested payloads.
//!
//! # Invariants
//! - Every field is checked before anything is reported; the caller gets the
//!   whole tree in one pass.
//! - Configuration problems abort immediately and are never collected.
//! - Validation never writes.

use crate::errors::{
    ConfigError, ErrorNode, FieldError, ListFieldError, ObjectErrors, RepoError, RepoResult,
};
use crate::orm::query;
use crate::orm::record::{Data, Record};
use crate::orm::value::{key_text, same_value};
use crate::repo::sorter::partition;
use crate::repo::values_list::ValuesListData;
use crate::repo::Repository;
use crate::schema::field::{FieldDef, RelationKind, ScalarType};
use crate::schema::model::{ModelKind, PK_ALIAS};
use crate::schema::taxonomy::FieldCategory;
use log::debug;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

/// Outcome of one failed field check.
enum Rejection {
    /// Recoverable; attached to the tree under the field name.
    Field(ErrorNode),
    /// Aborts the whole validation.
    Fatal(RepoError),
}

impl From<FieldError> for Rejection {
    fn from(value: FieldError) -> Self {
        Self::Field(value.into())
    }
}

impl From<ConfigError> for Rejection {
    fn from(value: ConfigError) -> Self {
        Self::Fatal(value.into())
    }
}

impl From<RepoError> for Rejection {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Invalid(errors) => Self::Field(errors.into()),
            RepoError::InvalidRows(rows) => Self::Field(rows.into()),
            other => Self::Fatal(other),
        }
    }
}

impl From<rusqlite::Error> for Rejection {
    fn from(value: rusqlite::Error) -> Self {
        Self::Fatal(value.into())
    }
}

type FieldResult = Result<(), Rejection>;

impl Repository<'_> {
    /// Validates `data` against this model without writing.
    ///
    /// Creation (no bound instance) enforces required fields; edits only check
    /// the supplied ones.
    ///
    /// # Errors
    /// - `RepoError::Invalid` with the complete tree for bad input.
    /// - `RepoError::Config` when both members of a relation pair are
    ///   supplied, or on other programming errors.
    pub fn validate(&self, data: &Data) -> RepoResult<()> {
        let started_at = Instant::now();
        let errors = self.collect_errors(data)?;
        debug!(
            "event=repo_validate module=repo status={} model={} fields={} error_count={} duration_ms={}",
            if errors.is_empty() { "ok" } else { "invalid" },
            self.model().name,
            data.len(),
            errors.len(),
            started_at.elapsed().as_millis()
        );
        errors.into_result().map_err(RepoError::Invalid)
    }

    /// Builds the error tree of `data`; an empty tree means valid.
    pub(crate) fn collect_errors(&self, data: &Data) -> RepoResult<ObjectErrors> {
        let description = self.describe()?;
        let (mut required, pairs) = description.required_and_pairs();
        if self.instance().is_some() {
            required.clear();
        }
        if let Some(by) = self.by() {
            satisfy(&mut required, by);
            if let Some(relation) = self.model().relation_def(by) {
                required.remove(&relation.source_field);
            }
        }

        for (name, pair) in &pairs {
            if name < pair && data.contains_key(name) && data.contains_key(pair) {
                return Err(ConfigError::AmbiguousPair {
                    model: self.model().name.clone(),
                    field: name.clone(),
                    pair: pair.clone(),
                }
                .into());
            }
        }

        let (sorted, mut errors) = partition(description, data);
        for (name, value) in sorted.iter() {
            satisfy(&mut required, name);
            let Some(category) = description.category(name) else {
                continue;
            };
            match self.check_field(name, category, value, data) {
                Ok(()) => {}
                Err(Rejection::Field(node)) => {
                    errors.add(name, node);
                }
                Err(Rejection::Fatal(err)) => return Err(err),
            }
        }

        let mut reported = BTreeSet::new();
        for (name, related) in required {
            if related.as_ref().is_some_and(|related| reported.contains(related)) {
                continue;
            }
            errors.add_root(FieldError::required_missed(name.clone(), related));
            reported.insert(name);
        }
        Ok(errors)
    }

    fn check_field(
        &self,
        name: &str,
        category: FieldCategory,
        value: &Value,
        data: &Data,
    ) -> FieldResult {
        if let Some(outcome) = self.model().hooks.validate_field(self, name, value, data) {
            return outcome.map_err(Rejection::from);
        }
        match category {
            FieldCategory::Scalar => self.check_scalar(name, value),
            FieldCategory::ObjectRelation(_) | FieldCategory::ReverseSingle => {
                self.check_nested(name, value)
            }
            FieldCategory::KeyRelation(kind) => self.check_key(name, kind, value),
            FieldCategory::ReverseMany => self.check_children(name, value),
            FieldCategory::ExtraAllowed | FieldCategory::Calculated => self.check_extra(name, value),
            FieldCategory::Hidden => Err(FieldError::unexpected_key(format!(
                "`{name}` is hidden on `{}`",
                self.model().name
            ))
            .into()),
        }
    }

    fn check_scalar(&self, name: &str, value: &Value) -> FieldResult {
        let field = self.model().field_def(name).ok_or_else(|| ConfigError::UnknownField {
            model: self.model().name.clone(),
            field: name.to_string(),
        })?;
        if field.generated {
            return Err(FieldError::unexpected_key(format!("`{name}` is generated")).into());
        }
        if value.is_null() {
            return if field.nullable {
                Ok(())
            } else {
                Err(FieldError::field_required().into())
            };
        }
        check_value(field, value)?;
        if field.unique {
            self.check_unique(name, &field.ty, field.case_insensitive, value)?;
        }
        Ok(())
    }

    /// Fails with `NotUnique` when another row already stores `value`.
    fn check_unique(
        &self,
        name: &str,
        ty: &ScalarType,
        case_insensitive: bool,
        value: &Value,
    ) -> FieldResult {
        let instance = self.instance();
        if let Some(current) = instance.and_then(|record| record.get(name)) {
            if same_value(ty, current, value, case_insensitive) {
                return Ok(());
            }
        }
        let taken = query::exists_except(
            self.connection(),
            self.model(),
            name,
            value,
            instance.map(|record| &record.pk),
        )?;
        if taken {
            return Err(FieldError::not_unique().into());
        }
        Ok(())
    }

    fn check_key(&self, name: &str, kind: RelationKind, value: &Value) -> FieldResult {
        let model = self.model();
        let relation = model
            .relation_by_source(name)
            .ok_or_else(|| ConfigError::NotARelation {
                model: model.name.clone(),
                field: name.to_string(),
            })?;
        if value.is_null() {
            return if relation.nullable {
                Ok(())
            } else {
                Err(FieldError::field_required().into())
            };
        }
        let key_type = relation.key_type().ok_or_else(|| ConfigError::InvalidModel {
            model: model.name.clone(),
            reason: format!("relation `{}` is not registered", relation.name),
        })?;
        if !key_type.accepts(value) {
            return Err(FieldError::invalid_type(format!(
                "`{name}` must be a {} key",
                key_type.name()
            ))
            .into());
        }
        if kind == RelationKind::OneToOne {
            self.check_unique(name, key_type, false, value)?;
        }
        let target = self.registry().model(&relation.target)?;
        if query::get_by_pk(self.connection(), target, value)?.is_none() {
            return Err(FieldError::not_found_fk().into());
        }
        Ok(())
    }

    fn check_nested(&self, name: &str, value: &Value) -> FieldResult {
        let Some(nested) = value.as_object() else {
            return Err(FieldError::invalid_type(format!("`{name}` must be an object")).into());
        };
        let mut repository = self.related_repository(name)?;
        if let Some(current) = self.current_related(name)? {
            repository = repository.with_instance(current);
        }
        let errors = repository.collect_errors(nested)?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Rejection::Field(errors.into()))
        }
    }

    fn check_children(&self, name: &str, value: &Value) -> FieldResult {
        let model = self.model();
        let reverse = model.reverse_def(name).ok_or_else(|| ConfigError::NotARelation {
            model: model.name.clone(),
            field: name.to_string(),
        })?;
        let source = self.registry().model(&reverse.source_model)?;
        if source.kind == ModelKind::ValuesList {
            let rows = ValuesListData::from_value(value).map_err(|reason| {
                FieldError::invalid_type(format!("`{name}` must be a values list: {reason}"))
            })?;
            if rows.values.is_empty() {
                return Ok(());
            }
            self.values_list_repository(name)?.validate_list(&rows, true)?;
            return Ok(());
        }

        let Some(items) = value.as_array() else {
            return Err(FieldError::invalid_type(format!("`{name}` must be a list")).into());
        };
        let mut current: BTreeMap<String, Record> = self
            .current_children(name)?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        let mut rows = ListFieldError::new();
        for (index, item) in items.iter().enumerate() {
            let Some(item) = item.as_object() else {
                rows.entry(index).add_root(FieldError::invalid_type("item must be an object"));
                continue;
            };
            let mut repository = self.related_repository(name)?;
            let mut item = item.clone();
            if let Some(key) = item.remove(PK_ALIAS) {
                if self.instance().is_none() {
                    return Err(ConfigError::PkOnCreate {
                        model: model.name.clone(),
                        field: name.to_string(),
                    }
                    .into());
                }
                let key_type = &source.pk_field().ty;
                if !key_type.accepts(&key) {
                    rows.entry(index).add_root(FieldError::invalid_type(format!(
                        "`{PK_ALIAS}` must be a {} key",
                        key_type.name()
                    )));
                    continue;
                }
                let Some(child) = current.remove(&key_text(&key)) else {
                    rows.entry(index).add_root(FieldError::not_found_fk());
                    continue;
                };
                repository = repository.with_instance(child);
            }
            let errors = repository.collect_errors(&item)?;
            if !errors.is_empty() {
                rows.append(index, errors);
            }
        }
        if rows.is_empty() {
            Ok(())
        } else {
            Err(Rejection::Field(rows.into()))
        }
    }

    fn check_extra(&self, name: &str, value: &Value) -> FieldResult {
        let model = self.model();
        let Some(ty) = model.extra_allowed.get(name).or_else(|| model.calculated.get(name)) else {
            return Ok(());
        };
        if !value.is_null() && !ty.accepts(value) {
            return Err(FieldError::invalid_type(format!("`{name}` must be a {}", ty.name())).into());
        }
        Ok(())
    }
}

/// Marks `name` supplied, which also satisfies its pair member.
fn satisfy(required: &mut BTreeMap<String, Option<String>>, name: &str) {
    if let Some(Some(related)) = required.remove(name) {
        required.remove(&related);
    }
}

/// Type, choice and validator checks of one non-null scalar value.
pub(crate) fn check_value(field: &FieldDef, value: &Value) -> Result<(), FieldError> {
    if !field.ty.accepts(value) {
        return Err(FieldError::invalid_type(format!(
            "`{}` must be a {}",
            field.name,
            field.ty.name()
        )));
    }
    if let (ScalarType::Enum(choices), Some(text)) = (&field.ty, value.as_str()) {
        if !choices.iter().any(|choice| choice == text) {
            return Err(FieldError::validation_failed(
                "invalid_choice",
                format!("expected one of [{}]", choices.join(", ")),
            ));
        }
    }
    for validator in &field.validators {
        validator
            .check(value)
            .map_err(|message| FieldError::validation_failed("invalid", message))?;
    }
    Ok(())
}

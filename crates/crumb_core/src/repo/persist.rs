//! Create/edit orchestration with relation cascades.
//!
//! # Responsibility
//! - Persist a validated payload and every related row it carries.
//! - Own the transaction boundary of root operations.
//! - Reconcile reverse-many children against the requested final state.
//!
//! # Invariants
//! - Forward relations are written before the owning row; reverse relations after.
//! - Nested calls never open a transaction or re-validate unless told to.
//! - Any failure inside a root operation rolls back the whole cascade.
//! - Omitted reverse-many children are deleted on edit; values lists are
//!   replaced wholesale.

use crate::errors::{ConfigError, RepoError, RepoResult};
use crate::orm::atomic;
use crate::orm::query;
use crate::orm::record::{Data, Record};
use crate::orm::value::key_text;
use crate::repo::sorter::sort;
use crate::repo::values_list::ValuesListData;
use crate::repo::{log_failure, Repository};
use crate::schema::field::ReverseRelation;
use crate::schema::model::{ModelKind, PK_ALIAS};
use log::info;
use rusqlite::TransactionBehavior;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Instant;

/// Transaction and validation directives of one write call.
///
/// `validate` and `run_in_transaction` default to `is_root`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteContext {
    pub is_root: bool,
    pub validate: Option<bool>,
    pub run_in_transaction: Option<bool>,
}

impl WriteContext {
    /// Top-level call: validates and owns the transaction.
    pub fn root() -> Self {
        Self {
            is_root: true,
            validate: None,
            run_in_transaction: None,
        }
    }

    /// Call made by a parent cascade: inherits both.
    pub fn nested() -> Self {
        Self {
            is_root: false,
            ..Self::root()
        }
    }

    pub fn validate(mut self, validate: bool) -> Self {
        self.validate = Some(validate);
        self
    }

    pub fn run_in_transaction(mut self, run_in_transaction: bool) -> Self {
        self.run_in_transaction = Some(run_in_transaction);
        self
    }

    pub fn should_validate(&self) -> bool {
        self.validate.unwrap_or(self.is_root)
    }

    pub fn should_run_in_transaction(&self) -> bool {
        self.run_in_transaction.unwrap_or(self.is_root)
    }
}

impl Default for WriteContext {
    fn default() -> Self {
        Self::root()
    }
}

impl Repository<'_> {
    /// Validates and creates one row plus its related rows; binds and returns it.
    pub fn create(&mut self, data: &Data) -> RepoResult<Record> {
        self.create_with(data, Data::new(), WriteContext::root())
    }

    /// Creates with explicit defaults and write directives.
    ///
    /// `defaults` are stored without validation and lose to `data`.
    pub fn create_with(
        &mut self,
        data: &Data,
        defaults: Data,
        ctx: WriteContext,
    ) -> RepoResult<Record> {
        let started_at = Instant::now();
        let result = self.run_create(data, defaults, ctx);
        if ctx.is_root {
            self.log_write("repo_create", started_at, &result);
        }
        let record = result?;
        self.instance = Some(record.clone());
        Ok(record)
    }

    /// Validates and applies `data` to the bound instance; returns the fresh row.
    pub fn edit(&mut self, data: &Data) -> RepoResult<Record> {
        self.edit_with(data, Data::new(), WriteContext::root())
    }

    /// Edits with explicit extra values and write directives.
    ///
    /// `defaults` are stored without validation and lose to `data`.
    pub fn edit_with(
        &mut self,
        data: &Data,
        defaults: Data,
        ctx: WriteContext,
    ) -> RepoResult<Record> {
        let started_at = Instant::now();
        let result = self.run_edit(data, defaults, ctx);
        if ctx.is_root {
            self.log_write("repo_edit", started_at, &result);
        }
        let record = result?;
        self.instance = Some(record.clone());
        Ok(record)
    }

    fn run_create(&self, data: &Data, defaults: Data, ctx: WriteContext) -> RepoResult<Record> {
        self.ensure_available("create")?;
        if ctx.should_validate() {
            self.validate(data)?;
        }
        let persist = || {
            let pk = self.insert_cascade(data, defaults)?;
            self.reload(&pk)
        };
        if ctx.should_run_in_transaction() {
            atomic(self.conn, TransactionBehavior::Immediate, persist)
        } else {
            persist()
        }
    }

    fn run_edit(&self, data: &Data, defaults: Data, ctx: WriteContext) -> RepoResult<Record> {
        self.ensure_available("edit")?;
        let instance = self
            .instance
            .clone()
            .ok_or_else(|| ConfigError::InstanceRequired {
                model: self.model.name.clone(),
                method: "edit",
            })?;
        if ctx.should_validate() {
            self.validate(data)?;
        }
        let persist = || {
            self.update_cascade(&instance, data, defaults)?;
            self.reload(&instance.pk)
        };
        if ctx.should_run_in_transaction() {
            atomic(self.conn, TransactionBehavior::Immediate, persist)
        } else {
            persist()
        }
    }

    fn insert_cascade(&self, data: &Data, defaults: Data) -> RepoResult<Value> {
        let sorted = sort(self.describe()?, data)?;

        let mut related = Data::new();
        for (name, value) in &sorted.object {
            let source_field = self.source_field_of(name)?;
            let record = self.related_repository(name)?.create_with(
                as_object(name, value)?,
                Data::new(),
                WriteContext::nested(),
            )?;
            related.insert(source_field, record.pk);
        }
        related.extend(sorted.key.clone());

        let mut row = self.model.hooks.create_defaults(data, defaults);
        row.extend(sorted.scalar.clone());
        row.extend(related);
        self.model.hooks.before_insert(&mut row, &sorted.extra)?;
        let pk = query::insert(self.conn, self.model, &row)?;

        for (name, value) in &sorted.reverse_single {
            self.create_reverse_single(name, value, &pk)?;
        }
        for (name, value) in &sorted.reverse_many {
            self.create_children(name, value, &pk)?;
        }
        Ok(pk)
    }

    fn update_cascade(&self, instance: &Record, data: &Data, defaults: Data) -> RepoResult<()> {
        let sorted = sort(self.describe()?, data)?;

        let mut related = Data::new();
        for (name, value) in &sorted.object {
            let nested = as_object(name, value)?;
            let mut repository = self.related_repository(name)?;
            match self.current_related(name)? {
                Some(current) => {
                    repository
                        .with_instance(current)
                        .edit_with(nested, Data::new(), WriteContext::nested())?;
                }
                None => {
                    let record = repository.create_with(nested, Data::new(), WriteContext::nested())?;
                    related.insert(self.source_field_of(name)?, record.pk);
                }
            }
        }
        related.extend(sorted.key.clone());

        let mut row = defaults;
        row.extend(sorted.scalar.clone());
        row.extend(related);
        self.model.hooks.before_update(instance, &mut row, &sorted.extra)?;
        query::update(self.conn, self.model, &instance.pk, &row)?;

        for (name, value) in &sorted.reverse_single {
            match self.current_related(name)? {
                Some(current) => {
                    self.related_repository(name)?
                        .with_instance(current)
                        .edit_with(as_object(name, value)?, Data::new(), WriteContext::nested())?;
                }
                None => self.create_reverse_single(name, value, &instance.pk)?,
            }
        }
        for (name, value) in &sorted.reverse_many {
            self.reconcile_children(name, value, &instance.pk)?;
        }
        Ok(())
    }

    fn create_reverse_single(&self, name: &str, value: &Value, owner: &Value) -> RepoResult<()> {
        let reverse = self.reverse_of(name)?;
        let defaults = Data::from_iter([(reverse.source_field.clone(), owner.clone())]);
        self.related_repository(name)?.create_with(
            as_object(name, value)?,
            defaults,
            WriteContext::nested(),
        )?;
        Ok(())
    }

    fn create_children(&self, name: &str, value: &Value, owner: &Value) -> RepoResult<()> {
        let reverse = self.reverse_of(name)?;
        if self.is_values_list(&reverse.source_model)? {
            let rows = as_values_list(name, value)?;
            if !rows.values.is_empty() {
                self.registry
                    .values_list(self.conn, &reverse.source_model)?
                    .owned_by(owner.clone())
                    .create_list(&rows, 1)?;
            }
            return Ok(());
        }

        for item in as_items(name, value)? {
            let item = as_object(name, item)?;
            if item.contains_key(PK_ALIAS) {
                return Err(ConfigError::PkOnCreate {
                    model: self.model.name.clone(),
                    field: name.to_string(),
                }
                .into());
            }
            let defaults = Data::from_iter([(reverse.source_field.clone(), owner.clone())]);
            self.related_repository(name)?
                .create_with(item, defaults, WriteContext::nested())?;
        }
        Ok(())
    }

    /// Makes the stored children of `name` match `value` exactly.
    fn reconcile_children(&self, name: &str, value: &Value, owner: &Value) -> RepoResult<()> {
        let reverse = self.reverse_of(name)?;
        if self.is_values_list(&reverse.source_model)? {
            let rows = as_values_list(name, value)?;
            self.registry
                .values_list(self.conn, &reverse.source_model)?
                .owned_by(owner.clone())
                .edit_list(&rows)?;
            return Ok(());
        }

        let key_type = &self.registry.model(&reverse.source_model)?.pk_field().ty;
        let mut current: BTreeMap<String, Record> = self
            .current_children(name)?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();
        for item in as_items(name, value)? {
            let mut item = as_object(name, item)?.clone();
            match item.remove(PK_ALIAS) {
                Some(key) => {
                    if !key_type.accepts(&key) {
                        return Err(RepoError::InvalidData(format!(
                            "child key of `{name}` must be a {} value",
                            key_type.name()
                        )));
                    }
                    let child = current.remove(&key_text(&key)).ok_or_else(|| {
                        RepoError::NotFound {
                            model: reverse.source_model.clone(),
                            key: key_text(&key),
                        }
                    })?;
                    self.related_repository(name)?
                        .with_instance(child)
                        .edit_with(&item, Data::new(), WriteContext::nested())?;
                }
                None => {
                    let defaults = Data::from_iter([(reverse.source_field.clone(), owner.clone())]);
                    self.related_repository(name)?
                        .create_with(&item, defaults, WriteContext::nested())?;
                }
            }
        }

        if !current.is_empty() {
            let stale: Vec<Value> = current.into_values().map(|record| record.pk).collect();
            self.related_repository(name)?.delete_many(&stale)?;
        }
        Ok(())
    }

    /// Re-reads a just-written row, bypassing default filters.
    fn reload(&self, pk: &Value) -> RepoResult<Record> {
        query::get_by_pk(self.conn, self.model, pk)?.ok_or_else(|| RepoError::NotFound {
            model: self.model.name.clone(),
            key: key_text(pk),
        })
    }

    fn source_field_of(&self, name: &str) -> Result<String, ConfigError> {
        self.model
            .relation_def(name)
            .map(|relation| relation.source_field.clone())
            .ok_or_else(|| ConfigError::NotARelation {
                model: self.model.name.clone(),
                field: name.to_string(),
            })
    }

    fn reverse_of(&self, name: &str) -> Result<&ReverseRelation, ConfigError> {
        self.model
            .reverse_def(name)
            .ok_or_else(|| ConfigError::NotARelation {
                model: self.model.name.clone(),
                field: name.to_string(),
            })
    }

    fn is_values_list(&self, model: &str) -> Result<bool, ConfigError> {
        Ok(self.registry.model(model)?.kind == ModelKind::ValuesList)
    }

    fn log_write(&self, event: &str, started_at: Instant, result: &RepoResult<Record>) {
        match result {
            Ok(record) => info!(
                "event={} module=repo status=ok model={} key={} duration_ms={}",
                event,
                self.model.name,
                record.key(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure(event, &self.model.name, started_at, err),
        }
    }
}

fn as_object<'v>(name: &str, value: &'v Value) -> RepoResult<&'v Data> {
    value
        .as_object()
        .ok_or_else(|| RepoError::InvalidData(format!("`{name}` must be an object")))
}

fn as_items<'v>(name: &str, value: &'v Value) -> RepoResult<&'v Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| RepoError::InvalidData(format!("`{name}` must be a list")))
}

fn as_values_list(name: &str, value: &Value) -> RepoResult<ValuesListData> {
    ValuesListData::from_value(value)
        .map_err(|reason| RepoError::InvalidData(format!("`{name}` must be a values list: {reason}")))
}

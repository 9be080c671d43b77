//! Repository façade over one registered model.
//!
//! # Responsibility
//! - Expose list/get/create/edit/delete operations over nested payloads.
//! - Resolve sub-repositories for relation cascades.
//! - Enforce read-only and instance preconditions before any query.
//!
//! # Invariants
//! - A repository holds at most one loaded instance; create requires none,
//!   edit and delete require one.
//! - Read operations always apply the model's default filters first.
//! - Repository events log model names, keys and counts, never payload values.

use crate::errors::{ConfigError, RepoError, RepoResult};
use crate::orm::atomic;
use crate::orm::filter::Filter;
use crate::orm::query::{self, Selection};
use crate::orm::record::Record;
use crate::orm::value::key_text;
use crate::schema::model::{ModelDef, ModelKind, Registry};
use crate::schema::taxonomy::{describe_model, SchemaDescription};
use log::{error, info};
use rusqlite::{Connection, TransactionBehavior};
use serde_json::Value;
use std::fmt::{Debug, Formatter};
use std::time::Instant;

pub mod hooks;
pub mod persist;
pub mod sorter;
pub mod validate;
pub mod values_list;

pub use hooks::{NoHooks, RepositoryHooks};
pub use persist::WriteContext;
pub use sorter::SortedData;
pub use values_list::{ValuesListData, ValuesListRepository};

const READ_METHODS: &[&str] = &["list", "get_one", "get_one_by", "get_many"];

/// Repository of one model bound to one connection.
pub struct Repository<'r> {
    registry: &'r Registry,
    conn: &'r Connection,
    model: &'r ModelDef,
    /// Relation the parent supplies implicitly during a cascade.
    by: Option<String>,
    instance: Option<Record>,
}

impl Debug for Repository<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("model", &self.model.name)
            .field("by", &self.by)
            .field("instance", &self.instance.as_ref().map(Record::key))
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Opens the repository of `model` on `conn`.
    ///
    /// # Errors
    /// - `UnknownModel` when `model` is not registered.
    /// - `InvalidModel` for values-list models, which open through
    ///   [`Registry::values_list`].
    pub fn repository<'r>(
        &'r self,
        conn: &'r Connection,
        model: &str,
    ) -> Result<Repository<'r>, ConfigError> {
        let model = self.model(model)?;
        if model.kind == ModelKind::ValuesList {
            return Err(ConfigError::InvalidModel {
                model: model.name.clone(),
                reason: "values lists are managed through their owner".to_string(),
            });
        }
        Ok(Repository {
            registry: self,
            conn,
            model,
            by: None,
            instance: None,
        })
    }
}

impl<'r> Repository<'r> {
    pub fn model(&self) -> &'r ModelDef {
        self.model
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn connection(&self) -> &'r Connection {
        self.conn
    }

    pub fn instance(&self) -> Option<&Record> {
        self.instance.as_ref()
    }

    pub fn by(&self) -> Option<&str> {
        self.by.as_deref()
    }

    pub fn describe(&self) -> Result<&'r SchemaDescription, ConfigError> {
        describe_model(self.model)
    }

    /// Binds an already loaded row for edit/delete.
    pub fn with_instance(mut self, instance: Record) -> Self {
        self.instance = Some(instance);
        self
    }

    /// Loads the row `key` (default filters apply) and binds it.
    pub fn load(mut self, key: impl Into<Value>) -> RepoResult<Self> {
        let record = self.get_one(&key.into())?;
        self.instance = Some(record);
        Ok(self)
    }

    pub(crate) fn with_by(mut self, by: Option<String>) -> Self {
        self.by = by;
        self
    }

    /// Lists rows matching `filters`, returning one page plus the total count.
    pub fn list(
        &self,
        filters: &[Filter],
        sort: &[String],
        skip: u64,
        limit: Option<u64>,
    ) -> RepoResult<(Vec<Record>, u64)> {
        self.ensure_available("list")?;
        let started_at = Instant::now();
        let selection = Selection {
            filters: self.scoped_filters(filters),
            sort: sort.to_vec(),
            offset: skip,
            limit,
        };

        let result = atomic(self.conn, TransactionBehavior::Deferred, || {
            let records = query::select(self.conn, self.model, &selection)?;
            let total = query::count(self.conn, self.model, &selection.filters)?;
            Ok((records, total))
        });
        match &result {
            Ok((records, total)) => info!(
                "event=repo_list module=repo status=ok model={} returned={} total={} duration_ms={}",
                self.model.name,
                records.len(),
                total,
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure("repo_list", &self.model.name, started_at, err),
        }
        result
    }

    /// Fetches one row by primary key.
    pub fn get_one(&self, key: &Value) -> RepoResult<Record> {
        self.ensure_available("get_one")?;
        self.find_one(self.model.pk_name(), key)
    }

    /// Fetches one row by any stored column, honoring its case flag.
    pub fn get_one_by(&self, field: &str, value: &Value) -> RepoResult<Record> {
        self.ensure_available("get_one_by")?;
        if self.model.column(field).is_none() {
            return Err(ConfigError::UnknownField {
                model: self.model.name.clone(),
                field: field.to_string(),
            }
            .into());
        }
        self.find_one(field, value)
    }

    /// Fetches the rows whose primary keys are in `keys`, ordered by key.
    pub fn get_many(&self, keys: &[Value]) -> RepoResult<Vec<Record>> {
        self.ensure_available("get_many")?;
        let pk_type = &self.model.pk_field().ty;
        let keys: Vec<Value> = keys
            .iter()
            .filter(|key| pk_type.accepts(key))
            .cloned()
            .collect();
        let selection = Selection {
            filters: self.scoped_filters(&[Filter::one_of(self.model.pk_name(), keys)]),
            ..Selection::default()
        };
        query::select(self.conn, self.model, &selection)
    }

    /// Deletes the bound instance.
    pub fn delete(&mut self) -> RepoResult<()> {
        self.ensure_available("delete")?;
        let started_at = Instant::now();
        let Some(instance) = self.instance.take() else {
            return Err(self.instance_required("delete"));
        };

        let result = query::delete(
            self.conn,
            self.model,
            &[Filter::equal(self.model.pk_name(), instance.pk.clone())],
        );
        match &result {
            Ok(removed) => info!(
                "event=repo_delete module=repo status=ok model={} key={} removed={} duration_ms={}",
                self.model.name,
                instance.key(),
                removed,
                started_at.elapsed().as_millis()
            ),
            Err(err) => {
                log_failure("repo_delete", &self.model.name, started_at, err);
                self.instance = Some(instance);
            }
        }
        result.map(|_| ())
    }

    /// Deletes the rows whose primary keys are in `keys`; returns the count.
    ///
    /// Every targeted row passes the `can_delete` hook before anything is
    /// removed.
    pub fn delete_many(&self, keys: &[Value]) -> RepoResult<usize> {
        self.ensure_available("delete_many")?;
        let started_at = Instant::now();
        let pk_type = &self.model.pk_field().ty;
        let requested = keys.iter().filter(|key| pk_type.accepts(key)).cloned();
        let lookup = Selection::filtered(vec![Filter::one_of(self.model.pk_name(), requested)]);
        let result = atomic(self.conn, TransactionBehavior::Immediate, || {
            let targets = query::select(self.conn, self.model, &lookup)?;
            for target in &targets {
                self.model.hooks.can_delete(target)?;
            }
            let keys: Vec<Value> = targets.into_iter().map(|target| target.pk).collect();
            query::delete(
                self.conn,
                self.model,
                &[Filter::one_of(self.model.pk_name(), keys)],
            )
        });
        match &result {
            Ok(removed) => info!(
                "event=repo_delete_many module=repo status=ok model={} requested={} removed={} duration_ms={}",
                self.model.name,
                keys.len(),
                removed,
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure("repo_delete_many", &self.model.name, started_at, err),
        }
        result
    }

    /// Repository of the model on the other side of relation `name`.
    ///
    /// Forward relations (object or key accessor) open the target model;
    /// reverse relations open the declaring model. The returned repository
    /// knows which relation the parent supplies.
    pub fn related_repository(&self, name: &str) -> RepoResult<Repository<'r>> {
        let relation = self
            .model
            .relation_def(name)
            .or_else(|| self.model.relation_by_source(name));
        if let Some(relation) = relation {
            return Ok(self
                .registry
                .repository(self.conn, &relation.target)?
                .with_by(relation.related_name.clone()));
        }
        if let Some(reverse) = self.model.reverse_def(name) {
            return Ok(self
                .registry
                .repository(self.conn, &reverse.source_model)?
                .with_by(Some(reverse.relation_field.clone())));
        }
        Err(self.not_a_relation(name).into())
    }

    /// Values-list repository behind reverse relation `name`, owned by the
    /// bound instance when there is one.
    pub fn values_list_repository(&self, name: &str) -> RepoResult<ValuesListRepository<'r>> {
        let reverse = self
            .model
            .reverse_def(name)
            .ok_or_else(|| self.not_a_relation(name))?;
        let repository = self.registry.values_list(self.conn, &reverse.source_model)?;
        Ok(match &self.instance {
            Some(instance) => repository.owned_by(instance.pk.clone()),
            None => repository,
        })
    }

    /// Row currently linked to the bound instance through single relation `name`.
    pub fn current_related(&self, name: &str) -> RepoResult<Option<Record>> {
        let Some(instance) = &self.instance else {
            return Ok(None);
        };
        if let Some(relation) = self.model.relation_def(name) {
            let key = instance.get(&relation.source_field).cloned().unwrap_or(Value::Null);
            let target = self.registry.model(&relation.target)?;
            return query::get_by_pk(self.conn, target, &key);
        }
        if let Some(reverse) = self.model.reverse_def(name) {
            let source = self.registry.model(&reverse.source_model)?;
            let selection = Selection {
                filters: vec![Filter::equal(reverse.source_field.clone(), instance.pk.clone())],
                limit: Some(1),
                ..Selection::default()
            };
            return Ok(query::select(self.conn, source, &selection)?.into_iter().next());
        }
        Err(self.not_a_relation(name).into())
    }

    /// Rows currently linked to the bound instance through reverse relation `name`.
    pub fn current_children(&self, name: &str) -> RepoResult<Vec<Record>> {
        let reverse = self
            .model
            .reverse_def(name)
            .ok_or_else(|| self.not_a_relation(name))?;
        let Some(instance) = &self.instance else {
            return Ok(Vec::new());
        };
        let source = self.registry.model(&reverse.source_model)?;
        query::select(
            self.conn,
            source,
            &Selection::filtered(vec![Filter::equal(
                reverse.source_field.clone(),
                instance.pk.clone(),
            )]),
        )
    }

    /// Checks that `method` may run in the current repository state.
    pub(crate) fn ensure_available(&self, method: &'static str) -> RepoResult<()> {
        if self.model.read_only && !READ_METHODS.contains(&method) {
            return Err(ConfigError::ReadOnly {
                model: self.model.name.clone(),
                method,
            }
            .into());
        }
        match method {
            "create" if self.instance.is_some() => Err(ConfigError::InstanceNotExpected {
                model: self.model.name.clone(),
            }
            .into()),
            "edit" | "delete" => {
                let Some(instance) = &self.instance else {
                    return Err(self.instance_required(method));
                };
                if method == "edit" {
                    self.model.hooks.can_edit(instance)
                } else {
                    self.model.hooks.can_delete(instance)
                }
            }
            _ => Ok(()),
        }
    }

    fn find_one(&self, field: &str, value: &Value) -> RepoResult<Record> {
        let not_found = || RepoError::NotFound {
            model: self.model.name.clone(),
            key: if field == self.model.pk_name() {
                key_text(value)
            } else {
                format!("{field}={}", key_text(value))
            },
        };
        let accepted = self
            .model
            .column(field)
            .is_some_and(|column| !value.is_null() && column.ty.accepts(value));
        if !accepted {
            return Err(not_found());
        }

        let selection = Selection {
            filters: self.scoped_filters(&[Filter::equal(field, value.clone())]),
            limit: Some(1),
            ..Selection::default()
        };
        query::select(self.conn, self.model, &selection)?
            .into_iter()
            .next()
            .ok_or_else(not_found)
    }

    fn scoped_filters(&self, filters: &[Filter]) -> Vec<Filter> {
        let mut scoped = self.model.hooks.default_filters();
        scoped.extend_from_slice(filters);
        scoped
    }

    fn instance_required(&self, method: &'static str) -> RepoError {
        ConfigError::InstanceRequired {
            model: self.model.name.clone(),
            method,
        }
        .into()
    }

    fn not_a_relation(&self, name: &str) -> ConfigError {
        ConfigError::NotARelation {
            model: self.model.name.clone(),
            field: name.to_string(),
        }
    }
}

/// Emits the failure line of a repository event.
pub(crate) fn log_failure(event: &str, model: &str, started_at: Instant, err: &RepoError) {
    match err {
        RepoError::Invalid(errors) => info!(
            "event={} module=repo status=invalid model={} error_count={} duration_ms={}",
            event,
            model,
            errors.len(),
            started_at.elapsed().as_millis()
        ),
        RepoError::InvalidRows(rows) => info!(
            "event={} module=repo status=invalid model={} invalid_rows={} duration_ms={}",
            event,
            model,
            rows.len(),
            started_at.elapsed().as_millis()
        ),
        other => error!(
            "event={} module=repo status=error model={} error_code={} duration_ms={}",
            event,
            model,
            other.code(),
            started_at.elapsed().as_millis()
        ),
    }
}

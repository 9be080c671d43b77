//! Ordered child rows owned by one parent row.
//!
//! # Responsibility
//! - Bulk create, append, replace and clear the rows of one owner.
//! - Validate tabular payloads column by column.
//! - Keep `ordering` dense after removals and moves.
//!
//! # Invariants
//! - Row identity is `{owner key};{ordering}`, derived and never supplied.
//! - Orderings of one owner are 1-based; appends start after the stored maximum.
//! - Renumbering happens in one transaction together with the change causing it.
//!
//! # See also
//! - `repo::persist` for how owners cascade into their lists.

use crate::errors::{ConfigError, FieldError, ListFieldError, RepoError, RepoResult};
use crate::orm::atomic;
use crate::orm::filter::Filter;
use crate::orm::query::{self, Selection};
use crate::orm::record::{Data, Record};
use crate::orm::value::key_text;
use crate::repo::log_failure;
use crate::repo::validate::check_value;
use crate::schema::model::{ModelDef, ModelKind, Registry, ORDERING_FIELD, OWNER_RELATION};
use crate::schema::taxonomy::{describe_model, FieldCategory};
use log::info;
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::time::Instant;

/// Tabular payload: column names plus positional rows.
///
/// A row shorter than `head` leaves its trailing cells undefined.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValuesListData {
    pub head: Vec<String>,
    pub values: Vec<Vec<Value>>,
}

impl ValuesListData {
    pub fn new<S: Into<String>>(head: impl IntoIterator<Item = S>) -> Self {
        Self {
            head: head.into_iter().map(Into::into).collect(),
            values: Vec::new(),
        }
    }

    pub fn row(mut self, cells: impl IntoIterator<Item = Value>) -> Self {
        self.values.push(cells.into_iter().collect());
        self
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        Self::deserialize(value).map_err(|err| err.to_string())
    }

    /// Single-row payload built from one mapping.
    pub fn from_row(row: &Data) -> Self {
        Self {
            head: row.keys().cloned().collect(),
            values: vec![row.values().cloned().collect()],
        }
    }

    /// Defined cells of row `index` keyed by column.
    pub fn row_data(&self, index: usize) -> Data {
        let Some(cells) = self.values.get(index) else {
            return Data::new();
        };
        self.head
            .iter()
            .zip(cells)
            .map(|(column, cell)| (column.clone(), cell.clone()))
            .collect()
    }

    /// Cells of column `index`, `None` where a row leaves it undefined.
    pub fn column(&self, index: usize) -> Vec<Option<&Value>> {
        self.values.iter().map(|cells| cells.get(index)).collect()
    }
}

/// Identity of the row at `ordering` under `owner`.
pub fn synthetic_key(owner: &Value, ordering: i64) -> String {
    format!("{};{}", key_text(owner), ordering)
}

/// Repository of one values-list model, optionally bound to an owner row.
pub struct ValuesListRepository<'r> {
    registry: &'r Registry,
    conn: &'r Connection,
    model: &'r ModelDef,
    owner: Option<Value>,
}

impl Debug for ValuesListRepository<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuesListRepository")
            .field("model", &self.model.name)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Opens the values-list repository of `model` on `conn`.
    pub fn values_list<'r>(
        &'r self,
        conn: &'r Connection,
        model: &str,
    ) -> Result<ValuesListRepository<'r>, ConfigError> {
        let model = self.model(model)?;
        if model.kind != ModelKind::ValuesList {
            return Err(ConfigError::NotAValuesList(model.name.clone()));
        }
        Ok(ValuesListRepository {
            registry: self,
            conn,
            model,
            owner: None,
        })
    }
}

impl<'r> ValuesListRepository<'r> {
    /// Binds the owner row by key.
    pub fn owned_by(mut self, owner: impl Into<Value>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn model(&self) -> &'r ModelDef {
        self.model
    }

    pub fn owner(&self) -> Option<&Value> {
        self.owner.as_ref()
    }

    /// Rows of the owner in ordering order.
    pub fn records(&self) -> RepoResult<Vec<Record>> {
        let owner = self.require_owner()?;
        let selection = Selection {
            filters: vec![self.owner_filter(owner)?],
            sort: vec![ORDERING_FIELD.to_string()],
            ..Selection::default()
        };
        query::select(self.conn, self.model, &selection)
    }

    /// Inserts every row of `data`, numbering them from `start_ordering`.
    pub fn create_list(&self, data: &ValuesListData, start_ordering: i64) -> RepoResult<usize> {
        let owner = self.require_owner()?;
        if start_ordering < 1 {
            return Err(ConfigError::InvalidOrdering(start_ordering).into());
        }
        self.check_head(&data.head)?;
        let owner_field = self.owner_field()?;

        let rows: Vec<Data> = (0..data.values.len())
            .map(|index| {
                let ordering = start_ordering + index as i64;
                let mut row = data.row_data(index);
                row.retain(|column, _| !self.model.extra_allowed.contains_key(column));
                row.insert(
                    self.model.pk_name().to_string(),
                    Value::String(synthetic_key(owner, ordering)),
                );
                row.insert(ORDERING_FIELD.to_string(), Value::from(ordering));
                row.insert(owner_field.to_string(), owner.clone());
                row
            })
            .collect();
        query::bulk_insert(self.conn, self.model, &rows)
    }

    /// Appends `data` after the current maximum ordering of the owner.
    pub fn add(&self, data: &ValuesListData) -> RepoResult<usize> {
        let started_at = Instant::now();
        let result = atomic(self.conn, TransactionBehavior::Immediate, || {
            let owner = self.require_owner()?;
            let last = query::max_value(
                self.conn,
                self.model,
                ORDERING_FIELD,
                &[self.owner_filter(owner)?],
            )?;
            self.create_list(data, last.unwrap_or(0) + 1)
        });
        self.log_outcome("values_list_add", started_at, &result);
        result
    }

    /// Appends one row given as a mapping.
    pub fn append(&self, row: &Data) -> RepoResult<usize> {
        self.add(&ValuesListData::from_row(row))
    }

    /// Replaces every row of the owner with `data`, numbered from 1.
    pub fn edit_list(&self, data: &ValuesListData) -> RepoResult<usize> {
        let started_at = Instant::now();
        let result = atomic(self.conn, TransactionBehavior::Immediate, || {
            self.clear()?;
            if data.values.is_empty() {
                return Ok(0);
            }
            self.create_list(data, 1)
        });
        self.log_outcome("values_list_replace", started_at, &result);
        result
    }

    /// Deletes every row of the owner; returns the removed count.
    pub fn clear(&self) -> RepoResult<usize> {
        let owner = self.require_owner()?;
        query::delete(self.conn, self.model, &[self.owner_filter(owner)?])
    }

    /// Deletes the rows at `orderings` and renumbers the rest densely.
    pub fn remove(&self, orderings: &[i64]) -> RepoResult<usize> {
        let doomed: BTreeSet<i64> = orderings.iter().copied().collect();
        atomic(self.conn, TransactionBehavior::Immediate, || {
            let records = self.records()?;
            let before = records.len();
            let kept: Vec<Record> = records
                .into_iter()
                .filter(|record| !doomed.contains(&ordering_of(record)))
                .collect();
            let removed = before - kept.len();
            if removed > 0 {
                self.rewrite(kept)?;
            }
            Ok(removed)
        })
    }

    /// Moves the row at ordering `from` to position `to` (clamped to the list).
    pub fn move_row(&self, from: i64, to: i64) -> RepoResult<()> {
        atomic(self.conn, TransactionBehavior::Immediate, || {
            let mut records = self.records()?;
            let index = records
                .iter()
                .position(|record| ordering_of(record) == from)
                .ok_or_else(|| RepoError::NotFound {
                    model: self.model.name.clone(),
                    key: self
                        .owner
                        .as_ref()
                        .map_or_else(|| from.to_string(), |owner| synthetic_key(owner, from)),
                })?;
            let record = records.remove(index);
            let target = (to.max(1) - 1).min(records.len() as i64) as usize;
            records.insert(target, record);
            self.rewrite(records)
        })
    }

    /// Validates `data` column by column.
    ///
    /// Key columns are checked with one existence query per column. With
    /// `check_required`, a required column absent from `head` is a fatal
    /// `MissingListColumns` error.
    pub fn validate_list(&self, data: &ValuesListData, check_required: bool) -> RepoResult<()> {
        let description = describe_model(self.model)?;
        let (mut required, _) = description.required_and_pairs();
        let mut rows = ListFieldError::new();

        for (index, cells) in data.values.iter().enumerate() {
            if cells.len() > data.head.len() {
                rows.entry(index).add_root(FieldError::unexpected_key(format!(
                    "row has {} cells for {} columns",
                    cells.len(),
                    data.head.len()
                )));
            }
        }

        for (index, column) in data.head.iter().enumerate() {
            let is_required = required.contains_key(column);
            if let Some(Some(related)) = required.remove(column) {
                required.remove(&related);
            }
            let cells = data.column(index);
            match description.category(column) {
                Some(FieldCategory::Scalar) => {
                    self.check_scalar_column(column, &cells, is_required, &mut rows)?
                }
                Some(FieldCategory::KeyRelation(_)) => {
                    self.check_key_column(column, &cells, is_required, &mut rows)?
                }
                Some(FieldCategory::ExtraAllowed) => {}
                _ => return Err(self.unexpected_column(column).into()),
            }
        }

        if check_required && !required.is_empty() {
            return Err(ConfigError::MissingListColumns {
                model: self.model.name.clone(),
                columns: required.into_keys().collect(),
            }
            .into());
        }
        if rows.is_empty() {
            Ok(())
        } else {
            Err(RepoError::InvalidRows(rows))
        }
    }

    fn check_scalar_column(
        &self,
        column: &str,
        cells: &[Option<&Value>],
        is_required: bool,
        rows: &mut ListFieldError,
    ) -> RepoResult<()> {
        let field = self
            .model
            .field_def(column)
            .ok_or_else(|| self.unexpected_column(column))?;
        if field.generated {
            return Err(self.unexpected_column(column).into());
        }
        if field.unique {
            return Err(ConfigError::InvalidModel {
                model: self.model.name.clone(),
                reason: format!("values list column `{column}` cannot be unique"),
            }
            .into());
        }

        for (index, cell) in cells.iter().copied().enumerate() {
            let outcome = match cell {
                None if is_required => Err(FieldError::field_required()),
                None => Ok(()),
                Some(Value::Null) if field.nullable => Ok(()),
                Some(Value::Null) => Err(FieldError::field_required()),
                Some(value) => check_value(field, value),
            };
            if let Err(error) = outcome {
                rows.entry(index).add(column, error);
            }
        }
        Ok(())
    }

    fn check_key_column(
        &self,
        column: &str,
        cells: &[Option<&Value>],
        is_required: bool,
        rows: &mut ListFieldError,
    ) -> RepoResult<()> {
        let relation = self
            .model
            .relation_by_source(column)
            .ok_or_else(|| self.unexpected_column(column))?;
        let key_type = relation.key_type().ok_or_else(|| self.unexpected_column(column))?;

        let mut lookups: Vec<(usize, &Value)> = Vec::new();
        for (index, cell) in cells.iter().copied().enumerate() {
            let outcome = match cell {
                None if is_required => Err(FieldError::field_required()),
                None => Ok(()),
                Some(Value::Null) if relation.nullable => Ok(()),
                Some(Value::Null) => Err(FieldError::field_required()),
                Some(value) if !key_type.accepts(value) => Err(FieldError::invalid_type(format!(
                    "`{column}` must be a {} key",
                    key_type.name()
                ))),
                Some(value) => {
                    lookups.push((index, value));
                    Ok(())
                }
            };
            if let Err(error) = outcome {
                rows.entry(index).add(column, error);
            }
        }
        if lookups.is_empty() {
            return Ok(());
        }

        let target = self.registry.model(&relation.target)?;
        let keys: Vec<Value> = lookups.iter().map(|(_, value)| (*value).clone()).collect();
        let found: BTreeSet<String> = query::select(
            self.conn,
            target,
            &Selection::filtered(vec![Filter::one_of(target.pk_name(), keys)]),
        )?
        .iter()
        .map(Record::key)
        .collect();
        for (index, value) in lookups {
            if !found.contains(&key_text(value)) {
                rows.entry(index).add(column, FieldError::not_found_fk());
            }
        }
        Ok(())
    }

    /// Re-inserts `records` in their given order with orderings `1..`.
    fn rewrite(&self, records: Vec<Record>) -> RepoResult<()> {
        let owner = self.require_owner()?;
        let owner_field = self.owner_field()?;
        self.clear()?;
        let rows: Vec<Data> = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                let ordering = index as i64 + 1;
                let mut row = record.values;
                row.insert(
                    self.model.pk_name().to_string(),
                    Value::String(synthetic_key(owner, ordering)),
                );
                row.insert(ORDERING_FIELD.to_string(), Value::from(ordering));
                row.insert(owner_field.to_string(), owner.clone());
                row
            })
            .collect();
        query::bulk_insert(self.conn, self.model, &rows)?;
        Ok(())
    }

    /// Rejects columns that are not stored scalars or relation keys.
    /// Extra-allowed columns are accepted and never stored.
    fn check_head(&self, head: &[String]) -> Result<(), ConfigError> {
        let description = describe_model(self.model)?;
        for column in head {
            match description.category(column) {
                Some(
                    FieldCategory::Scalar
                    | FieldCategory::KeyRelation(_)
                    | FieldCategory::ExtraAllowed,
                ) => {}
                _ => return Err(self.unexpected_column(column)),
            }
        }
        Ok(())
    }

    fn require_owner(&self) -> Result<&Value, ConfigError> {
        self.owner.as_ref().ok_or_else(|| ConfigError::OwnerRequired {
            model: self.model.name.clone(),
        })
    }

    fn owner_field(&self) -> Result<&'r str, ConfigError> {
        self.model
            .relation_def(OWNER_RELATION)
            .map(|relation| relation.source_field.as_str())
            .ok_or_else(|| ConfigError::InvalidModel {
                model: self.model.name.clone(),
                reason: "values list needs an `owner` foreign key".to_string(),
            })
    }

    fn owner_filter(&self, owner: &Value) -> Result<Filter, ConfigError> {
        Ok(Filter::equal(self.owner_field()?, owner.clone()))
    }

    fn unexpected_column(&self, column: &str) -> ConfigError {
        ConfigError::UnexpectedListColumn {
            model: self.model.name.clone(),
            column: column.to_string(),
        }
    }

    fn log_outcome(&self, event: &str, started_at: Instant, result: &RepoResult<usize>) {
        match result {
            Ok(rows) => info!(
                "event={} module=repo status=ok model={} owner={} rows={} duration_ms={}",
                event,
                self.model.name,
                self.owner.as_ref().map(key_text).unwrap_or_default(),
                rows,
                started_at.elapsed().as_millis()
            ),
            Err(err) => log_failure(event, &self.model.name, started_at, err),
        }
    }
}

fn ordering_of(record: &Record) -> i64 {
    record
        .get(ORDERING_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or_default()
}

//! Model-driven SQL over one SQLite connection.
//!
//! # Responsibility
//! - Build filtered select/count/exists/insert/update/delete statements from
//!   model metadata.
//! - Decode rows into `Record`s using declared column types.
//!
//! # Invariants
//! - Identifiers are always quoted; values are always bound.
//! - Listing order is deterministic: requested sort keys, then primary key.
//! - Case-insensitive columns compare through the Unicode case-fold function
//!   on both sides, so the connection must come from `db::open_db*` or have
//!   `db::register_functions` applied.

use crate::db::CASEFOLD_FUNCTION;
use crate::errors::{ConfigError, RepoError, RepoResult};
use crate::orm::filter::Filter;
use crate::orm::record::{Data, Record};
use crate::orm::value::{from_sql, now_text, to_sql};
use crate::schema::field::ScalarType;
use crate::schema::model::{Column, ModelDef};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row};
use serde_json::Value;
use uuid::Uuid;

/// Read request over one model.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub filters: Vec<Filter>,
    /// Field names; a leading `-` sorts descending.
    pub sort: Vec<String>,
    pub offset: u64,
    pub limit: Option<u64>,
}

impl Selection {
    pub fn filtered(filters: Vec<Filter>) -> Self {
        Self {
            filters,
            ..Self::default()
        }
    }
}

/// Double-quotes an SQL identifier.
pub fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn select(conn: &Connection, model: &ModelDef, selection: &Selection) -> RepoResult<Vec<Record>> {
    let columns = model.columns();
    let (where_sql, mut bind_values) = where_clause(model, &selection.filters)?;
    let mut sql = format!(
        "SELECT {} FROM {}{}{}",
        column_list(&columns),
        quote(&model.table),
        where_sql,
        order_clause(model, &selection.sort)?
    );

    if let Some(limit) = selection.limit {
        sql.push_str(" LIMIT ? OFFSET ?");
        bind_values.push(SqlValue::Integer(clamp_i64(limit)));
        bind_values.push(SqlValue::Integer(clamp_i64(selection.offset)));
    } else if selection.offset > 0 {
        sql.push_str(" LIMIT -1 OFFSET ?");
        bind_values.push(SqlValue::Integer(clamp_i64(selection.offset)));
    }

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params_from_iter(bind_values))?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(parse_record(model, &columns, row)?);
    }
    Ok(records)
}

pub fn count(conn: &Connection, model: &ModelDef, filters: &[Filter]) -> RepoResult<u64> {
    let (where_sql, bind_values) = where_clause(model, filters)?;
    let sql = format!("SELECT COUNT(*) FROM {}{}", quote(&model.table), where_sql);
    let total: i64 = conn.query_row(&sql, params_from_iter(bind_values), |row| row.get(0))?;
    Ok(u64::try_from(total).unwrap_or(0))
}

pub fn exists(conn: &Connection, model: &ModelDef, filters: &[Filter]) -> RepoResult<bool> {
    let (where_sql, bind_values) = where_clause(model, filters)?;
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {}{})",
        quote(&model.table),
        where_sql
    );
    let found: i64 = conn.query_row(&sql, params_from_iter(bind_values), |row| row.get(0))?;
    Ok(found == 1)
}

/// Returns whether another row than `except_pk` holds `value` in `field`.
pub fn exists_except(
    conn: &Connection,
    model: &ModelDef,
    field: &str,
    value: &Value,
    except_pk: Option<&Value>,
) -> RepoResult<bool> {
    let (mut where_sql, mut bind_values) =
        where_clause(model, &[Filter::equal(field, value.clone())])?;
    if let Some(pk) = except_pk {
        let column = pk_column(model);
        where_sql.push_str(&format!(" AND {} <> ?", quote(column.name)));
        bind_values.push(bind(model, &column, pk)?);
    }
    let sql = format!(
        "SELECT EXISTS(SELECT 1 FROM {}{})",
        quote(&model.table),
        where_sql
    );
    let found: i64 = conn.query_row(&sql, params_from_iter(bind_values), |row| row.get(0))?;
    Ok(found == 1)
}

/// Fetches one row by primary key. A key of the wrong type matches nothing.
pub fn get_by_pk(conn: &Connection, model: &ModelDef, pk: &Value) -> RepoResult<Option<Record>> {
    if pk.is_null() || !model.pk_field().ty.accepts(pk) {
        return Ok(None);
    }
    let selection = Selection {
        filters: vec![Filter::equal(model.pk_name(), pk.clone())],
        limit: Some(1),
        ..Selection::default()
    };
    Ok(select(conn, model, &selection)?.into_iter().next())
}

/// Inserts one row and returns its primary key.
///
/// Generated UUID keys, auto timestamps and declared defaults are filled
/// for columns `row` leaves out.
pub fn insert(conn: &Connection, model: &ModelDef, row: &Data) -> RepoResult<Value> {
    let (sql, bind_values, pk) = insert_statement(model, row)?;
    conn.execute(&sql, params_from_iter(bind_values))?;
    Ok(pk.unwrap_or_else(|| Value::from(conn.last_insert_rowid())))
}

/// Inserts many rows through cached statements; returns the inserted count.
pub fn bulk_insert(conn: &Connection, model: &ModelDef, rows: &[Data]) -> RepoResult<usize> {
    for row in rows {
        let (sql, bind_values, _) = insert_statement(model, row)?;
        let mut stmt = conn.prepare_cached(&sql)?;
        stmt.execute(params_from_iter(bind_values))?;
    }
    Ok(rows.len())
}

/// Updates the row `pk` with `row`, refreshing `auto_now` columns.
pub fn update(conn: &Connection, model: &ModelDef, pk: &Value, row: &Data) -> RepoResult<usize> {
    let mut assignments = Vec::new();
    let mut bind_values = Vec::new();
    for (name, value) in row {
        let column = require_column(model, name)?;
        if column.name == model.pk_name() {
            continue;
        }
        assignments.push(format!("{} = ?", quote(column.name)));
        bind_values.push(bind(model, &column, value)?);
    }
    for field in model.fields.iter().filter(|field| field.auto_now) {
        if !row.contains_key(&field.name) {
            assignments.push(format!("{} = ?", quote(&field.name)));
            bind_values.push(SqlValue::Text(now_text()));
        }
    }
    if assignments.is_empty() {
        return Ok(0);
    }

    let column = pk_column(model);
    bind_values.push(bind(model, &column, pk)?);
    let sql = format!(
        "UPDATE {} SET {} WHERE {} = ?",
        quote(&model.table),
        assignments.join(", "),
        quote(column.name)
    );
    Ok(conn.execute(&sql, params_from_iter(bind_values))?)
}

pub fn delete(conn: &Connection, model: &ModelDef, filters: &[Filter]) -> RepoResult<usize> {
    let (where_sql, bind_values) = where_clause(model, filters)?;
    let sql = format!("DELETE FROM {}{}", quote(&model.table), where_sql);
    Ok(conn.execute(&sql, params_from_iter(bind_values))?)
}

/// Largest integer stored in `column` among rows matching `filters`.
pub fn max_value(
    conn: &Connection,
    model: &ModelDef,
    column: &str,
    filters: &[Filter],
) -> RepoResult<Option<i64>> {
    let column = require_column(model, column)?;
    let (where_sql, bind_values) = where_clause(model, filters)?;
    let sql = format!(
        "SELECT MAX({}) FROM {}{}",
        quote(column.name),
        quote(&model.table),
        where_sql
    );
    let max: Option<i64> =
        conn.query_row(&sql, params_from_iter(bind_values), |row| row.get(0))?;
    Ok(max)
}

fn insert_statement(
    model: &ModelDef,
    row: &Data,
) -> RepoResult<(String, Vec<SqlValue>, Option<Value>)> {
    for name in row.keys() {
        require_column(model, name)?;
    }

    let mut names = Vec::new();
    let mut bind_values = Vec::new();
    let mut pk = None;
    for column in model.columns() {
        let value = match row.get(column.name) {
            Some(value) => Some(value.clone()),
            None => generated_value(model, column.name),
        };
        let Some(value) = value else {
            continue;
        };
        if column.name == model.pk_name() && !value.is_null() {
            pk = Some(value.clone());
        }
        names.push(quote(column.name));
        bind_values.push(bind(model, &column, &value)?);
    }

    let sql = if names.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", quote(&model.table))
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&model.table),
            names.join(", "),
            vec!["?"; names.len()].join(", ")
        )
    };
    Ok((sql, bind_values, pk))
}

fn generated_value(model: &ModelDef, column: &str) -> Option<Value> {
    let field = model.field_def(column)?;
    if field.generated && field.ty == ScalarType::Uuid {
        return Some(Value::String(Uuid::new_v4().to_string()));
    }
    if field.is_auto_timestamp() {
        return Some(Value::String(now_text()));
    }
    field.default.clone()
}

fn where_clause(model: &ModelDef, filters: &[Filter]) -> RepoResult<(String, Vec<SqlValue>)> {
    let mut conditions = Vec::with_capacity(filters.len());
    let mut bind_values = Vec::new();
    for filter in filters {
        conditions.push(condition(model, filter, &mut bind_values)?);
    }
    if conditions.is_empty() {
        return Ok((String::new(), bind_values));
    }
    Ok((format!(" WHERE {}", conditions.join(" AND ")), bind_values))
}

fn condition(model: &ModelDef, filter: &Filter, bind_values: &mut Vec<SqlValue>) -> RepoResult<String> {
    let column = model.column(filter.field()).ok_or_else(|| invalid_filter(model, filter, "unknown field"))?;
    let name = quote(column.name);
    let folded = column.case_insensitive && column.ty.is_textual();
    let target = if folded { format!("{CASEFOLD_FUNCTION}({name})") } else { name.clone() };
    let placeholder = if folded { format!("{CASEFOLD_FUNCTION}(?)") } else { "?".to_string() };

    let sql = match filter {
        Filter::Equal { value, .. } if value.is_null() => format!("{name} IS NULL"),
        Filter::Equal { value, .. } => {
            bind_values.push(filter_value(model, filter, &column, value)?);
            format!("{target} = {placeholder}")
        }
        Filter::In { values, .. } if values.is_empty() => "0 = 1".to_string(),
        Filter::In { values, .. } => {
            for value in values {
                bind_values.push(filter_value(model, filter, &column, value)?);
            }
            format!("{target} IN ({})", vec![placeholder.as_str(); values.len()].join(", "))
        }
        Filter::Less { value, .. } | Filter::More { value, .. } => {
            if value.is_null() {
                return Err(invalid_filter(model, filter, "cannot compare with null").into());
            }
            bind_values.push(filter_value(model, filter, &column, value)?);
            let operator = if matches!(filter, Filter::Less { .. }) { "<" } else { ">" };
            format!("{name} {operator} ?")
        }
        Filter::StartsWith { value, .. }
        | Filter::EndsWith { value, .. }
        | Filter::Contains { value, .. } => {
            if !column.ty.is_textual() {
                return Err(invalid_filter(model, filter, "string filter on non-text field").into());
            }
            if value.is_empty() {
                return Ok("1 = 1".to_string());
            }
            let needle = SqlValue::Text(value.clone());
            match filter {
                Filter::StartsWith { .. } => {
                    bind_values.push(needle.clone());
                    bind_values.push(needle);
                    format!("substr({target}, 1, length({placeholder})) = {placeholder}")
                }
                Filter::EndsWith { .. } => {
                    bind_values.push(needle.clone());
                    bind_values.push(needle);
                    format!("substr({target}, -length({placeholder})) = {placeholder}")
                }
                _ => {
                    bind_values.push(needle);
                    format!("instr({target}, {placeholder}) > 0")
                }
            }
        }
    };
    Ok(sql)
}

fn filter_value(
    model: &ModelDef,
    filter: &Filter,
    column: &Column<'_>,
    value: &Value,
) -> Result<SqlValue, ConfigError> {
    to_sql(column.ty, value).map_err(|reason| invalid_filter(model, filter, &reason))
}

fn invalid_filter(model: &ModelDef, filter: &Filter, reason: &str) -> ConfigError {
    ConfigError::InvalidFilter {
        model: model.name.clone(),
        field: filter.field().to_string(),
        reason: reason.to_string(),
    }
}

fn order_clause(model: &ModelDef, sort: &[String]) -> Result<String, ConfigError> {
    let mut terms = Vec::with_capacity(sort.len() + 1);
    let mut has_pk = false;
    for entry in sort {
        let (name, direction) = match entry.strip_prefix('-') {
            Some(name) => (name, "DESC"),
            None => (entry.as_str(), "ASC"),
        };
        let column = model.column(name).ok_or_else(|| ConfigError::InvalidSort {
            model: model.name.clone(),
            field: name.to_string(),
        })?;
        has_pk |= column.name == model.pk_name();
        terms.push(format!("{} {direction}", quote(column.name)));
    }
    if !has_pk {
        terms.push(format!("{} ASC", quote(model.pk_name())));
    }
    Ok(format!(" ORDER BY {}", terms.join(", ")))
}

fn column_list(columns: &[Column<'_>]) -> String {
    columns
        .iter()
        .map(|column| quote(column.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn pk_column(model: &ModelDef) -> Column<'_> {
    let field = model.pk_field();
    Column {
        name: field.name.as_str(),
        ty: &field.ty,
        case_insensitive: field.case_insensitive,
    }
}

fn require_column<'m>(model: &'m ModelDef, name: &str) -> Result<Column<'m>, ConfigError> {
    model.column(name).ok_or_else(|| ConfigError::UnknownField {
        model: model.name.clone(),
        field: name.to_string(),
    })
}

fn bind(model: &ModelDef, column: &Column<'_>, value: &Value) -> RepoResult<SqlValue> {
    to_sql(column.ty, value).map_err(|reason| {
        RepoError::InvalidData(format!(
            "cannot store {}.{}: {reason}",
            model.name, column.name
        ))
    })
}

fn parse_record(model: &ModelDef, columns: &[Column<'_>], row: &Row<'_>) -> RepoResult<Record> {
    let mut values = Data::new();
    for (index, column) in columns.iter().enumerate() {
        let raw: SqlValue = row.get(index)?;
        let value = from_sql(column.ty, raw).map_err(|reason| {
            RepoError::InvalidData(format!(
                "{reason} in {}.{}",
                model.table, column.name
            ))
        })?;
        values.insert(column.name.to_string(), value);
    }
    let pk = values.get(model.pk_name()).cloned().unwrap_or(Value::Null);
    Ok(Record {
        model: model.name.clone(),
        pk,
        values,
    })
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

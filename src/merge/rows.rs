use rusqlite::types::Value;
use rusqlite::{params_from_iter, Row, Transaction};

use crate::db::quote_ident;
use crate::{AppError, AppResult};

fn column_list(columns: &[&str]) -> String {
    columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn build_select_sql(table: &str, columns: &[&str], order_by: Option<&str>) -> String {
    let mut sql = format!("SELECT {} FROM {}", column_list(columns), quote_ident(table));
    if let Some(order) = order_by {
        sql.push_str(&format!(" ORDER BY {} ASC", quote_ident(order)));
    }
    sql
}

pub(crate) fn build_insert_sql(table: &str, columns: &[&str]) -> String {
    let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table),
        column_list(columns),
        placeholders.join(", "),
    )
}

pub(crate) fn extract_values(row: &Row<'_>, count: usize) -> AppResult<Vec<Value>> {
    let mut values = Vec::with_capacity(count);
    for idx in 0..count {
        let value: Value = row.get(idx).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_value")
                .with_context("column_index", idx.to_string())
        })?;
        values.push(value);
    }
    Ok(values)
}

/// Insert one row through the statement cache and return its new rowid.
pub(crate) fn insert_row(tx: &Transaction<'_>, insert_sql: &str, values: &[Value]) -> AppResult<i64> {
    let mut stmt = tx
        .prepare_cached(insert_sql)
        .map_err(|err| AppError::from(err).with_context("operation", "prepare_insert"))?;
    stmt.execute(params_from_iter(values.iter()))
        .map_err(|err| AppError::from(err).with_context("operation", "insert_row"))?;
    Ok(tx.last_insert_rowid())
}

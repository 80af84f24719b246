use rusqlite::types::Value;
use rusqlite::{Connection, Transaction};

use super::remap::{IdRemap, RemapLookup};
use super::report::TableMergeStats;
use super::rows::{build_insert_sql, build_select_sql, extract_values, insert_row};
use super::schema::TableSchema;
use super::source::Sources;
use crate::{AppError, AppResult};

/// Replay one child table from both sources into the output.
///
/// `schema` comes from the output database; its data columns (everything but
/// the synthetic identity) are read by name from each source. Rows whose
/// parent won are re-pointed at the parent's new id, rows whose parent lost
/// are dropped as duplicates, and rows with no mapped parent are dropped as
/// dangling.
pub fn merge_dependent_table(
    tx: &Transaction<'_>,
    sources: &Sources,
    schema: &TableSchema,
    foreign_key: &str,
    remap: &IdRemap,
) -> AppResult<TableMergeStats> {
    let columns: Vec<&str> = schema
        .data_columns()
        .into_iter()
        .map(|col| col.name.as_str())
        .collect();
    let fk_index = columns
        .iter()
        .position(|column| *column == foreign_key)
        .ok_or_else(|| {
            AppError::new(
                "MERGE/FK_COLUMN_MISSING",
                "Dependent table has no such foreign key column",
            )
            .with_context("table", schema.name.clone())
            .with_context("column", foreign_key.to_string())
        })?;
    let order_by = schema.identity_column().map(|col| col.name.as_str());
    let select_sql = build_select_sql(&schema.name, &columns, order_by);
    let insert_sql = build_insert_sql(&schema.name, &columns);

    let mut stats = TableMergeStats::default();
    for (origin, conn) in sources.each() {
        let with_ctx = |err: AppError| {
            err.with_context("table", schema.name.clone())
                .with_context("origin", origin.as_str())
        };
        for_each_row(conn, &select_sql, columns.len(), |mut values| {
            match remap.resolve(origin, &values[fk_index]) {
                RemapLookup::Winner(new_id) => {
                    values[fk_index] = Value::Integer(new_id);
                    insert_row(tx, &insert_sql, &values)?;
                    stats.merged += 1;
                }
                RemapLookup::Loser(_) => stats.deduplicated += 1,
                RemapLookup::Dangling => {
                    tracing::debug!(
                        target: "quote_merge",
                        event = "dangling_row_skipped",
                        table = %schema.name,
                        origin = origin.as_str(),
                        foreign_key = ?values[fk_index],
                    );
                    stats.dangling += 1;
                }
            }
            Ok(())
        })
        .map_err(with_ctx)?;
    }

    if stats.dangling > 0 {
        tracing::warn!(
            target: "quote_merge",
            event = "dangling_rows_skipped",
            table = %schema.name,
            rows = stats.dangling,
        );
    }
    tracing::info!(
        target: "quote_merge",
        event = "dependent_table_merged",
        table = %schema.name,
        merged = stats.merged,
        deduplicated = stats.deduplicated,
        dangling = stats.dangling,
    );
    Ok(stats)
}

/// Copy a lookup table from the reference database verbatim, identity
/// included, so rows elsewhere that point at it keep resolving.
pub fn copy_reference_table(
    tx: &Transaction<'_>,
    main: &Connection,
    schema: &TableSchema,
) -> AppResult<TableMergeStats> {
    let columns = schema.column_names();
    let order_by = schema.identity_column().map(|col| col.name.as_str());
    let select_sql = build_select_sql(&schema.name, &columns, order_by);
    let insert_sql = build_insert_sql(&schema.name, &columns);

    let mut stats = TableMergeStats::default();
    for_each_row(main, &select_sql, columns.len(), |values| {
        insert_row(tx, &insert_sql, &values)?;
        stats.merged += 1;
        Ok(())
    })
    .map_err(|err| err.with_context("table", schema.name.clone()))?;

    tracing::info!(
        target: "quote_merge",
        event = "reference_table_copied",
        table = %schema.name,
        rows = stats.merged,
    );
    Ok(stats)
}

fn for_each_row<F>(conn: &Connection, select_sql: &str, count: usize, mut f: F) -> AppResult<()>
where
    F: FnMut(Vec<Value>) -> AppResult<()>,
{
    let mut stmt = conn
        .prepare(select_sql)
        .map_err(|err| AppError::from(err).with_context("operation", "prepare_select"))?;
    let mut rows = stmt
        .query([])
        .map_err(|err| AppError::from(err).with_context("operation", "query_select"))?;
    while let Some(row) = rows
        .next()
        .map_err(|err| AppError::from(err).with_context("operation", "read_row"))?
    {
        f(extract_values(row, count)?)?;
    }
    Ok(())
}

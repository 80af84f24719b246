use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, Transaction};

use super::analyze::DecisionSet;
use super::remap::IdRemap;
use super::report::TableMergeStats;
use super::rows::{build_insert_sql, build_select_sql, extract_values, insert_row};
use super::schema::TableSchema;
use super::source::Sources;
use crate::config::PrimaryTableSpec;
use crate::db::quote_ident;
use crate::{AppError, AppResult};

/// Column layout shared by every primary-row copy in one run.
struct PrimaryCopy<'a> {
    table: &'a str,
    identity: &'a str,
    data_columns: Vec<&'a str>,
    insert_sql: String,
}

impl<'a> PrimaryCopy<'a> {
    fn new(schema: &'a TableSchema) -> AppResult<Self> {
        let identity = schema.identity_column().ok_or_else(|| {
            AppError::new(
                "MERGE/NO_IDENTITY",
                "Primary table has no INTEGER PRIMARY KEY column",
            )
            .with_context("table", schema.name.clone())
        })?;
        let data_columns: Vec<&str> = schema
            .data_columns()
            .into_iter()
            .map(|col| col.name.as_str())
            .collect();
        let insert_sql = build_insert_sql(&schema.name, &data_columns);
        Ok(Self {
            table: &schema.name,
            identity: &identity.name,
            data_columns,
            insert_sql,
        })
    }

    fn fetch(&self, conn: &Connection, id: i64) -> AppResult<Option<Vec<Value>>> {
        let sql = format!(
            "{} WHERE {} = ?1",
            build_select_sql(self.table, &self.data_columns, None),
            quote_ident(self.identity)
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|err| AppError::from(err).with_context("operation", "prepare_fetch_winner"))?;
        let count = self.data_columns.len();
        let values = stmt
            .query_row([id], |row| Ok(extract_values(row, count)))
            .optional()
            .map_err(|err| AppError::from(err).with_context("operation", "fetch_winner"))?;
        values.transpose()
    }

    fn find_by_key(
        &self,
        conn: &Connection,
        business_key_column: &str,
        business_key: &str,
    ) -> AppResult<Option<i64>> {
        let sql = format!(
            "SELECT {id} FROM {table} WHERE CAST({key} AS TEXT) = ?1 ORDER BY {id} DESC LIMIT 1",
            id = quote_ident(self.identity),
            table = quote_ident(self.table),
            key = quote_ident(business_key_column),
        );
        let mut stmt = conn
            .prepare_cached(&sql)
            .map_err(|err| AppError::from(err).with_context("operation", "prepare_find_loser"))?;
        stmt.query_row([business_key], |row| row.get(0))
            .optional()
            .map_err(|err| AppError::from(err).with_context("operation", "find_loser"))
    }
}

/// Copy every winning primary row into the output and build the id remap.
///
/// Each decision inserts exactly one row. For overlapping keys the loser's
/// original id is looked up again by business key and mapped to the same new
/// row; a loser that has vanished is logged and left out of the
/// deduplicated count.
pub fn merge_primary(
    tx: &Transaction<'_>,
    sources: &Sources,
    schema: &TableSchema,
    spec: &PrimaryTableSpec,
    decisions: &DecisionSet,
) -> AppResult<(IdRemap, TableMergeStats)> {
    let copy = PrimaryCopy::new(schema)?;
    let mut remap = IdRemap::new();
    let mut stats = TableMergeStats::default();

    for decision in decisions.iter() {
        let winner = decision.winner;
        let with_ctx = |err: AppError| {
            err.with_context("table", schema.name.clone())
                .with_context("business_key", decision.business_key.clone())
                .with_context("origin", winner.origin.as_str())
        };

        let values = copy
            .fetch(sources.get(winner.origin), winner.id)
            .map_err(with_ctx)?
            .ok_or_else(|| {
                with_ctx(
                    AppError::new("MERGE/WINNER_MISSING", "Winning row disappeared from its source")
                        .with_context("original_id", winner.id.to_string()),
                )
            })?;
        let new_id = insert_row(tx, &copy.insert_sql, &values).map_err(with_ctx)?;
        remap.register_winner(winner.origin, winner.id, new_id)?;
        stats.merged += 1;

        let Some(loser_origin) = decision.loser_origin() else {
            continue;
        };
        match copy
            .find_by_key(sources.get(loser_origin), &spec.business_key, &decision.business_key)
            .map_err(with_ctx)?
        {
            Some(loser_id) => {
                remap.register_loser(loser_origin, loser_id, new_id)?;
                stats.deduplicated += 1;
            }
            None => {
                tracing::warn!(
                    target: "quote_merge",
                    event = "loser_row_missing",
                    table = %schema.name,
                    business_key = %decision.business_key,
                    origin = loser_origin.as_str(),
                );
            }
        }
    }

    tracing::info!(
        target: "quote_merge",
        event = "primary_merged",
        table = %schema.name,
        merged = stats.merged,
        deduplicated = stats.deduplicated,
    );
    Ok((remap, stats))
}

pub fn count_rows(conn: &Connection, table: &str) -> AppResult<u64> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| row.get(0))
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "count_rows")
                .with_context("table", table.to_string())
        })?;
    Ok(u64::try_from(count).unwrap_or(0))
}

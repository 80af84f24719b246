use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{DependentTableSpec, MergeTables};
use crate::db::{quote_ident, run_in_tx};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    pub declared_type: String,
    pub not_null: bool,
    /// 1-based position inside the primary key, 0 when not part of it.
    pub primary_key: u32,
}

/// Ordered column list of one table, read once and handed to the copy routines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
}

impl TableSchema {
    /// The synthetic identity: the table's sole `INTEGER` primary key column.
    pub fn identity_column(&self) -> Option<&ColumnDescriptor> {
        let mut pk = self.columns.iter().filter(|col| col.primary_key > 0);
        match (pk.next(), pk.next()) {
            (Some(col), None) if col.declared_type.eq_ignore_ascii_case("INTEGER") => Some(col),
            _ => None,
        }
    }

    /// Every column except the synthetic identity, in declaration order.
    pub fn data_columns(&self) -> Vec<&ColumnDescriptor> {
        let identity = self.identity_column().map(|col| col.name.as_str());
        self.columns
            .iter()
            .filter(|col| Some(col.name.as_str()) != identity)
            .collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|col| col.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|col| col.name.as_str()).collect()
    }
}

pub fn table_exists(conn: &Connection, table: &str) -> AppResult<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_exists")
                .with_context("table", table.to_string())
        })?;
    Ok(found.is_some())
}

/// Read a table's column descriptors, or `None` when the table is absent.
pub fn reflect_table(conn: &Connection, table: &str) -> AppResult<Option<TableSchema>> {
    if !table_exists(conn, table)? {
        return Ok(None);
    }
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_info")
                .with_context("table", table.to_string())
        })?;
    let columns = stmt
        .query_map([], |row| {
            let declared_type: Option<String> = row.get(2)?;
            let not_null: i64 = row.get(3)?;
            let primary_key: i64 = row.get(5)?;
            Ok(ColumnDescriptor {
                name: row.get(1)?,
                declared_type: declared_type.unwrap_or_default(),
                not_null: not_null != 0,
                primary_key: u32::try_from(primary_key).unwrap_or(0),
            })
        })
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_info_query")
                .with_context("table", table.to_string())
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_info_iter")
                .with_context("table", table.to_string())
        })?;

    Ok(Some(TableSchema {
        name: table.to_string(),
        columns,
    }))
}

/// Column descriptors for every table a merge run touches, resolved once.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectedTables {
    pub primary: TableSchema,
    pub dependents: Vec<(DependentTableSpec, TableSchema)>,
    pub references: Vec<TableSchema>,
    /// Configured tables that do not exist in the reflected database.
    pub missing: Vec<String>,
}

impl ReflectedTables {
    pub fn primary_identity(&self) -> AppResult<&ColumnDescriptor> {
        self.primary.identity_column().ok_or_else(|| {
            AppError::new(
                "MERGE/NO_IDENTITY",
                "Primary table has no INTEGER PRIMARY KEY column",
            )
            .with_context("table", self.primary.name.clone())
        })
    }
}

pub fn reflect_merge_tables(conn: &Connection, tables: &MergeTables) -> AppResult<ReflectedTables> {
    let primary_spec = &tables.primary;
    let primary = reflect_table(conn, &primary_spec.table)?.ok_or_else(|| {
        AppError::new("MERGE/TABLE_MISSING", "Primary table does not exist")
            .with_context("table", primary_spec.table.clone())
    })?;
    for column in [
        &primary_spec.business_key,
        &primary_spec.updated_column,
        &primary_spec.created_column,
    ] {
        if !primary.has_column(column) {
            return Err(AppError::new(
                "MERGE/SCHEMA_MISMATCH",
                "Primary table is missing a required column",
            )
            .with_context("table", primary_spec.table.clone())
            .with_context("column", column.clone()));
        }
    }

    let mut missing = Vec::new();
    let mut dependents = Vec::new();
    for spec in &tables.dependents {
        match reflect_table(conn, &spec.table)? {
            Some(schema) => dependents.push((spec.clone(), schema)),
            None => missing.push(spec.table.clone()),
        }
    }
    let mut references = Vec::new();
    for table in &tables.reference_tables {
        match reflect_table(conn, table)? {
            Some(schema) => references.push(schema),
            None => missing.push(table.clone()),
        }
    }

    Ok(ReflectedTables {
        primary,
        dependents,
        references,
        missing,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSummary {
    pub tables: Vec<String>,
    pub indexes: Vec<String>,
    pub skipped: Vec<String>,
}

struct SchemaObject {
    kind: String,
    name: String,
    sql: String,
}

fn load_schema_objects(conn: &Connection) -> AppResult<Vec<SchemaObject>> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name, sql FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%' AND sql IS NOT NULL
             ORDER BY rowid",
        )
        .map_err(|err| AppError::from(err).with_context("operation", "list_schema"))?;
    let objects = stmt
        .query_map([], |row| {
            Ok(SchemaObject {
                kind: row.get(0)?,
                name: row.get(1)?,
                sql: row.get(2)?,
            })
        })
        .map_err(|err| AppError::from(err).with_context("operation", "list_schema_query"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "list_schema_iter"))?;
    Ok(objects)
}

fn is_virtual_table(sql: &str) -> bool {
    sql.trim_start()
        .to_uppercase()
        .starts_with("CREATE VIRTUAL TABLE")
}

/// Recreate the reference database's tables, then its explicit indexes, on an
/// empty output connection. Either every statement applies or none does.
pub fn clone_schema(reference: &Connection, output: &mut Connection) -> AppResult<CloneSummary> {
    let objects = load_schema_objects(reference)?;
    let mut summary = CloneSummary::default();

    let (tables, rest): (Vec<_>, Vec<_>) = objects
        .into_iter()
        .partition(|object| object.kind == "table");

    run_in_tx(output, |tx| {
        for table in &tables {
            if is_virtual_table(&table.sql) {
                tracing::warn!(
                    target: "quote_merge",
                    event = "schema_object_skipped",
                    kind = "virtual table",
                    name = %table.name,
                );
                summary.skipped.push(table.name.clone());
                continue;
            }
            tx.execute_batch(&table.sql).map_err(|err| {
                AppError::new("MERGE/SCHEMA_CLONE", "Failed to recreate table")
                    .with_context("table", table.name.clone())
                    .with_cause(err)
            })?;
            summary.tables.push(table.name.clone());
        }
        for object in &rest {
            if object.kind != "index" {
                tracing::debug!(
                    target: "quote_merge",
                    event = "schema_object_skipped",
                    kind = %object.kind,
                    name = %object.name,
                );
                summary.skipped.push(object.name.clone());
                continue;
            }
            tx.execute_batch(&object.sql).map_err(|err| {
                AppError::new("MERGE/SCHEMA_CLONE", "Failed to recreate index")
                    .with_context("index", object.name.clone())
                    .with_cause(err)
            })?;
            summary.indexes.push(object.name.clone());
        }
        Ok(())
    })?;

    tracing::info!(
        target: "quote_merge",
        event = "schema_cloned",
        tables = summary.tables.len(),
        indexes = summary.indexes.len(),
        skipped = summary.skipped.len(),
    );
    Ok(summary)
}

/// SHA-256 over the whitespace-normalised `CREATE TABLE` text of `tables`.
pub fn schema_fingerprint(conn: &Connection, tables: &[&str]) -> AppResult<String> {
    let mut hasher = Sha256::new();
    for table in tables {
        let sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "schema_fingerprint")
                    .with_context("table", table.to_string())
            })?
            .flatten();
        hasher.update(table.as_bytes());
        hasher.update(b"\n");
        match sql {
            Some(sql) => hasher.update(sql.split_whitespace().collect::<Vec<_>>().join(" ")),
            None => hasher.update(b"<missing>"),
        }
        hasher.update(b"\n");
    }
    Ok(format!("{:x}", hasher.finalize()))
}

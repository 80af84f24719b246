use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;

use super::primary::count_rows;
use crate::config::DependentTableSpec;
use crate::db::quote_ident;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityViolation {
    pub table: String,
    pub rowid: Option<i64>,
    pub parent: Option<String>,
    /// Which scan found it: `foreign_key_check` or `orphan_scan`.
    pub check: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub integrity_ok: bool,
    pub integrity_error: Option<String>,
    pub violations: Vec<IntegrityViolation>,
    pub primary_count: u64,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            integrity_ok: true,
            integrity_error: None,
            violations: Vec::new(),
            primary_count: 0,
        }
    }
}

impl ValidationReport {
    pub fn violation_count(&self) -> usize {
        self.violations.len()
    }

    pub fn is_clean(&self) -> bool {
        self.integrity_ok && self.violations.is_empty()
    }
}

/// Read-only checks over the committed output. Problems are reported, never
/// repaired; only a failure to run the checks at all is an error.
pub fn validate_output(
    conn: &Connection,
    primary_table: &str,
    primary_identity: &str,
    dependents: &[DependentTableSpec],
) -> AppResult<ValidationReport> {
    let mut report = ValidationReport::default();

    match conn.query_row("PRAGMA integrity_check", [], |row| row.get::<_, String>(0)) {
        Ok(value) if value.eq_ignore_ascii_case("ok") => {}
        Ok(value) => {
            report.integrity_ok = false;
            report.integrity_error = Some(value);
        }
        Err(err) => {
            report.integrity_ok = false;
            report.integrity_error = Some(err.to_string());
        }
    }

    let mut seen: BTreeSet<(String, Option<i64>)> = BTreeSet::new();
    for violation in foreign_key_check(conn)? {
        if seen.insert((violation.table.clone(), violation.rowid)) {
            report.violations.push(violation);
        }
    }
    for spec in dependents {
        for violation in orphan_scan(conn, spec, primary_table, primary_identity)? {
            if seen.insert((violation.table.clone(), violation.rowid)) {
                report.violations.push(violation);
            }
        }
    }

    report.primary_count = count_rows(conn, primary_table)?;

    if report.is_clean() {
        tracing::info!(
            target: "quote_merge",
            event = "merge_validated",
            primary_rows = report.primary_count,
        );
    } else {
        tracing::warn!(
            target: "quote_merge",
            event = "merge_validated",
            primary_rows = report.primary_count,
            integrity_ok = report.integrity_ok,
            violations = report.violation_count(),
        );
    }
    Ok(report)
}

fn foreign_key_check(conn: &Connection) -> AppResult<Vec<IntegrityViolation>> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(IntegrityViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                check: "foreign_key_check".to_string(),
            })
        })
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check_iter"))?;
    Ok(rows)
}

/// Child rows whose parent reference is NULL or points at no primary row,
/// whether or not the schema declares the foreign key.
fn orphan_scan(
    conn: &Connection,
    spec: &DependentTableSpec,
    primary_table: &str,
    primary_identity: &str,
) -> AppResult<Vec<IntegrityViolation>> {
    if !super::schema::table_exists(conn, &spec.table)? {
        return Ok(Vec::new());
    }
    let fk = quote_ident(&spec.foreign_key);
    let sql = format!(
        "SELECT rowid FROM {table} WHERE {fk} IS NULL OR {fk} NOT IN (SELECT {id} FROM {parent}) ORDER BY rowid",
        table = quote_ident(&spec.table),
        id = quote_ident(primary_identity),
        parent = quote_ident(primary_table),
    );
    let with_ctx = |err: rusqlite::Error| {
        AppError::from(err)
            .with_context("operation", "orphan_scan")
            .with_context("table", spec.table.clone())
    };
    let mut stmt = conn.prepare(&sql).map_err(with_ctx)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(IntegrityViolation {
                table: spec.table.clone(),
                rowid: row.get(0)?,
                parent: Some(primary_table.to_string()),
                check: "orphan_scan".to_string(),
            })
        })
        .map_err(with_ctx)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(with_ctx)?;
    Ok(rows)
}

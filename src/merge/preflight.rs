use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rusqlite::Connection;

use super::schema::{reflect_table, schema_fingerprint, ReflectedTables};
use super::source::Origin;
use crate::db;
use crate::{AppError, AppResult};

/// Fail fast on a source that is missing, not a file, or not a SQLite database.
pub fn check_source(path: &Path, origin: Origin) -> AppResult<()> {
    let path_ctx = |err: AppError| {
        err.with_context("path", path.display().to_string())
            .with_context("origin", origin.as_str())
    };
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(path_ctx(AppError::new(
                "MERGE/INPUT_MISSING",
                "Source database does not exist",
            )));
        }
        Err(err) => {
            return Err(path_ctx(
                AppError::new("MERGE/INPUT_UNREADABLE", "Source database cannot be read")
                    .with_cause(err),
            ));
        }
    };
    if !meta.is_file() {
        return Err(path_ctx(AppError::new(
            "MERGE/INPUT_UNREADABLE",
            "Source path is not a regular file",
        )));
    }

    let conn = db::open_source(path).map_err(|err| {
        path_ctx(AppError::new("MERGE/INPUT_UNREADABLE", "Source database cannot be opened").with_cause(err))
    })?;
    let probe = conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0));
    if let Err(err) = probe {
        let cause = AppError::from(err);
        let code = if cause.code() == "Sqlite/NotADatabase" {
            "MERGE/INPUT_NOT_SQLITE"
        } else {
            "MERGE/INPUT_UNREADABLE"
        };
        return Err(path_ctx(
            AppError::new(code, "Source is not a readable SQLite database").with_cause(cause),
        ));
    }
    db::close_connection(conn, path)?;
    Ok(())
}

/// Validate the output location without touching the filesystem. The
/// output must not alias either source.
pub fn check_output(output: &Path, sources: &[&Path]) -> AppResult<()> {
    let out_ctx = |err: AppError| err.with_context("path", output.display().to_string());
    if output.is_dir() {
        return Err(out_ctx(AppError::new(
            "MERGE/OUTPUT_OCCUPIED",
            "Output path is a directory",
        )));
    }

    let output_abs = resolve_path(output);
    for source in sources {
        if resolve_path(source) == output_abs {
            return Err(out_ctx(
                AppError::new("MERGE/SAME_FILE", "Output path is one of the source databases")
                    .with_context("source", source.display().to_string()),
            ));
        }
    }
    Ok(())
}

/// Canonical form when the file exists, otherwise canonical parent plus name.
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() {
                Path::new(".")
            } else {
                parent
            };
            parent
                .canonicalize()
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}

/// Every column the merge will read from main must also exist in the copy.
pub fn check_schema_compat(
    main_tables: &ReflectedTables,
    main: &Connection,
    copy: &Connection,
) -> AppResult<()> {
    let mut names: Vec<&str> = vec![main_tables.primary.name.as_str()];
    names.extend(main_tables.dependents.iter().map(|(spec, _)| spec.table.as_str()));

    let schemas = std::iter::once(&main_tables.primary)
        .chain(main_tables.dependents.iter().map(|(_, schema)| schema));
    for main_schema in schemas {
        let copy_schema = reflect_table(copy, &main_schema.name)?.ok_or_else(|| {
            AppError::new("MERGE/SCHEMA_MISMATCH", "Table is missing from the copy database")
                .with_context("table", main_schema.name.clone())
        })?;
        for column in &main_schema.columns {
            if !copy_schema.has_column(&column.name) {
                return Err(AppError::new(
                    "MERGE/SCHEMA_MISMATCH",
                    "Column is missing from the copy database",
                )
                .with_context("table", main_schema.name.clone())
                .with_context("column", column.name.clone()));
            }
        }
    }

    let main_fp = schema_fingerprint(main, &names)?;
    let copy_fp = schema_fingerprint(copy, &names)?;
    if main_fp == copy_fp {
        tracing::debug!(target: "quote_merge", event = "schema_fingerprint", fingerprint = %main_fp);
    } else {
        tracing::warn!(
            target: "quote_merge",
            event = "schema_fingerprint_mismatch",
            main = %main_fp,
            copy = %copy_fp,
        );
    }
    Ok(())
}

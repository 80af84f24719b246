use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use fs2::available_space;
use rusqlite::{Connection, DatabaseName, OpenFlags};
use serde::Serialize;

use crate::{AppError, AppResult};

use super::{file_sha256, size_with_sidecars, sync_dir};

const BACKUP_INFIX: &str = ".backup_";
const PARTIAL_SUFFIX: &str = ".partial";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const REQUIRED_FREE_MULTIPLIER: f64 = 1.2;
const MAX_NAME_ATTEMPTS: usize = 100;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub source: PathBuf,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Write a consistent timestamped copy of every source next to the original.
///
/// All copies share one timestamp. Nothing is written unless every target
/// directory has room for its copies; a copy that fails midway is removed.
pub fn create_source_backups(
    sources: &[&Path],
    timestamp: &DateTime<Local>,
) -> AppResult<Vec<BackupEntry>> {
    ensure_free_space(sources)?;

    let mut entries = Vec::with_capacity(sources.len());
    for source in sources {
        let target = unique_backup_path(source, timestamp)?;
        let entry = write_backup(source, &target)?;
        tracing::info!(
            target: "quote_merge",
            event = "backup_created",
            source = %entry.source.display(),
            path = %entry.path.display(),
            size_bytes = entry.size_bytes,
        );
        entries.push(entry);
    }
    Ok(entries)
}

pub fn backup_file_name(source: &Path, timestamp: &DateTime<Local>) -> AppResult<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        AppError::new("DB_BACKUP/NO_FILE_NAME", "Source path has no file name")
            .with_context("path", source.display().to_string())
    })?;
    let mut backup_name = name.to_os_string();
    backup_name.push(BACKUP_INFIX);
    backup_name.push(timestamp.format(TIMESTAMP_FORMAT).to_string());
    Ok(source.with_file_name(backup_name))
}

fn unique_backup_path(source: &Path, timestamp: &DateTime<Local>) -> AppResult<PathBuf> {
    let base = backup_file_name(source, timestamp)?;
    for suffix in 0..MAX_NAME_ATTEMPTS {
        let candidate = if suffix == 0 {
            base.clone()
        } else {
            let mut name = base.clone().into_os_string();
            name.push(format!("_{suffix:02}"));
            PathBuf::from(name)
        };
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(
        AppError::new("DB_BACKUP/NAME_COLLISION", "Unable to allocate backup file name")
            .with_context("path", base.display().to_string()),
    )
}

pub(crate) fn required_free_bytes(total_size: u64) -> u64 {
    ((total_size as f64 * REQUIRED_FREE_MULTIPLIER).ceil()) as u64
}

fn ensure_free_space(sources: &[&Path]) -> AppResult<()> {
    let mut per_dir: BTreeMap<PathBuf, u64> = BTreeMap::new();
    for source in sources {
        let dir = parent_dir(source);
        *per_dir.entry(dir).or_default() += size_with_sidecars(source);
    }

    for (dir, total) in per_dir {
        let required = required_free_bytes(total);
        let available = available_space(&dir).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "available_space")
                .with_context("path", dir.display().to_string())
        })?;
        if available < required {
            return Err(AppError::new(
                "DB_BACKUP/INSUFFICIENT_SPACE",
                "Not enough free disk space to back up the source databases",
            )
            .with_context("path", dir.display().to_string())
            .with_context("available_bytes", available.to_string())
            .with_context("required_bytes", required.to_string()));
        }
    }
    Ok(())
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn write_backup(source: &Path, target: &Path) -> AppResult<BackupEntry> {
    let mut partial_name = target.as_os_str().to_os_string();
    partial_name.push(PARTIAL_SUFFIX);
    let partial = PathBuf::from(partial_name);

    let result = (|| -> AppResult<BackupEntry> {
        run_sqlite_backup(source, &partial)?;
        fs::rename(&partial, target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "finalize_backup")
                .with_context("from", partial.display().to_string())
                .with_context("to", target.display().to_string())
        })?;
        sync_dir(&parent_dir(target)).ok();

        let sha256 = file_sha256(target).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "hash_backup")
                .with_context("path", target.display().to_string())
        })?;
        let size_bytes = fs::metadata(target).map(|meta| meta.len()).unwrap_or(0);
        Ok(BackupEntry {
            source: source.to_path_buf(),
            path: target.to_path_buf(),
            size_bytes,
            sha256,
        })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result
}

fn run_sqlite_backup(src: &Path, dest: &Path) -> AppResult<()> {
    let src_conn = Connection::open_with_flags(
        src,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_backup_source")
            .with_context("path", src.display().to_string())
    })?;

    src_conn
        .backup(DatabaseName::Main, dest, None)
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "backup_copy")
                .with_context("from", src.display().to_string())
                .with_context("to", dest.display().to_string())
        })?;

    // A WAL-mode source produces a WAL-mode header; keep the copy self-contained.
    let dest_conn = Connection::open(dest).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_backup_copy")
            .with_context("path", dest.display().to_string())
    })?;
    dest_conn.execute_batch("PRAGMA journal_mode=DELETE;").ok();
    dest_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_backup_db"))?;
    src_conn
        .close()
        .map_err(|(_, err)| AppError::from(err).with_context("operation", "close_source_db"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn fixed_timestamp() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2024, 3, 9, 14, 5, 7)
            .single()
            .expect("unambiguous local time")
    }

    fn seed_db(path: &Path) {
        let conn = Connection::open(path).expect("open seed db");
        conn.execute_batch(
            "CREATE TABLE quotes (id INTEGER PRIMARY KEY, quote_no TEXT);
             INSERT INTO quotes (quote_no) VALUES ('Q1'), ('Q2');",
        )
        .expect("seed schema");
    }

    #[test]
    fn backup_name_appends_timestamp() {
        let name = backup_file_name(Path::new("/data/quote_tracker.db"), &fixed_timestamp())
            .expect("name");
        assert_eq!(
            name,
            PathBuf::from("/data/quote_tracker.db.backup_20240309_140507")
        );
    }

    #[test]
    fn backups_are_readable_copies() {
        let tmp = tempdir().expect("tempdir");
        let main = tmp.path().join("main.db");
        let copy = tmp.path().join("copy.db");
        seed_db(&main);
        seed_db(&copy);

        let entries = create_source_backups(&[&main, &copy], &fixed_timestamp()).expect("backups");
        assert_eq!(entries.len(), 2);
        for entry in &entries {
            assert!(entry.path.exists());
            assert!(entry
                .path
                .to_string_lossy()
                .ends_with(".backup_20240309_140507"));
            assert_eq!(entry.sha256.len(), 64);
            let conn = Connection::open(&entry.path).expect("open backup");
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM quotes", [], |row| row.get(0))
                .expect("count");
            assert_eq!(count, 2);
        }
    }

    #[test]
    fn colliding_backup_names_get_a_suffix() {
        let tmp = tempdir().expect("tempdir");
        let main = tmp.path().join("main.db");
        seed_db(&main);

        let first = create_source_backups(&[&main], &fixed_timestamp()).expect("first");
        let second = create_source_backups(&[&main], &fixed_timestamp()).expect("second");
        assert_ne!(first[0].path, second[0].path);
        assert!(second[0].path.to_string_lossy().ends_with("_01"));
    }

    #[test]
    fn required_space_has_headroom() {
        assert_eq!(required_free_bytes(0), 0);
        assert_eq!(required_free_bytes(1000), 1200);
    }
}

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, Transaction};
use sha2::{Digest, Sha256};

use crate::{AppError, AppResult};

pub mod backup;

const SIDECAR_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Open a source snapshot without any ability to write to it.
pub fn open_source(path: &Path) -> AppResult<Connection> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_source_db")
            .with_context("path", path.display().to_string())
    })
}

/// Open (creating if needed) the output database with foreign keys enforced.
pub fn open_output(path: &Path) -> AppResult<Connection> {
    let conn = Connection::open(path).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_output_db")
            .with_context("path", path.display().to_string())
    })?;
    conn.pragma_update(None, "foreign_keys", 1).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "enable_foreign_keys")
            .with_context("path", path.display().to_string())
    })?;
    Ok(conn)
}

pub fn close_connection(conn: Connection, path: &Path) -> AppResult<()> {
    conn.flush_prepared_statement_cache();
    conn.close().map_err(|(_, err)| {
        AppError::from(err)
            .with_context("operation", "close_db")
            .with_context("path", path.display().to_string())
    })
}

/// Run work inside a transaction. Commits on success, rolls back on error.
pub fn run_in_tx<R, F>(conn: &mut Connection, f: F) -> AppResult<R>
where
    F: FnOnce(&Transaction<'_>) -> AppResult<R>,
{
    let tx = conn
        .transaction()
        .map_err(|err| AppError::from(err).with_context("operation", "begin_tx"))?;
    tracing::debug!(target: "quote_merge", event = "db_tx_begin");
    match f(&tx) {
        Ok(value) => {
            tx.commit()
                .map_err(|err| AppError::from(err).with_context("operation", "commit_tx"))?;
            tracing::debug!(target: "quote_merge", event = "db_tx_commit");
            Ok(value)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback() {
                tracing::error!(target: "quote_merge", event = "db_tx_rollback_failed", error = %rb);
            } else {
                tracing::warn!(target: "quote_merge", event = "db_tx_rollback");
            }
            Err(err)
        }
    }
}

pub fn sidecar_path(base: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(base.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// Remove a database file together with its journal sidecars. Missing files
/// are not an error.
pub fn remove_with_sidecars(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    for suffix in SIDECAR_SUFFIXES {
        match fs::remove_file(sidecar_path(path, suffix)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Size of the main file plus any sidecars currently on disk.
pub fn size_with_sidecars(path: &Path) -> u64 {
    let main = fs::metadata(path).map(|meta| meta.len()).unwrap_or(0);
    let sidecars: u64 = SIDECAR_SUFFIXES
        .iter()
        .map(|suffix| {
            fs::metadata(sidecar_path(path, suffix))
                .map(|meta| meta.len())
                .unwrap_or(0)
        })
        .sum();
    main.saturating_add(sidecars)
}

pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

pub(crate) fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

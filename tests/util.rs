#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use rusqlite::{params, Connection};

pub const TRACKER_SCHEMA: &str = "
    CREATE TABLE quotes (
        id                INTEGER PRIMARY KEY AUTOINCREMENT,
        customer          TEXT NOT NULL,
        quote_no          TEXT NOT NULL UNIQUE,
        description       TEXT,
        sales_rep         TEXT,
        hidden            BOOLEAN DEFAULT 0,
        created_at        DATETIME DEFAULT CURRENT_TIMESTAMP,
        updated_at        DATETIME DEFAULT CURRENT_TIMESTAMP
    );
    CREATE TABLE tasks (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        quote_id     INTEGER NOT NULL,
        label        TEXT NOT NULL,
        done         BOOLEAN DEFAULT 0,
        FOREIGN KEY(quote_id) REFERENCES quotes(id) ON DELETE CASCADE
    );
    CREATE TABLE vendor_quotes (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        quote_id   INTEGER NOT NULL,
        type       TEXT CHECK(type IN ('freight','install','forward')) NOT NULL,
        vendor     TEXT NOT NULL,
        status     TEXT DEFAULT 'draft',
        FOREIGN KEY(quote_id) REFERENCES quotes(id) ON DELETE CASCADE
    );
    CREATE TABLE notes (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        quote_id   INTEGER NOT NULL,
        content    TEXT NOT NULL,
        created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(quote_id) REFERENCES quotes(id) ON DELETE CASCADE
    );
    CREATE TABLE events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        quote_id    INTEGER NOT NULL,
        description TEXT NOT NULL,
        created_at  DATETIME DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(quote_id) REFERENCES quotes(id) ON DELETE CASCADE
    );
    CREATE TABLE default_tasks (
        id         INTEGER PRIMARY KEY AUTOINCREMENT,
        label      TEXT NOT NULL,
        sort_order INTEGER DEFAULT 0
    );
    CREATE INDEX idx_tasks_quote_id ON tasks(quote_id);
    CREATE INDEX idx_notes_quote_id ON notes(quote_id);
    CREATE TRIGGER quotes_touch AFTER UPDATE ON quotes BEGIN
        UPDATE quotes SET updated_at = CURRENT_TIMESTAMP WHERE id = NEW.id;
    END;
";

/// Create a quote tracker database at `path` and return a writable handle.
/// Foreign keys stay off so tests can plant orphans.
pub fn create_tracker(path: &Path) -> Connection {
    let conn = Connection::open(path).expect("open tracker db");
    conn.execute_batch(TRACKER_SCHEMA).expect("create tracker schema");
    conn
}

pub fn insert_quote(conn: &Connection, id: i64, quote_no: &str, customer: &str, updated_at: &str) {
    conn.execute(
        "INSERT INTO quotes (id, customer, quote_no, created_at, updated_at)
         VALUES (?1, ?2, ?3, '2024-01-01 00:00:00', ?4)",
        params![id, customer, quote_no, updated_at],
    )
    .expect("insert quote");
}

pub fn insert_quote_without_update(conn: &Connection, id: i64, quote_no: &str, customer: &str, created_at: &str) {
    conn.execute(
        "INSERT INTO quotes (id, customer, quote_no, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, NULL)",
        params![id, customer, quote_no, created_at],
    )
    .expect("insert quote");
}

pub fn insert_note(conn: &Connection, quote_id: i64, content: &str) {
    conn.execute(
        "INSERT INTO notes (quote_id, content) VALUES (?1, ?2)",
        params![quote_id, content],
    )
    .expect("insert note");
}

pub fn insert_task(conn: &Connection, quote_id: i64, label: &str) {
    conn.execute(
        "INSERT INTO tasks (quote_id, label) VALUES (?1, ?2)",
        params![quote_id, label],
    )
    .expect("insert task");
}

pub fn insert_vendor_quote(conn: &Connection, quote_id: i64, kind: &str, vendor: &str) {
    conn.execute(
        "INSERT INTO vendor_quotes (quote_id, type, vendor) VALUES (?1, ?2, ?3)",
        params![quote_id, kind, vendor],
    )
    .expect("insert vendor quote");
}

pub fn insert_default_task(conn: &Connection, id: i64, label: &str) {
    conn.execute(
        "INSERT INTO default_tasks (id, label, sort_order) VALUES (?1, ?2, ?1)",
        params![id, label],
    )
    .expect("insert default task");
}

pub fn count(conn: &Connection, table: &str) -> i64 {
    conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .expect("count rows")
}

/// `(quote_no, content)` for every note, ordered by quote number then content.
pub fn notes_by_quote(conn: &Connection) -> Vec<(String, String)> {
    let mut stmt = conn
        .prepare(
            "SELECT q.quote_no, n.content FROM notes n JOIN quotes q ON q.id = n.quote_id
             ORDER BY q.quote_no, n.content",
        )
        .expect("prepare notes join");
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("query notes join")
        .collect::<Result<_, _>>()
        .expect("collect notes join")
}

pub fn quote_customer(conn: &Connection, quote_no: &str) -> String {
    conn.query_row(
        "SELECT customer FROM quotes WHERE quote_no = ?1",
        [quote_no],
        |row| row.get(0),
    )
    .expect("quote customer")
}

pub fn quote_numbers(conn: &Connection) -> Vec<String> {
    let mut stmt = conn
        .prepare("SELECT quote_no FROM quotes ORDER BY quote_no")
        .expect("prepare quote numbers");
    stmt.query_map([], |row| row.get(0))
        .expect("query quote numbers")
        .collect::<Result<_, _>>()
        .expect("collect quote numbers")
}

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PRIMARY_TABLE: &str = "quotes";
pub const DEFAULT_BUSINESS_KEY: &str = "quote_no";
pub const DEFAULT_UPDATED_COLUMN: &str = "updated_at";
pub const DEFAULT_CREATED_COLUMN: &str = "created_at";
pub const DEFAULT_FOREIGN_KEY: &str = "quote_id";
pub const DEFAULT_DEPENDENT_TABLES: &[&str] = &["tasks", "vendor_quotes", "notes", "events"];
pub const DEFAULT_REFERENCE_TABLES: &[&str] = &["default_tasks"];

/// Everything one merge run needs. The engine reads nothing else.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeConfig {
    /// Reference database; wins timestamp ties and supplies the schema.
    pub main: PathBuf,
    pub copy: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub tables: MergeTables,
}

impl MergeConfig {
    pub fn new(
        main: impl Into<PathBuf>,
        copy: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
    ) -> Self {
        Self {
            main: main.into(),
            copy: copy.into(),
            output: output.into(),
            tables: MergeTables::default(),
        }
    }

    pub fn with_tables(mut self, tables: MergeTables) -> Self {
        self.tables = tables;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeTables {
    pub primary: PrimaryTableSpec,
    pub dependents: Vec<DependentTableSpec>,
    pub reference_tables: Vec<String>,
}

impl Default for MergeTables {
    fn default() -> Self {
        Self {
            primary: PrimaryTableSpec::default(),
            dependents: DEFAULT_DEPENDENT_TABLES
                .iter()
                .map(|table| DependentTableSpec::new(*table, DEFAULT_FOREIGN_KEY))
                .collect(),
            reference_tables: DEFAULT_REFERENCE_TABLES
                .iter()
                .map(|table| table.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryTableSpec {
    pub table: String,
    pub business_key: String,
    pub updated_column: String,
    pub created_column: String,
}

impl Default for PrimaryTableSpec {
    fn default() -> Self {
        Self {
            table: DEFAULT_PRIMARY_TABLE.to_string(),
            business_key: DEFAULT_BUSINESS_KEY.to_string(),
            updated_column: DEFAULT_UPDATED_COLUMN.to_string(),
            created_column: DEFAULT_CREATED_COLUMN.to_string(),
        }
    }
}

/// A child table and the column holding its parent's synthetic id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependentTableSpec {
    pub table: String,
    pub foreign_key: String,
}

impl DependentTableSpec {
    pub fn new(table: impl Into<String>, foreign_key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            foreign_key: foreign_key.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableSpecError {
    #[error("table name is empty")]
    EmptyTable,
    #[error("foreign key column is empty for table {0}")]
    EmptyForeignKey(String),
    #[error("invalid identifier {0:?}: only letters, digits and underscores are allowed")]
    InvalidIdentifier(String),
}

/// Parses `TABLE` or `TABLE:FK_COLUMN`; the column defaults to `quote_id`.
impl FromStr for DependentTableSpec {
    type Err = TableSpecError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let (table, foreign_key) = match raw.split_once(':') {
            Some((table, fk)) => (table.trim(), fk.trim()),
            None => (raw.trim(), DEFAULT_FOREIGN_KEY),
        };
        let table = parse_identifier(table)?;
        if foreign_key.is_empty() {
            return Err(TableSpecError::EmptyForeignKey(table));
        }
        let foreign_key = parse_identifier(foreign_key)?;
        Ok(Self { table, foreign_key })
    }
}

pub fn parse_identifier(raw: &str) -> Result<String, TableSpecError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(TableSpecError::EmptyTable);
    }
    let valid = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(TableSpecError::InvalidIdentifier(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::analyze::DecisionSummary;
use super::validate::ValidationReport;
use crate::db::backup::BackupEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Success,
    CompletedWithViolations,
}

impl MergeStatus {
    /// Post-commit findings never fail a run; they only downgrade its status.
    pub fn from_validation(validation: &ValidationReport) -> Self {
        if validation.is_clean() {
            MergeStatus::Success
        } else {
            MergeStatus::CompletedWithViolations
        }
    }

    /// Process exit code for a completed run. Errors exit with 1.
    pub fn exit_code(self) -> i32 {
        match self {
            MergeStatus::Success => 0,
            MergeStatus::CompletedWithViolations => 2,
        }
    }
}

/// Per-table counters. `dangling` rows are neither merged nor deduplicated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMergeStats {
    pub merged: u64,
    pub deduplicated: u64,
    pub dangling: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableRole {
    Primary,
    Dependent,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableReport {
    pub table: String,
    pub role: TableRole,
    #[serde(flatten)]
    pub stats: TableMergeStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub main: PathBuf,
    pub copy: PathBuf,
    pub output: PathBuf,
    pub backups: Vec<BackupEntry>,
    pub decisions: DecisionSummary,
    pub tables: Vec<TableReport>,
    /// Configured tables absent from the reference database.
    pub skipped_tables: Vec<String>,
    pub final_primary_count: u64,
    pub validation: ValidationReport,
    pub output_size_bytes: u64,
    pub status: MergeStatus,
}

impl MergeReport {
    pub fn output_size_kb(&self) -> f64 {
        self.output_size_bytes as f64 / 1024.0
    }

    pub fn table(&self, name: &str) -> Option<&TableReport> {
        self.tables.iter().find(|report| report.table == name)
    }

    pub fn totals(&self) -> TableMergeStats {
        self.tables
            .iter()
            .filter(|report| report.role != TableRole::Reference)
            .fold(TableMergeStats::default(), |mut acc, report| {
                acc.merged += report.stats.merged;
                acc.deduplicated += report.stats.deduplicated;
                acc.dangling += report.stats.dangling;
                acc
            })
    }
}

pub fn log_report(report: &MergeReport) {
    for table in &report.tables {
        tracing::info!(
            target: "quote_merge",
            event = "table_summary",
            run_id = %report.run_id,
            table = %table.table,
            role = ?table.role,
            merged = table.stats.merged,
            deduplicated = table.stats.deduplicated,
            dangling = table.stats.dangling,
        );
    }
    let size_kb = format!("{:.1}", report.output_size_kb());
    match report.status {
        MergeStatus::Success => tracing::info!(
            target: "quote_merge",
            event = "merge_completed",
            run_id = %report.run_id,
            primary_rows = report.final_primary_count,
            violations = report.validation.violation_count(),
            output_size_kb = %size_kb,
        ),
        MergeStatus::CompletedWithViolations => tracing::warn!(
            target: "quote_merge",
            event = "merge_completed",
            run_id = %report.run_id,
            status = "completed_with_violations",
            primary_rows = report.final_primary_count,
            violations = report.validation.violation_count(),
            output_size_kb = %size_kb,
        ),
    }
}

/// Human-readable summary for the console.
pub fn render_text(report: &MergeReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Merge {}\n", report.run_id));
    out.push_str(&format!("  main:   {}\n", report.main.display()));
    out.push_str(&format!("  copy:   {}\n", report.copy.display()));
    out.push_str(&format!("  output: {}\n", report.output.display()));
    for backup in &report.backups {
        out.push_str(&format!("  backup: {}\n", backup.path.display()));
    }
    out.push_str(&format!(
        "Business keys: {} unique to main, {} unique to copy, {} overlapping\n",
        report.decisions.unique_to_main, report.decisions.unique_to_copy, report.decisions.overlapping
    ));
    for table in &report.tables {
        out.push_str(&format!(
            "  {:<20} merged {:>6}  deduplicated {:>6}  dangling {:>6}\n",
            table.table, table.stats.merged, table.stats.deduplicated, table.stats.dangling
        ));
    }
    for table in &report.skipped_tables {
        out.push_str(&format!("  {table:<20} skipped (not in main)\n"));
    }
    out.push_str(&format!("Primary rows: {}\n", report.final_primary_count));
    out.push_str(&format!(
        "Integrity violations: {}\n",
        report.validation.violation_count()
    ));
    out.push_str(&format!("Output size: {:.1} KB\n", report.output_size_kb()));
    out.push_str(match report.status {
        MergeStatus::Success => "Status: success\n",
        MergeStatus::CompletedWithViolations => "Status: completed with violations\n",
    });
    out
}

/// Write the report as pretty JSON, creating parent directories as needed.
pub fn write_report_file(path: &Path, report: &MergeReport) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("create report directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("serialize merge report")?;
    fs::write(path, json).with_context(|| format!("write merge report {}", path.display()))?;
    Ok(())
}

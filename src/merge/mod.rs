//! Two-snapshot merge of the quote tracker database.
//!
//! A run reads `main` and `copy` read-only, backs both up, decides a winner
//! per business key, and writes a fresh `output` database in one
//! transaction. Child rows follow their parent's decision through the
//! [`IdRemap`](remap::IdRemap).

use std::fs;
use std::path::PathBuf;

use chrono::{Local, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::config::MergeConfig;
use crate::db::{self, backup};
use crate::{AppError, AppResult};

pub mod analyze;
pub mod dependents;
pub mod preflight;
pub mod primary;
pub mod remap;
pub mod report;
mod rows;
pub mod schema;
pub mod source;
pub mod validate;

use analyze::{analyze_conflicts, Decision, DecisionSet, DecisionSummary};
use report::{MergeReport, MergeStatus, TableReport, TableRole};
use schema::{clone_schema, reflect_merge_tables, ReflectedTables};
use source::{Origin, Sources};

/// Result of a dry run: the decisions a merge would apply.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePlan {
    pub main: PathBuf,
    pub copy: PathBuf,
    pub summary: DecisionSummary,
    pub decisions: DecisionSet,
    pub skipped_tables: Vec<String>,
}

impl MergePlan {
    pub fn conflicts(&self) -> impl Iterator<Item = &Decision> {
        self.decisions.conflicts()
    }
}

fn prepare_sources(config: &MergeConfig) -> AppResult<(Sources, ReflectedTables)> {
    preflight::check_source(&config.main, Origin::Main)?;
    preflight::check_source(&config.copy, Origin::Copy)?;

    let sources = Sources::open(&config.main, &config.copy)?;
    let reflected = reflect_merge_tables(sources.get(Origin::Main), &config.tables)
        .map_err(|err| err.with_context("phase", "reflect"))?;
    for table in &reflected.missing {
        tracing::warn!(
            target: "quote_merge",
            event = "table_skipped",
            table = %table,
            reason = "not present in main",
        );
    }
    reflected.primary_identity()?;
    preflight::check_schema_compat(
        &reflected,
        sources.get(Origin::Main),
        sources.get(Origin::Copy),
    )
    .map_err(|err| err.with_context("phase", "schema_compat"))?;
    Ok((sources, reflected))
}

fn analyze(sources: &Sources, config: &MergeConfig, reflected: &ReflectedTables) -> AppResult<DecisionSet> {
    let identity = reflected.primary_identity()?.name.clone();
    let decisions = analyze_conflicts(sources, &config.tables.primary, &identity)
        .map_err(|err| err.with_context("phase", "analyze"))?;
    let summary = decisions.summary();
    tracing::info!(
        target: "quote_merge",
        event = "conflicts_analyzed",
        unique_to_main = summary.unique_to_main,
        unique_to_copy = summary.unique_to_copy,
        overlapping = summary.overlapping,
    );
    Ok(decisions)
}

/// Analyse both sources without writing anything, backups included.
pub fn plan_merge(config: &MergeConfig) -> AppResult<MergePlan> {
    let (sources, reflected) = prepare_sources(config)?;
    let decisions = analyze(&sources, config, &reflected)?;
    sources.close()?;
    Ok(MergePlan {
        main: config.main.clone(),
        copy: config.copy.clone(),
        summary: decisions.summary(),
        decisions,
        skipped_tables: reflected.missing,
    })
}

/// Merge `config.main` and `config.copy` into a freshly created `config.output`.
///
/// Integrity violations found after commit do not fail the run; they set
/// [`MergeStatus::CompletedWithViolations`] on the returned report. Any error
/// before commit rolls the output back and is returned as `MERGE/ABORTED`
/// with the underlying error as its cause.
pub fn run_merge(config: &MergeConfig) -> AppResult<MergeReport> {
    let run_id = Uuid::now_v7();
    let span = tracing::info_span!("merge_run", run_id = %run_id);
    let _guard = span.enter();
    let started_at = Utc::now();

    tracing::info!(
        target: "quote_merge",
        event = "merge_started",
        main = %config.main.display(),
        copy = %config.copy.display(),
        output = %config.output.display(),
    );

    let (sources, reflected) = prepare_sources(config)?;
    preflight::check_output(&config.output, &[&config.main, &config.copy])?;

    let backups = backup::create_source_backups(&[&config.main, &config.copy], &Local::now())
        .map_err(|err| err.with_context("phase", "backup"))?;

    let decisions = analyze(&sources, config, &reflected)?;

    if let Some(parent) = config.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "create_output_dir")
                .with_context("path", config.output.display().to_string())
        })?;
    }
    db::remove_with_sidecars(&config.output).map_err(|err| {
        AppError::new("MERGE/OUTPUT_OCCUPIED", "Existing output could not be removed")
            .with_context("path", config.output.display().to_string())
            .with_cause(err)
    })?;
    let mut output = db::open_output(&config.output)?;
    if let Err(err) = clone_schema(sources.get(Origin::Main), &mut output) {
        drop(output);
        let _ = db::remove_with_sidecars(&config.output);
        return Err(err.with_context("phase", "schema_clone"));
    }
    let output_tables = reflect_merge_tables(&output, &config.tables)
        .map_err(|err| err.with_context("phase", "reflect_output"))?;

    let tables = db::run_in_tx(&mut output, |tx| {
        let mut tables = Vec::new();
        for schema in &output_tables.references {
            let stats = dependents::copy_reference_table(tx, sources.get(Origin::Main), schema)
                .map_err(|err| err.with_context("phase", "reference"))?;
            tables.push(TableReport {
                table: schema.name.clone(),
                role: TableRole::Reference,
                stats,
            });
        }

        let (remap, primary_stats) = primary::merge_primary(
            tx,
            &sources,
            &output_tables.primary,
            &config.tables.primary,
            &decisions,
        )
        .map_err(|err| err.with_context("phase", "primary"))?;
        tables.push(TableReport {
            table: output_tables.primary.name.clone(),
            role: TableRole::Primary,
            stats: primary_stats,
        });

        for (spec, schema) in &output_tables.dependents {
            let stats = dependents::merge_dependent_table(tx, &sources, schema, &spec.foreign_key, &remap)
                .map_err(|err| err.with_context("phase", "dependents"))?;
            tables.push(TableReport {
                table: spec.table.clone(),
                role: TableRole::Dependent,
                stats,
            });
        }
        Ok(tables)
    });
    let tables = match tables {
        Ok(tables) => {
            tracing::info!(target: "quote_merge", event = "merge_committed", tables = tables.len());
            tables
        }
        Err(err) => {
            tracing::error!(
                target: "quote_merge",
                event = "merge_rolled_back",
                code = %err.code(),
                error = %err,
            );
            let _ = db::close_connection(output, &config.output);
            let _ = sources.close();
            return Err(
                AppError::new("MERGE/ABORTED", "Merge failed and the output was rolled back")
                    .with_context("path", config.output.display().to_string())
                    .with_cause(err),
            );
        }
    };

    let identity = output_tables.primary_identity()?.name.clone();
    let dependent_specs: Vec<_> = output_tables
        .dependents
        .iter()
        .map(|(spec, _)| spec.clone())
        .collect();
    let validation = validate::validate_output(
        &output,
        &output_tables.primary.name,
        &identity,
        &dependent_specs,
    )?;
    db::close_connection(output, &config.output)?;
    sources.close()?;

    let status = MergeStatus::from_validation(&validation);
    let report = MergeReport {
        run_id,
        started_at,
        completed_at: Utc::now(),
        main: config.main.clone(),
        copy: config.copy.clone(),
        output: config.output.clone(),
        backups,
        decisions: decisions.summary(),
        tables,
        skipped_tables: reflected.missing,
        final_primary_count: validation.primary_count,
        output_size_bytes: db::size_with_sidecars(&config.output),
        validation,
        status,
    };
    report::log_report(&report);
    Ok(report)
}

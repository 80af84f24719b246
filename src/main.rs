use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use quote_merge_lib::config::parse_identifier;
use quote_merge_lib::merge::report;
use quote_merge_lib::{
    logging, plan_merge, run_merge, DependentTableSpec, MergeConfig, MergePlan, MergeTables,
};

#[derive(Debug, Parser)]
#[command(
    name = "quote-merge",
    about = "Merge two copies of the quote tracker database",
    version
)]
struct Cli {
    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Back up both sources and write the merged database to --output.
    Merge(MergeArgs),
    /// Show which rows would win without writing anything.
    Plan(PlanArgs),
}

#[derive(Debug, Args)]
struct TableArgs {
    /// Dependent table, optionally with its foreign key column (TABLE[:FK]).
    /// Replaces the default list when given.
    #[arg(long = "dependent", value_name = "TABLE[:FK]")]
    dependents: Vec<DependentTableSpec>,

    /// Table copied verbatim from main. Replaces the default list when given.
    #[arg(long = "reference", value_name = "TABLE", value_parser = parse_identifier)]
    references: Vec<String>,
}

impl TableArgs {
    fn into_tables(self) -> MergeTables {
        let mut tables = MergeTables::default();
        if !self.dependents.is_empty() {
            tables.dependents = self.dependents;
        }
        if !self.references.is_empty() {
            tables.reference_tables = self.references;
        }
        tables
    }
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Reference database. Wins timestamp ties.
    #[arg(long, value_name = "PATH")]
    main: PathBuf,

    /// Second database to fold into main.
    #[arg(long, value_name = "PATH")]
    copy: PathBuf,

    /// Destination; replaced if it already exists.
    #[arg(long, value_name = "PATH")]
    output: PathBuf,

    #[command(flatten)]
    tables: TableArgs,

    /// Print the report as JSON instead of the text summary.
    #[arg(long)]
    json: bool,

    /// Also write the JSON report to this file.
    #[arg(long, value_name = "PATH")]
    report_file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct PlanArgs {
    #[arg(long, value_name = "PATH")]
    main: PathBuf,

    #[arg(long, value_name = "PATH")]
    copy: PathBuf,

    #[command(flatten)]
    tables: TableArgs,

    /// Print the full decision list as JSON.
    #[arg(long)]
    json: bool,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.log_json);

    match handle(cli.command) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn handle(command: Command) -> Result<i32> {
    match command {
        Command::Merge(args) => handle_merge(args),
        Command::Plan(args) => handle_plan(args),
    }
}

fn handle_merge(args: MergeArgs) -> Result<i32> {
    let config = MergeConfig::new(args.main, args.copy, args.output)
        .with_tables(args.tables.into_tables());
    let merge_report = run_merge(&config).context("merge failed")?;

    if let Some(path) = &args.report_file {
        report::write_report_file(path, &merge_report)?;
    }
    if args.json {
        let json = serde_json::to_string_pretty(&merge_report).context("serialize merge report")?;
        println!("{json}");
    } else {
        print!("{}", report::render_text(&merge_report));
    }

    Ok(merge_report.status.exit_code())
}

fn handle_plan(args: PlanArgs) -> Result<i32> {
    let config = MergeConfig::new(args.main, args.copy, PathBuf::new())
        .with_tables(args.tables.into_tables());
    let plan = plan_merge(&config).context("plan failed")?;

    if args.json {
        let json = serde_json::to_string_pretty(&plan).context("serialize merge plan")?;
        println!("{json}");
    } else {
        print_plan(&plan);
    }
    Ok(0)
}

fn print_plan(plan: &MergePlan) {
    println!("Merge plan");
    println!("  main: {}", plan.main.display());
    println!("  copy: {}", plan.copy.display());
    println!(
        "Business keys: {} unique to main, {} unique to copy, {} overlapping",
        plan.summary.unique_to_main, plan.summary.unique_to_copy, plan.summary.overlapping
    );
    if plan.summary.overlapping > 0 {
        println!("\n{:<20} {:<6} Effective timestamps", "Key", "Winner");
        for decision in plan.conflicts() {
            let loser = decision
                .loser_effective
                .as_ref()
                .map(|ts| ts.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "{:<20} {:<6} {} over {}",
                decision.business_key, decision.winner.origin, decision.winner_effective, loser
            );
        }
    }
    for table in &plan.skipped_tables {
        println!("  {table} skipped (not in main)");
    }
}

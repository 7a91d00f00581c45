//! Embedded command surface for the `cm` binary.
//!
//! Hosts can drive the pipeline through [`run_cli`] with a parsed [`Cli`], or
//! call `cohort_merge_pipeline` directly.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use cohort_merge_core::{
    DatasetStore, DirectoryObjectStore, ErrorKind, HarnessReport, PatientId, VerdictTier,
};
use cohort_merge_pipeline::{
    load_config, rollback_dataset, run_harness, run_pipeline, segregation_report, RunRequest,
    RunSummary,
};
use cohort_merge_store_sqlite::SqlitePatientStore;
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "cm")]
#[command(about = "Per-patient clinical record merge pipeline")]
pub struct Cli {
    #[arg(long, default_value = "./cohort_merge.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Segregate, merge, materialize and query every patient.
    Run(RunArgs),
    /// Report per-category partition statistics without merging.
    Segregate(SegregateArgs),
    Harness {
        #[command(subcommand)]
        command: HarnessCommand,
    },
    Tables {
        #[command(subcommand)]
        command: TablesCommand,
    },
    Datasets {
        #[command(subcommand)]
        command: DatasetsCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory standing in for remote object storage.
    #[arg(long)]
    publish_dir: Option<PathBuf>,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct SegregateArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum HarnessCommand {
    /// Run the query battery against every catalogued table.
    Run(HarnessRunArgs),
}

#[derive(Debug, Args)]
pub struct HarnessRunArgs {
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    report: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum TablesCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum DatasetsCommand {
    List(DatasetListArgs),
    /// Republish an earlier version and materialize it again.
    Rollback(DatasetRollbackArgs),
}

#[derive(Debug, Args)]
pub struct DatasetListArgs {
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    patient_id: String,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct DatasetRollbackArgs {
    #[arg(long)]
    output: PathBuf,
    #[arg(long)]
    patient_id: String,
    #[arg(long)]
    version: u32,
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Executes a parsed command line.
///
/// # Errors
/// Returns an error when the command fails, or when a harness verdict is
/// `needs_work`.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => run_command(&cli.db, args),
        Command::Segregate(args) => {
            let config = load_config(args.config.as_deref())?;
            let report = segregation_report(&args.input, &config)?;
            print_json(&report)
        }
        Command::Harness { command } => match command {
            HarnessCommand::Run(args) => harness_command(&cli.db, args),
        },
        Command::Tables { command } => match command {
            TablesCommand::List => {
                let store = open_store(&cli.db)?;
                print_json(&store.list_tables()?)
            }
        },
        Command::Datasets { command } => datasets_command(&cli.db, command),
    }
}

fn run_command(db: &Path, args: RunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let mut store = open_store(db)?;
    let uploads = args.publish_dir.as_ref().map(DirectoryObjectStore::new);

    let mut request = RunRequest::new(&args.input, &args.output);
    if let Some(uploads) = &uploads {
        request = request.with_object_store(uploads);
    }
    let summary = run_pipeline(&config, &request, &mut store)?;

    if let Some(path) = &args.report {
        write_json(path, &summary)?;
    }
    if args.json {
        print_json(&summary)
    } else {
        print_run_summary(&summary);
        Ok(())
    }
}

fn harness_command(db: &Path, args: HarnessRunArgs) -> Result<()> {
    let config = load_config(args.config.as_deref())?;
    let store = open_store(db)?;
    let report = run_harness(&config, &store)?;

    if let Some(path) = &args.report {
        write_json(path, &report)?;
    }
    if args.json {
        print_json(&report)?;
    } else {
        print_harness_report(&report);
    }

    if report.tier() == Some(VerdictTier::NeedsWork) {
        return Err(anyhow!(
            "harness verdict is needs_work ({} of {} queries failed)",
            report.verdict.as_ref().map_or(0, |verdict| verdict.failed),
            report.results.len()
        ));
    }
    Ok(())
}

fn datasets_command(db: &Path, command: DatasetsCommand) -> Result<()> {
    match command {
        DatasetsCommand::List(args) => {
            let config = load_config(args.config.as_deref())?;
            let patient_id = parse_patient_id(&args.patient_id)?;
            let datasets = DatasetStore::new(&args.output, config.retain_versions);
            print_json(&datasets.versions(&patient_id)?)
        }
        DatasetsCommand::Rollback(args) => {
            let config = load_config(args.config.as_deref())?;
            let patient_id = parse_patient_id(&args.patient_id)?;
            let datasets = DatasetStore::new(&args.output, config.retain_versions);
            let mut store = open_store(db)?;
            let entry = rollback_dataset(&datasets, &mut store, &patient_id, args.version)?;
            print_json(&entry)
        }
    }
}

fn open_store(db: &Path) -> Result<SqlitePatientStore> {
    let store = SqlitePatientStore::open(db)?;
    store.migrate()?;
    tracing::debug!(db = %db.display(), "opened table store");
    Ok(store)
}

fn parse_patient_id(raw: &str) -> Result<PatientId> {
    PatientId::parse(raw).with_context(|| format!("invalid --patient-id {raw:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let serialized = serde_json::to_string_pretty(value)?;
    std::fs::write(path, serialized)
        .with_context(|| format!("failed writing report to {}", path.display()))
}

fn print_run_summary(summary: &RunSummary) {
    println!(
        "contract={} run_id={} cancelled={}",
        summary.contract_version,
        summary.run_id,
        if summary.cancelled { "yes" } else { "no" }
    );
    println!(
        "patients discovered={} merged={} materialized={}",
        summary.patients_discovered, summary.patients_merged, summary.patients_materialized
    );
    let errors = ErrorKind::ALL
        .iter()
        .map(|kind| format!("{}={}", kind.as_str(), summary.error_count(*kind)))
        .collect::<Vec<_>>()
        .join(" ");
    println!("errors {errors}");
    for issue in &summary.issues {
        println!("  {:<22} {:<32} {}", issue.kind.as_str(), issue.scope, issue.detail);
    }
    print_harness_report(&summary.harness);
}

fn print_harness_report(report: &HarnessReport) {
    println!(
        "{:<24} {:<10} {:<10} {:<10}",
        "patient", "attempted", "succeeded", "failed"
    );
    println!("{}", "-".repeat(56));
    for patient in &report.per_patient {
        println!(
            "{:<24} {:<10} {:<10} {:<10}",
            patient.patient_id, patient.attempted, patient.succeeded, patient.failed
        );
    }
    match &report.verdict {
        Some(verdict) => println!(
            "tier={} success_rate={:.3} mean_ms={:.3} p50_ms={:.3} p95_ms={:.3} p99_ms={:.3}",
            verdict.tier.as_str(),
            verdict.success_rate,
            verdict.mean_latency_ms,
            verdict.p50_latency_ms,
            verdict.p95_latency_ms,
            verdict.p99_latency_ms
        ),
        None => println!("tier=none (run cancelled before aggregation)"),
    }
}

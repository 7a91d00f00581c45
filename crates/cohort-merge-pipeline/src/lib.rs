//! Run orchestration: segregate, then per patient normalize, merge, publish
//! and upload on a worker pool, then materialize and query one patient at a
//! time against the shared store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use cohort_merge_core::{
    build_report, decode_merged_csv, discover_sources, encode_merged_csv, format_rfc3339,
    merge_patient, normalize, now_utc, partial_report, read_category, segregate, upload_key,
    ClinicalError, DatasetManifest, DatasetStore, DatasetVersion, ErrorKind, HarnessReport,
    HarnessTarget, MergedPatientDataset, ObjectStore, PatientId, PipelineConfig, QueryHarness,
    QueryResult, RawSourceFile, Segregation,
};
use cohort_merge_store_sqlite::{CatalogEntry, SqlitePatientStore};
use rayon::prelude::*;
use ulid::Ulid;

mod summary;

pub use summary::{
    PipelineIssue, RunSummary, SegregationReport, RUN_SUMMARY_CONTRACT,
    SEGREGATION_REPORT_CONTRACT,
};

use summary::IssueLog;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The destination store cannot take writes at all; distinct from the
    /// per-patient failures tallied in a [`RunSummary`].
    #[error("relational sink unavailable: {0}")]
    SinkUnavailable(String),
    #[error(transparent)]
    Clinical(#[from] ClinicalError),
    #[error("failed to start worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Shared stop flag. A cancelled run finishes the patient in flight and
/// stops before the next one.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress callbacks for the sequential materialize-and-query stage.
pub trait RunObserver: Sync {
    fn patient_finished(&self, _patient_id: &PatientId, _results: &[QueryResult]) {}
}

struct NoopObserver;

impl RunObserver for NoopObserver {}

pub struct RunRequest<'a> {
    input_dir: &'a Path,
    output_dir: &'a Path,
    object_store: Option<&'a dyn ObjectStore>,
    cancellation: CancellationFlag,
    observer: &'a dyn RunObserver,
}

impl<'a> RunRequest<'a> {
    #[must_use]
    pub fn new(input_dir: &'a Path, output_dir: &'a Path) -> Self {
        Self {
            input_dir,
            output_dir,
            object_store: None,
            cancellation: CancellationFlag::default(),
            observer: &NoopObserver,
        }
    }

    #[must_use]
    pub fn with_object_store(mut self, object_store: &'a dyn ObjectStore) -> Self {
        self.object_store = Some(object_store);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationFlag) -> Self {
        self.cancellation = cancellation;
        self
    }

    #[must_use]
    pub fn with_observer(mut self, observer: &'a dyn RunObserver) -> Self {
        self.observer = observer;
        self
    }
}

/// Runs the full pipeline over every category file under the input directory.
///
/// Per-file and per-patient failures are contained and tallied in the
/// summary.
///
/// # Errors
/// [`PipelineError::SinkUnavailable`] when the store fails its liveness check,
/// either up front or after every attempted materialization failed; [`PipelineError::Clinical`] for
/// an invalid configuration or an unreadable input directory.
pub fn run_pipeline(
    config: &PipelineConfig,
    request: &RunRequest<'_>,
    store: &mut SqlitePatientStore,
) -> Result<RunSummary, PipelineError> {
    config.validate()?;
    let harness = QueryHarness::new(config.query_battery(), config.query_timeout())?;
    store
        .ping()
        .map_err(|err| PipelineError::SinkUnavailable(format!("{err:#}")))?;

    let run_id = Ulid::new().to_string();
    let started_at = format_rfc3339(now_utc())?;
    tracing::info!(
        run_id = %run_id,
        input = %request.input_dir.display(),
        output = %request.output_dir.display(),
        "pipeline run started"
    );

    let mut log = IssueLog::default();
    let segregation = load_inputs(request.input_dir, config, &mut log)?;
    let patients_discovered = segregation.patients.len();
    let Segregation {
        patients,
        partitions,
        ..
    } = segregation;

    let datasets = DatasetStore::new(request.output_dir, config.retain_versions);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.workers)
        .build()?;
    let object_store = request.object_store;
    let cancellation = &request.cancellation;
    let work: Vec<(PatientId, BTreeMap<String, RawSourceFile>)> = patients.into_iter().collect();
    let prepared: Vec<PreparedPatient> = pool.install(|| {
        work.into_par_iter()
            .map(|(patient_id, files)| {
                prepare_patient(patient_id, &files, config, &datasets, object_store, cancellation)
            })
            .collect()
    });

    let mut patients_merged = 0;
    let mut ready = Vec::new();
    for patient in prepared {
        log.extend(patient.log);
        if let Some(dataset) = patient.dataset {
            patients_merged += 1;
            ready.push((dataset, patient.version));
        }
    }

    let mut results = Vec::new();
    let mut tables = Vec::new();
    let mut attempted = 0_usize;
    let mut cancelled = request.cancellation.is_cancelled();

    for (dataset, version) in &ready {
        if request.cancellation.is_cancelled() {
            cancelled = true;
            tracing::warn!(run_id = %run_id, "run cancelled; remaining patients skipped");
            break;
        }
        let _span = tracing::info_span!("patient", patient_id = %dataset.patient_id).entered();

        attempted += 1;
        let entry = match store.materialize(dataset, version.as_ref()) {
            Ok(entry) => entry,
            Err(err) => {
                let err = match err.downcast::<ClinicalError>() {
                    Ok(err @ ClinicalError::Materialization { .. }) => err,
                    Ok(err) => materialization_error(&dataset.patient_id, err.to_string()),
                    Err(err) => materialization_error(&dataset.patient_id, format!("{err:#}")),
                };
                tracing::error!(error = %err, "materialization failed; table left unchanged");
                log.record_error(patient_scope(&dataset.patient_id), &err);
                continue;
            }
        };

        let target = HarnessTarget {
            patient_id: entry.patient_id.clone(),
            table_name: entry.table_name.clone(),
        };
        let patient_results = harness.run_patient(&mut store.sink(), &target);
        record_query_failures(&mut log, &patient_results);
        request
            .observer
            .patient_finished(&dataset.patient_id, &patient_results);
        results.extend(patient_results);
        tables.push(entry);
    }

    if attempted > 0 && tables.is_empty() {
        // Bad datasets are already tallied; only an unreachable store aborts.
        if let Err(err) = store.ping() {
            return Err(PipelineError::SinkUnavailable(format!(
                "all {attempted} attempted materializations failed: {err:#}"
            )));
        }
        tracing::warn!(run_id = %run_id, attempted, "every materialization failed; store is reachable");
    }

    let harness_report = if cancelled {
        partial_report(results)?
    } else {
        build_report(results, &config.verdict)?
    };
    let (error_counts, issues) = log.into_parts();

    let summary = RunSummary {
        contract_version: RUN_SUMMARY_CONTRACT.to_string(),
        run_id,
        started_at,
        finished_at: format_rfc3339(now_utc())?,
        cancelled,
        patients_discovered,
        patients_merged,
        patients_materialized: tables.len(),
        partition: partitions,
        error_counts,
        issues,
        tables,
        harness: harness_report,
    };

    tracing::info!(
        run_id = %summary.run_id,
        patients = summary.patients_discovered,
        materialized = summary.patients_materialized,
        cancelled = summary.cancelled,
        tier = summary.harness.tier().map_or("none", |tier| tier.as_str()),
        "pipeline run finished"
    );
    Ok(summary)
}

/// Reads and partitions the input directory without merging anything.
///
/// # Errors
/// Returns [`PipelineError::Clinical`] for an invalid configuration or an
/// unreadable input directory.
pub fn segregation_report(
    input_dir: &Path,
    config: &PipelineConfig,
) -> Result<SegregationReport, PipelineError> {
    config.validate()?;
    let mut log = IssueLog::default();
    let segregation = load_inputs(input_dir, config, &mut log)?;
    let (_, issues) = log.into_parts();
    Ok(SegregationReport {
        contract_version: SEGREGATION_REPORT_CONTRACT.to_string(),
        patients: segregation.patients.len(),
        dropped_rows: segregation.dropped_rows(),
        partition: segregation.partitions,
        issues,
    })
}

/// Runs the query battery against every catalogued patient table.
///
/// # Errors
/// Returns an error when the configuration is invalid or the catalog cannot
/// be read. Individual query failures are part of the report.
pub fn run_harness(
    config: &PipelineConfig,
    store: &SqlitePatientStore,
) -> anyhow::Result<HarnessReport> {
    config.validate()?;
    let harness = QueryHarness::new(config.query_battery(), config.query_timeout())?;
    let targets: Vec<HarnessTarget> = store
        .list_tables()?
        .into_iter()
        .map(|entry| HarnessTarget {
            patient_id: entry.patient_id,
            table_name: entry.table_name,
        })
        .collect();
    tracing::info!(tables = targets.len(), "running query harness");
    let results = harness.run(&mut store.sink(), &targets);
    Ok(build_report(results, &config.verdict)?)
}

/// Republishes a stored dataset version and materializes it again.
///
/// # Errors
/// Returns an error when the version is missing, cannot be decoded, or the
/// store rejects it; the previous table is kept on failure.
pub fn rollback_dataset(
    datasets: &DatasetStore,
    store: &mut SqlitePatientStore,
    patient_id: &PatientId,
    version: u32,
) -> anyhow::Result<CatalogEntry> {
    let bytes = datasets
        .read_version(patient_id, version)
        .with_context(|| format!("dataset version {version} for patient {patient_id}"))?;
    let manifest = datasets
        .read_manifest(patient_id, version)
        .with_context(|| format!("dataset manifest {version} for patient {patient_id}"))?;
    let dataset = decode_merged_csv(patient_id, &bytes, &manifest)?;
    let republished = datasets.rollback(patient_id, version)?;
    store
        .materialize(&dataset, Some(&republished))
        .with_context(|| format!("failed to materialize version {version} for {patient_id}"))
}

struct PreparedPatient {
    dataset: Option<MergedPatientDataset>,
    version: Option<DatasetVersion>,
    log: IssueLog,
}

fn load_inputs(
    input_dir: &Path,
    config: &PipelineConfig,
    log: &mut IssueLog,
) -> Result<Segregation, PipelineError> {
    let sources = discover_sources(input_dir)?;
    tracing::info!(categories = sources.len(), "discovered category sources");

    let mut raw_files = Vec::with_capacity(sources.len());
    for source in &sources {
        match read_category(source) {
            Ok(file) => raw_files.push(file),
            Err(err) => {
                tracing::warn!(category = %source.category, error = %err, "skipping unreadable category");
                log.record_error(category_scope(&source.category), &err);
            }
        }
    }

    let segregation = segregate(raw_files, |category| config.source_key_for(category));
    for rejected in &segregation.rejected {
        log.record_error(category_scope(&rejected.category), &rejected.error);
    }
    for (category, partition) in &segregation.partitions {
        if partition.dropped_rows > 0 {
            log.add(ErrorKind::Partition, partition.dropped_rows);
            log.note(
                ErrorKind::Partition,
                category_scope(category),
                format!(
                    "{} of {} rows dropped for lack of a usable patient identifier",
                    partition.dropped_rows, partition.total_rows
                ),
            );
        }
    }
    tracing::info!(
        patients = segregation.patients.len(),
        dropped_rows = segregation.dropped_rows(),
        "segregated input rows"
    );
    Ok(segregation)
}

fn prepare_patient(
    patient_id: PatientId,
    files: &BTreeMap<String, RawSourceFile>,
    config: &PipelineConfig,
    datasets: &DatasetStore,
    object_store: Option<&dyn ObjectStore>,
    cancellation: &CancellationFlag,
) -> PreparedPatient {
    let mut log = IssueLog::default();
    let skipped = |log| PreparedPatient {
        dataset: None,
        version: None,
        log,
    };
    if cancellation.is_cancelled() {
        return skipped(log);
    }
    let _span = tracing::info_span!("patient", patient_id = %patient_id).entered();

    let mut normalized = Vec::with_capacity(files.len());
    for (category, raw) in files {
        match normalize(raw, &config.key_columns_for(category)) {
            Ok(file) => normalized.push(file),
            Err(err) => {
                tracing::warn!(category = %category, error = %err, "skipping category file");
                log.record_error(format!("{}/{category}", patient_scope(&patient_id)), &err);
            }
        }
    }

    let dataset = match merge_patient(&patient_id, normalized, &config.merge_keys()) {
        Ok(dataset) => dataset,
        Err(err) => {
            tracing::warn!(error = %err, "patient skipped");
            log.record_error(patient_scope(&patient_id), &err);
            return skipped(log);
        }
    };

    let published = encode_merged_csv(&dataset).and_then(|bytes| {
        let version = datasets.publish(&patient_id, &bytes, &DatasetManifest::of(&dataset))?;
        Ok((bytes, version))
    });
    let (bytes, version) = match published {
        Ok(value) => value,
        Err(err) => {
            let err =
                materialization_error(&patient_id, format!("failed to publish merged dataset: {err}"));
            tracing::error!(error = %err, "patient skipped");
            log.record_error(patient_scope(&patient_id), &err);
            return skipped(log);
        }
    };
    tracing::debug!(
        version = version.version,
        reused = version.reused,
        rows = dataset.row_count(),
        "published merged dataset"
    );

    if let Some(object_store) = object_store {
        let key = upload_key(&patient_id);
        match object_store.put(&key, &bytes) {
            Ok(url) => tracing::debug!(url = %url, "uploaded merged dataset"),
            Err(err) => {
                tracing::warn!(error = %err, "upload failed; local artifact kept");
                log.record_error(patient_scope(&patient_id), &err);
            }
        }
    }

    PreparedPatient {
        dataset: Some(dataset),
        version: Some(version),
        log,
    }
}

fn record_query_failures(log: &mut IssueLog, results: &[QueryResult]) {
    for result in results {
        if let Some(err) = result.error() {
            log.record_error(
                format!("{}/{}", patient_scope(&result.patient_id), result.query_name),
                &err,
            );
        }
    }
}

fn materialization_error(patient_id: &PatientId, detail: String) -> ClinicalError {
    ClinicalError::Materialization {
        patient_id: patient_id.to_string(),
        detail,
    }
}

fn patient_scope(patient_id: &PatientId) -> String {
    format!("patient:{patient_id}")
}

fn category_scope(category: &str) -> String {
    format!("category:{category}")
}

/// Loads a config file or the defaults, wrapping failures for CLI use.
///
/// # Errors
/// Returns an error when the file is unreadable or invalid.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    PipelineConfig::load(path).context("failed to load pipeline config")
}

use std::collections::BTreeMap;

use cohort_merge_core::{CategoryPartition, ClinicalError, ErrorKind, HarnessReport};
use cohort_merge_store_sqlite::CatalogEntry;
use serde::{Deserialize, Serialize};

pub const RUN_SUMMARY_CONTRACT: &str = "pipeline_run.v1";
pub const SEGREGATION_REPORT_CONTRACT: &str = "segregation_report.v1";

/// A contained per-file or per-patient failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineIssue {
    pub kind: ErrorKind,
    /// `category:{name}`, `patient:{id}` or `patient:{id}/{category}`.
    pub scope: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub contract_version: String,
    pub run_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub cancelled: bool,
    pub patients_discovered: usize,
    pub patients_merged: usize,
    pub patients_materialized: usize,
    pub partition: BTreeMap<String, CategoryPartition>,
    pub error_counts: BTreeMap<ErrorKind, usize>,
    pub issues: Vec<PipelineIssue>,
    pub tables: Vec<CatalogEntry>,
    pub harness: HarnessReport,
}

impl RunSummary {
    #[must_use]
    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.error_counts.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegregationReport {
    pub contract_version: String,
    pub patients: usize,
    pub dropped_rows: usize,
    pub partition: BTreeMap<String, CategoryPartition>,
    pub issues: Vec<PipelineIssue>,
}

/// Error tally kept while a run progresses. Every kind starts at zero so
/// reports always carry the full taxonomy.
#[derive(Debug, Clone)]
pub(crate) struct IssueLog {
    counts: BTreeMap<ErrorKind, usize>,
    issues: Vec<PipelineIssue>,
}

impl Default for IssueLog {
    fn default() -> Self {
        Self {
            counts: ErrorKind::ALL.into_iter().map(|kind| (kind, 0)).collect(),
            issues: Vec::new(),
        }
    }
}

impl IssueLog {
    pub(crate) fn record(&mut self, kind: ErrorKind, scope: impl Into<String>, detail: impl Into<String>) {
        *self.counts.entry(kind).or_default() += 1;
        self.issues.push(PipelineIssue {
            kind,
            scope: scope.into(),
            detail: detail.into(),
        });
    }

    pub(crate) fn record_error(&mut self, scope: impl Into<String>, err: &ClinicalError) {
        let kind = err.kind().unwrap_or(ErrorKind::Schema);
        self.record(kind, scope, err.to_string());
    }

    /// Adds to a counter without a matching issue line.
    pub(crate) fn add(&mut self, kind: ErrorKind, count: usize) {
        *self.counts.entry(kind).or_default() += count;
    }

    /// Adds an issue line without touching the counters.
    pub(crate) fn note(&mut self, kind: ErrorKind, scope: impl Into<String>, detail: impl Into<String>) {
        self.issues.push(PipelineIssue {
            kind,
            scope: scope.into(),
            detail: detail.into(),
        });
    }

    pub(crate) fn extend(&mut self, other: Self) {
        for (kind, count) in other.counts {
            self.add(kind, count);
        }
        self.issues.extend(other.issues);
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<ErrorKind, usize>, Vec<PipelineIssue>) {
        (self.counts, self.issues)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_log_starts_with_every_kind_at_zero() {
        let (counts, issues) = IssueLog::default().into_parts();
        assert_eq!(counts.len(), ErrorKind::ALL.len());
        assert!(counts.values().all(|count| *count == 0));
        assert!(issues.is_empty());
    }

    #[test]
    fn dropped_rows_are_counted_per_row_and_noted_once() {
        let mut log = IssueLog::default();
        log.add(ErrorKind::Partition, 3);
        log.note(ErrorKind::Partition, "category:labs", "3 rows dropped");
        let mut merged = IssueLog::default();
        merged.record(ErrorKind::Schema, "category:devices", "missing key");
        merged.extend(log);
        let (counts, issues) = merged.into_parts();
        assert_eq!(counts[&ErrorKind::Partition], 3);
        assert_eq!(counts[&ErrorKind::Schema], 1);
        assert_eq!(issues.len(), 2);
    }

    #[test]
    fn error_counts_serialize_with_taxonomy_names() {
        let mut log = IssueLog::default();
        log.record(ErrorKind::Merge, "patient:p1", "no categories");
        let (counts, _) = log.into_parts();
        let rendered = match serde_json::to_value(&counts) {
            Ok(value) => value,
            Err(err) => panic!("serialize: {err}"),
        };
        assert_eq!(rendered["merge_error"], 1);
        assert_eq!(rendered["upload_error"], 0);
    }
}

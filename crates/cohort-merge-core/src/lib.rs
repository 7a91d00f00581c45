//! Domain model and per-patient stages for merging clinical category exports
//! into one table per patient: segregation, normalization, merging, the
//! merged-artifact store, the relational-sink contract, the query harness and
//! the performance verdict.

use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

pub mod artifact;
pub mod config;
mod error;
pub mod harness;
pub mod infer;
pub mod merge;
mod model;
pub mod normalize;
pub mod segregate;
pub mod sink;
pub mod verdict;

pub use artifact::{
    decode_merged_csv, encode_merged_csv, upload_key, DatasetManifest, DatasetStore,
    DatasetVersion, DirectoryObjectStore, ObjectStore, MERGED_FILE_NAME,
};
pub use config::PipelineConfig;
pub use error::{ClinicalError, ErrorKind};
pub use harness::{
    default_battery, HarnessTarget, NamedQuery, QueryHarness, QueryOutcome, QueryResult,
};
pub use merge::{merge_patient, MergeKeys};
pub use model::{
    Cell, ColumnSpec, ColumnType, MergeConflict, MergedPatientDataset, NormalizedSourceFile,
    PatientId, RawSourceFile, RowAlignment, TableName,
};
pub use normalize::{normalize, KeyColumns};
pub use segregate::{
    discover_sources, read_category, segregate, CategoryPartition, CategorySource, Segregation,
};
pub use sink::{load_dataset, quote_identifier, LoadedTable, RelationalSink};
pub use verdict::{
    aggregate, build_report, partial_report, HarnessReport, PerformanceVerdict, VerdictThresholds,
    VerdictTier,
};

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// # Errors
/// Returns [`ClinicalError::Timestamp`] when the value cannot be rendered.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, ClinicalError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| ClinicalError::Timestamp(format!("failed to format RFC3339 timestamp: {err}")))
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

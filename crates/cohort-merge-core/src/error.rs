use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ClinicalError {
    #[error("schema error in category {category}: {detail}")]
    Schema { category: String, detail: String },
    #[error("partition error: {0}")]
    Partition(String),
    #[error("merge error for patient {patient_id}: {detail}")]
    Merge { patient_id: String, detail: String },
    #[error("materialization error for patient {patient_id}: {detail}")]
    Materialization { patient_id: String, detail: String },
    #[error("query error: {0}")]
    Query(String),
    #[error("upload error for {key}: {detail}")]
    Upload { key: String, detail: String },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
    #[error("io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl ClinicalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }

    /// Classifies the error into the run-summary taxonomy.
    ///
    /// Unreadable source files count as schema errors since they are skipped
    /// the same way. Configuration and timestamp errors abort the run and have
    /// no kind.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Schema { .. } | Self::Io { .. } | Self::Csv { .. } => Some(ErrorKind::Schema),
            Self::Partition(_) => Some(ErrorKind::Partition),
            Self::Merge { .. } => Some(ErrorKind::Merge),
            Self::Materialization { .. } => Some(ErrorKind::Materialization),
            Self::Query(_) => Some(ErrorKind::Query),
            Self::Upload { .. } => Some(ErrorKind::Upload),
            Self::Configuration(_) | Self::Timestamp(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ErrorKind {
    #[serde(rename = "schema_error")]
    Schema,
    #[serde(rename = "partition_error")]
    Partition,
    #[serde(rename = "merge_error")]
    Merge,
    #[serde(rename = "materialization_error")]
    Materialization,
    #[serde(rename = "query_error")]
    Query,
    #[serde(rename = "upload_error")]
    Upload,
}

impl ErrorKind {
    pub const ALL: [Self; 6] = [
        Self::Schema,
        Self::Partition,
        Self::Merge,
        Self::Materialization,
        Self::Query,
        Self::Upload,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schema => "schema_error",
            Self::Partition => "partition_error",
            Self::Merge => "merge_error",
            Self::Materialization => "materialization_error",
            Self::Query => "query_error",
            Self::Upload => "upload_error",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema_error" => Some(Self::Schema),
            "partition_error" => Some(Self::Partition),
            "merge_error" => Some(Self::Merge),
            "materialization_error" => Some(Self::Materialization),
            "query_error" => Some(Self::Query),
            "upload_error" => Some(Self::Upload),
            _ => None,
        }
    }
}

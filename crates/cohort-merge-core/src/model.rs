use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ClinicalError;

/// One tabular value. `None` is an explicit null; CSV empty fields decode to it.
pub type Cell = Option<String>;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct PatientId(String);

impl PatientId {
    /// Validates a raw patient identifier.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Partition`] when the identifier is empty,
    /// contains control characters or path separators, or is a dot segment.
    pub fn parse(raw: &str) -> Result<Self, ClinicalError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ClinicalError::Partition(
                "patient identifier is empty".to_string(),
            ));
        }
        if trimmed == "." || trimmed == ".." {
            return Err(ClinicalError::Partition(format!(
                "patient identifier {trimmed:?} is a path segment"
            )));
        }
        if trimmed
            .chars()
            .any(|ch| ch.is_control() || ch == '/' || ch == '\\')
        {
            return Err(ClinicalError::Partition(format!(
                "patient identifier {trimmed:?} contains a control character or path separator"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PatientId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PatientId {
    type Error = ClinicalError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<PatientId> for String {
    fn from(value: PatientId) -> Self {
        value.0
    }
}

/// Relational table name derived from a patient identifier.
///
/// The mapping is `patient_` followed by the lowercase hex encoding of the
/// identifier's UTF-8 bytes, so distinct identifiers never share a table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TableName(String);

impl TableName {
    pub const PREFIX: &'static str = "patient_";

    #[must_use]
    pub fn for_patient(patient_id: &PatientId) -> Self {
        Self(format!(
            "{}{}",
            Self::PREFIX,
            hex::encode(patient_id.as_str().as_bytes())
        ))
    }

    /// Recovers the patient identifier a table name was derived from.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Partition`] when the name was not produced by
    /// [`TableName::for_patient`].
    pub fn patient_id(&self) -> Result<PatientId, ClinicalError> {
        let encoded = self.0.strip_prefix(Self::PREFIX).ok_or_else(|| {
            ClinicalError::Partition(format!("table {} has no patient prefix", self.0))
        })?;
        let bytes = hex::decode(encoded).map_err(|err| {
            ClinicalError::Partition(format!("table {} is not hex encoded: {err}", self.0))
        })?;
        let raw = String::from_utf8(bytes).map_err(|err| {
            ClinicalError::Partition(format!("table {} is not valid UTF-8: {err}", self.0))
        })?;
        PatientId::parse(&raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Date,
    Text,
}

impl ColumnType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Date => "date",
            Self::Text => "text",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "integer" => Some(Self::Integer),
            "real" => Some(Self::Real),
            "date" => Some(Self::Date),
            "text" => Some(Self::Text),
            _ => None,
        }
    }

    /// Declared SQL type used when the column is materialized.
    #[must_use]
    pub fn sql_type(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Date => "DATE",
            Self::Text => "TEXT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
}

/// One category file (or one patient's slice of it) exactly as read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSourceFile {
    pub category: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl RawSourceFile {
    #[must_use]
    pub fn new(category: impl Into<String>, columns: Vec<String>, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            category: category.into(),
            columns,
            rows,
        }
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSourceFile {
    pub category: String,
    pub schema: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Cell>>,
}

impl NormalizedSourceFile {
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.schema.iter().map(|column| column.name.as_str()).collect()
    }

    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.iter().position(|column| column.name == name)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RowAlignment {
    Keyed,
    Positional,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MergeConflict {
    pub column: String,
    pub kept_from: String,
    pub dropped_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedPatientDataset {
    pub patient_id: PatientId,
    pub categories: Vec<String>,
    pub alignment: RowAlignment,
    pub schema: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Cell>>,
    pub conflicts: Vec<MergeConflict>,
}

impl MergedPatientDataset {
    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.schema.iter().map(|column| column.name.as_str()).collect()
    }

    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn table_name(&self) -> TableName {
        TableName::for_patient(&self.patient_id)
    }
}

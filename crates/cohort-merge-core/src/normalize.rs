use std::collections::BTreeSet;

use crate::infer::infer_schema;
use crate::{ClinicalError, NormalizedSourceFile, RawSourceFile};

/// Key columns that survive normalization without a category prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumns {
    /// Canonical patient key name shared by every normalized file.
    pub patient_key: String,
    /// Column in the raw file that carries the patient identifier.
    pub source_key: String,
    /// Optional per-event alignment key, kept as-is when present.
    pub alignment_key: Option<String>,
}

impl KeyColumns {
    #[must_use]
    pub fn uniform(patient_key: impl Into<String>) -> Self {
        let patient_key = patient_key.into();
        Self {
            source_key: patient_key.clone(),
            patient_key,
            alignment_key: None,
        }
    }

    #[must_use]
    pub fn with_alignment_key(mut self, alignment_key: impl Into<String>) -> Self {
        self.alignment_key = Some(alignment_key.into());
        self
    }
}

#[must_use]
pub fn prefixed_column(category: &str, column: &str) -> String {
    format!("{category}_{column}")
}

/// Renames every non-key column to `{category}_{column}` and infers the
/// typed schema of the result.
///
/// # Errors
/// Returns [`ClinicalError::Schema`] when the category label is empty, the
/// patient key column is absent, a header is blank, a row width differs from
/// the header, or the rendered column names are not unique.
pub fn normalize(raw: &RawSourceFile, keys: &KeyColumns) -> Result<NormalizedSourceFile, ClinicalError> {
    let category = raw.category.trim();
    if category.is_empty() {
        return Err(ClinicalError::Schema {
            category: raw.category.clone(),
            detail: "category label is empty".to_string(),
        });
    }
    let schema_error = |detail: String| ClinicalError::Schema {
        category: category.to_string(),
        detail,
    };

    let key_index = raw.column_index(&keys.source_key).ok_or_else(|| {
        schema_error(format!(
            "expected patient key column {} is absent",
            keys.source_key
        ))
    })?;

    let mut rendered = Vec::with_capacity(raw.columns.len());
    let mut seen = BTreeSet::new();
    for (index, column) in raw.columns.iter().enumerate() {
        if column.trim().is_empty() {
            return Err(schema_error(format!("column {index} has a blank header")));
        }
        let name = if index == key_index {
            keys.patient_key.clone()
        } else if keys.alignment_key.as_deref() == Some(column.as_str()) {
            column.clone()
        } else {
            prefixed_column(category, column)
        };
        // SQL identifiers compare case-insensitively.
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(schema_error(format!("duplicate column {name} after renaming")));
        }
        rendered.push(name);
    }

    for (row_index, row) in raw.rows.iter().enumerate() {
        if row.len() != rendered.len() {
            return Err(schema_error(format!(
                "row {row_index} has {} cells, expected {}",
                row.len(),
                rendered.len()
            )));
        }
    }

    let schema = infer_schema(&rendered, &raw.rows);
    Ok(NormalizedSourceFile {
        category: category.to_string(),
        schema,
        rows: raw.rows.clone(),
    })
}

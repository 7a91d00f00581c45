use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::harness::{default_battery, validate_battery, NamedQuery};
use crate::merge::MergeKeys;
use crate::normalize::KeyColumns;
use crate::verdict::VerdictThresholds;
use crate::ClinicalError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub patient_key_column: String,
    /// Per-category source column carrying the patient id, when it is not
    /// `patient_key_column`.
    pub category_key_columns: BTreeMap<String, String>,
    pub alignment_key: Option<String>,
    pub query_timeout_ms: u64,
    /// Prepare-stage worker count; 0 means one per CPU.
    pub workers: usize,
    pub retain_versions: usize,
    pub verdict: VerdictThresholds,
    pub queries: Option<Vec<NamedQuery>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            patient_key_column: "PATIENT".to_string(),
            category_key_columns: BTreeMap::from([("patients".to_string(), "Id".to_string())]),
            alignment_key: None,
            query_timeout_ms: 5_000,
            workers: 0,
            retain_versions: 5,
            verdict: VerdictThresholds::default(),
            queries: None,
        }
    }
}

impl PipelineConfig {
    /// # Errors
    /// Returns [`ClinicalError::Configuration`] on the first violated
    /// constraint.
    pub fn validate(&self) -> Result<(), ClinicalError> {
        if self.patient_key_column.trim().is_empty() {
            return Err(ClinicalError::Configuration(
                "patient_key_column must be non-empty".to_string(),
            ));
        }
        for (category, column) in &self.category_key_columns {
            if category.trim().is_empty() || column.trim().is_empty() {
                return Err(ClinicalError::Configuration(
                    "category_key_columns entries must be non-empty".to_string(),
                ));
            }
        }
        if let Some(key) = &self.alignment_key {
            if key.trim().is_empty() {
                return Err(ClinicalError::Configuration(
                    "alignment_key must be non-empty when set".to_string(),
                ));
            }
            if *key == self.patient_key_column {
                return Err(ClinicalError::Configuration(
                    "alignment_key must differ from patient_key_column".to_string(),
                ));
            }
        }
        if self.query_timeout_ms == 0 {
            return Err(ClinicalError::Configuration(
                "query_timeout_ms must be >= 1".to_string(),
            ));
        }
        if self.retain_versions == 0 {
            return Err(ClinicalError::Configuration(
                "retain_versions must be >= 1".to_string(),
            ));
        }
        self.verdict.validate()?;
        if let Some(queries) = &self.queries {
            validate_battery(queries)?;
        }
        Ok(())
    }

    /// # Errors
    /// Returns [`ClinicalError::Configuration`] when decoding fails or the
    /// decoded values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, ClinicalError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ClinicalError::Configuration(format!("invalid pipeline config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file; `None` yields the validated defaults.
    ///
    /// # Errors
    /// Returns [`ClinicalError::Io`] when the file cannot be read and
    /// [`ClinicalError::Configuration`] when it is not a valid config.
    pub fn load(path: Option<&Path>) -> Result<Self, ClinicalError> {
        let Some(path) = path else {
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        };
        let raw = std::fs::read_to_string(path).map_err(|err| ClinicalError::io(path, err))?;
        let value: Value = serde_json::from_str(&raw).map_err(|err| {
            ClinicalError::Configuration(format!("{} is not valid JSON: {err}", path.display()))
        })?;
        Self::from_json(&value)
    }

    #[must_use]
    pub fn source_key_for(&self, category: &str) -> String {
        self.category_key_columns
            .get(category)
            .cloned()
            .unwrap_or_else(|| self.patient_key_column.clone())
    }

    #[must_use]
    pub fn key_columns_for(&self, category: &str) -> KeyColumns {
        KeyColumns {
            patient_key: self.patient_key_column.clone(),
            source_key: self.source_key_for(category),
            alignment_key: self.alignment_key.clone(),
        }
    }

    #[must_use]
    pub fn merge_keys(&self) -> MergeKeys {
        MergeKeys {
            patient_key: self.patient_key_column.clone(),
            alignment_key: self.alignment_key.clone(),
        }
    }

    #[must_use]
    pub fn query_battery(&self) -> Vec<NamedQuery> {
        self.queries.clone().unwrap_or_else(default_battery)
    }

    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::sink::{quote_identifier, RelationalSink};
use crate::{ClinicalError, PatientId, TableName};

pub const TABLE_PLACEHOLDER: &str = "{table}";

/// An analytical query run against every patient table. `sql` names the
/// table through the `{table}` placeholder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamedQuery {
    pub name: String,
    pub sql: String,
    #[serde(default)]
    pub expect_rows: bool,
}

impl NamedQuery {
    #[must_use]
    pub fn new(name: &str, sql: &str, expect_rows: bool) -> Self {
        Self {
            name: name.to_string(),
            sql: sql.to_string(),
            expect_rows,
        }
    }

    #[must_use]
    pub fn render(&self, table: &TableName) -> String {
        self.sql
            .replace(TABLE_PLACEHOLDER, &quote_identifier(table.as_str()))
    }
}

/// The stock battery, written against the merged clinical column layout.
#[must_use]
pub fn default_battery() -> Vec<NamedQuery> {
    vec![
        NamedQuery::new(
            "clinical_record_count",
            "SELECT COUNT(*) AS record_count FROM {table}",
            true,
        ),
        NamedQuery::new(
            "demographic_summary",
            "SELECT patients_FIRST || ' ' || patients_LAST AS patient_name, \
             patients_BIRTHDATE, patients_GENDER, patients_RACE \
             FROM {table} WHERE patients_BIRTHDATE IS NOT NULL LIMIT 1",
            true,
        ),
        NamedQuery::new(
            "medication_cost_rollup",
            "SELECT medications_DESCRIPTION, COUNT(*) AS fills, \
             SUM(medications_TOTALCOST) AS total_cost \
             FROM {table} WHERE medications_DESCRIPTION IS NOT NULL \
             GROUP BY medications_DESCRIPTION ORDER BY total_cost DESC",
            true,
        ),
        NamedQuery::new(
            "procedure_cost_rollup",
            "SELECT procedures_DESCRIPTION, COUNT(*) AS performed, \
             SUM(procedures_BASE_COST) AS total_cost \
             FROM {table} WHERE procedures_DESCRIPTION IS NOT NULL \
             GROUP BY procedures_DESCRIPTION ORDER BY total_cost DESC",
            true,
        ),
        NamedQuery::new(
            "active_conditions",
            "SELECT DISTINCT conditions_DESCRIPTION, conditions_START \
             FROM {table} WHERE conditions_START IS NOT NULL AND conditions_STOP IS NULL \
             ORDER BY conditions_START",
            false,
        ),
        NamedQuery::new(
            "recent_observations",
            "SELECT observations_DATE, observations_DESCRIPTION, observations_VALUE, observations_UNITS \
             FROM {table} WHERE observations_DATE IS NOT NULL \
             ORDER BY observations_DATE DESC LIMIT 10",
            false,
        ),
    ]
}

/// Checks that a battery is usable: non-empty, uniquely named, and every
/// query references its table.
///
/// # Errors
/// Returns [`ClinicalError::Configuration`] describing the first problem.
pub fn validate_battery(battery: &[NamedQuery]) -> Result<(), ClinicalError> {
    if battery.is_empty() {
        return Err(ClinicalError::Configuration(
            "query battery must include at least one query".to_string(),
        ));
    }
    let mut names = BTreeSet::new();
    for query in battery {
        if query.name.trim().is_empty() {
            return Err(ClinicalError::Configuration(
                "query name must be non-empty".to_string(),
            ));
        }
        if !names.insert(query.name.as_str()) {
            return Err(ClinicalError::Configuration(format!(
                "duplicate query name {}",
                query.name
            )));
        }
        if !query.sql.contains(TABLE_PLACEHOLDER) {
            return Err(ClinicalError::Configuration(format!(
                "query {} does not reference {TABLE_PLACEHOLDER}",
                query.name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    Success,
    Failure,
}

impl QueryOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResult {
    pub patient_id: PatientId,
    pub query_name: String,
    pub elapsed_ms: f64,
    pub outcome: QueryOutcome,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl QueryResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == QueryOutcome::Success
    }

    /// The failure as a domain error, for run-summary accounting.
    #[must_use]
    pub fn error(&self) -> Option<ClinicalError> {
        self.error_detail.as_ref().map(|detail| {
            ClinicalError::Query(format!(
                "{} for patient {}: {detail}",
                self.query_name, self.patient_id
            ))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HarnessTarget {
    pub patient_id: PatientId,
    pub table_name: TableName,
}

impl HarnessTarget {
    #[must_use]
    pub fn for_patient(patient_id: PatientId) -> Self {
        let table_name = TableName::for_patient(&patient_id);
        Self {
            patient_id,
            table_name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryHarness {
    battery: Vec<NamedQuery>,
    timeout: Duration,
}

impl QueryHarness {
    /// # Errors
    /// Returns [`ClinicalError::Configuration`] for an unusable battery or a
    /// zero timeout.
    pub fn new(battery: Vec<NamedQuery>, timeout: Duration) -> Result<Self, ClinicalError> {
        validate_battery(&battery)?;
        if timeout.is_zero() {
            return Err(ClinicalError::Configuration(
                "query timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Self { battery, timeout })
    }

    #[must_use]
    pub fn battery(&self) -> &[NamedQuery] {
        &self.battery
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs the whole battery against one patient's table, in battery order.
    /// Every query yields exactly one result; failures never stop the battery.
    pub fn run_patient<S>(&self, sink: &mut S, target: &HarnessTarget) -> Vec<QueryResult>
    where
        S: RelationalSink + ?Sized,
    {
        self.battery
            .iter()
            .map(|query| self.run_query(sink, target, query))
            .collect()
    }

    /// Runs every target in the given order, patient-major.
    pub fn run<S>(&self, sink: &mut S, targets: &[HarnessTarget]) -> Vec<QueryResult>
    where
        S: RelationalSink + ?Sized,
    {
        targets
            .iter()
            .flat_map(|target| self.run_patient(sink, target))
            .collect()
    }

    fn run_query<S>(&self, sink: &mut S, target: &HarnessTarget, query: &NamedQuery) -> QueryResult
    where
        S: RelationalSink + ?Sized,
    {
        let sql = query.render(&target.table_name);
        let start = Instant::now();
        let outcome = sink.query(&sql, self.timeout);
        let elapsed = start.elapsed();

        let (row_count, error_detail) = match outcome {
            Err(err) => (0, Some(format!("{err:#}"))),
            Ok(rows) if elapsed > self.timeout => (
                rows.len(),
                Some(format!(
                    "exceeded timeout of {} ms",
                    self.timeout.as_millis()
                )),
            ),
            Ok(rows) if rows.is_empty() && query.expect_rows => {
                (0, Some("query returned no rows".to_string()))
            }
            Ok(rows) => (rows.len(), None),
        };

        if let Some(detail) = &error_detail {
            tracing::warn!(
                patient_id = %target.patient_id,
                query = %query.name,
                error = %detail,
                "query failed"
            );
        }

        QueryResult {
            patient_id: target.patient_id.clone(),
            query_name: query.name.clone(),
            elapsed_ms: elapsed.as_secs_f64() * 1_000.0,
            outcome: if error_detail.is_some() {
                QueryOutcome::Failure
            } else {
                QueryOutcome::Success
            },
            row_count,
            error_detail,
        }
    }
}

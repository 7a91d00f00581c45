use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::harness::QueryResult;
use crate::{format_rfc3339, now_utc, ClinicalError, PatientId};

pub const HARNESS_REPORT_CONTRACT: &str = "harness_report.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerdictThresholds {
    /// Success rate that must be exceeded for `excellent`.
    pub excellent_min_success_rate: f64,
    /// Lowest success rate still graded `good`.
    pub good_min_success_rate: f64,
    /// Optional p95 latency ceiling for `excellent`; a slower run is `good`.
    pub excellent_max_p95_ms: Option<f64>,
}

impl Default for VerdictThresholds {
    fn default() -> Self {
        Self {
            excellent_min_success_rate: 0.95,
            good_min_success_rate: 0.85,
            excellent_max_p95_ms: None,
        }
    }
}

impl VerdictThresholds {
    /// # Errors
    /// Returns [`ClinicalError::Configuration`] when a rate is outside [0, 1],
    /// the tiers are inverted, or the latency ceiling is not positive.
    pub fn validate(&self) -> Result<(), ClinicalError> {
        for (name, rate) in [
            ("excellent_min_success_rate", self.excellent_min_success_rate),
            ("good_min_success_rate", self.good_min_success_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(ClinicalError::Configuration(format!(
                    "{name} must be in [0.0, 1.0], got {rate}"
                )));
            }
        }
        if self.good_min_success_rate > self.excellent_min_success_rate {
            return Err(ClinicalError::Configuration(
                "good_min_success_rate must not exceed excellent_min_success_rate".to_string(),
            ));
        }
        if let Some(max) = self.excellent_max_p95_ms {
            if !max.is_finite() || max <= 0.0 {
                return Err(ClinicalError::Configuration(format!(
                    "excellent_max_p95_ms must be a positive number, got {max}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum VerdictTier {
    Excellent,
    Good,
    NeedsWork,
}

impl VerdictTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::NeedsWork => "needs_work",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PerformanceVerdict {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p95_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_budget_met: bool,
    pub tier: VerdictTier,
}

/// Rolls query results into a population-level verdict. Latency statistics
/// cover successful queries only. No attempts at all grade as `needs_work`
/// with a zero success rate.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn aggregate(results: &[QueryResult], thresholds: &VerdictThresholds) -> PerformanceVerdict {
    let attempted = results.len();
    let latencies: Vec<f64> = results
        .iter()
        .filter(|result| result.is_success())
        .map(|result| result.elapsed_ms)
        .collect();
    let succeeded = latencies.len();

    let success_rate = if attempted == 0 {
        0.0
    } else {
        succeeded as f64 / attempted as f64
    };
    let mean_latency_ms = if latencies.is_empty() {
        0.0
    } else {
        latencies.iter().sum::<f64>() / latencies.len() as f64
    };
    let p95_latency_ms = percentile(&latencies, 0.95);
    let latency_budget_met = thresholds
        .excellent_max_p95_ms
        .map_or(true, |max| p95_latency_ms <= max);

    PerformanceVerdict {
        attempted,
        succeeded,
        failed: attempted - succeeded,
        success_rate,
        mean_latency_ms,
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms,
        p99_latency_ms: percentile(&latencies, 0.99),
        latency_budget_met,
        tier: classify_tier(attempted, success_rate, latency_budget_met, thresholds),
    }
}

#[must_use]
pub fn classify_tier(
    attempted: usize,
    success_rate: f64,
    latency_budget_met: bool,
    thresholds: &VerdictThresholds,
) -> VerdictTier {
    if attempted == 0 {
        VerdictTier::NeedsWork
    } else if success_rate > thresholds.excellent_min_success_rate {
        if latency_budget_met {
            VerdictTier::Excellent
        } else {
            VerdictTier::Good
        }
    } else if success_rate >= thresholds.good_min_success_rate {
        VerdictTier::Good
    } else {
        VerdictTier::NeedsWork
    }
}

/// Nearest-rank percentile; zero for an empty sample.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn percentile(values: &[f64], percentile_rank: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);

    let position = (percentile_rank * sorted.len() as f64).ceil() as usize;
    let index = position.saturating_sub(1).min(sorted.len() - 1);
    sorted[index]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatientQuerySummary {
    pub patient_id: PatientId,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Per-patient success counts in order of first appearance.
#[must_use]
pub fn summarize_by_patient(results: &[QueryResult]) -> Vec<PatientQuerySummary> {
    let mut order: Vec<PatientQuerySummary> = Vec::new();
    let mut index: BTreeMap<&PatientId, usize> = BTreeMap::new();
    for result in results {
        let slot = *index.entry(&result.patient_id).or_insert_with(|| {
            order.push(PatientQuerySummary {
                patient_id: result.patient_id.clone(),
                attempted: 0,
                succeeded: 0,
                failed: 0,
            });
            order.len() - 1
        });
        let summary = &mut order[slot];
        summary.attempted += 1;
        if result.is_success() {
            summary.succeeded += 1;
        } else {
            summary.failed += 1;
        }
    }
    order
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HarnessReport {
    pub contract_version: String,
    pub generated_at: String,
    pub results: Vec<QueryResult>,
    pub per_patient: Vec<PatientQuerySummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<PerformanceVerdict>,
}

impl HarnessReport {
    #[must_use]
    pub fn tier(&self) -> Option<VerdictTier> {
        self.verdict.as_ref().map(|verdict| verdict.tier)
    }
}

/// Builds the report for a completed harness run, verdict included.
///
/// # Errors
/// Returns [`ClinicalError::Timestamp`] if the clock cannot be formatted.
pub fn build_report(
    results: Vec<QueryResult>,
    thresholds: &VerdictThresholds,
) -> Result<HarnessReport, ClinicalError> {
    let verdict = aggregate(&results, thresholds);
    let mut report = partial_report(results)?;
    report.verdict = Some(verdict);
    Ok(report)
}

/// Builds a report for an interrupted run: results and per-patient counts
/// only, no verdict.
///
/// # Errors
/// Returns [`ClinicalError::Timestamp`] if the clock cannot be formatted.
pub fn partial_report(results: Vec<QueryResult>) -> Result<HarnessReport, ClinicalError> {
    Ok(HarnessReport {
        contract_version: HARNESS_REPORT_CONTRACT.to_string(),
        generated_at: format_rfc3339(now_utc())?,
        per_patient: summarize_by_patient(&results),
        results,
        verdict: None,
    })
}

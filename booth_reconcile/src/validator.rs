use log::{info, warn};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Display;

use crate::config::*;

/// Why an extraction was not accepted.
#[derive(PartialEq, Debug, Clone)]
pub enum RejectionReason {
    TooFewBooths {
        found: usize,
        expected: usize,
        coverage: f64,
        min_coverage: f64,
    },
    ErrorTooHigh {
        mean_error: f64,
        ceiling: f64,
    },
    LowConfidence,
}

impl Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::TooFewBooths {
                found,
                expected,
                coverage,
                min_coverage,
            } => write!(
                f,
                "too few booths: {} of {} expected ({:.1}%, at least {:.1}% required)",
                found,
                expected,
                coverage * 100.0,
                min_coverage * 100.0
            ),
            RejectionReason::ErrorTooHigh {
                mean_error,
                ceiling,
            } => write!(
                f,
                "error too high: mean relative error of the top candidates is {:.2}% (ceiling {:.2}%)",
                mean_error * 100.0,
                ceiling * 100.0
            ),
            RejectionReason::LowConfidence => {
                write!(f, "too many unreadable rows in the document")
            }
        }
    }
}

/// The outcome of the validation of one extraction.
#[derive(PartialEq, Debug, Clone)]
pub struct ValidationReport {
    pub accepted: bool,
    pub policy: Cow<'static, str>,
    /// Relative error per candidate index, for every candidate with official votes.
    pub errors_by_candidate: BTreeMap<usize, f64>,
    /// Mean relative error over the top candidates.
    pub mean_error: f64,
    pub coverage_ratio: f64,
    pub rejection: Option<RejectionReason>,
}

/// Scores an extraction against the official totals.
///
/// An `expected_booth_count` of zero means that the number of booths is not known, and
/// the coverage is not checked. The extraction itself is never modified.
pub fn validate(
    result: &ExtractionResult,
    candidates: &[Candidate],
    expected_booth_count: usize,
    policy: &AcceptancePolicy,
) -> ValidationReport {
    let found = result.booth_rows.len();
    let coverage_ratio = if expected_booth_count == 0 {
        1.0
    } else {
        found as f64 / expected_booth_count as f64
    };

    let mut errors_by_candidate: BTreeMap<usize, f64> = BTreeMap::new();
    for (idx, c) in candidates.iter().enumerate() {
        if c.official_votes == 0 {
            continue;
        }
        let extracted = result.per_candidate_booth_total.get(idx).cloned().unwrap_or(0) as f64
            * result.scale;
        let err = (extracted - c.official_votes as f64).abs() / c.official_votes as f64;
        errors_by_candidate.insert(idx, err);
    }

    let mut top: Vec<(usize, &Candidate)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, c)| c.official_votes > 0)
        .collect();
    top.sort_by(|(i1, c1), (i2, c2)| c2.official_votes.cmp(&c1.official_votes).then(i1.cmp(i2)));
    top.truncate(policy.top_n.max(1));
    let mean_error = if top.is_empty() {
        0.0
    } else {
        top.iter()
            .map(|(idx, _)| errors_by_candidate.get(idx).cloned().unwrap_or(1.0))
            .sum::<f64>()
            / top.len() as f64
    };

    let rejection = if coverage_ratio < policy.min_coverage {
        Some(RejectionReason::TooFewBooths {
            found,
            expected: expected_booth_count,
            coverage: coverage_ratio,
            min_coverage: policy.min_coverage,
        })
    } else if mean_error > policy.max_mean_error {
        Some(RejectionReason::ErrorTooHigh {
            mean_error,
            ceiling: policy.max_mean_error,
        })
    } else if result.low_confidence && !policy.allow_low_confidence {
        Some(RejectionReason::LowConfidence)
    } else {
        None
    };

    match &rejection {
        None => info!(
            "validate: unit {}: accepted under policy {} (coverage {:.3}, mean error {:.4})",
            result.unit_id, policy.name, coverage_ratio, mean_error
        ),
        Some(reason) => warn!(
            "validate: unit {}: rejected under policy {}: {}",
            result.unit_id, policy.name, reason
        ),
    }

    ValidationReport {
        accepted: rejection.is_none(),
        policy: policy.name.clone(),
        errors_by_candidate,
        mean_error,
        coverage_ratio,
        rejection,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::ColumnMapping;

    fn candidates() -> Vec<Candidate> {
        Candidate::ranked(&[
            ("A".to_string(), "PA".to_string(), 10_000),
            ("B".to_string(), "PB".to_string(), 8_000),
            ("C".to_string(), "PC".to_string(), 3_000),
            ("D".to_string(), "PD".to_string(), 0),
        ])
        .unwrap()
    }

    fn extraction(num_booths: usize, totals: Vec<u64>, low_confidence: bool) -> ExtractionResult {
        let booth_rows = (0..num_booths)
            .map(|i| BoothRow {
                booth_id: BoothId::plain(i as u32 + 1),
                raw_votes: vec![0, 0, 0, 0],
                declared_total: 0,
                rejected: 0,
                nota: 0,
                source_row: SourceRow { index: i },
            })
            .collect();
        ExtractionResult {
            unit_id: "AC-1".to_string(),
            booth_rows,
            column_mapping: ColumnMapping::identity(4),
            per_candidate_booth_total: totals,
            scale: 1.0,
            low_confidence,
            errors: vec![],
            warnings: vec![],
        }
    }

    #[test]
    fn strict_accepts_good_extraction() {
        let r = extraction(96, vec![9_850, 7_880, 2_955, 0], false);
        let report = validate(&r, &candidates(), 100, &AcceptancePolicy::STRICT);
        assert!(report.accepted, "{:?}", report);
        assert!((report.mean_error - 0.015).abs() < 1e-9);
        assert!((report.coverage_ratio - 0.96).abs() < 1e-9);
        assert_eq!(report.errors_by_candidate.len(), 3);
    }

    #[test]
    fn lenient_still_requires_booth_coverage() {
        let r = extraction(50, vec![9_850, 7_880, 2_955, 0], false);
        let report = validate(&r, &candidates(), 100, &AcceptancePolicy::LENIENT);
        assert!(!report.accepted);
        assert!(matches!(
            report.rejection,
            Some(RejectionReason::TooFewBooths { found: 50, .. })
        ));
        // The same data is good enough for a degraded scan.
        let report = validate(&r, &candidates(), 100, &AcceptancePolicy::DEGRADED_SCAN);
        assert!(report.accepted);
    }

    #[test]
    fn strict_rejects_large_errors() {
        let r = extraction(100, vec![9_000, 7_000, 2_955, 0], false);
        let report = validate(&r, &candidates(), 100, &AcceptancePolicy::STRICT);
        assert!(matches!(
            report.rejection,
            Some(RejectionReason::ErrorTooHigh { .. })
        ));
        let report = validate(&r, &candidates(), 100, &AcceptancePolicy::LENIENT);
        assert!(report.accepted);
    }

    #[test]
    fn strict_rejects_low_confidence_documents() {
        let r = extraction(100, vec![10_000, 8_000, 3_000, 0], true);
        let report = validate(&r, &candidates(), 0, &AcceptancePolicy::STRICT);
        assert_eq!(report.rejection, Some(RejectionReason::LowConfidence));
        assert_eq!(report.coverage_ratio, 1.0);
    }
}

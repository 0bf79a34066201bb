mod config;
use log::{debug, info, warn};

use std::{borrow::Cow, collections::BTreeMap, error::Error, fmt::Display};

pub mod builder;
pub mod classifier;
pub mod manual;
pub mod matcher;
pub mod reconciler;
pub mod validator;

pub use crate::config::*;
use crate::classifier::{classify_document, RowShape};
use crate::matcher::{best_mapping, column_sums, OfficialTotal};
use crate::reconciler::{cap_booth_rows, reconcile, ReconcileError};
use crate::validator::{validate, ValidationReport};

/// The canonical record of one administrative unit.
///
/// It is produced fresh on every run and only exists when the extraction was accepted.
#[derive(PartialEq, Debug, Clone)]
pub struct CanonicalRecord {
    pub unit_id: String,
    /// sha256 of the raw rows, to tie the record to its source.
    pub source_digest: String,
    pub candidates: Vec<Candidate>,
    /// Booth rows with the votes in canonical candidate order, after capping.
    pub booths: Vec<BoothRow>,
    pub results: Vec<ReconciledCandidateResult>,
    /// The summary layout that produced the accepted reading.
    pub layout: Cow<'static, str>,
    pub extraction: ExtractionResult,
    pub validation: ValidationReport,
    pub row_rejections: BTreeMap<&'static str, usize>,
    pub row_coverage: f64,
}

/// Errors that abort the processing of a unit. Nothing is persisted for the unit.
#[derive(PartialEq, Debug, Clone)]
pub enum ExtractionError {
    NoCandidates,
    InvalidCandidates(CandidateDataError),
    NoBoothRows {
        layout: Cow<'static, str>,
        rejections: BTreeMap<&'static str, usize>,
    },
    InsufficientColumnMatches {
        layout: Cow<'static, str>,
        mapped: usize,
        required: usize,
    },
    AccuracyRejected {
        layout: Cow<'static, str>,
        report: ValidationReport,
    },
    Reconcile(ReconcileError),
    /// Every layout was tried, none was accepted.
    AllStrategiesFailed(Vec<ExtractionError>),
}

impl ExtractionError {
    /// A short stable name for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::NoCandidates | ExtractionError::InvalidCandidates(_) => {
                "invalid_candidates"
            }
            ExtractionError::NoBoothRows { .. } => "no_booth_rows",
            ExtractionError::InsufficientColumnMatches { .. } => "insufficient_column_matches",
            ExtractionError::AccuracyRejected { .. } => "accuracy_rejected",
            ExtractionError::Reconcile(_) => "invariant_violation",
            ExtractionError::AllStrategiesFailed(_) => "all_strategies_failed",
        }
    }
}

impl Error for ExtractionError {}

impl Display for ExtractionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractionError::NoCandidates => write!(f, "no candidates"),
            ExtractionError::InvalidCandidates(e) => write!(f, "invalid candidate data: {}", e),
            ExtractionError::NoBoothRows { layout, rejections } => {
                write!(f, "[{}] no booth row could be read", layout)?;
                for (kind, count) in rejections.iter() {
                    write!(f, " {}:{}", kind, count)?;
                }
                Ok(())
            }
            ExtractionError::InsufficientColumnMatches {
                layout,
                mapped,
                required,
            } => write!(
                f,
                "[{}] too few column matches: {} candidates mapped, {} required",
                layout, mapped, required
            ),
            ExtractionError::AccuracyRejected { layout, report } => match &report.rejection {
                Some(reason) => write!(f, "[{}] {}", layout, reason),
                None => write!(f, "[{}] rejected", layout),
            },
            ExtractionError::Reconcile(e) => write!(f, "{}", e),
            ExtractionError::AllStrategiesFailed(attempts) => {
                let msgs: Vec<String> = attempts.iter().map(|e| e.to_string()).collect();
                write!(f, "no reading accepted: {}", msgs.join("; "))
            }
        }
    }
}

impl From<ReconcileError> for ExtractionError {
    fn from(e: ReconcileError) -> Self {
        ExtractionError::Reconcile(e)
    }
}

/// Runs the whole pipeline on the rows of one document.
///
/// Arguments:
/// * `unit_id` the identifier of the administrative unit
/// * `rows` the cells of every row of the document, as read by the text layer
/// * `candidates` the authoritative candidates, in canonical order
/// * `expected_booths` the number of booths of the unit, 0 if not known
/// * `rules` the rules that govern the extraction
///
/// Every summary layout of the rules is tried in order, the first accepted reading wins.
pub fn process_unit(
    unit_id: &str,
    rows: &[Vec<String>],
    candidates: &[Candidate],
    expected_booths: usize,
    rules: &ExtractionRules,
) -> Result<CanonicalRecord, ExtractionError> {
    info!(
        "process_unit: unit {}: {} rows, {} candidates, {} expected booths, policy {}",
        unit_id,
        rows.len(),
        candidates.len(),
        expected_booths,
        rules.acceptance.name
    );
    if candidates.is_empty() {
        return Err(ExtractionError::NoCandidates);
    }

    let fallback = [SummaryLayout::standard()];
    let layouts: &[SummaryLayout] = if rules.classifier.layouts.is_empty() {
        &fallback
    } else {
        &rules.classifier.layouts
    };

    let mut failures: Vec<ExtractionError> = Vec::new();
    for layout in layouts.iter() {
        match process_with_layout(unit_id, rows, candidates, expected_booths, rules, layout) {
            Ok(record) => {
                info!(
                    "process_unit: unit {}: accepted with layout {} ({} booths)",
                    unit_id,
                    layout.name,
                    record.booths.len()
                );
                return Ok(record);
            }
            Err(e @ ExtractionError::Reconcile(_)) => return Err(e),
            Err(e) => {
                warn!("process_unit: unit {}: {}", unit_id, e);
                failures.push(e);
            }
        }
    }
    if failures.len() == 1 {
        Err(failures.remove(0))
    } else {
        Err(ExtractionError::AllStrategiesFailed(failures))
    }
}

fn process_with_layout(
    unit_id: &str,
    rows: &[Vec<String>],
    candidates: &[Candidate],
    expected_booths: usize,
    rules: &ExtractionRules,
    layout: &SummaryLayout,
) -> Result<CanonicalRecord, ExtractionError> {
    let num_candidates = candidates.len();
    let shape = RowShape::infer(num_candidates, &rules.classifier, layout);
    debug!(
        "process_with_layout: unit {}: layout {} columns {:?}",
        unit_id, layout.name, shape.column_count
    );
    let doc = classify_document(rows, &shape);
    if doc.booths.is_empty() {
        return Err(ExtractionError::NoBoothRows {
            layout: layout.name.clone(),
            rejections: doc.rejections,
        });
    }

    let sums = column_sums(&doc.booths);
    let official = OfficialTotal::from_candidates(candidates);
    let (mapping, scale) = best_mapping(&sums, &official, &rules.matching);
    let required = rules.matching.min_required(num_candidates);
    if mapping.len() < required {
        return Err(ExtractionError::InsufficientColumnMatches {
            layout: layout.name.clone(),
            mapped: mapping.len(),
            required,
        });
    }

    let booth_rows: Vec<BoothRow> = doc
        .booths
        .iter()
        .map(|b| BoothRow {
            raw_votes: mapping.remap(&b.raw_votes, num_candidates),
            ..b.clone()
        })
        .collect();
    let mut per_candidate_booth_total = vec![0u64; num_candidates];
    for b in booth_rows.iter() {
        for (idx, v) in b.raw_votes.iter().enumerate() {
            per_candidate_booth_total[idx] += *v;
        }
    }

    let mut errors: Vec<String> = Vec::new();
    let mut warnings = doc.warnings.clone();
    for (idx, c) in candidates.iter().enumerate() {
        if mapping.column_for(idx).is_none() && c.official_votes > 0 {
            let msg = format!(
                "candidate {} ({} votes) has no matching column, counted as postal only",
                c.name, c.official_votes
            );
            if c.official_votes > rules.matching.materiality_floor {
                errors.push(msg);
            } else {
                debug!("process_with_layout: unit {}: {}", unit_id, msg);
            }
        }
    }
    for col in 0..sums.len() {
        if mapping.candidate_for(col).is_none() {
            warnings.push(RowWarning {
                source_row: SourceRow { index: 0 },
                message: format!("column {} (sum {}) discarded", col, sums[col]),
            });
        }
    }

    let extraction = ExtractionResult {
        unit_id: unit_id.to_string(),
        booth_rows,
        column_mapping: mapping,
        per_candidate_booth_total,
        scale,
        low_confidence: doc.low_confidence,
        errors,
        warnings,
    };

    let report = validate(&extraction, candidates, expected_booths, &rules.acceptance);
    if !report.accepted {
        return Err(ExtractionError::AccuracyRejected {
            layout: layout.name.clone(),
            report,
        });
    }

    let results = reconcile(&extraction.per_candidate_booth_total, candidates)?;
    let mut booths = extraction.booth_rows.clone();
    cap_booth_rows(&mut booths, &results)?;

    Ok(CanonicalRecord {
        unit_id: unit_id.to_string(),
        source_digest: digest_rows(rows),
        candidates: candidates.to_vec(),
        booths,
        results,
        layout: layout.name.clone(),
        extraction,
        validation: report,
        row_rejections: doc.rejections,
        row_coverage: doc.row_coverage,
    })
}

/// A stable fingerprint of the raw rows.
pub fn digest_rows(rows: &[Vec<String>]) -> String {
    let joined: Vec<String> = rows.iter().map(|r| r.join("\u{1f}")).collect();
    sha256::digest(joined.join("\n"))
}

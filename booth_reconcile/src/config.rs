// ********* Input data structures ***********

use std::borrow::Cow;
use std::error::Error;
use std::fmt::Display;
use std::ops::RangeInclusive;

use crate::matcher::ColumnMapping;

/// A candidate as published in the authoritative results.
///
/// Candidates are never modified by the extraction: they are the ground truth
/// against which everything else is checked.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct Candidate {
    pub name: String,
    pub party: String,
    pub official_votes: u64,
    /// Rank by official votes, 1 being the winner.
    pub position: u32,
}

impl Candidate {
    /// Builds the candidate list from the authoritative `(name, party, votes)` entries.
    ///
    /// The order of the input is kept (it is the canonical order of the unit). Positions are
    /// assigned by decreasing number of votes, ties being broken by input order.
    pub fn ranked(entries: &[(String, String, u64)]) -> Result<Vec<Candidate>, CandidateDataError> {
        if entries.is_empty() {
            return Err(CandidateDataError::Empty);
        }
        let mut seen: Vec<&str> = Vec::new();
        for (name, _, _) in entries.iter() {
            let trimmed = name.trim();
            if trimmed.is_empty() {
                return Err(CandidateDataError::EmptyName);
            }
            if seen.contains(&trimmed) {
                return Err(CandidateDataError::DuplicateName(trimmed.to_string()));
            }
            seen.push(trimmed);
        }

        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by(|a, b| entries[*b].2.cmp(&entries[*a].2).then(a.cmp(b)));
        let mut positions = vec![0u32; entries.len()];
        for (rank, idx) in order.iter().enumerate() {
            positions[*idx] = (rank + 1) as u32;
        }

        Ok(entries
            .iter()
            .zip(positions)
            .map(|((name, party, votes), position)| Candidate {
                name: name.trim().to_string(),
                party: party.trim().to_string(),
                official_votes: *votes,
                position,
            })
            .collect())
    }
}

/// Problems found when loading the authoritative candidate list.
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum CandidateDataError {
    Empty,
    EmptyName,
    DuplicateName(String),
}

impl Error for CandidateDataError {}

impl Display for CandidateDataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CandidateDataError::Empty => write!(f, "the candidate list is empty"),
            CandidateDataError::EmptyName => write!(f, "a candidate has an empty name"),
            CandidateDataError::DuplicateName(n) => write!(f, "candidate {} is listed twice", n),
        }
    }
}

/// The identifier of a polling booth: a number and an optional suffix
/// (auxiliary booths, women's booths: `12A`, `12W`).
#[derive(Eq, PartialEq, Debug, Clone, Hash, Ord, PartialOrd)]
pub struct BoothId {
    pub number: u32,
    pub suffix: Option<String>,
}

impl BoothId {
    pub fn plain(number: u32) -> BoothId {
        BoothId {
            number,
            suffix: None,
        }
    }

    pub fn with_suffix(number: u32, suffix: &str) -> BoothId {
        BoothId {
            number,
            suffix: Some(suffix.to_uppercase()),
        }
    }
}

impl Display for BoothId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.suffix {
            Some(s) => write!(f, "{}{}", self.number, s),
            None => write!(f, "{}", self.number),
        }
    }
}

/// Where a booth row came from in the source document.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub struct SourceRow {
    /// Zero-based index of the row in the document.
    pub index: usize,
}

/// One classified booth row.
///
/// `raw_votes` has one entry per detected column. After remapping, it has one entry
/// per candidate in canonical order.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct BoothRow {
    pub booth_id: BoothId,
    pub raw_votes: Vec<u64>,
    pub declared_total: u64,
    pub rejected: u64,
    pub nota: u64,
    pub source_row: SourceRow,
}

impl BoothRow {
    pub fn vote_sum(&self) -> u64 {
        self.raw_votes.iter().sum()
    }
}

/// A warning produced while reading the rows of a document.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct RowWarning {
    pub source_row: SourceRow,
    pub message: String,
}

// ******** Output data structures *********

/// The extraction of one document, with the rows in canonical candidate order.
#[derive(PartialEq, Debug, Clone)]
pub struct ExtractionResult {
    pub unit_id: String,
    pub booth_rows: Vec<BoothRow>,
    pub column_mapping: ColumnMapping,
    pub per_candidate_booth_total: Vec<u64>,
    /// official sum / extracted column sum
    pub scale: f64,
    pub low_confidence: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<RowWarning>,
}

/// The final numbers for one candidate.
///
/// Invariant: `booth_votes + postal_votes == total == candidate.official_votes`.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct ReconciledCandidateResult {
    pub candidate: Candidate,
    pub booth_votes: u64,
    pub postal_votes: u64,
    pub total: u64,
}

// ********* Configuration **********

/// The meaning of one cell in the summary block that closes a booth row.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum SummaryField {
    DeclaredTotal,
    Rejected,
    Nota,
    GrandTotal,
    Tendered,
    /// A cell that is present but carries nothing useful.
    Ignored,
}

/// The fixed-width block of summary cells at the end of every booth row.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct SummaryLayout {
    pub name: Cow<'static, str>,
    pub fields: Vec<SummaryField>,
}

impl SummaryLayout {
    /// Total of valid votes, rejected, NOTA, grand total.
    pub fn standard() -> SummaryLayout {
        SummaryLayout {
            name: Cow::Borrowed("standard"),
            fields: vec![
                SummaryField::DeclaredTotal,
                SummaryField::Rejected,
                SummaryField::Nota,
                SummaryField::GrandTotal,
            ],
        }
    }

    /// The standard layout with the tendered votes column at the end.
    pub fn with_tendered() -> SummaryLayout {
        SummaryLayout {
            name: Cow::Borrowed("with_tendered"),
            fields: vec![
                SummaryField::DeclaredTotal,
                SummaryField::Rejected,
                SummaryField::Nota,
                SummaryField::GrandTotal,
                SummaryField::Tendered,
            ],
        }
    }

    /// Older documents: no NOTA and no grand total.
    pub fn total_only() -> SummaryLayout {
        SummaryLayout {
            name: Cow::Borrowed("total_only"),
            fields: vec![SummaryField::DeclaredTotal, SummaryField::Rejected],
        }
    }

    /// Rows that stop right after the last candidate.
    pub fn none() -> SummaryLayout {
        SummaryLayout {
            name: Cow::Borrowed("none"),
            fields: vec![],
        }
    }

    pub fn by_name(name: &str) -> Option<SummaryLayout> {
        match name {
            "standard" => Some(SummaryLayout::standard()),
            "with_tendered" => Some(SummaryLayout::with_tendered()),
            "total_only" => Some(SummaryLayout::total_only()),
            "none" => Some(SummaryLayout::none()),
            _ => None,
        }
    }

    pub fn width(&self) -> usize {
        self.fields.len()
    }

    pub(crate) fn position(&self, field: SummaryField) -> Option<usize> {
        self.fields.iter().position(|f| *f == field)
    }
}

/// Rules for turning raw rows into booth rows.
#[derive(PartialEq, Debug, Clone)]
pub struct ClassifierRules {
    pub booth_id_range: RangeInclusive<u32>,
    /// How many leading numbers may hold the booth number.
    pub booth_window: usize,
    /// Rows whose votes add up outside this band are not votes.
    pub vote_sum_band: RangeInclusive<u64>,
    pub abs_tolerance: u64,
    pub rel_tolerance: f64,
    pub min_row_coverage: f64,
    pub max_consecutive_rejections: usize,
    /// Layouts to try, in order. The first one is the preferred reading.
    pub layouts: Vec<SummaryLayout>,
    pub stoplist: Vec<Cow<'static, str>>,
}

pub const DEFAULT_STOPLIST: [&str; 16] = [
    "total",
    "serial",
    "polling",
    "station",
    "candidate",
    "candidates",
    "electors",
    "rejected",
    "tendered",
    "nota",
    "valid",
    "postal",
    "form",
    "s.no",
    "sl.no",
    "constituency",
];

impl Default for ClassifierRules {
    fn default() -> Self {
        ClassifierRules {
            booth_id_range: 1..=700,
            booth_window: 3,
            vote_sum_band: 20..=3000,
            abs_tolerance: 5,
            rel_tolerance: 0.01,
            min_row_coverage: 0.5,
            max_consecutive_rejections: 25,
            layouts: vec![
                SummaryLayout::standard(),
                SummaryLayout::with_tendered(),
                SummaryLayout::total_only(),
                SummaryLayout::none(),
            ],
            stoplist: DEFAULT_STOPLIST.iter().map(|s| Cow::Borrowed(*s)).collect(),
        }
    }
}

/// The knobs of the column to candidate matcher.
#[derive(PartialEq, Debug, Clone)]
pub struct MatchPolicy {
    /// Maximum relative error for candidates above the materiality floor.
    pub strict_threshold: f64,
    /// Maximum relative error for the other candidates.
    pub loose_threshold: f64,
    pub materiality_floor: u64,
    /// Two columns whose distances differ by less than this fraction of the official
    /// total are considered tied.
    pub near_tie_ratio: f64,
    pub min_mapped_ratio: f64,
    pub min_mapped_abs: usize,
}

impl MatchPolicy {
    pub const DEFAULT: MatchPolicy = MatchPolicy {
        strict_threshold: 0.30,
        loose_threshold: 0.60,
        materiality_floor: 5_000,
        near_tie_ratio: 0.01,
        min_mapped_ratio: 0.2,
        min_mapped_abs: 3,
    };

    /// The smallest number of mapped candidates that makes a mapping usable.
    pub fn min_required(&self, num_candidates: usize) -> usize {
        let by_ratio = (self.min_mapped_ratio * num_candidates as f64).ceil() as usize;
        by_ratio.max(self.min_mapped_abs).min(num_candidates)
    }
}

/// When an extraction is good enough to be persisted.
#[derive(PartialEq, Debug, Clone)]
pub struct AcceptancePolicy {
    pub name: Cow<'static, str>,
    /// Minimum ratio of extracted booths over expected booths.
    pub min_coverage: f64,
    /// Ceiling on the mean relative error of the top candidates.
    pub max_mean_error: f64,
    pub top_n: usize,
    pub allow_low_confidence: bool,
}

impl AcceptancePolicy {
    pub const STRICT: AcceptancePolicy = AcceptancePolicy {
        name: Cow::Borrowed("strict"),
        min_coverage: 0.95,
        max_mean_error: 0.02,
        top_n: 3,
        allow_low_confidence: false,
    };

    /// Best effort for poor scans: tolerates a large error but still wants the booths.
    pub const LENIENT: AcceptancePolicy = AcceptancePolicy {
        name: Cow::Borrowed("lenient"),
        min_coverage: 0.95,
        max_mean_error: 0.30,
        top_n: 3,
        allow_low_confidence: true,
    };

    /// Known-degraded scanned sources.
    pub const DEGRADED_SCAN: AcceptancePolicy = AcceptancePolicy {
        name: Cow::Borrowed("degraded_scan"),
        min_coverage: 0.5,
        max_mean_error: 0.50,
        top_n: 2,
        allow_low_confidence: true,
    };

    pub fn by_name(name: &str) -> Option<AcceptancePolicy> {
        match name {
            "strict" => Some(AcceptancePolicy::STRICT),
            "lenient" => Some(AcceptancePolicy::LENIENT),
            "degraded" | "degraded_scan" => Some(AcceptancePolicy::DEGRADED_SCAN),
            _ => None,
        }
    }
}

/// All the rules that govern the processing of one unit.
#[derive(PartialEq, Debug, Clone)]
pub struct ExtractionRules {
    pub classifier: ClassifierRules,
    pub matching: MatchPolicy,
    pub acceptance: AcceptancePolicy,
}

impl Default for ExtractionRules {
    fn default() -> Self {
        ExtractionRules {
            classifier: ClassifierRules::default(),
            matching: MatchPolicy::DEFAULT,
            acceptance: AcceptancePolicy::STRICT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranked_assigns_positions_by_votes() {
        let cands = Candidate::ranked(&[
            ("B".to_string(), "P2".to_string(), 800),
            ("A".to_string(), "P1".to_string(), 1200),
            ("C".to_string(), "P3".to_string(), 800),
        ])
        .unwrap();
        let positions: Vec<u32> = cands.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![2, 1, 3]);
        assert_eq!(cands[1].name, "A");
    }

    #[test]
    fn ranked_rejects_bad_data() {
        assert_eq!(Candidate::ranked(&[]), Err(CandidateDataError::Empty));
        let dup = Candidate::ranked(&[
            ("A".to_string(), "P".to_string(), 1),
            (" A ".to_string(), "Q".to_string(), 2),
        ]);
        assert_eq!(dup, Err(CandidateDataError::DuplicateName("A".to_string())));
    }

    #[test]
    fn min_required_is_capped_by_candidate_count() {
        let p = MatchPolicy::DEFAULT;
        assert_eq!(p.min_required(2), 2);
        assert_eq!(p.min_required(10), 3);
        assert_eq!(p.min_required(30), 6);
    }

    #[test]
    fn booth_id_display_keeps_suffix() {
        assert_eq!(BoothId::with_suffix(12, "a").to_string(), "12A");
        assert_eq!(BoothId::plain(7).to_string(), "7");
    }
}

//! Classification of raw document rows into booth rows.
//!
//! A Form 20 booth row reads, from left to right: a few leading numbers (serial
//! number, booth number), one vote count per candidate column, and a fixed block
//! of summary cells (see [`SummaryLayout`]). Anything that does not fit this shape
//! is rejected with an explicit [`RowRejection`] reason; no value is ever guessed.

use log::{debug, warn};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::ops::RangeInclusive;

use crate::config::*;

/// One cell of a raw row, as read by the text layer.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum Token {
    Number(u64),
    /// A number with an alphabetic suffix, like `12A` or `12(W)`.
    Suffixed(u64, String),
    /// An empty cell.
    Blank,
    /// A cell holding only dashes, the way tables print a zero.
    Dash,
    /// Any other text, lowercased.
    Word(String),
}

/// Parses one cell.
///
/// Thousands separators inside digit groups are removed (`1,234`), stray punctuation
/// around the cell is dropped.
pub fn tokenize(cell: &str) -> Token {
    let trimmed = cell
        .trim()
        .trim_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '|' | '*' | '\'' | '"'));
    if trimmed.is_empty() {
        return Token::Blank;
    }
    if trimmed.chars().all(|c| matches!(c, '-' | '\u{2013}' | '\u{2014}')) {
        return Token::Dash;
    }
    let no_separators: String = trimmed.chars().filter(|c| *c != ',').collect();
    if no_separators.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = no_separators.parse::<u64>() {
            return Token::Number(n);
        }
    }

    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        let rest: String = trimmed[digits.len()..]
            .chars()
            .filter(|c| !matches!(c, '-' | '/' | '(' | ')' | ' '))
            .collect();
        if !rest.is_empty() && rest.len() <= 2 && rest.chars().all(|c| c.is_ascii_alphabetic()) {
            if let Ok(n) = digits.parse::<u64>() {
                return Token::Suffixed(n, rest.to_uppercase());
            }
        }
    }
    Token::Word(trimmed.to_lowercase())
}

/// Why a row was not accepted as a booth row.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum RowRejection {
    Empty,
    Header { keyword: String },
    TooShort { found: usize, needed: usize },
    NoBoothId,
    BoothIdOutOfRange { value: u64 },
    NonNumericVote { token: String },
    ColumnCount { found: usize },
    VoteSumOutOfBand { sum: u64 },
    SummaryMismatch { declared: u64, computed: u64 },
}

impl RowRejection {
    /// A short stable name, used to aggregate the rejections in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            RowRejection::Empty => "empty",
            RowRejection::Header { .. } => "header",
            RowRejection::TooShort { .. } => "too_short",
            RowRejection::NoBoothId => "no_booth_id",
            RowRejection::BoothIdOutOfRange { .. } => "booth_id_out_of_range",
            RowRejection::NonNumericVote { .. } => "non_numeric_vote",
            RowRejection::ColumnCount { .. } => "column_count",
            RowRejection::VoteSumOutOfBand { .. } => "vote_sum_out_of_band",
            RowRejection::SummaryMismatch { .. } => "summary_mismatch",
        }
    }

    /// Headers and blank lines are expected in any document and do not count against it.
    fn is_structural(&self) -> bool {
        matches!(self, RowRejection::Empty | RowRejection::Header { .. })
    }
}

impl Display for RowRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowRejection::Empty => write!(f, "empty row"),
            RowRejection::Header { keyword } => write!(f, "header row (keyword '{}')", keyword),
            RowRejection::TooShort { found, needed } => {
                write!(f, "only {} numbers, at least {} needed", found, needed)
            }
            RowRejection::NoBoothId => write!(f, "no booth number found"),
            RowRejection::BoothIdOutOfRange { value } => {
                write!(f, "booth number {} out of range", value)
            }
            RowRejection::NonNumericVote { token } => {
                write!(f, "non numeric vote cell '{}'", token)
            }
            RowRejection::ColumnCount { found } => write!(f, "unexpected {} vote columns", found),
            RowRejection::VoteSumOutOfBand { sum } => {
                write!(f, "votes add up to {}, outside of the sanity band", sum)
            }
            RowRejection::SummaryMismatch { declared, computed } => write!(
                f,
                "declared total {} does not match the sum of votes {}",
                declared, computed
            ),
        }
    }
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Classification {
    Booth(BoothRow),
    Rejected(RowRejection),
}

/// The expected shape of the booth rows of one document.
///
/// It is inferred once per document and shared by all the rows.
#[derive(PartialEq, Debug, Clone)]
pub struct RowShape<'a> {
    pub column_count: RangeInclusive<usize>,
    pub layout: &'a SummaryLayout,
    pub rules: &'a ClassifierRules,
}

impl<'a> RowShape<'a> {
    /// OCR may drop a column or add a couple of spurious ones (electors, serial numbers).
    pub fn infer(
        num_candidates: usize,
        rules: &'a ClassifierRules,
        layout: &'a SummaryLayout,
    ) -> RowShape<'a> {
        let min = ((num_candidates + 1) / 2).max(1);
        RowShape {
            column_count: min..=(num_candidates + 2),
            layout,
            rules,
        }
    }
}

/// Classifies a single row.
pub fn classify_row(cells: &[String], index: usize, shape: &RowShape) -> Classification {
    match classify_row_inner(cells, index, shape) {
        Ok(row) => Classification::Booth(row),
        Err(rejection) => Classification::Rejected(rejection),
    }
}

fn classify_row_inner(
    cells: &[String],
    index: usize,
    shape: &RowShape,
) -> Result<BoothRow, RowRejection> {
    let rules = shape.rules;
    let mut tokens: Vec<Token> = cells.iter().map(|c| tokenize(c)).collect();
    // Ragged sheets pad the rows on the right.
    while tokens.last() == Some(&Token::Blank) {
        tokens.pop();
    }
    if tokens.is_empty() {
        return Err(RowRejection::Empty);
    }

    for t in tokens.iter() {
        if let Token::Word(w) = t {
            if rules.stoplist.iter().any(|kw| kw.as_ref() == w.as_str()) {
                return Err(RowRejection::Header { keyword: w.clone() });
            }
        }
    }

    let needed = *shape.column_count.start();
    let numeric = tokens
        .iter()
        .filter(|t| matches!(t, Token::Number(_) | Token::Suffixed(..) | Token::Dash))
        .count();
    if numeric < needed {
        return Err(RowRejection::TooShort {
            found: numeric,
            needed,
        });
    }

    // The booth number is the first number of the leading window that lies in range.
    let mut leading: Vec<u64> = Vec::new();
    let mut booth: Option<(usize, u64, Option<String>)> = None;
    for (pos, t) in tokens.iter().enumerate() {
        if leading.len() >= rules.booth_window {
            break;
        }
        let (n, suffix) = match t {
            Token::Number(n) => (*n, None),
            Token::Suffixed(n, s) => (*n, Some(s.clone())),
            _ => continue,
        };
        let in_range = u32::try_from(n)
            .map(|v| rules.booth_id_range.contains(&v))
            .unwrap_or(false);
        if in_range {
            booth = Some((pos, n, suffix));
            break;
        }
        leading.push(n);
    }
    let (booth_pos, booth_number, mut booth_suffix) = match (booth, leading.first()) {
        (Some(b), _) => b,
        (None, Some(first)) => return Err(RowRejection::BoothIdOutOfRange { value: *first }),
        (None, None) => return Err(RowRejection::NoBoothId),
    };

    // Between the booth number and the first vote: the suffix ("12 A") and station names.
    let mut pos = booth_pos + 1;
    while let Some(t) = tokens.get(pos) {
        match t {
            Token::Word(w) => {
                if pos == booth_pos + 1
                    && booth_suffix.is_none()
                    && w.len() <= 2
                    && w.chars().all(|c| c.is_ascii_alphabetic())
                {
                    booth_suffix = Some(w.to_uppercase());
                }
            }
            Token::Blank => {}
            _ => break,
        }
        pos += 1;
    }
    let booth_id = BoothId {
        number: booth_number as u32,
        suffix: booth_suffix,
    };

    // From the first vote on, every cell keeps its column.
    let mut rest: Vec<u64> = Vec::with_capacity(tokens.len() - pos);
    for t in tokens[pos..].iter() {
        match t {
            Token::Number(n) => rest.push(*n),
            Token::Blank | Token::Dash => rest.push(0),
            Token::Suffixed(n, s) => {
                return Err(RowRejection::NonNumericVote {
                    token: format!("{}{}", n, s),
                })
            }
            Token::Word(w) => return Err(RowRejection::NonNumericVote { token: w.clone() }),
        }
    }

    let width = shape.layout.width();
    if rest.len() < width + needed {
        return Err(RowRejection::TooShort {
            found: numeric,
            needed: leading.len() + 1 + width + needed,
        });
    }
    let (vote_cells, summary_cells) = rest.split_at(rest.len() - width);
    let votes: Vec<u64> = vote_cells.to_vec();

    if !shape.column_count.contains(&votes.len()) {
        return Err(RowRejection::ColumnCount { found: votes.len() });
    }

    let sum: u64 = votes.iter().sum();
    if !rules.vote_sum_band.contains(&sum) {
        return Err(RowRejection::VoteSumOutOfBand { sum });
    }

    let summary_value =
        |field: SummaryField| shape.layout.position(field).map(|p| summary_cells[p]);
    let declared_total = match summary_value(SummaryField::DeclaredTotal) {
        Some(declared) => {
            let tolerance = rules
                .abs_tolerance
                .max((rules.rel_tolerance * declared as f64).round() as u64);
            if declared.abs_diff(sum) > tolerance {
                return Err(RowRejection::SummaryMismatch {
                    declared,
                    computed: sum,
                });
            }
            declared
        }
        None => sum,
    };

    Ok(BoothRow {
        booth_id,
        raw_votes: votes,
        declared_total,
        rejected: summary_value(SummaryField::Rejected).unwrap_or(0),
        nota: summary_value(SummaryField::Nota).unwrap_or(0),
        source_row: SourceRow { index },
    })
}

/// The classified rows of a whole document.
#[derive(PartialEq, Debug, Clone)]
pub struct ClassifiedDocument {
    /// Unique booth ids, sorted by booth id.
    pub booths: Vec<BoothRow>,
    pub warnings: Vec<RowWarning>,
    pub rejections: BTreeMap<&'static str, usize>,
    /// Accepted rows over the rows that looked like data.
    pub row_coverage: f64,
    pub longest_rejected_run: usize,
    pub low_confidence: bool,
}

/// Classifies all the rows of a document and merges duplicate booths.
///
/// Duplicated booth ids come from pages scanned twice; the copy with the larger
/// declared total is kept since duplicate scans typically under-read.
pub fn classify_document(rows: &[Vec<String>], shape: &RowShape) -> ClassifiedDocument {
    let rules = shape.rules;
    let mut by_id: BTreeMap<BoothId, BoothRow> = BTreeMap::new();
    let mut warnings: Vec<RowWarning> = Vec::new();
    let mut rejections: BTreeMap<&'static str, usize> = BTreeMap::new();
    let mut data_rows = 0usize;
    let mut accepted_rows = 0usize;
    let mut current_run = 0usize;
    let mut longest_run = 0usize;

    for (index, cells) in rows.iter().enumerate() {
        match classify_row(cells, index, shape) {
            Classification::Booth(row) => {
                data_rows += 1;
                accepted_rows += 1;
                current_run = 0;
                debug!(
                    "classify_document: row {}: booth {} votes {:?}",
                    index, row.booth_id, row.raw_votes
                );
                if let Some(previous) = by_id.get(&row.booth_id) {
                    let message = format!(
                        "duplicate booth {} (rows {} and {}), keeping declared total {}",
                        row.booth_id,
                        previous.source_row.index,
                        index,
                        previous.declared_total.max(row.declared_total)
                    );
                    warn!("classify_document: {}", message);
                    warnings.push(RowWarning {
                        source_row: SourceRow { index },
                        message,
                    });
                    if row.declared_total <= previous.declared_total {
                        continue;
                    }
                }
                by_id.insert(row.booth_id.clone(), row);
            }
            Classification::Rejected(reason) => {
                *rejections.entry(reason.kind()).or_insert(0) += 1;
                if reason.is_structural() {
                    debug!("classify_document: row {}: skipped: {}", index, reason);
                    continue;
                }
                data_rows += 1;
                current_run += 1;
                longest_run = longest_run.max(current_run);
                warn!("classify_document: row {}: rejected: {}", index, reason);
                warnings.push(RowWarning {
                    source_row: SourceRow { index },
                    message: reason.to_string(),
                });
            }
        }
    }

    let row_coverage = if data_rows == 0 {
        0.0
    } else {
        accepted_rows as f64 / data_rows as f64
    };
    let low_confidence =
        row_coverage < rules.min_row_coverage || longest_run > rules.max_consecutive_rejections;
    if low_confidence {
        warn!(
            "classify_document: low confidence document: coverage {:.3}, longest rejected run {}",
            row_coverage, longest_run
        );
    }

    ClassifiedDocument {
        booths: by_id.into_values().collect(),
        warnings,
        rejections,
        row_coverage,
        longest_rejected_run: longest_run,
        low_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|s| s.to_string()).collect()
    }

    fn shape_for<'a>(
        n: usize,
        rules: &'a ClassifierRules,
        layout: &'a SummaryLayout,
    ) -> RowShape<'a> {
        RowShape::infer(n, rules, layout)
    }

    #[test]
    fn tokenize_cells() {
        assert_eq!(tokenize(" 1,234 "), Token::Number(1234));
        assert_eq!(tokenize("12A"), Token::Suffixed(12, "A".to_string()));
        assert_eq!(tokenize("12-w"), Token::Suffixed(12, "W".to_string()));
        assert_eq!(tokenize("12(W)"), Token::Suffixed(12, "W".to_string()));
        assert_eq!(tokenize("Total"), Token::Word("total".to_string()));
        assert_eq!(tokenize("S.No."), Token::Word("s.no".to_string()));
        assert_eq!(tokenize("  "), Token::Blank);
        assert_eq!(tokenize("-"), Token::Dash);
        assert_eq!(tokenize("--"), Token::Dash);
    }

    #[test]
    fn classify_standard_row() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(3, &rules, &layout);
        // leading 0, booth, 3 candidates, valid total, rejected, nota, total
        let r = row(&["0", "14", "300", "200", "50", "550", "2", "4", "556"]);
        match classify_row(&r, 3, &shape) {
            Classification::Booth(b) => {
                assert_eq!(b.booth_id, BoothId::plain(14));
                assert_eq!(b.raw_votes, vec![300, 200, 50]);
                assert_eq!(b.declared_total, 550);
                assert_eq!(b.source_row.index, 3);
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn classify_keeps_suffix() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(3, &rules, &layout);
        let r = row(&["12", "A", "Govt", "School", "300", "200", "50", "550", "2", "4", "556"]);
        match classify_row(&r, 0, &shape) {
            Classification::Booth(b) => {
                assert_eq!(b.booth_id, BoothId::with_suffix(12, "A"));
                assert_eq!(b.raw_votes, vec![300, 200, 50]);
                assert_eq!(b.declared_total, 550);
                assert_eq!(b.rejected, 2);
                assert_eq!(b.nota, 4);
            }
            x => panic!("unexpected {:?}", x),
        }
    }

    fn booth_votes(r: &[&str], shape: &RowShape) -> Vec<u64> {
        match classify_row(&row(r), 0, shape) {
            Classification::Booth(b) => b.raw_votes,
            x => panic!("unexpected {:?}", x),
        }
    }

    #[test]
    fn dash_and_blank_cells_are_zero_votes() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(4, &rules, &layout);
        let dashed = ["14", "300", "-", "200", "50", "550", "2", "4", "556"];
        assert_eq!(booth_votes(&dashed, &shape), vec![300, 0, 200, 50]);
        let blank = ["14", "300", "", "200", "50", "550", "2", "4", "556"];
        assert_eq!(booth_votes(&blank, &shape), vec![300, 0, 200, 50]);
        let station = ["14", "Govt School", "", "300", "200", "-", "50", "550", "2", "4", "556"];
        assert_eq!(booth_votes(&station, &shape), vec![300, 200, 0, 50]);
    }

    #[test]
    fn trailing_blank_cells_are_padding() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(3, &rules, &layout);
        let r = ["14", "300", "200", "50", "550", "2", "4", "556", "", ""];
        assert_eq!(booth_votes(&r, &shape), vec![300, 200, 50]);
    }

    #[test]
    fn rejects_text_among_votes() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(4, &rules, &layout);
        let r = row(&["14", "300", "x7", "200", "50", "550", "2", "4", "556"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::NonNumericVote {
                token: "x7".to_string()
            })
        );
        let r = row(&["14", "300", "20B", "200", "50", "550", "2", "4", "556"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::NonNumericVote {
                token: "20B".to_string()
            })
        );
    }

    #[test]
    fn rejects_rows_without_leading_number() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::none();
        let shape = shape_for(3, &rules, &layout);
        let r = row(&["-", "-", "-"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::NoBoothId)
        );
    }

    #[test]
    fn rejects_headers() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(3, &rules, &layout);
        let r = row(&["Polling", "Station", "No.", "1", "2", "3"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::Header {
                keyword: "polling".to_string()
            })
        );
    }

    #[test]
    fn rejects_row_outside_sanity_band() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::none();
        let shape = shape_for(3, &rules, &layout);
        let r = row(&["5", "30000", "15000", "5000"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::VoteSumOutOfBand { sum: 50000 })
        );
    }

    #[test]
    fn rejects_inconsistent_summary() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::total_only();
        let shape = shape_for(3, &rules, &layout);
        let ok = row(&["5", "300", "200", "50", "553", "1"]);
        assert!(matches!(
            classify_row(&ok, 0, &shape),
            Classification::Booth(_)
        ));
        let bad = row(&["5", "300", "200", "50", "900", "1"]);
        assert_eq!(
            classify_row(&bad, 0, &shape),
            Classification::Rejected(RowRejection::SummaryMismatch {
                declared: 900,
                computed: 550
            })
        );
    }

    #[test]
    fn rejects_booth_out_of_range() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::none();
        let shape = shape_for(3, &rules, &layout);
        let r = row(&["9001", "9002", "9003", "100", "200"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::BoothIdOutOfRange { value: 9001 })
        );
    }

    #[test]
    fn rejects_short_rows() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::standard();
        let shape = shape_for(6, &rules, &layout);
        let r = row(&["4", "100"]);
        assert_eq!(
            classify_row(&r, 0, &shape),
            Classification::Rejected(RowRejection::TooShort {
                found: 2,
                needed: 3
            })
        );
    }

    #[test]
    fn document_merges_duplicates_and_records_warnings() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::none();
        let shape = shape_for(2, &rules, &layout);
        let rows = vec![
            row(&["Booth", "Candidate", "A", "B"]),
            row(&["1", "100", "50"]),
            row(&["2", "120", "60"]),
            row(&["2", "125", "60"]),
            row(&["3", "40000", "10000"]),
        ];
        let doc = classify_document(&rows, &shape);
        assert_eq!(doc.booths.len(), 2);
        assert_eq!(doc.booths[1].raw_votes, vec![125, 60]);
        assert_eq!(doc.rejections.get("header"), Some(&1));
        assert_eq!(doc.rejections.get("vote_sum_out_of_band"), Some(&1));
        // One duplicate warning and one rejection warning.
        assert_eq!(doc.warnings.len(), 2);
        assert!(!doc.low_confidence);
    }

    #[test]
    fn document_with_mostly_garbage_is_low_confidence() {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::none();
        let shape = shape_for(2, &rules, &layout);
        let mut rows = vec![row(&["1", "100", "50"])];
        for _ in 0..5 {
            rows.push(row(&["1", "90000", "10"]));
        }
        let doc = classify_document(&rows, &shape);
        assert_eq!(doc.booths.len(), 1);
        assert!(doc.low_confidence);
        assert_eq!(doc.longest_rejected_run, 5);
    }

    // 30 good booths followed by a run of bad rows.
    fn document_with_rejected_run(run: usize) -> ClassifiedDocument {
        let rules = ClassifierRules::default();
        let layout = SummaryLayout::none();
        let shape = shape_for(2, &rules, &layout);
        let mut rows: Vec<Vec<String>> = (1..=30)
            .map(|i: u32| row(&[i.to_string().as_str(), "100", "50"]))
            .collect();
        for _ in 0..run {
            rows.push(row(&["1", "90000", "10"]));
        }
        classify_document(&rows, &shape)
    }

    #[test]
    fn long_rejected_run_is_low_confidence() {
        let doc = document_with_rejected_run(26);
        assert_eq!(doc.booths.len(), 30);
        assert!(doc.row_coverage >= 0.5);
        assert_eq!(doc.longest_rejected_run, 26);
        assert!(doc.low_confidence);
    }

    #[test]
    fn rejected_run_at_the_limit_is_tolerated() {
        let doc = document_with_rejected_run(25);
        assert!(doc.row_coverage >= 0.5);
        assert_eq!(doc.longest_rejected_run, 25);
        assert!(!doc.low_confidence);
    }
}

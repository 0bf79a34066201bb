//! Assignment of raw document columns to official candidates.
//!
//! The columns of a scanned document do not always follow the canonical candidate
//! order: a leading column may hold the number of electors, OCR may drop a column,
//! or the document may list candidates in ballot order rather than by votes. The only
//! reliable signal is the magnitude of each column, compared to the official totals.

use log::{debug, info};
use std::collections::BTreeMap;

use crate::config::*;

/// A partial injective function from raw column index to candidate index.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct ColumnMapping {
    by_column: BTreeMap<usize, usize>,
}

impl ColumnMapping {
    pub fn new() -> ColumnMapping {
        ColumnMapping::default()
    }

    /// The mapping of a document whose columns are exactly the candidates, in order.
    pub fn identity(num_candidates: usize) -> ColumnMapping {
        ColumnMapping {
            by_column: (0..num_candidates).map(|i| (i, i)).collect(),
        }
    }

    /// Adds a pair. Returns false (and changes nothing) if either side is already used.
    pub fn insert(&mut self, column: usize, candidate: usize) -> bool {
        if self.by_column.contains_key(&column) || self.column_for(candidate).is_some() {
            return false;
        }
        self.by_column.insert(column, candidate);
        true
    }

    pub fn candidate_for(&self, column: usize) -> Option<usize> {
        self.by_column.get(&column).cloned()
    }

    pub fn column_for(&self, candidate: usize) -> Option<usize> {
        self.by_column
            .iter()
            .find_map(|(col, cand)| if *cand == candidate { Some(*col) } else { None })
    }

    pub fn len(&self) -> usize {
        self.by_column.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_column.is_empty()
    }

    /// (column, candidate) pairs, by increasing column.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.by_column.iter().map(|(col, cand)| (*col, *cand))
    }

    /// Projects a raw vote vector onto the canonical candidate order.
    ///
    /// Unmapped columns are dropped, unmapped candidates get zero.
    pub fn remap(&self, raw_votes: &[u64], num_candidates: usize) -> Vec<u64> {
        let mut res = vec![0u64; num_candidates];
        for (col, cand) in self.pairs() {
            if let (Some(v), Some(slot)) = (raw_votes.get(col), res.get_mut(cand)) {
                *slot = *v;
            }
        }
        res
    }
}

/// The official total of one candidate, as seen by the matcher.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub struct OfficialTotal {
    pub candidate_index: usize,
    pub official_votes: u64,
}

impl OfficialTotal {
    pub fn from_candidates(candidates: &[Candidate]) -> Vec<OfficialTotal> {
        candidates
            .iter()
            .enumerate()
            .map(|(idx, c)| OfficialTotal {
                candidate_index: idx,
                official_votes: c.official_votes,
            })
            .collect()
    }
}

/// Sums every column over all the rows. Shorter rows contribute nothing to the
/// columns they do not have.
pub fn column_sums(rows: &[BoothRow]) -> Vec<u64> {
    let width = rows.iter().map(|r| r.raw_votes.len()).max().unwrap_or(0);
    let mut sums = vec![0u64; width];
    for r in rows.iter() {
        for (idx, v) in r.raw_votes.iter().enumerate() {
            sums[idx] += *v;
        }
    }
    sums
}

/// The ratio between the official and the extracted totals.
///
/// It absorbs systematic differences: postal votes missing from booth documents,
/// rows read twice.
pub fn compute_scale(column_sums: &[u64], official: &[OfficialTotal]) -> f64 {
    let extracted: u64 = column_sums.iter().sum();
    let expected: u64 = official.iter().map(|o| o.official_votes).sum();
    if extracted == 0 {
        1.0
    } else {
        expected as f64 / extracted as f64
    }
}

/// Greedy assignment, largest official total first.
///
/// Material candidates (above the floor) are matched first with the strict threshold,
/// then the minor ones with the loose threshold. Candidates without any official vote
/// are never matched.
pub fn match_columns(
    column_sums: &[u64],
    official: &[OfficialTotal],
    scale: f64,
    policy: &MatchPolicy,
) -> ColumnMapping {
    let mut order: Vec<usize> = (0..official.len()).collect();
    order.sort_by(|a, b| {
        official[*b]
            .official_votes
            .cmp(&official[*a].official_votes)
            .then(a.cmp(b))
    });

    let mut mapping = ColumnMapping::new();
    let mut used = vec![false; column_sums.len()];

    let material: Vec<usize> = order
        .iter()
        .filter(|pos| official[**pos].official_votes > policy.materiality_floor)
        .cloned()
        .collect();
    let minor: Vec<usize> = order
        .iter()
        .filter(|pos| {
            let v = official[**pos].official_votes;
            v > 0 && v <= policy.materiality_floor
        })
        .cloned()
        .collect();

    for (pass, positions, threshold) in [
        (1, material, policy.strict_threshold),
        (2, minor, policy.loose_threshold),
    ] {
        for pos in positions {
            let target = official[pos];
            if let Some((col, rel_error)) =
                find_column(column_sums, &used, target, pos, scale, policy.near_tie_ratio)
            {
                if rel_error <= threshold {
                    debug!(
                        "match_columns: pass {}: column {} -> candidate {} (official {}, rel error {:.4})",
                        pass, col, target.candidate_index, target.official_votes, rel_error
                    );
                    used[col] = true;
                    mapping.insert(col, target.candidate_index);
                } else {
                    debug!(
                        "match_columns: pass {}: candidate {} (official {}) left unmapped, best column {} has rel error {:.4}",
                        pass, target.candidate_index, target.official_votes, col, rel_error
                    );
                }
            }
        }
    }
    mapping
}

// The closest unused column, with ties resolved by ordinal position.
fn find_column(
    column_sums: &[u64],
    used: &[bool],
    target: OfficialTotal,
    position: usize,
    scale: f64,
    near_tie_ratio: f64,
) -> Option<(usize, f64)> {
    let expected = target.official_votes as f64;
    let distances: Vec<(usize, f64)> = column_sums
        .iter()
        .enumerate()
        .filter(|(col, _)| !used[*col])
        .map(|(col, s)| (col, (*s as f64 * scale - expected).abs()))
        .collect();
    let best = distances.iter().map(|(_, d)| *d).reduce(f64::min)?;
    let window = best + near_tie_ratio * expected;
    let (col, dist) = distances
        .iter()
        .filter(|(_, d)| *d <= window)
        .min_by(|(c1, d1), (c2, d2)| {
            c1.abs_diff(position)
                .cmp(&c2.abs_diff(position))
                .then(d1.total_cmp(d2))
                .then(c1.cmp(c2))
        })
        .cloned()?;
    Some((col, dist / expected))
}

/// Mean relative error of the mapped candidates, once scaled.
pub fn mapping_error(
    mapping: &ColumnMapping,
    column_sums: &[u64],
    official: &[OfficialTotal],
    scale: f64,
) -> f64 {
    let errors: Vec<f64> = official
        .iter()
        .filter_map(|o| {
            let col = mapping.column_for(o.candidate_index)?;
            let extracted = column_sums.get(col).cloned().unwrap_or(0) as f64 * scale;
            if o.official_votes == 0 {
                None
            } else {
                Some((extracted - o.official_votes as f64).abs() / o.official_votes as f64)
            }
        })
        .collect();
    if errors.is_empty() {
        f64::INFINITY
    } else {
        errors.iter().sum::<f64>() / errors.len() as f64
    }
}

/// Runs the matcher from several starting scales and keeps the best mapping.
///
/// The global scale is distorted when a non-candidate column (electors, serial numbers)
/// is captured, so a unit scale is tried too. Each start is refined once with the scale
/// of the mapped columns only. The best mapping has the most candidates, then the lowest
/// mean error.
pub fn best_mapping(
    column_sums: &[u64],
    official: &[OfficialTotal],
    policy: &MatchPolicy,
) -> (ColumnMapping, f64) {
    let global = compute_scale(column_sums, official);
    let mut best: Option<(ColumnMapping, f64, f64)> = None;
    for seed in [global, 1.0] {
        let first = match_columns(column_sums, official, seed, policy);
        let mut tries = vec![(first.clone(), seed)];
        let refined = mapped_scale(&first, column_sums, official);
        if let Some(s) = refined {
            if (s - seed).abs() > 1e-9 {
                tries.push((match_columns(column_sums, official, s, policy), s));
            }
        }
        for (mapping, scale) in tries {
            let err = mapping_error(&mapping, column_sums, official, scale);
            let better = match &best {
                None => true,
                Some((b, _, b_err)) => {
                    mapping.len() > b.len() || (mapping.len() == b.len() && err < *b_err)
                }
            };
            if better {
                best = Some((mapping, scale, err));
            }
        }
    }
    match best {
        Some((mapping, scale, err)) => {
            info!(
                "best_mapping: {} of {} candidates mapped over {} columns, scale {:.4}, mean error {:.4}",
                mapping.len(),
                official.len(),
                column_sums.len(),
                scale,
                err
            );
            (mapping, scale)
        }
        None => (ColumnMapping::new(), global),
    }
}

fn mapped_scale(
    mapping: &ColumnMapping,
    column_sums: &[u64],
    official: &[OfficialTotal],
) -> Option<f64> {
    let mut extracted = 0u64;
    let mut expected = 0u64;
    for o in official.iter() {
        if let Some(col) = mapping.column_for(o.candidate_index) {
            extracted += column_sums.get(col).cloned().unwrap_or(0);
            expected += o.official_votes;
        }
    }
    if extracted == 0 {
        None
    } else {
        Some(expected as f64 / extracted as f64)
    }
}

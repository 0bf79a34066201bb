//! Reconciliation of booth-level votes with the official totals.
//!
//! The official total of a candidate is the sum of the booth votes and of the
//! postal/absentee votes. Postal votes never appear in booth documents, so they are
//! derived here as the residual. The residual is never negative: over-extracted booth
//! votes are capped at the official total.

use log::{debug, error, info, warn};
use std::error::Error;
use std::fmt::Display;

use crate::config::*;

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ReconcileError {
    /// The booth totals and the candidates do not line up.
    LengthMismatch { booth_totals: usize, candidates: usize },
    /// A reconciled value breaks `booth + postal == total == official`, or a postal count
    /// would be negative. This is a programming error.
    InvariantViolation { candidate: String, message: String },
    /// The independently known segment totals exceed the total of the parent unit.
    InconsistentSegments { candidate: String, message: String },
}

impl Error for ReconcileError {}

impl Display for ReconcileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileError::LengthMismatch {
                booth_totals,
                candidates,
            } => write!(
                f,
                "{} booth totals for {} candidates",
                booth_totals, candidates
            ),
            ReconcileError::InvariantViolation { candidate, message } => {
                write!(f, "invariant violation for candidate {}: {}", candidate, message)
            }
            ReconcileError::InconsistentSegments { candidate, message } => {
                write!(f, "inconsistent segment totals for candidate {}: {}", candidate, message)
            }
        }
    }
}

/// Computes the postal component of every candidate.
///
/// Reconciling the booth votes of an already reconciled result gives back the same result.
pub fn reconcile(
    per_candidate_booth_total: &[u64],
    candidates: &[Candidate],
) -> Result<Vec<ReconciledCandidateResult>, ReconcileError> {
    if per_candidate_booth_total.len() != candidates.len() {
        return Err(ReconcileError::LengthMismatch {
            booth_totals: per_candidate_booth_total.len(),
            candidates: candidates.len(),
        });
    }

    let mut res: Vec<ReconciledCandidateResult> = Vec::with_capacity(candidates.len());
    for (c, booth) in candidates.iter().zip(per_candidate_booth_total.iter()) {
        let booth_votes = if *booth > c.official_votes {
            warn!(
                "reconcile: candidate {}: booth votes {} exceed the official total {}, capping",
                c.name, booth, c.official_votes
            );
            c.official_votes
        } else {
            *booth
        };
        let postal_votes = c.official_votes - booth_votes;
        debug!(
            "reconcile: candidate {}: booth {} postal {} total {}",
            c.name, booth_votes, postal_votes, c.official_votes
        );
        res.push(ReconciledCandidateResult {
            candidate: c.clone(),
            booth_votes,
            postal_votes,
            total: c.official_votes,
        });
    }
    check_invariants(&res, candidates)?;
    Ok(res)
}

/// Verifies `booth + postal == total == official` for every candidate and the grand total.
pub fn check_invariants(
    results: &[ReconciledCandidateResult],
    candidates: &[Candidate],
) -> Result<(), ReconcileError> {
    for (r, c) in results.iter().zip(candidates.iter()) {
        let sum = r.booth_votes.checked_add(r.postal_votes);
        if sum != Some(r.total) || r.total != c.official_votes {
            let message = format!(
                "booth {} + postal {} != total {} (official {})",
                r.booth_votes, r.postal_votes, r.total, c.official_votes
            );
            error!("check_invariants: candidate {}: {}", c.name, message);
            return Err(ReconcileError::InvariantViolation {
                candidate: c.name.clone(),
                message,
            });
        }
    }
    let official: u64 = candidates.iter().map(|c| c.official_votes).sum();
    let reconciled: u64 = results.iter().map(|r| r.total).sum();
    if results.len() != candidates.len() || official != reconciled {
        let message = format!(
            "grand total {} differs from the official grand total {}",
            reconciled, official
        );
        error!("check_invariants: {}", message);
        return Err(ReconcileError::InvariantViolation {
            candidate: "*".to_string(),
            message,
        });
    }
    Ok(())
}

/// Spreads a signed residual one unit at a time, lowest index first, wrapping around.
///
/// Decrements skip the slots already at zero. Returns the part of a negative residual
/// that could not be applied (zero in all other cases).
pub fn distribute_residual(values: &mut [u64], residual: i64) -> i64 {
    if residual == 0 || values.is_empty() {
        return residual;
    }
    if residual > 0 {
        let n = values.len() as u64;
        let r = residual as u64;
        for (idx, v) in values.iter_mut().enumerate() {
            *v += r / n + u64::from((idx as u64) < r % n);
        }
        return 0;
    }
    let mut remaining = residual.unsigned_abs();
    while remaining > 0 {
        let mut progressed = false;
        for v in values.iter_mut() {
            if remaining == 0 {
                break;
            }
            if *v > 0 {
                *v -= 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }
    -(remaining as i64)
}

/// Splits `total` proportionally to `weights`, truncating, then hands out what is left
/// with [`distribute_residual`] over the slots with a positive weight.
///
/// The result always sums to `total`.
pub fn apportion_postal(total: u64, weights: &[u64]) -> Vec<u64> {
    let aggregate: u128 = weights.iter().map(|w| *w as u128).sum();
    if weights.is_empty() {
        return vec![];
    }
    if aggregate == 0 {
        let mut res = vec![0u64; weights.len()];
        distribute_residual(&mut res, total as i64);
        return res;
    }
    let mut res: Vec<u64> = weights
        .iter()
        .map(|w| ((total as u128 * *w as u128) / aggregate) as u64)
        .collect();
    let assigned: u64 = res.iter().sum();
    let eligible: Vec<usize> = (0..weights.len()).filter(|i| weights[*i] > 0).collect();
    let mut shares: Vec<u64> = eligible.iter().map(|i| res[*i]).collect();
    distribute_residual(&mut shares, (total - assigned) as i64);
    for (i, s) in eligible.iter().zip(shares) {
        res[*i] = s;
    }
    res
}

/// Brings the booth rows in line with capped booth totals.
///
/// When the booth votes of a candidate were capped, the votes of every booth are scaled
/// down so that the rows add up to the reconciled booth total. Rows are in canonical
/// candidate order.
pub fn cap_booth_rows(
    booth_rows: &mut [BoothRow],
    reconciled: &[ReconciledCandidateResult],
) -> Result<(), ReconcileError> {
    for (cidx, r) in reconciled.iter().enumerate() {
        let column: Vec<u64> = booth_rows
            .iter()
            .map(|b| b.raw_votes.get(cidx).cloned().unwrap_or(0))
            .collect();
        let sum: u64 = column.iter().sum();
        if sum <= r.booth_votes {
            continue;
        }
        info!(
            "cap_booth_rows: candidate {}: scaling booth votes from {} down to {}",
            r.candidate.name, sum, r.booth_votes
        );
        let scaled = apportion_postal(r.booth_votes, &column);
        for (b, v) in booth_rows.iter_mut().zip(scaled) {
            if let Some(slot) = b.raw_votes.get_mut(cidx) {
                *slot = v;
            }
        }
        let after: u64 = booth_rows
            .iter()
            .map(|b| b.raw_votes.get(cidx).cloned().unwrap_or(0))
            .sum();
        if after != r.booth_votes {
            let message = format!(
                "booth rows add up to {} after capping, expected {}",
                after, r.booth_votes
            );
            error!("cap_booth_rows: candidate {}: {}", r.candidate.name, message);
            return Err(ReconcileError::InvariantViolation {
                candidate: r.candidate.name.clone(),
                message,
            });
        }
    }
    Ok(())
}

/// The booth totals of one segment of a larger unit (an assembly segment of a
/// parliamentary constituency), in the canonical order of the parent's candidates.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct SegmentBooths {
    pub unit_id: String,
    pub booth_totals: Vec<u64>,
    /// The official totals of the segment, when they are published separately.
    pub known_totals: Option<Vec<u64>>,
}

/// Splits the postal votes of a parent unit over its segments.
///
/// Segments with a known total receive `known - booth`. The postal votes left are
/// shared among the other segments in proportion to their booth votes for the
/// candidate. In every segment `booth + postal == total`, and when at least one
/// segment is not known, the segment totals add up to the parent total.
pub fn reconcile_segments(
    parent: &[Candidate],
    segments: &[SegmentBooths],
) -> Result<Vec<Vec<ReconciledCandidateResult>>, ReconcileError> {
    for s in segments.iter() {
        let lengths_ok = s.booth_totals.len() == parent.len()
            && s.known_totals
                .as_ref()
                .map(|k| k.len() == parent.len())
                .unwrap_or(true);
        if !lengths_ok {
            return Err(ReconcileError::LengthMismatch {
                booth_totals: s.booth_totals.len(),
                candidates: parent.len(),
            });
        }
    }

    let mut res: Vec<Vec<ReconciledCandidateResult>> =
        segments.iter().map(|_| Vec::with_capacity(parent.len())).collect();
    let unknown: Vec<usize> = (0..segments.len())
        .filter(|i| segments[*i].known_totals.is_none())
        .collect();

    for (cidx, c) in parent.iter().enumerate() {
        let mut booths: Vec<u64> = segments.iter().map(|s| s.booth_totals[cidx]).collect();
        let mut totals: Vec<u64> = vec![0; segments.len()];

        // Known segments first: each is reconciled against its own total.
        let mut known_sum = 0u64;
        for (sidx, s) in segments.iter().enumerate() {
            if let Some(known) = &s.known_totals {
                let k = known[cidx];
                booths[sidx] = booths[sidx].min(k);
                totals[sidx] = k;
                known_sum += k;
            }
        }
        if !unknown.is_empty() && known_sum > c.official_votes {
            let message = format!(
                "known segments add up to {}, more than the parent total {}",
                known_sum, c.official_votes
            );
            warn!("reconcile_segments: candidate {}: {}", c.name, message);
            return Err(ReconcileError::InconsistentSegments {
                candidate: c.name.clone(),
                message,
            });
        }

        if !unknown.is_empty() {
            let available = c.official_votes - known_sum;
            let unknown_booths: Vec<u64> = unknown.iter().map(|i| booths[*i]).collect();
            let unknown_booth_sum: u64 = unknown_booths.iter().sum();
            if unknown_booth_sum > available {
                // Over-extraction: the booth votes themselves are scaled down, no postal.
                let capped = apportion_postal(available, &unknown_booths);
                for (i, v) in unknown.iter().zip(capped) {
                    booths[*i] = v;
                    totals[*i] = v;
                }
            } else {
                let postal = apportion_postal(available - unknown_booth_sum, &unknown_booths);
                for (i, p) in unknown.iter().zip(postal) {
                    totals[*i] = booths[*i] + p;
                }
            }
            debug!(
                "reconcile_segments: candidate {}: segment totals {:?}",
                c.name, totals
            );
        } else if known_sum != c.official_votes {
            warn!(
                "reconcile_segments: candidate {}: known segments add up to {}, parent total is {}",
                c.name, known_sum, c.official_votes
            );
        }

        for (sidx, seg_res) in res.iter_mut().enumerate() {
            let candidate = Candidate {
                official_votes: totals[sidx],
                ..c.clone()
            };
            seg_res.push(ReconciledCandidateResult {
                candidate,
                booth_votes: booths[sidx],
                postal_votes: totals[sidx] - booths[sidx],
                total: totals[sidx],
            });
        }
    }

    for seg_res in res.iter() {
        let cands: Vec<Candidate> = seg_res.iter().map(|r| r.candidate.clone()).collect();
        check_invariants(seg_res, &cands)?;
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cands(votes: &[u64]) -> Vec<Candidate> {
        let entries: Vec<(String, String, u64)> = votes
            .iter()
            .enumerate()
            .map(|(i, v)| (format!("C{}", i), format!("P{}", i), *v))
            .collect();
        Candidate::ranked(&entries).unwrap()
    }

    fn row(id: u32, votes: Vec<u64>) -> BoothRow {
        BoothRow {
            booth_id: BoothId::plain(id),
            declared_total: votes.iter().sum(),
            raw_votes: votes,
            rejected: 0,
            nota: 0,
            source_row: SourceRow { index: id as usize },
        }
    }

    #[test]
    fn missing_candidate_is_fully_postal() {
        let c = cands(&[10_000, 8_000, 500]);
        let res = reconcile(&[9_950, 7_900, 0], &c).unwrap();
        assert_eq!(res[2].booth_votes, 0);
        assert_eq!(res[2].postal_votes, 500);
        assert_eq!(res[2].total, 500);
        assert_eq!(res[0].postal_votes, 50);
        assert_eq!(res[1].postal_votes, 100);
    }

    #[test]
    fn over_extraction_is_capped() {
        let c = cands(&[1_000]);
        let res = reconcile(&[1_200], &c).unwrap();
        assert_eq!(res[0].booth_votes, 1_000);
        assert_eq!(res[0].postal_votes, 0);
        assert_eq!(res[0].total, 1_000);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let c = cands(&[5_000, 3_000, 1_000, 10]);
        let first = reconcile(&[4_900, 3_100, 990, 0], &c).unwrap();
        let booths: Vec<u64> = first.iter().map(|r| r.booth_votes).collect();
        let second = reconcile(&booths, &c).unwrap();
        assert_eq!(first, second);
        for r in second.iter() {
            assert_eq!(r.booth_votes + r.postal_votes, r.total);
            assert_eq!(r.total, r.candidate.official_votes);
        }
    }

    #[test]
    fn length_mismatch_is_an_error() {
        let c = cands(&[5_000, 3_000]);
        assert!(matches!(
            reconcile(&[1], &c),
            Err(ReconcileError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn residual_goes_to_lowest_indices_first() {
        let mut v = vec![5, 5, 5];
        assert_eq!(distribute_residual(&mut v, 4), 0);
        assert_eq!(v, vec![7, 6, 6]);
        let mut v = vec![0, 2, 1];
        assert_eq!(distribute_residual(&mut v, -2), 0);
        assert_eq!(v, vec![0, 1, 0]);
        let mut v = vec![0, 1];
        assert_eq!(distribute_residual(&mut v, -3), -2);
        assert_eq!(v, vec![0, 0]);
    }

    #[test]
    fn apportion_postal_hits_the_total() {
        assert_eq!(apportion_postal(10, &[3, 3, 3]), vec![4, 3, 3]);
        assert_eq!(apportion_postal(7, &[0, 0]), vec![4, 3]);
        assert_eq!(apportion_postal(5, &[0, 10, 10]), vec![0, 3, 2]);
        assert_eq!(apportion_postal(0, &[1, 2]), vec![0, 0]);
    }

    #[test]
    fn capped_rows_add_up() {
        let c = cands(&[1_000, 900]);
        let mut rows = vec![
            row(1, vec![600, 300]),
            row(2, vec![400, 300]),
            row(3, vec![200, 200]),
        ];
        let res = reconcile(&[1_200, 800], &c).unwrap();
        cap_booth_rows(&mut rows, &res).unwrap();
        let first: Vec<u64> = rows.iter().map(|r| r.raw_votes[0]).collect();
        assert_eq!(first, vec![501, 333, 166]);
        let second: Vec<u64> = rows.iter().map(|r| r.raw_votes[1]).collect();
        assert_eq!(second, vec![300, 300, 200]);
    }

    #[test]
    fn segments_share_the_parent_postal_votes() {
        let parent = cands(&[1_000, 500]);
        let segments = vec![
            SegmentBooths {
                unit_id: "A".to_string(),
                booth_totals: vec![400, 200],
                known_totals: None,
            },
            SegmentBooths {
                unit_id: "B".to_string(),
                booth_totals: vec![500, 250],
                known_totals: None,
            },
        ];
        let res = reconcile_segments(&parent, &segments).unwrap();
        assert_eq!(res[0][0].postal_votes, 45);
        assert_eq!(res[1][0].postal_votes, 55);
        assert_eq!(res[0][1].postal_votes, 23);
        assert_eq!(res[1][1].postal_votes, 27);
        assert_eq!(res[0][0].total + res[1][0].total, 1_000);
        assert_eq!(res[0][1].total + res[1][1].total, 500);
    }

    #[test]
    fn known_segments_keep_their_total() {
        let parent = cands(&[1_000, 500]);
        let segments = vec![
            SegmentBooths {
                unit_id: "A".to_string(),
                booth_totals: vec![400, 200],
                known_totals: Some(vec![430, 215]),
            },
            SegmentBooths {
                unit_id: "B".to_string(),
                booth_totals: vec![500, 250],
                known_totals: None,
            },
        ];
        let res = reconcile_segments(&parent, &segments).unwrap();
        assert_eq!(res[0][0].postal_votes, 30);
        assert_eq!(res[0][1].postal_votes, 15);
        assert_eq!(res[1][0].total, 570);
        assert_eq!(res[1][1].total, 285);
    }

    #[test]
    fn known_segments_above_parent_are_rejected() {
        let parent = cands(&[100]);
        let segments = vec![
            SegmentBooths {
                unit_id: "A".to_string(),
                booth_totals: vec![50],
                known_totals: Some(vec![150]),
            },
            SegmentBooths {
                unit_id: "B".to_string(),
                booth_totals: vec![10],
                known_totals: None,
            },
        ];
        assert!(matches!(
            reconcile_segments(&parent, &segments),
            Err(ReconcileError::InconsistentSegments { .. })
        ));
    }
}

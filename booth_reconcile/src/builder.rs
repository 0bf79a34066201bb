use crate::{process_unit, CanonicalRecord, ExtractionError};

pub use crate::config::*;

/// A builder for assembling the rows of one unit.
///
/// ```
/// pub use booth_reconcile::builder::UnitBuilder;
/// pub use booth_reconcile::ExtractionRules;
/// # use booth_reconcile::ExtractionError;
///
/// let mut builder = UnitBuilder::new("AC-42").candidates(&[
///     ("Anna".to_string(), "P1".to_string(), 1210),
///     ("Bob".to_string(), "P2".to_string(), 605),
///     ("Clara".to_string(), "P3".to_string(), 330),
/// ])?;
///
/// builder.add_row(&["1", "400", "200", "100", "700", "3", "5", "708"]);
/// builder.add_row(&["2", "410", "205", "110", "725", "1", "2", "728"]);
/// builder.add_row(&["3", "390", "195", "115", "700", "0", "4", "704"]);
///
/// let record = builder.expected_booths(3).run(&ExtractionRules::default())?;
/// assert_eq!(record.results[0].postal_votes, 10);
///
/// # Ok::<(), ExtractionError>(())
/// ```
pub struct UnitBuilder {
    pub(crate) _unit_id: String,
    pub(crate) _candidates: Vec<Candidate>,
    pub(crate) _expected_booths: usize,
    pub(crate) _rows: Vec<Vec<String>>,
}

impl UnitBuilder {
    pub fn new(unit_id: &str) -> UnitBuilder {
        UnitBuilder {
            _unit_id: unit_id.to_string(),
            _candidates: Vec::new(),
            _expected_booths: 0,
            _rows: Vec::new(),
        }
    }

    /// Sets the authoritative `(name, party, official votes)` entries, in canonical order.
    pub fn candidates(self, entries: &[(String, String, u64)]) -> Result<UnitBuilder, ExtractionError> {
        let cands = Candidate::ranked(entries).map_err(ExtractionError::InvalidCandidates)?;
        Ok(UnitBuilder {
            _candidates: cands,
            ..self
        })
    }

    /// The number of booths the unit is known to have. Zero (the default) means unknown.
    pub fn expected_booths(self, count: usize) -> UnitBuilder {
        UnitBuilder {
            _expected_booths: count,
            ..self
        }
    }

    /// Adds a raw row, cell by cell.
    pub fn add_row(&mut self, cells: &[&str]) {
        self._rows.push(cells.iter().map(|s| s.to_string()).collect());
    }

    pub fn add_row_cells(&mut self, cells: Vec<String>) {
        self._rows.push(cells);
    }

    pub fn run(&self, rules: &ExtractionRules) -> Result<CanonicalRecord, ExtractionError> {
        process_unit(
            &self._unit_id,
            &self._rows,
            &self._candidates,
            self._expected_booths,
            rules,
        )
    }
}

// Primitives for reading CSV files.

use crate::form20::*;

/// Reads every line of a headerless CSV file. Lines may have any number of cells.
pub fn read_csv_rows(path: &str) -> Form20Result<Vec<Vec<String>>> {
    let rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .context(CsvOpenSnafu { path })?;
    let mut res: Vec<Vec<String>> = Vec::new();
    for (idx, line_r) in rdr.into_records().enumerate() {
        let lineno = idx + 1;
        let line = line_r.context(CsvLineParseSnafu { lineno })?;
        let cells: Vec<String> = line.iter().map(|s| s.to_string()).collect();
        debug!("read_csv_rows: lineno: {:?} row: {:?}", lineno, &cells);
        res.push(cells);
    }
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_has_ragged_rows() {
        let rows = read_csv_rows("tests/data/ac8_rows.csv").unwrap();
        assert_eq!(rows.len(), 14);
        assert_eq!(rows[0], vec!["Form", "20", "AC-8"]);
        assert_eq!(rows[1].len(), 8);
        assert_eq!(rows[2][1], "Primary School Block 1");
    }

    #[test]
    fn missing_file() {
        assert!(read_csv_rows("tests/data/does_not_exist.csv").is_err());
    }
}

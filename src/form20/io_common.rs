use std::path::{Path, PathBuf};

use crate::form20::*;

pub fn simplify_file_name(path: &str) -> Form20Result<String> {
    let stem = Path::new(path)
        .file_stem()
        .and_then(|s| s.to_str())
        .context(MissingFileNameSnafu { path })?;
    Ok(stem.to_string())
}

/// Paths in a configuration file are relative to the directory of that file.
pub fn resolve_path(root: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Integral floats (as produced by spreadsheets) are written without a decimal part.
pub fn float_cell(f: f64) -> String {
    if f.is_finite() && f >= 0.0 && f.fract() == 0.0 {
        format!("{}", f as u64)
    } else {
        f.to_string()
    }
}

pub fn json_cell(cell: &JSValue) -> Option<String> {
    match cell {
        JSValue::String(s) => Some(s.clone()),
        JSValue::Number(n) => match n.as_u64() {
            Some(x) => Some(x.to_string()),
            None => n.as_f64().map(float_cell),
        },
        JSValue::Null => Some(String::new()),
        _ => None,
    }
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEntry {
    pub name: String,
    pub party: Option<String>,
    #[serde(rename = "officialVotes")]
    pub official_votes: u64,
}

#[derive(Eq, PartialEq, Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum CandidateFile {
    Wrapped { candidates: Vec<CandidateEntry> },
    Bare(Vec<CandidateEntry>),
}

/// Reads the authoritative candidates of a unit, in the order of the file.
pub fn read_candidates(path: &str) -> Form20Result<Vec<Candidate>> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let parsed: CandidateFile =
        serde_json::from_str(&contents).context(ParsingJsonSnafu { path })?;
    let entries = match parsed {
        CandidateFile::Wrapped { candidates } => candidates,
        CandidateFile::Bare(l) => l,
    };
    let triples: Vec<(String, String, u64)> = entries
        .into_iter()
        .map(|e| (e.name, e.party.unwrap_or_default(), e.official_votes))
        .collect();
    let candidates = Candidate::ranked(&triples).context(InvalidCandidatesSnafu { path })?;
    debug!(
        "read_candidates: {}: {} candidates",
        path,
        candidates.len()
    );
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cells_from_json() {
        assert_eq!(json_cell(&json!("12A")), Some("12A".to_string()));
        assert_eq!(json_cell(&json!(402)), Some("402".to_string()));
        assert_eq!(json_cell(&json!(402.0)), Some("402".to_string()));
        assert_eq!(json_cell(&json!(null)), Some("".to_string()));
        assert_eq!(json_cell(&json!([1])), None);
    }

    #[test]
    fn relative_paths() {
        let root = Path::new("/data/batch");
        assert_eq!(
            resolve_path(root, "rows.csv"),
            PathBuf::from("/data/batch/rows.csv")
        );
        assert_eq!(resolve_path(root, "/abs/rows.csv"), PathBuf::from("/abs/rows.csv"));
        assert_eq!(simplify_file_name("/data/AC-7.json").unwrap(), "AC-7");
    }

    #[test]
    fn candidates_fixture() {
        let cands = read_candidates("tests/data/ac7_candidates.json").unwrap();
        assert_eq!(cands.len(), 4);
        assert_eq!(cands[0].name, "Anna");
        assert_eq!(cands[0].position, 1);
        assert_eq!(cands[3].official_votes, 0);
    }
}

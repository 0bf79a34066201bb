// Rows exported by the text layer in JSON.

use crate::form20::{io_common::json_cell, *};

/// Reads `{"rows": [[...], ...]}` or a bare array of rows.
pub fn read_json_rows(path: &str) -> Form20Result<Vec<Vec<String>>> {
    let contents = fs::read_to_string(path).context(OpeningJsonSnafu { path })?;
    let js: JSValue = serde_json::from_str(&contents).context(ParsingJsonSnafu { path })?;
    parse_json_rows(&js)
}

pub fn parse_json_rows(js: &JSValue) -> Form20Result<Vec<Vec<String>>> {
    let rows = match js {
        JSValue::Array(rows) => rows,
        JSValue::Object(obj) => match obj.get("rows") {
            Some(JSValue::Array(rows)) => rows,
            _ => whatever!("parse_json_rows: missing 'rows' array"),
        },
        _ => whatever!("parse_json_rows: expected an array of rows"),
    };
    let mut res: Vec<Vec<String>> = Vec::with_capacity(rows.len());
    for (lineno, row) in rows.iter().enumerate() {
        let cells = match row {
            JSValue::Array(cells) => cells,
            _ => whatever!("parse_json_rows: row {} is not an array", lineno),
        };
        let mut parsed: Vec<String> = Vec::with_capacity(cells.len());
        for cell in cells.iter() {
            match json_cell(cell) {
                Some(s) => parsed.push(s),
                None => whatever!("parse_json_rows: row {}: unexpected cell {}", lineno, cell),
            }
        }
        res.push(parsed);
    }
    debug!("parse_json_rows: {} rows", res.len());
    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrapped_and_bare_rows() {
        let wrapped = json!({"rows": [["1", 400, "Govt School"], []]});
        let rows = parse_json_rows(&wrapped).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["1", "400", "Govt School"]);
        assert!(rows[1].is_empty());

        let bare = json!([[1, 2.0]]);
        assert_eq!(parse_json_rows(&bare).unwrap(), vec![vec!["1", "2"]]);
    }

    #[test]
    fn bad_rows() {
        assert!(parse_json_rows(&json!({"lines": []})).is_err());
        assert!(parse_json_rows(&json!(["1", "2"])).is_err());
        assert!(parse_json_rows(&json!([[{"a": 1}]])).is_err());
    }

    #[test]
    fn fixture() {
        let rows = read_json_rows("tests/data/ac7_rows.json").unwrap();
        assert_eq!(rows.len(), 23);
    }
}

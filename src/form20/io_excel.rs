use calamine::DataType;

use crate::form20::{io_common::float_cell, *};

/// Reads the cells of the named worksheet, or of the first one.
pub fn read_excel_rows(path: &str, worksheet_name: Option<&str>) -> Form20Result<Vec<Vec<String>>> {
    let wrange = get_range(path, worksheet_name)?;
    let mut res: Vec<Vec<String>> = Vec::new();
    for (idx, row) in wrange.rows().enumerate() {
        let cells: Vec<String> = row.iter().map(excel_cell).collect();
        debug!("read_excel_rows: row {}: {:?}", idx, cells);
        res.push(cells);
    }
    Ok(res)
}

fn excel_cell(cell: &DataType) -> String {
    match cell {
        DataType::String(s) => s.clone(),
        DataType::Int(i) => i.to_string(),
        DataType::Float(f) => float_cell(*f),
        DataType::Bool(b) => b.to_string(),
        DataType::Empty => String::new(),
        x => {
            debug!("excel_cell: dropping cell {:?}", x);
            String::new()
        }
    }
}

fn get_range(path: &str, worksheet_name: Option<&str>) -> Form20Result<calamine::Range<DataType>> {
    debug!(
        "get_range: path: {:?} worksheet: {:?}",
        &path, &worksheet_name
    );
    let mut workbook: Xlsx<_> = open_workbook(path).context(OpeningExcelSnafu { path })?;

    let wrange = match worksheet_name {
        Some(name) => workbook
            .worksheet_range(name)
            .context(EmptyExcelSnafu { path })?
            .context(OpeningExcelSnafu { path })?,
        None => workbook
            .worksheet_range_at(0)
            .context(EmptyExcelSnafu { path })?
            .context(OpeningExcelSnafu { path })?,
    };
    Ok(wrange)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells() {
        assert_eq!(excel_cell(&DataType::Float(1234.0)), "1234");
        assert_eq!(excel_cell(&DataType::Int(7)), "7");
        assert_eq!(excel_cell(&DataType::String("12A".to_string())), "12A");
        assert_eq!(excel_cell(&DataType::Empty), "");
    }

    #[test]
    fn named_and_first_worksheet() {
        let path = "tests/data/two_sheets.xlsx";
        let rows = crate::form20::read_rows("xlsx", path, Some("Form20")).unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], vec!["Sl.No", "Polling Station", "Anna", "Bob", "Total"]);
        assert_eq!(rows[1], vec!["1", "School A", "421", "356", "777"]);
        // Missing cells are padded with empty strings.
        assert_eq!(rows[2], vec!["2", "School B", "422", "", "422"]);
        assert_eq!(rows[3][2], "12.5");
        assert_eq!(rows[3][3], "0");

        let first = crate::form20::read_rows("xlsx", path, None).unwrap();
        assert_eq!(first, vec![vec!["Form 20 AC-9".to_string()]]);

        let res = read_excel_rows(path, Some("Sheet9"));
        assert!(matches!(res, Err(Form20Error::EmptyExcel { .. })));
    }

    #[test]
    fn missing_workbook() {
        let res = read_excel_rows("tests/data/does_not_exist.xlsx", None);
        assert!(matches!(res, Err(Form20Error::OpeningExcel { .. })));
    }
}

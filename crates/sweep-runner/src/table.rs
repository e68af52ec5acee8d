use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use sweep_core::{is_safe_run_id, SweepError};

#[derive(Debug, Clone)]
pub struct ParameterTable {
    path: PathBuf,
    header: Vec<String>,
    records: Vec<Vec<String>>,
}

impl ParameterTable {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(SweepError::NotFound(path.to_path_buf()).into());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("opening parameter table {}", path.display()))?;

        let header: Vec<String> = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();
        validate_header(&header, path)?;

        let mut records = Vec::new();
        // a record of empty fields is still a row; the reader drops empty lines itself
        for record in reader.records() {
            let record =
                record.with_context(|| format!("reading records of {}", path.display()))?;
            records.push(record.iter().map(|f| f.to_string()).collect());
        }
        Ok(Self {
            path: path.to_path_buf(),
            header,
            records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    pub fn row_count(&self) -> usize {
        self.records.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.header.iter().any(|h| h == name)
    }

    pub fn require_column(&self, name: &str) -> Result<(), SweepError> {
        if self.has_column(name) {
            Ok(())
        } else {
            Err(SweepError::configuration(format!(
                "parameter table {} has no '{}' column",
                self.path.display(),
                name
            )))
        }
    }

    pub fn row(&self, index: usize) -> Result<TableRow<'_>, SweepError> {
        if index == 0 || index > self.records.len() {
            return Err(SweepError::configuration(format!(
                "row index {} out of range for {} (rows are 1..={})",
                index,
                self.path.display(),
                self.records.len()
            )));
        }
        Ok(TableRow {
            index,
            header: &self.header,
            cells: &self.records[index - 1],
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = TableRow<'_>> {
        self.records
            .iter()
            .enumerate()
            .map(move |(i, cells)| TableRow {
                index: i + 1,
                header: &self.header,
                cells,
            })
    }
}

fn validate_header(header: &[String], path: &Path) -> Result<(), SweepError> {
    if header.is_empty() || header.iter().all(|h| h.is_empty()) {
        return Err(SweepError::configuration(format!(
            "parameter table {} has no header row",
            path.display()
        )));
    }
    let mut seen = BTreeSet::new();
    for name in header {
        if name.is_empty() {
            return Err(SweepError::configuration(format!(
                "parameter table {} has an unnamed column",
                path.display()
            )));
        }
        if !seen.insert(name.as_str()) {
            return Err(SweepError::configuration(format!(
                "parameter table {} repeats column '{}'",
                path.display(),
                name
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct TableRow<'a> {
    pub index: usize,
    header: &'a [String],
    cells: &'a [String],
}

impl<'a> TableRow<'a> {
    pub fn get(&self, column: &str) -> Option<&'a str> {
        let cells: &'a [String] = self.cells;
        let pos = self.header.iter().position(|h| h == column)?;
        cells.get(pos).map(|s| s.as_str())
    }

    pub fn cells(&self) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        let header = self.header;
        let cells = self.cells;
        header
            .iter()
            .enumerate()
            .map(move |(i, h)| (h.as_str(), cells.get(i).map(|s| s.as_str()).unwrap_or("")))
    }

    pub fn parameter_cells(&self, id_column: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.cells().filter(move |(k, _)| *k != id_column)
    }

    pub fn run_id(&self, id_column: &str) -> Result<&'a str, SweepError> {
        if self.cells.len() > self.header.len() {
            return Err(SweepError::MalformedRow {
                row: self.index,
                reason: format!(
                    "{} fields but the header names {} columns",
                    self.cells.len(),
                    self.header.len()
                ),
            });
        }
        let id = self.get(id_column).unwrap_or("");
        if id.is_empty() {
            return Err(SweepError::MalformedRow {
                row: self.index,
                reason: format!("empty run identifier column '{}'", id_column),
            });
        }
        if !is_safe_run_id(id) {
            return Err(SweepError::MalformedRow {
                row: self.index,
                reason: format!("run identifier '{}' is not a plain directory name", id),
            });
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::fs;
    use sweep_core::ensure_dir;

    fn write_table(tag: &str, body: &str) -> (PathBuf, PathBuf) {
        let root = std::env::temp_dir().join(format!(
            "sweep_table_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("root");
        let path = root.join("t.csv");
        fs::write(&path, body).expect("write table");
        (root, path)
    }

    #[test]
    fn counts_data_rows_excluding_header_and_blank_lines() {
        let (root, path) = write_table(
            "count",
            "newrun_id,dustrate,cec\nr1,30,21.1\n\nr2,300,6.9\nr3,3000,6.9\n",
        );
        let table = ParameterTable::load(&path).expect("load");
        assert_eq!(table.row_count(), 3);
        let indices: Vec<usize> = table.rows().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(table.row(2).expect("row 2").get("dustrate"), Some("300"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn record_of_empty_fields_is_a_rejected_row() {
        let (root, path) =
            write_table("allempty", "newrun_id,dustrate\nrun_1,30\n,\nrun_3,3000\n");
        let table = ParameterTable::load(&path).expect("load");
        assert_eq!(table.row_count(), 3);
        let err = table.row(2).expect("row 2").run_id("newrun_id").expect_err("no id");
        assert!(matches!(err, SweepError::MalformedRow { row: 2, .. }));
        assert_eq!(table.row(3).expect("row 3").run_id("newrun_id").expect("id"), "run_3");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn row_zero_and_past_end_are_rejected() {
        let (root, path) = write_table("range", "newrun_id\nr1\n");
        let table = ParameterTable::load(&path).expect("load");
        assert!(table.row(0).is_err());
        assert!(table.row(2).is_err());
        assert!(table.row(1).is_ok());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn empty_identifier_is_a_malformed_row() {
        let (root, path) = write_table("emptyid", "newrun_id,dustrate\nr1,1\n,2\nr3,3\n");
        let table = ParameterTable::load(&path).expect("load");
        let err = table.row(2).expect("row").run_id("newrun_id").expect_err("empty id");
        match err {
            SweepError::MalformedRow { row, .. } => assert_eq!(row, 2),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(table.row(3).expect("row").run_id("newrun_id").expect("id"), "r3");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn short_records_read_missing_cells_as_empty() {
        let (root, path) = write_table("short", "newrun_id,dustrate,cec\nr1,30\n");
        let table = ParameterTable::load(&path).expect("load");
        let row = table.row(1).expect("row");
        let cells: Vec<(&str, &str)> = row.parameter_cells("newrun_id").collect();
        assert_eq!(cells, vec![("dustrate", "30"), ("cec", "")]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn duplicate_header_is_a_configuration_error() {
        let (root, path) = write_table("dup", "newrun_id,a,a\nr1,1,2\n");
        let err = ParameterTable::load(&path).expect_err("duplicate column");
        let sweep = err.downcast_ref::<SweepError>().expect("typed error");
        assert!(sweep.is_fatal());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn quoted_fields_keep_commas() {
        let (root, path) = write_table("quoted", "newrun_id,note\nr1,\"a, b\"\n");
        let table = ParameterTable::load(&path).expect("load");
        assert_eq!(table.row(1).expect("row").get("note"), Some("a, b"));
        let _ = fs::remove_dir_all(root);
    }
}

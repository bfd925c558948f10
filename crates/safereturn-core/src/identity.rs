//! Identity store — identifier → display name, loaded from a CSV or
//! spreadsheet table with a header row.

use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IDENTIFIER_HEADERS: [&str; 4] = ["inmate id", "id", "identifier", "person id"];
const NAME_HEADERS: [&str; 3] = ["name", "display name", "full name"];

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("identity table not found: {0}")]
    NotFound(PathBuf),
    #[error("unsupported identity table format: {0} (expected .csv, .xlsx, .xls or .ods)")]
    UnsupportedFormat(PathBuf),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("spreadsheet: {0}")]
    Spreadsheet(String),
    #[error("identity table has no header row")]
    MissingHeader,
    #[error("identity table has no {0} column")]
    MissingColumn(&'static str),
    #[error("row {row}: empty identifier")]
    EmptyIdentifier { row: usize },
    #[error("row {row}: duplicate identifier {identifier:?}")]
    DuplicateIdentifier { identifier: String, row: usize },
}

/// Human-readable metadata for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub identifier: String,
    pub display_name: String,
}

/// Read-only identifier → record map.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    records: BTreeMap<String, IdentityRecord>,
}

impl IdentityStore {
    /// Load the table at `path`; the format follows the file extension.
    pub fn load(path: &Path) -> Result<Self, IdentityError> {
        if !path.exists() {
            return Err(IdentityError::NotFound(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();

        let rows = match extension.as_str() {
            "csv" => read_csv_rows(path)?,
            "xlsx" | "xlsm" | "xls" | "ods" => read_sheet_rows(path)?,
            _ => return Err(IdentityError::UnsupportedFormat(path.to_path_buf())),
        };

        let store = Self::from_rows(rows)?;
        tracing::info!(path = %path.display(), identities = store.len(), "identity table loaded");
        Ok(store)
    }

    /// Build from raw table rows; the first row is the header.
    pub fn from_rows<I>(rows: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let mut rows = rows.into_iter();
        let header = rows.next().ok_or(IdentityError::MissingHeader)?;
        let id_col = find_column(&header, &IDENTIFIER_HEADERS)
            .ok_or(IdentityError::MissingColumn("identifier"))?;
        let name_col =
            find_column(&header, &NAME_HEADERS).ok_or(IdentityError::MissingColumn("name"))?;

        let mut records = Vec::new();
        // Row numbers are 1-based and count the header, as a spreadsheet shows them.
        for (i, row) in rows.enumerate() {
            let row_number = i + 2;
            let cell = |col: usize| row.get(col).map(|s| s.trim()).unwrap_or("");
            let identifier = cell(id_col);
            let display_name = cell(name_col);

            if identifier.is_empty() && display_name.is_empty() {
                continue;
            }
            if identifier.is_empty() {
                return Err(IdentityError::EmptyIdentifier { row: row_number });
            }
            if display_name.is_empty() {
                tracing::warn!(identifier, row = row_number, "identity row has an empty name");
            }

            records.push((
                row_number,
                IdentityRecord {
                    identifier: identifier.to_string(),
                    display_name: display_name.to_string(),
                },
            ));
        }

        Self::from_numbered(records)
    }

    /// Build from records already in memory.
    pub fn from_records<I>(records: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = IdentityRecord>,
    {
        Self::from_numbered(records.into_iter().enumerate().map(|(i, r)| (i + 1, r)))
    }

    fn from_numbered<I>(records: I) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = (usize, IdentityRecord)>,
    {
        let mut map = BTreeMap::new();
        for (row, record) in records {
            if map.contains_key(&record.identifier) {
                return Err(IdentityError::DuplicateIdentifier {
                    identifier: record.identifier,
                    row,
                });
            }
            map.insert(record.identifier.clone(), record);
        }
        Ok(Self { records: map })
    }

    pub fn get(&self, identifier: &str) -> Option<&IdentityRecord> {
        self.records.get(identifier)
    }

    pub fn display_name(&self, identifier: &str) -> Option<&str> {
        self.get(identifier).map(|r| r.display_name.as_str())
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.records.contains_key(identifier)
    }

    /// Records ordered by identifier.
    pub fn records(&self) -> impl Iterator<Item = &IdentityRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Name shown for an identifier that has photos but no table row.
pub fn placeholder_name(identifier: &str) -> String {
    format!("ID: {identifier} (name not found)")
}

fn normalize_header(header: &str) -> String {
    header.trim().to_lowercase().replace(['_', '-'], " ")
}

fn find_column(header: &[String], candidates: &[&str]) -> Option<usize> {
    let normalized: Vec<String> = header.iter().map(|h| normalize_header(h)).collect();
    candidates
        .iter()
        .find_map(|c| normalized.iter().position(|h| h == c))
}

fn read_csv_rows(path: &Path) -> Result<Vec<Vec<String>>, IdentityError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rows = Vec::new();
    for record in reader.records() {
        rows.push(record?.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

fn read_sheet_rows(path: &Path) -> Result<Vec<Vec<String>>, IdentityError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|e| IdentityError::Spreadsheet(e.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| IdentityError::Spreadsheet("workbook has no worksheets".into()))?
        .map_err(|e| IdentityError::Spreadsheet(e.to_string()))?;

    Ok(range
        .rows()
        .map(|row| row.iter().map(cell_to_string).collect())
        .collect())
}

/// Render a spreadsheet cell the way it reads on screen: whole floats lose
/// their `.0` so numeric ids match photo file stems.
fn cell_to_string(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::Error(e) => format!("{e:?}"),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn rows(data: &[&[&str]]) -> Vec<Vec<String>> {
        data.iter()
            .map(|r| r.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_from_rows_inmate_sheet_headers() {
        let store = IdentityStore::from_rows(rows(&[
            &["Inmate Id", "Name"],
            &["001", "Alice"],
            &["002", "Bob"],
        ]))
        .unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.display_name("001"), Some("Alice"));
        assert_eq!(store.display_name("003"), None);
    }

    #[test]
    fn test_from_rows_column_order_and_aliases() {
        let store = IdentityStore::from_rows(rows(&[
            &["Display_Name", "notes", "identifier"],
            &["Carol", "x", "C"],
        ]))
        .unwrap();
        assert_eq!(store.display_name("C"), Some("Carol"));
    }

    #[test]
    fn test_duplicate_identifier_is_error() {
        let err = IdentityStore::from_rows(rows(&[
            &["id", "name"],
            &["A", "Alice"],
            &["A", "Alicia"],
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            IdentityError::DuplicateIdentifier { ref identifier, row: 3 } if identifier == "A"
        ));
    }

    #[test]
    fn test_missing_columns_and_header() {
        assert!(matches!(
            IdentityStore::from_rows(rows(&[&["id", "age"]])),
            Err(IdentityError::MissingColumn("name"))
        ));
        assert!(matches!(
            IdentityStore::from_rows(Vec::new()),
            Err(IdentityError::MissingHeader)
        ));
    }

    #[test]
    fn test_blank_rows_skipped_but_blank_id_rejected() {
        let store =
            IdentityStore::from_rows(rows(&[&["id", "name"], &["A", "Alice"], &["", ""]])).unwrap();
        assert_eq!(store.len(), 1);

        let err = IdentityStore::from_rows(rows(&[&["id", "name"], &["", "Ghost"]])).unwrap_err();
        assert!(matches!(err, IdentityError::EmptyIdentifier { row: 2 }));
    }

    #[test]
    fn test_load_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.csv");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "Inmate Id,Name").unwrap();
        writeln!(f, "A, Alice ").unwrap();
        writeln!(f, "B,Bob").unwrap();
        drop(f);

        let store = IdentityStore::load(&path).unwrap();
        assert_eq!(store.display_name("A"), Some("Alice"));
        let ids: Vec<&str> = store.records().map(|r| r.identifier.as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    /// Write a single-sheet workbook; numeric cells are stored as numbers.
    fn write_xlsx(path: &Path, header: &[&str], rows: &[(f64, &str)]) {
        let mut workbook = rust_xlsxwriter::Workbook::new();
        let sheet = workbook.add_worksheet();
        for (col, title) in header.iter().enumerate() {
            sheet.write_string(0, col as u16, *title).unwrap();
        }
        for (i, (id, name)) in rows.iter().enumerate() {
            let row = i as u32 + 1;
            sheet.write_number(row, 0, *id).unwrap();
            sheet.write_string(row, 1, *name).unwrap();
        }
        workbook.save(path).unwrap();
    }

    #[test]
    fn test_load_xlsx_numeric_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.xlsx");
        write_xlsx(&path, &["Inmate Id", "Name"], &[(1.0, "Alice"), (1042.0, "Bob")]);

        let store = IdentityStore::load(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.display_name("1"), Some("Alice"));
        assert_eq!(store.display_name("1042"), Some("Bob"));
        assert_eq!(store.display_name("1.0"), None);
    }

    #[test]
    fn test_load_xlsx_duplicate_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sheet.xlsx");
        write_xlsx(&path, &["Inmate Id", "Name"], &[(7.0, "Alice"), (7.0, "Alicia")]);

        assert!(matches!(
            IdentityStore::load(&path),
            Err(IdentityError::DuplicateIdentifier { ref identifier, row: 3 }) if identifier == "7"
        ));
    }

    #[test]
    fn test_load_missing_and_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            IdentityStore::load(&dir.path().join("missing.csv")),
            Err(IdentityError::NotFound(_))
        ));

        let txt = dir.path().join("sheet.txt");
        std::fs::write(&txt, "id,name\n").unwrap();
        assert!(matches!(
            IdentityStore::load(&txt),
            Err(IdentityError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_cell_to_string_whole_float() {
        assert_eq!(cell_to_string(&Data::Float(1.0)), "1");
        assert_eq!(cell_to_string(&Data::Float(2.5)), "2.5");
        assert_eq!(cell_to_string(&Data::Int(7)), "7");
        assert_eq!(cell_to_string(&Data::Empty), "");
    }

    #[test]
    fn test_placeholder_name() {
        assert_eq!(placeholder_name("C"), "ID: C (name not found)");
    }
}

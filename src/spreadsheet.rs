use calamine::{Data, Reader, open_workbook_auto};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpreadsheetError {
    #[error("unsupported spreadsheet format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to open workbook: {0}")]
    Open(String),
    #[error("failed to read sheet `{sheet}`: {message}")]
    Sheet { sheet: String, message: String },
    #[error("reader task failed: {0}")]
    Task(String),
}

/// Raw cell value as found in the file.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    /// Text form of the cell; whole numbers render without a fractional part so a
    /// numeric `Model No.` such as `1045` stays `1045`.
    pub fn as_text(&self) -> String {
        match self {
            Cell::Text(value) => value.trim().to_string(),
            Cell::Number(value) if value.fract() == 0.0 && value.abs() < 1e15 => {
                format!("{}", *value as i64)
            }
            Cell::Number(value) => value.to_string(),
            Cell::Bool(value) => value.to_string(),
        }
    }
}

/// One spreadsheet line: header text mapped to its cell. Empty cells are absent.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRecord {
    pub sheet: String,
    pub line: usize,
    cells: BTreeMap<String, Cell>,
}

impl RowRecord {
    pub fn new(sheet: impl Into<String>, line: usize) -> Self {
        Self {
            sheet: sheet.into(),
            line,
            cells: BTreeMap::new(),
        }
    }

    pub fn with(mut self, header: &str, cell: Cell) -> Self {
        self.insert(header, cell);
        self
    }

    pub fn insert(&mut self, header: &str, cell: Cell) {
        let header = header.trim();
        if header.is_empty() {
            return;
        }
        if let Cell::Text(value) = &cell
            && value.trim().is_empty()
        {
            return;
        }
        self.cells.insert(header.to_string(), cell);
    }

    pub fn get(&self, header: &str) -> Option<&Cell> {
        self.cells.get(header)
    }

    /// Trimmed, non-empty text of a column.
    pub fn text(&self, header: &str) -> Option<String> {
        self.get(header)
            .map(Cell::as_text)
            .filter(|value| !value.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<RowRecord>,
}

/// Reads every sheet of a workbook (or a single CSV) in file order.
pub async fn read_workbook(path: &Path) -> Result<Vec<Sheet>, SpreadsheetError> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || read_workbook_blocking(&path))
        .await
        .map_err(|err| SpreadsheetError::Task(err.to_string()))?
}

pub fn read_workbook_blocking(path: &Path) -> Result<Vec<Sheet>, SpreadsheetError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "csv" => read_csv(path).map(|sheet| vec![sheet]),
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => read_excel(path),
        other => Err(SpreadsheetError::UnsupportedFormat(if other.is_empty() {
            path.display().to_string()
        } else {
            other.to_string()
        })),
    }
}

fn read_excel(path: &Path) -> Result<Vec<Sheet>, SpreadsheetError> {
    let mut workbook =
        open_workbook_auto(path).map_err(|err| SpreadsheetError::Open(err.to_string()))?;
    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|err| SpreadsheetError::Sheet {
                sheet: name.clone(),
                message: err.to_string(),
            })?;
        let grid = range
            .rows()
            .map(|row| row.iter().map(cell_from_data).collect::<Vec<_>>());
        sheets.push(Sheet {
            rows: rows_from_grid(&name, grid),
            name,
        });
    }
    Ok(sheets)
}

fn cell_from_data(data: &Data) -> Option<Cell> {
    match data {
        Data::Empty | Data::Error(_) => None,
        Data::String(value) => Some(Cell::Text(value.clone())),
        Data::Int(value) => Some(Cell::Number(*value as f64)),
        Data::Float(value) => Some(Cell::Number(*value)),
        Data::Bool(value) => Some(Cell::Bool(*value)),
        other => Some(Cell::Text(other.to_string())),
    }
}

fn read_csv(path: &Path) -> Result<Sheet, SpreadsheetError> {
    let name = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("Sheet1")
        .to_string();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|err| SpreadsheetError::Open(err.to_string()))?;
    let mut grid = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| SpreadsheetError::Sheet {
            sheet: name.clone(),
            message: err.to_string(),
        })?;
        grid.push(
            record
                .iter()
                .map(|value| {
                    let value = value.trim_start_matches('\u{feff}');
                    (!value.trim().is_empty()).then(|| Cell::Text(value.to_string()))
                })
                .collect::<Vec<_>>(),
        );
    }
    Ok(Sheet {
        rows: rows_from_grid(&name, grid.into_iter()),
        name,
    })
}

// First non-empty row is the header; fully empty rows after it are dropped.
fn rows_from_grid(sheet: &str, grid: impl Iterator<Item = Vec<Option<Cell>>>) -> Vec<RowRecord> {
    let mut headers: Option<Vec<String>> = None;
    let mut rows = Vec::new();
    for (index, cells) in grid.enumerate() {
        if cells.iter().all(Option::is_none) {
            continue;
        }
        let Some(header_row) = headers.as_ref() else {
            headers = Some(
                cells
                    .iter()
                    .map(|cell| cell.as_ref().map(Cell::as_text).unwrap_or_default())
                    .collect(),
            );
            continue;
        };
        let mut row = RowRecord::new(sheet, index + 1);
        for (header, cell) in header_row.iter().zip(cells) {
            if let Some(cell) = cell {
                row.insert(header, cell);
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
    }
    rows
}

//! Spreadsheet input: account records in file row order.
//!
//! Workbooks (`.xlsx`, `.xlsm`, `.xls`, `.ods`) are read with calamine, `.csv`
//! files with the csv crate. Both are first flattened into a [`Table`] of
//! strings so column lookup and row filtering behave identically.

use std::fmt;
use std::path::Path;

use calamine::{open_workbook_auto, Data, Reader};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ApproverError;

/// Processing state of one account record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
    Pending,
    Done,
    Failed,
}

/// One data row of the input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// 1-based position in the record sequence. Checkpoints refer to this.
    pub index: usize,
    /// 1-based spreadsheet row (the header is row 1), for reporting.
    pub row: usize,
    pub ou_id: String,
    pub account_name: String,
    pub status: RecordStatus,
}

impl AccountRecord {
    /// Normalized identity that survives rows being moved between runs.
    pub fn key(&self) -> String {
        row_key(&self.ou_id, &self.account_name)
    }
}

impl fmt::Display for AccountRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} (row {}, OU ID '{}', Account '{}')",
            self.index, self.row, self.ou_id, self.account_name
        )
    }
}

pub fn row_key(ou_id: &str, account_name: &str) -> String {
    format!(
        "{}||{}",
        ou_id.trim().to_lowercase(),
        account_name.trim().to_lowercase()
    )
}

/// Where the two required columns live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSpec {
    /// Worksheet to read. `None` selects the first sheet.
    pub sheet: Option<String>,
    pub ou_id_column: String,
    pub account_name_column: String,
}

impl Default for ColumnSpec {
    fn default() -> Self {
        Self {
            sheet: None,
            ou_id_column: "OU ID".to_string(),
            account_name_column: "Account Name".to_string(),
        }
    }
}

/// A header row plus data rows, every cell rendered as a string.
#[derive(Debug, Default)]
pub struct Table {
    pub header: Vec<String>,
    /// `(spreadsheet row number, cells)`
    pub rows: Vec<(usize, Vec<String>)>,
}

/// Load account records from `path`, preserving file row order.
pub fn read_records(path: &Path, columns: &ColumnSpec) -> Result<Vec<AccountRecord>, ApproverError> {
    if !path.is_file() {
        return Err(ApproverError::FileNotFound(path.to_path_buf()));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let table = match extension.as_str() {
        "csv" => read_csv(path)?,
        "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => read_workbook(path, columns.sheet.as_deref())?,
        other => {
            return Err(ApproverError::InputFormat(format!(
                "unsupported input extension '{other}' (expected .xlsx, .xls, .ods or .csv)"
            )))
        }
    };

    let records = records_from_table(table, columns)?;
    info!(path = %path.display(), count = records.len(), "Loaded account records");
    Ok(records)
}

/// Map a table onto account records. Rows with a blank OU ID are skipped.
pub fn records_from_table(table: Table, columns: &ColumnSpec) -> Result<Vec<AccountRecord>, ApproverError> {
    let ou_col = column_index(&table.header, &columns.ou_id_column)?;
    let name_col = column_index(&table.header, &columns.account_name_column)?;

    let mut records = Vec::new();
    for (row, cells) in table.rows {
        let ou_id = cells.get(ou_col).map(|c| c.trim()).unwrap_or_default();
        if ou_id.is_empty() {
            debug!(row, "Skipping row without OU ID");
            continue;
        }
        let account_name = cells.get(name_col).map(|c| c.trim()).unwrap_or_default();
        records.push(AccountRecord {
            index: records.len() + 1,
            row,
            ou_id: ou_id.to_string(),
            account_name: account_name.to_string(),
            status: RecordStatus::Pending,
        });
    }
    Ok(records)
}

fn column_index(header: &[String], name: &str) -> Result<usize, ApproverError> {
    header
        .iter()
        .position(|h| h.trim() == name.trim())
        .ok_or_else(|| {
            ApproverError::InputFormat(format!(
                "column '{name}' not found. Available columns: {header:?}"
            ))
        })
}

fn read_csv(path: &Path) -> Result<Table, ApproverError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| ApproverError::InputFormat(format!("cannot open CSV: {e}")))?;

    let header = reader
        .headers()
        .map_err(|e| ApproverError::InputFormat(format!("cannot read CSV header: {e}")))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record =
            result.map_err(|e| ApproverError::InputFormat(format!("bad CSV record: {e}")))?;
        let row = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(i + 2);
        rows.push((row, record.iter().map(str::to_string).collect()));
    }
    Ok(Table { header, rows })
}

fn read_workbook(path: &Path, sheet: Option<&str>) -> Result<Table, ApproverError> {
    let mut workbook = open_workbook_auto(path)
        .map_err(|e| ApproverError::InputFormat(format!("cannot open workbook: {e}")))?;

    let sheet_name = match sheet {
        Some(name) => name.to_string(),
        None => workbook
            .sheet_names()
            .first()
            .cloned()
            .ok_or_else(|| ApproverError::InputFormat("workbook has no sheets".into()))?,
    };

    let range = workbook
        .worksheet_range(&sheet_name)
        .map_err(|e| ApproverError::InputFormat(format!("cannot read sheet '{sheet_name}': {e}")))?;

    // The range begins at the first used cell, not necessarily A1.
    let first_row = range.start().map(|(r, _)| r as usize + 1).unwrap_or(1);

    let mut iter = range.rows();
    let header = match iter.next() {
        Some(cells) => cells.iter().map(render_cell).collect(),
        None => {
            return Err(ApproverError::InputFormat(format!(
                "sheet '{sheet_name}' is empty"
            )))
        }
    };

    let rows = iter
        .enumerate()
        .map(|(i, cells)| (first_row + i + 1, cells.iter().map(render_cell).collect()))
        .collect();

    Ok(Table { header, rows })
}

/// Whole-number floats print without the trailing `.0` a spreadsheet adds to IDs.
fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Float(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", *f as i64),
        other => other.to_string(),
    }
}

//! CSV readers for the reference datasets.
//!
//! Two shapes are understood: an operational readout table (one numeric
//! column per signal) used to derive envelopes, and a specification table
//! (one row per vehicle) used by the spec provider.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

/// Columns that identify a row rather than carry a signal.
pub const IDENTIFIER_COLUMNS: [&str; 4] = ["id", "vehicle_id", "vehicleId", "timestamp"];

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset not found: {0}")]
    NotFound(String),
    #[error("failed to read dataset {source_name}: {cause}")]
    Csv {
        source_name: String,
        #[source]
        cause: csv::Error,
    },
    #[error("dataset {0} has no numeric signal columns")]
    NoSignalColumns(String),
    #[error("dataset {0} has no rows")]
    Empty(String),
    #[error("dataset {0} has no usable rows")]
    NoUsableRows(String),
}

impl DatasetError {
    fn csv(source_name: &str, cause: csv::Error) -> Self {
        DatasetError::Csv {
            source_name: source_name.to_string(),
            cause,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalColumn {
    pub name: String,
    pub values: Vec<f64>,
}

/// Historical readouts, one column of samples per signal.
#[derive(Debug, Clone)]
pub struct OperationalDataset {
    source_name: String,
    rows_read: usize,
    columns: Vec<SignalColumn>,
}

enum Cell {
    Missing,
    Number(f64),
    Text,
}

fn classify(cell: &str) -> Cell {
    let cell = cell.trim();
    if cell.is_empty() || cell.eq_ignore_ascii_case("nan") || cell.eq_ignore_ascii_case("na") {
        return Cell::Missing;
    }
    match cell.parse::<f64>() {
        Ok(v) if v.is_finite() => Cell::Number(v),
        _ => Cell::Text,
    }
}

pub fn is_identifier_column(name: &str) -> bool {
    IDENTIFIER_COLUMNS.contains(&name.trim())
}

fn open(path: &Path) -> Result<File, DatasetError> {
    File::open(path).map_err(|_| DatasetError::NotFound(path.display().to_string()))
}

impl OperationalDataset {
    pub fn from_path(path: &Path, max_rows: Option<usize>) -> Result<Self, DatasetError> {
        let file = open(path)?;
        Self::from_reader(file, &path.display().to_string(), max_rows)
    }

    /// Parse operational readouts from any CSV source.
    ///
    /// Empty and `NaN` cells are skipped. A column holding any non-numeric
    /// cell is treated as descriptive and dropped.
    pub fn from_reader<R: Read>(
        reader: R,
        source_name: &str,
        max_rows: Option<usize>,
    ) -> Result<Self, DatasetError> {
        let mut reader = csv::Reader::from_reader(reader);
        let headers = reader
            .headers()
            .map_err(|e| DatasetError::csv(source_name, e))?
            .clone();

        let mut slots: Vec<Option<Vec<f64>>> = headers
            .iter()
            .map(|h| if is_identifier_column(h) { None } else { Some(Vec::new()) })
            .collect();

        let mut rows_read = 0usize;
        for record in reader.records() {
            if max_rows.is_some_and(|limit| rows_read >= limit) {
                break;
            }
            let record = record.map_err(|e| DatasetError::csv(source_name, e))?;
            rows_read += 1;

            for (slot, cell) in slots.iter_mut().zip(record.iter()) {
                let Some(values) = slot.as_mut() else {
                    continue;
                };
                match classify(cell) {
                    Cell::Missing => {}
                    Cell::Number(v) => values.push(v),
                    Cell::Text => *slot = None,
                }
            }
        }

        if rows_read == 0 {
            return Err(DatasetError::Empty(source_name.to_string()));
        }

        let columns: Vec<SignalColumn> = headers
            .iter()
            .zip(slots)
            .filter_map(|(name, slot)| {
                let values = slot?;
                if values.is_empty() {
                    debug!(column = name, "dropping column without samples");
                    return None;
                }
                Some(SignalColumn {
                    name: name.trim().to_string(),
                    values,
                })
            })
            .collect();

        if columns.is_empty() {
            return Err(DatasetError::NoSignalColumns(source_name.to_string()));
        }

        Ok(Self {
            source_name: source_name.to_string(),
            rows_read,
            columns,
        })
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn rows_read(&self) -> usize {
        self.rows_read
    }

    pub fn columns(&self) -> &[SignalColumn] {
        &self.columns
    }
}

/// One row of a descriptive table, keyed by column name.
pub type TableRow = BTreeMap<String, Value>;

fn cell_value(cell: &str) -> Option<Value> {
    let cell = cell.trim();
    if cell.is_empty() {
        return None;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Some(Value::from(int));
    }
    match cell.parse::<f64>() {
        Ok(float) if float.is_finite() => Some(Value::from(float)),
        _ => Some(Value::String(cell.to_string())),
    }
}

pub fn read_table_path(path: &Path) -> Result<Vec<TableRow>, DatasetError> {
    let file = open(path)?;
    read_table(file, &path.display().to_string())
}

/// Read a descriptive table. Integer and float cells become JSON numbers,
/// everything else stays a string; empty cells are omitted from the row.
pub fn read_table<R: Read>(reader: R, source_name: &str) -> Result<Vec<TableRow>, DatasetError> {
    let mut reader = csv::Reader::from_reader(reader);
    let headers = reader
        .headers()
        .map_err(|e| DatasetError::csv(source_name, e))?
        .clone();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| DatasetError::csv(source_name, e))?;
        let row: TableRow = headers
            .iter()
            .zip(record.iter())
            .filter_map(|(name, cell)| cell_value(cell).map(|v| (name.trim().to_string(), v)))
            .collect();
        rows.push(row);
    }

    if rows.is_empty() {
        return Err(DatasetError::Empty(source_name.to_string()));
    }
    Ok(rows)
}

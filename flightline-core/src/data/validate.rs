//! Shared validation helpers and the data quality report.

use crate::data::extract::TabularExtract;
use crate::data::schema::Cell;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Length of an IATA airport code.
pub const AIRPORT_CODE_LEN: usize = 3;

/// True when every cell of the row is missing.
pub fn row_is_empty(row: &[Cell]) -> bool {
    row.iter().all(Cell::is_null)
}

/// True for a text cell of exactly three characters.
pub fn is_airport_code(cell: &Cell) -> bool {
    cell.as_text()
        .is_some_and(|code| code.chars().count() == AIRPORT_CODE_LEN)
}

/// True when both cells hold the same text (a self-loop route).
pub fn is_same_airport(origin: &Cell, dest: &Cell) -> bool {
    match (origin.as_text(), dest.as_text()) {
        (Some(o), Some(d)) => o == d,
        _ => false,
    }
}

/// A data quality report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataQualityReport {
    pub total_rows: usize,
    pub total_columns: usize,
    pub null_percentage: BTreeMap<String, f64>,
    pub duplicate_rows: usize,
    pub empty_rows: usize,
    pub overall_score: f64,
}

impl DataQualityReport {
    /// Columns whose null share is above the given percentage.
    pub fn sparse_columns(&self, threshold_pct: f64) -> Vec<(&str, f64)> {
        self.null_percentage
            .iter()
            .filter(|(_, pct)| **pct > threshold_pct)
            .map(|(name, pct)| (name.as_str(), *pct))
            .collect()
    }
}

/// Profile an extract and produce a quality report.
pub fn profile_extract(extract: &TabularExtract) -> DataQualityReport {
    let total_rows = extract.row_count();
    let total_columns = extract.column_count();

    let mut null_percentage = BTreeMap::new();
    for (i, col) in extract.columns().iter().enumerate() {
        let nulls = extract
            .rows()
            .iter()
            .filter(|row| row.get(i).is_none_or(Cell::is_null))
            .count();
        let pct = if total_rows > 0 {
            nulls as f64 / total_rows as f64 * 100.0
        } else {
            0.0
        };
        null_percentage.insert(col.name.clone(), pct);
    }

    let mut seen = HashSet::new();
    let mut duplicate_rows = 0;
    let mut empty_rows = 0;
    for row in extract.rows() {
        if row_is_empty(row) {
            empty_rows += 1;
        }
        let key = serde_json::to_string(row).unwrap_or_default();
        if !seen.insert(key) {
            duplicate_rows += 1;
        }
    }

    let avg_null = if null_percentage.is_empty() {
        0.0
    } else {
        null_percentage.values().sum::<f64>() / null_percentage.len() as f64
    };
    let dup_penalty = if total_rows > 0 {
        duplicate_rows as f64 / total_rows as f64
    } else {
        0.0
    };
    let overall_score = (1.0 - avg_null / 100.0 - dup_penalty).clamp(0.0, 1.0);

    DataQualityReport {
        total_rows,
        total_columns,
        null_percentage,
        duplicate_rows,
        empty_rows,
        overall_score,
    }
}

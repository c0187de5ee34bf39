//! Tabular extract and the CSV extractor that produces it.

use crate::data::schema::{Cell, ColumnSchema, ColumnType};
use crate::error::ExtractError;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Field values the extractor reads as missing, in addition to the empty field.
pub const MISSING_TOKENS: &[&str] = &["NA", "N/A", "NaN", "nan", "null", "NULL", "None"];

/// Chunks between progress lines while reading in bounded batches.
const PROGRESS_EVERY_CHUNKS: usize = 10;

/// An ordered, rectangular table of named columns and cells.
///
/// Every row holds exactly one cell per column.
/// Serialized for reports only; cells are written as bare JSON scalars and
/// cannot be read back without their column types.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TabularExtract {
    columns: Vec<ColumnSchema>,
    rows: Vec<Vec<Cell>>,
}

impl TabularExtract {
    /// Build an extract, padding short rows with `Null`.
    ///
    /// Rows wider than the header are rejected.
    pub fn new(columns: Vec<ColumnSchema>, rows: Vec<Vec<Cell>>) -> Result<Self, ExtractError> {
        let width = columns.len();
        let mut rows = rows;
        for (i, row) in rows.iter_mut().enumerate() {
            if row.len() > width {
                return Err(ExtractError::Malformed {
                    line: i as u64 + 2,
                    expected: width,
                    found: row.len(),
                });
            }
            row.resize(width, Cell::Null);
        }
        Ok(Self { columns, rows })
    }

    pub fn empty(columns: Vec<ColumnSchema>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Build an all-text extract from raw string fields, applying the same
    /// missing-value rules as the CSV reader.
    pub fn from_text_rows<H, R, F>(headers: &[H], rows: R) -> Result<Self, ExtractError>
    where
        H: AsRef<str>,
        R: IntoIterator,
        R::Item: IntoIterator<Item = F>,
        F: AsRef<str>,
    {
        let columns = headers
            .iter()
            .map(|h| ColumnSchema::string(h.as_ref().trim()))
            .collect();
        let rows = rows
            .into_iter()
            .map(|row| row.into_iter().map(|f| parse_field(f.as_ref())).collect())
            .collect();
        Self::new(columns, rows)
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    /// Position of the first column with this name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell lookup by row index and column name.
    pub fn cell(&self, row: usize, column: &str) -> Option<&Cell> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    pub fn set_column_type(&mut self, idx: usize, dtype: ColumnType) {
        if let Some(col) = self.columns.get_mut(idx) {
            col.dtype = dtype;
        }
    }

    /// Rewrite every cell of one column in place.
    pub fn map_column(&mut self, idx: usize, mut f: impl FnMut(&Cell) -> Cell) {
        for row in &mut self.rows {
            if let Some(cell) = row.get_mut(idx) {
                *cell = f(cell);
            }
        }
    }

    /// Keep rows matching the predicate; returns how many were removed.
    pub fn retain_rows(&mut self, mut keep: impl FnMut(&[Cell]) -> bool) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| keep(row.as_slice()));
        before - self.rows.len()
    }

    /// Append a column whose value is computed from each existing row.
    pub fn push_column(&mut self, schema: ColumnSchema, mut derive: impl FnMut(&[Cell]) -> Cell) {
        for row in &mut self.rows {
            let value = derive(row.as_slice());
            row.push(value);
        }
        self.columns.push(schema);
    }

    /// Concatenate another extract with the same header below this one.
    pub fn append(&mut self, mut other: TabularExtract) {
        self.rows.append(&mut other.rows);
    }
}

/// Map a raw CSV field to a cell: missing tokens become `Null`, anything else
/// is kept as trimmed text.
pub fn parse_field(raw: &str) -> Cell {
    let trimmed = raw.trim();
    if trimmed.is_empty() || MISSING_TOKENS.contains(&trimmed) {
        Cell::Null
    } else {
        Cell::Text(trimmed.to_string())
    }
}

/// Reads a CSV file into a [`TabularExtract`].
///
/// With a read chunk size the file is consumed in bounded batches that are
/// concatenated before returning.
#[derive(Debug, Clone)]
pub struct CsvExtractor {
    pub path: PathBuf,
    pub delimiter: u8,
    pub read_chunk_size: Option<usize>,
}

impl CsvExtractor {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
            read_chunk_size: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        self.read_chunk_size = chunk_size.filter(|n| *n > 0);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extract(&self) -> Result<TabularExtract, ExtractError> {
        let metadata = std::fs::metadata(&self.path).map_err(|_| ExtractError::NotFound {
            path: self.path.clone(),
        })?;
        let size_mb = metadata.len() as f64 / (1024.0 * 1024.0);
        info!(path = %self.path.display(), size_mb = %format!("{size_mb:.2}"), "Loading data");

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| self.read_error(e))?;

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| self.read_error(e))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();
        if headers.is_empty() || headers.iter().all(|h| h.is_empty()) {
            return Err(ExtractError::MissingHeader {
                path: self.path.clone(),
            });
        }
        let headers = dedupe_headers(headers);
        let width = headers.len();
        let columns: Vec<ColumnSchema> = headers.into_iter().map(ColumnSchema::string).collect();

        let mut extract = TabularExtract::empty(columns.clone());
        let chunk_size = self.read_chunk_size.unwrap_or(usize::MAX);
        if let Some(n) = self.read_chunk_size {
            info!(chunk_size = n, "Reading data in chunks");
        }

        let mut record = csv::StringRecord::new();
        let mut chunk: Vec<Vec<Cell>> = Vec::new();
        let mut chunks_read = 0usize;
        loop {
            let more = reader
                .read_record(&mut record)
                .map_err(|e| self.read_error(e))?;
            if more {
                if record.len() > width {
                    return Err(ExtractError::Malformed {
                        line: record.position().map_or(0, |p| p.line()),
                        expected: width,
                        found: record.len(),
                    });
                }
                let mut row: Vec<Cell> = record.iter().map(parse_field).collect();
                row.resize(width, Cell::Null);
                chunk.push(row);
            }

            if chunk.len() >= chunk_size || (!more && !chunk.is_empty()) {
                let rows = std::mem::take(&mut chunk);
                extract.append(TabularExtract {
                    columns: columns.clone(),
                    rows,
                });
                chunks_read += 1;
                if self.read_chunk_size.is_some() && chunks_read % PROGRESS_EVERY_CHUNKS == 0 {
                    info!(rows = extract.row_count(), "Processed rows");
                }
            }

            if !more {
                break;
            }
        }

        info!(
            rows = extract.row_count(),
            columns = extract.column_count(),
            chunks = chunks_read,
            "Extracted rows from {}",
            self.path.display()
        );
        debug!(columns = ?extract.column_names(), "Extract columns");
        Ok(extract)
    }

    fn read_error(&self, err: csv::Error) -> ExtractError {
        ExtractError::Read {
            path: self.path.clone(),
            message: err.to_string(),
        }
    }
}

/// Rename repeated header names to `NAME.1`, `NAME.2`, ... so every column
/// is addressable. A generated name never collides with a later header.
fn dedupe_headers(headers: Vec<String>) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(headers.len());
    let reserved: HashSet<String> = headers.iter().cloned().collect();
    let mut out = Vec::with_capacity(headers.len());
    for name in headers {
        if taken.insert(name.clone()) {
            out.push(name);
            continue;
        }
        let renamed = (1..)
            .map(|n| format!("{name}.{n}"))
            .find(|candidate| !taken.contains(candidate) && !reserved.contains(candidate))
            .unwrap_or_default();
        warn!(column = %name, renamed = %renamed, "Duplicate column name renamed");
        taken.insert(renamed.clone());
        out.push(renamed);
    }
    out
}

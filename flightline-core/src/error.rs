//! Error types for the Flightline pipeline.
//!
//! Uses `thiserror` for public API error types with one enum per pipeline
//! domain (configuration, extraction, transformation, sink, load), aggregated
//! into [`EtlError`].

use std::path::PathBuf;

/// Top-level error type for the Flightline core library.
#[derive(Debug, thiserror::Error)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Extraction error: {0}")]
    Extract(#[from] ExtractError),

    #[error("Transformation error: {0}")]
    Transform(#[from] TransformError),

    #[error("Load error: {0}")]
    Load(#[from] LoadError),
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing database connection parameters: {}", vars.join(", "))]
    MissingDatabaseParams { vars: Vec<String> },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::ParseError {
            message: err.to_string(),
        }
    }
}

/// Errors from reading the CSV source.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("File not found at: {path}")]
    NotFound { path: PathBuf },

    #[error("Failed to read {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Malformed record at line {line}: expected {expected} fields, found {found}")]
    Malformed {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Source has no header row: {path}")]
    MissingHeader { path: PathBuf },
}

/// Errors from the transform engine.
///
/// Per-row data problems are never errors; they are filtered or coerced.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("No data to transform")]
    NoData,
}

/// Errors raised by a relational sink while talking to the database.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Liveness probe failed: {message}")]
    Probe { message: String },

    #[error("Write to '{table}' rejected: {message}")]
    Write { table: String, message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("{operation} timed out after {timeout_secs}s")]
    Timeout {
        operation: String,
        timeout_secs: u64,
    },

    #[error("Invalid identifier: {name:?}")]
    InvalidIdentifier { name: String },
}

impl From<rusqlite::Error> for SinkError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Query {
            message: err.to_string(),
        }
    }
}

impl From<tokio_postgres::Error> for SinkError {
    fn from(err: tokio_postgres::Error) -> Self {
        Self::Query {
            message: err.to_string(),
        }
    }
}

/// Errors from the chunked loader.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("No data to load")]
    NoData,

    #[error("Chunk size must be a positive integer, got {chunk_size}")]
    InvalidChunkSize { chunk_size: usize },

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("Could not open sink: {0}")]
    Connect(#[source] SinkError),

    #[error(
        "Batch {batch} of {total_batches} failed after {committed_rows} rows were committed; \
         table '{table}' is partially loaded: {source}"
    )]
    BatchFailed {
        table: String,
        batch: usize,
        total_batches: usize,
        committed_rows: usize,
        #[source]
        source: SinkError,
    },

    /// The batch was abandoned at its deadline. Rows it wrote may or may not
    /// have been committed.
    #[error(
        "Batch {batch} of {total_batches} did not finish within {timeout_secs}s; its outcome is \
         unknown and at least {committed_rows} rows were committed; table '{table}' may be \
         partially loaded"
    )]
    BatchTimedOut {
        table: String,
        batch: usize,
        total_batches: usize,
        committed_rows: usize,
        timeout_secs: u64,
    },

    #[error("Row count verification query failed: {0}")]
    Verify(#[source] SinkError),
}

/// A type alias for results using the top-level `EtlError`.
pub type Result<T> = std::result::Result<T, EtlError>;

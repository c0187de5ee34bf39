//! # flightline-core
//!
//! Flight-records ETL: a CSV extractor, a rule-based [`TransformEngine`] that
//! turns raw BTS on-time rows into an analysis-ready table, and a
//! [`ChunkedLoader`] that replaces a relational table batch by batch.
//!
//! The [`Pipeline`] sequences the three phases against one resolved
//! [`EtlConfig`].

pub mod config;
pub mod data;
pub mod error;
pub mod load;
pub mod pipeline;

// Re-exports
pub use config::{
    DatabaseConfig, DatabaseSettings, DbEngine, EtlConfig, load_config, load_config_or_default,
};
pub use data::{
    Cell, CleanedExtract, ColumnSchema, ColumnType, CsvExtractor, DataQualityReport, TabularExtract,
    TransformEngine, TransformReport,
};
pub use error::{ConfigError, EtlError, ExtractError, LoadError, SinkError, TransformError};
pub use load::{ChunkedLoader, LoadOptions, LoadReport, WriteMode, plan_batches};
pub use pipeline::{Phase, Pipeline, PipelineFailure, PipelineOutcome, PipelineReport, ProfileReport};

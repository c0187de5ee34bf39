//! Data stages: extraction, cleaning rules, and quality profiling.

pub mod extract;
pub mod schema;
pub mod transform;
pub mod validate;

pub use extract::{CsvExtractor, TabularExtract};
pub use schema::{Cell, ColumnSchema, ColumnType};
pub use transform::{
    CleanedExtract, CoercePolicy, DateField, NumericKind, Rule, StepRecord, TransformEngine,
    TransformReport,
};
pub use validate::{DataQualityReport, profile_extract};

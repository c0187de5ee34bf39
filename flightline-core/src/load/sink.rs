//! Sink traits and the SQL shared by the relational backends.

use crate::config::{DatabaseSettings, DbEngine};
use crate::data::schema::{Cell, ColumnSchema, ColumnType};
use crate::error::SinkError;
use crate::load::WriteMode;
use crate::load::postgres::PostgresSink;
use crate::load::sqlite::SqliteSink;
use async_trait::async_trait;

/// An open connection to a relational database, scoped to one load.
///
/// Dropping the sink releases the connection.
#[async_trait]
pub trait TableSink: Send {
    fn engine(&self) -> DbEngine;

    /// Liveness probe (`SELECT 1`).
    async fn ping(&mut self) -> Result<(), SinkError>;

    /// Write one batch in its own transaction. `Replace` drops and
    /// recreates the table first. Returns the number of rows inserted.
    async fn write_batch(
        &mut self,
        table: &str,
        columns: &[ColumnSchema],
        rows: &[Vec<Cell>],
        mode: WriteMode,
    ) -> Result<usize, SinkError>;

    /// `SELECT COUNT(*)` on the table.
    async fn count_rows(&mut self, table: &str) -> Result<u64, SinkError>;
}

/// Opens sinks from resolved settings.
#[async_trait]
pub trait SinkConnector: Send + Sync {
    async fn connect(&self, settings: &DatabaseSettings) -> Result<Box<dyn TableSink>, SinkError>;
}

/// Connector that dispatches on the configured engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverConnector;

#[async_trait]
impl SinkConnector for DriverConnector {
    async fn connect(&self, settings: &DatabaseSettings) -> Result<Box<dyn TableSink>, SinkError> {
        match settings {
            DatabaseSettings::Postgres { .. } => {
                let sink = PostgresSink::connect(&settings.connection_url()).await?;
                Ok(Box::new(sink))
            }
            DatabaseSettings::Sqlite { path } => {
                let sink = SqliteSink::open(path).await?;
                Ok(Box::new(sink))
            }
        }
    }
}

/// Quote an identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> Result<String, SinkError> {
    if name.trim().is_empty() || name.contains('\0') {
        return Err(SinkError::InvalidIdentifier {
            name: name.to_string(),
        });
    }
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

pub fn sql_type(engine: DbEngine, dtype: ColumnType) -> &'static str {
    match (engine, dtype) {
        (DbEngine::Postgres, ColumnType::Integer) => "BIGINT",
        (DbEngine::Postgres, ColumnType::Float) => "DOUBLE PRECISION",
        (DbEngine::Postgres, ColumnType::String) => "TEXT",
        (DbEngine::Postgres, ColumnType::Boolean) => "BOOLEAN",
        (DbEngine::Postgres, ColumnType::Date) => "DATE",
        (DbEngine::Sqlite, ColumnType::Integer | ColumnType::Boolean) => "INTEGER",
        (DbEngine::Sqlite, ColumnType::Float) => "REAL",
        (DbEngine::Sqlite, ColumnType::String | ColumnType::Date) => "TEXT",
    }
}

/// `DROP TABLE IF EXISTS` followed by `CREATE TABLE`, as one script.
pub fn replace_table_sql(
    engine: DbEngine,
    table: &str,
    columns: &[ColumnSchema],
) -> Result<String, SinkError> {
    let table = quote_ident(table)?;
    let defs = columns
        .iter()
        .map(|c| Ok(format!("{} {}", quote_ident(&c.name)?, sql_type(engine, c.dtype))))
        .collect::<Result<Vec<_>, SinkError>>()?;
    Ok(format!(
        "DROP TABLE IF EXISTS {table};\nCREATE TABLE {table} ({});",
        defs.join(", ")
    ))
}

/// Multi-row `INSERT` with engine-specific numbered placeholders.
pub fn insert_sql(
    engine: DbEngine,
    table: &str,
    columns: &[ColumnSchema],
    row_count: usize,
) -> Result<String, SinkError> {
    let names = columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Result<Vec<_>, _>>()?;
    let width = columns.len();
    let tuples: Vec<String> = (0..row_count)
        .map(|r| {
            let params: Vec<String> = (1..=width)
                .map(|c| match engine {
                    DbEngine::Postgres => format!("${}", r * width + c),
                    DbEngine::Sqlite => format!("?{}", r * width + c),
                })
                .collect();
            format!("({})", params.join(", "))
        })
        .collect();
    Ok(format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table)?,
        names.join(", "),
        tuples.join(", ")
    ))
}

pub fn count_sql(table: &str) -> Result<String, SinkError> {
    Ok(format!("SELECT COUNT(*) FROM {}", quote_ident(table)?))
}

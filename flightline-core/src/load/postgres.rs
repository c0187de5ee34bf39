//! PostgreSQL sink over `tokio-postgres`.

use crate::config::DbEngine;
use crate::data::schema::{Cell, ColumnSchema};
use crate::error::SinkError;
use crate::load::WriteMode;
use crate::load::sink::{TableSink, count_sql, insert_sql, replace_table_sql};
use async_trait::async_trait;
use bytes::BytesMut;
use std::error::Error;
use tokio::task::JoinHandle;
use tokio_postgres::types::{IsNull, ToSql, Type, to_sql_checked};
use tokio_postgres::{Client, NoTls};
use tracing::{debug, warn};

/// Bind parameters per statement are capped by the wire protocol.
const MAX_BIND_PARAMS: usize = 65_535;

/// Upper bound on rows in one multi-row `INSERT`.
const MAX_ROWS_PER_STATEMENT: usize = 1_000;

impl ToSql for Cell {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            Cell::Null => Ok(IsNull::Yes),
            Cell::Text(s) => s.to_sql(ty, out),
            _ if *ty == Type::TEXT => self.to_string().to_sql(ty, out),
            Cell::Bool(b) if *ty == Type::INT8 => i64::from(*b).to_sql(ty, out),
            Cell::Int(i) if *ty == Type::FLOAT8 => (*i as f64).to_sql(ty, out),
            Cell::Bool(b) => b.to_sql(ty, out),
            Cell::Int(i) => i.to_sql(ty, out),
            Cell::Float(f) => f.to_sql(ty, out),
            Cell::Date(d) => d.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Rows per `INSERT` for a table of the given width.
pub fn rows_per_statement(width: usize) -> usize {
    (MAX_BIND_PARAMS / width.max(1)).clamp(1, MAX_ROWS_PER_STATEMENT)
}

pub struct PostgresSink {
    client: Client,
    connection: JoinHandle<()>,
}

impl PostgresSink {
    pub async fn connect(url: &str) -> Result<Self, SinkError> {
        let (client, connection) =
            tokio_postgres::connect(url, NoTls)
                .await
                .map_err(|e| SinkError::Connection {
                    message: e.to_string(),
                })?;
        let connection = tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "PostgreSQL connection closed with error");
            }
        });
        debug!("PostgreSQL connection established");
        Ok(Self { client, connection })
    }
}

impl Drop for PostgresSink {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[async_trait]
impl TableSink for PostgresSink {
    fn engine(&self) -> DbEngine {
        DbEngine::Postgres
    }

    async fn ping(&mut self) -> Result<(), SinkError> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map(|_| ())
            .map_err(|e| SinkError::Probe {
                message: e.to_string(),
            })
    }

    async fn write_batch(
        &mut self,
        table: &str,
        columns: &[ColumnSchema],
        rows: &[Vec<Cell>],
        mode: WriteMode,
    ) -> Result<usize, SinkError> {
        let write_err = |e: tokio_postgres::Error| SinkError::Write {
            table: table.to_string(),
            message: e.to_string(),
        };
        let per_statement = rows_per_statement(columns.len());

        let tx = self.client.transaction().await.map_err(write_err)?;
        if mode == WriteMode::Replace {
            let script = replace_table_sql(DbEngine::Postgres, table, columns)?;
            tx.batch_execute(&script).await.map_err(write_err)?;
        }

        let mut written = 0;
        for group in rows.chunks(per_statement) {
            let sql = insert_sql(DbEngine::Postgres, table, columns, group.len())?;
            let params: Vec<&(dyn ToSql + Sync)> = group
                .iter()
                .flat_map(|row| row.iter().map(|cell| cell as &(dyn ToSql + Sync)))
                .collect();
            written += tx.execute(sql.as_str(), &params).await.map_err(write_err)? as usize;
        }
        tx.commit().await.map_err(write_err)?;
        Ok(written)
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, SinkError> {
        let sql = count_sql(table)?;
        let row = self.client.query_one(sql.as_str(), &[]).await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

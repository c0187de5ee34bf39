//! SQLite sink. rusqlite is blocking, so every call runs on tokio's
//! blocking pool against a shared connection.
//!
//! The blocking task outlives a dropped future, so a call abandoned by a
//! timeout cancels its task: the running statement is interrupted and a
//! pending transaction rolls back instead of committing late.

use crate::config::DbEngine;
use crate::data::schema::{Cell, ColumnSchema};
use crate::error::SinkError;
use crate::load::WriteMode;
use crate::load::sink::{TableSink, count_sql, insert_sql, replace_table_sql};
use async_trait::async_trait;
use rusqlite::{Connection, InterruptHandle};
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

impl rusqlite::ToSql for Cell {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Cell::Null => ToSqlOutput::Owned(Value::Null),
            Cell::Bool(b) => ToSqlOutput::Owned(Value::Integer(i64::from(*b))),
            Cell::Int(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            Cell::Float(f) => ToSqlOutput::Owned(Value::Real(*f)),
            Cell::Date(d) => ToSqlOutput::Owned(Value::Text(d.format("%Y-%m-%d").to_string())),
            Cell::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

pub struct SqliteSink {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    path: PathBuf,
}

/// Cancels a blocking call whose future is dropped before it finishes.
struct CancelOnDrop {
    cancelled: Arc<AtomicBool>,
    interrupt: Arc<InterruptHandle>,
    armed: bool,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.cancelled.store(true, Ordering::Release);
            self.interrupt.interrupt();
        }
    }
}

impl SqliteSink {
    pub async fn open(path: &Path) -> Result<Self, SinkError> {
        let owned = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || Connection::open(&owned))
            .await
            .map_err(|e| SinkError::Connection {
                message: format!("SQLite open task failed: {e}"),
            })?
            .map_err(|e| SinkError::Connection {
                message: format!("Failed to open {}: {e}", path.display()),
            })?;
        debug!(path = %path.display(), "Opened SQLite database");
        Ok(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn run<T, F>(&self, f: F) -> Result<T, SinkError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &AtomicBool) -> Result<T, SinkError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut cancel = CancelOnDrop {
            cancelled: Arc::clone(&cancelled),
            interrupt: Arc::clone(&self.interrupt),
            armed: true,
        };
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| SinkError::Connection {
                message: "SQLite connection lock poisoned".to_string(),
            })?;
            f(&mut *guard, &*cancelled)
        })
        .await;
        cancel.armed = false;
        result.map_err(|e| SinkError::Query {
            message: format!("SQLite task failed: {e}"),
        })?
    }
}

#[async_trait]
impl TableSink for SqliteSink {
    fn engine(&self) -> DbEngine {
        DbEngine::Sqlite
    }

    async fn ping(&mut self) -> Result<(), SinkError> {
        self.run(|conn, _| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(|e| SinkError::Probe {
                    message: e.to_string(),
                })
        })
        .await
    }

    async fn write_batch(
        &mut self,
        table: &str,
        columns: &[ColumnSchema],
        rows: &[Vec<Cell>],
        mode: WriteMode,
    ) -> Result<usize, SinkError> {
        let replace = match mode {
            WriteMode::Replace => Some(replace_table_sql(DbEngine::Sqlite, table, columns)?),
            WriteMode::Append => None,
        };
        let insert = insert_sql(DbEngine::Sqlite, table, columns, 1)?;
        let rows = rows.to_vec();
        let table = table.to_string();

        self.run(move |conn, cancelled| {
            let write_err = |e: rusqlite::Error| SinkError::Write {
                table: table.clone(),
                message: e.to_string(),
            };
            let abandoned = || {
                debug!(table = %table, "Batch abandoned by caller, rolling back");
                SinkError::Write {
                    table: table.clone(),
                    message: "batch abandoned before commit".to_string(),
                }
            };
            let tx = conn.transaction().map_err(write_err)?;
            if let Some(script) = &replace {
                tx.execute_batch(script).map_err(write_err)?;
            }
            {
                let mut stmt = tx.prepare(&insert).map_err(write_err)?;
                for row in &rows {
                    if cancelled.load(Ordering::Acquire) {
                        return Err(abandoned());
                    }
                    stmt.execute(rusqlite::params_from_iter(row.iter()))
                        .map_err(write_err)?;
                }
            }
            if cancelled.load(Ordering::Acquire) {
                return Err(abandoned());
            }
            tx.commit().map_err(write_err)?;
            Ok(rows.len())
        })
        .await
    }

    async fn count_rows(&mut self, table: &str) -> Result<u64, SinkError> {
        let sql = count_sql(table)?;
        self.run(move |conn, _| {
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(u64::try_from(count).unwrap_or_default())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::schema::ColumnType;
    use chrono::NaiveDate;

    fn columns() -> Vec<ColumnSchema> {
        vec![
            ColumnSchema::new("FL_DATE", ColumnType::Date),
            ColumnSchema::string("ORIGIN"),
            ColumnSchema::new("IS_WEEKEND", ColumnType::Boolean),
        ]
    }

    fn row(day: u32, origin: &str) -> Vec<Cell> {
        vec![
            Cell::Date(NaiveDate::from_ymd_opt(2023, 1, day).unwrap()),
            Cell::from(origin),
            Cell::Bool(day % 7 == 0),
        ]
    }

    #[tokio::test]
    async fn test_replace_then_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("flights.db")).await.unwrap();
        sink.ping().await.unwrap();

        let written = sink
            .write_batch("flights", &columns(), &[row(1, "JFK"), row(2, "LAX")], WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(written, 2);
        sink.write_batch("flights", &columns(), &[row(3, "ORD")], WriteMode::Append)
            .await
            .unwrap();
        assert_eq!(sink.count_rows("flights").await.unwrap(), 3);

        sink.write_batch("flights", &columns(), &[row(4, "ATL")], WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(sink.count_rows("flights").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failed_batch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("flights.db")).await.unwrap();
        sink.write_batch("flights", &columns(), &[row(1, "JFK")], WriteMode::Replace)
            .await
            .unwrap();

        let wide = vec![vec![Cell::Null, Cell::Null, Cell::Null, Cell::Null]];
        let err = sink
            .write_batch("flights", &columns(), &wide, WriteMode::Append)
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::Write { .. }));
        assert_eq!(sink.count_rows("flights").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_batch_never_commits() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("flights.db")).await.unwrap();
        sink.write_batch("flights", &columns(), &[row(1, "JFK")], WriteMode::Replace)
            .await
            .unwrap();

        let bulk: Vec<Vec<Cell>> = (0..200_000u32).map(|i| row(1 + i % 28, "SEA")).collect();
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            sink.write_batch("flights", &columns(), &bulk, WriteMode::Append),
        )
        .await;
        assert!(abandoned.is_err());

        // Waits on the connection lock until the cancelled task has rolled back.
        assert_eq!(sink.count_rows("flights").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_count_missing_table_is_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = SqliteSink::open(&dir.path().join("empty.db")).await.unwrap();
        let err = sink.count_rows("nope").await.unwrap_err();
        assert!(matches!(err, SinkError::Query { .. }));
    }
}

//! Chunked loading into a relational sink.
//!
//! A load replaces the target table with the first batch and appends the
//! rest strictly in order, each batch in its own transaction, then verifies
//! the row count.

pub mod postgres;
pub mod sink;
pub mod sqlite;

pub use sink::{DriverConnector, SinkConnector, TableSink};

use crate::config::{DatabaseConfig, DbEngine, EtlSettings};
use crate::data::extract::TabularExtract;
use crate::error::{ConfigError, LoadError, SinkError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How a batch treats the existing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Drop and recreate, then insert.
    Replace,
    Append,
}

impl fmt::Display for WriteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteMode::Replace => write!(f, "replace"),
            WriteMode::Append => write!(f, "append"),
        }
    }
}

/// One planned batch: a contiguous row range and its write mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    /// Zero-based position in the plan.
    pub index: usize,
    pub range: Range<usize>,
    pub mode: WriteMode,
}

impl BatchPlan {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split `total` rows into consecutive batches of at most `chunk_size`.
///
/// The first batch replaces, every later one appends. Zero rows or a zero
/// chunk size yield an empty plan.
pub fn plan_batches(total: usize, chunk_size: usize) -> Vec<BatchPlan> {
    if total == 0 || chunk_size == 0 {
        return Vec::new();
    }
    (0..total)
        .step_by(chunk_size)
        .enumerate()
        .map(|(index, start)| BatchPlan {
            index,
            range: start..(start + chunk_size).min(total),
            mode: if index == 0 {
                WriteMode::Replace
            } else {
                WriteMode::Append
            },
        })
        .collect()
}

/// Batch size and timeout budget for a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self::from(&EtlSettings::default())
    }
}

impl From<&EtlSettings> for LoadOptions {
    fn from(settings: &EtlSettings) -> Self {
        Self {
            chunk_size: settings.chunk_size,
            connect_timeout: settings.connect_timeout(),
            operation_timeout: settings.operation_timeout(),
        }
    }
}

/// Outcome of a successful load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    pub table: String,
    pub engine: DbEngine,
    pub rows_written: usize,
    pub batches: usize,
    /// Row count reported by the sink after the last batch.
    pub sink_rows: u64,
    /// Whether `sink_rows` matched the extract.
    pub verified: bool,
}

/// Writes extracts to the configured database in bounded batches.
pub struct ChunkedLoader {
    database: DatabaseConfig,
    options: LoadOptions,
    connector: Arc<dyn SinkConnector>,
}

impl ChunkedLoader {
    pub fn new(database: DatabaseConfig, options: LoadOptions) -> Self {
        Self {
            database,
            options,
            connector: Arc::new(DriverConnector),
        }
    }

    /// Replace how sinks are opened.
    pub fn with_connector(mut self, connector: Arc<dyn SinkConnector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.options
    }

    /// Load an extract into `table`, replacing its contents.
    ///
    /// Preconditions and credentials are checked before any connection is
    /// attempted. A failed batch leaves earlier batches committed and the
    /// error reports how many rows that is. A batch that times out is
    /// abandoned; its error gives the committed rows as a lower bound.
    pub async fn load(
        &self,
        extract: Option<&TabularExtract>,
        table: &str,
    ) -> Result<LoadReport, LoadError> {
        let extract = extract.filter(|e| !e.is_empty()).ok_or(LoadError::NoData)?;
        let chunk_size = self.options.chunk_size;
        if chunk_size == 0 {
            return Err(LoadError::InvalidChunkSize { chunk_size });
        }
        sink::quote_ident(table).map_err(|e| ConfigError::Invalid {
            message: e.to_string(),
        })?;
        let settings = self.database.resolve()?;

        info!(url = %settings.redacted_url(), "Connecting to database");
        let connect_budget = self.options.connect_timeout;
        let mut sink = with_timeout("connect", connect_budget, self.connector.connect(&settings))
            .await
            .map_err(LoadError::Connect)?;
        with_timeout("liveness probe", connect_budget, sink.ping())
            .await
            .map_err(LoadError::Connect)?;

        let total_rows = extract.row_count();
        let plan = plan_batches(total_rows, chunk_size);
        let total_batches = plan.len();
        if total_batches > 1 {
            info!(total_rows, chunk_size, total_batches, "Loading data in chunks");
        }

        let mut committed_rows = 0;
        for batch in &plan {
            let rows = &extract.rows()[batch.range.clone()];
            let written = with_timeout(
                "batch write",
                self.options.operation_timeout,
                sink.write_batch(table, extract.columns(), rows, batch.mode),
            )
            .await
            .map_err(|source| match source {
                SinkError::Timeout { timeout_secs, .. } => LoadError::BatchTimedOut {
                    table: table.to_string(),
                    batch: batch.index + 1,
                    total_batches,
                    committed_rows,
                    timeout_secs,
                },
                source => LoadError::BatchFailed {
                    table: table.to_string(),
                    batch: batch.index + 1,
                    total_batches,
                    committed_rows,
                    source,
                },
            })?;
            committed_rows += written;
            info!(
                batch = batch.index + 1,
                total_batches,
                mode = %batch.mode,
                rows = written,
                committed_rows,
                "Loaded batch"
            );
        }

        let sink_rows = with_timeout(
            "row count",
            self.options.operation_timeout,
            sink.count_rows(table),
        )
        .await
        .map_err(LoadError::Verify)?;
        let verified = sink_rows == total_rows as u64;
        if verified {
            info!(table, rows = sink_rows, "Verified row count");
        } else {
            warn!(
                table,
                expected = total_rows,
                actual = sink_rows,
                "Row count mismatch after load"
            );
        }

        Ok(LoadReport {
            table: table.to_string(),
            engine: sink.engine(),
            rows_written: committed_rows,
            batches: total_batches,
            sink_rows,
            verified,
        })
    }
}

async fn with_timeout<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, SinkError>>,
) -> Result<T, SinkError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| SinkError::Timeout {
            operation: operation.to_string(),
            timeout_secs: limit.as_secs(),
        })?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseSettings;
    use crate::data::schema::{Cell, ColumnSchema};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    struct Recorded {
        rows: usize,
        mode: WriteMode,
    }

    #[derive(Default)]
    struct Recording {
        connects: usize,
        batches: Vec<Recorded>,
        stored: usize,
    }

    /// In-memory sink that records every call. `fail_on` makes that
    /// 1-based batch fail; `lose_rows` under-reports the final count.
    #[derive(Clone, Default)]
    struct RecordingConnector {
        state: Arc<Mutex<Recording>>,
        fail_on: Option<usize>,
        lose_rows: u64,
        slow_probe: bool,
        /// 1-based batch that commits only after a delay.
        slow_batch: Option<usize>,
    }

    struct RecordingSink {
        connector: RecordingConnector,
    }

    #[async_trait]
    impl SinkConnector for RecordingConnector {
        async fn connect(
            &self,
            _settings: &DatabaseSettings,
        ) -> Result<Box<dyn TableSink>, SinkError> {
            self.state.lock().unwrap().connects += 1;
            Ok(Box::new(RecordingSink {
                connector: self.clone(),
            }))
        }
    }

    #[async_trait]
    impl TableSink for RecordingSink {
        fn engine(&self) -> DbEngine {
            DbEngine::Sqlite
        }

        async fn ping(&mut self) -> Result<(), SinkError> {
            if self.connector.slow_probe {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(())
        }

        async fn write_batch(
            &mut self,
            table: &str,
            _columns: &[ColumnSchema],
            rows: &[Vec<Cell>],
            mode: WriteMode,
        ) -> Result<usize, SinkError> {
            let next = self.connector.state.lock().unwrap().batches.len() + 1;
            if self.connector.slow_batch == Some(next) {
                // The commit lands after the caller has stopped waiting.
                let state = Arc::clone(&self.connector.state);
                let rows = rows.len();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    let mut state = state.lock().unwrap();
                    state.stored += rows;
                    state.batches.push(Recorded {
                        rows,
                        mode: WriteMode::Append,
                    });
                });
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            let mut state = self.connector.state.lock().unwrap();
            if self.connector.fail_on == Some(state.batches.len() + 1) {
                return Err(SinkError::Write {
                    table: table.to_string(),
                    message: "constraint violated".into(),
                });
            }
            if mode == WriteMode::Replace {
                state.stored = 0;
            }
            state.stored += rows.len();
            state.batches.push(Recorded {
                rows: rows.len(),
                mode,
            });
            Ok(rows.len())
        }

        async fn count_rows(&mut self, _table: &str) -> Result<u64, SinkError> {
            let stored = self.connector.state.lock().unwrap().stored as u64;
            Ok(stored.saturating_sub(self.connector.lose_rows))
        }
    }

    fn sqlite_db() -> DatabaseConfig {
        DatabaseConfig {
            engine: DbEngine::Sqlite,
            name: Some("unused.db".into()),
            ..Default::default()
        }
    }

    fn extract(rows: usize) -> TabularExtract {
        let data: Vec<Vec<String>> = (0..rows).map(|i| vec![i.to_string()]).collect();
        TabularExtract::from_text_rows(&["FL_NUMBER"], data).unwrap()
    }

    fn loader(connector: &RecordingConnector, chunk_size: usize) -> ChunkedLoader {
        ChunkedLoader::new(
            sqlite_db(),
            LoadOptions {
                chunk_size,
                ..Default::default()
            },
        )
        .with_connector(Arc::new(connector.clone()))
    }

    #[test]
    fn test_plan_single_batch_when_chunk_covers_rows() {
        let plan = plan_batches(10, 10);
        assert_eq!(
            plan,
            vec![BatchPlan {
                index: 0,
                range: 0..10,
                mode: WriteMode::Replace
            }]
        );
    }

    #[test]
    fn test_plan_splits_replace_then_append() {
        let plan = plan_batches(25_000, 10_000);
        let shape: Vec<(usize, WriteMode)> = plan.iter().map(|b| (b.len(), b.mode)).collect();
        assert_eq!(
            shape,
            vec![
                (10_000, WriteMode::Replace),
                (10_000, WriteMode::Append),
                (5_000, WriteMode::Append),
            ]
        );
        assert_eq!(plan[2].range, 20_000..25_000);
    }

    #[test]
    fn test_plan_degenerate_inputs() {
        assert!(plan_batches(0, 10).is_empty());
        assert!(plan_batches(10, 0).is_empty());
    }

    #[tokio::test]
    async fn test_load_writes_batches_in_order() {
        let connector = RecordingConnector::default();
        let report = loader(&connector, 10_000)
            .load(Some(&extract(25_000)), "flights")
            .await
            .unwrap();

        assert_eq!(report.rows_written, 25_000);
        assert_eq!(report.batches, 3);
        assert_eq!(report.sink_rows, 25_000);
        assert!(report.verified);

        let state = connector.state.lock().unwrap();
        assert_eq!(state.connects, 1);
        assert_eq!(
            state.batches,
            vec![
                Recorded {
                    rows: 10_000,
                    mode: WriteMode::Replace
                },
                Recorded {
                    rows: 10_000,
                    mode: WriteMode::Append
                },
                Recorded {
                    rows: 5_000,
                    mode: WriteMode::Append
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_extract_fails_without_connecting() {
        let connector = RecordingConnector::default();
        let err = loader(&connector, 100)
            .load(Some(&extract(0)), "flights")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No data to load");

        let err = loader(&connector, 100).load(None, "flights").await.unwrap_err();
        assert!(matches!(err, LoadError::NoData));
        assert_eq!(connector.state.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn test_zero_chunk_size_rejected() {
        let connector = RecordingConnector::default();
        let err = loader(&connector, 0)
            .load(Some(&extract(3)), "flights")
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::InvalidChunkSize { chunk_size: 0 }));
        assert_eq!(connector.state.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn test_missing_password_fails_before_connecting() {
        let connector = RecordingConnector::default();
        let database = DatabaseConfig {
            engine: DbEngine::Postgres,
            user: Some("etl".into()),
            host: Some("localhost".into()),
            port: Some(5432),
            name: Some("flightdb".into()),
            password: None,
        };
        let err = ChunkedLoader::new(database, LoadOptions::default())
            .with_connector(Arc::new(connector.clone()))
            .load(Some(&extract(3)), "flights")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("DB_PASSWORD"));
        assert!(matches!(err, LoadError::Config(_)));
        assert_eq!(connector.state.lock().unwrap().connects, 0);
    }

    #[tokio::test]
    async fn test_failed_batch_reports_committed_rows() {
        let connector = RecordingConnector {
            fail_on: Some(2),
            ..Default::default()
        };
        let err = loader(&connector, 10)
            .load(Some(&extract(35)), "flights")
            .await
            .unwrap_err();
        match err {
            LoadError::BatchFailed {
                batch,
                total_batches,
                committed_rows,
                ..
            } => {
                assert_eq!(batch, 2);
                assert_eq!(total_batches, 4);
                assert_eq!(committed_rows, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(connector.state.lock().unwrap().batches.len(), 1);
    }

    #[tokio::test]
    async fn test_timed_out_batch_reports_lower_bound() {
        let connector = RecordingConnector {
            slow_batch: Some(2),
            ..Default::default()
        };
        let err = ChunkedLoader::new(
            sqlite_db(),
            LoadOptions {
                chunk_size: 10,
                operation_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .with_connector(Arc::new(connector.clone()))
        .load(Some(&extract(25)), "flights")
        .await
        .unwrap_err();
        match &err {
            LoadError::BatchTimedOut {
                batch,
                committed_rows,
                ..
            } => {
                assert_eq!(*batch, 2);
                assert_eq!(*committed_rows, 10);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("at least 10 rows"));

        tokio::time::sleep(Duration::from_millis(400)).await;
        // The abandoned batch committed late; the table holds more than reported.
        assert_eq!(connector.state.lock().unwrap().stored, 20);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_soft() {
        let connector = RecordingConnector {
            lose_rows: 1,
            ..Default::default()
        };
        let report = loader(&connector, 100)
            .load(Some(&extract(5)), "flights")
            .await
            .unwrap();
        assert!(!report.verified);
        assert_eq!(report.sink_rows, 4);
    }

    #[tokio::test]
    async fn test_slow_probe_times_out() {
        let connector = RecordingConnector {
            slow_probe: true,
            ..Default::default()
        };
        let err = ChunkedLoader::new(
            sqlite_db(),
            LoadOptions {
                connect_timeout: Duration::from_millis(50),
                ..Default::default()
            },
        )
        .with_connector(Arc::new(connector))
        .load(Some(&extract(1)), "flights")
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            LoadError::Connect(SinkError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() {
        let connector = RecordingConnector::default();
        let err = loader(&connector, 10)
            .load(Some(&extract(1)), "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(ConfigError::Invalid { .. })));
        assert_eq!(connector.state.lock().unwrap().connects, 0);
    }
}

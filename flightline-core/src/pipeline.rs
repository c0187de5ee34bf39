//! Extract, transform and load, in sequence.
//!
//! Every failure is caught at its phase boundary and returned as a
//! [`PipelineFailure`] tagged with the phase; later phases never run.

use crate::config::EtlConfig;
use crate::data::extract::{CsvExtractor, TabularExtract};
use crate::data::transform::{TransformEngine, TransformReport};
use crate::data::validate::{DataQualityReport, profile_extract};
use crate::error::EtlError;
use crate::load::{ChunkedLoader, LoadOptions, LoadReport, SinkConnector};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Transform,
    Load,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Extract => write!(f, "extract"),
            Phase::Transform => write!(f, "transform"),
            Phase::Load => write!(f, "load"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub elapsed_ms: u64,
}

/// Summary of a successful run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub input: PathBuf,
    pub rows_extracted: usize,
    pub transform: TransformReport,
    pub load: LoadReport,
    pub timings: Vec<PhaseTiming>,
    pub total_elapsed_ms: u64,
}

/// A run that stopped at `phase`.
#[derive(Debug)]
pub struct PipelineFailure {
    pub phase: Phase,
    pub error: EtlError,
    pub timings: Vec<PhaseTiming>,
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.error)
    }
}

impl std::error::Error for PipelineFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

pub type PipelineOutcome = Result<PipelineReport, PipelineFailure>;

/// Quality of an input before and after cleaning, without loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    pub input: PathBuf,
    pub raw: DataQualityReport,
    pub cleaned: DataQualityReport,
    pub transform: TransformReport,
}

/// Runs the three phases against one resolved configuration.
pub struct Pipeline {
    config: EtlConfig,
    engine: TransformEngine,
    connector: Option<Arc<dyn SinkConnector>>,
}

struct PhaseClock {
    timings: Vec<PhaseTiming>,
}

impl PhaseClock {
    fn time<T>(&mut self, phase: Phase, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.record(phase, start.elapsed());
        out
    }

    fn record(&mut self, phase: Phase, elapsed: Duration) {
        info!(%phase, elapsed_ms = elapsed.as_millis() as u64, "Phase finished");
        self.timings.push(PhaseTiming {
            phase,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    fn fail(self, phase: Phase, error: impl Into<EtlError>) -> PipelineFailure {
        let failure = PipelineFailure {
            phase,
            error: error.into(),
            timings: self.timings,
        };
        error!(%failure, "Pipeline failed");
        failure
    }
}

impl Pipeline {
    pub fn new(config: EtlConfig) -> Self {
        Self {
            config,
            engine: TransformEngine::default(),
            connector: None,
        }
    }

    pub fn with_engine(mut self, engine: TransformEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn SinkConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn config(&self) -> &EtlConfig {
        &self.config
    }

    fn extractor(&self) -> CsvExtractor {
        CsvExtractor::new(&self.config.paths.input_data)
            .with_chunk_size(Some(self.config.etl.effective_read_chunk_size()))
    }

    fn loader(&self) -> ChunkedLoader {
        let loader = ChunkedLoader::new(
            self.config.database.clone(),
            LoadOptions::from(&self.config.etl),
        );
        match &self.connector {
            Some(connector) => loader.with_connector(Arc::clone(connector)),
            None => loader,
        }
    }

    /// Run extract, transform and load.
    pub async fn run(&self) -> PipelineOutcome {
        let started = Instant::now();
        let mut clock = PhaseClock {
            timings: Vec::new(),
        };
        info!(input = %self.config.paths.input_data.display(), "Starting ETL pipeline");

        info!("Step 1/3: extracting data");
        let extracted: TabularExtract = match clock.time(Phase::Extract, || self.extractor().extract()) {
            Ok(extract) => extract,
            Err(e) => return Err(clock.fail(Phase::Extract, e)),
        };
        let rows_extracted = extracted.row_count();

        info!("Step 2/3: transforming data");
        let cleaned = match clock.time(Phase::Transform, || self.engine.transform(Some(extracted))) {
            Ok(cleaned) => cleaned,
            Err(e) => return Err(clock.fail(Phase::Transform, e)),
        };

        info!("Step 3/3: loading data");
        let table = &self.config.etl.table_name;
        let load_started = Instant::now();
        let load = self.loader().load(Some(&cleaned.table), table).await;
        clock.record(Phase::Load, load_started.elapsed());
        let load = match load {
            Ok(report) => report,
            Err(e) => return Err(clock.fail(Phase::Load, e)),
        };

        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            rows = load.rows_written,
            table = %load.table,
            elapsed_secs = %format!("{:.2}", total_elapsed_ms as f64 / 1000.0),
            "ETL pipeline completed"
        );
        Ok(PipelineReport {
            input: self.config.paths.input_data.clone(),
            rows_extracted,
            transform: cleaned.report,
            load,
            timings: clock.timings,
            total_elapsed_ms,
        })
    }

    /// Extract and transform only, reporting data quality on both sides.
    pub fn profile(&self) -> Result<ProfileReport, PipelineFailure> {
        let mut clock = PhaseClock {
            timings: Vec::new(),
        };
        let extracted = match clock.time(Phase::Extract, || self.extractor().extract()) {
            Ok(extract) => extract,
            Err(e) => return Err(clock.fail(Phase::Extract, e)),
        };
        let raw = profile_extract(&extracted);
        let cleaned = match clock.time(Phase::Transform, || self.engine.transform(Some(extracted))) {
            Ok(cleaned) => cleaned,
            Err(e) => return Err(clock.fail(Phase::Transform, e)),
        };
        Ok(ProfileReport {
            input: self.config.paths.input_data.clone(),
            raw,
            cleaned: profile_extract(&cleaned.table),
            transform: cleaned.report,
        })
    }
}

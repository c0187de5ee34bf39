//! Subcommand handlers.

use crate::{Commands, ConfigAction};
use flightline_core::pipeline::{PipelineReport, ProfileReport};
use flightline_core::{EtlConfig, Pipeline, load_config_or_default};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Null share above which a column is called out in the profile.
const SPARSE_COLUMN_PCT: f64 = 50.0;

pub async fn handle_command(command: Commands, config_path: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            input,
            table,
            chunk_size,
            json,
        } => handle_run(config_path, input, table, chunk_size, json).await,
        Commands::Config { action } => handle_config(action, config_path),
        Commands::Profile { input, json } => handle_profile(config_path, input, json),
    }
}

fn resolve_config(
    config_path: &Path,
    input: Option<PathBuf>,
    table: Option<String>,
    chunk_size: Option<usize>,
) -> anyhow::Result<EtlConfig> {
    let mut config = load_config_or_default(Some(config_path));
    if let Some(input) = input {
        config.paths.input_data = input;
    }
    if let Some(table) = table {
        config.etl.table_name = table;
    }
    if let Some(chunk_size) = chunk_size {
        config.etl.chunk_size = chunk_size;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    debug!(
        input = %config.paths.input_data.display(),
        table = %config.etl.table_name,
        chunk_size = config.etl.chunk_size,
        engine = %config.database.engine,
        "Resolved run configuration"
    );
    Ok(config)
}

async fn handle_run(
    config_path: &Path,
    input: Option<PathBuf>,
    table: Option<String>,
    chunk_size: Option<usize>,
    json: bool,
) -> anyhow::Result<()> {
    let config = resolve_config(config_path, input, table, chunk_size)?;
    let report = Pipeline::new(config).run().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_summary(&report);
    }
    Ok(())
}

fn print_run_summary(report: &PipelineReport) {
    println!("ETL pipeline completed");
    println!("  Input:      {}", report.input.display());
    println!("  Extracted:  {} rows", report.rows_extracted);
    println!("  Cleaned:    {} rows", report.transform.rows_out);
    println!(
        "  Loaded:     {} rows into '{}' ({} batches, {})",
        report.load.rows_written, report.load.table, report.load.batches, report.load.engine
    );
    if !report.load.verified {
        println!(
            "  Warning:    table holds {} rows, expected {}",
            report.load.sink_rows, report.transform.rows_out
        );
    }
    for timing in &report.timings {
        println!(
            "  {:<11} {:.2}s",
            format!("{}:", timing.phase),
            timing.elapsed_ms as f64 / 1000.0
        );
    }
    println!(
        "  Total:      {:.2}s",
        report.total_elapsed_ms as f64 / 1000.0
    );
}

fn handle_config(action: ConfigAction, config_path: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config_or_default(Some(config_path));
            let yaml = serde_yaml::to_string(&config.redacted())?;
            println!("# {}", config_path.display());
            println!("{}", yaml);
            match config.database.resolve() {
                Ok(settings) => println!("# sink: {}", settings.redacted_url()),
                Err(e) => println!("# sink: unresolved ({})", e),
            }
            Ok(())
        }
    }
}

fn handle_profile(config_path: &Path, input: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let config = resolve_config(config_path, input, None, None)?;
    let report = Pipeline::new(config).profile()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_profile(&report);
    }
    Ok(())
}

fn print_profile(report: &ProfileReport) {
    println!("Data quality for {}", report.input.display());
    println!(
        "  Raw:      {} rows x {} columns, {} duplicates, {} empty, score {:.2}",
        report.raw.total_rows,
        report.raw.total_columns,
        report.raw.duplicate_rows,
        report.raw.empty_rows,
        report.raw.overall_score
    );
    println!(
        "  Cleaned:  {} rows x {} columns, score {:.2}",
        report.cleaned.total_rows, report.cleaned.total_columns, report.cleaned.overall_score
    );

    let t = &report.transform;
    println!("  Dropped rows:");
    println!("    empty:              {}", t.empty_rows_removed);
    println!("    invalid date:       {}", t.invalid_date_rows_removed);
    println!("    missing critical:   {}", t.incomplete_rows_removed);
    println!("    bad airport code:   {}", t.bad_airport_rows_removed);
    println!("    origin = dest:      {}", t.self_loop_rows_removed);
    println!(
        "  Coercion: {} unparseable cells, {} zero-filled, {} flags defaulted",
        t.unparseable_cells, t.zero_filled_cells, t.flags_defaulted
    );

    let sparse = report.cleaned.sparse_columns(SPARSE_COLUMN_PCT);
    if !sparse.is_empty() {
        println!("  Columns over {SPARSE_COLUMN_PCT}% missing:");
        for (name, pct) in sparse {
            println!("    {name}: {pct:.1}%");
        }
    }
}

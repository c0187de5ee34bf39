//! Flightline CLI: runs the flight-records ETL pipeline.

mod commands;

use clap::Parser;
use flightline_core::config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Flightline: load flight records into a relational table
#[derive(Parser, Debug)]
#[command(name = "flightline", version, about, long_about = None)]
struct Cli {
    /// Configuration file path (YAML, or TOML by extension)
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Extract, transform and load the configured input
    Run {
        /// Input CSV, overriding paths.input_data
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Target table, overriding etl.table_name
        #[arg(short, long)]
        table: Option<String>,
        /// Rows per load batch, overriding etl.chunk_size
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Extract and clean without loading, then report data quality
    Profile {
        /// Input CSV, overriding paths.input_data
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Print the profile as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Show the resolved configuration with secrets redacted
    Show,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "flightline", "flightline")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "flightline.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command, &cli.config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_cli_parses_run_overrides() {
        let cli = Cli::try_parse_from([
            "flightline",
            "run",
            "--input",
            "data/jan.csv",
            "--chunk-size",
            "500",
            "--json",
            "-v",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        match cli.command {
            Commands::Run {
                input,
                chunk_size,
                json,
                table,
            } => {
                assert_eq!(input, Some(PathBuf::from("data/jan.csv")));
                assert_eq!(chunk_size, Some(500));
                assert!(json);
                assert!(table.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_global_config_after_subcommand() {
        let cli =
            Cli::try_parse_from(["flightline", "config", "show", "--config", "etl.toml"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("etl.toml"));
        assert!(matches!(
            cli.command,
            Commands::Config {
                action: ConfigAction::Show
            }
        ));
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["flightline"]).is_err());
    }
}

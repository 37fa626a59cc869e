//! tpuinfo - Command-line driver for libtpuinfo

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use libtpuinfo::QueryFacade;
use tpu_adapter::TpuInfoConfig;
use tracing::debug;

mod commands;
mod output;

use output::{OutputFormat, OutputFormatter};

/// Inspect the TPU chips on this host, their owners and runtime metrics
#[derive(Debug, Parser)]
#[command(name = "tpuinfo")]
#[command(version)]
pub struct Cli {
    /// Configuration file path (defaults to $LIBTPUINFO_CONFIG)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show the discovered chip model and its device nodes
    Chips,

    /// Show the process holding each TPU device
    Pids,

    /// Show memory usage and duty cycle of each TPU device
    Metrics {
        /// Metric service port (0 uses the configured default)
        #[arg(short, long, default_value = "0")]
        port: i32,
    },

    /// Time discovery, owner scans and metric queries
    Bench {
        /// Number of iterations per operation
        #[arg(short = 'n', long, default_value = "10")]
        iterations: u32,

        /// Metric service port (0 uses the configured default)
        #[arg(short, long, default_value = "0")]
        port: i32,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<TpuInfoConfig> {
    match path {
        Some(path) => TpuInfoConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => TpuInfoConfig::load().context("Failed to load configuration"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(format!("tpuinfo={0},tpu_adapter={0}", log_level))
        .with_writer(std::io::stderr)
        .with_target(false);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    debug!("Starting tpuinfo with {:?}", cli);

    let config = load_config(cli.config.as_ref())?;
    let facade = QueryFacade::from_config(&config).context("Failed to initialize TPU queries")?;
    let out = OutputFormatter::new(cli.output);

    let status = match cli.command {
        Commands::Chips => commands::chips(&facade, &out)?,
        Commands::Pids => commands::pids(&facade, &out)?,
        Commands::Metrics { port } => commands::metrics(&facade, port, &out)?,
        Commands::Bench { iterations, port } => {
            commands::bench(&facade, &config, iterations, port, &out)?
        }
    };

    if status != 0 {
        std::process::exit(status);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert()
    }

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["tpuinfo", "chips"]).unwrap();
        assert!(matches!(cli.command, Commands::Chips));

        let cli = Cli::try_parse_from(["tpuinfo", "metrics", "--port", "9000"]).unwrap();
        assert!(matches!(cli.command, Commands::Metrics { port: 9000 }));

        let cli = Cli::try_parse_from(["tpuinfo", "bench", "-n", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Bench { iterations: 3, port: 0 }));
    }

    #[test]
    fn test_output_format() {
        let cli = Cli::try_parse_from(["tpuinfo", "--output", "json", "pids"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);

        let cli = Cli::try_parse_from(["tpuinfo", "--json-logs", "pids"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Table);
        assert!(cli.json_logs);
    }
}

//! # CLI Interface
//!
//! `clap` derive definitions for `forkwatch-node`: `run`, `init`, and
//! `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::logging::LogFormat;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "forkwatch.json";

/// Forkwatch node.
///
/// Follows one or more chains, switches each to the strongest fork when it
/// pulls far enough ahead, and exposes Prometheus metrics about it.
#[derive(Parser, Debug)]
#[command(
    name = "forkwatch-node",
    about = "Multi-chain fork resolution node",
    version,
    propagate_version = true
)]
pub struct ForkwatchCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Write a default configuration file.
    Init(InitArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the JSON configuration file. Defaults are used when the
    /// file is absent and this flag was not given.
    #[arg(long, short = 'c', env = "FORKWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "FORKWATCH_METRICS_PORT", default_value_t = 9842)]
    pub metrics_port: u16,

    /// Log output format: pretty or json.
    #[arg(long, env = "FORKWATCH_LOG_FORMAT", default_value = "pretty")]
    pub log_format: LogFormat,

    /// Feed every chain with locally generated blocks, including competing
    /// branches, so the monitor has something to resolve. For devnets and
    /// dashboards; never enable next to a real block source.
    #[arg(long, env = "FORKWATCH_SIMULATE")]
    pub simulate: bool,

    /// Milliseconds between simulated blocks.
    #[arg(long, env = "FORKWATCH_BLOCK_INTERVAL_MS", default_value_t = 1_000)]
    pub block_interval_ms: u64,
}

/// Arguments for the `init` subcommand.
#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Where to write the configuration file.
    #[arg(long, short = 'c', env = "FORKWATCH_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        ForkwatchCli::command().debug_assert();
    }

    #[test]
    fn run_args_parse() {
        let cli = ForkwatchCli::try_parse_from([
            "forkwatch-node",
            "run",
            "--log-format",
            "json",
            "--metrics-port",
            "9000",
            "--simulate",
        ])
        .unwrap();
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.log_format, LogFormat::Json);
                assert_eq!(args.metrics_port, 9000);
                assert!(args.simulate);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn bad_log_format_rejected() {
        let result =
            ForkwatchCli::try_parse_from(["forkwatch-node", "run", "--log-format", "xml"]);
        assert!(result.is_err());
    }
}

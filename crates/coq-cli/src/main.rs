mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{build_coq_config, load_cli_toml, BackendFlags, CliToml};
use pipeline::{CheckArgs, ReplArgs};

/// coq-cli: drive a coqidetop backend from the command line.
#[derive(Parser)]
#[command(name = "coq-cli", version, about)]
struct Cli {
    /// Path to a config TOML file with a `[backend]` section.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Backend executable (overrides the config file).
    #[arg(long, global = true)]
    exe: Option<PathBuf>,
    /// Extra argument for the backend. Repeat for several.
    #[arg(long = "arg", global = true, allow_hyphen_values = true)]
    args: Vec<String>,
    /// Seconds to wait for the backend before giving up on it.
    #[arg(long, global = true)]
    timeout: Option<f64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check a file sentence by sentence, one sentence per line.
    Check {
        /// File to check.
        #[arg(long)]
        file: PathBuf,
    },
    /// Read sentences and `:` commands from stdin.
    Repl,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let toml = match &cli.config {
        Some(path) => load_cli_toml(path)?,
        None => CliToml::default(),
    };
    let flags = BackendFlags {
        executable: cli.exe,
        args: cli.args,
        timeout_secs: cli.timeout,
    };
    let config = build_coq_config(&toml.backend, &flags)?;

    match cli.command {
        Command::Check { file } => pipeline::run_check(CheckArgs { config, file }).await,
        Command::Repl => pipeline::run_repl(ReplArgs { config }).await,
    }
}

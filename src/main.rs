mod cache;
mod commands;
mod config;
mod event;
mod net;
#[cfg(test)]
mod testing;
mod worker;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Offline app-shell cache with cache-first request handling")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Application origin/scope URL
  #[arg(long, global = true)]
  origin: Option<String>,

  /// Version tag naming the current bucket
  #[arg(long, global = true)]
  version_tag: Option<String>,

  /// Debug logging
  #[arg(short, long, global = true, conflicts_with = "quiet")]
  verbose: bool,

  /// Only log errors
  #[arg(short, long, global = true)]
  quiet: bool,

  /// Also write logs to this file
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: commands::Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration, then apply command line overrides
  let config = config::Config::load(args.config.as_deref())?.with_overrides(
    args.origin,
    args.version_tag,
    args.log_file,
  )?;

  let _guard = init_logging(args.verbose, args.quiet, config.log_file.as_deref())?;

  commands::run(args.command, &config).await
}

fn init_logging(verbose: bool, quiet: bool, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = if quiet {
    EnvFilter::new("error")
  } else if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::from_default_env().add_directive(Level::INFO.into())
  };

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false),
    )
    .with(file_layer)
    .init();

  Ok(guard)
}

use clap::Subcommand;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;

use crate::cache::{CacheResult, CacheSource, CacheStorage, MemoryStorage, SqliteStorage};
use crate::config::{Config, StorageConfig};
use crate::event::WorkerHost;
use crate::net::{HttpFetcher, Method, Request, Response};
use crate::worker::{InstallOutcome, OfflineWorker, WorkerSettings};

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Seed the current bucket with the asset manifest, unless already seeded
  Install,
  /// Delete buckets left behind by other versions
  Activate,
  /// Register the worker and send requests through it
  Fetch {
    /// URLs to request; relative ones resolve against the origin
    #[arg(required = true)]
    urls: Vec<String>,
    /// HTTP method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },
  /// List buckets and how many entries each holds
  Buckets,
}

/// Run a command against the storage backend selected in `config`.
pub async fn run(command: Command, config: &Config) -> Result<()> {
  match &config.storage {
    StorageConfig::Sqlite { path } => {
      let storage = match path {
        Some(p) => SqliteStorage::open_at(p)?,
        None => SqliteStorage::open_default()?,
      };
      execute(command, config, Arc::new(storage)).await
    }
    StorageConfig::Memory => execute(command, config, Arc::new(MemoryStorage::new())).await,
  }
}

async fn execute<S: CacheStorage + 'static>(
  command: Command,
  config: &Config,
  storage: Arc<S>,
) -> Result<()> {
  match command {
    Command::Install => {
      let worker = build_worker(config, storage)?;
      match worker.ensure_installed().await {
        InstallOutcome::Cached { assets } => {
          println!("Cached {} assets into {}", assets, worker.version());
          Ok(())
        }
        InstallOutcome::Reused { assets } => {
          println!("{} already holds all {} assets", worker.version(), assets);
          Ok(())
        }
        InstallOutcome::Failed { reason } => Err(eyre!("Install failed: {}", reason)),
      }
    }
    Command::Activate => {
      let worker = build_worker(config, storage)?;
      let outcome = worker.activate().await;
      for bucket in &outcome.removed {
        println!("Removed {}", bucket);
      }
      for bucket in &outcome.failed {
        println!("Could not remove {}", bucket);
      }
      println!("Active version: {}", worker.version());
      Ok(())
    }
    Command::Fetch { urls, method, data } => {
      let method: Method = method.parse()?;
      let worker = build_worker(config, storage)?;
      let scope = config.origin_url()?;
      let handle = WorkerHost::register(worker).await?;

      let mut failures = 0;
      for raw in &urls {
        let url = scope
          .join(raw)
          .map_err(|e| eyre!("Invalid URL {}: {}", raw, e))?;
        let mut request = Request::new(method, url.clone());
        if let Some(body) = &data {
          request = request.with_body(body.clone());
        }

        match handle.fetch(request).await {
          Ok(result) => println!(
            "{} {:<11} {:>8}B {}{}",
            result.data.status,
            result.source,
            result.data.body.len(),
            url,
            cached_note(&result)
          ),
          Err(e) => {
            failures += 1;
            println!("ERR {:<11} {:>8}  {} ({:#})", "-", "-", url, e);
          }
        }
      }

      if failures > 0 {
        return Err(eyre!("{} of {} requests failed", failures, urls.len()));
      }
      Ok(())
    }
    Command::Buckets => list_buckets(storage.as_ref(), &config.version),
  }
}

fn cached_note(result: &CacheResult<Response>) -> String {
  match (result.source, result.cached_at) {
    (CacheSource::Cache, Some(at)) => format!(" (cached {})", at.format("%Y-%m-%d %H:%M:%S UTC")),
    _ => String::new(),
  }
}

fn build_worker<S: CacheStorage + 'static>(
  config: &Config,
  storage: Arc<S>,
) -> Result<OfflineWorker<S, HttpFetcher>> {
  let settings = WorkerSettings::from_config(config)?;
  let network = HttpFetcher::new(settings.scope.clone(), config.timeout())?;
  Ok(OfflineWorker::new(storage, Arc::new(network), settings))
}

fn list_buckets<S: CacheStorage>(storage: &S, current: &str) -> Result<()> {
  for line in bucket_lines(storage, current)? {
    println!("{}", line);
  }
  Ok(())
}

fn bucket_lines<S: CacheStorage>(storage: &S, current: &str) -> Result<Vec<String>> {
  storage
    .keys()?
    .into_iter()
    .map(|name| -> Result<String> {
      let entries = storage.entries(&name)?.len();
      let marker = if name == current { '*' } else { ' ' };
      Ok(format!("{} {} ({} entries)", marker, name, entries))
    })
    .collect()
}

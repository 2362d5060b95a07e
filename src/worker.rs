//! The offline cache interceptor: install, activate and fetch handlers.

use color_eyre::{eyre::eyre, Result};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Resolved};
use crate::config::{Config, OfflineFallback};
use crate::net::{Fetcher, Method, Request, Response};

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  /// Registered, no lifecycle event handled yet
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Active and allowed to intercept requests
  Activated,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Parsed => "parsed",
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Activated => "activated",
    };
    f.write_str(label)
  }
}

/// Everything the worker needs to know about the application it serves.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub scope: Url,
  pub version: String,
  pub assets: Vec<String>,
  pub reserved_schemes: Vec<String>,
  pub offline_fallback: Option<OfflineFallback>,
}

impl WorkerSettings {
  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(Self {
      scope: config.origin_url()?,
      version: config.version.clone(),
      assets: config.assets.clone(),
      reserved_schemes: config.reserved_schemes.clone(),
      offline_fallback: config.offline_fallback.clone(),
    })
  }
}

/// Result of the install handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
  /// Every manifest asset was stored
  Cached { assets: usize },
  /// The bucket for this version was already seeded, nothing was fetched
  Reused { assets: usize },
  /// Seeding failed; the bucket holds none of the manifest
  Failed { reason: String },
}

/// Result of the activate handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivateOutcome {
  /// Stale buckets that were deleted
  pub removed: Vec<String>,
  /// Stale buckets that could not be deleted
  pub failed: Vec<String>,
}

/// What the fetch handler decided to do with a request.
#[derive(Debug)]
pub enum FetchDisposition {
  /// Not intercepted; the host handles the request as it would without a worker
  Passthrough(Request),
  /// The worker answers the request
  RespondWith(Resolved),
}

/// Offline cache interceptor.
///
/// Owns the current bucket (named by the version tag) and the three lifecycle
/// handlers. Storage and network are injected so either can be swapped out.
pub struct OfflineWorker<S: CacheStorage, N: Fetcher> {
  cache: CacheLayer<S>,
  network: Arc<N>,
  settings: WorkerSettings,
  state: Mutex<WorkerState>,
  skip_waiting: AtomicBool,
  clients_claimed: AtomicBool,
}

impl<S: CacheStorage + 'static, N: Fetcher + 'static> OfflineWorker<S, N> {
  pub fn new(storage: Arc<S>, network: Arc<N>, settings: WorkerSettings) -> Self {
    Self {
      cache: CacheLayer::new(storage, settings.version.clone()),
      network,
      settings,
      state: Mutex::new(WorkerState::Parsed),
      skip_waiting: AtomicBool::new(false),
      clients_claimed: AtomicBool::new(false),
    }
  }

  pub fn version(&self) -> &str {
    self.cache.bucket()
  }

  pub fn network(&self) -> &Arc<N> {
    &self.network
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    self.cache.storage()
  }

  pub fn state(&self) -> WorkerState {
    // A poisoned lock still holds a valid state value
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: WorkerState) {
    let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
    let previous = *current;
    debug!(from = %previous, to = %state, "Worker state change");
    *current = state;
  }

  /// Whether install asked to activate without waiting for older workers.
  pub fn is_skip_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Whether the worker currently controls its clients.
  pub fn controls_clients(&self) -> bool {
    self.state() == WorkerState::Activated && self.clients_claimed.load(Ordering::SeqCst)
  }

  fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }

  fn claim(&self) {
    self.clients_claimed.store(true, Ordering::SeqCst);
  }

  /// Resolve the asset manifest against the scope.
  fn manifest_requests(&self) -> Result<Vec<Request>> {
    self
      .settings
      .assets
      .iter()
      .map(|locator| {
        self
          .settings
          .scope
          .join(locator)
          .map(Request::get)
          .map_err(|e| eyre!("Invalid asset locator {}: {}", locator, e))
      })
      .collect()
  }

  /// Run the install handler unless this version's bucket already holds the
  /// whole manifest.
  ///
  /// A reused bucket counts as a successful install: the worker moves to
  /// `Installed` and skips waiting without touching the network.
  pub async fn ensure_installed(&self) -> InstallOutcome {
    // An unusable manifest is reported by install itself
    let Ok(requests) = self.manifest_requests() else {
      return self.install().await;
    };

    match self.cache.holds_all(&requests).await {
      Ok(true) => {
        self.set_state(WorkerState::Installing);
        info!(
          version = self.version(),
          assets = requests.len(),
          "Bucket already seeded, skipping install"
        );
        self.skip_waiting();
        self.set_state(WorkerState::Installed);
        InstallOutcome::Reused {
          assets: requests.len(),
        }
      }
      Ok(false) => self.install().await,
      Err(e) => {
        warn!("Could not inspect bucket, installing: {:#}", e);
        self.install().await
      }
    }
  }

  /// Install handler: seed the current bucket with the whole manifest.
  ///
  /// Failures are logged and reported in the outcome; install itself always
  /// completes.
  pub async fn install(&self) -> InstallOutcome {
    self.set_state(WorkerState::Installing);
    info!(version = self.version(), "Installing");

    let outcome = match self.precache().await {
      Ok(assets) => {
        info!(assets, "App shell cached");
        self.skip_waiting();
        InstallOutcome::Cached { assets }
      }
      Err(e) => {
        error!("Failed to cache app shell: {:#}", e);
        InstallOutcome::Failed {
          reason: format!("{:#}", e),
        }
      }
    };

    self.set_state(WorkerState::Installed);
    outcome
  }

  async fn precache(&self) -> Result<usize> {
    let requests = self.manifest_requests()?;
    info!(bucket = self.version(), "Adding app shell");

    self
      .cache
      .add_all(requests, |request| {
        let network = Arc::clone(&self.network);
        async move { network.fetch(&request).await }
      })
      .await
  }

  /// Activate handler: drop every bucket from other versions, then take
  /// control of open clients.
  ///
  /// A bucket that cannot be deleted is logged and left behind.
  pub async fn activate(&self) -> ActivateOutcome {
    self.set_state(WorkerState::Activating);
    info!(
      version = self.version(),
      skip_waiting = self.is_skip_waiting(),
      "Activating"
    );

    let mut outcome = ActivateOutcome::default();
    match self.cache.delete_stale().await {
      Ok(deletions) => {
        for deletion in deletions {
          match deletion.result {
            Ok(_) => {
              info!(bucket = %deletion.bucket, "Removed old bucket");
              outcome.removed.push(deletion.bucket);
            }
            Err(e) => {
              warn!(bucket = %deletion.bucket, "Failed to remove old bucket: {:#}", e);
              outcome.failed.push(deletion.bucket);
            }
          }
        }
      }
      Err(e) => warn!("Could not list buckets, skipping cleanup: {:#}", e),
    }
    info!(
      removed = outcome.removed.len(),
      failed = outcome.failed.len(),
      "Old buckets cleaned"
    );

    self.set_state(WorkerState::Activated);
    self.claim();
    info!("Claimed open clients");
    outcome
  }

  /// Whether the fetch handler should look at this request at all.
  pub fn should_intercept(&self, request: &Request) -> bool {
    request.method == Method::Get
      && !self
        .settings
        .reserved_schemes
        .iter()
        .any(|scheme| scheme.eq_ignore_ascii_case(request.url.scheme()))
  }

  /// Fetch handler: cache first, then network.
  ///
  /// Returns an error only when the request missed the cache, the network
  /// failed, and no offline fallback is configured.
  pub async fn handle_fetch(&self, request: Request) -> Result<FetchDisposition> {
    if !self.should_intercept(&request) {
      return Ok(FetchDisposition::Passthrough(request));
    }

    let network = &self.network;
    let pending = &request;
    match self
      .cache
      .fetch(pending, move || network.fetch(pending))
      .await
    {
      Ok(resolved) => Ok(FetchDisposition::RespondWith(resolved)),
      Err(e) => {
        error!(url = %request.url, "Neither cache nor network available: {:#}", e);
        match &self.settings.offline_fallback {
          Some(fallback) => Ok(FetchDisposition::RespondWith(Resolved::offline(
            fallback_response(fallback, &request.url),
          ))),
          None => Err(e),
        }
      }
    }
  }
}

fn fallback_response(fallback: &OfflineFallback, url: &Url) -> Response {
  let mut response = Response::new(fallback.status, fallback.body.clone())
    .with_header("content-type", "text/plain; charset=utf-8");
  response.status_text = fallback.status_text.clone();
  response.url = Some(url.clone());
  response
}

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::cache::{CacheResult, CacheStorage};
use crate::net::{Fetcher, Request, Response};
use crate::worker::{ActivateOutcome, FetchDisposition, InstallOutcome, OfflineWorker};

/// Lifecycle events delivered to the worker
#[derive(Debug)]
pub enum WorkerEvent {
  /// Seed the bucket if this version has not been installed yet; the sender
  /// resolves once install is complete
  Install(oneshot::Sender<InstallOutcome>),
  /// Clean old buckets and claim clients
  Activate(oneshot::Sender<ActivateOutcome>),
  /// A request from a client; the sender carries the response back
  Fetch {
    request: Request,
    respond: oneshot::Sender<Result<CacheResult<Response>>>,
  },
}

/// Drives a worker from lifecycle events.
///
/// Install and activate run one at a time in the order they arrive, and the
/// next event is not looked at until the current one completes. Each fetch
/// event runs as its own task, so requests interleave freely.
pub struct WorkerHost;

impl WorkerHost {
  /// Register a worker: start its event loop, then run install and activate.
  pub async fn register<S, N>(worker: OfflineWorker<S, N>) -> Result<HostHandle>
  where
    S: CacheStorage + 'static,
    N: Fetcher + 'static,
  {
    let handle = Self::spawn(worker);
    handle.install().await?;
    handle.activate().await?;
    Ok(handle)
  }

  /// Start the event loop without dispatching any lifecycle event.
  pub fn spawn<S, N>(worker: OfflineWorker<S, N>) -> HostHandle
  where
    S: CacheStorage + 'static,
    N: Fetcher + 'static,
  {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let worker = Arc::new(worker);

    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        match event {
          WorkerEvent::Install(done) => {
            let outcome = worker.ensure_installed().await;
            // Ignore send errors - the caller may have stopped waiting
            let _ = done.send(outcome);
          }
          WorkerEvent::Activate(done) => {
            let outcome = worker.activate().await;
            let _ = done.send(outcome);
          }
          WorkerEvent::Fetch { request, respond } => {
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
              let result = dispatch_fetch(&worker, request).await;
              let _ = respond.send(result);
            });
          }
        }
      }
      debug!("Worker host stopped");
    });

    HostHandle { tx }
  }
}

/// Route one request through the worker, or around it when the worker does
/// not control clients or declines the request.
async fn dispatch_fetch<S, N>(
  worker: &OfflineWorker<S, N>,
  request: Request,
) -> Result<CacheResult<Response>>
where
  S: CacheStorage + 'static,
  N: Fetcher + 'static,
{
  let request = if worker.controls_clients() {
    let url = request.url.clone();
    match worker.handle_fetch(request).await? {
      FetchDisposition::RespondWith(resolved) => {
        debug!(
          url = %url,
          source = %resolved.source(),
          status = resolved.response().status,
          storing = resolved.is_storing(),
          "Worker responded"
        );
        return Ok(resolved.into_result());
      }
      FetchDisposition::Passthrough(request) => request,
    }
  } else {
    request
  };

  debug!(method = %request.method, url = %request.url, "Default network handling");
  let response = worker.network().fetch(&request).await.map_err(|e| {
    error!(url = %request.url, "Request failed: {:#}", e);
    e
  })?;
  Ok(CacheResult::passthrough(response))
}

/// Client side of a running worker host.
#[derive(Clone)]
pub struct HostHandle {
  tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl HostHandle {
  fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker host has shut down"))
  }

  /// Dispatch an install event and wait until it has been handled.
  pub async fn install(&self) -> Result<InstallOutcome> {
    let (tx, rx) = oneshot::channel();
    self.send(WorkerEvent::Install(tx))?;
    rx.await
      .map_err(|_| eyre!("Worker host dropped the install event"))
  }

  /// Dispatch an activate event and wait until it has been handled.
  pub async fn activate(&self) -> Result<ActivateOutcome> {
    let (tx, rx) = oneshot::channel();
    self.send(WorkerEvent::Activate(tx))?;
    rx.await
      .map_err(|_| eyre!("Worker host dropped the activate event"))
  }

  /// Issue a request as a client would.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult<Response>> {
    let (tx, rx) = oneshot::channel();
    self.send(WorkerEvent::Fetch {
      request,
      respond: tx,
    })?;
    rx.await
      .map_err(|_| eyre!("Worker host dropped the fetch event"))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryStorage};
  use crate::net::Method;
  use crate::testing::{settings, StubNetwork};
  use url::Url;

  fn url(path: &str) -> Url {
    Url::parse("https://app.test/").unwrap().join(path).unwrap()
  }

  fn worker(network: StubNetwork, assets: &[&str]) -> OfflineWorker<MemoryStorage, StubNetwork> {
    OfflineWorker::new(
      Arc::new(MemoryStorage::new()),
      Arc::new(network),
      settings("inventario-pro-cache-v1", assets),
    )
  }

  #[tokio::test]
  async fn test_register_installs_and_activates() {
    let network = StubNetwork::new()
      .route("https://app.test/index.html", Response::new(200, "<html>"))
      .route("https://app.test/styles.css", Response::new(200, "body{}"));
    let handle = WorkerHost::register(worker(network, &["index.html", "styles.css"]))
      .await
      .unwrap();

    let result = handle.fetch(Request::get(url("styles.css"))).await.unwrap();
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"body{}");
  }

  #[tokio::test]
  async fn test_reregistering_same_version_skips_install() {
    let storage = Arc::new(MemoryStorage::new());
    let assets = &["index.html", "styles.css"];
    let online = StubNetwork::new()
      .route("https://app.test/index.html", Response::new(200, "<html>"))
      .route("https://app.test/styles.css", Response::new(200, "body{}"));
    let first = OfflineWorker::new(
      Arc::clone(&storage),
      Arc::new(online),
      settings("inventario-pro-cache-v1", assets),
    );
    WorkerHost::register(first).await.unwrap();

    let offline = Arc::new(StubNetwork::new());
    let second = OfflineWorker::new(
      Arc::clone(&storage),
      Arc::clone(&offline),
      settings("inventario-pro-cache-v1", assets),
    );
    let handle = WorkerHost::spawn(second);

    assert_eq!(handle.install().await.unwrap(), InstallOutcome::Reused { assets: 2 });
    handle.activate().await.unwrap();
    let result = handle.fetch(Request::get(url("styles.css"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(offline.calls(), 0);
  }

  #[tokio::test]
  async fn test_fetch_before_activation_is_not_intercepted() {
    let network = StubNetwork::new().route("https://app.test/index.html", Response::new(200, "<html>"));
    let handle = WorkerHost::spawn(worker(network, &["index.html"]));

    handle.install().await.unwrap();
    let result = handle.fetch(Request::get(url("index.html"))).await.unwrap();

    assert_eq!(result.source, CacheSource::Passthrough);
  }

  #[tokio::test]
  async fn test_post_goes_to_network() {
    let network = StubNetwork::new().route("https://app.test/api", Response::new(201, "created"));
    let handle = WorkerHost::register(worker(network, &[])).await.unwrap();

    let result = handle
      .fetch(Request::new(Method::Post, url("api")).with_body("{}"))
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Passthrough);
    assert_eq!(result.data.status, 201);
  }

  #[tokio::test]
  async fn test_unreachable_network_surfaces_failure() {
    let handle = WorkerHost::register(worker(StubNetwork::new(), &[]))
      .await
      .unwrap();

    assert!(handle.fetch(Request::get(url("data.json"))).await.is_err());
  }

  #[tokio::test]
  async fn test_concurrent_fetches() {
    let network = StubNetwork::new()
      .route("https://app.test/a.json", Response::new(200, "a"))
      .route("https://app.test/b.json", Response::new(200, "b"))
      .route("https://app.test/c.json", Response::new(404, "c"));
    let handle = WorkerHost::register(worker(network, &[])).await.unwrap();

    let (a, b, c) = tokio::join!(
      handle.fetch(Request::get(url("a.json"))),
      handle.fetch(Request::get(url("b.json"))),
      handle.fetch(Request::get(url("c.json"))),
    );

    assert_eq!(a.unwrap().data.body, b"a");
    assert_eq!(b.unwrap().data.body, b"b");
    assert_eq!(c.unwrap().data.status, 404);
  }
}

//! Test doubles for the network and storage seams.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use url::Url;

use crate::cache::{CacheStorage, CachedResponse, MemoryStorage, RequestKey};
use crate::net::{Fetcher, Request, Response};
use crate::worker::WorkerSettings;

enum Route {
  Respond(Response),
  Fail,
}

/// Scripted network. Unknown URLs behave as if the network were unreachable.
#[derive(Default)]
pub struct StubNetwork {
  routes: HashMap<String, Route>,
  calls: AtomicUsize,
}

impl StubNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn route(mut self, url: &str, response: Response) -> Self {
    self.routes.insert(url.to_string(), Route::Respond(response));
    self
  }

  pub fn fail(mut self, url: &str) -> Self {
    self.routes.insert(url.to_string(), Route::Fail);
    self
  }

  /// Number of requests that reached the network.
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Fetcher for StubNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);

    match self.routes.get(request.url.as_str()) {
      Some(Route::Respond(response)) => {
        let mut response = response.duplicate();
        response.url = Some(request.url.clone());
        Ok(response)
      }
      Some(Route::Fail) => Err(eyre!("Connection reset while fetching {}", request.url)),
      None => Err(eyre!("Network unreachable: {}", request.url)),
    }
  }
}

/// Memory storage whose deletes fail for selected buckets.
#[derive(Default)]
pub struct FlakyStorage {
  inner: MemoryStorage,
  failing_deletes: HashSet<String>,
}

impl FlakyStorage {
  pub fn failing_deletes(buckets: &[&str]) -> Self {
    Self {
      inner: MemoryStorage::new(),
      failing_deletes: buckets.iter().map(|b| b.to_string()).collect(),
    }
  }
}

impl CacheStorage for FlakyStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    self.inner.open(bucket)
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    self.inner.has(bucket)
  }

  fn add_all(&self, bucket: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    self.inner.add_all(bucket, entries)
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    self.inner.match_request(bucket, key)
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    self.inner.put(bucket, key, response)
  }

  fn keys(&self) -> Result<Vec<String>> {
    self.inner.keys()
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    if self.failing_deletes.contains(bucket) {
      return Err(eyre!("Disk I/O error deleting {}", bucket));
    }
    self.inner.delete(bucket)
  }

  fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    self.inner.entries(bucket)
  }
}

/// Settings for an app served from `https://app.test/`.
pub fn settings(version: &str, assets: &[&str]) -> WorkerSettings {
  WorkerSettings {
    scope: Url::parse("https://app.test/").expect("valid test scope"),
    version: version.to_string(),
    assets: assets.iter().map(|a| a.to_string()).collect(),
    reserved_schemes: vec!["chrome-extension".to_string()],
    offline_fallback: None,
  }
}

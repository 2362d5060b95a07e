//! Cache layer that orchestrates bucket access with network fetching.

use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CacheResult, CacheSource, CachedResponse, RequestKey};
use crate::net::{Request, Response};

/// Cache layer bound to the current bucket.
///
/// Storage calls are synchronous, so every one of them runs on the blocking
/// pool and the calling task yields until it completes.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
  /// Name of the current bucket (the version tag)
  bucket: String,
}

/// A response produced by [`CacheLayer::fetch`].
///
/// When the response came from the network and was cacheable, a copy is
/// being written to the bucket in the background. Dropping or calling
/// [`Resolved::into_result`] leaves that write running on its own.
#[derive(Debug)]
pub struct Resolved {
  result: CacheResult<Response>,
  write: Option<JoinHandle<()>>,
}

impl Resolved {
  pub(crate) fn offline(response: Response) -> Self {
    Self {
      result: CacheResult::offline(response),
      write: None,
    }
  }

  pub fn source(&self) -> CacheSource {
    self.result.source
  }

  pub fn response(&self) -> &Response {
    &self.result.data
  }

  /// Whether a cache write was started for this response.
  pub fn is_storing(&self) -> bool {
    self.write.is_some()
  }

  /// Hand the response over without waiting for the cache write.
  pub fn into_result(self) -> CacheResult<Response> {
    self.result
  }

  /// Wait for the background cache write (if any), then hand the response over.
  #[cfg(test)]
  pub async fn settle(self) -> CacheResult<Response> {
    if let Some(write) = self.write {
      if let Err(e) = write.await {
        warn!("Cache write task failed: {}", e);
      }
    }
    self.result
  }
}

/// Outcome of deleting one stale bucket.
#[derive(Debug)]
pub struct Deletion {
  pub bucket: String,
  pub result: Result<bool>,
}

impl<S: CacheStorage + 'static> CacheLayer<S> {
  /// Create a cache layer over `storage` using `bucket` as the current bucket.
  pub fn new(storage: Arc<S>, bucket: impl Into<String>) -> Self {
    Self {
      storage,
      bucket: bucket.into(),
    }
  }

  pub fn bucket(&self) -> &str {
    &self.bucket
  }

  #[cfg(test)]
  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  async fn blocking<T, F>(&self, f: F) -> Result<T>
  where
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
  {
    run_blocking(Arc::clone(&self.storage), f).await
  }

  /// Whether the current bucket exists and already holds every one of
  /// `requests`.
  pub async fn holds_all(&self, requests: &[Request]) -> Result<bool> {
    let bucket = self.bucket.clone();
    let wanted: Vec<RequestKey> = requests.iter().map(RequestKey::from).collect();
    self
      .blocking(move |s| -> Result<bool> {
        if !s.has(&bucket)? {
          return Ok(false);
        }
        let present = s.entries(&bucket)?;
        Ok(wanted.iter().all(|key| present.contains(key)))
      })
      .await
  }

  /// Fetch every request and store all responses in the current bucket.
  ///
  /// Requests are issued concurrently. If any of them fails or answers with a
  /// non-2xx status, nothing is written.
  pub async fn add_all<F, Fut>(&self, requests: Vec<Request>, fetcher: F) -> Result<usize>
  where
    F: Fn(Request) -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let bucket = self.bucket.clone();
    self.blocking(move |s| s.open(&bucket)).await?;
    debug!(bucket = %self.bucket, "Bucket opened");

    let fetches = requests.into_iter().map(|request| {
      let key = RequestKey::from(&request);
      let url = request.url.clone();
      let pending = fetcher(request);
      async move {
        let response = pending.await?;
        if !response.is_ok() {
          return Err(eyre!(
            "Request for {} failed with status {}",
            url,
            response.status
          ));
        }
        Ok((key, CachedResponse::snapshot(response)))
      }
    });

    let entries = try_join_all(fetches).await?;
    let count = entries.len();

    let bucket = self.bucket.clone();
    self.blocking(move |s| s.add_all(&bucket, &entries)).await?;

    Ok(count)
  }

  /// Resolve a request cache-first.
  ///
  /// 1. Look the request up in the current bucket - a hit is returned as is
  /// 2. On a miss, call `fetcher`
  /// 3. Store a duplicate of `basic` 200 responses in the background
  ///
  /// An error from `fetcher` is returned unchanged.
  pub async fn fetch<F, Fut>(&self, request: &Request, fetcher: F) -> Result<Resolved>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let key = RequestKey::from(request);

    if let Some(cached) = self.lookup(&key).await {
      debug!(%key, "Serving from cache");
      return Ok(Resolved {
        result: CacheResult::from_cache(cached.to_response(&request.url), cached.cached_at),
        write: None,
      });
    }

    debug!(%key, "Cache miss, requesting from network");
    let response = fetcher().await?;

    if !response.is_cacheable() {
      debug!(
        %key,
        status = response.status,
        response_type = response.response_type.as_str(),
        "Response not cacheable"
      );
      return Ok(Resolved {
        result: CacheResult::from_network(response),
        write: None,
      });
    }

    let entry = CachedResponse::snapshot(response.duplicate());
    let write = self.spawn_put(key, entry);

    Ok(Resolved {
      result: CacheResult::from_network(response),
      write: Some(write),
    })
  }

  /// Look up a key, treating storage errors as misses.
  async fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    let bucket = self.bucket.clone();
    let owned = key.clone();
    match self.blocking(move |s| s.match_request(&bucket, &owned)).await {
      Ok(found) => found,
      Err(e) => {
        warn!(%key, "Cache lookup failed, treating as miss: {:#}", e);
        None
      }
    }
  }

  fn spawn_put(&self, key: RequestKey, entry: CachedResponse) -> JoinHandle<()> {
    let storage = Arc::clone(&self.storage);
    let bucket = self.bucket.clone();
    tokio::task::spawn_blocking(move || match storage.put(&bucket, &key, &entry) {
      Ok(()) => debug!(%key, %bucket, "Stored network response"),
      Err(e) => warn!(%key, %bucket, "Failed to store network response: {:#}", e),
    })
  }

  /// Delete every bucket other than the current one, all at once.
  pub async fn delete_stale(&self) -> Result<Vec<Deletion>> {
    let names = self.blocking(|s| s.keys()).await?;

    let deletions = names
      .into_iter()
      .filter(|name| name != &self.bucket)
      .map(|name| {
        let storage = Arc::clone(&self.storage);
        async move {
          let target = name.clone();
          let result = run_blocking(storage, move |s| s.delete(&target)).await;
          Deletion {
            bucket: name,
            result,
          }
        }
      });

    Ok(join_all(deletions).await)
  }
}

/// Run a storage call on the blocking pool.
async fn run_blocking<S, T, F>(storage: Arc<S>, f: F) -> Result<T>
where
  S: CacheStorage + 'static,
  T: Send + 'static,
  F: FnOnce(&S) -> Result<T> + Send + 'static,
{
  tokio::task::spawn_blocking(move || f(&*storage))
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      bucket: self.bucket.clone(),
    }
  }
}

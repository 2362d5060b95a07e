//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::net::{Method, Request, Response, ResponseType};

/// Identity of a cached request: method plus URL, fragment stripped.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: Method,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: Method, url: &url::Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method,
      url: url.to_string(),
    }
  }

  /// Stable, fixed-length hash used as the storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl From<&Request> for RequestKey {
  fn from(request: &Request) -> Self {
    Self::new(request.method, &request.url)
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// A response as it sits in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub status: u16,
  pub status_text: String,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub response_type: ResponseType,
  pub cached_at: DateTime<Utc>,
}

impl CachedResponse {
  /// Take ownership of a response for storage. Callers that still need to
  /// return the response must pass a [`Response::duplicate`] here.
  pub fn snapshot(response: Response) -> Self {
    Self {
      status: response.status,
      status_text: response.status_text,
      headers: response.headers,
      body: response.body,
      response_type: response.response_type,
      cached_at: Utc::now(),
    }
  }

  /// Rebuild a response to hand to a client.
  pub fn to_response(&self, url: &url::Url) -> Response {
    Response {
      status: self.status,
      status_text: self.status_text.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      response_type: self.response_type,
      url: Some(url.clone()),
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Data fetched from the network by the interceptor.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data served from the current bucket.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Synthetic data produced because neither cache nor network could answer.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  /// Data fetched by default host handling, never seen by the interceptor.
  pub fn passthrough(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Passthrough,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Cache miss, answered by the network
  Network,
  /// Cache hit
  Cache,
  /// Network unavailable, answered by the configured offline fallback
  Offline,
  /// Request was not eligible for interception
  Passthrough,
}

impl fmt::Display for CacheSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Passthrough => "passthrough",
    };
    f.pad(label)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;

  #[test]
  fn test_key_ignores_fragment() {
    let a = RequestKey::new(Method::Get, &Url::parse("https://app.test/index.html#top").unwrap());
    let b = RequestKey::new(Method::Get, &Url::parse("https://app.test/index.html").unwrap());
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_distinguishes_method_and_query() {
    let url = Url::parse("https://app.test/data.json").unwrap();
    let get = RequestKey::new(Method::Get, &url);
    let post = RequestKey::new(Method::Post, &url);
    let query = RequestKey::new(Method::Get, &Url::parse("https://app.test/data.json?v=2").unwrap());

    assert_ne!(get.cache_hash(), post.cache_hash());
    assert_ne!(get.cache_hash(), query.cache_hash());
    assert_eq!(get.cache_hash().len(), 64);
  }

  #[test]
  fn test_snapshot_round_trips_to_response() {
    let url = Url::parse("https://app.test/styles.css").unwrap();
    let cached = CachedResponse::snapshot(
      Response::new(200, "body { }").with_header("content-type", "text/css"),
    );
    let response = cached.to_response(&url);

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"body { }");
    assert_eq!(response.url.as_ref(), Some(&url));
    assert_eq!(response.headers.get("content-type").map(String::as_str), Some("text/css"));
  }
}

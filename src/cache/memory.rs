//! In-process storage backend.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::RwLock;

use super::storage::CacheStorage;
use super::traits::{CachedResponse, RequestKey};

#[derive(Debug, Default)]
struct Bucket {
  entries: BTreeMap<RequestKey, CachedResponse>,
  /// Insertion order of keys
  order: Vec<RequestKey>,
}

impl Bucket {
  fn insert(&mut self, key: RequestKey, response: CachedResponse) {
    self.order.retain(|k| k != &key);
    self.order.push(key.clone());
    self.entries.insert(key, response);
  }
}

/// Storage that lives only as long as the process.
///
/// Buckets are kept in creation order. `add_all` stages a full copy of the
/// bucket and swaps it in only once every entry has been applied.
#[derive(Debug, Default)]
pub struct MemoryStorage {
  buckets: RwLock<Vec<(String, Bucket)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn open(&self, bucket: &str) -> Result<()> {
    let mut buckets = self
      .buckets
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if !buckets.iter().any(|(name, _)| name == bucket) {
      buckets.push((bucket.to_string(), Bucket::default()));
    }
    Ok(())
  }

  fn has(&self, bucket: &str) -> Result<bool> {
    let buckets = self
      .buckets
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.iter().any(|(name, _)| name == bucket))
  }

  fn add_all(&self, bucket: &str, entries: &[(RequestKey, CachedResponse)]) -> Result<()> {
    let mut buckets = self
      .buckets
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut staged = Bucket::default();
    if let Some((_, existing)) = buckets.iter().find(|(name, _)| name == bucket) {
      staged.entries = existing.entries.clone();
      staged.order = existing.order.clone();
    }
    for (key, response) in entries {
      staged.insert(key.clone(), response.clone());
    }

    match buckets.iter_mut().find(|(name, _)| name == bucket) {
      Some((_, slot)) => *slot = staged,
      None => buckets.push((bucket.to_string(), staged)),
    }
    Ok(())
  }

  fn match_request(&self, bucket: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let buckets = self
      .buckets
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      buckets
        .iter()
        .find(|(name, _)| name == bucket)
        .and_then(|(_, b)| b.entries.get(key).cloned()),
    )
  }

  fn put(&self, bucket: &str, key: &RequestKey, response: &CachedResponse) -> Result<()> {
    let mut buckets = self
      .buckets
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    match buckets.iter_mut().find(|(name, _)| name == bucket) {
      Some((_, b)) => b.insert(key.clone(), response.clone()),
      None => {
        let mut b = Bucket::default();
        b.insert(key.clone(), response.clone());
        buckets.push((bucket.to_string(), b));
      }
    }
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let buckets = self
      .buckets
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(buckets.iter().map(|(name, _)| name.clone()).collect())
  }

  fn delete(&self, bucket: &str) -> Result<bool> {
    let mut buckets = self
      .buckets
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let before = buckets.len();
    buckets.retain(|(name, _)| name != bucket);
    Ok(buckets.len() < before)
  }

  fn entries(&self, bucket: &str) -> Result<Vec<RequestKey>> {
    let buckets = self
      .buckets
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    Ok(
      buckets
        .iter()
        .find(|(name, _)| name == bucket)
        .map(|(_, b)| b.order.clone())
        .unwrap_or_default(),
    )
  }
}

//! In-process cache storage.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::storage::{CacheStorage, CachedResponse};
use crate::fetch::FetchResponse;

/// Storage that lives as long as the process. Stores keep creation order.
#[derive(Default)]
pub struct MemoryStorage {
  stores: Mutex<Vec<(String, BTreeMap<String, CachedResponse>)>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

fn find<'a>(
  stores: &'a mut [(String, BTreeMap<String, CachedResponse>)],
  name: &str,
) -> Option<&'a mut BTreeMap<String, CachedResponse>> {
  stores
    .iter_mut()
    .find(|(n, _)| n == name)
    .map(|(_, entries)| entries)
}

impl CacheStorage for MemoryStorage {
  fn keys(&self) -> Result<Vec<String>> {
    let stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(stores.iter().map(|(n, _)| n.clone()).collect())
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = stores.len();
    stores.retain(|(n, _)| n != name);
    Ok(stores.len() != before)
  }

  fn lookup(&self, name: &str, key: &str) -> Result<Option<CachedResponse>> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(find(&mut stores, name).and_then(|entries| entries.get(key).cloned()))
  }

  fn put(&self, name: &str, key: &str, response: &FetchResponse) -> Result<()> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let entries =
      find(&mut stores, name).ok_or_else(|| eyre!("Cache store {} does not exist", name))?;
    entries.insert(
      key.to_string(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, name: &str, entries: &[(String, FetchResponse)]) -> Result<()> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if find(&mut stores, name).is_none() {
      stores.push((name.to_string(), BTreeMap::new()));
    }
    let store = find(&mut stores, name).ok_or_else(|| eyre!("Cache store {} vanished", name))?;

    let now = Utc::now();
    for (key, response) in entries {
      store.insert(
        key.clone(),
        CachedResponse {
          response: response.clone(),
          cached_at: now,
        },
      );
    }
    Ok(())
  }

  fn entry_keys(&self, name: &str) -> Result<Vec<String>> {
    let mut stores = self
      .stores
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      find(&mut stores, name)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_keep_creation_order() {
    let storage = MemoryStorage::new();
    storage.put_all("b", &[]).unwrap();
    storage.put_all("a", &[]).unwrap();
    storage.put_all("b", &[]).unwrap();
    assert_eq!(storage.keys().unwrap(), vec!["b", "a"]);
  }

  #[test]
  fn test_put_into_missing_store_fails() {
    let storage = MemoryStorage::new();
    assert!(storage.put("gone", "k", &FetchResponse::new(200, "x")).is_err());
    assert!(storage.keys().unwrap().is_empty());
  }
}

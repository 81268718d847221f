//! Core types returned by the worker.

use chrono::{DateTime, Utc};

/// Result from an intercepted request, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Fresh network data that went through the cache-first path.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Data replayed from the current generation.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Network data that skipped the cache entirely.
  pub fn bypass(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Bypass,
      cached_at: None,
    }
  }
}

/// Indicates how a request was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Cache miss, fetched from network and stored
  Network,
  /// Cache hit, a background refresh was started
  Cache,
  /// Never looked at the cache (excluded URL, non-GET, or worker not in control)
  Bypass,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Bypass => "bypass",
    };
    f.write_str(s)
  }
}

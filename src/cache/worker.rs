//! The offline cache worker.
//!
//! Lifecycle is install → activate → intercept. Install fills the store named
//! by the current [`CacheVersion`] from the [`AssetManifest`], activate prunes
//! every other store, and from then on [`Worker::handle_fetch`] serves
//! requests cache-first with a background refresh. Until activation, requests
//! are served from the newest complete generation left by an earlier version,
//! if there is one.

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::exclude::ExcludeRules;
use super::manifest::AssetManifest;
use super::storage::CacheStorage;
use super::traits::CacheResult;
use super::version::CacheVersion;
use crate::fetch::{FetchRequest, FetchResponse, Fetcher};

/// Manifest fetches in flight during install.
pub const DEFAULT_INSTALL_CONCURRENCY: usize = 6;

/// Where the worker is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Created, nothing installed for this version yet
  Parsed,
  Installing,
  /// Current generation is complete, stale generations may still exist
  Installed,
  Activating,
  /// Current generation is the only one; requests are served from it
  Activated,
  /// Unregistered; every request goes straight to the network
  Redundant,
}

impl std::fmt::Display for Phase {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      Phase::Parsed => "parsed",
      Phase::Installing => "installing",
      Phase::Installed => "installed",
      Phase::Activating => "activating",
      Phase::Activated => "activated",
      Phase::Redundant => "redundant",
    };
    f.write_str(s)
  }
}

/// Everything that identifies one worker generation.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
  pub version: CacheVersion,
  pub manifest: AssetManifest,
  pub exclude: ExcludeRules,
  pub install_concurrency: usize,
}

/// Snapshot of the worker and the stores it can see.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
  pub version: String,
  pub phase: Phase,
  /// Store requests are served from, if any
  pub serving: Option<String>,
  /// Store name and entry count, oldest store first
  pub stores: Vec<(String, usize)>,
}

/// Run a storage operation on the blocking pool.
async fn run_blocking<S, T, G>(storage: Arc<S>, op: G) -> Result<T>
where
  S: CacheStorage + 'static,
  T: Send + 'static,
  G: FnOnce(&S) -> Result<T> + Send + 'static,
{
  tokio::task::spawn_blocking(move || op(&storage))
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
}

pub struct Worker<S, F> {
  options: WorkerOptions,
  storage: Arc<S>,
  fetcher: Arc<F>,
  phase: RwLock<Phase>,
  /// Generation left by an earlier version, served until this one activates
  previous: RwLock<Option<String>>,
  /// Serializes install, activate and unregister
  lifecycle: Mutex<()>,
  refreshes: TaskTracker,
}

impl<S, F> Worker<S, F>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  /// Create a worker over existing storage, resuming from whatever
  /// generations are already there.
  pub async fn new(options: WorkerOptions, storage: S, fetcher: F) -> Result<Self> {
    let storage = Arc::new(storage);
    let keys = run_blocking(Arc::clone(&storage), |s| s.keys()).await?;

    let version = options.version.as_str();
    let phase = if keys.iter().any(|k| k == version) {
      if keys.len() == 1 {
        Phase::Activated
      } else {
        Phase::Installed
      }
    } else {
      Phase::Parsed
    };
    // Stores are only ever created whole, so any survivor is complete
    let previous = match phase {
      Phase::Activated => None,
      _ => keys.iter().rev().find(|k| *k != version).cloned(),
    };
    debug!(%version, %phase, previous = ?previous, stores = keys.len(), "worker resumed");

    Ok(Self {
      options,
      storage,
      fetcher: Arc::new(fetcher),
      phase: RwLock::new(phase),
      previous: RwLock::new(previous),
      lifecycle: Mutex::new(()),
      refreshes: TaskTracker::new(),
    })
  }

  pub fn version(&self) -> &CacheVersion {
    &self.options.version
  }

  pub async fn phase(&self) -> Phase {
    *self.phase.read().await
  }

  /// The store requests are currently served from.
  ///
  /// The current generation once activated, otherwise the generation an
  /// earlier version left behind. `None` means requests pass straight
  /// through to the network.
  pub async fn serving_store(&self) -> Option<String> {
    let phase = self.phase.read().await;
    match *phase {
      Phase::Activated => Some(self.version().to_string()),
      Phase::Parsed | Phase::Installing | Phase::Installed => self.previous.read().await.clone(),
      Phase::Activating | Phase::Redundant => None,
    }
  }

  /// Fetch every manifest asset and write them into the current generation.
  ///
  /// All or nothing: a single failed fetch or non-2xx response fails the
  /// install and nothing is written.
  pub async fn install(&self) -> Result<()> {
    let _lifecycle = self.lifecycle.lock().await;

    let previous = self.phase().await;
    if previous == Phase::Redundant {
      return Err(eyre!("Worker {} was unregistered", self.version()));
    }
    // Reinstalling the live generation keeps it in control meanwhile
    if previous != Phase::Activated {
      *self.phase.write().await = Phase::Installing;
    }

    info!(version = %self.version(), assets = self.options.manifest.len(), "installing");

    match self.populate().await {
      Ok(count) => {
        if previous != Phase::Activated {
          *self.phase.write().await = Phase::Installed;
        }
        info!(version = %self.version(), cached = count, "installed");
        Ok(())
      }
      Err(e) => {
        *self.phase.write().await = previous;
        error!(version = %self.version(), error = %format!("{:#}", e), "install failed");
        Err(e)
      }
    }
  }

  async fn populate(&self) -> Result<usize> {
    let urls: Vec<_> = self
      .options
      .manifest
      .urls()
      .iter()
      .filter(|url| {
        let excluded = self.options.exclude.matches(url);
        if excluded {
          warn!(%url, "manifest entry is excluded from caching, skipping");
        }
        !excluded
      })
      .cloned()
      .collect();

    let entries: Vec<(String, FetchResponse)> = stream::iter(urls)
      .map(|url| {
        let fetcher = Arc::clone(&self.fetcher);
        async move {
          let request = FetchRequest::get(url);
          let response = fetcher
            .fetch(&request)
            .await
            .wrap_err_with(|| format!("Failed to fetch manifest asset {}", request.url))?;
          if !response.is_cacheable() {
            return Err(eyre!(
              "Manifest asset {} returned HTTP {}",
              request.url,
              response.status
            ));
          }
          debug!(url = %request.url, bytes = response.body.len(), "fetched manifest asset");
          Ok::<_, color_eyre::Report>((request.url.to_string(), response))
        }
      })
      .buffered(self.options.install_concurrency.max(1))
      .try_collect()
      .await?;

    let count = entries.len();
    let version = self.version().to_string();
    run_blocking(Arc::clone(&self.storage), move |s| {
      s.put_all(&version, &entries)
    })
    .await?;

    Ok(count)
  }

  /// Delete every store except the current generation.
  ///
  /// Requests wait until pruning is done. A store that fails to delete is
  /// logged and left for the next activation.
  pub async fn activate(&self) -> Result<()> {
    let _lifecycle = self.lifecycle.lock().await;
    let mut phase = self.phase.write().await;
    let previous = *phase;

    match previous {
      Phase::Installed | Phase::Activated => {}
      other => {
        return Err(eyre!(
          "Cannot activate {} while {}",
          self.version(),
          other
        ))
      }
    }
    *phase = Phase::Activating;
    info!(version = %self.version(), "activating");

    let keys = match run_blocking(Arc::clone(&self.storage), |s| s.keys()).await {
      Ok(keys) => keys,
      Err(e) => {
        *phase = previous;
        return Err(e.wrap_err("Failed to list cache stores"));
      }
    };

    let current = self.version().as_str();
    let deletions = keys.into_iter().filter(|k| k != current).map(|name| {
      let storage = Arc::clone(&self.storage);
      async move {
        let target = name.clone();
        let result = run_blocking(storage, move |s| s.delete(&target)).await;
        (name, result)
      }
    });

    for (name, result) in futures::future::join_all(deletions).await {
      match result {
        Ok(_) => info!(store = %name, "deleted stale cache"),
        Err(e) => warn!(store = %name, error = %e, "failed to delete stale cache"),
      }
    }

    *self.previous.write().await = None;
    *phase = Phase::Activated;
    info!(version = %self.version(), "activated");
    Ok(())
  }

  /// Delete every store, the current one included, and stop intercepting.
  pub async fn unregister(&self) -> Result<()> {
    let _lifecycle = self.lifecycle.lock().await;
    let mut phase = self.phase.write().await;

    let keys = run_blocking(Arc::clone(&self.storage), |s| s.keys()).await?;
    for name in keys {
      let target = name.clone();
      run_blocking(Arc::clone(&self.storage), move |s| s.delete(&target))
        .await
        .wrap_err_with(|| format!("Failed to delete cache store {}", name))?;
      info!(store = %name, "deleted cache");
    }

    *self.previous.write().await = None;
    *phase = Phase::Redundant;
    info!(version = %self.version(), "unregistered");
    Ok(())
  }

  /// Serve one intercepted request.
  ///
  /// Excluded URLs, non-GET and ranged requests, and requests arriving while
  /// there is no store to serve from go straight to the network and are never
  /// stored. Everything else is served cache-first; network errors propagate
  /// only when there is no cached copy.
  pub async fn handle_fetch(&self, request: FetchRequest) -> Result<CacheResult<FetchResponse>> {
    let (store, key) = match (self.serving_store().await, request.cache_key()) {
      (Some(store), Some(key)) if !self.options.exclude.matches(&request.url) => (store, key),
      (store, _) => {
        debug!(method = %request.method, url = %request.url, store = ?store, "bypassing cache");
        let response = self.fetcher.fetch(&request).await?;
        return Ok(CacheResult::bypass(response));
      }
    };

    let lookup = {
      let store = store.clone();
      let key = key.clone();
      run_blocking(Arc::clone(&self.storage), move |s| s.lookup(&store, &key)).await
    };

    match lookup {
      Ok(Some(cached)) => {
        debug!(url = %request.url, %store, "cache hit");
        self.spawn_refresh(request, store, key);
        Ok(CacheResult::from_cache(cached.response, cached.cached_at))
      }
      Ok(None) => {
        debug!(url = %request.url, %store, "cache miss");
        self.fetch_and_store(request, store, key).await
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache lookup failed, treating as miss");
        self.fetch_and_store(request, store, key).await
      }
    }
  }

  async fn fetch_and_store(
    &self,
    request: FetchRequest,
    store: String,
    key: String,
  ) -> Result<CacheResult<FetchResponse>> {
    let response = self.fetcher.fetch(&request).await?;

    if response.is_cacheable() {
      let stored = response.clone();
      if let Err(e) = run_blocking(Arc::clone(&self.storage), move |s| {
        s.put(&store, &key, &stored)
      })
      .await
      {
        warn!(url = %request.url, error = %e, "failed to cache response");
      }
    } else {
      debug!(url = %request.url, status = response.status, "not caching incomplete or unsuccessful response");
    }

    Ok(CacheResult::from_network(response))
  }

  /// Refetch a cache hit so the next request sees fresh data. Does not delay
  /// the response already being returned.
  fn spawn_refresh(&self, request: FetchRequest, store: String, key: String) {
    let fetcher = Arc::clone(&self.fetcher);
    let storage = Arc::clone(&self.storage);

    self.refreshes.spawn(async move {
      let url = request.url.clone();
      match fetcher.fetch(&request).await {
        Ok(response) if response.is_cacheable() => {
          match run_blocking(storage, move |s| s.put(&store, &key, &response)).await {
            Ok(()) => debug!(%url, "refreshed cache entry"),
            Err(e) => warn!(%url, error = %e, "failed to store refreshed response"),
          }
        }
        Ok(response) => {
          debug!(%url, status = response.status, "refresh returned uncacheable response, keeping cached copy")
        }
        Err(e) => warn!(%url, error = %e, "background refresh failed"),
      }
    });
  }

  /// Wait for every background refresh started so far.
  pub async fn flush_refreshes(&self) {
    self.refreshes.close();
    self.refreshes.wait().await;
    self.refreshes.reopen();
  }

  pub async fn status(&self) -> Result<WorkerStatus> {
    let phase = self.phase().await;
    let serving = self.serving_store().await;
    let stores = run_blocking(Arc::clone(&self.storage), |s| {
      s.keys()?
        .into_iter()
        .map(|name| {
          let count = s.entry_keys(&name)?.len();
          Ok((name, count))
        })
        .collect::<Result<Vec<_>>>()
    })
    .await?;

    Ok(WorkerStatus {
      version: self.version().to_string(),
      phase,
      serving,
      stores,
    })
  }
}

//! Versioned offline cache.
//!
//! This module owns the cache generations of one web application:
//! - Names the current generation from a build token and optional salt
//! - Pre-caches the asset manifest on install (all or nothing)
//! - Prunes every other generation on activate
//! - Serves intercepted requests cache-first with a background refresh,
//!   except for excluded URLs which always go to the network

mod exclude;
mod manifest;
mod memory;
mod storage;
mod traits;
mod version;
mod worker;

pub use exclude::{ExcludeRules, FEATURE_FLAGS_PATH};
pub use manifest::AssetManifest;
pub use memory::MemoryStorage;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
pub use version::CacheVersion;
pub use worker::{Phase, Worker, WorkerOptions, WorkerStatus, DEFAULT_INSTALL_CONCURRENCY};

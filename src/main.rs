mod cache;
mod config;
mod fetch;
mod proxy;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheStorage, MemoryStorage, SqliteStorage, Worker, WorkerOptions};
use config::{Config, StorageBackend};
use fetch::{FetchRequest, ReqwestFetcher};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline-first versioned cache for static web apps")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./swcache.yaml or $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Build token naming the cache generation (overrides SWCACHE_BUILD_TAG and config)
  #[arg(long)]
  build: Option<String>,

  /// Salt appended to the build token, bump to force a fresh generation
  #[arg(long)]
  salt: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the asset manifest into the current generation
  Install,
  /// Delete every generation except the current one
  Activate,
  /// Install, activate, then proxy the origin offline-first
  Serve {
    /// Address to listen on (overrides proxy.listen)
    #[arg(short, long)]
    listen: Option<SocketAddr>,
  },
  /// Send one GET through the worker
  Fetch {
    /// Path relative to the origin, or an absolute URL
    target: String,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Show the current generation and every cache store
  Status,
  /// Delete every generation, the current one included
  Unregister,
}

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g., RUST_LOG=swcache=debug).
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path.parent().unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let appender = tracing_appender::rolling::never(dir, name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      (
        Some(fmt::layer().with_writer(writer).with_ansi(false)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .with(filter)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(salt) = args.salt {
    config.version.salt = salt;
  }

  let _log_guard = init_tracing(config.log_file.as_deref())?;

  let build = args.build.or_else(Config::build_tag_from_env);
  let options = config.worker_options(build.as_deref())?;
  info!(version = %options.version, assets = options.manifest.len(), "swcache starting");

  match config.storage.backend {
    StorageBackend::Sqlite => {
      let storage = SqliteStorage::open_at(config.storage.path.as_deref())?;
      run(args.command, &config, options, storage).await
    }
    StorageBackend::Memory => run(args.command, &config, options, MemoryStorage::new()).await,
  }
}

async fn run<S>(command: Command, config: &Config, options: WorkerOptions, storage: S) -> Result<()>
where
  S: CacheStorage + 'static,
{
  let worker = Worker::new(options, storage, ReqwestFetcher::new()?).await?;

  match command {
    Command::Install => worker.install().await,
    Command::Activate => worker.activate().await,
    Command::Serve { listen } => {
      match worker.install().await {
        Ok(()) => worker.activate().await?,
        // Already logged by install; say what the proxy falls back to
        Err(_) => match worker.serving_store().await {
          Some(store) if store == worker.version().as_str() => {
            warn!(%store, "install failed, still serving the installed generation")
          }
          Some(store) => warn!(%store, "install failed, serving the previous generation"),
          None => error!("install failed, serving without offline cache"),
        },
      }
      let listen = listen.unwrap_or(config.proxy.listen);
      proxy::serve(Arc::new(worker), config.origin.clone(), listen).await
    }
    Command::Fetch { target, output } => {
      let url = match Url::parse(&target) {
        Ok(url) => url,
        Err(_) => config
          .origin
          .join(&target)
          .map_err(|e| eyre!("Invalid target '{}': {}", target, e))?,
      };

      let result = worker.handle_fetch(FetchRequest::get(url.clone())).await;
      worker.flush_refreshes().await;
      let result = result?;

      let content_type = result.data.header("content-type").unwrap_or("-");
      match result.cached_at {
        Some(at) => eprintln!(
          "{} {} [{}] ({}, cached {})",
          result.data.status, url, content_type, result.source, at
        ),
        None => eprintln!(
          "{} {} [{}] ({})",
          result.data.status, url, content_type, result.source
        ),
      }
      match output {
        Some(path) => std::fs::write(&path, &result.data.body)
          .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
        None => std::io::stdout().write_all(&result.data.body)?,
      }
      Ok(())
    }
    Command::Status => {
      let status = worker.status().await?;
      println!("version: {}", status.version);
      println!("phase:   {}", status.phase);
      println!("serving: {}", status.serving.as_deref().unwrap_or("(network only)"));
      if status.stores.is_empty() {
        println!("stores:  (none)");
      } else {
        println!("stores:");
        for (name, entries) in status.stores {
          let marker = if Some(&name) == status.serving.as_ref() { "*" } else { " " };
          println!("  {} {} ({} entries)", marker, name, entries);
        }
      }
      Ok(())
    }
    Command::Unregister => worker.unregister().await,
  }
}

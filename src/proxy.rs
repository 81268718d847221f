//! Offline-first reverse proxy.
//!
//! Every request that reaches the proxy is rewritten onto the application's
//! origin and handed to the worker, so the browser sees cache-first
//! responses without needing a service worker of its own.

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use color_eyre::{eyre::eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheStorage, Worker};
use crate::fetch::{is_hop_by_hop, FetchRequest, FetchResponse, Fetcher};

struct ProxyState<S, F> {
  worker: Arc<Worker<S, F>>,
  origin: Url,
}

/// Router that sends every path through the worker.
pub fn router<S, F>(worker: Arc<Worker<S, F>>, origin: Url) -> Router
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  let state = Arc::new(ProxyState { worker, origin });
  Router::new()
    .fallback(intercept::<S, F>)
    .with_state(state)
}

/// Serve until Ctrl-C, then wait for pending background refreshes.
pub async fn serve<S, F>(worker: Arc<Worker<S, F>>, origin: Url, listen: SocketAddr) -> Result<()>
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  let app = router(Arc::clone(&worker), origin.clone());

  let listener = tokio::net::TcpListener::bind(listen)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", listen, e))?;
  info!(%listen, %origin, "proxy listening");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| eyre!("Proxy server error: {}", e))?;

  info!("proxy stopped, waiting for background refreshes");
  worker.flush_refreshes().await;
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!(error = %e, "failed to listen for Ctrl-C");
    std::future::pending::<()>().await;
  }
}

async fn intercept<S, F>(
  State(state): State<Arc<ProxyState<S, F>>>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> Response
where
  S: CacheStorage + 'static,
  F: Fetcher,
{
  // Keep the origin's host even for paths like "//other.host/x"
  let mut url = state.origin.clone();
  url.set_path(uri.path());
  url.set_query(uri.query());

  let request = FetchRequest {
    method,
    url,
    headers: headers
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect(),
    body: (!body.is_empty()).then_some(body),
  };

  let url = request.url.clone();
  match state.worker.handle_fetch(request).await {
    Ok(result) => {
      debug!(%url, source = %result.source, status = result.data.status, "served");
      into_response(result.data)
    }
    Err(e) => {
      warn!(%url, error = %format!("{:#}", e), "request failed with nothing cached");
      (StatusCode::BAD_GATEWAY, format!("{:#}", e)).into_response()
    }
  }
}

fn into_response(response: FetchResponse) -> Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);

  let mut headers = HeaderMap::new();
  for (name, value) in &response.headers {
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        headers.append(name, value);
      }
      _ => debug!(header = %name, "dropping unrepresentable header"),
    }
  }

  (status, headers, Body::from(response.body)).into_response()
}

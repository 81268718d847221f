//! Scripted network for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{FetchError, FetchRequest, FetchResponse, Fetcher};

#[derive(Default)]
pub struct MockFetcher {
  routes: Mutex<HashMap<String, FetchResponse>>,
  calls: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
  latency: Mutex<Duration>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Serve `body` with status 200 for `url`.
  pub fn route(&self, url: &str, body: &str) {
    self.route_response(url, FetchResponse::new(200, body.to_string()));
  }

  pub fn route_response(&self, url: &str, response: FetchResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Delay every response by `latency`.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  pub fn calls(&self, url: &str) -> usize {
    self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
    let url = request.url.as_str().to_string();
    *self.calls.lock().unwrap().entry(url.clone()).or_default() += 1;

    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Transport {
        url,
        source: Box::new(std::io::Error::new(
          std::io::ErrorKind::ConnectionRefused,
          "network unreachable",
        )),
      });
    }

    let response = self.routes.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| FetchResponse::new(404, "not found")))
  }
}

// Lets tests keep a handle on the mock after handing it to a worker.
#[async_trait]
impl Fetcher for std::sync::Arc<MockFetcher> {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
    self.as_ref().fetch(request).await
  }
}

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use tracing::trace;

use super::{is_hop_by_hop, FetchError, FetchRequest, FetchResponse, Fetcher};

/// Headers reqwest computes itself from the target URL and body.
const REQUEST_MANAGED_HEADERS: &[&str] = &["host", "content-length"];

/// Network fetcher backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestFetcher {
  client: reqwest::Client,
}

impl ReqwestFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("swcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self::with_client(client))
  }

  pub fn with_client(client: reqwest::Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl Fetcher for ReqwestFetcher {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
    let url = request.url.as_str().to_string();

    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      if is_hop_by_hop(name)
        || REQUEST_MANAGED_HEADERS
          .iter()
          .any(|h| h.eq_ignore_ascii_case(name))
      {
        continue;
      }
      builder = builder.header(name.as_str(), value.as_str());
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| FetchError::Transport {
      url: url.clone(),
      source: e.into(),
    })?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(|e| FetchError::Body {
      url: url.clone(),
      source: e.into(),
    })?;

    trace!(%url, status, bytes = body.len(), "network response");

    Ok(FetchResponse {
      status,
      headers,
      body,
    })
  }
}

//! Network primitives used by the worker.
//!
//! The worker never talks to reqwest directly; it goes through the [`Fetcher`]
//! trait so tests can swap the network out for a scripted one.

mod client;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Method;
use url::Url;

pub use client::ReqwestFetcher;

/// Headers that describe a single connection and must not be replayed.
const HOP_BY_HOP_HEADERS: &[&str] = &[
  "connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Returns true if the header is connection-scoped and should be dropped when
/// forwarding or storing.
pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP_HEADERS
    .iter()
    .any(|h| h.eq_ignore_ascii_case(name))
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Bytes>,
}

impl FetchRequest {
  /// Plain GET with no headers, as issued by the installer.
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  /// Key under which the response is stored in a cache generation.
  ///
  /// Only whole-resource GETs have one; ranged and non-GET requests always go
  /// to the network. The fragment never reaches the server and is not part
  /// of the key.
  pub fn cache_key(&self) -> Option<String> {
    if self.method != Method::GET || self.header("range").is_some() {
      return None;
    }
    let mut url = self.url.clone();
    url.set_fragment(None);
    Some(url.into())
  }
}

/// A response as delivered by the network or replayed from a cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl FetchResponse {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  #[cfg(test)]
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// A complete 2xx response. Only these are ever written to a cache store;
  /// 206 Partial Content is a fragment of the resource and never is.
  pub fn is_cacheable(&self) -> bool {
    (200..300).contains(&self.status) && self.status != 206
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

/// Network failure. HTTP error statuses are not failures; they come back as
/// a [`FetchResponse`].
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("request to {url} failed: {source}")]
  Transport {
    url: String,
    #[source]
    source: BoxError,
  },
  #[error("failed to read response body from {url}: {source}")]
  Body {
    url: String,
    #[source]
    source: BoxError,
  },
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The network as seen by the worker.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_cache_key_is_get_only() {
    let url = Url::parse("https://food.example/index.html").unwrap();
    let get = FetchRequest::get(url.clone());
    assert_eq!(get.cache_key().as_deref(), Some("https://food.example/index.html"));

    let post = FetchRequest {
      method: Method::POST,
      ..get
    };
    assert_eq!(post.cache_key(), None);
  }

  #[test]
  fn test_cache_key_ignores_fragment() {
    let url = Url::parse("https://food.example/a.js#top").unwrap();
    assert_eq!(
      FetchRequest::get(url).cache_key().as_deref(),
      Some("https://food.example/a.js")
    );
  }

  #[test]
  fn test_range_request_has_no_cache_key() {
    let mut request = FetchRequest::get(Url::parse("https://food.example/video.mp4").unwrap());
    request.headers.push(("Range".to_string(), "bytes=0-2".to_string()));
    assert_eq!(request.cache_key(), None);
  }

  #[test]
  fn test_hop_by_hop() {
    assert!(is_hop_by_hop("Transfer-Encoding"));
    assert!(is_hop_by_hop("connection"));
    assert!(!is_hop_by_hop("content-type"));
  }

  #[test]
  fn test_response_header_lookup() {
    let resp = FetchResponse::new(200, "{}").with_header("Content-Type", "application/json");
    assert_eq!(resp.header("content-type"), Some("application/json"));
    assert!(resp.is_cacheable());
    assert!(!FetchResponse::new(404, "").is_cacheable());
    assert!(!FetchResponse::new(206, "par").is_cacheable());
  }
}

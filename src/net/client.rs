use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use super::types::{Request, Response};

/// Failure to obtain any HTTP response.
///
/// An error status (4xx/5xx) is never a `FetchError`: it is a completed fetch
/// and comes back as an ordinary [`Response`].
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("transport failure for {url}: {message}")]
  Transport { url: String, message: String },
  #[error("invalid request for {url}: {message}")]
  InvalidRequest { url: String, message: String },
}

impl FetchError {
  pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
    Self::Transport {
      url: url.into(),
      message: message.to_string(),
    }
  }
}

/// Network layer used by the caching strategies and the sync queue.
#[async_trait]
pub trait Fetcher: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// reqwest-backed fetcher
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    let invalid = |message: String| FetchError::InvalidRequest {
      url: url.clone(),
      message,
    };

    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| invalid(e.to_string()))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
      let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
      headers.insert(name, value);
    }

    let mut builder = self
      .client
      .request(method, request.url.clone())
      .headers(headers);
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::transport(&url, e))?;

    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    // A body that breaks off mid-stream is as good as no response at all
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::transport(&url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}

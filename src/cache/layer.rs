//! Cache layer that orchestrates caching strategies with network fetching.

use chrono::Duration;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::storage::CacheStore;
use super::traits::{CacheEntry, PutOptions, Resolved};
use crate::net::{FetchError, Fetcher, Request, Response};

/// Where a strategy reads and writes, and the bounds applied to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
  /// Physical partition name
  pub cache_name: String,
  /// Partition holding the offline page
  pub shell_cache: String,
  /// Entries older than this are stale
  pub max_age: Option<Duration>,
  pub max_entries: Option<usize>,
}

/// Cache layer that resolves requests against the store and the network.
///
/// Storage errors never reach the caller: a failed read is a miss and a
/// failed write is logged and dropped.
#[derive(Clone)]
pub struct CacheLayer {
  store: Arc<CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  /// Normalized URL of the offline page inside the shell partition
  offline_key: String,
}

impl CacheLayer {
  pub fn new(store: Arc<CacheStore>, fetcher: Arc<dyn Fetcher>, offline_key: String) -> Self {
    Self {
      store,
      fetcher,
      offline_key,
    }
  }

  /// Cache-first resolution.
  ///
  /// 1. Cached entry present - return it; if stale, refresh in the background
  /// 2. Missing - fetch from network, store, return
  /// 3. Missing and network failed - the error propagates
  pub async fn cache_first(
    &self,
    request: &Request,
    target: &Target,
  ) -> Result<Resolved, FetchError> {
    if let Some(entry) = self.lookup(target, request) {
      let stale = self.is_stale(&entry, target);
      if stale {
        debug!(url = %request.url, cache = %target.cache_name, "stale hit, refreshing");
        // Detached: the caller already has its answer
        drop(self.spawn_fetch_and_store(request.clone(), target.clone()));
      } else {
        debug!(url = %request.url, cache = %target.cache_name, "fresh hit");
      }
      return Ok(Resolved::from_cache(entry, stale));
    }

    let response = self.fetcher.fetch(request).await?;
    self.store_response(request, target, &response);
    Ok(Resolved::from_network(response))
  }

  /// Network-first resolution.
  ///
  /// Any HTTP status is returned as-is. Only a transport failure falls back;
  /// an invalid request is returned to the caller. The fallback order is
  /// cached entry (regardless of age), then the offline page for
  /// navigations, then a synthetic 503.
  pub async fn network_first(
    &self,
    request: &Request,
    target: &Target,
  ) -> Result<Resolved, FetchError> {
    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_response(request, target, &response);
        Ok(Resolved::from_network(response))
      }
      Err(e @ FetchError::InvalidRequest { .. }) => Err(e),
      Err(e) => {
        warn!(url = %request.url, error = %e, "network failed, falling back");

        if let Some(entry) = self.lookup(target, request) {
          return Ok(Resolved::offline(entry));
        }
        if request.is_navigation() {
          return Ok(self.offline_page(target));
        }
        Ok(Resolved::synthetic(offline_json()))
      }
    }
  }

  /// Stale-while-revalidate resolution.
  ///
  /// A network fetch always starts. Any cached entry answers immediately;
  /// without one the caller waits for that same fetch, and falls back to
  /// the offline page if it fails.
  pub async fn stale_while_revalidate(
    &self,
    request: &Request,
    target: &Target,
  ) -> Result<Resolved, FetchError> {
    let cached = self.lookup(target, request);
    let refresh = self.spawn_fetch_and_store(request.clone(), target.clone());

    if let Some(entry) = cached {
      // The refresh keeps running detached
      drop(refresh);
      let stale = self.is_stale(&entry, target);
      return Ok(Resolved::from_cache(entry, stale));
    }

    match refresh.await {
      Ok(Ok(response)) => Ok(Resolved::from_network(response)),
      Ok(Err(e @ FetchError::InvalidRequest { .. })) => Err(e),
      Ok(Err(e)) => {
        warn!(url = %request.url, error = %e, "network failed with nothing cached");
        Ok(self.offline_page(target))
      }
      Err(e) => {
        warn!(url = %request.url, error = %e, "refresh task failed");
        Ok(self.offline_page(target))
      }
    }
  }

  /// Fetch `request` and write the result into `target` on a new task.
  fn spawn_fetch_and_store(
    &self,
    request: Request,
    target: Target,
  ) -> JoinHandle<Result<Response, FetchError>> {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.fetcher.fetch(&request).await {
        Ok(response) => {
          layer.store_response(&request, &target, &response);
          Ok(response)
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "background fetch failed");
          Err(e)
        }
      }
    })
  }

  /// Write a successful response; anything else is left out of the cache.
  fn store_response(&self, request: &Request, target: &Target, response: &Response) {
    if !response.is_success() {
      return;
    }

    let options = PutOptions {
      max_entries: target.max_entries,
    };
    if let Err(e) = self
      .store
      .put(&target.cache_name, &request.identity(), response, options)
    {
      warn!(url = %request.url, cache = %target.cache_name, error = %e, "failed to cache response");
    }
  }

  fn lookup(&self, target: &Target, request: &Request) -> Option<CacheEntry> {
    match self.store.get(&target.cache_name, &request.identity()) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = %request.url, cache = %target.cache_name, error = %e, "cache read failed");
        None
      }
    }
  }

  fn is_stale(&self, entry: &CacheEntry, target: &Target) -> bool {
    target
      .max_age
      .map(|max_age| self.store.is_stale(entry, max_age))
      .unwrap_or(false)
  }

  /// The cached offline page, or a built-in one if the shell never got it.
  pub fn offline_page(&self, target: &Target) -> Resolved {
    match self.store.get(&target.shell_cache, &self.offline_key) {
      Ok(Some(entry)) => Resolved::synthetic(entry.to_response()),
      Ok(None) => Resolved::synthetic(builtin_offline_page()),
      Err(e) => {
        warn!(error = %e, "failed to read offline page");
        Resolved::synthetic(builtin_offline_page())
      }
    }
  }
}

fn offline_json() -> Response {
  Response::json(
    503,
    &serde_json::json!({
      "error": "offline",
      "cached": false
    }),
  )
}

fn builtin_offline_page() -> Response {
  Response::html(
    503,
    "<!doctype html><html><head><title>Offline</title></head>\
     <body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>",
  )
}

//! Core types for the caching system.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::net::Response;

/// A stored response within one cache partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Normalized absolute URL
  pub key: String,
  /// Physical partition name (e.g. "api-v3")
  pub cache_name: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  /// When the entry was last written
  pub stored_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn to_response(&self) -> Response {
    Response {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Options applied when writing an entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PutOptions {
  /// Evict oldest entries once the partition grows past this many
  pub max_entries: Option<usize>,
}

/// Result of resolving a request, including metadata about the source.
#[derive(Debug, Clone)]
pub struct Resolved {
  /// The response handed back to the caller
  pub response: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Resolved {
  /// Create a new result from fresh network data.
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new result from a cache hit.
  pub fn from_cache(entry: CacheEntry, is_stale: bool) -> Self {
    Self {
      response: entry.to_response(),
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(entry.stored_at),
    }
  }

  /// Create a new result for offline mode (network failed, cache answered).
  pub fn offline(entry: CacheEntry) -> Self {
    Self {
      response: entry.to_response(),
      source: CacheSource::Offline,
      cached_at: Some(entry.stored_at),
    }
  }

  /// Create a result the engine generated itself.
  pub fn synthetic(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Synthetic,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, past its max-age; a refresh was started
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
  /// Produced by the engine: offline page, 503 body or a queued receipt
  Synthetic,
}

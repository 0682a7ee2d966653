//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use crate::clock::Clock;
use crate::net::{FetchError, Fetcher, Request, Response};

/// Clock that only moves when told to.
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new() -> Self {
    Self {
      now: Mutex::new(Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()),
    }
  }

  pub fn advance(&self, by: Duration) {
    *self.now.lock().unwrap() += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap()
  }
}

#[derive(Clone)]
enum Reply {
  Respond(Response),
  Fail,
  Reject,
}

/// Scripted network keyed by URL. Unknown URLs fail like an unreachable host.
#[derive(Default)]
pub struct MockFetcher {
  replies: Mutex<HashMap<String, Reply>>,
  /// One-shot replies consumed before the sticky ones
  once: Mutex<HashMap<String, VecDeque<Reply>>>,
  gates: Mutex<HashMap<String, Arc<Notify>>>,
  calls: Mutex<Vec<Request>>,
  offline: Mutex<bool>,
}

impl MockFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &str, status: u16, body: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.to_string(), Reply::Respond(Response::new(status, body)));
  }

  pub fn fail(&self, url: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.to_string(), Reply::Fail);
  }

  /// Reject `url` as a malformed request rather than a network failure.
  pub fn reject(&self, url: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.to_string(), Reply::Reject);
  }

  /// Fail only the next fetch of `url`.
  pub fn fail_once(&self, url: &str) {
    self
      .once
      .lock()
      .unwrap()
      .entry(url.to_string())
      .or_default()
      .push_back(Reply::Fail);
  }

  /// Fail every request regardless of scripted replies.
  pub fn set_offline(&self, offline: bool) {
    *self.offline.lock().unwrap() = offline;
  }

  /// Park fetches of `url` until the returned handle is notified.
  pub fn hold(&self, url: &str) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self
      .gates
      .lock()
      .unwrap()
      .insert(url.to_string(), gate.clone());
    gate
  }

  pub fn calls(&self, url: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }

  pub async fn wait_for_calls(&self, url: &str, n: usize) {
    for _ in 0..200 {
      if self.calls(url) >= n {
        return;
      }
      tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("expected {} calls to {}, saw {}", n, url, self.calls(url));
  }
}

#[async_trait]
impl Fetcher for MockFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(request.clone());

    let gate = self.gates.lock().unwrap().remove(&url);
    if let Some(gate) = gate {
      gate.notified().await;
    }

    if *self.offline.lock().unwrap() {
      return Err(FetchError::transport(url, "network unreachable"));
    }

    let once = self
      .once
      .lock()
      .unwrap()
      .get_mut(&url)
      .and_then(|replies| replies.pop_front());
    let reply = once.or_else(|| self.replies.lock().unwrap().get(&url).cloned());
    match reply {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Reject) => Err(FetchError::InvalidRequest {
        url,
        message: "invalid header value".to_string(),
      }),
      Some(Reply::Fail) | None => Err(FetchError::transport(url, "connection refused")),
    }
  }
}

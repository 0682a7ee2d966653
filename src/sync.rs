//! Durable per-topic queue of mutating requests awaiting replay.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::Clock;
use crate::db::Database;
use crate::event::EngineEvent;
use crate::net::{Fetcher, Request};

/// A queued request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueItem {
  /// Unique within the queue; increases with enqueue order
  pub id: i64,
  pub queue_name: String,
  pub method: String,
  pub url: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueueItem {
  fn to_request(&self) -> Result<Request> {
    let url = Url::parse(&self.url).map_err(|e| eyre!("Invalid queued URL {}: {}", self.url, e))?;
    let mut request = Request::new(&self.method, url);
    request.headers = self.headers.clone();
    request.body = self.body.clone();
    Ok(request)
  }
}

/// Outcome of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
  pub queue: String,
  /// Items that got a 2xx and were removed
  pub replayed: Vec<i64>,
  /// Items still queued after this pass
  pub pending: Vec<i64>,
  /// The queue was already being replayed by another trigger
  pub skipped: bool,
}

pub struct SyncQueue {
  db: Arc<Database>,
  clock: Arc<dyn Clock>,
  fetcher: Arc<dyn Fetcher>,
  events: broadcast::Sender<EngineEvent>,
  /// Queues with a replay pass in flight
  replaying: Mutex<HashSet<String>>,
}

impl SyncQueue {
  pub fn new(
    db: Arc<Database>,
    clock: Arc<dyn Clock>,
    fetcher: Arc<dyn Fetcher>,
    events: broadcast::Sender<EngineEvent>,
  ) -> Self {
    Self {
      db,
      clock,
      fetcher,
      events,
      replaying: Mutex::new(HashSet::new()),
    }
  }

  /// Persist a request. Returns its id.
  pub fn enqueue(&self, queue_name: &str, request: &Request) -> Result<i64> {
    let headers = serde_json::to_string(&request.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = self.db.lock()?;
    conn
      .execute(
        "INSERT INTO sync_queue (queue_name, method, url, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          queue_name,
          request.method,
          request.url.as_str(),
          headers,
          request.body,
          self.clock.now().timestamp_millis()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue request: {}", e))?;

    let id = conn.last_insert_rowid();
    info!(queue = queue_name, id, url = %request.url, "request queued for replay");
    Ok(id)
  }

  /// Items of a queue in enqueue order.
  pub fn items(&self, queue_name: &str) -> Result<Vec<QueueItem>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, method, url, headers, body, enqueued_at FROM sync_queue
         WHERE queue_name = ? ORDER BY id ASC",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![queue_name], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<Vec<u8>>>(4)?,
          row.get::<_, i64>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query queue {}: {}", queue_name, e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queue item: {}", e))?;

    rows
      .into_iter()
      .map(|(id, method, url, headers, body, enqueued_at)| {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers of item {}: {}", id, e))?;
        let enqueued_at = DateTime::from_timestamp_millis(enqueued_at)
          .ok_or_else(|| eyre!("Invalid enqueued_at for item {}", id))?;
        Ok(QueueItem {
          id,
          queue_name: queue_name.to_string(),
          method,
          url,
          headers,
          body,
          enqueued_at,
        })
      })
      .collect()
  }

  pub fn len(&self, queue_name: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM sync_queue WHERE queue_name = ?",
        params![queue_name],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count queue {}: {}", queue_name, e))?;
    Ok(count as usize)
  }

  /// Names of every queue holding at least one item.
  pub fn queue_names(&self) -> Result<Vec<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT queue_name FROM sync_queue ORDER BY queue_name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list queues: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read queue name: {}", e))?;

    Ok(names)
  }

  /// Drop every item of a queue without replaying it.
  pub fn clear(&self, queue_name: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM sync_queue WHERE queue_name = ?",
        params![queue_name],
      )
      .map_err(|e| eyre!("Failed to clear queue {}: {}", queue_name, e))?;
    info!(queue = queue_name, removed, "queue cleared");
    Ok(removed)
  }

  fn remove(&self, id: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM sync_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queue item {}: {}", id, e))?;
    Ok(())
  }

  /// Replay every item of a queue in enqueue order.
  ///
  /// A 2xx removes the item and emits [`EngineEvent::Synced`]; anything else
  /// leaves it queued and moves on to the next item.
  pub async fn replay(&self, queue_name: &str) -> Result<ReplaySummary> {
    let mut summary = ReplaySummary {
      queue: queue_name.to_string(),
      ..Default::default()
    };

    let Some(_guard) = ReplayGuard::acquire(&self.replaying, queue_name)? else {
      debug!(queue = queue_name, "replay already in progress");
      summary.skipped = true;
      return Ok(summary);
    };

    for item in self.items(queue_name)? {
      let request = match item.to_request() {
        Ok(request) => request,
        Err(e) => {
          warn!(queue = queue_name, id = item.id, error = %e, "unreplayable item left in queue");
          summary.pending.push(item.id);
          continue;
        }
      };

      match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => {
          // Sent but still stored; it will be sent again on the next pass
          if let Err(e) = self.remove(item.id) {
            warn!(queue = queue_name, id = item.id, error = %e, "failed to remove replayed item");
            summary.pending.push(item.id);
            continue;
          }
          summary.replayed.push(item.id);
          // No subscribers is fine
          let _ = self.events.send(EngineEvent::Synced {
            queue: queue_name.to_string(),
            id: item.id,
            url: item.url.clone(),
          });
        }
        Ok(response) => {
          warn!(queue = queue_name, id = item.id, status = response.status, "replay rejected");
          summary.pending.push(item.id);
        }
        Err(e) => {
          debug!(queue = queue_name, id = item.id, error = %e, "replay failed");
          summary.pending.push(item.id);
        }
      }
    }

    info!(
      queue = queue_name,
      replayed = summary.replayed.len(),
      pending = summary.pending.len(),
      "replay finished"
    );
    Ok(summary)
  }
}

/// Marks a queue as replaying until dropped.
struct ReplayGuard<'a> {
  set: &'a Mutex<HashSet<String>>,
  queue: String,
}

impl<'a> ReplayGuard<'a> {
  fn acquire(set: &'a Mutex<HashSet<String>>, queue: &str) -> Result<Option<Self>> {
    let mut replaying = set.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if !replaying.insert(queue.to_string()) {
      return Ok(None);
    }
    Ok(Some(Self {
      set,
      queue: queue.to_string(),
    }))
  }
}

impl Drop for ReplayGuard<'_> {
  fn drop(&mut self) {
    if let Ok(mut replaying) = self.set.lock() {
      replaying.remove(&self.queue);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{ManualClock, MockFetcher};

  const JOIN: &str = "https://app.test/api/matches/join";

  struct Fixture {
    queue: Arc<SyncQueue>,
    fetcher: Arc<MockFetcher>,
    events: broadcast::Receiver<EngineEvent>,
  }

  fn fixture_with(db: Arc<Database>) -> Fixture {
    let clock = Arc::new(ManualClock::new());
    let fetcher = Arc::new(MockFetcher::new());
    let (tx, rx) = broadcast::channel(16);
    let queue = Arc::new(SyncQueue::new(db, clock, fetcher.clone(), tx));
    Fixture {
      queue,
      fetcher,
      events: rx,
    }
  }

  fn fixture() -> Fixture {
    fixture_with(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn join(url: &str, body: &str) -> Request {
    Request::new("POST", Url::parse(url).unwrap())
      .with_header("Content-Type", "application/json")
      .with_body(body)
  }

  #[test]
  fn test_enqueue_assigns_increasing_ids() {
    let f = fixture();
    let a = f.queue.enqueue("match-join-queue", &join(JOIN, "1")).unwrap();
    let b = f.queue.enqueue("match-join-queue", &join(JOIN, "2")).unwrap();
    assert!(b > a);

    let items = f.queue.items("match-join-queue").unwrap();
    assert_eq!(items.iter().map(|i| i.id).collect::<Vec<_>>(), vec![a, b]);
    assert_eq!(items[0].method, "POST");
    assert_eq!(items[0].body.as_deref(), Some(&b"1"[..]));
    assert_eq!(
      items[0].headers.get("content-type").map(String::as_str),
      Some("application/json")
    );
  }

  #[test]
  fn test_queues_are_separate() {
    let f = fixture();
    f.queue.enqueue("match-join-queue", &join(JOIN, "1")).unwrap();
    f.queue.enqueue("profile-queue", &join(JOIN, "2")).unwrap();

    assert_eq!(f.queue.len("match-join-queue").unwrap(), 1);
    assert_eq!(
      f.queue.queue_names().unwrap(),
      vec!["match-join-queue", "profile-queue"]
    );
  }

  #[tokio::test]
  async fn test_failed_item_does_not_block_later_items() {
    let f = fixture();
    let first = "https://app.test/api/matches/1/join";
    let second = "https://app.test/api/matches/2/join";
    let id1 = f.queue.enqueue("match-join-queue", &join(first, "{}")).unwrap();
    let id2 = f.queue.enqueue("match-join-queue", &join(second, "{}")).unwrap();
    f.fetcher.fail(first);
    f.fetcher.respond(second, 200, "joined");

    let summary = f.queue.replay("match-join-queue").await.unwrap();

    assert_eq!(summary.replayed, vec![id2]);
    assert_eq!(summary.pending, vec![id1]);
    let remaining: Vec<i64> = f
      .queue
      .items("match-join-queue")
      .unwrap()
      .iter()
      .map(|i| i.id)
      .collect();
    assert_eq!(remaining, vec![id1]);

    let requests = f.fetcher.requests();
    assert_eq!(requests[0].url.as_str(), first);
    assert_eq!(requests[1].url.as_str(), second);
  }

  #[tokio::test]
  async fn test_failed_removal_does_not_stop_replay() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let mut f = fixture_with(db.clone());
    let first = "https://app.test/api/matches/1/join";
    let second = "https://app.test/api/matches/2/join";
    let id1 = f.queue.enqueue("match-join-queue", &join(first, "{}")).unwrap();
    let id2 = f.queue.enqueue("match-join-queue", &join(second, "{}")).unwrap();
    f.fetcher.respond(first, 200, "joined");
    f.fetcher.respond(second, 200, "joined");
    db.lock()
      .unwrap()
      .execute_batch(&format!(
        "CREATE TRIGGER keep_first BEFORE DELETE ON sync_queue
         WHEN OLD.id = {} BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        id1
      ))
      .unwrap();

    let summary = f.queue.replay("match-join-queue").await.unwrap();

    assert_eq!(f.fetcher.calls(second), 1);
    assert_eq!(summary.replayed, vec![id2]);
    assert_eq!(summary.pending, vec![id1]);
    assert_eq!(f.queue.len("match-join-queue").unwrap(), 1);
    match f.events.try_recv().unwrap() {
      EngineEvent::Synced { id, .. } => assert_eq!(id, id2),
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_item_survives_repeated_failures_until_success() {
    let mut f = fixture();
    let id = f.queue.enqueue("match-join-queue", &join(JOIN, "{}")).unwrap();

    f.fetcher.fail(JOIN);
    for _ in 0..3 {
      let summary = f.queue.replay("match-join-queue").await.unwrap();
      assert_eq!(summary.pending, vec![id]);
    }

    // An HTTP error status is not success either
    f.fetcher.respond(JOIN, 409, "conflict");
    f.queue.replay("match-join-queue").await.unwrap();
    assert_eq!(f.queue.len("match-join-queue").unwrap(), 1);

    f.fetcher.respond(JOIN, 201, "created");
    let summary = f.queue.replay("match-join-queue").await.unwrap();
    assert_eq!(summary.replayed, vec![id]);
    assert_eq!(f.queue.len("match-join-queue").unwrap(), 0);

    match f.events.try_recv().unwrap() {
      EngineEvent::Synced { queue, id: synced, url } => {
        assert_eq!(queue, "match-join-queue");
        assert_eq!(synced, id);
        assert_eq!(url, JOIN);
      }
      other => panic!("unexpected event {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_replay_sends_original_request() {
    let f = fixture();
    f.queue
      .enqueue("match-join-queue", &join(JOIN, r#"{"team":7}"#))
      .unwrap();
    f.fetcher.respond(JOIN, 200, "ok");

    f.queue.replay("match-join-queue").await.unwrap();

    let sent = &f.fetcher.requests()[0];
    assert_eq!(sent.method, "POST");
    assert_eq!(sent.body.as_deref(), Some(&br#"{"team":7}"#[..]));
    assert_eq!(sent.header("content-type"), Some("application/json"));
  }

  #[tokio::test]
  async fn test_concurrent_replay_of_same_queue_is_skipped() {
    let f = fixture();
    f.queue.enqueue("match-join-queue", &join(JOIN, "{}")).unwrap();
    let gate = f.fetcher.hold(JOIN);
    f.fetcher.respond(JOIN, 200, "ok");

    let queue = f.queue.clone();
    let first = tokio::spawn(async move { queue.replay("match-join-queue").await });
    f.fetcher.wait_for_calls(JOIN, 1).await;

    let second = f.queue.replay("match-join-queue").await.unwrap();
    assert!(second.skipped);

    gate.notify_one();
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.replayed.len(), 1);
    assert_eq!(f.fetcher.calls(JOIN), 1);
  }

  #[test]
  fn test_clear() {
    let f = fixture();
    f.queue.enqueue("match-join-queue", &join(JOIN, "1")).unwrap();
    f.queue.enqueue("match-join-queue", &join(JOIN, "2")).unwrap();
    assert_eq!(f.queue.clear("match-join-queue").unwrap(), 2);
    assert!(f.queue.items("match-join-queue").unwrap().is_empty());
  }

  #[test]
  fn test_items_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.db");

    {
      let f = fixture_with(Arc::new(Database::open(&path).unwrap()));
      f.queue.enqueue("match-join-queue", &join(JOIN, "1")).unwrap();
    }

    let f = fixture_with(Arc::new(Database::open(&path).unwrap()));
    let items = f.queue.items("match-join-queue").unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].url, JOIN);
  }
}

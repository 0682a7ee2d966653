use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;
use url::Url;

use crate::message::ControlMessage;
use crate::net::{Fetcher, Request};

/// Events driving the engine
#[derive(Debug)]
pub enum Event {
  /// Connectivity came back
  Online,
  /// Connectivity was lost
  Offline,
  /// Scheduled background refresh
  PeriodicTick,
  /// Message from the application layer
  Message(ControlMessage),
  /// Raw push payload
  Push(Vec<u8>),
}

/// Notifications emitted by the engine for the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
  /// A queued request was replayed successfully and removed
  Synced { queue: String, id: i64, url: String },
  /// New unread count to show on the app badge
  BadgeCount { count: u32 },
  /// A generation took control
  Activated { version: u32 },
}

/// Event handler that produces events from the connectivity probe and a
/// refresh timer. Other producers inject events through [`EventHandler::sender`].
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new(
    fetcher: Arc<dyn Fetcher>,
    probe_url: Url,
    probe_interval: Duration,
    refresh_interval: Duration,
  ) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn connectivity probe
    let probe_tx = tx.clone();
    tokio::spawn(async move {
      let mut monitor = ConnectivityMonitor::default();
      let mut ticker = tokio::time::interval(probe_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let online = fetcher
          .fetch(&Request::new("HEAD", probe_url.clone()))
          .await
          .is_ok();
        if let Some(event) = monitor.observe(online) {
          debug!(online, "connectivity changed");
          if probe_tx.send(event).is_err() {
            break;
          }
        }
      }
    });

    // Spawn refresh timer; the first tick fires one interval from now
    let tick_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = interval_at(Instant::now() + refresh_interval, refresh_interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
      loop {
        ticker.tick().await;
        if tick_tx.send(Event::PeriodicTick).is_err() {
          break;
        }
      }
    });

    Self { tx, rx }
  }

  pub fn sender(&self) -> mpsc::UnboundedSender<Event> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

/// Turns probe results into transition events.
#[derive(Debug, Default)]
pub struct ConnectivityMonitor {
  last: Option<bool>,
}

impl ConnectivityMonitor {
  /// The first observation always reports, so pending queues are replayed
  /// at startup when the network is up.
  pub fn observe(&mut self, online: bool) -> Option<Event> {
    if self.last == Some(online) {
      return None;
    }
    self.last = Some(online);
    Some(if online { Event::Online } else { Event::Offline })
  }
}

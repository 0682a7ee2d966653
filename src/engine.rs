//! The engine context: owns the store, queue, lifecycle and router, and is
//! the single entry point for requests, messages and events.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{self, CacheLayer, CacheStore, Resolved, Target};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SyncRoute};
use crate::db::Database;
use crate::event::{EngineEvent, Event};
use crate::lifecycle::{Generation, LifecycleManager};
use crate::message::{ControlMessage, MessageReply};
use crate::net::{FetchError, Fetcher, HttpFetcher, Request, Response};
use crate::router::{Decision, Strategy, StrategyRouter};
use crate::sync::{ReplaySummary, SyncQueue};

pub struct Engine {
  config: Config,
  router: StrategyRouter,
  layer: CacheLayer,
  store: Arc<CacheStore>,
  queue: Arc<SyncQueue>,
  lifecycle: Arc<LifecycleManager>,
  fetcher: Arc<dyn Fetcher>,
  events: broadcast::Sender<EngineEvent>,
}

impl Engine {
  /// Open the engine with its on-disk database and a real HTTP client.
  pub async fn start(config: Config) -> Result<Self> {
    let db = Arc::new(Database::open(&config.database_path()?)?);
    let fetcher = Arc::new(HttpFetcher::new(config.request_timeout())?);
    Self::with_parts(config, db, fetcher, Arc::new(SystemClock)).await
  }

  /// Build the engine from explicit collaborators and install the configured
  /// generation.
  pub async fn with_parts(
    config: Config,
    db: Arc<Database>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
  ) -> Result<Self> {
    let (events, _) = broadcast::channel(64);

    let store = Arc::new(CacheStore::new(db.clone(), clock.clone()));
    let offline_key = Request::get(config.resolve(&config.offline_page)?).identity();
    let layer = CacheLayer::new(store.clone(), fetcher.clone(), offline_key);
    let queue = Arc::new(SyncQueue::new(
      db.clone(),
      clock.clone(),
      fetcher.clone(),
      events.clone(),
    ));
    let lifecycle = Arc::new(LifecycleManager::load(
      db,
      store.clone(),
      fetcher.clone(),
      clock,
      events.clone(),
      config.resolve_all(&config.periodic_refresh.urls)?,
    )?);

    let shell = config.resolve_all(&config.shell_resources)?;
    let state = lifecycle.install(config.version, &shell).await?;
    info!(version = config.version, state = ?state, "engine started");

    Ok(Self {
      router: StrategyRouter::new(config.routes.clone()),
      config,
      layer,
      store,
      queue,
      lifecycle,
      fetcher,
      events,
    })
  }

  /// Subscribe to engine notifications
  pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
    self.events.subscribe()
  }

  pub fn store(&self) -> &CacheStore {
    &self.store
  }

  pub fn queue(&self) -> &SyncQueue {
    &self.queue
  }

  pub fn lifecycle(&self) -> &LifecycleManager {
    &self.lifecycle
  }

  /// Resolve an outgoing request.
  ///
  /// Errors only when the network failed and there is nothing to fall back
  /// on: a cache-first miss or a bypassed request that is not queueable.
  pub async fn handle_fetch(&self, request: Request) -> Result<Resolved, FetchError> {
    let route = match self.router.classify(&request) {
      Decision::Bypass => return self.pass_through(request).await,
      Decision::Route(route) => route,
    };

    let Some(generation) = self.lifecycle.active() else {
      return self.pass_through(request).await;
    };

    let target = Target {
      cache_name: generation.partition(route.cache),
      shell_cache: generation.partition(cache::STATIC),
      max_age: route.max_age,
      max_entries: route.max_entries,
    };
    debug!(url = %request.url, class = ?route.class, cache = %target.cache_name, "routed");

    match route.strategy {
      Strategy::CacheFirst => self.layer.cache_first(&request, &target).await,
      Strategy::NetworkFirst => self.layer.network_first(&request, &target).await,
      Strategy::StaleWhileRevalidate => self.layer.stale_while_revalidate(&request, &target).await,
    }
  }

  /// Uncached request. A mutating request to a sync route that fails in
  /// transit is queued and answered with 202.
  async fn pass_through(&self, request: Request) -> Result<Resolved, FetchError> {
    match self.fetcher.fetch(&request).await {
      Ok(response) => Ok(Resolved::from_network(response)),
      Err(e @ FetchError::InvalidRequest { .. }) => Err(e),
      Err(e) => {
        let Some(route) = self.sync_route(&request) else {
          return Err(e);
        };

        match self.queue.enqueue(&route.queue, &request) {
          Ok(id) => Ok(Resolved::synthetic(Response::json(
            202,
            &serde_json::json!({
              "queued": true,
              "queue": route.queue,
              "id": id
            }),
          ))),
          Err(store_err) => {
            warn!(url = %request.url, error = %store_err, "failed to queue request");
            Err(e)
          }
        }
      }
    }
  }

  fn sync_route(&self, request: &Request) -> Option<&SyncRoute> {
    if !request.is_mutating() {
      return None;
    }
    let path = request.url.path();
    self
      .config
      .sync_routes
      .iter()
      .find(|route| path.starts_with(route.prefix.as_str()))
  }

  /// Dispatch an event to its handler
  pub async fn dispatch(&self, event: Event) -> Result<()> {
    match event {
      Event::Online => self.on_online().await,
      Event::Offline => {
        info!("offline; requests will be served from cache");
        Ok(())
      }
      Event::PeriodicTick => self.on_periodic_tick().await,
      Event::Message(message) => {
        let reply = self.handle_message(message).await?;
        debug!(reply = ?reply, "message handled");
        Ok(())
      }
      Event::Push(payload) => {
        self.handle_push(&payload);
        Ok(())
      }
    }
  }

  async fn on_online(&self) -> Result<()> {
    info!("back online; replaying queues");
    self.replay_all().await?;
    Ok(())
  }

  async fn on_periodic_tick(&self) -> Result<()> {
    self.lifecycle.periodic_refresh().await;
    self.replay_all().await?;
    Ok(())
  }

  /// Replay every queue that has items, concurrently across queues.
  pub async fn replay_all(&self) -> Result<Vec<ReplaySummary>> {
    let names = self.queue.queue_names()?;
    let results =
      futures::future::join_all(names.iter().map(|name| self.queue.replay(name))).await;
    results.into_iter().collect()
  }

  /// Handle a control message from the application layer
  pub async fn handle_message(&self, message: ControlMessage) -> Result<MessageReply> {
    match message {
      ControlMessage::SkipWaiting => {
        let version = self.lifecycle.skip_waiting()?;
        Ok(MessageReply::Activated { version })
      }
      ControlMessage::QueueRequest {
        queue_name,
        request,
      } => {
        let id = self.queue.enqueue(&queue_name, &request)?;
        Ok(MessageReply::Queued {
          queue: queue_name,
          id,
        })
      }
      ControlMessage::CacheUrls { urls } => {
        let generation = self.active_generation()?;
        let urls = self.config.resolve_all(&urls)?;
        let warm = self
          .lifecycle
          .precache(&generation.partition(cache::DYNAMIC), &urls)
          .await;
        Ok(MessageReply::Warmed {
          cached: warm.cached,
          failed: warm.failed,
        })
      }
      ControlMessage::ClearCache { name } => {
        let generation = self.active_generation()?;
        let removed = self.store.clear(&generation.partition(&name))?;
        info!(cache = %name, removed, "cache cleared");
        Ok(MessageReply::CacheCleared { name, removed })
      }
      ControlMessage::ReplayQueues => Ok(MessageReply::Replayed {
        summaries: self.replay_all().await?,
      }),
      ControlMessage::ClearQueue { name } => {
        let removed = self.queue.clear(&name)?;
        Ok(MessageReply::QueueCleared { name, removed })
      }
      ControlMessage::GetVersion => Ok(MessageReply::Version {
        active: self.lifecycle.active().map(|g| g.version),
        waiting: self.lifecycle.waiting().map(|g| g.version),
      }),
    }
  }

  /// Forward the unread count of a push payload to the UI as a badge update.
  ///
  /// Returns the count, or None if the payload carries none.
  pub fn handle_push(&self, payload: &[u8]) -> Option<u32> {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
      Ok(value) => value,
      Err(e) => {
        debug!(error = %e, "ignoring non-JSON push payload");
        return None;
      }
    };

    let count = ["badge", "unread"]
      .iter()
      .find_map(|field| value.get(*field).and_then(serde_json::Value::as_u64))
      .map(|count| count.min(u32::MAX as u64) as u32)?;

    let _ = self.events.send(EngineEvent::BadgeCount { count });
    Some(count)
  }

  fn active_generation(&self) -> Result<Generation> {
    self
      .lifecycle
      .active()
      .ok_or_else(|| color_eyre::eyre::eyre!("No active generation"))
  }
}

//! Engine generations: install, wait, activate, and cache cleanup.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use rusqlite::params;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{self, CacheStore, PutOptions};
use crate::clock::Clock;
use crate::db::Database;
use crate::event::EngineEvent;
use crate::net::{Fetcher, Request};

/// Lifecycle state of a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  Installing,
  Waiting,
  Active,
  Superseded,
}

impl GenerationState {
  fn as_str(self) -> &'static str {
    match self {
      Self::Installing => "installing",
      Self::Waiting => "waiting",
      Self::Active => "active",
      Self::Superseded => "superseded",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "installing" => Ok(Self::Installing),
      "waiting" => Ok(Self::Waiting),
      "active" => Ok(Self::Active),
      "superseded" => Ok(Self::Superseded),
      other => Err(eyre!("Unknown generation state: {}", other)),
    }
  }

  /// Installing may activate directly when nothing else is active.
  pub fn can_transition_to(self, next: Self) -> bool {
    matches!(
      (self, next),
      (Self::Installing, Self::Waiting)
        | (Self::Installing, Self::Active)
        | (Self::Waiting, Self::Active)
        | (Self::Active, Self::Superseded)
    )
  }
}

/// A versioned set of cache partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
  pub version: u32,
  pub state: GenerationState,
}

impl Generation {
  pub fn new(version: u32) -> Self {
    Self {
      version,
      state: GenerationState::Installing,
    }
  }

  /// Physical name of a logical partition in this generation
  pub fn partition(&self, logical: &str) -> String {
    format!("{}-v{}", logical, self.version)
  }

  /// Every partition this generation declares
  pub fn partitions(&self) -> Vec<String> {
    cache::PARTITIONS
      .iter()
      .map(|logical| self.partition(logical))
      .collect()
  }

  fn transition(&mut self, next: GenerationState) -> Result<()> {
    if !self.state.can_transition_to(next) {
      return Err(eyre!(
        "Generation {} cannot go from {} to {}",
        self.version,
        self.state.as_str(),
        next.as_str()
      ));
    }
    self.state = next;
    Ok(())
  }
}

#[derive(Debug, Default)]
struct Generations {
  active: Option<Generation>,
  waiting: Option<Generation>,
}

/// Outcome of pre-caching the shell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WarmSummary {
  pub cached: usize,
  pub failed: usize,
}

pub struct LifecycleManager {
  db: Arc<Database>,
  store: Arc<CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  clock: Arc<dyn Clock>,
  events: broadcast::Sender<EngineEvent>,
  /// Fetched into the api partition on every periodic refresh
  refresh_urls: Vec<Url>,
  generations: Mutex<Generations>,
}

impl LifecycleManager {
  /// Load persisted generations. A generation interrupted mid-install is
  /// discarded and will be installed again.
  pub fn load(
    db: Arc<Database>,
    store: Arc<CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<EngineEvent>,
    refresh_urls: Vec<Url>,
  ) -> Result<Self> {
    let mut generations = Generations::default();
    {
      let conn = db.lock()?;
      let mut stmt = conn
        .prepare("SELECT version, state FROM generations WHERE state IN ('active', 'waiting')")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

      let rows = stmt
        .query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, String>(1)?)))
        .map_err(|e| eyre!("Failed to load generations: {}", e))?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| eyre!("Failed to read generation: {}", e))?;

      for (version, state) in rows {
        let state = GenerationState::parse(&state)?;
        let generation = Generation { version, state };
        match state {
          GenerationState::Active => generations.active = Some(generation),
          GenerationState::Waiting => generations.waiting = Some(generation),
          _ => {}
        }
      }

      conn
        .execute("DELETE FROM generations WHERE state = 'installing'", [])
        .map_err(|e| eyre!("Failed to discard interrupted install: {}", e))?;
    }

    if let Some(active) = &generations.active {
      debug!(version = active.version, "resuming active generation");
    }
    let keep: Vec<String> = generations
      .active
      .iter()
      .chain(generations.waiting.iter())
      .flat_map(Generation::partitions)
      .collect();
    let orphaned = generations.active.is_none() && generations.waiting.is_some();

    let manager = Self {
      db,
      store,
      fetcher,
      clock,
      events,
      refresh_urls,
      generations: Mutex::new(generations),
    };

    if orphaned {
      // Nothing serves, so the waiting generation takes over
      info!("activating waiting generation with no active predecessor");
      manager.skip_waiting()?;
    } else if !keep.is_empty() {
      // Finish a cleanup that an earlier cutover could not complete
      manager.sweep_partitions(&keep);
    }

    Ok(manager)
  }

  pub fn active(&self) -> Option<Generation> {
    self.lock().ok().and_then(|g| g.active.clone())
  }

  pub fn waiting(&self) -> Option<Generation> {
    self.lock().ok().and_then(|g| g.waiting.clone())
  }

  /// Install a generation and pre-cache the shell into its static partition.
  ///
  /// Each shell resource is fetched independently; failures are logged and
  /// counted, never fatal. With no active generation the new one activates
  /// right away, otherwise it waits for [`LifecycleManager::skip_waiting`].
  pub async fn install(&self, version: u32, shell: &[Url]) -> Result<GenerationState> {
    let activate_waiting = {
      let generations = self.lock()?;
      if let Some(active) = &generations.active {
        if active.version == version {
          return Ok(GenerationState::Active);
        }
        if active.version > version {
          return Err(eyre!(
            "Generation {} is older than active generation {}",
            version,
            active.version
          ));
        }
      }
      match &generations.waiting {
        Some(waiting) if waiting.version >= version => {
          if generations.active.is_some() {
            return Ok(GenerationState::Waiting);
          }
          true
        }
        _ => false,
      }
    };

    if activate_waiting {
      self.skip_waiting()?;
      return Ok(GenerationState::Active);
    }

    let mut generation = Generation::new(version);
    self.persist(&[&generation])?;
    info!(version, "installing generation");

    for partition in generation.partitions() {
      self.store.open(&partition)?;
    }

    let warm = self.precache(&generation.partition(cache::STATIC), shell).await;
    if warm.failed > 0 {
      warn!(version, failed = warm.failed, cached = warm.cached, "shell partially cached");
    }

    generation.transition(GenerationState::Waiting)?;
    self.persist(&[&generation])?;

    let has_active = {
      let mut generations = self.lock()?;
      // A newer install may have overtaken this one while it was fetching
      if let Some(previous) = generations.waiting.replace(generation.clone()) {
        if previous.version != generation.version {
          self.forget(previous.version)?;
        }
      }
      generations.active.is_some()
    };

    if has_active {
      info!(version, "generation waiting for takeover");
      return Ok(GenerationState::Waiting);
    }

    self.skip_waiting()?;
    Ok(GenerationState::Active)
  }

  /// Activate the waiting generation now. Returns its version, or None if
  /// nothing was waiting.
  ///
  /// The previous generation is superseded and every partition outside the
  /// new generation's set is deleted. Both records are committed together;
  /// on failure the in-memory state is left as it was.
  pub fn skip_waiting(&self) -> Result<Option<u32>> {
    let (mut next, previous) = {
      let generations = self.lock()?;
      let Some(next) = generations.waiting.clone() else {
        return Ok(None);
      };
      (next, generations.active.clone())
    };

    next.transition(GenerationState::Active)?;
    let previous = match previous {
      Some(mut previous) => {
        previous.transition(GenerationState::Superseded)?;
        Some(previous)
      }
      None => None,
    };

    let partitions = next.partitions();
    for partition in &partitions {
      self.store.open(partition)?;
    }

    let mut records = vec![&next];
    records.extend(previous.as_ref());
    self.persist(&records)?;

    let version = next.version;
    {
      let mut generations = self.lock()?;
      if generations.waiting.as_ref().map(|g| g.version) == Some(version) {
        generations.waiting = None;
      }
      generations.active = Some(next);
    }
    if let Some(previous) = &previous {
      info!(version = previous.version, "generation superseded");
    }
    info!(version, "generation active");

    self.sweep_partitions(&partitions);
    let _ = self.events.send(EngineEvent::Activated { version });

    Ok(Some(version))
  }

  /// Delete every partition outside `keep`. A failure leaves the leftovers
  /// for the next start.
  fn sweep_partitions(&self, keep: &[String]) {
    match self.store.delete_partitions_not_in(keep) {
      Ok(deleted) if !deleted.is_empty() => info!(deleted = ?deleted, "old partitions removed"),
      Ok(_) => {}
      Err(e) => warn!(error = %e, "failed to remove old partitions"),
    }
  }

  /// Fetch `urls` into `cache_name`, each independently.
  pub async fn precache(&self, cache_name: &str, urls: &[Url]) -> WarmSummary {
    let results = join_all(urls.iter().map(|url| async move {
      let request = Request::get(url.clone());
      match self.fetcher.fetch(&request).await {
        Ok(response) if response.is_success() => self
          .store
          .put(cache_name, &request.identity(), &response, PutOptions::default())
          .map_err(|e| e.to_string()),
        Ok(response) => Err(format!("status {}", response.status)),
        Err(e) => Err(e.to_string()),
      }
    }))
    .await;

    let mut summary = WarmSummary::default();
    for (url, result) in urls.iter().zip(results) {
      match result {
        Ok(()) => summary.cached += 1,
        Err(e) => {
          warn!(url = %url, cache = cache_name, error = %e, "failed to pre-cache");
          summary.failed += 1;
        }
      }
    }
    summary
  }

  /// Refresh the fixed listing set into the active api partition.
  pub async fn periodic_refresh(&self) -> WarmSummary {
    let Some(active) = self.active() else {
      debug!("no active generation, skipping refresh");
      return WarmSummary::default();
    };

    let summary = self
      .precache(&active.partition(cache::API), &self.refresh_urls)
      .await;
    info!(refreshed = summary.cached, failed = summary.failed, "periodic refresh done");
    summary
  }

  /// Write generation records in one transaction.
  fn persist(&self, generations: &[&Generation]) -> Result<()> {
    let now = self.clock.now().timestamp_millis();
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for generation in generations {
      let partitions = serde_json::to_string(&generation.partitions())
        .map_err(|e| eyre!("Failed to serialize partitions: {}", e))?;
      tx.execute(
        "INSERT OR REPLACE INTO generations (version, state, partitions, updated_at)
         VALUES (?, ?, ?, ?)",
        params![generation.version, generation.state.as_str(), partitions, now],
      )
      .map_err(|e| eyre!("Failed to persist generation {}: {}", generation.version, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit generations: {}", e))?;
    Ok(())
  }

  fn forget(&self, version: u32) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute("DELETE FROM generations WHERE version = ?", params![version])
      .map_err(|e| eyre!("Failed to drop generation {}: {}", version, e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Generations>> {
    self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{ManualClock, MockFetcher};

  struct Fixture {
    db: Arc<Database>,
    store: Arc<CacheStore>,
    fetcher: Arc<MockFetcher>,
    clock: Arc<ManualClock>,
    events: broadcast::Sender<EngineEvent>,
  }

  impl Fixture {
    fn new() -> Self {
      let db = Arc::new(Database::open_in_memory().unwrap());
      let clock = Arc::new(ManualClock::new());
      let store = Arc::new(CacheStore::new(db.clone(), clock.clone()));
      let (events, _) = broadcast::channel(16);
      Self {
        db,
        store,
        fetcher: Arc::new(MockFetcher::new()),
        clock,
        events,
      }
    }

    fn manager(&self) -> LifecycleManager {
      LifecycleManager::load(
        self.db.clone(),
        self.store.clone(),
        self.fetcher.clone(),
        self.clock.clone(),
        self.events.clone(),
        vec![url("https://app.test/api/matches?status=upcoming")],
      )
      .unwrap()
    }
  }

  fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
  }

  fn shell() -> Vec<Url> {
    vec![url("https://app.test/"), url("https://app.test/offline")]
  }

  #[test]
  fn test_transition_table() {
    use GenerationState::*;
    assert!(Installing.can_transition_to(Waiting));
    assert!(Waiting.can_transition_to(Active));
    assert!(Active.can_transition_to(Superseded));
    assert!(!Active.can_transition_to(Waiting));
    assert!(!Superseded.can_transition_to(Active));
    assert!(!Waiting.can_transition_to(Installing));
  }

  #[test]
  fn test_partition_names() {
    let generation = Generation::new(3);
    assert_eq!(generation.partition(cache::API), "api-v3");
    assert_eq!(generation.partitions().len(), cache::PARTITIONS.len());
  }

  #[tokio::test]
  async fn test_first_install_activates_immediately() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    f.fetcher.respond("https://app.test/offline", 200, "offline");
    let manager = f.manager();
    let mut events = f.events.subscribe();

    let state = manager.install(1, &shell()).await.unwrap();

    assert_eq!(state, GenerationState::Active);
    assert_eq!(manager.active().unwrap().version, 1);
    assert!(manager.waiting().is_none());
    assert_eq!(f.store.len("static-v1").unwrap(), 2);
    assert_eq!(events.try_recv().unwrap(), EngineEvent::Activated { version: 1 });
  }

  #[tokio::test]
  async fn test_partial_shell_failure_is_not_fatal() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    f.fetcher.fail("https://app.test/offline");
    let manager = f.manager();

    let state = manager.install(1, &shell()).await.unwrap();

    assert_eq!(state, GenerationState::Active);
    assert_eq!(f.store.keys("static-v1").unwrap(), vec!["https://app.test/"]);
  }

  #[tokio::test]
  async fn test_second_generation_waits_until_skip_waiting() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    let manager = f.manager();
    manager.install(1, &shell()).await.unwrap();

    let state = manager.install(2, &shell()).await.unwrap();

    assert_eq!(state, GenerationState::Waiting);
    assert_eq!(manager.active().unwrap().version, 1);
    assert_eq!(manager.waiting().unwrap().version, 2);
    // Old generation still serves; its caches are untouched
    assert!(f.store.partitions().unwrap().contains(&"api-v1".to_string()));
  }

  #[tokio::test]
  async fn test_cutover_removes_superseded_partitions() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    let manager = f.manager();
    manager.install(1, &shell()).await.unwrap();
    f.store
      .put("api-v1", "https://app.test/api/x", &crate::net::Response::new(200, "x"), PutOptions::default())
      .unwrap();
    // A stray partition from an unknown older build
    f.store.open("legacy-cache").unwrap();

    manager.install(2, &shell()).await.unwrap();
    assert_eq!(manager.skip_waiting().unwrap(), Some(2));

    let mut expected = Generation::new(2).partitions();
    expected.sort();
    assert_eq!(f.store.partitions().unwrap(), expected);
    assert_eq!(f.store.len("api-v1").unwrap(), 0);
    assert_eq!(manager.active().unwrap().version, 2);
    assert!(manager.waiting().is_none());
  }

  #[tokio::test]
  async fn test_skip_waiting_without_waiting_generation() {
    let f = Fixture::new();
    let manager = f.manager();
    assert_eq!(manager.skip_waiting().unwrap(), None);
  }

  #[tokio::test]
  async fn test_reinstalling_active_version_is_a_no_op() {
    let f = Fixture::new();
    let manager = f.manager();
    manager.install(2, &shell()).await.unwrap();
    let calls = f.fetcher.total_calls();

    assert_eq!(manager.install(2, &shell()).await.unwrap(), GenerationState::Active);
    assert_eq!(f.fetcher.total_calls(), calls);
    assert!(manager.install(1, &shell()).await.is_err());
  }

  #[tokio::test]
  async fn test_state_survives_reload() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    {
      let manager = f.manager();
      manager.install(1, &shell()).await.unwrap();
      manager.install(2, &shell()).await.unwrap();
    }

    let manager = f.manager();
    assert_eq!(manager.active().unwrap().version, 1);
    assert_eq!(manager.waiting().unwrap().version, 2);
  }

  #[tokio::test]
  async fn test_periodic_refresh_stores_into_active_api_partition() {
    let f = Fixture::new();
    let listing = "https://app.test/api/matches?status=upcoming";
    f.fetcher.respond(listing, 200, r#"[{"id":1}]"#);
    let manager = f.manager();
    manager.install(1, &[]).await.unwrap();

    let summary = manager.periodic_refresh().await;

    assert_eq!(summary, WarmSummary { cached: 1, failed: 0 });
    let entry = f.store.get("api-v1", listing).unwrap().unwrap();
    assert_eq!(entry.body, br#"[{"id":1}]"#);
  }

  #[tokio::test]
  async fn test_periodic_refresh_failure_is_absorbed() {
    let f = Fixture::new();
    let manager = f.manager();
    manager.install(1, &[]).await.unwrap();

    let summary = manager.periodic_refresh().await;
    assert_eq!(summary, WarmSummary { cached: 0, failed: 1 });
  }

  #[tokio::test]
  async fn test_failed_cutover_keeps_previous_generation_serving() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    let manager = f.manager();
    manager.install(1, &shell()).await.unwrap();
    manager.install(2, &shell()).await.unwrap();
    f.db
      .lock()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER reject_activation BEFORE INSERT ON generations
         WHEN NEW.version = 2 AND NEW.state = 'active'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
      )
      .unwrap();

    assert!(manager.skip_waiting().is_err());
    assert_eq!(manager.active().unwrap().version, 1);
    assert_eq!(manager.waiting().unwrap().version, 2);
    assert!(f.store.partitions().unwrap().contains(&"api-v1".to_string()));

    // The superseded record was rolled back with the failed activation
    let reloaded = f.manager();
    assert_eq!(reloaded.active().unwrap().version, 1);
    assert_eq!(reloaded.waiting().unwrap().version, 2);

    f.db
      .lock()
      .unwrap()
      .execute_batch("DROP TRIGGER reject_activation;")
      .unwrap();
    assert_eq!(manager.skip_waiting().unwrap(), Some(2));
    assert_eq!(manager.active().unwrap().version, 2);
  }

  #[tokio::test]
  async fn test_reload_activates_waiting_generation_without_active() {
    let f = Fixture::new();
    f.db
      .lock()
      .unwrap()
      .execute_batch(
        "INSERT INTO generations (version, state, partitions, updated_at)
         VALUES (1, 'superseded', '[]', 0), (2, 'waiting', '[]', 0);",
      )
      .unwrap();
    f.store.open("api-v1").unwrap();
    let mut events = f.events.subscribe();

    let manager = f.manager();

    assert_eq!(manager.active().unwrap().version, 2);
    assert!(manager.waiting().is_none());
    assert_eq!(events.try_recv().unwrap(), EngineEvent::Activated { version: 2 });
    let mut expected = Generation::new(2).partitions();
    expected.sort();
    assert_eq!(f.store.partitions().unwrap(), expected);

    // Installing the same version again is a no-op
    let calls = f.fetcher.total_calls();
    assert_eq!(manager.install(2, &shell()).await.unwrap(), GenerationState::Active);
    assert_eq!(f.fetcher.total_calls(), calls);
  }

  #[tokio::test]
  async fn test_install_opens_partitions_before_precaching() {
    let f = Fixture::new();
    f.fetcher.respond("https://app.test/", 200, "shell");
    let manager = f.manager();
    manager.install(1, &shell()).await.unwrap();

    manager.install(2, &shell()).await.unwrap();

    assert_eq!(manager.waiting().unwrap().version, 2);
    assert_eq!(f.store.len("static-v2").unwrap(), 1);
    assert!(f.store.partitions().unwrap().contains(&"api-v2".to_string()));
  }
}

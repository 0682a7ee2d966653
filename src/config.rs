use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Engine generation; bump on every deploy so old caches get dropped
  pub version: u32,
  /// Base URL that relative paths in this file resolve against
  pub origin: String,
  /// Where the database and logs live (default: $XDG_DATA_HOME/offcache)
  pub data_dir: Option<PathBuf>,
  /// Database file (default: <data_dir>/offcache.db)
  pub database: Option<PathBuf>,
  /// Page served to navigations when both network and cache fail
  pub offline_page: String,
  /// Resources pre-cached when a generation installs
  pub shell_resources: Vec<String>,
  pub periodic_refresh: RefreshConfig,
  pub network: NetworkConfig,
  pub routes: RoutesConfig,
  /// Mutating requests under these prefixes are queued when offline
  pub sync_routes: Vec<SyncRoute>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      version: 1,
      origin: "http://localhost:3000".to_string(),
      data_dir: None,
      database: None,
      offline_page: "/offline".to_string(),
      shell_resources: vec![
        "/".to_string(),
        "/offline".to_string(),
        "/manifest.json".to_string(),
      ],
      periodic_refresh: RefreshConfig::default(),
      network: NetworkConfig::default(),
      routes: RoutesConfig::default(),
      sync_routes: vec![SyncRoute {
        prefix: "/api/matches/join".to_string(),
        queue: "match-join-queue".to_string(),
      }],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
  pub interval_secs: u64,
  /// Listings refreshed into the api cache on every tick
  pub urls: Vec<String>,
}

impl Default for RefreshConfig {
  fn default() -> Self {
    Self {
      interval_secs: 12 * 60 * 60,
      urls: vec!["/api/matches?status=upcoming".to_string()],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// URL probed to detect connectivity (default: origin)
  pub probe_url: Option<String>,
  pub probe_interval_secs: u64,
  pub timeout_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      probe_url: None,
      probe_interval_secs: 30,
      timeout_secs: 30,
    }
  }
}

/// Patterns used to classify requests. Hosts match exactly, prefixes match the
/// URL path, extensions match the end of the path (case-insensitive).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  pub font_hosts: Vec<String>,
  pub font_extensions: Vec<String>,
  pub image_extensions: Vec<String>,
  pub api_prefixes: Vec<String>,
  pub api_hosts: Vec<String>,
  /// Content-hashed build output
  pub static_prefixes: Vec<String>,
  /// On-the-fly image optimization endpoints
  pub image_transform_prefixes: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    let strings = |items: &[&str]| -> Vec<String> { items.iter().map(|s| s.to_string()).collect() };
    Self {
      font_hosts: strings(&["fonts.googleapis.com", "fonts.gstatic.com"]),
      font_extensions: strings(&["woff", "woff2", "ttf", "otf", "eot"]),
      image_extensions: strings(&["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]),
      api_prefixes: strings(&["/api/"]),
      api_hosts: Vec::new(),
      static_prefixes: strings(&["/_next/static/"]),
      image_transform_prefixes: strings(&["/_next/image"]),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SyncRoute {
  /// Path prefix of the mutating endpoint
  pub prefix: String,
  /// Queue that holds failed requests for this endpoint
  pub queue: String,
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offcache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Data directory.
  ///
  /// Checks OFFCACHE_DATA_DIR first, then the config file, then the platform
  /// data directory.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("OFFCACHE_DATA_DIR") {
      return Ok(PathBuf::from(dir));
    }
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offcache"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => Ok(self.data_dir()?.join("offcache.db")),
    }
  }

  /// Resolve an absolute URL or a path relative to `origin`.
  pub fn resolve(&self, url: &str) -> Result<Url> {
    match Url::parse(url) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => {
        let origin = Url::parse(&self.origin)
          .map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;
        origin
          .join(url)
          .map_err(|e| eyre!("Invalid URL {}: {}", url, e))
      }
      Err(e) => Err(eyre!("Invalid URL {}: {}", url, e)),
    }
  }

  pub fn resolve_all(&self, urls: &[String]) -> Result<Vec<Url>> {
    urls.iter().map(|u| self.resolve(u)).collect()
  }

  pub fn probe_url(&self) -> Result<Url> {
    match &self.network.probe_url {
      Some(url) => self.resolve(url),
      None => self.resolve(&self.origin),
    }
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.network.probe_interval_secs.max(1))
  }

  pub fn refresh_interval(&self) -> Duration {
    Duration::from_secs(self.periodic_refresh.interval_secs.max(1))
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.network.timeout_secs.max(1))
  }
}

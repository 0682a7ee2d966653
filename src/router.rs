//! Request classification: which strategy and cache partition handle a request.

use chrono::Duration;

use crate::cache;
use crate::config::RoutesConfig;
use crate::net::{Destination, Request};

/// Request-resolution algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
}

/// Request classes, in matching order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  Font,
  Image,
  Api,
  Static,
  ImageTransform,
  Navigation,
  Other,
}

/// How one request class is cached
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  pub class: RequestClass,
  pub strategy: Strategy,
  /// Logical partition name
  pub cache: &'static str,
  pub max_age: Option<Duration>,
  pub max_entries: Option<usize>,
}

impl Route {
  fn new(class: RequestClass, strategy: Strategy, cache: &'static str) -> Self {
    Self {
      class,
      strategy,
      cache,
      max_age: None,
      max_entries: None,
    }
  }

  fn max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
    self
  }

  fn max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = Some(max_entries);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
  /// Straight to the network, nothing cached
  Bypass,
  Route(Route),
}

pub struct StrategyRouter {
  routes: RoutesConfig,
}

impl StrategyRouter {
  pub fn new(routes: RoutesConfig) -> Self {
    Self { routes }
  }

  /// Classify a request. The first matching class wins.
  pub fn classify(&self, request: &Request) -> Decision {
    if !request.is_get() || !request.is_http() {
      return Decision::Bypass;
    }

    let host = request.url.host_str().unwrap_or_default();
    let path = request.url.path();
    let r = &self.routes;

    let route = if r.font_hosts.iter().any(|h| h == host) || has_extension(path, &r.font_extensions)
    {
      Route::new(RequestClass::Font, Strategy::CacheFirst, cache::FONTS).max_age(Duration::days(365))
    } else if request.destination == Destination::Image || has_extension(path, &r.image_extensions)
    {
      Route::new(RequestClass::Image, Strategy::CacheFirst, cache::IMAGES)
        .max_age(Duration::days(30))
        .max_entries(80)
    } else if has_prefix(path, &r.api_prefixes) || r.api_hosts.iter().any(|h| h == host) {
      Route::new(RequestClass::Api, Strategy::NetworkFirst, cache::API).max_age(Duration::seconds(60))
    } else if has_prefix(path, &r.static_prefixes) {
      Route::new(RequestClass::Static, Strategy::CacheFirst, cache::STATIC)
        .max_age(Duration::days(365))
    } else if has_prefix(path, &r.image_transform_prefixes) {
      Route::new(RequestClass::ImageTransform, Strategy::CacheFirst, cache::IMAGES)
        .max_age(Duration::days(30))
    } else if request.is_navigation()
      || request
        .header("accept")
        .is_some_and(|accept| accept.contains("text/html"))
    {
      Route::new(
        RequestClass::Navigation,
        Strategy::StaleWhileRevalidate,
        cache::DYNAMIC,
      )
    } else {
      Route::new(RequestClass::Other, Strategy::NetworkFirst, cache::DYNAMIC)
        .max_age(Duration::minutes(5))
    };

    Decision::Route(route)
  }
}

fn has_prefix(path: &str, prefixes: &[String]) -> bool {
  prefixes.iter().any(|p| path.starts_with(p.as_str()))
}

fn has_extension(path: &str, extensions: &[String]) -> bool {
  let Some((_, ext)) = path.rsplit_once('.') else {
    return false;
  };
  // "/v1.2/users" has no extension
  if ext.contains('/') {
    return false;
  }
  extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
}

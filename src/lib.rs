//! Offline-first request cache and background-sync engine.
//!
//! Requests are classified by [`router::StrategyRouter`], resolved through a
//! versioned [`cache::CacheStore`], and mutations that fail while offline are
//! persisted in a [`sync::SyncQueue`] for replay. [`engine::Engine`] ties the
//! pieces together.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod event;
pub mod lifecycle;
pub mod logging;
pub mod message;
pub mod net;
pub mod router;
pub mod sync;

#[cfg(test)]
mod testing;

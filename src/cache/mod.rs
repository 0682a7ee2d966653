//! Response caching for offline support.
//!
//! This module provides:
//! - A durable store of named partitions holding responses keyed by URL
//! - Entry-count bounded partitions with oldest-first eviction
//! - The three request resolution strategies (cache-first, network-first,
//!   stale-while-revalidate) built on top of the store

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, Target};
pub use storage::CacheStore;
pub use traits::{CacheEntry, CacheSource, PutOptions, Resolved};

/// Logical partition for content-hashed build output and the app shell
pub const STATIC: &str = "static";
/// Logical partition for images and image transforms
pub const IMAGES: &str = "images";
/// Logical partition for API responses
pub const API: &str = "api";
/// Logical partition for pages and everything unclassified
pub const DYNAMIC: &str = "dynamic";
/// Logical partition for web fonts
pub const FONTS: &str = "fonts";

/// Every logical partition a generation declares.
pub const PARTITIONS: [&str; 5] = [STATIC, IMAGES, API, DYNAMIC, FONTS];

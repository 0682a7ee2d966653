//! Network boundary: request/response types and the fetcher trait.

mod client;
mod types;

pub use client::{FetchError, Fetcher, HttpFetcher};
pub use types::{Destination, Request, RequestMode, Response};

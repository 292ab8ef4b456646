//! # herald-config
//!
//! Endpoint catalog for the Herald report cache.
//!
//! Each endpoint declares a [`Behavior`] (which source serves it and which
//! cache tier fronts it), a source descriptor, its filter fields and a page
//! size. The [`EndpointRegistry`] keeps the current catalog behind an
//! `ArcSwap` so request handlers read a consistent snapshot without locking,
//! and [`watch_catalog`] swaps in a new snapshot when the file changes.

pub mod endpoint;
pub mod error;
pub mod registry;
pub mod watcher;

pub use endpoint::{Behavior, CacheTier, EndpointConfig, SourceDescriptor, SourceKind};
pub use error::ConfigError;
pub use registry::{EndpointCatalog, EndpointRegistry};
pub use watcher::{CatalogWatcherConfig, WatchHandle, watch_catalog};

//! Sync engine for tandem channels.
//!
//! Ties the durable store, the cloud relay, and the pairwise cipher into
//! one per-channel session: bootstrap policy and backfill, a live
//! subscription merged into an ordered in-memory timeline, and a drain
//! loop that retries uploads and acks with exponential backoff. Callers
//! interact through [`MessageSyncService`] and the [`SyncEvent`] channel
//! it hands back.

pub mod backoff;
pub mod bootstrap;
pub mod config;
pub mod events;
pub mod service;
pub mod throttle;
pub mod timeline;
pub mod transport;

mod error;

pub use config::SyncConfig;
pub use error::{ErrorCategory, Result, SyncError};
pub use events::{MessageSource, SyncEvent};
pub use service::MessageSyncService;
pub use timeline::TimelineEntry;
pub use transport::{CloudTransport, MemoryTransport};

use std::time::Duration;

use crate::backoff::RetryPolicy;

/// Tunables for one [`crate::MessageSyncService`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local schema version stamped into sync state; a stored state with a
    /// lower version forces a bootstrap after upgrades.
    pub schema_version: u32,
    /// App version stamped into sync state, compared the same way.
    pub app_version: String,
    /// Master switch; when off, sessions skip bootstrap entirely.
    pub feature_enabled: bool,
    /// Envelopes requested per backfill page.
    pub backfill_page_size: u32,
    /// Upper bound on backfill pages per bootstrap run.
    pub max_backfill_pages: u32,
    /// Soft cap on the in-memory timeline window.
    pub timeline_cap: usize,
    /// Pending uploads (and acks) attempted per drain cycle.
    pub drain_batch: u32,
    pub retry: RetryPolicy,
    /// Minimum spacing between surfaced errors of the same category.
    pub error_throttle_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            schema_version: tandem_store::migrations::CURRENT_VERSION,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            feature_enabled: true,
            backfill_page_size: 50,
            max_backfill_pages: 20,
            timeline_cap: 500,
            drain_batch: 25,
            retry: RetryPolicy::default(),
            error_throttle_window: Duration::from_secs(10),
        }
    }
}

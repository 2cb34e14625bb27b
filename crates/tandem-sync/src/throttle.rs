use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limiter for surfaced errors.
///
/// A sustained outage fails every drain cycle; without throttling each
/// failure would push another notification at the session owner. One key
/// per [`crate::ErrorCategory`] keeps independent failure kinds visible.
pub struct ErrorThrottle {
    window: Duration,
    last_surfaced: Mutex<HashMap<&'static str, Instant>>,
}

impl ErrorThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_surfaced: Mutex::new(HashMap::new()),
        }
    }

    /// Whether an error under `key` should reach the event channel now.
    /// Records the surfacing time when it answers yes.
    pub async fn should_surface(&self, key: &'static str) -> bool {
        let mut last = self.last_surfaced.lock().await;
        let now = Instant::now();
        match last.get(key) {
            Some(prev) if now.duration_since(*prev) < self.window => false,
            _ => {
                last.insert(key, now);
                true
            }
        }
    }
}

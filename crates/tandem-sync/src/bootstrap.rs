//! Bootstrap policy: decide, from persisted sync state alone, whether a
//! session must backfill from the cloud before going live.

use tandem_store::SyncState;

/// Why a bootstrap was ordered. Included in the session-started event and
/// logged with the backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapReason {
    /// No persisted state or no cursor yet for this channel.
    MissingCursor,
    /// The local store has a cursor but zero messages (wiped or fresh DB).
    LocalEmpty,
    /// A previous session flagged a continuity gap in the live feed.
    GapDetected,
    /// An earlier bootstrap started but never completed.
    BootstrapIncomplete,
    /// The store schema moved forward since the cursor was written.
    SchemaUpgrade,
    /// The app version changed since the cursor was written.
    AppUpgrade,
}

impl BootstrapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BootstrapReason::MissingCursor => "missing_cursor",
            BootstrapReason::LocalEmpty => "local_empty",
            BootstrapReason::GapDetected => "gap_detected",
            BootstrapReason::BootstrapIncomplete => "bootstrap_incomplete",
            BootstrapReason::SchemaUpgrade => "schema_upgrade",
            BootstrapReason::AppUpgrade => "app_upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapDecision {
    Skip,
    Run(BootstrapReason),
}

/// Evaluate the bootstrap rules in precedence order. Pure so every branch
/// is table-testable.
pub fn decide(
    state: Option<&SyncState>,
    local_count: u64,
    schema_version: u32,
    app_version: &str,
    feature_enabled: bool,
) -> BootstrapDecision {
    if !feature_enabled {
        return BootstrapDecision::Skip;
    }
    let Some(state) = state else {
        return BootstrapDecision::Run(BootstrapReason::MissingCursor);
    };
    if state.cursor().is_none() {
        return BootstrapDecision::Run(BootstrapReason::MissingCursor);
    }
    if local_count == 0 {
        return BootstrapDecision::Run(BootstrapReason::LocalEmpty);
    }
    if state.gap_detected {
        return BootstrapDecision::Run(BootstrapReason::GapDetected);
    }
    if state.bootstrap_incomplete {
        return BootstrapDecision::Run(BootstrapReason::BootstrapIncomplete);
    }
    if state.schema_version < schema_version {
        return BootstrapDecision::Run(BootstrapReason::SchemaUpgrade);
    }
    if state.app_version != app_version {
        return BootstrapDecision::Run(BootstrapReason::AppUpgrade);
    }
    BootstrapDecision::Skip
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_shared::{ChannelId, UserId};
    use uuid::Uuid;

    const SCHEMA: u32 = 3;
    const APP: &str = "1.2.0";

    fn settled_state() -> SyncState {
        SyncState {
            owner: UserId::new("alice"),
            channel: ChannelId("feedcafe".to_string()),
            last_ts_ms: Some(1_000),
            last_message_id: Some(Uuid::from_u128(7)),
            bootstrap_incomplete: false,
            gap_detected: false,
            schema_version: SCHEMA,
            app_version: APP.to_string(),
            updated_at_ms: 1_000,
        }
    }

    fn decide_with(state: Option<&SyncState>, count: u64) -> BootstrapDecision {
        decide(state, count, SCHEMA, APP, true)
    }

    #[test]
    fn settled_state_skips() {
        assert_eq!(decide_with(Some(&settled_state()), 10), BootstrapDecision::Skip);
    }

    #[test]
    fn missing_state_or_cursor_runs() {
        assert_eq!(
            decide_with(None, 10),
            BootstrapDecision::Run(BootstrapReason::MissingCursor)
        );
        let mut state = settled_state();
        state.last_ts_ms = None;
        state.last_message_id = None;
        assert_eq!(
            decide_with(Some(&state), 10),
            BootstrapDecision::Run(BootstrapReason::MissingCursor)
        );
    }

    #[test]
    fn empty_local_store_runs_even_with_cursor() {
        assert_eq!(
            decide_with(Some(&settled_state()), 0),
            BootstrapDecision::Run(BootstrapReason::LocalEmpty)
        );
    }

    #[test]
    fn gap_outranks_incomplete_and_upgrades() {
        let mut state = settled_state();
        state.gap_detected = true;
        state.bootstrap_incomplete = true;
        state.schema_version = SCHEMA - 1;
        state.app_version = "0.9.0".to_string();
        assert_eq!(
            decide_with(Some(&state), 10),
            BootstrapDecision::Run(BootstrapReason::GapDetected)
        );
    }

    #[test]
    fn incomplete_outranks_upgrades() {
        let mut state = settled_state();
        state.bootstrap_incomplete = true;
        state.schema_version = SCHEMA - 1;
        assert_eq!(
            decide_with(Some(&state), 10),
            BootstrapDecision::Run(BootstrapReason::BootstrapIncomplete)
        );
    }

    #[test]
    fn schema_upgrade_outranks_app_upgrade() {
        let mut state = settled_state();
        state.schema_version = SCHEMA - 1;
        state.app_version = "0.9.0".to_string();
        assert_eq!(
            decide_with(Some(&state), 10),
            BootstrapDecision::Run(BootstrapReason::SchemaUpgrade)
        );

        let mut state = settled_state();
        state.app_version = "0.9.0".to_string();
        assert_eq!(
            decide_with(Some(&state), 10),
            BootstrapDecision::Run(BootstrapReason::AppUpgrade)
        );
    }

    #[test]
    fn newer_stored_schema_does_not_trigger_a_downgrade_bootstrap() {
        let mut state = settled_state();
        state.schema_version = SCHEMA + 1;
        assert_eq!(decide_with(Some(&state), 10), BootstrapDecision::Skip);
    }

    #[test]
    fn disabled_feature_skips_everything() {
        assert_eq!(decide(None, 0, SCHEMA, APP, false), BootstrapDecision::Skip);
    }
}

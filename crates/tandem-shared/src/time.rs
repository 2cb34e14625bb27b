use chrono::Utc;

/// Current wall-clock time as milliseconds since the Unix epoch.
///
/// All persisted timestamps in the engine use this unit; the transport
/// envelope alone speaks seconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Millisecond timestamp truncated to whole seconds for the envelope.
pub fn ms_to_secs(ms: i64) -> i64 {
    ms.div_euclid(1000)
}

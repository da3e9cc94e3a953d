use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as unix epoch milliseconds. Centralized so tests can reason
/// about ordering without depending on wall-clock precision elsewhere.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

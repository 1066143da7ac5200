use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall clock time in epoch millis.
pub fn now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as i64)
    .unwrap_or_default()
}

pub fn millis(duration: Duration) -> i64 {
  duration.as_millis() as i64
}

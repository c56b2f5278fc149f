use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::Local;

/// Timestamp used in recording and session file names, unique at microsecond resolution.
pub fn file_stamp() -> String {
    Local::now().format("%Y-%m-%d-%H-%M-%S%.6f").to_string()
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    to_unix(SystemTime::now())
}

pub fn to_unix(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

pub fn mask_pii(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }
    let len = trimmed.chars().count();
    format!("<redacted len={}>", len)
}

//! Timestamp helpers.
//!
//! Dates are persisted as milliseconds since the Unix epoch.

use chrono::Utc;

/// Current time in epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

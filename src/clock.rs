//! Wall clock in epoch milliseconds.

use chrono::Utc;

/// Current time, epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

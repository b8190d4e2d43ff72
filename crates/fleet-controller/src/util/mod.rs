pub mod duration;

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Wall-clock epoch milliseconds, used for persisted timestamps.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

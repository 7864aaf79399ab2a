use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch. All wire timestamps are based on this
///  clock, so peers must have reasonably synchronized wall clocks for the
///  admission window to work.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before UNIX epoch")
        .as_millis() as u64
}

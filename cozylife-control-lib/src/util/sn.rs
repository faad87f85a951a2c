use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static LAST_SN: AtomicI64 = AtomicI64::new(0);

/// Generates the serial number (`sn`) for a request frame.
///
/// The device echoes the serial number back unchanged, which is the only way to tell
/// which request a response belongs to. The value is the current Unix time in
/// milliseconds, bumped forward when two requests land in the same millisecond so
/// that no two requests from this process ever share a serial number.
pub fn next_sn() -> String {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_SN.load(Ordering::Relaxed);
    loop {
        let candidate = now.max(last + 1);
        match LAST_SN.compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return candidate.to_string(),
            Err(actual) => last = actual,
        }
    }
}

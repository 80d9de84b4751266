use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional epoch seconds.
///
/// Wall clock (not monotonic) on purpose: timestamps written to the shared
/// store must be comparable across processes. Clock skew between processes
/// translates into bounded over- or under-admission and is not corrected.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

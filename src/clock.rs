//! Monotonic millisecond clock.
//!
//! Deadlines are compared as plain `i64` milliseconds, matching the
//! arithmetic the heap and dispatch code expect; `std::time::Instant`
//! doesn't expose a raw integer, so we go straight to `clock_gettime`.

use std::mem::MaybeUninit;

/// Milliseconds since an unspecified, monotonically increasing epoch.
pub fn now_ms() -> i64 {
    unsafe {
        let mut ts = MaybeUninit::<libc::timespec>::uninit();
        let rc = libc::clock_gettime(libc::CLOCK_MONOTONIC, ts.as_mut_ptr());
        debug_assert_eq!(rc, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
        let ts = ts.assume_init();
        (ts.tv_sec as i64) * 1000 + (ts.tv_nsec as i64) / 1_000_000
    }
}

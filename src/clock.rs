//! Millisecond clock sources.
//!
//! Every deadline in the runtime is keyed off the monotonic clock; the
//! realtime reading exists for callers that need wall-clock stamps.

use std::io;
use std::mem::MaybeUninit;

#[inline]
fn clock_ms(which: libc::clockid_t) -> u64 {
    unsafe {
        let mut ts = MaybeUninit::<libc::timespec>::zeroed().assume_init();
        if libc::clock_gettime(which, &mut ts) != 0 {
            let err = io::Error::last_os_error();
            panic!("clock_gettime failed: {}", err);
        }
        ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
    }
}

/// Milliseconds on the monotonic clock.
#[inline]
pub fn monotonic_ms() -> u64 {
    clock_ms(libc::CLOCK_MONOTONIC)
}

/// Milliseconds on the realtime clock.
#[inline]
pub fn realtime_ms() -> u64 {
    clock_ms(libc::CLOCK_REALTIME)
}

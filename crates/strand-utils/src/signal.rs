//! Process-wide signal latch.
//!
//! Blocking and spinning waits cannot take signals synchronously, so
//! termination signals are latched into an atomic slot by the handler and
//! polled at every wait iteration. The latch is sticky until consumed.

use std::sync::atomic::{AtomicI32, Ordering};

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use tracing::warn;

static PENDING: AtomicI32 = AtomicI32::new(0);

/// Register the latch for the usual termination signals. Idempotent; safe
/// to call from library init.
pub fn install() {
    for sig in [SIGINT, SIGTERM, SIGHUP] {
        // SAFETY: the handler only performs an atomic store.
        let rc = unsafe {
            signal_hook::low_level::register(sig, move || {
                PENDING.store(sig, Ordering::Release);
            })
        };
        if let Err(e) = rc {
            warn!(sig, "couldn't register signal latch: {e}");
        }
    }
}

/// Signal pending for this process, if any. Does not consume it.
#[inline]
pub fn pending() -> Option<i32> {
    match PENDING.load(Ordering::Acquire) {
        0 => None,
        sig => Some(sig),
    }
}

/// Consume and return the pending signal, if any.
#[inline]
pub fn take() -> Option<i32> {
    match PENDING.swap(0, Ordering::AcqRel) {
        0 => None,
        sig => Some(sig),
    }
}

/// Latch a signal without going through the OS. Test hook; also used by
/// embedders that deliver signals on their own.
pub fn latch(sig: i32) {
    PENDING.store(sig, Ordering::Release);
}

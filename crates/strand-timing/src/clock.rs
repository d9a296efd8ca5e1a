use once_cell::sync::OnceCell;

pub type Clock = quanta::Clock;

static GLOBAL_CLOCK: OnceCell<Clock> = OnceCell::new();
static NANOS_FOR_1M: OnceCell<u64> = OnceCell::new();

#[inline]
pub fn global_clock() -> &'static Clock {
    GLOBAL_CLOCK.get_or_init(Clock::new)
}

/// Wall-clock nanoseconds spanned by 1M raw counter ticks.
/// Calibrated once, on first use.
#[inline]
pub(crate) fn nanos_for_1m() -> u64 {
    *NANOS_FOR_1M.get_or_init(|| global_clock().delta_as_nanos(0, 1_000_000).max(1))
}

/// Raw counter ticks per microsecond.
///
/// Used to turn spin budgets and SNDTIMEO values into cycle deltas that
/// can be compared against raw timestamps without further conversion.
#[inline]
pub fn cycles_per_usec() -> u64 {
    (1_000_000_000 / nanos_for_1m()).max(1)
}

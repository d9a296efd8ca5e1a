use std::cell::Cell;

use bitflags::bitflags;

bitflags! {
    /// Per-thread opt-in mask for busy-wait backoff. A thread that has not
    /// set a bit always falls straight through to blocking.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SpinBit: u32 {
        const TCP_SEND = 1 << 0;
        const TCP_RECV = 1 << 1;
        const PKT_WAIT = 1 << 2;
    }
}

thread_local! {
    static SPIN_STATE: Cell<SpinBit> = const { Cell::new(SpinBit::empty()) };
}

/// Current thread's spin mask.
#[inline]
pub fn spin_state() -> SpinBit {
    SPIN_STATE.with(Cell::get)
}

/// Enable or disable a spin bit for the current thread. Returns the
/// previous mask.
pub fn spin_state_enable(bit: SpinBit, on: bool) -> SpinBit {
    SPIN_STATE.with(|s| {
        let prev = s.get();
        let mut next = prev;
        next.set(bit, on);
        s.set(next);
        prev
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn spin_state_is_per_thread() {
        assert_eq!(spin_state(), SpinBit::empty());
        spin_state_enable(SpinBit::TCP_SEND, true);
        assert!(spin_state().contains(SpinBit::TCP_SEND));

        std::thread::spawn(|| {
            assert_eq!(spin_state(), SpinBit::empty());
        })
        .join()
        .unwrap();

        spin_state_enable(SpinBit::TCP_SEND, false);
        assert_eq!(spin_state(), SpinBit::empty());
    }
}

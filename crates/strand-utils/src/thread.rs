use tracing::warn;

use crate::{SpinBit, spin_state_enable};

/// How a sender thread waits for transmit progress.
///
/// A blocking sender parks on the socket's condvar and needs nothing
/// special from the scheduler. A spinning sender burns its wait budget
/// busy-polling, so it wants a dedicated core and, when the process has
/// CAP_SYS_NICE, a SCHED_FIFO slot so the pause loop isn't descheduled
/// mid-budget. Either way execution continues if the OS refuses.
#[derive(Clone, Copy, Debug)]
pub enum TxThreadMode {
    Blocking,
    Spinning { core: Option<usize> },
}

/// SCHED_FIFO slot for spinning senders. Middle of the range, leaving
/// room to put a driver thread above them.
#[cfg(target_os = "linux")]
const SPINNER_RT_PRIO: libc::c_int = 60;

/// Prepare the calling thread for the transmit path: core pinning and
/// scheduling per `mode`, plus the per-thread spin opt-in bit the send
/// engine reads on every call.
pub fn boot_tx_thread(mode: TxThreadMode) {
    match mode {
        TxThreadMode::Blocking => {
            spin_state_enable(SpinBit::TCP_SEND, false);
        }
        TxThreadMode::Spinning { core } => {
            if let Some(core) = core {
                if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
                    warn!(core, "couldn't pin spinning sender");
                }
            }
            request_rt_scheduling();
            spin_state_enable(SpinBit::TCP_SEND, true);
        }
    }
}

#[cfg(target_os = "linux")]
fn request_rt_scheduling() {
    let param = libc::sched_param { sched_priority: SPINNER_RT_PRIO };
    let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
    if rc != 0 {
        warn!(prio = SPINNER_RT_PRIO, "couldn't switch sender to SCHED_FIFO");
    }
}

#[cfg(not(target_os = "linux"))]
fn request_rt_scheduling() {
    warn!("realtime sender scheduling only supported on linux");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spin_state;

    #[test]
    fn boot_modes_toggle_the_spin_bit() {
        // Own thread: the spin mask is thread-local state.
        std::thread::spawn(|| {
            boot_tx_thread(TxThreadMode::Spinning { core: None });
            assert!(spin_state().contains(SpinBit::TCP_SEND));

            boot_tx_thread(TxThreadMode::Blocking);
            assert!(!spin_state().contains(SpinBit::TCP_SEND));
        })
        .join()
        .unwrap();
    }
}

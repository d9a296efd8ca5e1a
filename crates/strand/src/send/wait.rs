//! Backpressure: the adaptive-spin and blocking halves of the wait
//! discipline. Non-blocking (EAGAIN) short-circuits in the caller.

use std::sync::atomic::Ordering;

use strand_timing::{Duration, Instant};
use strand_utils::signal;

use crate::{
    error::SendError,
    netif::Netif,
    send::SendInfo,
    sock::{TcpSock, WakeOutcome},
};

pub(super) enum Spun {
    /// Space appeared; re-enter the fill loop.
    Retry,
    /// Spin budget exhausted without progress; fall through to blocking.
    Fall,
    /// Terminal: the call is finished (short write or error).
    Done(Result<usize, SendError>),
}

impl Netif {
    /// Busy-wait for send-queue space, polling the stack when it needs it
    /// and we can take the lock. Budget is `spin_usec`, clipped by
    /// SNDTIMEO; the lock is never held across a pause iteration.
    pub(super) fn send_spin<'a>(&'a self, sock: &TcpSock, sinf: &mut SendInfo<'a>) -> Spun {
        let mut max_spin = Duration::from_usecs(self.opts.spin_usec);
        let mut limited_by_timeo = false;
        if let Some(t) = sinf.timeout {
            if t <= max_spin {
                max_spin = t;
                limited_by_timeo = true;
            }
        }

        loop {
            if self.may_poll() && self.need_poll() && sinf.trylock(self) {
                self.poll(sinf.guard());
                if sock.sendq_slack() > 0 {
                    self.is_spinner.store(false, Ordering::Relaxed);
                    return Spun::Retry;
                }
                if sock.tx_errno() != 0 {
                    self.is_spinner.store(false, Ordering::Relaxed);
                    return Spun::Done(self.finish_tx_errno(sock, sinf));
                }
            } else if !self.is_spinner.load(Ordering::Relaxed) {
                self.is_spinner.store(true, Ordering::Relaxed);
            }
            sinf.drop_lock();

            core::hint::spin_loop();
            if signal::pending().is_some() {
                self.is_spinner.store(false, Ordering::Relaxed);
                return Spun::Done(self.finish_sent_or_rc(sock, sinf, SendError::Interrupted));
            }
            if Instant::now() - sinf.start >= max_spin {
                break;
            }
        }
        self.is_spinner.store(false, Ordering::Relaxed);

        if limited_by_timeo {
            // The whole timeout went on spinning.
            return Spun::Done(self.finish_sent_or_rc(sock, sinf, SendError::WouldBlock));
        }
        if let Some(t) = &mut sinf.timeout {
            // Debit the residual timeout by the spin time.
            *t = t.saturating_sub(max_spin);
            if t.is_zero() {
                return Spun::Done(self.finish_sent_or_rc(sock, sinf, SendError::WouldBlock));
            }
        }
        Spun::Fall
    }

    /// Sleep until transmit progress. Snapshot `sleep_seq` first and
    /// re-check, so a wake between the check and the sleep cannot be
    /// lost. `None` means retry the fill loop.
    pub(super) fn send_block(
        &self,
        sock: &TcpSock,
        sinf: &mut SendInfo<'_>,
    ) -> Option<Result<usize, SendError>> {
        let seq = sock.sleep_seq.load(Ordering::Acquire);
        if sock.sendq_slack() > 0 {
            return None;
        }
        if sock.tx_errno() != 0 {
            return Some(self.finish_tx_errno(sock, sinf));
        }

        // The stack lock is never held across the sleep.
        sinf.drop_lock();
        let t0 = Instant::now();
        let outcome = sock.sleep_tx(seq, sinf.timeout);
        if let Some(t) = &mut sinf.timeout {
            *t = t.saturating_sub(t0.elapsed());
        }
        match outcome {
            WakeOutcome::Woken => {
                if sock.tx_errno() != 0 {
                    Some(self.finish_tx_errno(sock, sinf))
                } else {
                    None
                }
            }
            WakeOutcome::TimedOut => {
                Some(self.finish_sent_or_rc(sock, sinf, SendError::WouldBlock))
            }
            WakeOutcome::Signalled => {
                Some(self.finish_sent_or_rc(sock, sinf, SendError::Interrupted))
            }
        }
    }
}

use std::{
    cell::UnsafeCell,
    fmt,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
    },
};

use bitflags::bitflags;
use strand_timing::{Duration, Instant};
use strand_utils::{safe_assert, signal};

use crate::{
    netif::StackGuard,
    pkt::PktId,
    pool::PktPool,
};

/// Modular 32-bit sequence comparisons.
#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum TcpState {
    Closed = 0,
    SynSent = 1,
    Established = 2,
    CloseWait = 3,
    FinWait1 = 4,
    FinWait2 = 5,
}

impl TcpState {
    /// States in which sequence numbers are agreed and data may flow.
    #[inline]
    pub fn synchronised(self) -> bool {
        !matches!(self, TcpState::Closed | TcpState::SynSent)
    }

    fn from_u32(v: u32) -> Self {
        match v {
            1 => TcpState::SynSent,
            2 => TcpState::Established,
            3 => TcpState::CloseWait,
            4 => TcpState::FinWait1,
            5 => TcpState::FinWait2,
            _ => TcpState::Closed,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SockFlags: u32 {
        /// Disable classical Nagle (still subject to the anti-burst cap).
        const NODELAY = 1 << 0;
        /// Hold the last partial segment back; more data is coming.
        const CORK = 1 << 1;
        /// Enqueue only; do not advance. Set transiently by the OOB
        /// slowpath around its inner send.
        const NO_TX_ADVANCE = 1 << 2;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct SockId(pub u32);

impl SockId {
    pub const NONE: SockId = SockId(u32::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline]
    pub fn is_some(self) -> bool {
        self != Self::NONE
    }
}

impl fmt::Debug for SockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock:{}", self.0)
    }
}

/// An ordered packet chain linked through the arena `next` fields.
#[derive(Clone, Copy, Debug)]
pub struct PktQueue {
    pub head: PktId,
    pub tail: PktId,
    pub num: i32,
}

impl PktQueue {
    pub const fn new() -> Self {
        Self { head: PktId::NONE, tail: PktId::NONE, num: 0 }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_tail(&mut self, pool: &PktPool, id: PktId) {
        // SAFETY: the queue owns its members; `id` is being transferred in.
        unsafe {
            pool.pkt_raw(id).next = PktId::NONE;
            if self.tail.is_some() {
                pool.pkt_raw(self.tail).next = id;
            } else {
                self.head = id;
            }
        }
        self.tail = id;
        self.num += 1;
    }

    pub fn pop_head(&mut self, pool: &PktPool) -> Option<PktId> {
        if self.head.is_none() {
            return None;
        }
        let id = self.head;
        // SAFETY: queue member.
        let next = unsafe { pool.pkt_raw(id).next };
        self.head = next;
        if next.is_none() {
            self.tail = PktId::NONE;
        }
        self.num -= 1;
        safe_assert!(self.num >= 0);
        Some(id)
    }

    /// Append a pre-linked chain of `n` packets ending at `tail`.
    pub fn append_chain(&mut self, pool: &PktPool, head: PktId, tail: PktId, n: i32) {
        if self.head.is_none() {
            self.head = head;
        } else {
            // SAFETY: current tail is a queue member.
            unsafe { pool.pkt_raw(self.tail).next = head };
        }
        self.tail = tail;
        self.num += n;
    }
}

impl Default for PktQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Transmit-side cursors and queues. Only the stack lock holder may touch
/// this; access goes through [`TcpSock::tx_mut`] or, inside the engine,
/// `tx_raw`.
pub struct SockTx {
    pub sendq: PktQueue,
    pub inflight: PktQueue,
    /// Next sequence number to assign to enqueued data.
    pub enq_nxt: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_up: u32,
    /// Highest sequence the window currently allows on the wire.
    pub snd_max: u32,
    pub snd_wnd: u32,
    /// Cached IP+TCP header image copied into every packet's header slack.
    pub hdr_template: [u8; 64],
    /// Packets enqueued by direct (non-prequeue) sends.
    pub send_in: u32,
    pub stats: SockStats,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SockStats {
    pub tx_stop_nagle: u32,
    pub sendq_coalesced: u32,
}

pub(crate) enum WakeOutcome {
    Woken,
    TimedOut,
    Signalled,
}

/// Per-connection TCP state.
///
/// Split along the locking model: the atomic section is readable and (for
/// the prequeue and error fields) writable without the stack lock; the
/// `tx` section belongs to the lock holder.
pub struct TcpSock {
    pub id: SockId,
    state: AtomicU32,
    flags: AtomicU32,
    tx_errno: AtomicI32,
    so_error: AtomicI32,
    eff_mss: AtomicU32,
    /// Header bytes each outgoing segment needs right now. Senders read
    /// this without the lock when initialising buffers; the enqueue step
    /// reconciles any change.
    outgoing_hdrs_len: AtomicU32,
    sndtimeo_msec: AtomicU32,
    /// Send queue capacity in packets.
    send_max: AtomicI32,
    /// Mirror of `tx.sendq.num`, stored by the lock holder so senders can
    /// read slack without the lock.
    sendq_n: AtomicI32,
    /// Lock-free LIFO of filled-but-unsequenced packets (head `PktId`).
    prequeue: AtomicU32,
    pub send_prequeue_in: AtomicI32,
    /// Bumped on every wake; snapshot before re-checking closes the
    /// sleep/wake race.
    pub sleep_seq: AtomicU64,
    /// Loopback peer endpoint, if any; loopback always advances.
    local_peer: AtomicU32,
    wake_lock: Mutex<()>,
    wake_cond: Condvar,
    pub(crate) tx: UnsafeCell<SockTx>,
}

unsafe impl Send for TcpSock {}
unsafe impl Sync for TcpSock {}

impl TcpSock {
    pub(crate) fn new(id: SockId, eff_mss: u32, send_max: i32, snd_wnd: u32) -> Self {
        Self {
            id,
            state: AtomicU32::new(TcpState::Closed as u32),
            flags: AtomicU32::new(0),
            tx_errno: AtomicI32::new(0),
            so_error: AtomicI32::new(0),
            eff_mss: AtomicU32::new(eff_mss),
            outgoing_hdrs_len: AtomicU32::new(40),
            sndtimeo_msec: AtomicU32::new(0),
            send_max: AtomicI32::new(send_max),
            sendq_n: AtomicI32::new(0),
            prequeue: AtomicU32::new(PktId::NONE.0),
            send_prequeue_in: AtomicI32::new(0),
            sleep_seq: AtomicU64::new(0),
            local_peer: AtomicU32::new(SockId::NONE.0),
            wake_lock: Mutex::new(()),
            wake_cond: Condvar::new(),
            tx: UnsafeCell::new(SockTx {
                sendq: PktQueue::new(),
                inflight: PktQueue::new(),
                enq_nxt: 0,
                snd_una: 0,
                snd_nxt: 0,
                snd_up: 0,
                snd_max: snd_wnd,
                snd_wnd,
                hdr_template: [0; 64],
                send_in: 0,
                stats: SockStats::default(),
            }),
        }
    }

    // --- atomic section -------------------------------------------------

    #[inline]
    pub fn state(&self) -> TcpState {
        TcpState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, s: TcpState) {
        self.state.store(s as u32, Ordering::Release);
    }

    #[inline]
    pub fn tx_errno(&self) -> i32 {
        self.tx_errno.load(Ordering::Acquire)
    }

    pub(crate) fn set_tx_errno(&self, errno: i32) {
        self.tx_errno.store(errno, Ordering::Release);
    }

    /// Consume the pending asynchronous error, if any.
    pub fn take_so_error(&self) -> i32 {
        self.so_error.swap(0, Ordering::AcqRel)
    }

    pub fn set_so_error(&self, errno: i32) {
        self.so_error.store(errno, Ordering::Release);
    }

    #[inline]
    pub fn sock_flags(&self) -> SockFlags {
        SockFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn modify_flags(&self, set: SockFlags, clear: SockFlags) {
        let mut cur = self.flags.load(Ordering::Acquire);
        loop {
            let next = (cur & !clear.bits()) | set.bits();
            match self.flags.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }

    pub fn set_nodelay(&self, on: bool) {
        if on {
            self.modify_flags(SockFlags::NODELAY, SockFlags::empty());
        } else {
            self.modify_flags(SockFlags::empty(), SockFlags::NODELAY);
        }
    }

    pub fn set_cork(&self, on: bool) {
        if on {
            self.modify_flags(SockFlags::CORK, SockFlags::empty());
        } else {
            self.modify_flags(SockFlags::empty(), SockFlags::CORK);
        }
    }

    #[inline]
    pub fn eff_mss(&self) -> u32 {
        self.eff_mss.load(Ordering::Acquire)
    }

    pub fn set_eff_mss(&self, mss: u32) {
        self.eff_mss.store(mss, Ordering::Release);
    }

    #[inline]
    pub fn outgoing_hdrs_len(&self) -> u32 {
        self.outgoing_hdrs_len.load(Ordering::Acquire)
    }

    pub fn set_outgoing_hdrs_len(&self, len: u32) {
        self.outgoing_hdrs_len.store(len, Ordering::Release);
    }

    pub fn set_sndtimeo_msec(&self, ms: u32) {
        self.sndtimeo_msec.store(ms, Ordering::Release);
    }

    #[inline]
    pub fn sndtimeo(&self) -> Option<Duration> {
        match self.sndtimeo_msec.load(Ordering::Acquire) {
            0 => None,
            ms => Some(Duration::from_millis(ms as u64)),
        }
    }

    pub fn set_local_peer(&self, peer: SockId) {
        self.local_peer.store(peer.0, Ordering::Release);
    }

    #[inline]
    pub fn local_peer(&self) -> SockId {
        SockId(self.local_peer.load(Ordering::Acquire))
    }

    #[inline]
    pub fn send_max(&self) -> i32 {
        self.send_max.load(Ordering::Acquire)
    }

    pub fn set_send_max(&self, n: i32) {
        self.send_max.store(n, Ordering::Release);
    }

    /// Send-queue slack in packets, prequeue included; safe to read
    /// without the lock (the mirror trails the true count by at most one
    /// lock section).
    #[inline]
    pub fn sendq_slack(&self) -> i32 {
        self.send_max()
            - self.sendq_n.load(Ordering::Acquire)
            - self.send_prequeue_in.load(Ordering::Acquire)
    }

    pub(crate) fn store_sendq_n(&self, n: i32) {
        self.sendq_n.store(n, Ordering::Release);
    }

    // --- prequeue (CAS) -------------------------------------------------

    #[inline]
    pub(crate) fn prequeue_head(&self) -> PktId {
        PktId(self.prequeue.load(Ordering::Acquire))
    }

    /// Push a pre-linked chain whose tail is `tail_pkt`; the tail's arena
    /// link is re-pointed at the current head inside the CAS loop.
    pub(crate) fn prequeue_push(&self, pool: &PktPool, head: PktId, tail_pkt: PktId) {
        let mut cur = self.prequeue.load(Ordering::Acquire);
        loop {
            // SAFETY: tail_pkt is owned by this sender until the CAS lands.
            unsafe { pool.pkt_raw(tail_pkt).next = PktId(cur) };
            match self.prequeue.compare_exchange_weak(
                cur,
                head.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(c) => cur = c,
            }
        }
    }

    /// Atomically claim the whole prequeue. Contended freely with other
    /// drainers; the loser sees `NONE`.
    pub(crate) fn prequeue_take(&self) -> PktId {
        PktId(self.prequeue.swap(PktId::NONE.0, Ordering::AcqRel))
    }

    // --- lock-owned section ---------------------------------------------

    /// # Safety
    /// Caller must hold the stack lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn tx_raw(&self) -> &mut SockTx {
        unsafe { &mut *self.tx.get() }
    }

    /// Guard-gated view of the lock-owned section.
    pub fn tx_mut<'g>(&self, _g: &'g mut StackGuard<'_>) -> &'g mut SockTx {
        unsafe { &mut *self.tx.get() }
    }

    pub fn tx_ref<'g>(&self, _g: &'g StackGuard<'_>) -> &'g SockTx {
        unsafe { &*self.tx.get() }
    }

    // --- sleep / wake ---------------------------------------------------

    /// Wake any sender blocked on transmit progress.
    pub(crate) fn wake_tx(&self) {
        self.sleep_seq.fetch_add(1, Ordering::AcqRel);
        let _guard = self.wake_lock.lock().unwrap();
        self.wake_cond.notify_all();
    }

    /// Sleep until woken, signalled, or timed out. `seq` is the
    /// `sleep_seq` snapshot taken before the caller's final state
    /// re-check; a wake between snapshot and sleep falls through
    /// immediately. Must not be called with the stack lock held.
    pub(crate) fn sleep_tx(&self, seq: u64, timeout: Option<Duration>) -> WakeOutcome {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.wake_lock.lock().unwrap();
        loop {
            if self.sleep_seq.load(Ordering::Acquire) != seq {
                return WakeOutcome::Woken;
            }
            if signal::pending().is_some() {
                return WakeOutcome::Signalled;
            }
            // Chunked waits bound the latency of latched-signal delivery.
            let chunk = std::time::Duration::from_millis(20);
            let wait = match deadline {
                None => chunk,
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return WakeOutcome::TimedOut;
                    }
                    std::time::Duration::from(d - now).min(chunk)
                }
            };
            let (g, _) = self.wake_cond.wait_timeout(guard, wait).unwrap();
            guard = g;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn seq_comparisons_wrap() {
        assert!(seq_lt(u32::MAX - 1, 2));
        assert!(seq_le(5, 5));
        assert!(!seq_lt(5, 5));
        assert!(!seq_lt(3, u32::MAX - 3));
    }

    #[test]
    fn pkt_queue_push_pop() {
        let pool = PktPool::new(4, 4).unwrap();
        let mut q = PktQueue::new();
        let a = pool.alloc_nonb().unwrap();
        let b = pool.alloc_nonb().unwrap();
        q.push_tail(&pool, a);
        q.push_tail(&pool, b);
        assert_eq!(q.num, 2);
        assert_eq!(q.pop_head(&pool), Some(a));
        assert_eq!(q.pop_head(&pool), Some(b));
        assert_eq!(q.pop_head(&pool), None);
        assert!(q.is_empty());
    }

    #[test]
    fn wake_closes_sleep_race() {
        let sock = TcpSock::new(SockId(0), 1460, 8, 1 << 16);
        // Wake lands between snapshot and sleep: sleeper must not block.
        let seq = sock.sleep_seq.load(Ordering::Acquire);
        sock.wake_tx();
        match sock.sleep_tx(seq, Some(Duration::from_millis(1_000))) {
            WakeOutcome::Woken => {}
            _ => panic!("sleep missed a wake that preceded it"),
        }
    }

    #[test]
    fn sleep_times_out() {
        let sock = TcpSock::new(SockId(0), 1460, 8, 1 << 16);
        let seq = sock.sleep_seq.load(Ordering::Acquire);
        let t0 = std::time::Instant::now();
        match sock.sleep_tx(seq, Some(Duration::from_millis(30))) {
            WakeOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
        assert!(t0.elapsed() >= std::time::Duration::from_millis(25));
    }
}

use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
};

use strand_utils::safe_assert;
use tracing::{trace, warn};

use crate::{
    config::StackOpts,
    endpoint::EndpointTable,
    error::{PoolError, SendError},
    pkt::{PktFlags, PktId, TCP_FLAG_URG},
    pool::PktPool,
    ring::MpscRing,
    sock::{SockFlags, SockId, TcpSock, TcpState, seq_le, seq_lt},
};

const LOCKED: u64 = 1;
const DEFER: u64 = 2;

/// Completion delivered by the NIC/driver side.
#[derive(Clone, Copy, Debug)]
pub enum NicEvent {
    Ack { sock: SockId, ack_seq: u32 },
}

/// One segment handed to the NIC ring.
#[derive(Clone, Copy, Debug)]
pub struct TxDesc {
    pub sock: SockId,
    pub pkt: PktId,
    pub start_seq: u32,
    pub end_seq: u32,
    pub tcp_flags: u8,
}

/// Everything only the stack lock holder may touch.
pub struct NetifState {
    /// Segments emitted to the NIC ring, oldest first.
    pub tx_emitted: VecDeque<TxDesc>,
}

#[derive(Debug, Default)]
pub struct NetifStats {
    pub nonb_pool_empty: AtomicU64,
    pub lock_contends: AtomicU64,
    pub deferred_offers: AtomicU64,
    pub polls: AtomicU64,
}

impl NetifStats {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// A network interface instance: the packet arena, its endpoint table and
/// the single stack lock serialising all transmit mutations.
pub struct Netif {
    pub(crate) opts: StackOpts,
    pub(crate) pool: PktPool,
    lock: AtomicU64,
    endpoints: EndpointTable,
    events: MpscRing<NicEvent>,
    deferred: MpscRing<u32>,
    state: UnsafeCell<NetifState>,
    pub(crate) is_spinner: AtomicBool,
    pub stats: NetifStats,
}

unsafe impl Send for Netif {}
unsafe impl Sync for Netif {}

/// Witness that the stack lock is held. Releasing it (drop) first drains
/// any work deferred by senders that lost `lock_or_defer`.
pub struct StackGuard<'a> {
    pub(crate) ni: &'a Netif,
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        let ni = self.ni;
        ni.unlock_inner(self);
    }
}

impl Netif {
    pub fn new(opts: StackOpts) -> Result<Self, PoolError> {
        crate::init();
        let pool = PktPool::new(opts.n_pkt_bufs, opts.nonb_pool_pkts)?;
        let endpoints = EndpointTable::new(&opts);
        Ok(Self {
            opts,
            pool,
            lock: AtomicU64::new(0),
            endpoints,
            events: MpscRing::new(1024),
            deferred: MpscRing::new(256),
            state: UnsafeCell::new(NetifState { tx_emitted: VecDeque::new() }),
            is_spinner: AtomicBool::new(false),
            stats: NetifStats::default(),
        })
    }

    #[inline]
    pub fn opts(&self) -> &StackOpts {
        &self.opts
    }

    pub fn create_sock(&self) -> SockId {
        self.endpoints.alloc()
    }

    /// Endpoint lookup with validity check.
    pub fn endpoint(&self, id: SockId) -> Result<&TcpSock, SendError> {
        self.endpoints.lookup(id).ok_or(SendError::NotConnected)
    }

    // --- stack lock -----------------------------------------------------

    pub fn trylock(&self) -> Option<StackGuard<'_>> {
        let prev = self.lock.fetch_or(LOCKED, Ordering::Acquire);
        if prev & LOCKED == 0 { Some(StackGuard { ni: self }) } else { None }
    }

    /// Blocking acquire. Contention on this lock is short by construction,
    /// so this spins rather than parking.
    pub fn lock(&self) -> StackGuard<'_> {
        let mut spins = 0u32;
        loop {
            if let Some(g) = self.trylock() {
                return g;
            }
            core::hint::spin_loop();
            spins += 1;
            if spins % 1024 == 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Try to take the lock; on failure, offer the holder this socket's
    /// prequeue as deferred work. Returns a guard iff the caller got the
    /// lock (in which case it must finish its own work).
    pub fn lock_or_defer(&self, sock: SockId) -> Option<StackGuard<'_>> {
        if let Some(g) = self.trylock() {
            return Some(g);
        }
        NetifStats::bump(&self.stats.lock_contends);
        if self.deferred.push(sock.0).is_err() {
            // Offer channel full: fall back to taking the lock ourselves.
            return Some(self.lock());
        }
        NetifStats::bump(&self.stats.deferred_offers);
        let prev = self.lock.fetch_or(DEFER, Ordering::AcqRel);
        if prev & LOCKED == 0 {
            // The holder released between our trylock and the flag; the
            // offer would go stale, so try to become the holder.
            if let Some(g) = self.trylock() {
                return Some(g);
            }
        }
        None
    }

    fn unlock_inner(&self, g: &mut StackGuard<'_>) {
        loop {
            while self.lock.load(Ordering::Acquire) & DEFER != 0 {
                self.lock.fetch_and(!DEFER, Ordering::AcqRel);
                // SAFETY: we are the lock holder, hence the single consumer.
                while let Some(sid) = unsafe { self.deferred.pop() } {
                    if let Ok(sock) = self.endpoint(SockId(sid)) {
                        self.deferred_prequeue_work(g, sock);
                    }
                }
            }
            if self
                .lock
                .compare_exchange(LOCKED, 0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            // DEFER reappeared; drain again before releasing.
        }
    }

    /// # Safety
    /// Caller must hold the stack lock.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn state_raw(&self) -> &mut NetifState {
        unsafe { &mut *self.state.get() }
    }

    pub fn state_mut<'g>(&self, _g: &'g mut StackGuard<'_>) -> &'g mut NetifState {
        unsafe { &mut *self.state.get() }
    }

    pub fn with_lock<R>(&self, f: impl FnOnce(&mut StackGuard<'_>) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    // --- polling --------------------------------------------------------

    #[inline]
    pub fn may_poll(&self) -> bool {
        self.opts.may_poll
    }

    #[inline]
    pub fn has_event(&self) -> bool {
        !self.events.is_empty()
    }

    #[inline]
    pub fn need_poll(&self) -> bool {
        self.has_event()
    }

    /// Drain up to `evs_per_poll` NIC completions.
    pub fn poll(&self, g: &mut StackGuard<'_>) {
        NetifStats::bump(&self.stats.polls);
        for _ in 0..self.opts.evs_per_poll {
            // SAFETY: lock holder is the single consumer.
            let Some(ev) = (unsafe { self.events.pop() }) else { break };
            match ev {
                NicEvent::Ack { sock, ack_seq } => self.apply_ack(g, sock, ack_seq),
            }
        }
    }

    fn apply_ack(&self, g: &mut StackGuard<'_>, sid: SockId, ack: u32) {
        let Ok(sock) = self.endpoint(sid) else {
            warn!(?sid, "ack for dead endpoint");
            return;
        };
        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };
        if !seq_lt(tx.snd_una, ack) || !seq_le(ack, tx.snd_nxt) {
            trace!(?sid, ack, una = tx.snd_una, "stale ack");
            return;
        }
        tx.snd_una = ack;
        tx.snd_max = ack.wrapping_add(tx.snd_wnd);
        loop {
            let head = tx.inflight.head;
            if head.is_none() {
                break;
            }
            // SAFETY: inflight member, lock held.
            let pkt = unsafe { self.pool.pkt_raw(head) };
            if !seq_le(pkt.end_seq, ack) {
                break;
            }
            tx.inflight.pop_head(&self.pool);
            unsafe { self.pool.release_pkt(head, true) };
        }
        // The window may have opened; push more and wake any waiter that
        // now has send-queue space.
        self.tx_advance(g, sock);
        if sock.sendq_slack() > 0 {
            sock.wake_tx();
        }
    }

    // --- transmit -------------------------------------------------------

    /// Move every currently-eligible packet from the send queue to the
    /// wire: stops at the window edge and at a corked (`TX_MORE`) segment.
    pub fn tx_advance(&self, _g: &mut StackGuard<'_>, sock: &TcpSock) {
        if sock.sock_flags().contains(SockFlags::NO_TX_ADVANCE) {
            return;
        }
        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };
        loop {
            let head = tx.sendq.head;
            if head.is_none() {
                break;
            }
            // SAFETY: sendq member, lock held.
            let pkt = unsafe { self.pool.pkt_raw(head) };
            // TX_MORE withholds only a final partial segment; once data
            // is queued behind it there is nothing left to wait for.
            if pkt.flags.contains(PktFlags::TX_MORE) && tx.sendq.num == 1 {
                break;
            }
            if !seq_le(pkt.end_seq, tx.snd_max) {
                break;
            }
            tx.sendq.pop_head(&self.pool);
            sock.store_sendq_n(tx.sendq.num);

            if seq_lt(pkt.start_seq, tx.snd_up) {
                pkt.tcp_flags |= TCP_FLAG_URG;
            }
            // Stamp the flag byte last; PSH may have been fixed up after
            // the headers were prepared.
            pkt.buf[33] = pkt.tcp_flags;
            tx.snd_nxt = pkt.end_seq;

            let desc = TxDesc {
                sock: sock.id,
                pkt: head,
                start_seq: pkt.start_seq,
                end_seq: pkt.end_seq,
                tcp_flags: pkt.tcp_flags,
            };
            // SAFETY: lock held.
            unsafe { self.state_raw() }.tx_emitted.push_back(desc);
            tx.inflight.push_tail(&self.pool, head);
            trace!(sock = ?sock.id, start = desc.start_seq, end = desc.end_seq, "tx");
        }
    }

    // --- driver / endpoint surface -------------------------------------

    /// Mark the connection synchronised and seed the sequence cursors and
    /// header template. Stands in for the handshake the receive path would
    /// normally complete.
    pub fn establish(&self, id: SockId, iss: u32) -> Result<(), SendError> {
        let sock = self.endpoint(id)?;
        {
            let mut g = self.lock();
            let tx = sock.tx_mut(&mut g);
            tx.enq_nxt = iss;
            tx.snd_una = iss;
            tx.snd_nxt = iss;
            tx.snd_up = iss;
            tx.snd_max = iss.wrapping_add(tx.snd_wnd);
            tx.hdr_template.fill(0);
            tx.hdr_template[0] = 0x45; // IPv4, 20-byte header
            tx.hdr_template[8] = 64; // ttl
            tx.hdr_template[9] = libc::IPPROTO_TCP as u8;
        }
        sock.set_outgoing_hdrs_len(40);
        sock.set_state(TcpState::Established);
        sock.wake_tx();
        Ok(())
    }

    /// Mark a connect as initiated (SYN on the wire). The receive side
    /// completes the handshake via [`Netif::establish`].
    pub fn start_connect(&self, id: SockId) -> Result<(), SendError> {
        self.endpoint(id)?.set_state(TcpState::SynSent);
        Ok(())
    }

    /// Latch a terminal transmit error (driven by the receive/timer side)
    /// and wake any blocked sender so it observes it.
    pub fn abort_tx(&self, id: SockId, errno: i32) -> Result<(), SendError> {
        let sock = self.endpoint(id)?;
        safe_assert!(errno != 0);
        sock.set_tx_errno(errno);
        sock.wake_tx();
        Ok(())
    }

    /// Wake a sender blocked on transmit progress.
    pub fn wake_tx(&self, id: SockId) -> Result<(), SendError> {
        self.endpoint(id)?.wake_tx();
        Ok(())
    }

    /// Read-only view of an arena packet. Driver/diagnostic surface; the
    /// guard witnesses that the queues holding it can't move underneath.
    pub fn with_pkt<R>(
        &self,
        _g: &StackGuard<'_>,
        id: PktId,
        f: impl FnOnce(&crate::pkt::Packet) -> R,
    ) -> R {
        // SAFETY: lock held, read-only use.
        f(unsafe { self.pool.pkt_raw(id) })
    }

    /// Driver-side completion injection. Lock-free.
    pub fn inject_ack(&self, id: SockId, ack_seq: u32) {
        if self.events.push(NicEvent::Ack { sock: id, ack_seq }).is_err() {
            warn!(?id, "completion ring overflow, ack dropped");
        }
    }

    /// Take every segment emitted so far. Driver/test surface.
    pub fn take_emitted(&self, g: &mut StackGuard<'_>) -> Vec<TxDesc> {
        self.state_mut(g).tx_emitted.drain(..).collect()
    }
}

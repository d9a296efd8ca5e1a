//! The TCP transmit engine.
//!
//! Data is segmented into arena packets on a private fill list, then
//! handed to the stack: directly under the stack lock when it can be
//! taken, otherwise through the lock-free prequeue with a deferred-work
//! offer to the current holder. Backpressure re-enters through the wait
//! controller in `wait.rs`.

mod filler;
mod wait;
mod zc;

use std::ptr;

use bitflags::bitflags;
pub use filler::Iovec;
use filler::{IovCursor, PktFiller, merge_payload};
use strand_timing::{Duration, Instant};
use strand_utils::{
    SpinBit, safe_assert, safe_assert_eq, spin_state,
};
use tracing::{debug, trace};
pub use zc::{ZcBuf, ZcIov, ZcMsg};

use crate::{
    error::SendError,
    netif::{Netif, NetifStats, StackGuard},
    pkt::{PKT_BUF_SIZE, Packet, PktFlags, PktId, TCP_FLAG_ACK, TCP_FLAG_PSH},
    sock::{SockFlags, SockId, SockTx, TcpSock, TcpState, WakeOutcome, seq_lt},
};

bitflags! {
    /// Per-call send flags. Unknown bits from foreign ABIs are dropped by
    /// `from_bits_truncate`, mirroring how the syscall surface ignores
    /// flags it doesn't know.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        const DONTWAIT = 1 << 0;
        const MORE = 1 << 1;
        const OOB = 1 << 2;
    }
}

/// Book-keeping for one send call.
pub(crate) struct SendInfo<'a> {
    pub lock: Option<StackGuard<'a>>,
    pub timeout: Option<Duration>,
    pub start: Instant,
    pub spin: bool,
    pub total_unsent: usize,
    pub total_sent: usize,
    pub n_needed: u32,
    pub fill_list: *mut Packet,
    pub fill_list_bytes: usize,
    pub n_filled: u32,
    pub filler: PktFiller,
}

impl<'a> SendInfo<'a> {
    fn new(sock: &TcpSock) -> Self {
        Self {
            lock: None,
            timeout: sock.sndtimeo(),
            start: Instant::now(),
            spin: spin_state().contains(SpinBit::TCP_SEND),
            total_unsent: 0,
            total_sent: 0,
            n_needed: 0,
            fill_list: ptr::null_mut(),
            fill_list_bytes: 0,
            n_filled: 0,
            filler: PktFiller::new(),
        }
    }

    /// Take the stack lock if not already held by this call.
    pub fn trylock(&mut self, ni: &'a Netif) -> bool {
        if self.lock.is_some() {
            return true;
        }
        match ni.trylock() {
            Some(g) => {
                self.lock = Some(g);
                true
            }
            None => false,
        }
    }

    pub fn ensure_lock(&mut self, ni: &'a Netif) {
        if self.lock.is_none() {
            self.lock = Some(ni.lock());
            NetifStats::bump(&ni.stats.lock_contends);
        }
    }

    #[inline]
    pub fn drop_lock(&mut self) {
        self.lock = None;
    }

    #[inline]
    pub fn guard(&mut self) -> &mut StackGuard<'a> {
        self.lock.as_mut().expect("stack lock held")
    }

    fn take_fill_list(&mut self) -> *mut Packet {
        let l = self.fill_list;
        self.fill_list = ptr::null_mut();
        l
    }
}

impl Netif {
    /// Send user data on an established connection.
    ///
    /// Returns the bytes accepted. Once any bytes are enqueued the call
    /// reports that count even if it then hits an error or cancellation;
    /// the condition surfaces on the next call.
    pub fn send(&self, id: SockId, iov: &[Iovec], flags: SendFlags) -> Result<usize, SendError> {
        let sock = self.endpoint(id)?;
        self.tcp_send(sock, iov, flags)
    }

    /// Single-buffer convenience wrapper.
    pub fn send_slice(
        &self,
        id: SockId,
        buf: &[u8],
        flags: SendFlags,
    ) -> Result<usize, SendError> {
        self.send(id, &[Iovec::from_slice(buf)], flags)
    }

    fn tcp_send(
        &self,
        sock: &TcpSock,
        iov: &[Iovec],
        flags: SendFlags,
    ) -> Result<usize, SendError> {
        let mut sinf = SendInfo::new(sock);

        let mut total = 0usize;
        for v in iov {
            if v.base.is_null() && v.len > 0 {
                // No partial enqueue on a user fault.
                return self.finish_rc_or_tx_errno(sock, &mut sinf, Some(SendError::Fault));
            }
            total += v.len;
        }
        sinf.total_unsent = total;

        if !sock.state().synchronised() {
            if let Some(done) = self.send_not_synchronised(sock, flags, &mut sinf) {
                return done;
            }
        }
        if sinf.total_unsent == 0 {
            sinf.drop_lock();
            return Ok(0);
        }
        if flags.contains(SendFlags::OOB) {
            return self.send_oob(sock, iov, flags, sinf);
        }

        let eff_mss = sock.eff_mss();
        safe_assert!(eff_mss as usize + sock.outgoing_hdrs_len() as usize <= PKT_BUF_SIZE);
        let mut cursor = IovCursor::new(iov);

        // A non-empty send queue usually means no window, but under
        // CORK/MORE the tail may have slack worth topping up first.
        if sinf.trylock(self) {
            // SAFETY: stack lock held.
            let sendq_empty = unsafe { sock.tx_raw() }.sendq.is_empty();
            if !sendq_empty && sock.tx_errno() == 0 {
                self.fill_sendq_tail(sock, &mut cursor, &mut sinf);
                if sinf.total_unsent == 0 {
                    // SAFETY: stack lock held.
                    let tx = unsafe { sock.tx_raw() };
                    let tail = unsafe { self.pool.pkt_raw(tx.sendq.tail) };
                    if flags.contains(SendFlags::MORE)
                        || sock.sock_flags().contains(SockFlags::CORK)
                    {
                        tail.flags |= PktFlags::TX_MORE;
                    } else {
                        tail.flags.remove(PktFlags::TX_MORE);
                        tail.tcp_flags |= TCP_FLAG_PSH;
                    }
                    // Window, CORK timer or Nagle will push it; the policy
                    // call sorts out which.
                    self.tx_advance_nagle(sinf.guard(), sock);
                    let sent = sinf.total_sent;
                    sinf.drop_lock();
                    return Ok(sent);
                }
            }
        }

        loop {
            safe_assert!(sinf.total_unsent > 0);

            let slack = sock.sendq_slack();
            if slack <= 0 {
                match self.wait_for_space(sock, flags, &mut sinf) {
                    Some(done) => return done,
                    None => continue,
                }
            }

            sinf.n_needed = (sinf.total_unsent.div_ceil(eff_mss as usize))
                .min(self.opts.tx_batch as usize)
                .min(slack as usize) as u32;
            if let Some(done) = self.alloc_batch(sock, &mut sinf) {
                return done;
            }

            // Fill the batch; build the list LIFO so the enqueue walk
            // restores producer order.
            let m = sinf.n_needed;
            sinf.fill_list_bytes = 0;
            sinf.n_filled = 0;
            let hdrs = sock.outgoing_hdrs_len();
            for i in 0..m {
                let pktp = sinf.filler.next_pkt().expect("batch allocated above");
                // SAFETY: filler-owned packet.
                let pkt = unsafe { &mut *pktp };
                pkt.init_tx(hdrs, eff_mss.min((PKT_BUF_SIZE as u32) - hdrs));
                let want = (sinf.total_unsent - sinf.fill_list_bytes).min(pkt.left() as usize);
                let n = cursor.fill(pkt, want);
                pkt.end_seq = n as u32;
                sinf.fill_list_bytes += n;
                sinf.n_filled += 1;
                // Hold back the last partial segment when more is coming.
                if i == m - 1
                    && (flags.contains(SendFlags::MORE)
                        || sock.sock_flags().contains(SockFlags::CORK))
                {
                    pkt.flags |= PktFlags::TX_MORE;
                }
                pkt.fill_next = sinf.fill_list;
                sinf.fill_list = pktp;
            }
            trace!(sock = ?sock.id, n = sinf.n_filled, bytes = sinf.fill_list_bytes, "filled");

            // Hand off: enqueue directly if the lock is free, otherwise
            // through the prequeue.
            if sinf.trylock(self) {
                if sock.tx_errno() != 0 {
                    return self.finish_tx_errno(sock, &mut sinf);
                }
                let last_pkt = sinf.fill_list;
                let bytes = sinf.fill_list_bytes;
                let list = sinf.take_fill_list();
                self.sendmsg_enqueue(sinf.guard(), sock, list, bytes);
                sinf.total_sent += bytes;
                sinf.total_unsent -= bytes;
                sinf.fill_list_bytes = 0;

                if sinf.total_unsent == 0 {
                    // SAFETY: enqueued under the lock we still hold.
                    let lp = unsafe { &mut *last_pkt };
                    if lp.flags.contains(PktFlags::TX_MORE) {
                        lp.tcp_flags = TCP_FLAG_ACK;
                    } else {
                        lp.tcp_flags = TCP_FLAG_ACK | TCP_FLAG_PSH;
                    }
                    self.tx_advance_nagle(sinf.guard(), sock);
                    safe_assert_eq!(sinf.filler.n_alloced, 0);
                    let sent = sinf.total_sent;
                    sinf.drop_lock();
                    return Ok(sent);
                }

                // More to segment: push what we have out first.
                self.poll(sinf.guard());
                if sock.tx_errno() != 0 {
                    return self.finish_tx_errno(sock, &mut sinf);
                }
                // SAFETY: stack lock held.
                if !unsafe { sock.tx_raw() }.sendq.is_empty() {
                    self.tx_advance(sinf.guard(), sock);
                }
            } else {
                if sock.tx_errno() != 0 {
                    return self.finish_tx_errno(sock, &mut sinf);
                }
                if sinf.total_unsent == sinf.fill_list_bytes {
                    // Final segment of the write; it needs PSH once the
                    // drainer writes its headers.
                    let head = unsafe { &mut *sinf.fill_list };
                    if !head.flags.contains(PktFlags::TX_MORE) {
                        head.flags |= PktFlags::TX_PSH;
                    }
                }
                let bytes = sinf.fill_list_bytes;
                self.tx_prequeue(sock, sinf.take_fill_list());
                sinf.total_sent += bytes;
                sinf.total_unsent -= bytes;
                sinf.fill_list_bytes = 0;

                if let Some(g) = self.lock_or_defer(sock.id) {
                    sinf.lock = Some(g);
                    if sock.tx_errno() != 0 {
                        return self.finish_tx_errno(sock, &mut sinf);
                    }
                    self.enqueue_prequeue(sinf.guard(), sock);
                    // SAFETY: stack lock held.
                    if !unsafe { sock.tx_raw() }.sendq.is_empty() {
                        if sinf.total_unsent == 0 {
                            self.tx_advance_nagle(sinf.guard(), sock);
                        } else {
                            self.tx_advance(sinf.guard(), sock);
                        }
                    }
                }
                if sinf.total_unsent == 0 {
                    safe_assert_eq!(sinf.filler.n_alloced, 0);
                    let sent = sinf.total_sent;
                    sinf.drop_lock();
                    return Ok(sent);
                }
            }
        }
    }

    // --- segmentation helpers -------------------------------------------

    /// Top up the send-queue tail's slack from the iovec. Lock held; only
    /// touches a packet still owned by the send queue (never in flight).
    fn fill_sendq_tail(&self, sock: &TcpSock, cursor: &mut IovCursor<'_>, sinf: &mut SendInfo<'_>) {
        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };
        let tail = unsafe { self.pool.pkt_raw(tx.sendq.tail) };
        if tail.left() == 0 {
            return;
        }
        let want = (tail.left() as usize).min(sinf.total_unsent);
        let n = cursor.fill(tail, want);
        tail.end_seq = tail.end_seq.wrapping_add(n as u32);
        tx.enq_nxt = tx.enq_nxt.wrapping_add(n as u32);
        sinf.total_sent += n;
        sinf.total_unsent -= n;
        trace!(sock = ?sock.id, n, left = tail.left(), "topped up sendq tail");
    }

    /// Grab `sinf.n_needed` packets, preferring the non-blocking sub-pool,
    /// falling back to the TX sub-pool under the lock. Reduces `n_needed`
    /// to a partial batch rather than blocking while holding filled data;
    /// blocks on the pool only with nothing in hand.
    fn alloc_batch<'a>(
        &'a self,
        sock: &TcpSock,
        sinf: &mut SendInfo<'a>,
    ) -> Option<Result<usize, SendError>> {
        loop {
            while sinf.filler.n_alloced < sinf.n_needed {
                match self.pool.alloc_nonb() {
                    Some(id) => sinf.filler.add(&self.pool, id),
                    None => break,
                }
            }
            if sinf.filler.n_alloced >= sinf.n_needed {
                return None;
            }
            NetifStats::bump(&self.stats.nonb_pool_empty);

            if !sinf.trylock(self) {
                if sinf.filler.n_alloced > 0 {
                    // Partial batch: push what we can before waiting.
                    sinf.n_needed = sinf.filler.n_alloced;
                    return None;
                }
                sinf.ensure_lock(self);
            }
            // SAFETY: stack lock held for the TX sub-pool.
            unsafe {
                if !self.pool.tx_may_alloc() {
                    // Bring completions up to date before concluding the
                    // pool is dry.
                    self.poll(sinf.guard());
                }
                while sinf.filler.n_alloced < sinf.n_needed {
                    match self.pool.alloc_tx_locked() {
                        Some(id) => {
                            // We would have preferred the non-blocking
                            // pool; arrange for it to be freed there.
                            self.pool.pkt_raw(id).flags |= PktFlags::NONB_POOL;
                            sinf.filler.add(&self.pool, id);
                        }
                        None => break,
                    }
                }
            }
            if sinf.filler.n_alloced >= sinf.n_needed {
                return None;
            }
            if sinf.filler.n_alloced > 0 {
                sinf.n_needed = sinf.filler.n_alloced;
                return None;
            }

            // Both sub-pools dry. The pool wait never sleeps holding the
            // stack lock.
            sinf.drop_lock();
            if let Err(e) = self.pool.wait() {
                return Some(self.finish_sent_or_rc(sock, sinf, e));
            }
            if sock.tx_errno() != 0 {
                return Some(self.finish_tx_errno(sock, sinf));
            }
        }
    }

    // --- enqueue (stack lock held) --------------------------------------

    /// Write headers and sequence numbers into a filled packet.
    /// `pkt.start_seq` still holds the header length used at init; recover
    /// it before overwriting, and re-slot option space if the header
    /// layout changed since the buffer was filled.
    fn prep_pkt(&self, tx: &mut SockTx, sock: &TcpSock, pkt: &mut Packet, seq: u32) {
        let orig_hdr = pkt.start_seq;
        let hdrs = sock.outgoing_hdrs_len();
        if hdrs != orig_hdr {
            insert_option_space(pkt, orig_hdr, hdrs);
        }
        let h = hdrs as usize;
        pkt.buf[..h].copy_from_slice(&tx.hdr_template[..h]);
        // TCP data offset covers whatever options are in play now.
        pkt.buf[32] = (((hdrs - 20) / 4) as u8) << 4;
        pkt.buf[24..28].copy_from_slice(&seq.to_be_bytes());
        pkt.start_seq = seq;
        pkt.end_seq = pkt.end_seq.wrapping_add(seq);
        pkt.tcp_flags |= TCP_FLAG_ACK;
        if pkt.flags.contains(PktFlags::TX_PSH) {
            pkt.tcp_flags |= TCP_FLAG_PSH;
        }
        // Re-cap the segment in case eff_mss changed under our feet.
        pkt.buf_end = (hdrs + sock.eff_mss()).min(PKT_BUF_SIZE as u32);
    }

    /// Consume a LIFO fill list in producer order, assign a contiguous
    /// sequence range and append to the send queue.
    fn sendmsg_enqueue(
        &self,
        _g: &mut StackGuard<'_>,
        sock: &TcpSock,
        reverse_list: *mut Packet,
        total_bytes: usize,
    ) {
        safe_assert!(!reverse_list.is_null());
        safe_assert_eq!(sock.tx_errno(), 0);
        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };

        let mut seq = tx.enq_nxt.wrapping_add(total_bytes as u32);
        // The LIFO head is the newest packet: it becomes the queue tail.
        let tail_id = unsafe { (*reverse_list).id };
        let mut send_list = PktId::NONE;
        let mut n_pkts = 0i32;
        let mut p = reverse_list;
        while !p.is_null() {
            // SAFETY: fill-list member owned by this call.
            let pkt = unsafe { &mut *p };
            let next = pkt.fill_next;
            pkt.fill_next = ptr::null_mut();

            seq = seq.wrapping_sub(pkt.end_seq);
            self.prep_pkt(tx, sock, pkt, seq);

            pkt.next = send_list;
            send_list = pkt.id;
            n_pkts += 1;
            p = next;
        }
        safe_assert_eq!(tx.enq_nxt, seq);
        tx.enq_nxt = tx.enq_nxt.wrapping_add(total_bytes as u32);

        self.pool.debit_async(n_pkts);
        tx.sendq.append_chain(&self.pool, send_list, tail_id, n_pkts);
        tx.send_in += n_pkts as u32;
        sock.store_sendq_n(tx.sendq.num);
        debug!(sock = ?sock.id, n_pkts, sendq = tx.sendq.num, enq_nxt = tx.enq_nxt, "enqueued");
    }

    // --- prequeue --------------------------------------------------------

    /// Publish a fill list to the prequeue: convert the private pointer
    /// chain to arena links, then CAS the head. Order within the chain is
    /// preserved; the drain's reversal restores producer order.
    fn tx_prequeue(&self, sock: &TcpSock, fill_list: *mut Packet) {
        safe_assert!(!fill_list.is_null());
        let mut n = 1i32;
        let mut p = fill_list;
        // SAFETY: fill-list members owned by this call until the CAS lands.
        unsafe {
            while !(*p).fill_next.is_null() {
                let next = (*p).fill_next;
                (*p).next = (*next).id;
                (*p).fill_next = ptr::null_mut();
                p = next;
                n += 1;
            }
        }
        sock.send_prequeue_in.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        let head = unsafe { (*fill_list).id };
        let tail = unsafe { (*p).id };
        sock.prequeue_push(&self.pool, head, tail);
        trace!(sock = ?sock.id, n, "prequeued");
    }

    /// Drain the prequeue into the send queue: claim it, reverse it back
    /// to producer order, sequence every packet, append, then coalesce
    /// small segments in the newly appended region.
    pub(crate) fn enqueue_prequeue(&self, g: &mut StackGuard<'_>, sock: &TcpSock) {
        let mut id = sock.prequeue_take();
        if id.is_none() {
            return;
        }

        let mut send_list = PktId::NONE;
        let mut n_pkts = 0i32;
        while id.is_some() {
            // SAFETY: claimed by the swap above; lock held.
            let pkt = unsafe { self.pool.pkt_raw(id) };
            let next = pkt.next;
            pkt.next = send_list;
            send_list = id;
            n_pkts += 1;
            id = next;
        }

        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };
        let old_tail = tx.sendq.tail;
        let mut last = send_list;
        let mut walk = send_list;
        while walk.is_some() {
            let pkt = unsafe { self.pool.pkt_raw(walk) };
            let bytes = pkt.end_seq;
            let seq = tx.enq_nxt;
            self.prep_pkt(tx, sock, pkt, seq);
            tx.enq_nxt = seq.wrapping_add(bytes);
            last = walk;
            walk = pkt.next;
        }

        self.pool.debit_async(n_pkts);
        tx.sendq.append_chain(&self.pool, send_list, last, n_pkts);
        // send_in is not bumped here; prequeue arrivals were counted by
        // send_prequeue_in at push time and move over now.
        sock.send_prequeue_in.fetch_sub(n_pkts, std::sync::atomic::Ordering::Relaxed);
        sock.store_sendq_n(tx.sendq.num);
        debug!(sock = ?sock.id, n_pkts, sendq = tx.sendq.num, "drained prequeue");

        let start = if old_tail.is_some() { old_tail } else { send_list };
        self.coalesce_region(g, sock, start);
    }

    /// Merge small segments by copying payloads into tail slack. Copy-only
    /// (no data moves out of a packet already beyond the appended region),
    /// trading packing density for cpu.
    fn coalesce_region(&self, _g: &mut StackGuard<'_>, sock: &TcpSock, mut at: PktId) {
        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };
        while at.is_some() {
            let pkt = unsafe { self.pool.pkt_raw(at) };
            let next_id = pkt.next;
            if next_id.is_none() {
                break;
            }
            let next = unsafe { self.pool.pkt_raw(next_id) };
            if merge_payload(pkt, next) {
                pkt.next = next.next;
                if tx.sendq.tail == next_id {
                    tx.sendq.tail = at;
                }
                tx.sendq.num -= 1;
                sock.store_sendq_n(tx.sendq.num);
                // SAFETY: lock held; packet just unlinked.
                unsafe { self.pool.release_pkt(next_id, true) };
                tx.stats.sendq_coalesced += 1;
                // Same packet may swallow its new neighbour too.
                continue;
            }
            at = next_id;
        }
    }

    /// Deferred-work path run by the lock holder on unlock: drain the
    /// prequeue on behalf of a sender that couldn't take the lock, then
    /// advance and wake.
    pub(crate) fn deferred_prequeue_work(&self, g: &mut StackGuard<'_>, sock: &TcpSock) {
        if sock.tx_errno() != 0 {
            debug!(sock = ?sock.id, errno = sock.tx_errno(), "freeing prequeue on tx error");
            self.free_prequeue(sock, true);
            return;
        }
        self.enqueue_prequeue(g, sock);
        // SAFETY: stack lock held.
        if !unsafe { sock.tx_raw() }.sendq.is_empty() {
            // Unlock context: the stack was polled recently, don't poll
            // again here.
            self.tx_advance(g, sock);
            if sock.sendq_slack() > 0 {
                sock.wake_tx();
            }
        }
    }

    // --- Nagle -----------------------------------------------------------

    /// Decide whether the freshly appended tail may go out now (rfc896:
    /// don't send a sub-MSS segment while data is unacknowledged, with the
    /// usual urgent-data and loopback exceptions, plus an anti-burst cap
    /// for NODELAY senders).
    pub(crate) fn tx_advance_nagle(&self, g: &mut StackGuard<'_>, sock: &TcpSock) {
        // SAFETY: stack lock held.
        let tx = unsafe { sock.tx_raw() };
        safe_assert!(!tx.sendq.is_empty());

        let inflight = tx.snd_nxt.wrapping_sub(tx.snd_una);
        let advance = if tx.sendq.num != 1 || inflight == 0 || sock.local_peer().is_some() {
            true
        } else {
            let head = unsafe { self.pool.pkt_raw(tx.sendq.head) };
            if head.seq_space() >= sock.eff_mss() || seq_lt(tx.snd_una, tx.snd_up) {
                true
            } else if sock.sock_flags().contains(SockFlags::NODELAY) {
                // With Nagle off a sender can spray tiny packets; withhold
                // only when plenty is inflight and it's mostly air.
                let n = tx.inflight.num as u32;
                n < self.opts.nonagle_inflight_max || sock.eff_mss() * n < inflight * 2
            } else {
                false
            }
        };

        if advance {
            self.tx_advance(g, sock);
        } else {
            tx.stats.tx_stop_nagle += 1;
            trace!(sock = ?sock.id, inflight, "held by nagle");
        }

        if self.may_poll() && self.has_event() {
            self.poll(g);
        }
    }

    // --- waiting / slow paths --------------------------------------------

    /// The send queue (prequeue included) is full. Poll for space if we
    /// can, then apply the non-blocking / spin / block discipline.
    /// `None` means space appeared: re-enter the fill loop.
    fn wait_for_space<'a>(
        &'a self,
        sock: &TcpSock,
        flags: SendFlags,
        sinf: &mut SendInfo<'a>,
    ) -> Option<Result<usize, SendError>> {
        safe_assert!(sinf.fill_list.is_null());

        if self.may_poll() && self.need_poll() && sinf.trylock(self) {
            self.poll(sinf.guard());
            if sock.tx_errno() != 0 {
                return Some(self.finish_tx_errno(sock, sinf));
            }
            if sock.sendq_slack() > 0 {
                return None;
            }
        }

        if flags.contains(SendFlags::DONTWAIT) {
            // tx_errno can't have raced us here: the queue was full when
            // we checked, so it wasn't set then, and later is fine too.
            return Some(self.finish_sent_or_rc(sock, sinf, SendError::WouldBlock));
        }

        if sinf.spin {
            match self.send_spin(sock, sinf) {
                wait::Spun::Retry => return None,
                wait::Spun::Done(done) => return Some(done),
                wait::Spun::Fall => sinf.spin = false,
            }
        }

        self.send_block(sock, sinf)
    }

    /// Blocking precondition: sending before the connection is
    /// synchronised waits for the handshake (or fails fast).
    fn send_not_synchronised<'a>(
        &'a self,
        sock: &TcpSock,
        flags: SendFlags,
        sinf: &mut SendInfo<'a>,
    ) -> Option<Result<usize, SendError>> {
        if sock.state() == TcpState::Closed {
            return Some(self.finish_rc_or_tx_errno(sock, sinf, Some(SendError::Pipe)));
        }
        // SYN-SENT, and it can change under our feet.
        if flags.contains(SendFlags::DONTWAIT) {
            return Some(self.finish_rc_or_tx_errno(sock, sinf, Some(SendError::WouldBlock)));
        }
        sinf.ensure_lock(self);
        while sock.state() == TcpState::SynSent && sock.tx_errno() == 0 {
            let seq = sock.sleep_seq.load(std::sync::atomic::Ordering::Acquire);
            if sock.state() != TcpState::SynSent || sock.tx_errno() != 0 {
                break;
            }
            sinf.drop_lock();
            let t0 = Instant::now();
            let outcome = sock.sleep_tx(seq, sinf.timeout);
            if let Some(t) = &mut sinf.timeout {
                *t = t.saturating_sub(t0.elapsed());
            }
            match outcome {
                WakeOutcome::Woken => {}
                WakeOutcome::TimedOut => {
                    return Some(self.finish_rc_or_tx_errno(
                        sock,
                        sinf,
                        Some(SendError::WouldBlock),
                    ));
                }
                WakeOutcome::Signalled => {
                    return Some(self.finish_rc_or_tx_errno(
                        sock,
                        sinf,
                        Some(SendError::Interrupted),
                    ));
                }
            }
        }
        if sock.tx_errno() != 0 {
            return Some(self.finish_rc_or_tx_errno(sock, sinf, None));
        }
        if sock.state().synchronised() {
            None
        } else {
            Some(self.finish_rc_or_tx_errno(sock, sinf, Some(SendError::NotConnected)))
        }
    }

    /// Two-phase urgent send: speculatively point `snd_up` past the write,
    /// re-enter the normal path with advance disabled so it can only
    /// enqueue, then correct `snd_up` by what actually went in and push.
    ///
    /// Concurrent OOB senders can leave `snd_up` stale; urgent sends are
    /// not serialised against each other.
    fn send_oob<'a>(
        &'a self,
        sock: &TcpSock,
        iov: &[Iovec],
        flags: SendFlags,
        mut sinf: SendInfo<'a>,
    ) -> Result<usize, SendError> {
        let total = sinf.total_unsent;
        let enq_before;
        {
            let mut g = match sinf.lock.take() {
                Some(g) => g,
                None => self.lock(),
            };
            // Poll first for an accurate view of send-queue space.
            self.poll(&mut g);
            // SAFETY: stack lock held.
            let tx = unsafe { sock.tx_raw() };
            tx.snd_up = tx.enq_nxt.wrapping_add(total as u32);
            enq_before = tx.enq_nxt;
            sock.modify_flags(SockFlags::NO_TX_ADVANCE, SockFlags::empty());
        }

        let rc = self.tcp_send(sock, iov, flags - SendFlags::OOB);

        let mut g = self.lock();
        if let Ok(n) = rc {
            if n > 0 {
                // SAFETY: stack lock held.
                let tx = unsafe { sock.tx_raw() };
                tx.snd_up = enq_before.wrapping_add(n as u32);
            }
        }
        sock.modify_flags(SockFlags::empty(), SockFlags::NO_TX_ADVANCE);
        // SAFETY: stack lock held.
        if !unsafe { sock.tx_raw() }.sendq.is_empty() {
            self.tx_advance(&mut g, sock);
        }
        drop(g);
        rc
    }

    // --- unwind -----------------------------------------------------------

    /// Free a packet chain (arena-linked) back to the pools. Without the
    /// lock, tries for it; failing that everything goes to the
    /// non-blocking pool, which is always reachable.
    fn free_pkt_list(&self, list: PktId, locked: bool) -> i32 {
        safe_assert!(list.is_some());
        let mut n = 0i32;
        let release = |locked: bool| {
            let mut id = list;
            let mut count = 0;
            while id.is_some() {
                // SAFETY: chain owned by the unwinding call.
                let next = unsafe { self.pool.pkt_raw(id).next };
                unsafe { self.pool.release_pkt(id, locked) };
                count += 1;
                id = next;
            }
            count
        };
        if locked {
            n += release(true);
        } else if let Some(_g) = self.trylock() {
            n += release(true);
        } else {
            n += release(false);
        }
        n
    }

    fn free_fill_list(&self, sinf: &mut SendInfo<'_>) {
        if sinf.fill_list.is_null() {
            return;
        }
        // Convert the private pointer chain into arena links first.
        let head = sinf.fill_list;
        // SAFETY: fill-list members owned by this call.
        unsafe {
            let mut p = head;
            loop {
                let next = (*p).fill_next;
                if next.is_null() {
                    (*p).next = PktId::NONE;
                    break;
                }
                (*p).next = (*next).id;
                p = next;
            }
        }
        let head_id = unsafe { (*head).id };
        sinf.fill_list = ptr::null_mut();
        sinf.fill_list_bytes = 0;
        self.free_pkt_list(head_id, sinf.lock.is_some());
    }

    /// Free the prequeue. Best-effort under contention: another drainer
    /// may have claimed it first, which is fine.
    pub(crate) fn free_prequeue(&self, sock: &TcpSock, locked: bool) {
        let id = sock.prequeue_take();
        if id.is_none() {
            return;
        }
        let n = self.free_pkt_list(id, locked);
        sock.send_prequeue_in.fetch_sub(n, std::sync::atomic::Ordering::Relaxed);
    }

    /// Exit path for errors noticed before anything was filled, and the
    /// shared tail of every other unwind: bytes sent shadow the error;
    /// with nothing sent, `so_error` wins, then `tx_errno`, then our rc.
    pub(crate) fn finish_rc_or_tx_errno(
        &self,
        sock: &TcpSock,
        sinf: &mut SendInfo<'_>,
        rc: Option<SendError>,
    ) -> Result<usize, SendError> {
        sinf.filler.free_unused(self, sinf.lock.is_some());
        let out = if sinf.total_sent > 0 {
            Ok(sinf.total_sent)
        } else {
            let so_error = sock.take_so_error();
            if so_error != 0 {
                Err(SendError::from_errno(so_error))
            } else if sock.tx_errno() != 0 {
                Err(SendError::from_errno(sock.tx_errno()))
            } else {
                Err(rc.unwrap_or(SendError::Pipe))
            }
        };
        sinf.drop_lock();
        out
    }

    /// Exit path for cancellations (timeout, signal, would-block).
    pub(crate) fn finish_sent_or_rc(
        &self,
        _sock: &TcpSock,
        sinf: &mut SendInfo<'_>,
        rc: SendError,
    ) -> Result<usize, SendError> {
        self.free_fill_list(sinf);
        sinf.filler.free_unused(self, sinf.lock.is_some());
        sinf.drop_lock();
        if sinf.total_sent > 0 { Ok(sinf.total_sent) } else { Err(rc) }
    }

    /// Exit path once `tx_errno` has been observed: everything this call
    /// still owns is freed, including the prequeue.
    pub(crate) fn finish_tx_errno(
        &self,
        sock: &TcpSock,
        sinf: &mut SendInfo<'_>,
    ) -> Result<usize, SendError> {
        self.free_fill_list(sinf);
        sinf.filler.free_unused(self, sinf.lock.is_some());
        self.free_prequeue(sock, sinf.lock.is_some());
        self.finish_rc_or_tx_errno(sock, sinf, None)
    }
}

/// Shift the payload to make room for (or reclaim) option bytes when the
/// header layout changed between fill and enqueue.
fn insert_option_space(pkt: &mut Packet, orig_hdr: u32, new_hdr: u32) {
    let payload = (pkt.buf_off - orig_hdr) as usize;
    pkt.buf.copy_within(orig_hdr as usize..orig_hdr as usize + payload, new_hdr as usize);
    pkt.buf_off = new_hdr + payload as u32;
    let delta = new_hdr as i64 - orig_hdr as i64;
    pkt.buf_end = (pkt.buf_end as i64 + delta).min(PKT_BUF_SIZE as i64) as u32;
}

//! Zero-copy transmit: the caller owns the packet and fills the payload
//! region in place; this path validates the buffers, initialises TX
//! metadata and reuses the normal enqueue/prequeue/Nagle/wait machinery.
//!
//! Payloads larger than the effective MSS are rejected (EINVAL) rather
//! than re-segmented.

use strand_utils::safe_assert;
use tracing::trace;

use crate::{
    netif::Netif,
    pkt::{PKT_BUF_SIZE, PktFlags, PktId, TCP_FLAG_ACK, TCP_FLAG_PSH},
    send::{SendFlags, SendInfo, wait::Spun},
    sock::{SockFlags, SockId, TcpSock},
};

/// A caller-owned transmit buffer: packet plus its writable payload
/// window.
#[derive(Clone, Copy, Debug)]
pub struct ZcBuf {
    pub pkt: PktId,
    /// First writable byte (past the header slack).
    pub off: u32,
    /// Usable payload capacity (the effective MSS at alloc time).
    pub cap: u32,
}

/// One filled buffer handed back for transmission.
#[derive(Clone, Copy, Debug)]
pub struct ZcIov {
    pub pkt: PktId,
    pub off: u32,
    pub len: u32,
}

/// Zero-copy message: buffers plus the per-message result slot.
#[derive(Debug)]
pub struct ZcMsg<'a> {
    pub iov: &'a [ZcIov],
    /// Byte total on success; negative errno on failure of the first
    /// buffer.
    pub rc: i64,
}

impl Netif {
    /// Hand out a packet for the caller to fill in place.
    pub fn zc_alloc(&self, id: SockId) -> Option<ZcBuf> {
        let sock = self.endpoint(id).ok()?;
        let pkt = self.pool.alloc_nonb()?;
        Some(ZcBuf { pkt, off: sock.outgoing_hdrs_len(), cap: sock.eff_mss() })
    }

    /// The payload window of a zero-copy buffer.
    ///
    /// # Safety
    /// The buffer must have come from [`Netif::zc_alloc`] and not yet
    /// been sent or freed; the caller is the sole writer.
    pub unsafe fn zc_payload<'a>(&self, buf: &ZcBuf) -> &'a mut [u8] {
        let pkt = unsafe { &mut *(self.pool.pkt_raw(buf.pkt) as *mut crate::pkt::Packet) };
        &mut pkt.buf[buf.off as usize..(buf.off + buf.cap) as usize]
    }

    /// Return an unsent zero-copy buffer to the pool.
    pub fn zc_free(&self, buf: ZcBuf) {
        // SAFETY: ownership handed back by the caller.
        unsafe { self.pool.release_pkt(buf.pkt, false) };
    }

    /// Send pre-filled buffers. Always returns 1; the outcome is in
    /// `msg.rc` (byte total, or negative errno if the first buffer
    /// failed).
    pub fn zc_send(&self, id: SockId, msg: &mut ZcMsg<'_>, flags: SendFlags) -> i32 {
        let Ok(sock) = self.endpoint(id) else {
            msg.rc = -(libc::ENOTCONN as i64);
            return 1;
        };
        if !sock.state().synchronised() {
            let e = sock.tx_errno();
            msg.rc = if e != 0 { -(e as i64) } else { -(libc::EPIPE as i64) };
            return 1;
        }

        let mut sinf = SendInfo::new(sock);
        let eff_mss = sock.eff_mss();
        let hdrs = sock.outgoing_hdrs_len();
        safe_assert!(eff_mss as usize + hdrs as usize <= PKT_BUF_SIZE);
        let mut j = 0usize;

        loop {
            if sock.sendq_slack() <= 0 {
                match self.zc_wait(sock, flags, &mut sinf, j, msg) {
                    ZcWaited::Retry => continue,
                    ZcWaited::Finished => return 1,
                }
            }

            while j < msg.iov.len() {
                let v = msg.iov[j];
                let in_arena = v.pkt.is_some() && v.pkt.index() < self.pool.n_pkts() as usize;
                if !in_arena
                    || v.len == 0
                    || v.len > eff_mss
                    || v.off < hdrs
                    || (v.off + v.len) as usize > PKT_BUF_SIZE
                {
                    return self.zc_bad_buffer(sock, &mut sinf, j, msg);
                }
                // SAFETY: validated arena id, caller owns the packet.
                let pkt = unsafe { self.pool.pkt_raw(v.pkt) };
                pkt.init_tx(v.off, eff_mss.min(PKT_BUF_SIZE as u32 - v.off));
                pkt.buf_off = v.off + v.len;
                pkt.end_seq = v.len;
                pkt.flags |= PktFlags::NONB_POOL;

                pkt.fill_next = sinf.fill_list;
                sinf.fill_list = pkt;
                sinf.fill_list_bytes += v.len as usize;
                msg.rc = if j == 0 { v.len as i64 } else { msg.rc + v.len as i64 };
                sinf.n_filled += 1;
                j += 1;
            }

            if flags.contains(SendFlags::MORE) || sock.sock_flags().contains(SockFlags::CORK) {
                // SAFETY: fill-list head owned by this call.
                unsafe { (*sinf.fill_list).flags |= PktFlags::TX_MORE };
            }

            // Same handoff as the copying path.
            if sinf.trylock(self) {
                if sock.tx_errno() != 0 {
                    return self.zc_tx_errno(sock, &mut sinf, msg);
                }
                let last_pkt = sinf.fill_list;
                let bytes = sinf.fill_list_bytes;
                let list = sinf.take_fill_list();
                self.sendmsg_enqueue(sinf.guard(), sock, list, bytes);
                // SAFETY: enqueued under the lock we still hold.
                let lp = unsafe { &mut *last_pkt };
                if lp.flags.contains(PktFlags::TX_MORE) {
                    lp.tcp_flags = TCP_FLAG_ACK;
                } else {
                    lp.tcp_flags = TCP_FLAG_ACK | TCP_FLAG_PSH;
                }
                self.tx_advance_nagle(sinf.guard(), sock);
                sinf.drop_lock();
                return 1;
            }

            if sock.tx_errno() != 0 {
                return self.zc_tx_errno(sock, &mut sinf, msg);
            }
            // SAFETY: fill-list head owned by this call.
            unsafe {
                let head = &mut *sinf.fill_list;
                if !head.flags.contains(PktFlags::TX_MORE) {
                    head.flags |= PktFlags::TX_PSH;
                }
            }
            let list = sinf.take_fill_list();
            self.tx_prequeue(sock, list);
            sinf.fill_list_bytes = 0;
            if let Some(g) = self.lock_or_defer(sock.id) {
                sinf.lock = Some(g);
                if sock.tx_errno() != 0 {
                    return self.zc_tx_errno(sock, &mut sinf, msg);
                }
                self.enqueue_prequeue(sinf.guard(), sock);
                // SAFETY: stack lock held.
                if !unsafe { sock.tx_raw() }.sendq.is_empty() {
                    self.tx_advance_nagle(sinf.guard(), sock);
                }
            }
            sinf.drop_lock();
            return 1;
        }
    }

    fn zc_wait<'a>(
        &'a self,
        sock: &TcpSock,
        flags: SendFlags,
        sinf: &mut SendInfo<'a>,
        j: usize,
        msg: &mut ZcMsg<'_>,
    ) -> ZcWaited {
        if self.may_poll() && self.need_poll() && sinf.trylock(self) {
            self.poll(sinf.guard());
            if sock.tx_errno() != 0 {
                self.zc_tx_errno(sock, sinf, msg);
                return ZcWaited::Finished;
            }
            if sock.sendq_slack() > 0 {
                return ZcWaited::Retry;
            }
        }
        if flags.contains(SendFlags::DONTWAIT) {
            if j == 0 {
                msg.rc = -(libc::EAGAIN as i64);
            }
            sinf.drop_lock();
            return ZcWaited::Finished;
        }
        if sinf.spin {
            match self.send_spin(sock, sinf) {
                Spun::Retry => return ZcWaited::Retry,
                Spun::Done(done) => {
                    if j == 0 {
                        msg.rc = -(done.err().map_or(0, |e| e.errno()) as i64);
                    }
                    return ZcWaited::Finished;
                }
                Spun::Fall => sinf.spin = false,
            }
        }
        match self.send_block(sock, sinf) {
            None => ZcWaited::Retry,
            Some(done) => {
                if j == 0 {
                    msg.rc = -(done.err().map_or(0, |e| e.errno()) as i64);
                }
                ZcWaited::Finished
            }
        }
    }

    /// A buffer failed validation. Per-message contract: flush whatever
    /// already passed, report EINVAL only if the first buffer failed.
    fn zc_bad_buffer<'a>(
        &'a self,
        sock: &TcpSock,
        sinf: &mut SendInfo<'a>,
        j: usize,
        msg: &mut ZcMsg<'_>,
    ) -> i32 {
        if !sinf.fill_list.is_null() {
            if sinf.trylock(self) {
                if sock.tx_errno() != 0 {
                    return self.zc_tx_errno(sock, sinf, msg);
                }
                let bytes = sinf.fill_list_bytes;
                let list = sinf.take_fill_list();
                self.sendmsg_enqueue(sinf.guard(), sock, list, bytes);
            } else {
                if sock.tx_errno() != 0 {
                    return self.zc_tx_errno(sock, sinf, msg);
                }
                let list = sinf.take_fill_list();
                self.tx_prequeue(sock, list);
                if let Some(g) = self.lock_or_defer(sock.id) {
                    sinf.lock = Some(g);
                    if sock.tx_errno() != 0 {
                        return self.zc_tx_errno(sock, sinf, msg);
                    }
                    self.enqueue_prequeue(sinf.guard(), sock);
                }
            }
            if sinf.lock.is_some() {
                // SAFETY: stack lock held.
                if !unsafe { sock.tx_raw() }.sendq.is_empty() {
                    self.tx_advance(sinf.guard(), sock);
                }
            }
        }
        if j == 0 {
            msg.rc = -(libc::EINVAL as i64);
        }
        trace!(sock = ?sock.id, j, "zc buffer rejected");
        sinf.drop_lock();
        1
    }

    /// Terminal transmit error mid-zc-send: unwind everything this call
    /// still owns.
    fn zc_tx_errno(&self, sock: &TcpSock, sinf: &mut SendInfo<'_>, msg: &mut ZcMsg<'_>) -> i32 {
        if !sinf.fill_list.is_null() {
            self.free_fill_list(sinf);
        }
        self.free_prequeue(sock, sinf.lock.is_some());
        msg.rc = -(sock.tx_errno() as i64);
        sinf.drop_lock();
        1
    }
}

enum ZcWaited {
    Retry,
    Finished,
}

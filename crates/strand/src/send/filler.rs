use crate::{
    netif::Netif,
    pkt::{Packet, PktId},
    pool::PktPool,
};

/// A user buffer reference, as handed across the socket API boundary.
/// The base pointer is trusted the same way the kernel trusts an iovec:
/// a NULL base with a non-zero length is rejected up front with EFAULT,
/// anything else is assumed readable for `len` bytes.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Iovec {
    pub base: *const u8,
    pub len: usize,
}

impl Iovec {
    pub fn from_slice(s: &[u8]) -> Self {
        Self { base: s.as_ptr(), len: s.len() }
    }
}

unsafe impl Send for Iovec {}

/// Read cursor over a caller's iovec list. Advances across entries as
/// packets consume bytes.
pub(crate) struct IovCursor<'a> {
    iov: &'a [Iovec],
    idx: usize,
    off: usize,
}

impl<'a> IovCursor<'a> {
    pub fn new(iov: &'a [Iovec]) -> Self {
        Self { iov, idx: 0, off: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.iov[self.idx..].iter().map(|v| v.len).sum::<usize>() == self.off
    }

    /// Copy up to `n` bytes at the packet's write cursor, advancing both
    /// cursors. Returns the bytes copied (short only when the iovec runs
    /// out).
    pub fn fill(&mut self, pkt: &mut Packet, n: usize) -> usize {
        let mut left = n;
        let mut copied = 0;
        while left > 0 && self.idx < self.iov.len() {
            let v = self.iov[self.idx];
            let avail = v.len - self.off;
            if avail == 0 {
                self.idx += 1;
                self.off = 0;
                continue;
            }
            let take = avail.min(left);
            // SAFETY: base was null-checked at the API boundary; the
            // caller warrants readability, as with any user iovec.
            let src = unsafe { std::slice::from_raw_parts(v.base.add(self.off), take) };
            pkt.append(src);
            self.off += take;
            left -= take;
            copied += take;
        }
        copied
    }
}

/// Pre-allocated packets awaiting fill, chained through `fill_next`.
/// Whatever is still here when the call unwinds goes back to its origin
/// sub-pool.
pub(crate) struct PktFiller {
    alloc: *mut Packet,
    pub n_alloced: u32,
}

impl PktFiller {
    pub fn new() -> Self {
        Self { alloc: std::ptr::null_mut(), n_alloced: 0 }
    }

    pub fn add(&mut self, pool: &PktPool, id: PktId) {
        // SAFETY: freshly allocated, we are the owner.
        let pkt = unsafe { pool.pkt_raw(id) };
        pkt.fill_next = self.alloc;
        self.alloc = pkt;
        self.n_alloced += 1;
    }

    pub fn next_pkt(&mut self) -> Option<*mut Packet> {
        if self.alloc.is_null() {
            return None;
        }
        let pkt = self.alloc;
        // SAFETY: chain member owned by this filler.
        self.alloc = unsafe { (*pkt).fill_next };
        unsafe { (*pkt).fill_next = std::ptr::null_mut() };
        self.n_alloced -= 1;
        Some(pkt)
    }

    /// Release any packets that never got filled.
    pub fn free_unused(&mut self, ni: &Netif, locked: bool) {
        while let Some(pkt) = self.next_pkt() {
            // SAFETY: unfilled packets are exclusively ours.
            unsafe { ni.pool.release_pkt((*pkt).id, locked) };
        }
    }
}

/// Copy `next`'s payload into `prev`'s tail slack. Pure byte/bookkeeping
/// move; queue relinking and freeing stay with the caller. Both packets
/// must already be sequenced, `prev` immediately preceding `next`.
pub(crate) fn merge_payload(prev: &mut Packet, next: &Packet) -> bool {
    let bytes = next.seq_space();
    if prev.left() < bytes {
        return false;
    }
    let start = (next.buf_off - bytes) as usize;
    prev.append(&next.buf[start..start + bytes as usize]);
    prev.end_seq = next.end_seq;
    prev.tcp_flags |= next.tcp_flags;
    // Origin-pool routing (NONB_POOL) stays with each packet.
    prev.flags |= next.flags & (crate::pkt::PktFlags::TX_MORE | crate::pkt::PktFlags::TX_PSH);
    true
}

#[cfg(test)]
mod test {
    use super::*;

    fn zero_pkt() -> Box<Packet> {
        // SAFETY: Packet is plain data; an all-zero image is valid.
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn cursor_spans_iovec_entries() {
        let a = [1u8; 10];
        let b = [2u8; 10];
        let iov = [Iovec::from_slice(&a), Iovec::from_slice(&b)];
        let mut cur = IovCursor::new(&iov);
        let mut pkt = zero_pkt();
        pkt.init_tx(0, 64);

        assert_eq!(cur.fill(&mut pkt, 15), 15);
        assert!(!cur.is_empty());
        assert_eq!(cur.fill(&mut pkt, 15), 5);
        assert!(cur.is_empty());
        assert_eq!(&pkt.buf[..10], &[1u8; 10]);
        assert_eq!(&pkt.buf[10..20], &[2u8; 10]);
    }

    #[test]
    fn merge_respects_slack() {
        let mut prev = zero_pkt();
        let mut next = zero_pkt();
        prev.init_tx(40, 10);
        prev.append(b"abcdefgh"); // 2 bytes of slack left
        prev.start_seq = 100;
        prev.end_seq = 108;

        next.init_tx(40, 10);
        next.append(b"xyz");
        next.start_seq = 108;
        next.end_seq = 111;

        assert!(!merge_payload(&mut prev, &next)); // 3 > 2

        next.buf_off -= 1; // pretend a 2-byte payload instead
        next.end_seq = 110;
        assert!(merge_payload(&mut prev, &next));
        assert_eq!(prev.end_seq, 110);
        assert_eq!(&prev.buf[40..50], b"abcdefghxy");
        assert_eq!(prev.left(), 0);
    }
}

use std::fmt;

use bitflags::bitflags;
use strand_utils::safe_assert;

/// Buffer bytes per packet, headers included. One DMA buffer per segment.
pub const PKT_BUF_SIZE: usize = 2048;

/// TCP header flag byte values, as they appear on the wire.
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;
pub const TCP_FLAG_URG: u8 = 0x20;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PktFlags: u32 {
        /// More data follows; hold this packet back from the wire.
        const TX_MORE = 1 << 0;
        /// Carry PSH once headers are written (prequeue path only; the
        /// locked path writes the TCP flag byte directly).
        const TX_PSH = 1 << 1;
        /// Free back to the non-blocking sub-pool regardless of origin.
        const NONB_POOL = 1 << 2;
        /// Receive-path buffer; never legal on the transmit path.
        const RX = 1 << 3;
    }
}

/// Arena-indexed packet handle. `NONE` terminates queue chains.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct PktId(pub u32);

impl PktId {
    pub const NONE: PktId = PktId(u32::MAX);

    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    #[inline]
    pub fn is_some(self) -> bool {
        self != Self::NONE
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for PktId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() { write!(f, "pkt:-") } else { write!(f, "pkt:{}", self.0) }
    }
}

/// A fixed-size transmit buffer living in the packet arena.
///
/// `start_seq`/`end_seq` are dual-purpose: while the packet sits on a
/// sender's private fill list, `start_seq` holds the header length the
/// buffer was initialised with and `end_seq` holds the payload byte
/// count. Once the packet is sequenced under the stack lock they become
/// absolute TCP sequence numbers.
///
/// `next` is the arena link used by every shared queue; `fill_next` is a
/// raw pointer link valid only while the packet is on a private fill
/// list, before it becomes visible to the stack.
#[repr(C, align(64))]
pub struct Packet {
    pub id: PktId,
    pub next: PktId,
    pub fill_next: *mut Packet,
    pub refcount: u32,
    pub flags: PktFlags,
    pub start_seq: u32,
    pub end_seq: u32,
    /// Write cursor: next free byte in `buf`.
    pub buf_off: u32,
    /// End of the writable region (header length + segment cap).
    pub buf_end: u32,
    /// TCP flag byte to put on the wire when this segment is emitted.
    pub tcp_flags: u8,
    pub buf: [u8; PKT_BUF_SIZE],
}

impl Packet {
    /// Initialise for transmit: reserve `hdrlen` bytes of header slack and
    /// cap the payload at `maxlen`. Records `hdrlen` in `start_seq` so the
    /// enqueue step can recover it if the option layout changed since.
    pub fn init_tx(&mut self, hdrlen: u32, maxlen: u32) {
        safe_assert!((hdrlen + maxlen) as usize <= PKT_BUF_SIZE);
        self.buf_off = hdrlen;
        self.buf_end = hdrlen + maxlen;
        self.start_seq = hdrlen;
        self.end_seq = 0;
        self.tcp_flags = TCP_FLAG_ACK;
    }

    /// Bytes of tail slack remaining.
    #[inline]
    pub fn left(&self) -> u32 {
        self.buf_end - self.buf_off
    }

    /// Sequence space consumed; only meaningful once sequenced.
    #[inline]
    pub fn seq_space(&self) -> u32 {
        self.end_seq.wrapping_sub(self.start_seq)
    }

    /// Append `src` at the write cursor. Caller checks `left()` first.
    #[inline]
    pub fn append(&mut self, src: &[u8]) {
        let off = self.buf_off as usize;
        self.buf[off..off + src.len()].copy_from_slice(src);
        self.buf_off += src.len() as u32;
    }

    /// Reset to a freeable state. Sub-pool routing is decided from `flags`
    /// before this is called.
    pub fn clean(&mut self) {
        self.flags = PktFlags::empty();
        self.refcount = 0;
        self.next = PktId::NONE;
        self.fill_next = std::ptr::null_mut();
        self.start_seq = 0;
        self.end_seq = 0;
        self.buf_off = 0;
        self.buf_end = 0;
        self.tcp_flags = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn init_tx_reserves_header_slack() {
        let mut pkt = unsafe { std::mem::zeroed::<Packet>() };
        pkt.init_tx(40, 1460);
        assert_eq!(pkt.left(), 1460);
        assert_eq!(pkt.start_seq, 40);
        assert_eq!(pkt.end_seq, 0);

        pkt.append(b"hello");
        assert_eq!(pkt.left(), 1455);
        assert_eq!(&pkt.buf[40..45], b"hello");
    }

    #[test]
    fn seq_space_wraps() {
        let mut pkt = unsafe { std::mem::zeroed::<Packet>() };
        pkt.start_seq = u32::MAX - 10;
        pkt.end_seq = 20;
        assert_eq!(pkt.seq_space(), 31);
    }
}

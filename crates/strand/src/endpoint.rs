use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    config::StackOpts,
    sock::{SockId, TcpSock},
};

/// The per-netif endpoint table.
///
/// Filter installation and address binding live with the kernel helper;
/// the transmit path only needs slot allocation and an id-to-state lookup
/// that refuses ids that were never handed out.
pub struct EndpointTable {
    socks: Box<[TcpSock]>,
    n_alloced: AtomicU32,
}

impl EndpointTable {
    pub fn new(opts: &StackOpts) -> Self {
        let socks = (0..opts.max_socks)
            .map(|i| {
                TcpSock::new(SockId(i), opts.eff_mss, opts.sendq_max_pkts, opts.snd_wnd)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { socks, n_alloced: AtomicU32::new(0) }
    }

    pub fn alloc(&self) -> SockId {
        let i = self.n_alloced.fetch_add(1, Ordering::AcqRel);
        assert!(
            (i as usize) < self.socks.len(),
            "endpoint table exhausted ({} slots)",
            self.socks.len()
        );
        SockId(i)
    }

    /// Valid only for ids previously returned by [`alloc`].
    pub fn lookup(&self, id: SockId) -> Option<&TcpSock> {
        if id.0 < self.n_alloced.load(Ordering::Acquire) {
            self.socks.get(id.0 as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_refuses_unallocated_ids() {
        let table = EndpointTable::new(&StackOpts::default());
        assert!(table.lookup(SockId(0)).is_none());
        let id = table.alloc();
        assert!(table.lookup(id).is_some());
        assert!(table.lookup(SockId(1)).is_none());
    }
}

use std::{
    alloc::Layout,
    cell::UnsafeCell,
    mem::size_of,
    path::Path,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering},
    },
};

use strand_utils::{safe_assert, safe_assert_eq, signal};
use tracing::warn;

use crate::{
    error::{PoolError, SendError},
    pkt::{Packet, PktFlags, PktId},
};

/// Packed freelist head: generation tag in the top 32 bits, packet id in
/// the bottom 32. The tag defeats ABA on concurrent pop/push.
#[inline]
fn head_pack(tag: u32, id: PktId) -> u64 {
    ((tag as u64) << 32) | id.0 as u64
}

#[inline]
fn head_unpack(word: u64) -> (u32, PktId) {
    ((word >> 32) as u32, PktId(word as u32))
}

/// The packet buffer arena and its two sub-pools.
///
/// The non-blocking sub-pool is a lock-free LIFO usable from any thread;
/// the TX sub-pool may only be touched while holding the stack lock.
/// A packet is on at most one of: a sub-pool, a fill list, the prequeue,
/// a send queue, or in flight.
pub struct PktPool {
    mem: *mut Packet,
    n_pkts: u32,
    owns_mem: bool,

    nonb_head: AtomicU64,
    n_nonb: AtomicI32,
    /// Packets held by senders outside any stack queue.
    n_async: AtomicI32,

    /// Stack-lock section.
    tx_free: UnsafeCell<PktId>,
    n_tx_free: UnsafeCell<i32>,

    n_waiters: AtomicU32,
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
}

unsafe impl Send for PktPool {}
unsafe impl Sync for PktPool {}

impl PktPool {
    /// Allocate an in-process arena of `n_pkts` buffers, seeding the first
    /// `nonb_pkts` into the non-blocking sub-pool and the rest into the TX
    /// sub-pool.
    pub fn new(n_pkts: u32, nonb_pkts: u32) -> Result<Self, PoolError> {
        if n_pkts == 0 {
            return Err(PoolError::Empty);
        }
        let size = n_pkts as usize * size_of::<Packet>();
        let mem = unsafe {
            std::alloc::alloc_zeroed(
                Layout::array::<u8>(size).unwrap().align_to(64).unwrap().pad_to_align(),
            )
        } as *mut Packet;
        Ok(Self::init(mem, n_pkts, nonb_pkts.min(n_pkts), true))
    }

    /// Back the arena with a shared-memory mapping so a kernel helper or a
    /// second process can reach the same buffers. Recreates the link file
    /// if a stale one exists.
    pub fn create_shared<P: AsRef<Path>>(
        path: P,
        n_pkts: u32,
        nonb_pkts: u32,
    ) -> Result<Self, PoolError> {
        use shared_memory::{ShmemConf, ShmemError};
        if n_pkts == 0 {
            return Err(PoolError::Empty);
        }
        let size = n_pkts as usize * size_of::<Packet>();
        let shmem = match ShmemConf::new().size(size).flink(&path).create() {
            Ok(shmem) => shmem,
            Err(ShmemError::LinkExists) => {
                warn!(path = ?path.as_ref(), "stale pkt arena link, recreating");
                let _ = std::fs::remove_file(&path);
                ShmemConf::new().size(size).flink(&path).create()?
            }
            Err(e) => return Err(e.into()),
        };
        let ptr = shmem.as_ptr() as *mut Packet;
        std::mem::forget(shmem);
        Ok(Self::init(ptr, n_pkts, nonb_pkts.min(n_pkts), false))
    }

    fn init(mem: *mut Packet, n_pkts: u32, nonb_pkts: u32, owns_mem: bool) -> Self {
        let pool = Self {
            mem,
            n_pkts,
            owns_mem,
            nonb_head: AtomicU64::new(head_pack(0, PktId::NONE)),
            n_nonb: AtomicI32::new(0),
            n_async: AtomicI32::new(0),
            tx_free: UnsafeCell::new(PktId::NONE),
            n_tx_free: UnsafeCell::new(0),
            n_waiters: AtomicU32::new(0),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
        };
        // Chain the freelists through the arena `next` links.
        for i in (0..n_pkts).rev() {
            let pkt = unsafe { pool.pkt_raw(PktId(i)) };
            pkt.id = PktId(i);
            pkt.fill_next = std::ptr::null_mut();
            if i < nonb_pkts {
                let (tag, head) = head_unpack(pool.nonb_head.load(Ordering::Relaxed));
                pkt.next = head;
                pool.nonb_head.store(head_pack(tag, PktId(i)), Ordering::Relaxed);
                pool.n_nonb.fetch_add(1, Ordering::Relaxed);
            } else {
                unsafe {
                    pkt.next = *pool.tx_free.get();
                    *pool.tx_free.get() = PktId(i);
                    *pool.n_tx_free.get() += 1;
                }
            }
        }
        pool
    }

    #[inline]
    pub fn n_pkts(&self) -> u32 {
        self.n_pkts
    }

    #[inline]
    pub fn n_async(&self) -> i32 {
        self.n_async.load(Ordering::Relaxed)
    }

    /// # Safety
    /// The returned reference aliases the arena. The caller must be the
    /// packet's current owner per the lifecycle invariant.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub(crate) unsafe fn pkt_raw(&self, id: PktId) -> &mut Packet {
        safe_assert!(id.index() < self.n_pkts as usize);
        unsafe { &mut *self.mem.add(id.index()) }
    }

    /// Pop from the non-blocking sub-pool. Lock-free; callable anywhere.
    pub fn alloc_nonb(&self) -> Option<PktId> {
        let mut head = self.nonb_head.load(Ordering::Acquire);
        loop {
            let (tag, id) = head_unpack(head);
            if id.is_none() {
                return None;
            }
            // Reading `next` before the CAS is fine: arena slots are never
            // unmapped, and the tag invalidates a stale read.
            let next = unsafe { self.pkt_raw(id).next };
            match self.nonb_head.compare_exchange_weak(
                head,
                head_pack(tag.wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.n_nonb.fetch_sub(1, Ordering::Relaxed);
                    self.n_async.fetch_add(1, Ordering::Relaxed);
                    let pkt = unsafe { self.pkt_raw(id) };
                    pkt.next = PktId::NONE;
                    pkt.refcount = 1;
                    pkt.flags = PktFlags::NONB_POOL;
                    return Some(id);
                }
                Err(cur) => head = cur,
            }
        }
    }

    /// Pop from the TX sub-pool.
    ///
    /// # Safety
    /// Caller must hold the stack lock.
    pub(crate) unsafe fn alloc_tx_locked(&self) -> Option<PktId> {
        unsafe {
            let id = *self.tx_free.get();
            if id.is_none() {
                return None;
            }
            let pkt = self.pkt_raw(id);
            *self.tx_free.get() = pkt.next;
            *self.n_tx_free.get() -= 1;
            pkt.next = PktId::NONE;
            pkt.refcount = 1;
            pkt.flags = PktFlags::empty();
            self.n_async.fetch_add(1, Ordering::Relaxed);
            Some(id)
        }
    }

    /// Whether a TX-pool allocation could currently succeed.
    ///
    /// # Safety
    /// Caller must hold the stack lock.
    pub(crate) unsafe fn tx_may_alloc(&self) -> bool {
        unsafe { *self.n_tx_free.get() > 0 }
    }

    /// Push a cleaned packet onto the non-blocking sub-pool. Lock-free.
    pub(crate) fn free_nonb(&self, id: PktId) {
        let mut head = self.nonb_head.load(Ordering::Acquire);
        loop {
            let (tag, old) = head_unpack(head);
            unsafe { self.pkt_raw(id).next = old };
            match self.nonb_head.compare_exchange_weak(
                head,
                head_pack(tag.wrapping_add(1), id),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(cur) => head = cur,
            }
        }
        self.n_nonb.fetch_add(1, Ordering::Relaxed);
        self.wake_waiters();
    }

    /// Release one owned packet to its origin sub-pool.
    ///
    /// # Safety
    /// `locked` must be true iff the caller holds the stack lock; the TX
    /// sub-pool is only reachable when it is.
    pub(crate) unsafe fn release_pkt(&self, id: PktId, locked: bool) {
        let pkt = unsafe { self.pkt_raw(id) };
        safe_assert!(!pkt.flags.contains(PktFlags::RX));
        safe_assert_eq!(pkt.refcount, 1);
        let nonb = pkt.flags.contains(PktFlags::NONB_POOL) || !locked;
        pkt.clean();
        self.n_async.fetch_sub(1, Ordering::Relaxed);
        if nonb {
            self.free_nonb(id);
        } else {
            unsafe {
                pkt.next = *self.tx_free.get();
                *self.tx_free.get() = id;
                *self.n_tx_free.get() += 1;
            }
            self.wake_waiters();
        }
    }

    /// Account a batch leaving sender ownership for a stack queue.
    pub(crate) fn debit_async(&self, n: i32) {
        self.n_async.fetch_sub(n, Ordering::Relaxed);
    }

    /// Block until a buffer is likely available. The stack lock must NOT
    /// be held. Returns `Interrupted` when a signal is latched while
    /// waiting; `NoPktBufs` if the wait cannot make progress.
    pub fn wait(&self) -> Result<(), SendError> {
        if self.n_pkts == 0 {
            return Err(SendError::NoPktBufs);
        }
        self.n_waiters.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.wait_lock.lock().unwrap();
        let rc = loop {
            if self.n_nonb.load(Ordering::Acquire) > 0 {
                break Ok(());
            }
            if signal::pending().is_some() {
                break Err(SendError::Interrupted);
            }
            // Bounded wait so latched signals are seen promptly.
            let (g, _timeout) =
                self.wait_cond.wait_timeout(guard, std::time::Duration::from_millis(20)).unwrap();
            guard = g;
        };
        drop(guard);
        self.n_waiters.fetch_sub(1, Ordering::AcqRel);
        rc
    }

    #[inline]
    fn wake_waiters(&self) {
        if self.n_waiters.load(Ordering::Acquire) > 0 {
            let _guard = self.wait_lock.lock().unwrap();
            self.wait_cond.notify_all();
        }
    }
}

impl Drop for PktPool {
    fn drop(&mut self) {
        if self.owns_mem {
            let size = self.n_pkts as usize * size_of::<Packet>();
            unsafe {
                std::alloc::dealloc(
                    self.mem as *mut u8,
                    Layout::array::<u8>(size).unwrap().align_to(64).unwrap().pad_to_align(),
                );
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nonb_pool_drains_and_refills() {
        let pool = PktPool::new(8, 4).unwrap();
        let mut got = Vec::new();
        while let Some(id) = pool.alloc_nonb() {
            got.push(id);
        }
        assert_eq!(got.len(), 4);
        assert_eq!(pool.n_async(), 4);

        for id in got.drain(..) {
            unsafe { pool.release_pkt(id, false) };
        }
        assert_eq!(pool.n_async(), 0);
        assert!(pool.alloc_nonb().is_some());
    }

    #[test]
    fn tx_pool_needs_lock_discipline() {
        let pool = PktPool::new(8, 4).unwrap();
        // Four packets started on the TX sub-pool.
        let mut got = Vec::new();
        unsafe {
            while let Some(id) = pool.alloc_tx_locked() {
                got.push(id);
            }
            assert_eq!(got.len(), 4);
            assert!(!pool.tx_may_alloc());
            for id in got.drain(..) {
                pool.release_pkt(id, true);
            }
            assert!(pool.tx_may_alloc());
        }
    }

    #[test]
    fn concurrent_alloc_free_is_lossless() {
        let pool = PktPool::new(64, 64).unwrap();
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10_000 {
                        if let Some(id) = pool.alloc_nonb() {
                            unsafe { pool.release_pkt(id, false) };
                        }
                    }
                });
            }
        });
        // Every buffer must have come back.
        let mut n = 0;
        while pool.alloc_nonb().is_some() {
            n += 1;
        }
        assert_eq!(n, 64);
        assert_eq!(pool.n_async(), 64);
    }

    #[test]
    fn shared_arena_create() {
        let path = std::path::Path::new("/dev/shm/strand_pool_test");
        let _ = std::fs::remove_file(path);
        let pool = PktPool::create_shared(path, 8, 8).unwrap();
        let id = pool.alloc_nonb().unwrap();
        unsafe { pool.release_pkt(id, false) };
        let _ = std::fs::remove_file(path);
    }
}

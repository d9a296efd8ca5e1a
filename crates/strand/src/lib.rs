//! A user-space TCP transmit engine over a shared-memory NIC interface.
//!
//! The send path segments user data into arena packets, sequences them
//! under a single per-netif stack lock, and hands work to whichever
//! thread holds that lock via a lock-free prequeue when it's contended.
//! Backpressure is non-blocking, adaptive-spin or blocking per call.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod netif;
pub mod pkt;
pub mod pool;
mod ring;
pub mod send;
pub mod sock;

use once_cell::sync::OnceCell;
pub use strand_timing as timing;
pub use strand_utils as utils;
pub use tracing;

pub use crate::{
    config::StackOpts,
    error::{PoolError, SendError},
    netif::{Netif, NicEvent, StackGuard, TxDesc},
    send::{Iovec, SendFlags, ZcBuf, ZcIov, ZcMsg},
    sock::{SockFlags, SockId, TcpSock, TcpState},
};

static INIT: OnceCell<()> = OnceCell::new();

/// One-time library bootstrap: signal latch, clock calibration. Runs at
/// most once no matter how many netifs are created.
pub fn init() {
    INIT.get_or_init(|| {
        strand_utils::signal::install();
        // Calibrate the cycle clock outside the hot path.
        let _ = strand_timing::cycles_per_usec();
        tracing::debug!(cycles_per_usec = strand_timing::cycles_per_usec(), "strand initialised");
    });
}

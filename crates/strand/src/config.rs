use serde::Serialize;
use tracing::{debug, warn};

/// Per-stack tunables. Defaults match a small deployment; every field can
/// be overridden from the environment at init via [`StackOpts::from_env`].
#[derive(Debug, Clone, Serialize)]
pub struct StackOpts {
    /// Total packet buffers in the arena.
    pub n_pkt_bufs: u32,
    /// Buffers seeded into the lock-free non-blocking sub-pool; the rest
    /// start on the stack-lock-protected TX sub-pool.
    pub nonb_pool_pkts: u32,
    /// Send queue capacity in packets per socket.
    pub sendq_max_pkts: i32,
    /// Fixed send window in bytes (no congestion control here).
    pub snd_wnd: u32,
    /// Default effective MSS for new sockets.
    pub eff_mss: u32,
    /// Max packets segmented per pipeline pass.
    pub tx_batch: u32,
    /// Max completion events handled per poll.
    pub evs_per_poll: u32,
    /// Per-call spin budget for threads that opted into spinning.
    pub spin_usec: u64,
    /// With NODELAY set, still withhold when at least this many packets
    /// are inflight and they are on average less than half full.
    pub nonagle_inflight_max: u32,
    /// Default per-send timeout in milliseconds; 0 means wait forever.
    pub sndtimeo_msec: u32,
    /// Whether senders may poll the event queue themselves.
    pub may_poll: bool,
    /// Endpoint table capacity.
    pub max_socks: u32,
}

impl Default for StackOpts {
    fn default() -> Self {
        Self {
            n_pkt_bufs: 512,
            nonb_pool_pkts: 256,
            sendq_max_pkts: 64,
            snd_wnd: 1 << 16,
            eff_mss: 1460,
            tx_batch: 16,
            evs_per_poll: 64,
            spin_usec: 10_000,
            nonagle_inflight_max: 50,
            sndtimeo_msec: 0,
            may_poll: true,
            max_socks: 64,
        }
    }
}

impl StackOpts {
    /// Defaults overridden by `STRAND_*` environment variables. The
    /// resolved table is logged once so deployments can be diffed.
    pub fn from_env() -> Self {
        let mut o = Self::default();
        env_u32("STRAND_PKT_BUFS", &mut o.n_pkt_bufs);
        env_u32("STRAND_NONB_PKTS", &mut o.nonb_pool_pkts);
        env_i32("STRAND_SENDQ_MAX_PKTS", &mut o.sendq_max_pkts);
        env_u32("STRAND_SND_WND", &mut o.snd_wnd);
        env_u32("STRAND_EFF_MSS", &mut o.eff_mss);
        env_u32("STRAND_TX_BATCH", &mut o.tx_batch);
        env_u32("STRAND_EVS_PER_POLL", &mut o.evs_per_poll);
        env_u64("STRAND_SPIN_USEC", &mut o.spin_usec);
        env_u32("STRAND_NONAGLE_INFLIGHT_MAX", &mut o.nonagle_inflight_max);
        if let Ok(v) = std::env::var("STRAND_SNDTIMEO") {
            match humantime::parse_duration(&v) {
                Ok(d) => o.sndtimeo_msec = d.as_millis() as u32,
                Err(e) => warn!(%v, "STRAND_SNDTIMEO unparseable: {e}"),
            }
        }
        if let Ok(v) = std::env::var("STRAND_MAY_POLL") {
            o.may_poll = v != "0";
        }

        match serde_json::to_string(&o) {
            Ok(json) => debug!(opts = %json, "stack options resolved"),
            Err(e) => warn!("couldn't serialise stack options: {e}"),
        }
        o
    }
}

fn env_u32(key: &str, slot: &mut u32) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn!(key, %v, "ignoring unparseable option: {e}"),
        }
    }
}

fn env_i32(key: &str, slot: &mut i32) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn!(key, %v, "ignoring unparseable option: {e}"),
        }
    }
}

fn env_u64(key: &str, slot: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(e) => warn!(key, %v, "ignoring unparseable option: {e}"),
        }
    }
}

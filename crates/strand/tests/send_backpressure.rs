use std::time::{Duration, Instant};

use strand::{Netif, SendError, SendFlags, SockId, StackOpts};
use strand_utils::{TxThreadMode, boot_tx_thread};

fn netif_with(f: impl FnOnce(&mut StackOpts)) -> Netif {
    let mut opts = StackOpts::default();
    f(&mut opts);
    Netif::new(opts).expect("netif")
}

fn established(ni: &Netif, iss: u32) -> SockId {
    let id = ni.create_sock();
    ni.establish(id, iss).expect("establish");
    id
}

/// Fill the send queue of a zero-window socket to capacity.
fn saturate(ni: &Netif, id: SockId, pkts: usize, mss: usize) {
    for _ in 0..pkts {
        assert_eq!(ni.send_slice(id, &vec![0u8; mss], SendFlags::empty()).unwrap(), mss);
    }
}

#[test]
fn sndtimeo_expires_into_eagain_with_nothing_enqueued() {
    let ni = netif_with(|o| {
        o.sendq_max_pkts = 2;
        o.snd_wnd = 0;
        o.eff_mss = 100;
    });
    let id = established(&ni, 0);
    let sock = ni.endpoint(id).unwrap();
    sock.set_sndtimeo_msec(50);
    saturate(&ni, id, 2, 100);

    let t0 = Instant::now();
    let rc = ni.send_slice(id, &[1u8; 100], SendFlags::empty());
    let waited = t0.elapsed();

    assert_eq!(rc, Err(SendError::WouldBlock));
    assert!(waited >= Duration::from_millis(40), "returned after {waited:?}");
    assert!(waited < Duration::from_millis(500), "returned after {waited:?}");
    assert_eq!(ni.with_lock(|g| sock.tx_ref(g).enq_nxt), 200);
}

#[test]
fn blocked_sender_completes_when_acks_open_the_queue() {
    let ni = netif_with(|o| {
        o.sendq_max_pkts = 2;
        o.snd_wnd = 200;
        o.eff_mss = 100;
    });
    let id = established(&ni, 0);
    // Window lets two segments out; two more fill the queue.
    saturate(&ni, id, 4, 100);

    std::thread::scope(|s| {
        let ni = &ni;
        let sender = s.spawn(move || ni.send_slice(id, &[9u8; 100], SendFlags::empty()));

        std::thread::sleep(Duration::from_millis(30));
        // Ack everything on the wire; the freed window pulls the queue
        // forward and wakes the sender.
        ni.inject_ack(id, 200);
        ni.with_lock(|g| ni.poll(g));

        assert_eq!(sender.join().unwrap().unwrap(), 100);
    });

    let sock = ni.endpoint(id).unwrap();
    assert_eq!(ni.with_lock(|g| sock.tx_ref(g).enq_nxt), 500);
}

#[test]
fn spinner_picks_up_the_ack_without_sleeping() {
    let ni = netif_with(|o| {
        o.sendq_max_pkts = 2;
        o.snd_wnd = 200;
        o.eff_mss = 100;
        o.spin_usec = 500_000;
    });
    let id = established(&ni, 0);
    saturate(&ni, id, 4, 100);

    std::thread::scope(|s| {
        let ni = &ni;
        let sender = s.spawn(move || {
            boot_tx_thread(TxThreadMode::Spinning { core: None });
            ni.send_slice(id, &[3u8; 100], SendFlags::empty())
        });

        std::thread::sleep(Duration::from_millis(20));
        // The spinner polls this completion itself; nobody else calls
        // poll for it.
        ni.inject_ack(id, 200);

        assert_eq!(sender.join().unwrap().unwrap(), 100);
    });
    assert!(ni.stats.polls.load(std::sync::atomic::Ordering::Relaxed) > 0);
}

#[test]
fn spin_budget_is_capped_by_sndtimeo() {
    let ni = netif_with(|o| {
        o.sendq_max_pkts = 1;
        o.snd_wnd = 0;
        o.eff_mss = 100;
        o.spin_usec = 5_000_000; // would spin for 5s if uncapped
    });
    let id = established(&ni, 0);
    let sock = ni.endpoint(id).unwrap();
    sock.set_sndtimeo_msec(50);
    saturate(&ni, id, 1, 100);

    let t0 = Instant::now();
    let rc = std::thread::scope(|s| {
        let ni = &ni;
        s.spawn(move || {
            boot_tx_thread(TxThreadMode::Spinning { core: None });
            ni.send_slice(id, &[1u8; 100], SendFlags::empty())
        })
        .join()
        .unwrap()
    });

    assert_eq!(rc, Err(SendError::WouldBlock));
    assert!(t0.elapsed() < Duration::from_millis(1_000));
}

#[test]
fn pool_exhaustion_waits_for_frees_instead_of_failing() {
    let ni = netif_with(|o| {
        o.n_pkt_bufs = 4;
        o.nonb_pool_pkts = 4;
        o.eff_mss = 100;
        o.sendq_max_pkts = 64;
        o.snd_wnd = 1 << 16;
    });
    let id = established(&ni, 0);

    // First send takes every buffer in the arena.
    assert_eq!(ni.send_slice(id, &[1u8; 400], SendFlags::empty()).unwrap(), 400);

    std::thread::scope(|s| {
        let ni = &ni;
        let sender = s.spawn(move || ni.send_slice(id, &[2u8; 100], SendFlags::empty()));

        std::thread::sleep(Duration::from_millis(30));
        // Acks release buffers back to the pool; the waiter resumes.
        ni.inject_ack(id, 400);
        ni.with_lock(|g| ni.poll(g));

        assert_eq!(sender.join().unwrap().unwrap(), 100);
    });
}

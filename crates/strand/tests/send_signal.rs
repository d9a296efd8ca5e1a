//! Signal delivery during waits. The latch is process-wide, so the
//! scenarios run inside one test body, sequentially.

use std::time::Duration;

use strand::{Netif, SendError, SendFlags, SockId, StackOpts};
use strand_utils::signal;

fn netif_small() -> Netif {
    let mut opts = StackOpts::default();
    opts.sendq_max_pkts = 1;
    opts.snd_wnd = 0;
    opts.eff_mss = 100;
    Netif::new(opts).expect("netif")
}

fn established(ni: &Netif, iss: u32) -> SockId {
    let id = ni.create_sock();
    ni.establish(id, iss).expect("establish");
    id
}

#[test]
fn signal_during_block_interrupts_or_short_writes() {
    // Nothing enqueued yet: the signal surfaces as EINTR.
    let ni = netif_small();
    let id = established(&ni, 0);
    assert_eq!(ni.send_slice(id, &[1u8; 100], SendFlags::empty()).unwrap(), 100);

    std::thread::scope(|s| {
        let ni = &ni;
        let sender = s.spawn(move || ni.send_slice(id, &[2u8; 100], SendFlags::empty()));

        std::thread::sleep(Duration::from_millis(30));
        signal::latch(libc::SIGINT);

        assert_eq!(sender.join().unwrap(), Err(SendError::Interrupted));
    });
    assert_eq!(signal::take(), Some(libc::SIGINT));

    // Nothing from the interrupted call was enqueued.
    let sock = ni.endpoint(id).unwrap();
    assert_eq!(ni.with_lock(|g| sock.tx_ref(g).enq_nxt), 100);

    // Bytes already enqueued shadow the signal: short write, no error.
    let ni = netif_small();
    let id = established(&ni, 0);

    std::thread::scope(|s| {
        let ni = &ni;
        // 200 bytes: the first segment fits, the second blocks.
        let sender = s.spawn(move || ni.send_slice(id, &[3u8; 200], SendFlags::empty()));

        std::thread::sleep(Duration::from_millis(30));
        signal::latch(libc::SIGINT);

        assert_eq!(sender.join().unwrap().unwrap(), 100);
    });
    assert_eq!(signal::take(), Some(libc::SIGINT));
}

use std::time::Duration;

use strand::{Iovec, Netif, SendError, SendFlags, SockId, StackOpts, TcpState};

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

#[test]
fn latched_tx_errno_fails_a_fresh_send() {
    let ni = netif_with(|_| {});
    let id = established(&ni, 0);
    ni.abort_tx(id, libc::EPIPE).unwrap();

    assert_eq!(
        ni.send_slice(id, &[1u8; 100], SendFlags::empty()),
        Err(SendError::Pipe)
    );
    // Nothing leaked into the queues.
    let sock = ni.endpoint(id).unwrap();
    ni.with_lock(|g| {
        assert!(sock.tx_ref(g).sendq.is_empty());
        assert_eq!(sock.tx_ref(g).enq_nxt, 0);
    });
}

#[test]
fn error_mid_call_yields_the_short_write() {
    let ni = netif_with(|o| {
        o.sendq_max_pkts = 1;
        o.snd_wnd = 0;
        o.eff_mss = 500;
    });
    let id = established(&ni, 0);

    std::thread::scope(|s| {
        let ni = &ni;
        // 1000 bytes: the first 500 fit, then the queue is full and the
        // call blocks.
        let sender = s.spawn(move || ni.send_slice(id, &[7u8; 1000], SendFlags::empty()));

        std::thread::sleep(Duration::from_millis(30));
        ni.abort_tx(id, libc::EPIPE).unwrap();

        // Short write, not an error: 500 bytes were already enqueued.
        assert_eq!(sender.join().unwrap().unwrap(), 500);
    });

    // The latched error surfaces on the next call.
    assert_eq!(
        ni.send_slice(id, &[7u8; 100], SendFlags::empty()),
        Err(SendError::Pipe)
    );
}

#[test]
fn null_iovec_base_is_a_fault_with_no_partial_enqueue() {
    let ni = netif_with(|_| {});
    let id = established(&ni, 0);
    let good = [1u8; 10];
    let iov = [
        Iovec::from_slice(&good),
        Iovec { base: std::ptr::null(), len: 5 },
    ];

    assert_eq!(ni.send(id, &iov, SendFlags::empty()), Err(SendError::Fault));
    let sock = ni.endpoint(id).unwrap();
    ni.with_lock(|g| assert_eq!(sock.tx_ref(g).enq_nxt, 0));

    // Zero-length entries may carry a null base, like a real iovec.
    let iov = [Iovec { base: std::ptr::null(), len: 0 }, Iovec::from_slice(&good)];
    assert_eq!(ni.send(id, &iov, SendFlags::empty()).unwrap(), 10);
}

#[test]
fn so_error_is_delivered_before_anything_else() {
    let ni = netif_with(|_| {});
    let id = established(&ni, 0);
    let sock = ni.endpoint(id).unwrap();
    sock.set_so_error(libc::ECONNRESET);
    ni.abort_tx(id, libc::EPIPE).unwrap();

    // so_error wins, and is consumed by delivery.
    assert_eq!(
        ni.send_slice(id, &[1u8; 10], SendFlags::empty()),
        Err(SendError::ConnReset)
    );
    assert_eq!(
        ni.send_slice(id, &[1u8; 10], SendFlags::empty()),
        Err(SendError::Pipe)
    );
}

#[test]
fn closed_socket_is_a_pipe_error() {
    let ni = netif_with(|_| {});
    let id = ni.create_sock();
    assert_eq!(ni.endpoint(id).unwrap().state(), TcpState::Closed);

    assert_eq!(
        ni.send_slice(id, &[1u8; 10], SendFlags::empty()),
        Err(SendError::Pipe)
    );
}

#[test]
fn connect_in_progress_dontwait_is_eagain() {
    let ni = netif_with(|_| {});
    let id = ni.create_sock();
    // SYN sent, nothing back yet.
    set_syn_sent(&ni, id);

    assert_eq!(
        ni.send_slice(id, &[1u8; 10], SendFlags::DONTWAIT),
        Err(SendError::WouldBlock)
    );
}

#[test]
fn blocking_send_rides_out_the_handshake() {
    let ni = netif_with(|_| {});
    let id = ni.create_sock();
    set_syn_sent(&ni, id);

    std::thread::scope(|s| {
        let ni = &ni;
        let sender = s.spawn(move || ni.send_slice(id, &[4u8; 100], SendFlags::empty()));

        std::thread::sleep(Duration::from_millis(20));
        ni.establish(id, 0).unwrap();

        assert_eq!(sender.join().unwrap().unwrap(), 100);
    });
}

#[test]
fn invalid_endpoint_id_is_rejected() {
    let ni = netif_with(|_| {});
    assert_eq!(
        ni.send_slice(SockId(42), &[1u8; 10], SendFlags::empty()),
        Err(SendError::NotConnected)
    );
}

/// Model a connect() that has sent its SYN: state moves off Closed but
/// stays unsynchronised.
fn set_syn_sent(ni: &Netif, id: SockId) {
    ni.start_connect(id).unwrap();
}

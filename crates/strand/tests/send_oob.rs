use strand::{Netif, SendFlags, SockFlags, SockId, StackOpts};

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
fn oob_send_points_snd_up_past_the_urgent_bytes() {
    let ni = netif_with(|o| o.snd_wnd = 0);
    let id = established(&ni, 0);
    let sock = ni.endpoint(id).unwrap();

    // 50 ordinary bytes queued ahead of the urgent data.
    assert_eq!(ni.send_slice(id, &[1u8; 50], SendFlags::empty()).unwrap(), 50);

    assert_eq!(ni.send_slice(id, &[2u8; 100], SendFlags::OOB).unwrap(), 100);

    ni.with_lock(|g| {
        let tx = sock.tx_ref(g);
        assert_eq!(tx.enq_nxt, 150);
        assert_eq!(tx.snd_up, 150);
    });
    assert!(!sock.sock_flags().contains(SockFlags::NO_TX_ADVANCE));
}

#[test]
fn oob_inner_send_only_enqueues_until_the_fixup() {
    // Big window: without NO_TX_ADVANCE the inner send would emit
    // immediately; the two-phase dance must still end with everything
    // advanced and the flag dropped.
    let ni = netif_with(|_| {});
    let id = established(&ni, 0);
    let sock = ni.endpoint(id).unwrap();

    assert_eq!(ni.send_slice(id, &[7u8; 300], SendFlags::OOB).unwrap(), 300);

    assert!(!sock.sock_flags().contains(SockFlags::NO_TX_ADVANCE));
    let descs = ni.with_lock(|g| ni.take_emitted(g));
    assert_eq!(descs.len(), 1);
    assert_eq!(descs[0].end_seq - descs[0].start_seq, 300);
    // The urgent flag rides the emitted segment.
    assert_ne!(descs[0].tcp_flags & strand::pkt::TCP_FLAG_URG, 0);
    ni.with_lock(|g| assert_eq!(sock.tx_ref(g).snd_up, 300));
}

#[test]
fn oob_with_urgent_data_pending_advances_despite_nagle() {
    let ni = netif_with(|_| {});
    let id = established(&ni, 0);

    // Prime: a small segment in flight would normally nagle-block the
    // next runt.
    assert_eq!(ni.send_slice(id, &[1u8; 10], SendFlags::empty()).unwrap(), 10);
    assert_eq!(ni.with_lock(|g| ni.take_emitted(g)).len(), 1);

    // Urgent data must not be withheld.
    assert_eq!(ni.send_slice(id, &[2u8; 10], SendFlags::OOB).unwrap(), 10);
    assert_eq!(ni.with_lock(|g| ni.take_emitted(g)).len(), 1);
}

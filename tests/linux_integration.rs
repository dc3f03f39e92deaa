//! Live capture tests against the loopback interface.
//!
//! They need root (or CAP_NET_RAW plus CAP_IPC_LOCK) and skip otherwise.
//!
//! Run with: `sudo cargo test --test linux_integration`

#![cfg(target_os = "linux")]

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use zerocap::{CaptureConfig, CaptureError, CaptureSession, PollTimeout, SessionState};

fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

fn loopback(filter: &str) -> CaptureConfig {
    CaptureConfig {
        filter: filter.to_string(),
        block_size: 1 << 20,
        block_count: 4,
        block_timeout: Duration::from_millis(10),
        poll_timeout: PollTimeout::After(Duration::from_millis(50)),
        interface: Some("lo".to_string()),
        ..CaptureConfig::default()
    }
}

/// A port nothing else on the machine is sending to.
fn free_port() -> (UdpSocket, u16) {
    let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
    let port = sock.local_addr().unwrap().port();
    (sock, port)
}

#[test]
fn session_initializes_and_closes() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let mut session = CaptureSession::new(loopback("udp"));
    session.initialize().unwrap();
    assert_eq!(session.state(), SessionState::Active);
    assert!(session.raw_fd().is_some());
    assert!(session.filter().is_some_and(|f| !f.is_empty()));

    // Already active: nothing to do.
    session.initialize().unwrap();

    session.close();
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.hold_block(),
        Err(CaptureError::NotActive(SessionState::Closed))
    ));
}

#[test]
fn unknown_interface_fails_to_bind() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let mut config = loopback("udp");
    config.interface = Some("zc-no-such-if0".to_string());
    let mut session = CaptureSession::new(config);
    assert!(matches!(
        session.initialize(),
        Err(CaptureError::Bind { .. })
    ));
    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(!session.last_error().is_empty());
}

#[test]
fn idle_ring_times_out_without_a_block() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let (_rx, port) = free_port();
    let mut session = CaptureSession::new(loopback(&format!("udp and dst port {port}")));
    session.initialize().unwrap();

    let start = Instant::now();
    let block = session.hold_block().unwrap();
    assert!(block.is_none());
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn loopback_udp_is_captured_and_filtered() {
    if !is_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let (_rx, port) = free_port();
    let (_other_rx, other_port) = free_port();
    let mut session = CaptureSession::new(loopback(&format!("udp and dst port {port}")));
    session.initialize().unwrap();

    let tx = UdpSocket::bind("127.0.0.1:0").unwrap();
    for _ in 0..5 {
        tx.send_to(b"zerocap", ("127.0.0.1", port)).unwrap();
        tx.send_to(b"ignored", ("127.0.0.1", other_port)).unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut incoming = 0;
    while incoming < 5 && Instant::now() < deadline {
        let Some(block) = session.hold_block().unwrap() else {
            continue;
        };
        assert!(block.num_packets() > 0);
        for frame in block.incoming() {
            let data = frame.data();
            // Ethernet + 20-byte IPv4 header, then the UDP destination port.
            assert_eq!(u16::from_be_bytes([data[36], data[37]]), port);
            assert!(data.ends_with(b"zerocap"));
            incoming += 1;
        }
        session.release_block().unwrap();
    }
    assert_eq!(incoming, 5);

    let stats = session.stats().unwrap();
    assert!(stats.packets >= 5);
}

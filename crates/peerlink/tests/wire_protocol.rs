//! Wire-level tests against a hand-driven remote endpoint.
//!
//! # Purpose
//!
//! The peer-to-peer tests in `link_integration.rs` always put a real peer
//! on both ends, which makes some wire behaviors unreachable: a remote
//! that never answers, a remote that injects a mismatched or malformed
//! frame, or a remote that sends resolved streaming frames without
//! headers.  Here the remote side is a plain `TcpListener` driven byte by
//! byte from the test, using the public codec types to craft frames:
//!
//! ```text
//! Peer (library under test)           Harness (raw socket)
//! ─────────────────────────           ────────────────────
//! connect(...)            HELLO ──▶   read_exact(HEADER_SIZE)
//!                         ◀── ACCEPT  scripted reply
//!                         ◀── frames  scripted DATA frames
//! data events observed by the test
//! ```
//!
//! Every scripted frame sequence ends with a well-formed marker frame, so
//! the assertions double as frame-alignment checks: if the peer
//! mis-consumed an earlier frame, the marker would not decode.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use peerlink::{
    ConnectOptions, Connection, DataType, Header, Payload, Peer, PeerConfig, PeerHandlers,
    HEADER_SIZE,
};

const RECV_WAIT: Duration = Duration::from_secs(3);

/// Delay between the scripted `ACCEPT` and the first scripted frame,
/// leaving the test time to install its `data` callback.
const HANDLER_GRACE: Duration = Duration::from_millis(300);

fn test_config() -> PeerConfig {
    PeerConfig {
        address: Some("127.0.0.1".to_string()),
        timeout_secs: 1.0,
        invisible: true,
        ..PeerConfig::default()
    }
}

/// Accepts one socket, consumes the `HELLO`, and replies `ACCEPT`.
fn accept_offer(listener: &TcpListener) -> TcpStream {
    let (mut socket, _) = listener.accept().expect("accept");
    let mut hello = vec![0u8; HEADER_SIZE];
    socket.read_exact(&mut hello).expect("read offer");
    assert!(matches!(
        Header::decode(&hello).expect("decode offer"),
        Header::Hello { .. }
    ));
    socket
        .write_all(&Header::Accept.encode().expect("encode accept"))
        .expect("send accept");
    socket
}

/// Spawns the scripted remote: handshake, grace period, then `frames`.
fn scripted_remote(frames: Vec<Vec<u8>>) -> (String, JoinHandle<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind harness");
    let address = listener.local_addr().expect("local addr").to_string();
    let handle = std::thread::spawn(move || {
        let mut socket = accept_offer(&listener);
        std::thread::sleep(HANDLER_GRACE);
        for frame in frames {
            socket.write_all(&frame).expect("send scripted frame");
        }
        // Keep the socket open so the peer tears nothing down mid-test.
        socket
    });
    (address, handle)
}

/// Connects a fresh peer to the scripted remote and wires `data` events
/// into a channel.
fn connect_and_observe(
    address: &str,
    options: ConnectOptions,
) -> (Peer, Arc<Connection>, Receiver<Payload>) {
    let peer = Peer::start(test_config(), PeerHandlers::new()).expect("start peer");
    let connection = peer.connect(address, options).expect("handshake");
    let (tx, rx) = mpsc::channel();
    connection.set_data_handler(move |_, payload| {
        let _ = tx.send(payload);
    });
    (peer, connection, rx)
}

fn data_frame(payload: &Payload) -> Vec<u8> {
    let bytes = payload.encode().expect("encode payload");
    let mut frame = Header::Data {
        data_size: bytes.len(),
        data_type: payload.data_type(),
    }
    .encode()
    .expect("encode header");
    frame.extend_from_slice(&bytes);
    frame
}

// ── Strict mode ───────────────────────────────────────────────────────────────

/// Tests the strict-mismatch drop: a frame declaring the wrong data type
/// is discarded, but its payload bytes are still consumed, so the next
/// well-typed frame decodes cleanly.
#[test]
fn test_strict_link_drops_mismatched_frame_but_stays_aligned() {
    let mismatched = data_frame(&Payload::Bytes(b"binary intruder".to_vec()));
    let marker = data_frame(&Payload::text("after the drop"));
    let (address, remote) = scripted_remote(vec![mismatched, marker]);

    let options = ConnectOptions {
        data_type: DataType::Json,
        strict: true,
        ..ConnectOptions::default()
    };
    let (_peer, connection, rx) = connect_and_observe(&address, options);

    // Only the well-typed frame surfaces, and it decodes intact.
    let payload = rx.recv_timeout(RECV_WAIT).expect("marker frame");
    assert_eq!(payload, Payload::text("after the drop"));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    assert!(connection.is_alive(), "a dropped frame must not kill the link");

    drop(remote.join().unwrap());
}

/// Tests that a non-strict link delivers frames of a foreign declared
/// type, decoded per that declaration.
#[test]
fn test_lenient_link_delivers_foreign_frame_types() {
    let foreign = data_frame(&Payload::Bytes(vec![0xAB; 6]));
    let (address, remote) = scripted_remote(vec![foreign]);

    let options = ConnectOptions {
        data_type: DataType::Json,
        strict: false,
        ..ConnectOptions::default()
    };
    let (_peer, _connection, rx) = connect_and_observe(&address, options);

    let payload = rx.recv_timeout(RECV_WAIT).expect("foreign frame");
    assert_eq!(payload, Payload::Bytes(vec![0xAB; 6]));

    drop(remote.join().unwrap());
}

// ── Malformed input ───────────────────────────────────────────────────────────

/// Tests that a header-sized block of garbage is ignored (not a fatal
/// error), and the next real frame is still delivered.
#[test]
fn test_malformed_header_block_is_ignored() {
    let garbage = vec![0xFFu8; HEADER_SIZE];
    let marker = data_frame(&Payload::text("still here"));
    let (address, remote) = scripted_remote(vec![garbage, marker]);

    let (_peer, connection, rx) = connect_and_observe(&address, ConnectOptions::default());

    let payload = rx.recv_timeout(RECV_WAIT).expect("marker frame");
    assert_eq!(payload, Payload::text("still here"));
    assert!(connection.is_alive());

    drop(remote.join().unwrap());
}

/// Tests that a non-`DATA` header on an established link is ignored.
#[test]
fn test_unexpected_handshake_header_is_ignored() {
    let stray_accept = Header::Accept.encode().expect("encode");
    let marker = data_frame(&Payload::text("ignored the stray"));
    let (address, remote) = scripted_remote(vec![stray_accept, marker]);

    let (_peer, _connection, rx) = connect_and_observe(&address, ConnectOptions::default());

    let payload = rx.recv_timeout(RECV_WAIT).expect("marker frame");
    assert_eq!(payload, Payload::text("ignored the stray"));

    drop(remote.join().unwrap());
}

// ── Streaming ─────────────────────────────────────────────────────────────────

/// Tests streaming receive with auto size resolution: the first frame
/// carries a header and fixes the frame size; the second arrives bare and
/// is still framed correctly.
#[test]
fn test_streaming_link_receives_headerless_frames_after_resolution() {
    let first = Payload::Bytes(b"frame-one".to_vec());
    let second = Payload::Bytes(b"frame-two".to_vec());
    assert_eq!(
        first.encode().unwrap().len(),
        second.encode().unwrap().len(),
        "scripted frames must share one resolved size"
    );

    let headered = data_frame(&first);
    let bare = second.encode().expect("encode bare frame");
    let (address, remote) = scripted_remote(vec![headered, bare]);

    let options = ConnectOptions {
        data_type: DataType::Bytes,
        stream: true,
        ..ConnectOptions::default()
    };
    let (_peer, _connection, rx) = connect_and_observe(&address, options);

    assert_eq!(rx.recv_timeout(RECV_WAIT).expect("first frame"), first);
    assert_eq!(rx.recv_timeout(RECV_WAIT).expect("second frame"), second);

    drop(remote.join().unwrap());
}

/// Tests a pre-declared streaming size: no header is ever needed, bare
/// frames are delivered from the start.
#[test]
fn test_streaming_link_with_declared_size_needs_no_header() {
    let payload = Payload::Bytes(vec![7; 32]);
    let bare = payload.encode().expect("encode");
    let size = bare.len();
    let (address, remote) = scripted_remote(vec![bare.clone(), bare]);

    let options = ConnectOptions {
        data_type: DataType::Bytes,
        stream: true,
        data_size: Some(size),
        ..ConnectOptions::default()
    };
    let (_peer, _connection, rx) = connect_and_observe(&address, options);

    assert_eq!(rx.recv_timeout(RECV_WAIT).expect("first frame"), payload);
    assert_eq!(rx.recv_timeout(RECV_WAIT).expect("second frame"), payload);

    drop(remote.join().unwrap());
}

// ── Slow and hostile senders ──────────────────────────────────────────────────

/// Tests that a sender pausing between a `DATA` header and its payload,
/// for longer than the peer's read timeout, does not desynchronize the
/// link: the paused frame completes and the following frame still
/// decodes.
#[test]
fn test_frame_paused_after_its_header_stays_aligned() {
    let delayed = Payload::text("slow but intact");
    let delayed_bytes = delayed.encode().expect("encode payload");
    let header = Header::Data {
        data_size: delayed_bytes.len(),
        data_type: delayed.data_type(),
    }
    .encode()
    .expect("encode header");
    let marker = data_frame(&Payload::text("next frame"));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind harness");
    let address = listener.local_addr().unwrap().to_string();
    let remote = std::thread::spawn(move || {
        let mut socket = accept_offer(&listener);
        std::thread::sleep(HANDLER_GRACE);
        socket.write_all(&header).expect("send header");
        // Longer than the peer's 1 s read timeout: with the header already
        // consumed, the payload read must wait, not abandon the frame.
        std::thread::sleep(Duration::from_millis(1600));
        socket.write_all(&delayed_bytes).expect("send payload");
        socket.write_all(&marker).expect("send marker");
        socket
    });

    let (_peer, connection, rx) = connect_and_observe(&address, ConnectOptions::default());

    assert_eq!(
        rx.recv_timeout(RECV_WAIT).expect("paused frame"),
        Payload::text("slow but intact")
    );
    assert_eq!(
        rx.recv_timeout(RECV_WAIT).expect("marker frame"),
        Payload::text("next frame")
    );
    assert!(connection.is_alive());

    drop(remote.join().unwrap());
}

/// Tests that the strict-mismatch discard also consumes a payload that
/// arrives after a pause, so a slow mismatched frame cannot shift the
/// framing either.
#[test]
fn test_strict_discard_consumes_a_paused_payload() {
    let mismatched = Payload::Bytes(b"late intruder".to_vec());
    let mismatched_bytes = mismatched.encode().expect("encode payload");
    let header = Header::Data {
        data_size: mismatched_bytes.len(),
        data_type: mismatched.data_type(),
    }
    .encode()
    .expect("encode header");
    let marker = data_frame(&Payload::text("after the drop"));

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind harness");
    let address = listener.local_addr().unwrap().to_string();
    let remote = std::thread::spawn(move || {
        let mut socket = accept_offer(&listener);
        std::thread::sleep(HANDLER_GRACE);
        socket.write_all(&header).expect("send header");
        std::thread::sleep(Duration::from_millis(1600));
        socket.write_all(&mismatched_bytes).expect("send payload");
        socket.write_all(&marker).expect("send marker");
        socket
    });

    let options = ConnectOptions {
        data_type: DataType::Json,
        strict: true,
        ..ConnectOptions::default()
    };
    let (_peer, connection, rx) = connect_and_observe(&address, options);

    // Only the well-typed marker surfaces, proving the mismatched payload
    // was consumed in full despite the pause.
    assert_eq!(
        rx.recv_timeout(RECV_WAIT).expect("marker frame"),
        Payload::text("after the drop")
    );
    assert!(connection.is_alive());

    drop(remote.join().unwrap());
}

/// Tests that a header declaring an absurd payload size does not force a
/// matching allocation: the payload buffer grows only as bytes arrive, so
/// the peer just closes the link when the remote drops mid-frame.
#[test]
fn test_oversized_declared_frame_is_not_allocated_up_front() {
    let header = Header::Data {
        data_size: 1 << 40,
        data_type: DataType::Json,
    }
    .encode()
    .expect("encode header");

    let listener = TcpListener::bind("127.0.0.1:0").expect("bind harness");
    let address = listener.local_addr().unwrap().to_string();
    let remote = std::thread::spawn(move || {
        let mut socket = accept_offer(&listener);
        std::thread::sleep(HANDLER_GRACE);
        socket.write_all(&header).expect("send header");
        drop(socket);
    });

    let (_peer, connection, rx) = connect_and_observe(&address, ConnectOptions::default());

    assert!(rx.recv_timeout(RECV_WAIT).is_err(), "no data event expected");
    let deadline = std::time::Instant::now() + RECV_WAIT;
    while connection.is_alive() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(
        !connection.is_alive(),
        "link must close when the remote drops mid-frame"
    );

    remote.join().unwrap();
}

// ── Handshake failure modes ───────────────────────────────────────────────────

/// Tests that a remote that accepts the socket but never answers the
/// offer produces a `Timeout`, bounded by the peer's configured timeout.
#[test]
fn test_unanswered_offer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind harness");
    let address = listener.local_addr().unwrap().to_string();
    let silent = std::thread::spawn(move || {
        let (socket, _) = listener.accept().expect("accept");
        // Hold the socket without replying until the peer gives up.
        std::thread::sleep(Duration::from_secs(3));
        drop(socket);
    });

    let peer = Peer::start(test_config(), PeerHandlers::new()).expect("start peer");
    let started = std::time::Instant::now();
    let result = peer.connect(&address, ConnectOptions::default());
    assert!(matches!(result, Err(peerlink::ConnectError::Timeout)));
    assert!(
        started.elapsed() < Duration::from_secs(3),
        "timeout must be bounded by the configured peer timeout"
    );
    assert!(peer.connections().is_empty());

    silent.join().unwrap();
}

/// Tests that a remote that reads the offer and just closes the socket is
/// reported as a denial.
#[test]
fn test_remote_closing_without_reply_is_a_denial() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind harness");
    let address = listener.local_addr().unwrap().to_string();
    let closer = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().expect("accept");
        let mut hello = vec![0u8; HEADER_SIZE];
        socket.read_exact(&mut hello).expect("read offer");
        drop(socket);
    });

    let peer = Peer::start(test_config(), PeerHandlers::new()).expect("start peer");
    let result = peer.connect(&address, ConnectOptions::default());
    assert!(matches!(result, Err(peerlink::ConnectError::Denied)));
    assert!(peer.connections().is_empty());

    closer.join().unwrap();
}

/// Tests the accepting side against a raw initiator: a socket that opens
/// and sends something other than a `HELLO` is dropped silently, with no
/// registry entry and no reply.
#[test]
fn test_non_offer_socket_is_dropped_silently() {
    let handlers = PeerHandlers::new().on_connection(|_| true);
    let peer = Peer::start(test_config(), handlers).expect("start peer");

    let mut socket = TcpStream::connect(peer.address_name()).expect("tcp connect");
    socket
        .write_all(&Header::Accept.encode().expect("encode"))
        .expect("send non-offer");
    socket
        .set_read_timeout(Some(Duration::from_millis(1500)))
        .unwrap();

    // No reply of any kind comes back; the socket just goes quiet or dies.
    let mut buf = [0u8; 1];
    match socket.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("unexpected {n}-byte reply to a non-offer"),
        Err(e) => assert!(
            matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
            ),
            "unexpected error: {e}"
        ),
    }
    assert!(peer.connections().is_empty());
}

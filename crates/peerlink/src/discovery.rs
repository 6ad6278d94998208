//! LAN peer discovery over UDP broadcast.
//!
//! Discovery is a stateless ping/pong exchange on a well-known UDP port.
//! A prober opens an ephemeral broadcast-capable socket and sends
//! `PING <ip>:<port>` carrying that socket's own address; every visible
//! responder on the segment unicasts `PONG <tcp-address>` back to it.
//! There is no retry, deduplication, or completeness guarantee — the
//! prober simply returns whatever replies arrive within the collection
//! window.
//!
//! The responder runs on its own thread, bounded by a short read timeout
//! so it can notice peer shutdown and visibility changes promptly.

use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::connection::is_timeout_error;
use crate::peer::PeerShared;

/// Poll interval of the responder loop, and the pong collection window.
pub(crate) const DISCOVERY_WINDOW: Duration = Duration::from_millis(500);

/// Largest discovery datagram we accept.
const DATAGRAM_SIZE: usize = 512;

// ── Wire helpers ──────────────────────────────────────────────────────────────

/// Extracts the reply address from a `PING <addr>` datagram.
fn parse_ping(text: &str) -> Option<&str> {
    let addr = text.strip_prefix("PING ")?.trim();
    (!addr.is_empty()).then_some(addr)
}

/// Extracts the responder's address from a `PONG <addr>` datagram.
fn parse_pong(text: &str) -> Option<&str> {
    let addr = text.strip_prefix("PONG ")?.trim();
    (!addr.is_empty()).then_some(addr)
}

fn format_ping(reply_address: &SocketAddr) -> String {
    format!("PING {reply_address}")
}

fn format_pong(address_name: &str) -> String {
    format!("PONG {address_name}")
}

// ── Responder ─────────────────────────────────────────────────────────────────

/// Binds the shared discovery port and spawns the responder thread.
///
/// The thread exits when the peer stops or turns invisible; turning
/// visible again spawns a fresh responder.
pub(crate) fn spawn_responder(shared: Arc<PeerShared>) -> io::Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(("0.0.0.0", shared.discovery_port()))?;
    socket.set_read_timeout(Some(DISCOVERY_WINDOW))?;
    socket.set_broadcast(true)?;

    std::thread::Builder::new()
        .name("peerlink-discovery".to_string())
        .spawn(move || responder_loop(&socket, &shared))
}

fn responder_loop(socket: &UdpSocket, shared: &PeerShared) {
    debug!(
        "[{}] discovery responder listening on UDP port {}",
        shared.address_name(),
        shared.discovery_port()
    );

    let mut buf = [0u8; DATAGRAM_SIZE];
    while !shared.is_stopping() && shared.is_visible() {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if is_timeout_error(&e) => continue,
            Err(e) => {
                warn!("[{}] discovery socket error: {e}", shared.address_name());
                break;
            }
        };

        // Visibility may have flipped during the blocking receive.
        if shared.is_stopping() || !shared.is_visible() {
            break;
        }

        let text = String::from_utf8_lossy(&buf[..len]);
        let Some(reply_address) = parse_ping(&text) else {
            trace!(
                "[{}] ignoring non-ping datagram: {text:?}",
                shared.address_name()
            );
            continue;
        };

        let Ok(reply_address) = reply_address.parse::<SocketAddr>() else {
            trace!(
                "[{}] ignoring ping with unparsable reply address: {reply_address:?}",
                shared.address_name()
            );
            continue;
        };

        debug!(
            "[{}] received ping from {reply_address}",
            shared.address_name()
        );
        let pong = format_pong(shared.address_name());
        if let Err(e) = socket.send_to(pong.as_bytes(), reply_address) {
            warn!(
                "[{}] failed to send pong to {reply_address}: {e}",
                shared.address_name()
            );
        }
    }

    debug!("[{}] discovery responder stopped", shared.address_name());
}

// ── Prober ────────────────────────────────────────────────────────────────────

/// Broadcasts one ping and collects responder addresses for a bounded
/// window.  The prober's own address is excluded from the result.
pub(crate) fn probe(
    self_name: &str,
    reply_ip: IpAddr,
    discovery_port: u16,
    broadcast_address: &str,
) -> io::Result<Vec<String>> {
    let socket = UdpSocket::bind((reply_ip, 0))?;
    socket.set_read_timeout(Some(DISCOVERY_WINDOW))?;
    socket.set_broadcast(true)?;

    let reply_address = socket.local_addr()?;
    let ping = format_ping(&reply_address);
    socket.send_to(ping.as_bytes(), (broadcast_address, discovery_port))?;
    trace!("[{self_name}] pinging local network from {reply_address}");

    let mut addresses = Vec::new();
    let mut buf = [0u8; DATAGRAM_SIZE];
    loop {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(e) if is_timeout_error(&e) => break,
            Err(e) => return Err(e),
        };

        let text = String::from_utf8_lossy(&buf[..len]);
        let Some(address_name) = parse_pong(&text) else {
            continue;
        };

        if address_name != self_name && !addresses.iter().any(|a| a == address_name) {
            debug!("[{self_name}] received pong from {address_name}");
            addresses.push(address_name.to_string());
        }
    }

    Ok(addresses)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

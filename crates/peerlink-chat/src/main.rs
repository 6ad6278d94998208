//! Terminal chat demo.
//!
//! Run one instance per terminal; each starts a peer, prints its own
//! address, and prompts for a remote address to dial (leave it empty to
//! just wait for inbound offers).  Every line typed afterwards is sent to
//! all connected peers; received messages print with the sender's name.
//!
//! ```text
//! terminal 1                          terminal 2
//! ──────────                          ──────────
//! $ peerlink-chat                     $ peerlink-chat [config.toml]
//! listening on 192.168.1.20:41000
//! dial: <empty>                       dial: 192.168.1.20:41000
//! hi there                            192.168.1.20:41000: hi there
//! ```
//!
//! An optional first argument names a TOML config file (see
//! [`peerlink::PeerConfig`]); without one, defaults apply.

use std::io::{BufRead, Write};

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerlink::{ConnectOptions, Payload, Peer, PeerConfig, PeerHandlers};

fn main() -> anyhow::Result<()> {
    // Initialise structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PeerConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => PeerConfig::default(),
    };

    // Accept every offer and print whatever arrives on it.
    let handlers = PeerHandlers::new()
        .on_listen(|address| println!("listening on {address}"))
        .on_connection(|connection| {
            println!("* {} joined", connection.remote_name());
            connection.set_data_handler(|connection, payload| {
                print_message(connection.remote_name(), &payload);
            });
            connection.set_stop_handler(|connection| {
                println!("* {} left", connection.remote_name());
            });
            true
        });

    let peer = Peer::start(config, handlers).context("starting peer")?;
    info!("peer up at {}", peer.address_name());

    let stdin = std::io::stdin();
    print!("dial (empty to wait for peers): ");
    std::io::stdout().flush()?;

    let mut lines = stdin.lock().lines();
    if let Some(line) = lines.next() {
        let target = line?.trim().to_string();
        if !target.is_empty() {
            match peer.connect(&target, ConnectOptions::default()) {
                Ok(connection) => {
                    println!("* connected to {}", connection.remote_name());
                    connection.set_data_handler(|connection, payload| {
                        print_message(connection.remote_name(), &payload);
                    });
                    connection.set_stop_handler(|connection| {
                        println!("* {} left", connection.remote_name());
                    });
                }
                Err(e) => warn!("could not reach {target}: {e}"),
            }
        }
    }

    // Every further line fans out to all live connections.
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let failures = peer.broadcast(&Payload::text(line));
        for (name, error) in failures {
            warn!("delivery to {name} failed: {error}");
        }
    }

    peer.stop(false);
    Ok(())
}

fn print_message(sender: &str, payload: &Payload) {
    match payload {
        Payload::Json(serde_json::Value::String(text)) => println!("{sender}: {text}"),
        other => println!("{sender}: {other:?}"),
    }
}

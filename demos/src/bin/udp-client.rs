use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use roamwire::{Cookie, PacketConn, glue};
use roamwire_demos::{init_tracing, parse_cookie};
use tokio::time::timeout;
use tracing::{info, warn};

/// Sends a few messages through one or more UDP bridges and waits for the
/// echoes.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Bridge address. Repeat to use several bridges as paths of one session.
    #[arg(long, required = true)]
    bridge: Vec<SocketAddr>,

    /// Bridge cookie as 64 hex digits, shared by every bridge given.
    #[arg(long, value_parser = parse_cookie)]
    cookie: Cookie,

    #[arg(long, default_value_t = 3)]
    count: u32,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_tracing();
    let args = Args::parse();

    let (client, session) = glue::dial_udp_multipath(
        args.bridge.iter().map(|&host| (host, args.cookie.clone())),
    )?;
    info!(?session, paths = args.bridge.len(), "session open");

    for i in 1..=args.count {
        let msg = format!("message {}", i);
        // The first datagrams to a bridge only carry the handshake.
        let mut echoed = false;
        for _ in 0..10 {
            client.send_to(msg.as_bytes(), &session).await?;
            if let Ok(received) = timeout(Duration::from_millis(500), client.recv_from()).await {
                let (buf, _) = received?;
                info!("echo message received: {}", String::from_utf8_lossy(&buf));
                echoed = true;
                break;
            }
        }
        if !echoed {
            warn!("no echo for {:?}", msg);
        }
    }
    info!(stats = ?client.stats(), "done");
    Ok(())
}

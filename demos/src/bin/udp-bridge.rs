use std::net::SocketAddr;

use clap::Parser;
use roamwire::{Cookie, PacketConn, glue};
use roamwire_demos::{init_tracing, parse_cookie, to_hex};
use tracing::info;

/// A UDP bridge that echoes every datagram back into its session.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9093")]
    listen: SocketAddr,

    /// Bridge cookie as 64 hex digits. A random one is generated if omitted.
    #[arg(long, value_parser = parse_cookie)]
    cookie: Option<Cookie>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_tracing();
    let args = Args::parse();

    let cookie = args.cookie.unwrap_or_else(Cookie::from_entropy);
    let bridge = glue::listen_udp(args.listen, cookie.clone()).await?;
    info!(listen = %args.listen, cookie = %to_hex(cookie.as_bytes()), "bridge ready");

    loop {
        let (buf, session) = bridge.recv_from().await?;
        info!(?session, "received message: {}", String::from_utf8_lossy(&buf));
        bridge.send_to(&buf, &session).await?;
    }
}

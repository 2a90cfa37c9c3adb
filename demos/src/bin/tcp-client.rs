use std::net::SocketAddr;

use clap::Parser;
use roamwire::{
    Cookie, Cshirt2Config,
    binder::{MemoryBinder, Tier},
    exit::ExitIdentity,
    glue,
};
use roamwire_demos::{init_tracing, parse_cookie, parse_hex32};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

/// Reaches the exit through a cshirt2 TCP bridge and exchanges a few
/// messages with it.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9094")]
    bridge: SocketAddr,

    /// Bridge cookie as 64 hex digits.
    #[arg(long, value_parser = parse_cookie)]
    cookie: Cookie,

    /// The exit's Ed25519 public key as 64 hex digits.
    #[arg(long, value_parser = parse_hex32)]
    exit: [u8; 32],

    #[arg(long, default_value_t = 2)]
    count: u32,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_tracing();
    let args = Args::parse();

    // A stand-in binder issues the ticket.
    let ticket = MemoryBinder::generate()?.issue_ticket(Tier::Free);
    let identity = ExitIdentity::from_bytes(args.exit);

    let bridged = glue::dial_tcp(args.bridge, &Cshirt2Config::new(args.cookie)).await?;
    let mut stream = glue::connect_exit(bridged, &identity, &ticket).await?;
    info!(bridge = %args.bridge, "connected to exit");

    for i in 1..=args.count {
        stream.write_all(format!("message {}", i).as_bytes()).await?;
        stream.flush().await?;

        let mut buf = vec![0; 1024];
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            info!("exit closed connection");
            break;
        }
        info!("echo message received: {}", String::from_utf8_lossy(&buf[..n]));
    }
    stream.shutdown().await?;
    Ok(())
}

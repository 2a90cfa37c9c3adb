use std::net::SocketAddr;

use clap::Parser;
use roamwire::{Cookie, Cshirt2Config, exit::ExitKey, glue};
use roamwire_demos::{init_tracing, parse_cookie, to_hex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, warn};

/// A cshirt2 TCP bridge with an echoing exit behind it.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:9094")]
    listen: SocketAddr,

    /// Bridge cookie as 64 hex digits. A random one is generated if omitted.
    #[arg(long, value_parser = parse_cookie)]
    cookie: Option<Cookie>,

    /// PKCS#8 file holding the exit's Ed25519 key. A fresh key is generated
    /// if omitted.
    #[arg(long)]
    key: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    init_tracing();
    let args = Args::parse();

    let cookie = args.cookie.unwrap_or_else(Cookie::from_entropy);
    let key = match &args.key {
        Some(path) => ExitKey::from_pkcs8(&std::fs::read(path)?)?,
        None => ExitKey::generate()?,
    };
    let listener = glue::listen_tcp(args.listen, Cshirt2Config::new(cookie.clone())).await?;
    info!(
        listen = %listener.local_addr(),
        cookie = %to_hex(cookie.as_bytes()),
        identity = %to_hex(key.identity().as_bytes()),
        "exit ready"
    );

    let key = std::sync::Arc::new(key);
    loop {
        let (stream, peer) = listener.accept().await?;
        let key = key.clone();
        tokio::spawn(async move {
            let (mut tss, ticket) = match glue::accept_exit(stream, &key).await {
                Ok(bound) => bound,
                Err(e) => {
                    warn!(%peer, error = %e, "exit binding failed");
                    return;
                }
            };
            // Without a binder at hand the demo takes any well-formed ticket.
            info!(%peer, tier = %ticket.tier, "client bound");

            let mut buf = vec![0; 1024];
            loop {
                match tss.read(&mut buf).await {
                    Ok(n) if n > 0 => {
                        info!("received message: {}", String::from_utf8_lossy(&buf[..n]));
                        let echoed = match tss.write_all(&buf[..n]).await {
                            Ok(()) => tss.flush().await,
                            Err(e) => Err(e),
                        };
                        if let Err(e) = echoed {
                            warn!(%peer, error = %e, "failed to echo");
                            return;
                        }
                    }
                    Ok(_) => {
                        info!(%peer, "client closed connection");
                        return;
                    }
                    Err(e) => {
                        warn!(%peer, error = %e, "failed to read from stream");
                        return;
                    }
                }
            }
        });
    }
}

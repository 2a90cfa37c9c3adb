//! Entry points that stack the layers for each role.
//!
//! ```text
//! client (UDP):  E2eSocket -> ObfsSocket -> Wrapper    -> UDP
//! bridge (UDP):  E2eSocket -> ObfsSocket -> BatchedUdp -> UDP
//! client (TCP):  TssStream -> Cshirt2Stream -> TCP
//! exit:          TssStream over whatever reliable stream reached it
//! ```
use std::{io, net::SocketAddr};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs, UdpSocket},
};
use tracing::debug;

use crate::{
    batch::BatchedUdp,
    binder::{Binder, Ticket},
    config::{Cshirt2Config, E2eConfig, ObfsConfig, WrapperConfig},
    crypto::Cookie,
    cshirt2::{Cshirt2Listener, Cshirt2Stream},
    e2e::{E2eSocket, SessionAddr},
    error::Error,
    exit::{ExitIdentity, ExitKey, bind_client, bind_exit},
    obfs::{ObfsAddr, ObfsSocket},
    tss::TssStream,
    wrapper::Wrapper,
};

/// The client's packet stack.
pub type ClientSocket = E2eSocket<ObfsSocket<Wrapper<UdpSocket>>>;

/// A UDP bridge's packet stack.
pub type BridgeSocket = E2eSocket<ObfsSocket<BatchedUdp>>;

/// Opens a client socket with one session that runs over a single bridge.
///
/// Must be called from within a tokio runtime.
pub fn dial_udp(host: SocketAddr, cookie: Cookie) -> io::Result<(ClientSocket, SessionAddr)> {
    dial_udp_multipath([(host, cookie)])
}

/// Opens a client socket with one session that runs over every given
/// bridge at once. Fails with [`Error::PathUnknown`] if there are none.
pub fn dial_udp_multipath(
    bridges: impl IntoIterator<Item = (SocketAddr, Cookie)>,
) -> io::Result<(ClientSocket, SessionAddr)> {
    let obfs = ObfsSocket::new(Wrapper::udp(WrapperConfig::default()), ObfsConfig::client());
    let mut hosts = Vec::new();
    for (host, cookie) in bridges {
        obfs.register_peer(host, cookie);
        hosts.push(host);
    }
    if hosts.is_empty() {
        return Err(Error::PathUnknown.into());
    }

    let socket = E2eSocket::new(obfs, E2eConfig::client());
    let session = socket.new_session();
    for host in hosts {
        socket.add_path(session, ObfsAddr::Direct(host));
    }
    Ok((socket, session))
}

/// Asks `binder` for bridges and dials all of them.
pub async fn dial_via_binder<B: Binder>(
    binder: &B,
    ticket: &Ticket,
) -> io::Result<(ClientSocket, SessionAddr)> {
    let bridges = binder.get_bridges(ticket).await?;
    debug!(count = bridges.len(), "glue: bridges from binder");
    dial_udp_multipath(bridges.into_iter().map(|b| (b.host, b.cookie)))
}

/// Serves a UDP bridge on `addr` for clients that know `cookie`.
pub async fn listen_udp(addr: impl ToSocketAddrs, cookie: Cookie) -> io::Result<BridgeSocket> {
    let conn = BatchedUdp::bind(addr).await?;
    debug!(local_addr = ?conn.local_addr().ok(), "glue: udp bridge listening");
    let obfs = ObfsSocket::new(conn, ObfsConfig::server(cookie));
    Ok(E2eSocket::new(obfs, E2eConfig::server()))
}

/// Connects to a TCP bridge.
pub async fn dial_tcp(
    host: impl ToSocketAddrs,
    config: &Cshirt2Config,
) -> io::Result<Cshirt2Stream<TcpStream>> {
    let tcp = TcpStream::connect(host).await?;
    tcp.set_nodelay(true)?;
    Cshirt2Stream::connect(tcp, config).await
}

/// Serves a TCP bridge on `addr`.
pub async fn listen_tcp(
    addr: impl ToSocketAddrs,
    config: Cshirt2Config,
) -> io::Result<Cshirt2Listener> {
    Cshirt2Listener::bind(addr, config).await
}

/// Opens a TinySS channel to the exit at the far end of `stream`, checks
/// that it holds `identity` and submits `ticket`.
pub async fn connect_exit<IO>(
    stream: IO,
    identity: &ExitIdentity,
    ticket: &Ticket,
) -> io::Result<TssStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut tss = TssStream::handshake(stream).await?;
    bind_client(&mut tss, identity, ticket).await?;
    Ok(tss)
}

/// Exit side of [`connect_exit`]. Returns the channel and the client's
/// ticket, which the caller still has to verify.
pub async fn accept_exit<IO>(stream: IO, key: &ExitKey) -> io::Result<(TssStream<IO>, Ticket)>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut tss = TssStream::handshake(stream).await?;
    let ticket = bind_exit(&mut tss, key).await?;
    Ok((tss, ticket))
}

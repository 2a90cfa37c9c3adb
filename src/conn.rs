//! The packet-socket capability shared by every datagram layer.
//!
//! UDP, [`BatchedUdp`], the path [`Wrapper`], [`ObfsSocket`] and
//! [`E2eSocket`] all implement [`PacketConn`]; each layer owns the one below
//! it and only differs in what it uses as an address.
//!
//! [`BatchedUdp`]: crate::BatchedUdp
//! [`Wrapper`]: crate::Wrapper
//! [`ObfsSocket`]: crate::obfs::ObfsSocket
//! [`E2eSocket`]: crate::e2e::E2eSocket
use core::{fmt::Debug, hash::Hash};
use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::net::UdpSocket;

use crate::specification::MAX_DATAGRAM_LEN;

/// An unreliable, unordered, message-oriented socket.
///
/// Implementations are safe to share between tasks; no caller has to
/// serialize access.
pub trait PacketConn: Send + Sync + 'static {
    /// How peers are addressed on this layer.
    type Addr: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    /// Sends one datagram to `dest`, returning the number of payload bytes
    /// accepted. Success means the datagram was handed to the layer below,
    /// not that it arrived.
    fn send_to(
        &self,
        buf: &[u8],
        dest: &Self::Addr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// Receives the next datagram and the address it came from.
    fn recv_from(&self) -> impl Future<Output = io::Result<(Vec<u8>, Self::Addr)>> + Send;
}

impl PacketConn for UdpSocket {
    type Addr = SocketAddr;

    async fn send_to(&self, buf: &[u8], dest: &SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, *dest).await
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (n, from) = UdpSocket::recv_from(self, &mut buf).await?;
        buf.truncate(n);
        Ok((buf, from))
    }
}

/// Receive errors a datagram socket survives, such as ICMP unreachable
/// reports surfacing on the next `recv_from`.
pub(crate) fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// A snapshot of a socket's packet counters.
///
/// Packet layers drop bad or excess datagrams instead of failing; these
/// counters are the only place such drops become visible.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    /// Datagrams handed to the layer below.
    pub packets_sent: u64,
    /// Datagrams delivered to the reader.
    pub packets_received: u64,
    /// Datagrams that failed authentication.
    pub dropped_auth: u64,
    /// Datagrams that could not be parsed or were stale.
    pub dropped_decode: u64,
    /// Datagrams lost to a full read queue.
    pub dropped_backpressure: u64,
    /// Duplicates suppressed by E2E deduplication.
    pub dropped_duplicate: u64,
    /// Peers that continued from a new source address.
    pub roams: u64,
    /// Completed handshakes.
    pub handshakes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) packets_sent: AtomicU64,
    pub(crate) packets_received: AtomicU64,
    pub(crate) dropped_auth: AtomicU64,
    pub(crate) dropped_decode: AtomicU64,
    pub(crate) dropped_backpressure: AtomicU64,
    pub(crate) dropped_duplicate: AtomicU64,
    pub(crate) roams: AtomicU64,
    pub(crate) handshakes: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> Stats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        Stats {
            packets_sent: get(&self.packets_sent),
            packets_received: get(&self.packets_received),
            dropped_auth: get(&self.dropped_auth),
            dropped_decode: get(&self.dropped_decode),
            dropped_backpressure: get(&self.dropped_backpressure),
            dropped_duplicate: get(&self.dropped_duplicate),
            roams: get(&self.roams),
            handshakes: get(&self.handshakes),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_udp_packet_conn() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        let n = PacketConn::send_to(&a, b"hello", &b_addr).await.unwrap();
        assert_eq!(n, 5);
        let (buf, from) = PacketConn::recv_from(&b).await.unwrap();
        assert_eq!(buf, b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn test_counters_snapshot() {
        let counters = Counters::default();
        Counters::bump(&counters.roams);
        Counters::bump(&counters.roams);
        Counters::bump(&counters.packets_sent);
        let stats = counters.snapshot();
        assert_eq!(stats.roams, 2);
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.handshakes, 0);
    }
}

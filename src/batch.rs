//! A UDP socket whose sends go through a bounded queue drained in batches.
use core::fmt::{Debug, Formatter};
use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
};

use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use crate::{
    conn::{PacketConn, is_transient},
    specification::MAX_DATAGRAM_LEN,
    time::CloseSignal,
};

/// Datagrams that may wait for the send worker.
const QUEUE_LEN: usize = 256;

/// Most datagrams the worker takes off the queue per wakeup.
const MAX_BATCH: usize = 1024;

/// A UDP socket with a send queue.
///
/// [`send_to`] only enqueues: a worker task drains the queue in batches and
/// puts them on the wire back to back, one `send_to` call per datagram since
/// tokio exposes no portable `sendmmsg`. The batching saves task wakeups, not
/// syscalls.
///
/// Send errors cannot be reported to the caller that caused them. An error
/// that concerns one destination (unreachable, refused, wrong address
/// family) drops that datagram and the worker carries on. An error that
/// concerns the socket itself marks it dead, and every later operation fails
/// with `BrokenPipe`. Reads are unaffected by the queue and remain one
/// datagram at a time.
///
/// [`send_to`]: PacketConn::send_to
pub struct BatchedUdp {
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    dead: Arc<CloseSignal>,
    worker: JoinHandle<()>,
}

impl BatchedUdp {
    /// Wraps `socket`. Must be called from within a tokio runtime.
    pub fn new(socket: UdpSocket) -> Self {
        let socket = Arc::new(socket);
        let dead = Arc::new(CloseSignal::default());
        let (tx, rx) = mpsc::channel(QUEUE_LEN);
        let worker = tokio::spawn(send_loop(socket.clone(), rx, dead.clone()));
        Self {
            socket,
            tx,
            dead,
            worker,
        }
    }

    /// Binds a new UDP socket on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(addr).await?))
    }

    /// Returns the local address of the underlying socket.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Returns true once the socket has failed or was closed.
    pub fn is_dead(&self) -> bool {
        self.dead.is_closed()
    }

    /// Stops the worker and fails every pending and later operation.
    pub fn close(&self) {
        self.dead.close();
        self.worker.abort();
    }

    fn check(&self) -> io::Result<()> {
        if self.is_dead() {
            return Err(broken_pipe());
        }
        Ok(())
    }
}

/// True for errors after which no datagram can leave the socket, whatever its
/// destination.
fn is_fatal(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::Unsupported
    )
}

fn broken_pipe() -> io::Error {
    io::Error::new(ErrorKind::BrokenPipe, "batched udp socket is dead")
}

impl PacketConn for BatchedUdp {
    type Addr = SocketAddr;

    async fn send_to(&self, buf: &[u8], dest: &SocketAddr) -> io::Result<usize> {
        self.check()?;
        self.tx
            .send((buf.to_vec(), *dest))
            .await
            .map_err(|_| broken_pipe())?;
        Ok(buf.len())
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        self.check()?;
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        let (n, from) = tokio::select! {
            res = self.socket.recv_from(&mut buf) => res?,
            _ = self.dead.closed() => return Err(broken_pipe()),
        };
        buf.truncate(n);
        Ok((buf, from))
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut rx: mpsc::Receiver<(Vec<u8>, SocketAddr)>,
    dead: Arc<CloseSignal>,
) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    loop {
        if rx.recv_many(&mut batch, MAX_BATCH).await == 0 {
            return;
        }
        trace!(len = batch.len(), "batch: flushing");
        for (datagram, dest) in batch.drain(..) {
            match socket.send_to(&datagram, dest).await {
                Ok(_) => {}
                Err(e) if is_transient(&e) => {
                    trace!(%dest, error = %e, "batch: transient send error");
                }
                Err(e) if is_fatal(&e) => {
                    warn!(%dest, error = %e, "batch: send failed, socket is dead");
                    dead.close();
                    return;
                }
                Err(e) => {
                    debug!(%dest, error = %e, "batch: dropping datagram");
                }
            }
        }
    }
}

impl Drop for BatchedUdp {
    fn drop(&mut self) {
        self.close();
    }
}

impl Debug for BatchedUdp {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BatchedUdp")
            .field("local_addr", &self.local_addr().ok())
            .field("dead", &self.is_dead())
            .finish_non_exhaustive()
    }
}

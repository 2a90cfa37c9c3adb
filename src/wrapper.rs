//! Client-side path wrapper: one rotating socket per destination.
//!
//! Sending every flow from one long-lived socket makes it easy to correlate
//! flows by their 5-tuple. The wrapper instead opens a dedicated socket per
//! destination and replaces it after `base + Exp(mean)`. A replaced socket
//! keeps receiving for a drain period so that replies already in flight are
//! not lost. A socket whose destination has gone quiet is closed once its
//! lifetime and the drain period have both passed.
use core::fmt::{Debug, Formatter};
use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use rand::Rng;
use tokio::{
    net::UdpSocket,
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
    time::{interval, sleep},
};
use tracing::{debug, trace, warn};

use crate::{
    config::WrapperConfig,
    conn::{PacketConn, is_transient},
    error::Error,
    time::CloseSignal,
};

type Factory<C> = Box<dyn Fn() -> io::Result<C> + Send + Sync>;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A [`PacketConn`] that spreads its traffic over short-lived sockets.
///
/// Errors are squelched: a send reports the full length even if opening a
/// socket or the send itself failed, and reads never fail while the wrapper
/// is open. After [`close`](Wrapper::close) both fail with [`Error::Closed`].
pub struct Wrapper<C: PacketConn<Addr = SocketAddr>> {
    inner: Arc<Inner<C>>,
    rx: AsyncMutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>,
    sweeper: JoinHandle<()>,
}

struct Inner<C> {
    factory: Factory<C>,
    config: WrapperConfig,
    paths: Mutex<HashMap<SocketAddr, Path<C>>>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    close: Arc<CloseSignal>,
}

struct Path<C> {
    conn: Arc<C>,
    pump: JoinHandle<()>,
    expire_at: Instant,
}

impl Wrapper<UdpSocket> {
    /// A wrapper whose sockets are fresh UDP sockets on an ephemeral port.
    pub fn udp(config: WrapperConfig) -> Self {
        Self::new(
            || {
                let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
                socket.set_nonblocking(true)?;
                UdpSocket::from_std(socket)
            },
            config,
        )
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Wrapper<C> {
    /// Creates a wrapper that opens sockets with `factory`. Must be called
    /// from within a tokio runtime.
    pub fn new<F>(factory: F, config: WrapperConfig) -> Self
    where
        F: Fn() -> io::Result<C> + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let inner = Arc::new(Inner {
            factory: Box::new(factory),
            config,
            paths: Mutex::new(HashMap::new()),
            tx,
            close: Arc::new(CloseSignal::default()),
        });
        let sweeper = tokio::spawn(sweep_loop(Arc::downgrade(&inner)));
        Self {
            inner,
            rx: AsyncMutex::new(rx),
            sweeper,
        }
    }

    /// Closes every socket. Idempotent.
    pub fn close(&self) {
        if self.inner.close.close() {
            debug!("wrapper: closed");
        }
        self.sweeper.abort();
        for (_, path) in self.inner.paths.lock().drain() {
            path.pump.abort();
        }
    }

    /// Number of destinations that currently have a socket.
    pub fn path_count(&self) -> usize {
        self.inner.paths.lock().len()
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Inner<C> {
    fn lifetime(&self) -> Duration {
        // Exp(mean) by inversion.
        let u: f64 = rand::rng().random();
        self.config.rotate_base + self.config.rotate_mean.mul_f64((1.0 - u).ln().abs())
    }

    /// Closes sockets that outlived both their lifetime and the drain period.
    fn sweep(&self, paths: &mut HashMap<SocketAddr, Path<C>>, now: Instant) {
        let drain = self.config.drain;
        paths.retain(|dest, path| {
            let keep = now < path.expire_at + drain;
            if !keep {
                trace!(%dest, "wrapper: closing idle socket");
                path.pump.abort();
            }
            keep
        });
    }

    fn live(paths: &HashMap<SocketAddr, Path<C>>, dest: SocketAddr, now: Instant) -> Option<Arc<C>> {
        paths
            .get(&dest)
            .filter(|path| now < path.expire_at)
            .map(|path| path.conn.clone())
    }

    /// Returns the socket for `dest`, opening or rotating it if needed.
    fn conn_for(&self, dest: SocketAddr) -> io::Result<Arc<C>> {
        let now = Instant::now();
        {
            let mut paths = self.paths.lock();
            self.sweep(&mut paths, now);
            if let Some(conn) = Self::live(&paths, dest, now) {
                return Ok(conn);
            }
        }

        let conn = Arc::new((self.factory)()?);
        let mut paths = self.paths.lock();
        self.close.check()?;
        // A concurrent send may have opened one in the meantime.
        if let Some(existing) = Self::live(&paths, dest, now) {
            return Ok(existing);
        }
        let pump = tokio::spawn(pump(conn.clone(), self.tx.clone(), self.close.clone()));
        let path = Path {
            conn: conn.clone(),
            pump,
            expire_at: now + self.lifetime(),
        };
        if let Some(old) = paths.insert(dest, path) {
            debug!(%dest, "wrapper: rotating socket");
            let drain = self.config.drain;
            tokio::spawn(async move {
                sleep(drain).await;
                old.pump.abort();
            });
        }
        Ok(conn)
    }
}

impl<C: PacketConn<Addr = SocketAddr>> PacketConn for Wrapper<C> {
    type Addr = SocketAddr;

    async fn send_to(&self, buf: &[u8], dest: &SocketAddr) -> io::Result<usize> {
        self.inner.close.check()?;
        match self.inner.conn_for(*dest) {
            Ok(conn) => {
                if let Err(e) = conn.send_to(buf, dest).await {
                    trace!(%dest, error = %e, "wrapper: send failed");
                }
            }
            Err(e) => warn!(%dest, error = %e, "wrapper: cannot open socket"),
        }
        Ok(buf.len())
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SocketAddr)> {
        self.inner.close.check()?;
        let mut rx = self.rx.lock().await;
        tokio::select! {
            received = rx.recv() => received.ok_or_else(|| Error::Closed.into()),
            _ = self.inner.close.closed() => Err(Error::Closed.into()),
        }
    }
}

async fn sweep_loop<C: PacketConn<Addr = SocketAddr>>(weak: Weak<Inner<C>>) {
    let mut ticks = interval(SWEEP_INTERVAL);
    loop {
        ticks.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut paths = inner.paths.lock();
        inner.sweep(&mut paths, Instant::now());
    }
}

/// Feeds one socket's datagrams into the shared inbound queue until the
/// socket fails or the wrapper closes.
async fn pump<C: PacketConn<Addr = SocketAddr>>(
    conn: Arc<C>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    close: Arc<CloseSignal>,
) {
    loop {
        let received = tokio::select! {
            res = conn.recv_from() => res,
            _ = close.closed() => return,
        };
        match received {
            Ok(datagram) => {
                if tx.try_send(datagram).is_err() {
                    trace!("wrapper: inbound queue full, dropping datagram");
                }
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                trace!(error = %e, "wrapper: socket failed");
                return;
            }
        }
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Drop for Wrapper<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Debug for Wrapper<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Wrapper")
            .field("paths", &self.path_count())
            .field("closed", &self.inner.close.is_closed())
            .finish_non_exhaustive()
    }
}

use core::fmt::{Debug, Formatter};
use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Instant};

use parking_lot::Mutex;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::tunnel::{ProtoTun, Role, TunState, TunnelId, decode_hello};
use crate::{
    cache::TtlCache,
    config::ObfsConfig,
    conn::{Counters, PacketConn, Stats, is_transient},
    crypto::Cookie,
    error::Error,
    specification::{COOKIE_BUCKET_SECS, DATA_MIN_LEN},
    time::{CloseSignal, Deadline, current_bucket, guarded, now_ms},
};

/// How an OBFS peer is addressed.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ObfsAddr {
    /// A peer we initiated a tunnel to, by its underlying address.
    Direct(SocketAddr),
    /// A peer that initiated a tunnel to us. The handle stays valid when the
    /// peer's source address changes; sends go to wherever it was last seen.
    Tunnel(TunnelId),
}

/// An obfuscated datagram socket over any [`PacketConn`] addressed by
/// [`SocketAddr`].
///
/// A background task owns the receive side of the underlying socket: it
/// completes handshakes, answers Hellos, follows roaming peers and queues
/// decrypted payloads for [`recv_from`]. Datagrams that fail to parse or
/// authenticate are dropped and only show up in [`stats`].
///
/// [`recv_from`]: PacketConn::recv_from
/// [`stats`]: ObfsSocket::stats
pub struct ObfsSocket<C: PacketConn<Addr = SocketAddr>> {
    inner: Arc<Inner<C>>,
    rx: AsyncMutex<mpsc::Receiver<(Vec<u8>, ObfsAddr)>>,
    recv_task: JoinHandle<()>,
}

struct Inner<C> {
    conn: C,
    config: ObfsConfig,
    tables: Mutex<Tables>,
    counters: Counters,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close: CloseSignal,
}

struct Tables {
    by_addr: TtlCache<SocketAddr, Arc<TunState>>,
    by_id: TtlCache<TunnelId, SocketAddr>,
    pending: TtlCache<SocketAddr, Arc<ProtoTun>>,
    peers: HashMap<SocketAddr, Cookie>,
}

enum Inbound {
    Deliver(Vec<u8>, ObfsAddr),
    Reply(Vec<u8>),
    Drop,
}

impl<C: PacketConn<Addr = SocketAddr>> ObfsSocket<C> {
    /// Wraps `conn`. Must be called from within a tokio runtime.
    pub fn new(conn: C, config: ObfsConfig) -> Self {
        let tunnel_ttl = config.tunnel_ttl.as_millis() as u64;
        let pending_ttl = config.pending_ttl.as_millis() as u64;
        let capacity = config.table_capacity;
        let (tx, rx) = mpsc::channel(config.queue_capacity);

        let inner = Arc::new(Inner {
            conn,
            tables: Mutex::new(Tables {
                by_addr: TtlCache::new(tunnel_ttl, capacity),
                by_id: TtlCache::new(tunnel_ttl, capacity),
                pending: TtlCache::new(pending_ttl, capacity),
                peers: HashMap::new(),
            }),
            config,
            counters: Counters::default(),
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            close: CloseSignal::default(),
        });
        let recv_task = tokio::spawn(recv_loop(inner.clone(), tx));

        Self {
            inner,
            rx: AsyncMutex::new(rx),
            recv_task,
        }
    }

    /// Records the cookie to use for `addr`. The first send to `addr` then
    /// starts a handshake.
    pub fn register_peer(&self, addr: SocketAddr, cookie: Cookie) {
        self.inner.tables.lock().peers.insert(addr, cookie);
    }

    /// Returns a snapshot of this socket's counters.
    pub fn stats(&self) -> Stats {
        self.inner.counters.snapshot()
    }

    /// Sets the deadline for pending and future reads. `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.inner.read_deadline.set(deadline);
    }

    /// Sets the deadline for pending and future writes. `None` clears it.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.inner.write_deadline.set(deadline);
    }

    /// Closes the socket. Idempotent; every later operation fails with
    /// [`Error::Closed`].
    pub fn close(&self) {
        if self.inner.close.close() {
            debug!("obfs: socket closed");
        }
        self.recv_task.abort();
    }

    /// Returns a reference to the underlying socket.
    pub fn inner_conn(&self) -> &C {
        &self.inner.conn
    }
}

impl<C: PacketConn<Addr = SocketAddr>> PacketConn for ObfsSocket<C> {
    type Addr = ObfsAddr;

    async fn send_to(&self, buf: &[u8], dest: &ObfsAddr) -> io::Result<usize> {
        let inner = &self.inner;
        guarded(&inner.write_deadline, &inner.close, inner.send(buf, dest)).await
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, ObfsAddr)> {
        let inner = &self.inner;
        guarded(&inner.read_deadline, &inner.close, async {
            self.rx
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| Error::Closed.into())
        })
        .await
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Drop for ObfsSocket<C> {
    fn drop(&mut self) {
        self.inner.close.close();
        self.recv_task.abort();
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Debug for ObfsSocket<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObfsSocket")
            .field("server", &self.inner.config.cookie.is_some())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

async fn recv_loop<C: PacketConn<Addr = SocketAddr>>(
    inner: Arc<Inner<C>>,
    tx: mpsc::Sender<(Vec<u8>, ObfsAddr)>,
) {
    loop {
        let received = tokio::select! {
            res = inner.conn.recv_from() => res,
            _ = inner.close.closed() => return,
        };
        let (wire, from) = match received {
            Ok(datagram) => datagram,
            Err(e) if is_transient(&e) => {
                trace!(error = %e, "obfs: transient receive error");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "obfs: underlying socket failed, closing");
                inner.close.close();
                return;
            }
        };

        match inner.classify(&wire, from) {
            Inbound::Deliver(payload, addr) => match tx.try_send((payload, addr)) {
                Ok(()) => Counters::bump(&inner.counters.packets_received),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Counters::bump(&inner.counters.dropped_backpressure);
                    warn!(?addr, "obfs: read queue full, dropping datagram");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            },
            Inbound::Reply(hello) => {
                if let Err(e) = inner.conn.send_to(&hello, &from).await {
                    trace!(%from, error = %e, "obfs: failed to send hello reply");
                }
            }
            Inbound::Drop => {}
        }
    }
}

fn address_of(tun: &TunState, from: SocketAddr) -> ObfsAddr {
    match tun.role() {
        Role::Client => ObfsAddr::Direct(from),
        Role::Server => ObfsAddr::Tunnel(tun.id()),
    }
}

impl<C: PacketConn<Addr = SocketAddr>> Inner<C> {
    async fn send(&self, buf: &[u8], dest: &ObfsAddr) -> io::Result<usize> {
        let Some((wire, addr)) = self.prepare_send(buf, dest)? else {
            return Ok(buf.len());
        };
        self.conn.send_to(&wire, &addr).await?;
        Counters::bump(&self.counters.packets_sent);
        Ok(buf.len())
    }

    /// Returns the datagram to put on the wire, or `None` if the payload is
    /// silently dropped.
    fn prepare_send(&self, buf: &[u8], dest: &ObfsAddr) -> Result<Option<(Vec<u8>, SocketAddr)>, Error> {
        let now = now_ms();
        let mut tables = self.tables.lock();

        let addr = match *dest {
            ObfsAddr::Direct(addr) => addr,
            ObfsAddr::Tunnel(id) => match tables.by_id.get(&id, now) {
                Some(&addr) => addr,
                None => {
                    trace!(?id, "obfs: no route to tunnel, dropping");
                    return Ok(None);
                }
            },
        };

        if let Some(tun) = tables.by_addr.get(&addr, now).cloned() {
            if let ObfsAddr::Tunnel(id) = *dest {
                if tun.id() != id {
                    return Ok(None);
                }
            }
            tables.by_id.get(&tun.id(), now);
            drop(tables);
            return Ok(Some((tun.seal(buf), addr)));
        }
        if matches!(dest, ObfsAddr::Tunnel(_)) {
            return Ok(None);
        }

        // No tunnel yet: the payload is dropped and the Hello goes instead.
        let bucket = current_bucket(COOKIE_BUCKET_SECS);
        let padding_max = self.config.hello_padding_max;
        if let Some(proto) = tables.pending.get(&addr, now) {
            return Ok(Some((proto.hello(bucket, padding_max), addr)));
        }
        let cookie = tables.peers.get(&addr).cloned().ok_or(Error::PathUnknown)?;
        let proto = ProtoTun::new(cookie);
        let hello = proto.hello(bucket, padding_max);
        tables.pending.insert(addr, Arc::new(proto), now);
        debug!(%addr, "obfs: starting handshake");
        Ok(Some((hello, addr)))
    }

    fn classify(&self, wire: &[u8], from: SocketAddr) -> Inbound {
        let now = now_ms();
        let bucket = current_bucket(COOKIE_BUCKET_SECS);
        let mut tables = self.tables.lock();

        if let Some(tun) = tables.by_addr.get(&from, now).cloned() {
            return match tun.open(wire) {
                Ok(payload) => {
                    tables.by_id.get(&tun.id(), now);
                    Inbound::Deliver(payload, address_of(&tun, from))
                }
                Err(_) => {
                    if tun.role() == Role::Server {
                        if let Some(inbound) = self.on_hello(&mut tables, wire, from, now, bucket) {
                            return inbound;
                        }
                    }
                    Counters::bump(&self.counters.dropped_auth);
                    trace!(%from, len = wire.len(), "obfs: dropping datagram that failed to open");
                    Inbound::Drop
                }
            };
        }

        if let Some(proto) = tables.pending.get(&from, now).cloned() {
            return match proto.complete(wire, bucket, self.config.skew_buckets) {
                Some(tun) => {
                    tables.pending.remove(&from);
                    let tun = Arc::new(tun);
                    install(&mut tables, tun.clone(), from, now);
                    Counters::bump(&self.counters.handshakes);
                    debug!(%from, id = ?tun.id(), "obfs: handshake complete");
                    Inbound::Drop
                }
                None => {
                    Counters::bump(&self.counters.dropped_auth);
                    trace!(%from, "obfs: dropping bad hello reply");
                    Inbound::Drop
                }
            };
        }

        // A datagram from a new address may belong to a peer that moved.
        if wire.len() >= DATA_MIN_LEN {
            let found = tables
                .by_addr
                .iter(now)
                .find_map(|(addr, tun)| tun.open(wire).ok().map(|p| (*addr, tun.clone(), p)));
            if let Some((old, tun, payload)) = found {
                tables.by_addr.remove(&old);
                install(&mut tables, tun.clone(), from, now);
                Counters::bump(&self.counters.roams);
                debug!(%old, new = %from, id = ?tun.id(), "obfs: peer roamed");
                return Inbound::Deliver(payload, address_of(&tun, from));
            }
        }

        if let Some(inbound) = self.on_hello(&mut tables, wire, from, now, bucket) {
            return inbound;
        }
        if wire.len() < DATA_MIN_LEN {
            Counters::bump(&self.counters.dropped_decode);
        } else {
            Counters::bump(&self.counters.dropped_auth);
        }
        trace!(%from, len = wire.len(), "obfs: dropping datagram from unknown peer");
        Inbound::Drop
    }

    /// Server side of the handshake. Returns `None` if `wire` is not a Hello
    /// under our cookie.
    fn on_hello(
        &self,
        tables: &mut Tables,
        wire: &[u8],
        from: SocketAddr,
        now: u64,
        bucket: u64,
    ) -> Option<Inbound> {
        let cookie = self.config.cookie.as_ref()?;
        let epk = decode_hello(cookie, wire, bucket, self.config.skew_buckets)?;

        // A retransmitted Hello gets the reply it already got. It never moves
        // the tunnel; only an authenticated data packet does.
        let existing = tables
            .by_addr
            .iter(now)
            .find(|(_, t)| t.role() == Role::Server && t.their_epk() == &epk)
            .map(|(_, t)| t.clone());
        if let Some(tun) = existing {
            trace!(%from, "obfs: repeating hello reply");
            return tun.hello_reply().map(|reply| Inbound::Reply(reply.to_vec()));
        }

        let tun = Arc::new(TunState::accept(
            cookie,
            epk,
            bucket,
            self.config.hello_padding_max,
        )?);
        let reply = tun.hello_reply()?.to_vec();
        install(tables, tun.clone(), from, now);
        Counters::bump(&self.counters.handshakes);
        debug!(%from, id = ?tun.id(), "obfs: accepted handshake");
        Some(Inbound::Reply(reply))
    }
}

/// Points `addr` at `tun`, forgetting whichever tunnel held `addr` before.
fn install(tables: &mut Tables, tun: Arc<TunState>, addr: SocketAddr, now: u64) {
    if let Some(displaced) = tables.by_addr.insert(addr, tun.clone(), now) {
        if displaced.id() != tun.id() {
            tables.by_id.remove(&displaced.id());
        }
    }
    tables.by_id.insert(tun.id(), addr, now);
}

use core::fmt::{Debug, Formatter};
use std::{io, sync::Arc, time::Instant};

use parking_lot::Mutex;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, trace, warn};

use super::{
    packet::{E2ePacket, SessionAddr},
    session::{Processed, Session},
};
use crate::{
    cache::TtlCache,
    config::E2eConfig,
    conn::{Counters, PacketConn, Stats, is_transient},
    error::Error,
    time::{CloseSignal, Deadline, guarded, now_ms},
};

/// A multipath datagram socket addressed by [`SessionAddr`].
///
/// Every session may be reachable over several addresses of the layer below
/// (typically OBFS tunnels to different bridges). Outgoing datagrams pick a
/// path per session; incoming datagrams are deduplicated by content before
/// they reach [`recv_from`].
///
/// [`recv_from`]: PacketConn::recv_from
pub struct E2eSocket<C: PacketConn> {
    inner: Arc<Inner<C>>,
    rx: AsyncMutex<mpsc::Receiver<(Vec<u8>, SessionAddr)>>,
    recv_task: JoinHandle<()>,
}

struct Inner<C: PacketConn> {
    conn: C,
    config: E2eConfig,
    sessions: Mutex<TtlCache<SessionAddr, Session<C::Addr>>>,
    counters: Counters,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close: CloseSignal,
}

impl<C: PacketConn> E2eSocket<C> {
    /// Wraps `conn`. Must be called from within a tokio runtime.
    pub fn new(conn: C, config: E2eConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let inner = Arc::new(Inner {
            conn,
            sessions: Mutex::new(TtlCache::new(
                config.session_ttl.as_millis() as u64,
                config.session_capacity,
            )),
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

    /// Creates a session with a random address and no paths.
    pub fn new_session(&self) -> SessionAddr {
        let addr = SessionAddr::random();
        let session = Session::new(addr, &self.inner.config);
        self.inner.sessions.lock().insert(addr, session, now_ms());
        addr
    }

    /// Makes `path` available to `session`, creating the session if needed.
    pub fn add_path(&self, session: SessionAddr, path: C::Addr) {
        let now = now_ms();
        let mut sessions = self.inner.sessions.lock();
        if !sessions.contains_key(&session, now) {
            sessions.insert(session, Session::new(session, &self.inner.config), now);
        }
        if let Some(s) = sessions.get_mut(&session, now) {
            s.add_path(path);
            debug!(?session, paths = s.paths().count(), "e2e: path added");
        }
    }

    /// Returns the paths known for `session`, in the order they were added.
    pub fn paths(&self, session: SessionAddr) -> Vec<C::Addr> {
        let now = now_ms();
        self.inner
            .sessions
            .lock()
            .get(&session, now)
            .map(|s| s.paths().cloned().collect())
            .unwrap_or_default()
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
            debug!("e2e: socket closed");
        }
        self.recv_task.abort();
    }

    /// Returns a reference to the underlying socket.
    pub fn inner_conn(&self) -> &C {
        &self.inner.conn
    }
}

impl<C: PacketConn> PacketConn for E2eSocket<C> {
    type Addr = SessionAddr;

    async fn send_to(&self, buf: &[u8], dest: &SessionAddr) -> io::Result<usize> {
        let inner = &self.inner;
        guarded(&inner.write_deadline, &inner.close, inner.send(buf, *dest)).await
    }

    async fn recv_from(&self) -> io::Result<(Vec<u8>, SessionAddr)> {
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

impl<C: PacketConn> Drop for E2eSocket<C> {
    fn drop(&mut self) {
        self.inner.close.close();
        self.recv_task.abort();
    }
}

impl<C: PacketConn> Debug for E2eSocket<C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("E2eSocket")
            .field("sessions", &self.inner.sessions.lock().len())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<C: PacketConn> Inner<C> {
    /// Succeeds if at least one path accepted the datagram.
    async fn send(&self, buf: &[u8], dest: SessionAddr) -> io::Result<usize> {
        let datagrams = {
            let now = now_ms();
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(&dest, now).ok_or(Error::PathUnknown)?;
            session.prepare_send(buf, now)?
        };

        let mut last_err = None;
        let mut delivered = false;
        for (wire, path) in datagrams {
            match self.conn.send_to(&wire, &path).await {
                Ok(_) => {
                    delivered = true;
                    Counters::bump(&self.counters.packets_sent);
                }
                Err(e) => {
                    trace!(?path, error = %e, "e2e: path send failed");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if !delivered => Err(e),
            _ => Ok(buf.len()),
        }
    }

    /// Feeds one datagram from `from` through its session and returns the
    /// bodies that became readable.
    fn process(&self, wire: &[u8], from: C::Addr) -> Vec<(Vec<u8>, SessionAddr)> {
        let packet = match E2ePacket::decode(wire) {
            Ok(packet) => packet,
            Err(e) => {
                Counters::bump(&self.counters.dropped_decode);
                trace!(?from, error = %e, "e2e: dropping undecodable datagram");
                return Vec::new();
            }
        };

        let now = now_ms();
        let addr = packet.session;
        let mut sessions = self.sessions.lock();
        if !sessions.contains_key(&addr, now) {
            if !self.config.auto_create {
                Counters::bump(&self.counters.dropped_decode);
                trace!(session = ?addr, "e2e: dropping datagram for unknown session");
                return Vec::new();
            }
            sessions.insert(addr, Session::new(addr, &self.config), now);
            debug!(session = ?addr, ?from, "e2e: new session");
        }
        let Some(session) = sessions.get_mut(&addr, now) else {
            return Vec::new();
        };

        match session.process(packet, from, now) {
            Processed::Enqueued => {}
            Processed::Duplicate => Counters::bump(&self.counters.dropped_duplicate),
            Processed::Stale => Counters::bump(&self.counters.dropped_decode),
        }
        let mut ready = Vec::new();
        session.flush(|body| ready.push((body, addr)));
        ready
    }
}

async fn recv_loop<C: PacketConn>(inner: Arc<Inner<C>>, tx: mpsc::Sender<(Vec<u8>, SessionAddr)>) {
    loop {
        let received = tokio::select! {
            res = inner.conn.recv_from() => res,
            _ = inner.close.closed() => return,
        };
        let (wire, from) = match received {
            Ok(datagram) => datagram,
            Err(e) if is_transient(&e) => {
                trace!(error = %e, "e2e: transient receive error");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "e2e: underlying socket failed, closing");
                inner.close.close();
                return;
            }
        };

        for (body, session) in inner.process(&wire, from) {
            match tx.try_send((body, session)) {
                Ok(()) => Counters::bump(&inner.counters.packets_received),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    Counters::bump(&inner.counters.dropped_backpressure);
                    warn!(?session, "e2e: read queue full, dropping newest datagram");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return,
            }
        }
    }
}

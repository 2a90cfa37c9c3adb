use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use pin_project_lite::pin_project;
use rand::Rng;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, warn};

use super::{
    handshake::{self, SessionKeys},
    transport::{RecordReader, RecordWriter},
};
use crate::{config::Cshirt2Config, error::Error, io_adapter::RecordDriver};

pin_project! {
    /// An obfuscated stream between a client and a TCP bridge.
    ///
    /// Created with [`connect`] on the client and [`accept`] (or a
    /// [`Cshirt2Listener`]) on the bridge. Once open it behaves like the
    /// underlying stream. A record whose MAC does not verify kills the stream
    /// for good.
    ///
    /// [`connect`]: Cshirt2Stream::connect
    /// [`accept`]: Cshirt2Stream::accept
    #[derive(Debug)]
    pub struct Cshirt2Stream<IO> {
        stream: IO,
        driver: RecordDriver<RecordReader, RecordWriter>,
    }
}

impl<IO> Cshirt2Stream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn open(stream: IO, keys: SessionKeys) -> Self {
        Self {
            stream,
            driver: RecordDriver::new(
                RecordReader::new(&keys.rx.cipher, &keys.rx.mac),
                RecordWriter::new(&keys.tx.cipher, &keys.tx.mac),
            ),
        }
    }

    /// Runs the client handshake with a bridge that knows `config`'s cookie.
    pub async fn connect(mut stream: IO, config: &Cshirt2Config) -> io::Result<Self> {
        let keys = handshake::client(&mut stream, config).await?;
        Ok(Self::open(stream, keys))
    }

    /// Runs the bridge side of the handshake.
    ///
    /// On failure the stream is shut down after a random delay of up to
    /// [`with_max_delay_before_shutdown`], and the error tells a bad MAC
    /// ([`AuthError::BadHandshakeMac`]) apart from a replayed handshake
    /// ([`AuthError::ActiveProbing`]). A client that has not finished within
    /// [`with_handshake_timeout`] fails with [`Error::Timeout`] the same way.
    ///
    /// [`with_max_delay_before_shutdown`]: Cshirt2Config::with_max_delay_before_shutdown
    /// [`with_handshake_timeout`]: Cshirt2Config::with_handshake_timeout
    /// [`AuthError::BadHandshakeMac`]: crate::error::AuthError::BadHandshakeMac
    /// [`AuthError::ActiveProbing`]: crate::error::AuthError::ActiveProbing
    pub async fn accept(mut stream: IO, config: &Cshirt2Config) -> io::Result<Self> {
        let pending = timeout(config.handshake_timeout, handshake::server(&mut stream, config));
        let res = match pending.await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout.into()),
        };
        match res {
            Ok(keys) => Ok(Self::open(stream, keys)),
            Err(e) => {
                // Close after a random delay; the timing must not reveal why.
                let max = config.max_delay_before_shutdown.as_millis() as u64;
                let delay = rand::rng().random_range(0..=max);
                debug!(error = %e, delay_ms = delay, "cshirt2: handshake failed");
                sleep(Duration::from_millis(delay)).await;
                let _ = stream.shutdown().await;
                Err(e)
            }
        }
    }
}

impl<IO> Cshirt2Stream<IO> {
    /// Returns a reference to the internal stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }
}

impl<IO> AsyncRead for Cshirt2Stream<IO>
where
    IO: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.project();
        me.driver.poll_read(me.stream, cx, buf)
    }
}

impl<IO> AsyncWrite for Cshirt2Stream<IO>
where
    IO: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let me = self.project();
        me.driver.poll_write(me.stream, cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.project();
        me.driver.poll_flush(me.stream, cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

type Accepted = (Cshirt2Stream<TcpStream>, SocketAddr);

/// A TCP bridge listener.
///
/// Every incoming connection is handshaken in its own task, so a slow or
/// hostile client never holds up the others. Only connections that complete
/// the handshake come out of [`accept`](Cshirt2Listener::accept).
#[derive(Debug)]
pub struct Cshirt2Listener {
    local_addr: SocketAddr,
    rx: AsyncMutex<mpsc::Receiver<Accepted>>,
    accept_task: JoinHandle<()>,
}

impl Cshirt2Listener {
    /// Binds a TCP listener on `addr`.
    pub async fn bind(addr: impl ToSocketAddrs, config: Cshirt2Config) -> io::Result<Self> {
        Self::from_listener(TcpListener::bind(addr).await?, config)
    }

    /// Serves cshirt2 on an already bound listener.
    pub fn from_listener(listener: TcpListener, config: Cshirt2Config) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(128);
        let accept_task = tokio::spawn(accept_loop(listener, Arc::new(config), tx));
        Ok(Self {
            local_addr,
            rx: AsyncMutex::new(rx),
            accept_task,
        })
    }

    /// Returns the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next connection that completes the handshake.
    pub async fn accept(&self) -> io::Result<Accepted> {
        self.rx.lock().await.recv().await.ok_or(Error::Closed.into())
    }
}

impl Drop for Cshirt2Listener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn accept_loop(listener: TcpListener, config: Arc<Cshirt2Config>, tx: mpsc::Sender<Accepted>) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "cshirt2: accept failed");
                sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let config = config.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            match Cshirt2Stream::accept(tcp, &config).await {
                Ok(stream) => {
                    let _ = tx.send((stream, peer)).await;
                }
                Err(e) => debug!(%peer, error = %e, "cshirt2: rejected connection"),
            }
        });
    }
}

use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use std::io;

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::record::{RecordReader, RecordWriter};
use crate::{
    crypto::derive_key,
    error::DecodeError,
    io_adapter::RecordDriver,
    specification::{TSS_HANDSHAKE_LEN, TSS_MAGIC},
};

pin_project! {
    /// A TinySS channel over any reliable, ordered byte stream.
    ///
    /// [`TssStream`] implements [`AsyncRead`] and [`AsyncWrite`], so once
    /// [`handshake`] returns it is used like a [`TcpStream`]. The first
    /// authentication or framing failure kills the stream: that call and
    /// every later one fail with the same error.
    ///
    /// [`handshake`]: TssStream::handshake
    /// [`TcpStream`]: tokio::net::TcpStream
    #[derive(Debug)]
    pub struct TssStream<IO> {
        stream: IO,
        driver: RecordDriver<RecordReader, RecordWriter>,
        shared_secret: Zeroizing<[u8; 32]>,
    }
}

impl<IO> TssStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    /// Runs the TinySS handshake over `stream`.
    ///
    /// Both sides send `"TinySS-1" || epk` and then read the peer's, so it
    /// does not matter who speaks first. Fails with [`DecodeError::BadMagic`]
    /// if the peer does not speak TinySS.
    pub async fn handshake(mut stream: IO) -> io::Result<Self> {
        let esk = StaticSecret::random();
        let epk = PublicKey::from(&esk).to_bytes();

        let mut hello = [0u8; TSS_HANDSHAKE_LEN];
        hello[..TSS_MAGIC.len()].copy_from_slice(TSS_MAGIC);
        hello[TSS_MAGIC.len()..].copy_from_slice(&epk);
        stream.write_all(&hello).await?;
        stream.flush().await?;

        let mut theirs = [0u8; TSS_HANDSHAKE_LEN];
        stream.read_exact(&mut theirs).await?;
        let (magic, their_epk) = theirs.split_at(TSS_MAGIC.len());
        if magic != TSS_MAGIC {
            let mut received = [0u8; 8];
            received.copy_from_slice(magic);
            return Err(DecodeError::BadMagic { received }.into());
        }
        let mut peer = [0u8; 32];
        peer.copy_from_slice(their_epk);
        // Our own hello reflected back would give both directions one key.
        if peer == epk {
            return Err(DecodeError::MalformedPacket.into());
        }

        let shared = esk.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(DecodeError::MalformedPacket.into());
        }
        let shared_secret = Zeroizing::new(shared.to_bytes());

        let s1 = derive_key(&shared_secret[..], b"tinyss-s1");
        let s2 = derive_key(&shared_secret[..], b"tinyss-s2");
        let (rx, tx) = if epk < peer { (s1, s2) } else { (s2, s1) };
        debug!("tss: handshake complete");

        Ok(Self {
            stream,
            driver: RecordDriver::new(RecordReader::new(&rx), RecordWriter::new(&tx)),
            shared_secret,
        })
    }
}

impl<IO> TssStream<IO> {
    /// The X25519 shared secret of this channel.
    ///
    /// Both ends see the same value, so an exit can sign it to prove which
    /// channel it terminates.
    pub fn shared_secret(&self) -> &[u8; 32] {
        &self.shared_secret
    }

    /// Returns a reference to the internal stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the internal stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }
}

impl<IO> AsyncRead for TssStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
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

impl<IO> AsyncWrite for TssStream<IO>
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

#[cfg(test)]
mod test {
    use tokio::{
        io::duplex,
        net::{TcpListener, TcpStream},
        spawn,
    };

    use super::*;
    use crate::error::{AuthError, Error, downcast};

    #[tokio::test]
    async fn test_echo_over_tcp() {
        const DATA_LEN: usize = 65536 * 3 + 17;
        let data: Vec<u8> = (0..DATA_LEN).map(|i| i as u8).collect();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = spawn(async move {
            let (inner, _) = listener.accept().await.unwrap();
            let mut stream = TssStream::handshake(inner).await.unwrap();
            let mut buf = vec![0u8; DATA_LEN];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            *stream.shared_secret()
        });

        let mut client = TssStream::handshake(TcpStream::connect(addr).await.unwrap())
            .await
            .unwrap();
        client.write_all(&data).await.unwrap();
        client.flush().await.unwrap();
        let mut echoed = vec![0u8; DATA_LEN];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, data);

        assert_eq!(server.await.unwrap(), *client.shared_secret());
    }

    #[tokio::test]
    async fn test_small_reads_keep_residue() {
        let (a, b) = duplex(4096);
        let (a, b) = tokio::join!(TssStream::handshake(a), TssStream::handshake(b));
        let (mut a, mut b) = (a.unwrap(), b.unwrap());

        a.write_all(b"0123456789").await.unwrap();
        a.flush().await.unwrap();
        let mut three = [0u8; 3];
        b.read_exact(&mut three).await.unwrap();
        assert_eq!(&three, b"012");
        let mut rest = [0u8; 7];
        b.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"3456789");
    }

    #[tokio::test]
    async fn test_bad_magic() {
        let (a, mut b) = duplex(4096);
        let client = spawn(TssStream::handshake(a));
        b.write_all(&[0u8; TSS_HANDSHAKE_LEN]).await.unwrap();
        let err = client.await.unwrap().unwrap_err();
        assert_eq!(
            downcast(&err),
            Some(&Error::Decode(DecodeError::BadMagic { received: [0u8; 8] }))
        );
    }

    #[tokio::test]
    async fn test_forged_record_kills_stream() {
        let (a, mut b) = duplex(4096);
        let client = spawn(TssStream::handshake(a));

        let mut hello = [0u8; TSS_HANDSHAKE_LEN];
        b.read_exact(&mut hello).await.unwrap();
        let esk = StaticSecret::random();
        let mut reply = TSS_MAGIC.to_vec();
        reply.extend_from_slice(PublicKey::from(&esk).as_bytes());
        b.write_all(&reply).await.unwrap();

        let mut client = client.await.unwrap().unwrap();
        b.write_all(&[0, 20]).await.unwrap();
        b.write_all(&[0x5a; 20]).await.unwrap();

        let mut buf = [0u8; 16];
        let expected = Error::Auth(AuthError::AeadOpenFailed);
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(downcast(&err), Some(&expected));
        // Dead is sticky for both directions.
        let err = client.read(&mut buf).await.unwrap_err();
        assert_eq!(downcast(&err), Some(&expected));
        let err = client.write(b"x").await.unwrap_err();
        assert_eq!(downcast(&err), Some(&expected));
    }

    #[tokio::test]
    async fn test_eof() {
        let (a, b) = duplex(4096);
        let (a, b) = tokio::join!(TssStream::handshake(a), TssStream::handshake(b));
        let (mut a, b) = (a.unwrap(), b.unwrap());
        drop(b);
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).await.unwrap(), 0);
    }
}

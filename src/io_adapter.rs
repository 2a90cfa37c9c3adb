//! Drives the sans-I/O record state machines from tokio's poll-based I/O.
//!
//! TinySS and cshirt2 both frame a byte stream into records. Their framing
//! lives in plain `read_wire`/`write_wire` state machines over [`Read`] and
//! [`Write`]; [`RecordDriver`] turns those into `poll_read`, `poll_write` and
//! `poll_flush` by handing them an adapter whose `Pending` shows up as
//! `WouldBlock`.
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use std::io::{self, ErrorKind, Read, Write};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::{Error, downcast};

/// The receive half of a record protocol.
pub(crate) trait RecordRead {
    /// Reads one record off `wire`. `Ok(0)` means end of stream.
    fn read_wire(&mut self, wire: &mut dyn Read) -> io::Result<usize>;

    /// Unread plaintext of the current record. `WouldBlock` once it has all
    /// been consumed; an empty slice at end of stream.
    fn fill_buf(&mut self) -> io::Result<&[u8]>;

    fn consume(&mut self, amt: usize);
}

/// The send half of a record protocol.
pub(crate) trait RecordWrite {
    /// Seals a prefix of `plaintext` into the next record and returns its
    /// length. Only called while no record is pending.
    fn push(&mut self, plaintext: &[u8]) -> usize;

    /// Writes out the pending record. `Ok(0)` means the wire is closed.
    fn write_wire(&mut self, wire: &mut dyn Write) -> io::Result<usize>;
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///  WaitData <---+
///    |          |
///    V          |
///   Write ------+
/// ```
#[derive(Copy, Clone, Debug)]
enum WriteState {
    WaitData,
    Write { written: usize },
}

/// Couples a record reader and writer with sticky failure.
///
/// After any error other than `WouldBlock`, every later call fails too: with
/// the same transport [`Error`] if there was one, with [`Error::Closed`]
/// after a plain I/O failure.
#[derive(Debug)]
pub(crate) struct RecordDriver<R, W> {
    reader: R,
    writer: W,
    write_state: WriteState,
    dead: Option<Error>,
}

impl<R: RecordRead, W: RecordWrite> RecordDriver<R, W> {
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            write_state: WriteState::WaitData,
            dead: None,
        }
    }

    fn check(&self) -> io::Result<()> {
        match &self.dead {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    fn kill(&mut self, e: io::Error) -> io::Error {
        self.dead = Some(downcast(&e).cloned().unwrap_or(Error::Closed));
        e
    }

    pub(crate) fn poll_read<IO: AsyncRead + Unpin>(
        &mut self,
        io: &mut IO,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.check()?;
        loop {
            match self.reader.fill_buf() {
                Ok(data) => {
                    let k = core::cmp::min(data.len(), buf.remaining());
                    buf.put_slice(&data[..k]);
                    self.reader.consume(k);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Poll::Ready(Err(self.kill(e))),
            }

            let mut wire = SyncReadAdapter {
                io: &mut *io,
                cx: &mut *cx,
            };
            match self.reader.read_wire(&mut wire) {
                // EOF; `fill_buf` reports it from now on.
                Ok(0) => return Poll::Ready(Ok(())),
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(self.kill(e))),
            }
        }
    }

    pub(crate) fn poll_write<IO: AsyncWrite + Unpin>(
        &mut self,
        io: &mut IO,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.check()?;
        loop {
            match self.write_state {
                WriteState::WaitData => {
                    let written = self.writer.push(buf);
                    self.write_state = WriteState::Write { written };
                }
                WriteState::Write { written } => {
                    let mut wire = SyncWriteAdapter {
                        io: &mut *io,
                        cx: &mut *cx,
                    };
                    return match self.writer.write_wire(&mut wire) {
                        Ok(0) => Poll::Ready(Err(self.kill(ErrorKind::WriteZero.into()))),
                        Ok(_) => {
                            self.write_state = WriteState::WaitData;
                            Poll::Ready(Ok(written))
                        }
                        Err(e) if e.kind() == ErrorKind::WouldBlock => Poll::Pending,
                        Err(e) => Poll::Ready(Err(self.kill(e))),
                    };
                }
            }
        }
    }

    pub(crate) fn poll_flush<IO: AsyncWrite + Unpin>(
        &mut self,
        io: &mut IO,
        cx: &mut Context<'_>,
    ) -> Poll<io::Result<()>> {
        self.check()?;
        if let WriteState::Write { .. } = self.write_state {
            let mut wire = SyncWriteAdapter {
                io: &mut *io,
                cx: &mut *cx,
            };
            match self.writer.write_wire(&mut wire) {
                Ok(0) => return Poll::Ready(Err(self.kill(ErrorKind::WriteZero.into()))),
                Ok(_) => self.write_state = WriteState::WaitData,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(self.kill(e))),
            }
        }
        Pin::new(io).poll_flush(cx)
    }
}

/// An adapter that implements a [`Read`] interface for [`AsyncRead`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
///
/// The credit goes to the [futures-rustls](https://github.com/rustls/futures-rustls)
/// project for this adapter.
pub(crate) struct SyncReadAdapter<'a, 'b, T> {
    pub(crate) io: &'a mut T,
    pub(crate) cx: &'a mut Context<'b>,
}

impl<T: AsyncRead + Unpin> Read for SyncReadAdapter<'_, '_, T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        match Pin::new(&mut self.io).poll_read(self.cx, &mut buf) {
            Poll::Ready(Ok(())) => Ok(buf.filled().len()),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

/// An adapter that implements a [`Write`] interface for [`AsyncWrite`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
pub(crate) struct SyncWriteAdapter<'a, 'b, T> {
    pub(crate) io: &'a mut T,
    pub(crate) cx: &'a mut Context<'b>,
}

impl<T: AsyncWrite + Unpin> Write for SyncWriteAdapter<'_, '_, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match Pin::new(&mut self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match Pin::new(&mut self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

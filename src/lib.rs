//! Roamwire is an obfuscated, authenticated packet transport built to
//! survive deep packet inspection, active probing and client mobility.
//!
//! ## Layers
//!
//! The crate is a stack of small layers. Packet layers implement
//! [`PacketConn`] and wrap the one below; stream layers implement tokio's
//! [`AsyncRead`] and [`AsyncWrite`].
//!
//! * [`obfs::ObfsSocket`]
//!
//!   UDP framing that is indistinguishable from random bytes to anyone who
//!   does not know the bridge's [`Cookie`]. The first datagram of a flow is a
//!   padded handshake; everything after it is an XChaCha20-Poly1305 packet.
//!   Tunnels are bound to their key, not to an address, so a client that
//!   changes address keeps its tunnel.
//!
//! * [`e2e::E2eSocket`]
//!
//!   A session overlay that spreads one logical flow over several paths,
//!   for example several bridges. It scores paths by measured round trip
//!   time, duplicates traffic while a token bucket allows, and suppresses
//!   duplicates on the receiving side.
//!
//! * [`Wrapper`] and [`BatchedUdp`]
//!
//!   The sockets at the bottom: the client's wrapper gives every
//!   destination its own short-lived socket, and the bridge's batched socket
//!   queues its sends.
//!
//! * [`tss::TssStream`]
//!
//!   TinySS, an X25519 and ChaCha20-Poly1305 record layer over any reliable
//!   stream. Its shared secret is what [`exit`] binds to an exit's pinned
//!   Ed25519 identity.
//!
//! * [`cshirt2::Cshirt2Stream`]
//!
//!   Obfuscated framing for TCP bridges, with a UniformDH handshake,
//!   ratcheting record MACs and replay detection for active probes.
//!
//! The [`glue`] module stacks these for the client, bridge and exit roles,
//! and [`binder`] names the interface to the bridge directory.
//!
//! ## Quick Start
//!
//! ```no_run
//! use roamwire::{Cookie, PacketConn, glue};
//!
//! # async fn run() -> std::io::Result<()> {
//! let cookie = Cookie::from([7u8; 32]);
//! let bridge = glue::listen_udp("0.0.0.0:4000", cookie.clone()).await?;
//!
//! let (client, session) = glue::dial_udp("192.0.2.1:4000".parse().unwrap(), cookie)?;
//! client.send_to(b"hello", &session).await?;
//! # let _ = bridge;
//! # Ok(())
//! # }
//! ```
//!
//! ## Errors
//!
//! Every fallible operation returns [`std::io::Result`]. Errors that come
//! from the protocol itself rather than from the operating system can be
//! recovered with [`downcast`].
//!
//! Note: the handshakes rely on system time. Clocks of both ends must agree
//! to within a few minutes.
//!
//! [`AsyncRead`]: tokio::io::AsyncRead
//! [`AsyncWrite`]: tokio::io::AsyncWrite
#![warn(missing_debug_implementations, missing_docs, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

/// Decompose `io::Result<usize>`.
///
/// Keep the number of non-negative bytes successfully read or write,
/// return error and EOF (i.e. Ok(0)).
macro_rules! handle_io_result {
    ($io_result:expr) => {
        match $io_result {
            Ok(n) if n > 0 => n,
            Ok(_) => return Ok(0),
            Err(e) => return Err(e),
        }
    };
}

pub mod binder;
pub mod config;
pub mod cshirt2;
pub mod e2e;
pub mod error;
pub mod exit;
pub mod glue;
pub mod obfs;
pub mod tss;

mod batch;
mod cache;
mod conn;
mod crypto;
mod io_adapter;
mod replay_cache;
mod specification;
mod time;
mod token_bucket;
mod uniform_dh;
mod wrapper;

pub use batch::BatchedUdp;
pub use config::{Cshirt2Config, E2eConfig, ObfsConfig, WrapperConfig};
pub use conn::{PacketConn, Stats};
pub use crypto::Cookie;
pub use error::{Error, downcast};
pub use replay_cache::ReplayCache;
pub use wrapper::Wrapper;

#[cfg(test)]
mod test {
    use std::io::{self, ErrorKind, Read, Write};

    #[derive(Debug)]
    pub(crate) struct MockStream {
        pub(crate) buf: Vec<u8>,
        pub(crate) eof: bool,
    }

    impl MockStream {
        #[allow(unused)]
        pub(crate) fn set_eof(&mut self) {
            self.buf.clear();
            self.eof = true;
        }

        #[allow(unused)]
        pub(crate) fn clear(&mut self) {
            self.buf.clear();
            self.eof = false;
        }
    }

    impl Default for MockStream {
        fn default() -> Self {
            Self {
                buf: Vec::with_capacity(65536),
                eof: false,
            }
        }
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.eof {
                return Ok(0);
            }
            if self.buf.is_empty() {
                return Err(io::Error::new(ErrorKind::WouldBlock, "empty buffer"));
            }
            let n = core::cmp::min(buf.len(), self.buf.len());
            buf[..n].copy_from_slice(&self.buf[..n]);
            self.buf = self.buf.split_off(n);
            Ok(n)
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.eof {
                return Ok(0);
            }
            self.buf.extend(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}

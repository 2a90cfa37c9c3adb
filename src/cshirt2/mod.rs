//! cshirt2: obfuscated framing for TCP bridges.
//!
//! # Handshake
//!
//! Each side sends a 1536-bit UniformDH public key followed by a 32-byte MAC:
//!
//! ```text
//! +---------------------------+----------------------------------------+
//! | pk (192)                  | Blake2b-256(key = mac_key, msg = pk)   |
//! +---------------------------+----------------------------------------+
//!
//! mac_key = Blake2b-256(key = cookie, msg = ascii(unix_secs / 60))
//! ```
//!
//! The server accepts any epoch within ten of its own and answers under the
//! epoch key the client used. It also remembers every client key it has
//! accepted for ten minutes; a repeat is an active probe replaying a
//! captured handshake and is rejected with
//! [`AuthError::ActiveProbing`](crate::error::AuthError::ActiveProbing).
//!
//! # Records
//!
//! ```text
//! +----------+---------------+------------------------------------------+
//! | mac (16) | enc_len (2)   | enc_body (enc_len)                       |
//! +----------+---------------+------------------------------------------+
//!                            | inner_len (2) | inner | padding          |
//!                            +---------------+-------+------------------+
//! ```
//!
//! `enc_len` and `enc_body` are encrypted with one continuous ChaCha20
//! keystream per direction. The MAC is a keyed Blake2b-128 over
//! `enc_len || enc_body`; after every record the MAC key is replaced by
//! `Blake2b-256(key = mac_key, msg = "")`, so a dropped, replayed or
//! reordered record fails verification.
//!
//! Writes of up to 3000 bytes carry `uniform[0, 512)` bytes of padding.
mod handshake;
mod stream;
mod transport;

pub use stream::{Cshirt2Listener, Cshirt2Stream};

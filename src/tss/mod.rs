//! TinySS: a small X25519 + ChaCha20-Poly1305 record layer.
//!
//! TinySS carries end-to-end traffic between a client and an exit, on top of
//! whatever reliable stream the lower layers provide (an E2E-over-OBFS
//! tunnel, cshirt2 over TCP, or plain TCP in tests).
//!
//! # Handshake
//!
//! Each side sends `"TinySS-1" || epk` (40 bytes) and reads the peer's. The
//! X25519 shared secret `ss` yields two directional keys,
//! `HMAC-SHA256(ss, "tinyss-s1")` and `HMAC-SHA256(ss, "tinyss-s2")`. The side
//! with the lexicographically smaller ephemeral key receives on the first and
//! sends on the second; its peer does the reverse.
//!
//! # Records
//!
//! ```text
//! +--------------+---------------------------+-----------+
//! | len (u16 BE) | ciphertext (len - 16)     | tag (16)  |
//! +--------------+---------------------------+-----------+
//! ```
//!
//! `len` covers ciphertext and tag and is at most 32 KiB + 16. The nonce of
//! the n-th record in a direction is n as a big-endian `u64` followed by four
//! zero bytes, so dropped, replayed or reordered records fail to open.
//!
//! Any decode or authentication failure is fatal: the stream answers every
//! later read and write with the same error.
mod record;
mod stream;

pub use stream::TssStream;

//! OBFS: an obfuscated datagram layer.
//!
//! To an observer without the bridge cookie every datagram is uniformly
//! random bytes. A flow starts with a Hello in each direction that carries
//! an X25519 ephemeral key sealed under a time-bucketed cookie MAC; after
//! that every datagram is XChaCha20-Poly1305 with a random nonce.
//!
//! Peer state per source address:
//!
//! ```text
//!
//!   Unknown --(send)--> Pending --(recv Hello)--> Established --(TTL)--> Gone
//!      |                                               ^
//!      +------------(recv Hello, server only)----------+
//!
//! ```
//!
//! A tunnel also has a [`TunnelId`] derived from its shared secret. When a
//! datagram from an unknown address opens under an existing tunnel's key,
//! the tunnel moves to the new address and replies follow it.
mod socket;
mod tunnel;

pub use socket::{ObfsAddr, ObfsSocket};
pub use tunnel::TunnelId;

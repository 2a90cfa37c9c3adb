//! E2E: a multipath session layer on top of any packet socket.
//!
//! A session is named by a random 16-byte [`SessionAddr`] rather than by
//! where its packets come from, so one session can use several OBFS tunnels
//! (different bridges, different interfaces) at once. Each path keeps its
//! own sequence numbers and round-trip estimate:
//!
//! ```text
//!
//!   send ──> duplication budget left? ──yes──> copy on every path
//!                     │
//!                     no
//!                     v
//!            last selection older than 500 ms? ──yes──> pick lowest score
//!                     │                                        │
//!                     no                                       │
//!                     v                                        v
//!              keep last path  ─────────────────────────> one copy
//!
//!   score = sqrt((now - last_recv) * max(50, ping))
//!
//! ```
//!
//! No ordering is promised across paths and nothing is retransmitted; the
//! stream layer above supplies reliability.
mod packet;
mod session;
mod socket;

pub use packet::SessionAddr;
pub use socket::E2eSocket;

//! The binder: the directory that hands out bridges and tickets.
//!
//! The binder service proper (accounts, captcha, blind signing, the
//! domain-fronted HTTP front end) runs outside this crate. [`Binder`] names
//! the calls the transport makes against it, and [`MemoryBinder`] is an
//! in-process implementation for tests and demos.
//!
//! A [`Ticket`] is a message signed under the binder's key for a [`Tier`].
//! Whoever holds the [`TicketKey`] for that tier can check it offline; the
//! binder additionally refuses to redeem the same ticket twice.
use core::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
};
use std::{
    collections::{HashMap, HashSet},
    io::{self, ErrorKind},
    net::SocketAddr,
};

use aws_lc_rs::signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    crypto::{Cookie, random_array},
    error::{AuthError, DecodeError},
    time::unix_secs,
};

/// Service level of a user, and of the tickets issued to them.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Tier {
    /// Rate-limited service.
    Free,
    /// Unlimited service.
    Paid,
}

impl Tier {
    fn to_u8(self) -> u8 {
        match self {
            Tier::Free => 0,
            Tier::Paid => 1,
        }
    }
}

impl TryFrom<u8> for Tier {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tier::Free),
            1 => Ok(Tier::Paid),
            _ => Err(DecodeError::MalformedPacket),
        }
    }
}

impl Display for Tier {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Tier::Free => write!(f, "free"),
            Tier::Paid => write!(f, "paid"),
        }
    }
}

impl FromStr for Tier {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Tier::Free),
            "paid" => Ok(Tier::Paid),
            _ => Err(DecodeError::MalformedPacket),
        }
    }
}

/// A bridge as listed by the binder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BridgeDescriptor {
    /// The bridge's cookie.
    pub cookie: Cookie,
    /// Where the bridge listens.
    pub host: SocketAddr,
    /// Unix seconds of the bridge's last announcement.
    pub last_seen: u64,
}

/// The binder's public key for one tier.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TicketKey([u8; 32]);

impl TicketKey {
    /// Wraps a raw Ed25519 public key.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw Ed25519 public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Debug for TicketKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "TicketKey({:02x?})", &self.0[..4])
    }
}

/// Proof that the holder is entitled to service at some tier.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Ticket {
    /// The tier the ticket was issued for.
    pub tier: Tier,
    /// The signed message.
    pub ubmsg: Vec<u8>,
    /// The binder's signature over `ubmsg`.
    pub ubsig: Vec<u8>,
}

impl Ticket {
    /// Checks the ticket's signature against the binder's key for its tier.
    pub fn verify(&self, key: &TicketKey) -> Result<(), AuthError> {
        UnparsedPublicKey::new(&ED25519, key.as_bytes())
            .verify(&self.ubmsg, &self.ubsig)
            .map_err(|_| AuthError::TicketInvalid)
    }

    /// `tier (1) || u16_be len || ubmsg || u16_be len || ubsig`
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + self.ubmsg.len() + self.ubsig.len());
        out.push(self.tier.to_u8());
        for field in [&self.ubmsg, &self.ubsig] {
            out.extend_from_slice(&(field.len() as u16).to_be_bytes());
            out.extend_from_slice(field);
        }
        out
    }

    pub(crate) fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        let (&tier, rest) = buf
            .split_first()
            .ok_or(DecodeError::Truncated { len: buf.len() })?;
        let (ubmsg, rest) = take_field(rest, buf.len())?;
        let (ubsig, rest) = take_field(rest, buf.len())?;
        if !rest.is_empty() {
            return Err(DecodeError::MalformedPacket);
        }
        Ok(Self {
            tier: Tier::try_from(tier)?,
            ubmsg: ubmsg.to_vec(),
            ubsig: ubsig.to_vec(),
        })
    }
}

fn take_field(buf: &[u8], total: usize) -> Result<(&[u8], &[u8]), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::Truncated { len: total });
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[2..];
    if rest.len() < len {
        return Err(DecodeError::Truncated { len: total });
    }
    Ok(rest.split_at(len))
}

/// The calls the transport makes against the binder.
///
/// Failures come back as `io::Error`; authentication failures downcast to
/// [`Error::Auth`](crate::Error::Auth).
pub trait Binder: Send + Sync + 'static {
    /// Announces a bridge, or refreshes its `last_seen`.
    fn add_bridge(
        &self,
        cookie: Cookie,
        host: SocketAddr,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Lists bridges to a client holding a valid ticket.
    fn get_bridges(
        &self,
        ticket: &Ticket,
    ) -> impl Future<Output = io::Result<Vec<BridgeDescriptor>>> + Send;

    /// Spends a ticket. A ticket can be redeemed once.
    fn redeem_ticket(
        &self,
        tier: Tier,
        ubmsg: &[u8],
        ubsig: &[u8],
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Returns the key that tickets of `tier` verify under.
    fn get_ticket_key(&self, tier: Tier) -> impl Future<Output = io::Result<TicketKey>> + Send;

    /// Looks up a user's tier.
    fn get_tier(&self, user: &str, password: &str)
    -> impl Future<Output = io::Result<Tier>> + Send;
}

/// A [`Binder`] that keeps everything in memory.
///
/// Tickets are plain Ed25519 signatures over random messages rather than
/// blind signatures, which is indistinguishable to the transport.
pub struct MemoryBinder {
    free_key: Ed25519KeyPair,
    paid_key: Ed25519KeyPair,
    bridges: Mutex<HashMap<SocketAddr, BridgeDescriptor>>,
    users: Mutex<HashMap<String, ([u8; 32], Tier)>>,
    spent: Mutex<HashSet<[u8; 32]>>,
}

impl MemoryBinder {
    /// Creates a binder that signs tickets with the given per-tier keys.
    pub fn new(free_key: Ed25519KeyPair, paid_key: Ed25519KeyPair) -> Self {
        Self {
            free_key,
            paid_key,
            bridges: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            spent: Mutex::new(HashSet::new()),
        }
    }

    /// Creates a binder with fresh signing keys.
    pub fn generate() -> io::Result<Self> {
        let generate = || {
            Ed25519KeyPair::generate().map_err(|_| io::Error::other("ed25519 key generation failed"))
        };
        Ok(Self::new(generate()?, generate()?))
    }

    /// Registers a user account.
    pub fn add_user(&self, user: &str, password: &str, tier: Tier) {
        self.users
            .lock()
            .insert(user.to_owned(), (*blake3::hash(password.as_bytes()).as_bytes(), tier));
    }

    /// Signs a fresh ticket for `tier`.
    pub fn issue_ticket(&self, tier: Tier) -> Ticket {
        let ubmsg = random_array::<32>().to_vec();
        let ubsig = self.key(tier).sign(&ubmsg).as_ref().to_vec();
        Ticket { tier, ubmsg, ubsig }
    }

    fn key(&self, tier: Tier) -> &Ed25519KeyPair {
        match tier {
            Tier::Free => &self.free_key,
            Tier::Paid => &self.paid_key,
        }
    }

    fn ticket_key(&self, tier: Tier) -> TicketKey {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.key(tier).public_key().as_ref());
        TicketKey(bytes)
    }
}

impl Binder for MemoryBinder {
    async fn add_bridge(&self, cookie: Cookie, host: SocketAddr) -> io::Result<()> {
        debug!(%host, "binder: bridge announced");
        self.bridges.lock().insert(
            host,
            BridgeDescriptor {
                cookie,
                host,
                last_seen: unix_secs(),
            },
        );
        Ok(())
    }

    async fn get_bridges(&self, ticket: &Ticket) -> io::Result<Vec<BridgeDescriptor>> {
        ticket.verify(&self.ticket_key(ticket.tier))?;
        let mut bridges: Vec<_> = self.bridges.lock().values().cloned().collect();
        bridges.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.host.cmp(&b.host)));
        Ok(bridges)
    }

    async fn redeem_ticket(&self, tier: Tier, ubmsg: &[u8], ubsig: &[u8]) -> io::Result<()> {
        UnparsedPublicKey::new(&ED25519, self.ticket_key(tier).as_bytes())
            .verify(ubmsg, ubsig)
            .map_err(|_| AuthError::TicketInvalid)?;
        if !self.spent.lock().insert(*blake3::hash(ubmsg).as_bytes()) {
            debug!(%tier, "binder: ticket already spent");
            return Err(AuthError::TicketInvalid.into());
        }
        Ok(())
    }

    async fn get_ticket_key(&self, tier: Tier) -> io::Result<TicketKey> {
        Ok(self.ticket_key(tier))
    }

    async fn get_tier(&self, user: &str, password: &str) -> io::Result<Tier> {
        match self.users.lock().get(user) {
            Some((hash, tier)) if hash == blake3::hash(password.as_bytes()).as_bytes() => Ok(*tier),
            _ => Err(io::Error::new(ErrorKind::PermissionDenied, "bad credentials")),
        }
    }
}

impl Debug for MemoryBinder {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryBinder")
            .field("free_key", &self.ticket_key(Tier::Free))
            .field("paid_key", &self.ticket_key(Tier::Paid))
            .field("bridges", &self.bridges.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::{Error, downcast};

    #[test]
    fn test_tier_names() {
        assert_eq!(Tier::Free.to_string(), "free");
        assert_eq!("paid".parse::<Tier>(), Ok(Tier::Paid));
        assert!("gold".parse::<Tier>().is_err());
    }

    #[test]
    fn test_ticket_encoding() {
        let ticket = Ticket {
            tier: Tier::Paid,
            ubmsg: vec![1, 2, 3],
            ubsig: vec![9; 64],
        };
        let wire = ticket.encode();
        assert_eq!(wire.len(), 1 + 2 + 3 + 2 + 64);
        assert_eq!(Ticket::decode(&wire), Ok(ticket));

        assert_eq!(
            Ticket::decode(&wire[..wire.len() - 1]),
            Err(DecodeError::Truncated { len: wire.len() - 1 })
        );
        let mut trailing = wire.clone();
        trailing.push(0);
        assert_eq!(Ticket::decode(&trailing), Err(DecodeError::MalformedPacket));
        let mut bad_tier = wire;
        bad_tier[0] = 7;
        assert_eq!(Ticket::decode(&bad_tier), Err(DecodeError::MalformedPacket));
    }

    #[tokio::test]
    async fn test_ticket_verifies_under_its_tier_only() {
        let binder = MemoryBinder::generate().unwrap();
        let ticket = binder.issue_ticket(Tier::Free);

        let free = binder.get_ticket_key(Tier::Free).await.unwrap();
        let paid = binder.get_ticket_key(Tier::Paid).await.unwrap();
        assert_eq!(ticket.verify(&free), Ok(()));
        assert_eq!(ticket.verify(&paid), Err(AuthError::TicketInvalid));

        let mut forged = ticket.clone();
        forged.ubmsg[0] ^= 1;
        assert_eq!(forged.verify(&free), Err(AuthError::TicketInvalid));
    }

    #[tokio::test]
    async fn test_redeem_once() {
        let binder = MemoryBinder::generate().unwrap();
        let ticket = binder.issue_ticket(Tier::Paid);

        binder
            .redeem_ticket(ticket.tier, &ticket.ubmsg, &ticket.ubsig)
            .await
            .unwrap();
        let err = binder
            .redeem_ticket(ticket.tier, &ticket.ubmsg, &ticket.ubsig)
            .await
            .unwrap_err();
        assert_eq!(downcast(&err), Some(&Error::Auth(AuthError::TicketInvalid)));

        let other = binder.issue_ticket(Tier::Paid);
        let err = binder
            .redeem_ticket(Tier::Free, &other.ubmsg, &other.ubsig)
            .await
            .unwrap_err();
        assert_eq!(downcast(&err), Some(&Error::Auth(AuthError::TicketInvalid)));
    }

    #[tokio::test]
    async fn test_bridges_need_a_ticket() {
        let binder = MemoryBinder::generate().unwrap();
        let a: SocketAddr = "192.0.2.1:1000".parse().unwrap();
        let b: SocketAddr = "192.0.2.2:1000".parse().unwrap();
        binder.add_bridge(Cookie::from([1u8; 32]), a).await.unwrap();
        binder.add_bridge(Cookie::from([2u8; 32]), b).await.unwrap();
        binder.add_bridge(Cookie::from([3u8; 32]), a).await.unwrap();

        let ticket = binder.issue_ticket(Tier::Free);
        let bridges = binder.get_bridges(&ticket).await.unwrap();
        assert_eq!(bridges.len(), 2);
        let first = bridges.iter().find(|d| d.host == a).unwrap();
        assert_eq!(first.cookie, Cookie::from([3u8; 32]));

        let mut forged = ticket;
        forged.ubsig[0] ^= 1;
        let err = binder.get_bridges(&forged).await.unwrap_err();
        assert_eq!(downcast(&err), Some(&Error::Auth(AuthError::TicketInvalid)));
    }

    #[tokio::test]
    async fn test_get_tier() {
        let binder = MemoryBinder::generate().unwrap();
        binder.add_user("alice", "hunter2", Tier::Paid);
        assert_eq!(binder.get_tier("alice", "hunter2").await.unwrap(), Tier::Paid);

        let err = binder.get_tier("alice", "hunter3").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let err = binder.get_tier("bob", "hunter2").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }
}

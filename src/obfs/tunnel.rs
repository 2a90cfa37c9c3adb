//! Sans-I/O OBFS handshake and per-peer packet state.
use core::fmt::{Debug, Formatter};

use rand::Rng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    crypto::{Cookie, PacketCipher, SealedKeyCipher, derive_key, now_cookie, random_array, tunnel_id},
    error::AuthError,
    specification::{HELLO_ENC_PK_LEN, HELLO_MIN_LEN, HELLO_NONCE_LEN},
    time::buckets_around,
};

/// Which side of a tunnel we are.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) enum Role {
    /// We sent the first Hello.
    Client,
    /// We answered a Hello.
    Server,
}

/// A stable, non-secret handle for a tunnel that survives roaming.
///
/// Derived from the tunnel's shared secret with a one-way function, so it
/// never reveals key material.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TunnelId([u8; 32]);

impl TunnelId {
    /// Returns the identifier's bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for TunnelId {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Debug for TunnelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "TunnelId(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

/// Builds a Hello carrying `epk` under the given cookie bucket.
pub(crate) fn encode_hello(cookie: &Cookie, epk: &[u8; 32], bucket: u64, padding_max: usize) -> Vec<u8> {
    let mut rng = rand::rng();
    let nonce: [u8; HELLO_NONCE_LEN] = random_array();
    let key = derive_key(now_cookie(cookie, bucket).as_bytes(), &nonce);
    let enc_pk = SealedKeyCipher::new(&key).seal(epk);

    let padding_len = rng.random_range(0..=padding_max);
    let mut hello = Vec::with_capacity(HELLO_MIN_LEN + padding_len);
    hello.extend_from_slice(&nonce);
    hello.extend_from_slice(&enc_pk);
    hello.resize(HELLO_MIN_LEN + padding_len, 0);
    rng.fill(&mut hello[HELLO_MIN_LEN..]);
    hello
}

/// Tries every accepted bucket around `bucket` and returns the peer's
/// ephemeral public key on success.
pub(crate) fn decode_hello(cookie: &Cookie, wire: &[u8], bucket: u64, skew: i64) -> Option<[u8; 32]> {
    if wire.len() < HELLO_MIN_LEN {
        return None;
    }
    let nonce = &wire[..HELLO_NONCE_LEN];
    let enc_pk: &[u8; HELLO_ENC_PK_LEN] = wire[HELLO_NONCE_LEN..HELLO_MIN_LEN].try_into().ok()?;

    buckets_around(bucket, skew).find_map(|b| {
        let key = derive_key(now_cookie(cookie, b).as_bytes(), nonce);
        SealedKeyCipher::new(&key).open(enc_pk).ok()
    })
}

/// A Hello we sent and have not seen answered yet.
pub(crate) struct ProtoTun {
    esk: StaticSecret,
    epk: [u8; 32],
    cookie: Cookie,
}

impl ProtoTun {
    pub(crate) fn new(cookie: Cookie) -> Self {
        let esk = StaticSecret::random();
        let epk = PublicKey::from(&esk).to_bytes();
        Self { esk, epk, cookie }
    }

    /// A fresh encoding of our Hello. Every retransmission reuses the same
    /// ephemeral key with a new nonce and padding.
    pub(crate) fn hello(&self, bucket: u64, padding_max: usize) -> Vec<u8> {
        encode_hello(&self.cookie, &self.epk, bucket, padding_max)
    }

    /// Completes the handshake with the peer's Hello.
    pub(crate) fn complete(&self, wire: &[u8], bucket: u64, skew: i64) -> Option<TunState> {
        let their_epk = decode_hello(&self.cookie, wire, bucket, skew)?;
        TunState::derive(&self.esk, their_epk, Role::Client, None)
    }
}

impl Debug for ProtoTun {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProtoTun")
            .field("esk", &"*****")
            .field("cookie", &self.cookie)
            .finish()
    }
}

/// An established tunnel: directional packet ciphers plus identity.
pub(crate) struct TunState {
    role: Role,
    id: TunnelId,
    their_epk: [u8; 32],
    enc: PacketCipher,
    dec: PacketCipher,
    hello_reply: Option<Vec<u8>>,
}

impl TunState {
    fn derive(
        esk: &StaticSecret,
        their_epk: [u8; 32],
        role: Role,
        hello_reply: Option<Vec<u8>>,
    ) -> Option<Self> {
        let shared = esk.diffie_hellman(&PublicKey::from(their_epk));
        if !shared.was_contributory() {
            return None;
        }
        let ss = shared.to_bytes();
        let up = derive_key(&ss, b"up");
        let dn = derive_key(&ss, b"dn");
        let (enc, dec) = match role {
            Role::Client => (up, dn),
            Role::Server => (dn, up),
        };
        Some(Self {
            role,
            id: TunnelId(tunnel_id(&ss)),
            their_epk,
            enc: PacketCipher::new(&enc),
            dec: PacketCipher::new(&dec),
            hello_reply,
        })
    }

    /// Answers a peer's Hello: derives the server side of the tunnel and
    /// builds the reply, which is kept for retransmitted Hellos.
    pub(crate) fn accept(
        cookie: &Cookie,
        their_epk: [u8; 32],
        bucket: u64,
        padding_max: usize,
    ) -> Option<Self> {
        let esk = StaticSecret::random();
        let epk = PublicKey::from(&esk).to_bytes();
        let reply = encode_hello(cookie, &epk, bucket, padding_max);
        Self::derive(&esk, their_epk, Role::Server, Some(reply))
    }

    pub(crate) fn role(&self) -> Role {
        self.role
    }

    pub(crate) fn id(&self) -> TunnelId {
        self.id
    }

    pub(crate) fn their_epk(&self) -> &[u8; 32] {
        &self.their_epk
    }

    pub(crate) fn hello_reply(&self) -> Option<&[u8]> {
        self.hello_reply.as_deref()
    }

    /// `nonce || ciphertext || tag`, at least 40 bytes.
    pub(crate) fn seal(&self, payload: &[u8]) -> Vec<u8> {
        self.enc.seal(payload)
    }

    pub(crate) fn open(&self, wire: &[u8]) -> Result<Vec<u8>, AuthError> {
        self.dec.open(wire).map_err(|_| AuthError::AeadOpenFailed)
    }
}

impl Debug for TunState {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TunState")
            .field("role", &self.role)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

//! Crypto primitives.
//!
//! Everything above this module talks in terms of cookies, derived 32-byte
//! keys and three ciphers:
//!
//! * [`SealedKeyCipher`]: ChaCha20-Poly1305 with a fixed zero nonce, used
//!   once per key to hide the ephemeral public key inside a hello.
//! * [`PacketCipher`]: XChaCha20-Poly1305 with a random 24-byte nonce per
//!   datagram, used by OBFS tunnels.
//! * [`CounterCipher`]: ChaCha20-Poly1305 with a 64-bit counter nonce, used
//!   by TinySS records.
//!
//! cshirt2 records are not AEAD-sealed: they use a bare [`Keystream`] and a
//! ratcheting keyed Blake2b MAC instead.

use core::fmt::{Debug, Formatter};

use aws_lc_rs::{
    aead::{Aad, CHACHA20_POLY1305, LessSafeKey, Nonce, UnboundKey},
    hmac,
};
use blake2::{
    Blake2bMac,
    digest::{
        Mac,
        consts::{U16, U32},
    },
};
use chacha20::{
    ChaCha20,
    cipher::{KeyIvInit, StreamCipher},
};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce, aead::Aead};
use rand::{TryRngCore, rngs::OsRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::specification::{AEAD_TAG_LEN, XNONCE_LEN};

/// A pre-shared 256-bit secret that identifies a bridge.
///
/// Knowing the cookie is what lets a client complete a handshake with the
/// bridge; to everybody else the bridge's traffic looks random. Cookies are
/// distributed out-of-band (normally by the binder) and rotated rarely.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub struct Cookie([u8; 32]);

impl Cookie {
    /// Generate a new [`Cookie`] from system entropy.
    pub fn from_entropy() -> Self {
        Self(random_array())
    }

    /// Extract this cookie's bytes for serialization.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Get a reference to the cookie's bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl AsRef<[u8]> for Cookie {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for Cookie {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Debug for Cookie {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Cookie").field(&"*****").finish()
    }
}

/// A derived 256-bit symmetric key.
#[derive(Clone, Eq, PartialEq, Hash, Zeroize, ZeroizeOnDrop)]
pub(crate) struct DerivedKey([u8; 32]);

impl DerivedKey {
    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for DerivedKey {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl Debug for DerivedKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DerivedKey").field(&"*****").finish()
    }
}

/// Fills an array from the operating system's entropy source.
pub(crate) fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng
        .try_fill_bytes(&mut out)
        .expect("system random source failure");
    out
}

/// `HMAC-SHA256(key, msg)`.
pub(crate) fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    let tag = hmac::sign(&key, msg);
    let mut out = [0u8; 32];
    out.copy_from_slice(tag.as_ref());
    out
}

/// `HMAC-SHA256(key, label)` as a [`DerivedKey`].
pub(crate) fn derive_key(key: &[u8], label: &[u8]) -> DerivedKey {
    DerivedKey(hmac_sha256(key, label))
}

/// The cookie MAC for one time bucket: `HMAC(cookie, ascii(bucket))`.
pub(crate) fn now_cookie(cookie: &Cookie, bucket: u64) -> DerivedKey {
    derive_key(cookie.as_ref(), bucket.to_string().as_bytes())
}

/// Keyed Blake2b with a 128-bit output.
pub(crate) fn blake2b_128(key: &[u8], msg: &[u8]) -> [u8; 16] {
    let mut mac = Blake2bMac::<U16>::new_with_salt_and_personal(key, &[], &[])
        .expect("blake2b key is at most 64 bytes");
    mac.update(msg);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Keyed Blake2b with a 256-bit output.
pub(crate) fn blake2b_256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = Blake2bMac::<U32>::new_with_salt_and_personal(key, &[], &[])
        .expect("blake2b key is at most 64 bytes");
    mac.update(msg);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Checks a keyed Blake2b tag of 16 or 32 bytes in constant time.
pub(crate) fn blake2b_verify(key: &[u8], msg: &[u8], tag: &[u8]) -> bool {
    match tag.len() {
        16 => Blake2bMac::<U16>::new_with_salt_and_personal(key, &[], &[])
            .map(|mac| mac.chain_update(msg).verify_slice(tag).is_ok())
            .unwrap_or(false),
        32 => Blake2bMac::<U32>::new_with_salt_and_personal(key, &[], &[])
            .map(|mac| mac.chain_update(msg).verify_slice(tag).is_ok())
            .unwrap_or(false),
        _ => false,
    }
}

/// Derives a non-secret stable identifier from a tunnel's shared secret.
pub(crate) fn tunnel_id(shared_secret: &[u8; 32]) -> [u8; 32] {
    blake3::derive_key("roamwire obfs tunnel identifier", shared_secret)
}

/// ChaCha20-Poly1305 under a single-use key with an all-zero nonce.
#[derive(Debug)]
pub(crate) struct SealedKeyCipher(StatelessCipher);

impl SealedKeyCipher {
    pub(crate) fn new(key: &DerivedKey) -> Self {
        Self(StatelessCipher::new(key))
    }

    pub(crate) fn seal(&self, plaintext: &[u8; 32]) -> [u8; 32 + AEAD_TAG_LEN] {
        let mut buf = [0u8; 32 + AEAD_TAG_LEN];
        buf[..32].copy_from_slice(plaintext);
        self.0.seal(&mut buf, [0u8; 12]);
        buf
    }

    pub(crate) fn open(&self, sealed: &[u8; 32 + AEAD_TAG_LEN]) -> Result<[u8; 32], ()> {
        let mut buf = *sealed;
        self.0.open(&mut buf, [0u8; 12])?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&buf[..32]);
        Ok(out)
    }
}

/// XChaCha20-Poly1305 with a fresh random nonce per packet.
pub(crate) struct PacketCipher(XChaCha20Poly1305);

impl PacketCipher {
    pub(crate) fn new(key: &DerivedKey) -> Self {
        Self(XChaCha20Poly1305::new(Key::from_slice(key.as_bytes())))
    }

    /// Returns `nonce || ciphertext || tag`.
    pub(crate) fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let nonce: [u8; XNONCE_LEN] = rand::random();
        let sealed = self
            .0
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .expect("encrypt failed, this should never happen");
        let mut out = Vec::with_capacity(XNONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        out
    }

    pub(crate) fn open(&self, wire: &[u8]) -> Result<Vec<u8>, ()> {
        if wire.len() < XNONCE_LEN + AEAD_TAG_LEN {
            return Err(());
        }
        let (nonce, sealed) = wire.split_at(XNONCE_LEN);
        self.0
            .decrypt(XNonce::from_slice(nonce), sealed)
            .map_err(|_| ())
    }
}

impl Debug for PacketCipher {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PacketCipher").field(&"*****").finish()
    }
}

/// A continuous ChaCha20 keystream under a zero nonce.
///
/// Each direction of a cshirt2 stream owns one. Length fields and bodies
/// are encrypted in wire order, so both ends stay in step.
pub(crate) struct Keystream(ChaCha20);

impl Keystream {
    pub(crate) fn new(key: &DerivedKey) -> Self {
        Self(ChaCha20::new(key.as_bytes().into(), &[0u8; 12].into()))
    }

    pub(crate) fn apply(&mut self, buf: &mut [u8]) {
        self.0.apply_keystream(buf);
    }
}

impl Debug for Keystream {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("Keystream")
    }
}

/// ChaCha20-Poly1305 whose nonce is a big-endian message counter.
#[derive(Debug)]
pub(crate) struct CounterCipher {
    cipher: StatelessCipher,
    nonce: CounterNonce,
}

impl CounterCipher {
    pub(crate) fn new(key: &DerivedKey) -> Self {
        Self {
            cipher: StatelessCipher::new(key),
            nonce: CounterNonce::default(),
        }
    }

    /// Number of messages processed so far.
    pub(crate) fn counter(&self) -> u64 {
        self.nonce.0
    }

    /// Seals `in_out[..len - 16]` and writes the tag into the last 16 bytes.
    pub(crate) fn seal(&mut self, in_out: &mut [u8]) {
        self.cipher.seal(in_out, self.nonce.next())
    }

    /// Opens `in_out` in place; the plaintext is `in_out[..len - 16]`.
    pub(crate) fn open(&mut self, in_out: &mut [u8]) -> Result<(), ()> {
        self.cipher.open(in_out, self.nonce.next())
    }
}

#[derive(Debug)]
struct StatelessCipher {
    key: LessSafeKey,
}

impl StatelessCipher {
    fn new(key: &DerivedKey) -> Self {
        Self {
            key: LessSafeKey::new(
                UnboundKey::new(&CHACHA20_POLY1305, key.as_bytes())
                    .expect("chacha20-poly1305 takes a 32-byte key"),
            ),
        }
    }

    fn open(&self, in_out: &mut [u8], nonce: [u8; 12]) -> Result<(), ()> {
        self.key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), in_out)
            .map_err(|_| ())?;
        Ok(())
    }

    fn seal(&self, in_out: &mut [u8], nonce: [u8; 12]) {
        let (in_out, tag) = in_out.split_at_mut(in_out.len() - AEAD_TAG_LEN);
        let t = self
            .key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), in_out)
            .expect("encrypt failed, this should never happen");
        tag.copy_from_slice(t.as_ref());
    }
}

#[derive(Debug, Default)]
struct CounterNonce(u64);

impl CounterNonce {
    fn next(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.0.to_be_bytes());
        self.0 += 1;
        nonce
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counter_cipher_seal_open() {
        let key = DerivedKey::from([7u8; 32]);
        let mut sealer = CounterCipher::new(&key);
        let mut opener = CounterCipher::new(&key);

        for msg in [&b"Hello, world!"[..], b"", &[0xaa; 1000]] {
            let mut buf = msg.to_vec();
            buf.extend_from_slice(&[0u8; AEAD_TAG_LEN]);
            sealer.seal(&mut buf);
            assert_eq!(opener.open(&mut buf), Ok(()));
            assert_eq!(&buf[..msg.len()], msg);
        }
        assert_eq!(sealer.counter(), 3);
        assert_eq!(opener.counter(), 3);
    }

    #[test]
    fn test_counter_cipher_rejects_reordering() {
        let key = DerivedKey::from([7u8; 32]);
        let mut sealer = CounterCipher::new(&key);
        let mut opener = CounterCipher::new(&key);

        let mut first = vec![1u8; 20];
        let mut second = vec![2u8; 20];
        sealer.seal(&mut first);
        sealer.seal(&mut second);

        // The second record under the first counter fails.
        assert_eq!(opener.open(&mut second), Err(()));
    }

    #[test]
    fn test_counter_cipher_tampering() {
        let key = DerivedKey::from([0u8; 32]);
        let mut sealer = CounterCipher::new(&key);
        let mut opener = CounterCipher::new(&key);
        let mut buf = vec![0u8; 13 + AEAD_TAG_LEN];
        sealer.seal(&mut buf);
        buf[0] = buf[0].wrapping_add(1);
        assert_eq!(opener.open(&mut buf), Err(()));
    }

    #[test]
    fn test_sealed_key_cipher() {
        let cipher = SealedKeyCipher::new(&DerivedKey::from([1u8; 32]));
        let sealed = cipher.seal(&[9u8; 32]);
        assert_eq!(sealed.len(), 48);
        assert_eq!(cipher.open(&sealed), Ok([9u8; 32]));

        let other = SealedKeyCipher::new(&DerivedKey::from([2u8; 32]));
        assert_eq!(other.open(&sealed), Err(()));
    }

    #[test]
    fn test_packet_cipher_empty_payload() {
        let cipher = PacketCipher::new(&DerivedKey::from([3u8; 32]));
        let wire = cipher.seal(&[]);
        assert_eq!(wire.len(), XNONCE_LEN + AEAD_TAG_LEN);
        assert_eq!(cipher.open(&wire), Ok(Vec::new()));
    }

    #[test]
    fn test_packet_cipher_wrong_key() {
        let cipher = PacketCipher::new(&DerivedKey::from([3u8; 32]));
        let other = PacketCipher::new(&DerivedKey::from([4u8; 32]));
        let wire = cipher.seal(b"ping");
        assert_eq!(cipher.open(&wire), Ok(b"ping".to_vec()));
        assert_eq!(other.open(&wire), Err(()));
        assert_eq!(cipher.open(&wire[..10]), Err(()));
    }

    #[test]
    fn test_now_cookie_depends_on_bucket() {
        let cookie = Cookie::from([0u8; 32]);
        assert_eq!(now_cookie(&cookie, 5), now_cookie(&cookie, 5));
        assert_ne!(now_cookie(&cookie, 5), now_cookie(&cookie, 6));
        assert_eq!(
            now_cookie(&cookie, 5).as_bytes(),
            &hmac_sha256(&[0u8; 32], b"5")
        );
    }

    #[test]
    fn test_blake2b_ratchet_is_deterministic() {
        let k0 = [5u8; 32];
        let k1 = blake2b_256(&k0, &[]);
        assert_ne!(k0, k1);
        assert_eq!(k1, blake2b_256(&k0, &[]));
        assert_ne!(blake2b_128(&k0, b"a"), blake2b_128(&k1, b"a"));
    }

    #[test]
    fn test_keystream_is_continuous() {
        let key = DerivedKey::from([1u8; 32]);
        let mut whole = [0u8; 100];
        Keystream::new(&key).apply(&mut whole);

        let mut split = [0u8; 100];
        let mut ks = Keystream::new(&key);
        ks.apply(&mut split[..2]);
        ks.apply(&mut split[2..]);
        assert_eq!(whole, split);
    }

    #[test]
    fn test_blake2b_verify() {
        let key = [3u8; 32];
        assert!(blake2b_verify(&key, b"msg", &blake2b_128(&key, b"msg")));
        assert!(blake2b_verify(&key, b"msg", &blake2b_256(&key, b"msg")));
        assert!(!blake2b_verify(&key, b"msh", &blake2b_256(&key, b"msg")));
        assert!(!blake2b_verify(&key, b"msg", &[0u8; 20]));
    }

    #[test]
    fn test_cookie_debug_is_masked() {
        assert_eq!(format!("{:?}", Cookie::from([1u8; 32])), "Cookie(\"*****\")");
    }
}

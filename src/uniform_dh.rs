//! UniformDH over the 1536-bit MODP group from RFC 3526.
//!
//! A plain Diffie-Hellman public value is always a quadratic residue, which
//! a censor can test for. Here the private exponent is even and the public
//! value is replaced by `p - y` half of the time; both forms lead to the same
//! shared secret and together they cover `[0, p)` evenly.
use std::sync::LazyLock;

use num_bigint::BigUint;
use rand::{Rng, SeedableRng, rngs::StdRng};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{error::DecodeError, specification::UDH_KEY_LEN};

const GROUP5_PRIME_HEX: &[u8] = b"\
    FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
    29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
    EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
    E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
    EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
    C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
    83655D23DCA3AD961C62F356208552BB9ED529077096966D\
    670C354E4ABC9804F1746C08CA237327FFFFFFFFFFFFFFFF";

static PRIME: LazyLock<BigUint> = LazyLock::new(|| {
    BigUint::parse_bytes(GROUP5_PRIME_HEX, 16).expect("group 5 prime is valid hex")
});

static GENERATOR: LazyLock<BigUint> = LazyLock::new(|| BigUint::from(2u32));

/// A UniformDH keypair. The private exponent is wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct UniformDh {
    private: [u8; UDH_KEY_LEN],
    public: [u8; UDH_KEY_LEN],
}

impl UniformDh {
    /// Generates a keypair from system entropy.
    pub(crate) fn generate() -> Self {
        Self::generate_with_rng(&mut StdRng::from_os_rng())
    }

    pub(crate) fn generate_with_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        loop {
            let mut private = [0u8; UDH_KEY_LEN];
            rng.fill(&mut private[..]);
            private[UDH_KEY_LEN - 1] &= 0xfe;

            let x = BigUint::from_bytes_be(&private);
            let mut y = GENERATOR.modpow(&x, &PRIME);
            if rng.random_bool(0.5) {
                y = &*PRIME - y;
            }

            // A value with leading zero bytes would be short on the wire.
            let encoded = y.to_bytes_be();
            if encoded.len() != UDH_KEY_LEN {
                private.zeroize();
                continue;
            }
            let mut public = [0u8; UDH_KEY_LEN];
            public.copy_from_slice(&encoded);
            return Self { private, public };
        }
    }

    pub(crate) fn public_key(&self) -> &[u8; UDH_KEY_LEN] {
        &self.public
    }

    /// Computes `their^x mod p`, left-padded to 192 bytes.
    pub(crate) fn shared_secret(&self, their_public: &[u8]) -> Result<[u8; UDH_KEY_LEN], DecodeError> {
        if their_public.len() != UDH_KEY_LEN {
            return Err(DecodeError::InvalidHandshakeLength {
                len: their_public.len(),
            });
        }
        let y = BigUint::from_bytes_be(their_public);
        if y >= *PRIME {
            return Err(DecodeError::MalformedPacket);
        }
        let x = BigUint::from_bytes_be(&self.private);
        let shared = y.modpow(&x, &PRIME).to_bytes_be();

        let mut out = [0u8; UDH_KEY_LEN];
        out[UDH_KEY_LEN - shared.len()..].copy_from_slice(&shared);
        Ok(out)
    }
}

impl core::fmt::Debug for UniformDh {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("UniformDh")
            .field("private", &"*****")
            .field("public", &&self.public[..8])
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_prime_is_1536_bits() {
        assert_eq!(PRIME.bits(), 1536);
        assert_eq!(PRIME.to_bytes_be().len(), UDH_KEY_LEN);
    }

    #[test]
    fn test_key_agreement() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..4 {
            let alice = UniformDh::generate_with_rng(&mut rng);
            let bob = UniformDh::generate_with_rng(&mut rng);
            assert_eq!(alice.public_key().len(), UDH_KEY_LEN);
            assert_eq!(
                alice.shared_secret(bob.public_key()).unwrap(),
                bob.shared_secret(alice.public_key()).unwrap()
            );
        }
    }

    #[test]
    fn test_negated_public_gives_same_secret() {
        let mut rng = StdRng::seed_from_u64(9);
        let alice = UniformDh::generate_with_rng(&mut rng);
        let bob = UniformDh::generate_with_rng(&mut rng);

        let y = BigUint::from_bytes_be(bob.public_key());
        let negated = (&*PRIME - y).to_bytes_be();
        let mut padded = [0u8; UDH_KEY_LEN];
        padded[UDH_KEY_LEN - negated.len()..].copy_from_slice(&negated);

        assert_eq!(
            alice.shared_secret(&padded).unwrap(),
            alice.shared_secret(bob.public_key()).unwrap()
        );
    }

    #[test]
    fn test_private_exponent_is_even() {
        let alice = UniformDh::generate();
        assert_eq!(alice.private[UDH_KEY_LEN - 1] & 1, 0);
    }

    #[test]
    fn test_rejects_bad_length() {
        let alice = UniformDh::generate();
        assert_eq!(
            alice.shared_secret(&[1u8; 191]),
            Err(DecodeError::InvalidHandshakeLength { len: 191 })
        );
        assert_eq!(
            alice.shared_secret(&[0xffu8; UDH_KEY_LEN]),
            Err(DecodeError::MalformedPacket)
        );
    }
}

//! cshirt2 handshake: a UniformDH public key followed by a cookie MAC.
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::{
    config::Cshirt2Config,
    crypto::{Cookie, DerivedKey, blake2b_256, blake2b_verify, derive_key, hmac_sha256},
    error::AuthError,
    specification::{CSHIRT2_EPOCH_SECS, CSHIRT2_HANDSHAKE_LEN, UDH_KEY_LEN},
    time::{buckets_around, current_bucket, unix_secs},
    uniform_dh::UniformDh,
};

/// Keys for one direction of a cshirt2 stream.
#[derive(Debug)]
pub(crate) struct DirectionKeys {
    pub(crate) cipher: DerivedKey,
    pub(crate) mac: DerivedKey,
}

impl DirectionKeys {
    fn derive(direction: &[u8; 32]) -> Self {
        Self {
            cipher: derive_key(direction, b"cipher"),
            mac: derive_key(direction, b"mac"),
        }
    }
}

#[derive(Debug)]
pub(crate) struct SessionKeys {
    pub(crate) rx: DirectionKeys,
    pub(crate) tx: DirectionKeys,
}

impl SessionKeys {
    fn derive(shared_secret: &[u8], is_client: bool) -> Self {
        let c2s = DirectionKeys::derive(&hmac_sha256(shared_secret, b"c2s"));
        let s2c = DirectionKeys::derive(&hmac_sha256(shared_secret, b"s2c"));
        if is_client {
            Self { rx: s2c, tx: c2s }
        } else {
            Self { rx: c2s, tx: s2c }
        }
    }
}

/// `Blake2b-256(cookie, ascii(epoch))`.
fn epoch_key(cookie: &Cookie, epoch: u64) -> [u8; 32] {
    blake2b_256(cookie.as_ref(), epoch.to_string().as_bytes())
}

fn hello(udh: &UniformDh, mac_key: &[u8; 32]) -> [u8; CSHIRT2_HANDSHAKE_LEN] {
    let pk = udh.public_key();
    let mut out = [0u8; CSHIRT2_HANDSHAKE_LEN];
    out[..UDH_KEY_LEN].copy_from_slice(pk);
    out[UDH_KEY_LEN..].copy_from_slice(&blake2b_256(mac_key, pk));
    out
}

/// Validates a client hello against every epoch within tolerance of
/// `epoch`, then against the replay cache. Returns the epoch key that
/// matched.
fn check_client_hello(
    hello: &[u8; CSHIRT2_HANDSHAKE_LEN],
    config: &Cshirt2Config,
    epoch: u64,
    now_secs: u64,
) -> Result<[u8; 32], AuthError> {
    let (pk, mac) = hello.split_at(UDH_KEY_LEN);
    let mac_key = buckets_around(epoch, config.epoch_tolerance)
        .map(|e| epoch_key(&config.cookie, e))
        .find(|key| blake2b_verify(key, pk, mac))
        .ok_or(AuthError::BadHandshakeMac)?;

    let seen = *blake3::hash(pk).as_bytes();
    config
        .replay_cache
        .check_or_insert(seen, now_secs)
        .inspect_err(|_| warn!("cshirt2: replayed handshake key, active probing suspected"))?;
    Ok(mac_key)
}

/// Runs the client side of the handshake.
pub(crate) async fn client<IO>(stream: &mut IO, config: &Cshirt2Config) -> io::Result<SessionKeys>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let udh = UniformDh::generate();
    let mac_key = epoch_key(&config.cookie, current_bucket(CSHIRT2_EPOCH_SECS));
    stream.write_all(&hello(&udh, &mac_key)).await?;
    stream.flush().await?;

    let mut reply = [0u8; CSHIRT2_HANDSHAKE_LEN];
    stream.read_exact(&mut reply).await?;
    let (pk, mac) = reply.split_at(UDH_KEY_LEN);
    if !blake2b_verify(&mac_key, pk, mac) {
        return Err(AuthError::BadHandshakeMac.into());
    }

    let ss = Zeroizing::new(udh.shared_secret(pk)?);
    debug!("cshirt2: client handshake complete");
    Ok(SessionKeys::derive(&ss[..], true))
}

/// Runs the server side of the handshake.
///
/// The server answers with the epoch key the client used, so a client with
/// a skewed clock can still verify the reply.
pub(crate) async fn server<IO>(stream: &mut IO, config: &Cshirt2Config) -> io::Result<SessionKeys>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut theirs = [0u8; CSHIRT2_HANDSHAKE_LEN];
    stream.read_exact(&mut theirs).await?;
    let mac_key = check_client_hello(
        &theirs,
        config,
        current_bucket(CSHIRT2_EPOCH_SECS),
        unix_secs(),
    )?;

    let udh = UniformDh::generate();
    let ss = Zeroizing::new(udh.shared_secret(&theirs[..UDH_KEY_LEN])?);
    stream.write_all(&hello(&udh, &mac_key)).await?;
    stream.flush().await?;
    debug!("cshirt2: server handshake complete");
    Ok(SessionKeys::derive(&ss[..], false))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use rand::{SeedableRng, rngs::StdRng};
    use tokio::io::duplex;

    use super::*;
    use crate::{
        error::{Error, downcast},
        replay_cache::ReplayCache,
    };

    fn config() -> Cshirt2Config {
        Cshirt2Config::new(Cookie::from([4u8; 32]))
            .with_replay_cache(Arc::new(ReplayCache::default()))
    }

    fn hello_at(config: &Cshirt2Config, epoch: u64, seed: u64) -> [u8; CSHIRT2_HANDSHAKE_LEN] {
        let udh = UniformDh::generate_with_rng(&mut StdRng::seed_from_u64(seed));
        hello(&udh, &epoch_key(&config.cookie, epoch))
    }

    #[test]
    fn test_epoch_tolerance() {
        let config = config();
        let now = 1_000_000;
        assert!(check_client_hello(&hello_at(&config, now, 1), &config, now, 0).is_ok());
        assert!(check_client_hello(&hello_at(&config, now - 10, 2), &config, now, 0).is_ok());
        assert!(check_client_hello(&hello_at(&config, now + 10, 3), &config, now, 0).is_ok());
        assert_eq!(
            check_client_hello(&hello_at(&config, now - 11, 4), &config, now, 0),
            Err(AuthError::BadHandshakeMac)
        );
    }

    #[test]
    fn test_wrong_cookie() {
        let config = config();
        let other = Cshirt2Config::new(Cookie::from([5u8; 32]));
        let now = 1_000_000;
        assert_eq!(
            check_client_hello(&hello_at(&other, now, 1), &config, now, 0),
            Err(AuthError::BadHandshakeMac)
        );
    }

    #[test]
    fn test_replayed_hello_is_active_probing() {
        let config = config();
        let now = 1_000_000;
        let captured = hello_at(&config, now, 7);
        assert!(check_client_hello(&captured, &config, now, 100).is_ok());
        assert_eq!(
            check_client_hello(&captured, &config, now, 100 + 599),
            Err(AuthError::ActiveProbing)
        );
        // Ten minutes after the first sighting the key is forgotten.
        assert!(check_client_hello(&captured, &config, now, 100 + 600 + 599).is_ok());
    }

    #[test]
    fn test_directional_keys_mirror() {
        let ss = [9u8; 192];
        let client = SessionKeys::derive(&ss, true);
        let server = SessionKeys::derive(&ss, false);
        assert_eq!(client.tx.cipher, server.rx.cipher);
        assert_eq!(client.tx.mac, server.rx.mac);
        assert_eq!(client.rx.cipher, server.tx.cipher);
        assert_ne!(client.tx.cipher, client.rx.cipher);
        assert_ne!(client.tx.cipher, client.tx.mac);
    }

    #[tokio::test]
    async fn test_handshake_over_duplex() {
        let (mut a, mut b) = duplex(4096);
        let client_config = config();
        let server_config = config();
        let (c, s) = tokio::join!(client(&mut a, &client_config), server(&mut b, &server_config));
        let (c, s) = (c.unwrap(), s.unwrap());
        assert_eq!(c.tx.cipher, s.rx.cipher);
        assert_eq!(c.rx.mac, s.tx.mac);
    }

    #[tokio::test]
    async fn test_client_rejects_bad_reply() {
        let (mut a, mut b) = duplex(4096);
        let config = config();
        let task = tokio::spawn(async move { client(&mut a, &config).await });
        let mut hello = [0u8; CSHIRT2_HANDSHAKE_LEN];
        b.read_exact(&mut hello).await.unwrap();
        b.write_all(&[0x42; CSHIRT2_HANDSHAKE_LEN]).await.unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(
            downcast(&err),
            Some(&Error::Auth(AuthError::BadHandshakeMac))
        );
    }
}

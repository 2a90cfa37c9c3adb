//! Binding a TinySS channel to an exit's long-term identity.
//!
//! TinySS itself is anonymous: either end could be anybody. Right after the
//! handshake the exit signs the channel's shared secret with its Ed25519
//! key, and the client checks the signature against the identity it pinned
//! beforehand. Since both ends see the same shared secret only on the same
//! channel, a man in the middle cannot forward the signature. The client
//! then submits its ticket over the now authenticated channel.
//!
//! ```text
//! exit   -> client: Ed25519 signature over shared_secret (64)
//! client -> exit:   u16_be len || ticket (len)
//! ```
use core::fmt::{Debug, Formatter};
use std::io;

use aws_lc_rs::signature::{ED25519, Ed25519KeyPair, KeyPair, UnparsedPublicKey};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{
    binder::Ticket,
    error::{AuthError, DecodeError},
    tss::TssStream,
};

const SIGNATURE_LEN: usize = 64;

/// Longest encoded ticket an exit accepts.
const MAX_TICKET_LEN: usize = 4096;

/// An exit's Ed25519 public key, pinned by clients.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ExitIdentity([u8; 32]);

impl ExitIdentity {
    /// Wraps a raw Ed25519 public key.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the raw Ed25519 public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn verify(&self, shared_secret: &[u8; 32], signature: &[u8]) -> Result<(), AuthError> {
        UnparsedPublicKey::new(&ED25519, &self.0)
            .verify(shared_secret, signature)
            .map_err(|_| AuthError::ExitSignatureInvalid)
    }
}

impl Debug for ExitIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "ExitIdentity({:02x?})", &self.0[..4])
    }
}

/// An exit's long-term signing key.
pub struct ExitKey(Ed25519KeyPair);

impl ExitKey {
    /// Generates a fresh key.
    pub fn generate() -> io::Result<Self> {
        Ed25519KeyPair::generate()
            .map(Self)
            .map_err(|_| io::Error::other("ed25519 key generation failed"))
    }

    /// Loads a key from a PKCS#8 document.
    pub fn from_pkcs8(der: &[u8]) -> io::Result<Self> {
        Ed25519KeyPair::from_pkcs8(der)
            .map(Self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    /// The identity clients pin for this key.
    pub fn identity(&self) -> ExitIdentity {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.0.public_key().as_ref());
        ExitIdentity(bytes)
    }

    fn sign(&self, shared_secret: &[u8; 32]) -> [u8; SIGNATURE_LEN] {
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(self.0.sign(shared_secret).as_ref());
        signature
    }
}

impl Debug for ExitKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ExitKey").field(&self.identity()).finish()
    }
}

/// Proves the exit's identity on a fresh channel and reads the client's
/// ticket.
///
/// The ticket is returned unchecked; verify it with [`Ticket::verify`] or
/// redeem it with the binder before serving the client.
pub async fn bind_exit<IO>(stream: &mut TssStream<IO>, key: &ExitKey) -> io::Result<Ticket>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let signature = key.sign(stream.shared_secret());
    stream.write_all(&signature).await?;
    stream.flush().await?;

    let len = stream.read_u16().await? as usize;
    if len > MAX_TICKET_LEN {
        return Err(DecodeError::RecordTooLarge { len }.into());
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    let ticket = Ticket::decode(&buf)?;
    debug!(tier = %ticket.tier, "exit: ticket received");
    Ok(ticket)
}

/// Checks that the exit behind `stream` holds `identity`, then submits
/// `ticket`.
///
/// Fails with [`AuthError::ExitSignatureInvalid`] before anything is sent if
/// the exit cannot prove its identity.
pub async fn bind_client<IO>(
    stream: &mut TssStream<IO>,
    identity: &ExitIdentity,
    ticket: &Ticket,
) -> io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut signature = [0u8; SIGNATURE_LEN];
    stream.read_exact(&mut signature).await?;
    identity.verify(stream.shared_secret(), &signature)?;
    debug!(exit = ?identity, "exit: identity verified");

    let encoded = ticket.encode();
    if encoded.len() > MAX_TICKET_LEN {
        return Err(DecodeError::RecordTooLarge { len: encoded.len() }.into());
    }
    stream.write_u16(encoded.len() as u16).await?;
    stream.write_all(&encoded).await?;
    stream.flush().await
}

#[cfg(test)]
mod test {
    use tokio::io::duplex;

    use super::*;
    use crate::{
        binder::{MemoryBinder, Tier},
        error::{Error, downcast},
    };

    async fn channel() -> (TssStream<tokio::io::DuplexStream>, TssStream<tokio::io::DuplexStream>) {
        let (a, b) = duplex(4096);
        let (a, b) = tokio::join!(TssStream::handshake(a), TssStream::handshake(b));
        (a.unwrap(), b.unwrap())
    }

    #[tokio::test]
    async fn test_bind_and_submit_ticket() {
        let key = ExitKey::generate().unwrap();
        let binder = MemoryBinder::generate().unwrap();
        let ticket = binder.issue_ticket(Tier::Paid);

        let (mut client, mut exit) = channel().await;
        let identity = key.identity();
        let (bound, received) = tokio::join!(
            bind_client(&mut client, &identity, &ticket),
            bind_exit(&mut exit, &key)
        );
        bound.unwrap();
        assert_eq!(received.unwrap(), ticket);

        // The channel carries on as usual afterwards.
        client.write_all(b"GET /").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 5];
        exit.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET /");
    }

    #[tokio::test]
    async fn test_wrong_identity_is_rejected() {
        let key = ExitKey::generate().unwrap();
        let pinned = ExitKey::generate().unwrap().identity();
        let ticket = MemoryBinder::generate().unwrap().issue_ticket(Tier::Free);

        let (mut client, mut exit) = channel().await;
        let exit_task = tokio::spawn(async move {
            let res = bind_exit(&mut exit, &key).await;
            drop(exit);
            res
        });
        let err = bind_client(&mut client, &pinned, &ticket).await.unwrap_err();
        assert_eq!(
            downcast(&err),
            Some(&Error::Auth(AuthError::ExitSignatureInvalid))
        );
        // No ticket leaked to the impostor.
        drop(client);
        assert!(exit_task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_signature_is_bound_to_the_channel() {
        let key = ExitKey::generate().unwrap();
        let (_, exit) = channel().await;
        let replayed = key.sign(exit.shared_secret());

        let (client, _) = channel().await;
        assert_eq!(
            key.identity().verify(client.shared_secret(), &replayed),
            Err(AuthError::ExitSignatureInvalid)
        );
        assert_eq!(key.identity().verify(exit.shared_secret(), &replayed), Ok(()));
    }

    #[test]
    fn test_pkcs8_round_trip() {
        let rng = aws_lc_rs::rand::SystemRandom::new();
        let der = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let a = ExitKey::from_pkcs8(der.as_ref()).unwrap();
        let b = ExitKey::from_pkcs8(der.as_ref()).unwrap();
        assert_eq!(a.identity(), b.identity());
        assert!(ExitKey::from_pkcs8(&[0u8; 16]).is_err());
    }
}

use core::fmt::{Debug, Formatter};

use crate::{
    crypto::random_array,
    error::DecodeError,
    specification::{E2E_HDR_LEN, E2E_MIN_LEN, SESSION_ADDR_LEN},
};

/// The 16-byte address of an E2E session.
///
/// It identifies the session regardless of which bridges or interfaces its
/// packets travel over.
#[derive(Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct SessionAddr([u8; SESSION_ADDR_LEN]);

impl SessionAddr {
    /// Generates a random session address.
    pub fn random() -> Self {
        Self(random_array())
    }

    /// Returns the address bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_ADDR_LEN] {
        &self.0
    }
}

impl From<[u8; SESSION_ADDR_LEN]> for SessionAddr {
    fn from(value: [u8; SESSION_ADDR_LEN]) -> Self {
        Self(value)
    }
}

impl Debug for SessionAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "SessionAddr(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// One E2E datagram.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct E2ePacket {
    pub(crate) session: SessionAddr,
    pub(crate) sn: u64,
    pub(crate) ack: u64,
    pub(crate) body: Vec<u8>,
}

impl E2ePacket {
    /// Serializes the packet with an empty padding chunk. Fails if the body
    /// does not fit its 16-bit length field.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        let body_len = u16::try_from(self.body.len()).map_err(|_| DecodeError::RecordTooLarge {
            len: self.body.len(),
        })?;
        let mut out = Vec::with_capacity(E2E_MIN_LEN + self.body.len());
        out.extend_from_slice(self.session.as_bytes());
        out.extend_from_slice(&self.sn.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&body_len.to_be_bytes());
        out.extend_from_slice(&self.body);
        out.extend_from_slice(&0u16.to_be_bytes());
        Ok(out)
    }

    pub(crate) fn decode(wire: &[u8]) -> Result<Self, DecodeError> {
        if wire.len() < E2E_MIN_LEN {
            return Err(DecodeError::Truncated { len: wire.len() });
        }
        let (header, rest) = wire.split_at(E2E_HDR_LEN);
        let session = SessionAddr(
            header[..SESSION_ADDR_LEN]
                .try_into()
                .map_err(|_| DecodeError::MalformedPacket)?,
        );
        let sn = read_u64(&header[16..24])?;
        let ack = read_u64(&header[24..32])?;

        let (body, rest) = read_chunk(rest)?;
        let (_padding, rest) = read_chunk(rest)?;
        if !rest.is_empty() {
            return Err(DecodeError::MalformedPacket);
        }
        Ok(Self {
            session,
            sn,
            ack,
            body: body.to_vec(),
        })
    }
}

fn read_u64(bytes: &[u8]) -> Result<u64, DecodeError> {
    let bytes = bytes.try_into().map_err(|_| DecodeError::MalformedPacket)?;
    Ok(u64::from_be_bytes(bytes))
}

/// Splits a `u16_be len || len bytes` chunk off the front of `buf`.
fn read_chunk(buf: &[u8]) -> Result<(&[u8], &[u8]), DecodeError> {
    if buf.len() < 2 {
        return Err(DecodeError::MalformedPacket);
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let rest = &buf[2..];
    if rest.len() < len {
        return Err(DecodeError::MalformedPacket);
    }
    Ok(rest.split_at(len))
}

#[cfg(test)]
mod test {
    use super::*;

    fn packet(body: &[u8]) -> E2ePacket {
        E2ePacket {
            session: SessionAddr::from([0xab; 16]),
            sn: 7,
            ack: 0x0102_0304_0506_0708,
            body: body.to_vec(),
        }
    }

    /// Replaces the empty padding chunk with `len` zero bytes.
    fn padded(mut wire: Vec<u8>, len: u16) -> Vec<u8> {
        wire.truncate(wire.len() - 2);
        wire.extend_from_slice(&len.to_be_bytes());
        wire.resize(wire.len() + len as usize, 0);
        wire
    }

    #[test]
    fn test_layout() {
        let wire = packet(b"hi").encode().unwrap();
        assert_eq!(wire.len(), E2E_MIN_LEN + 2);
        assert_eq!(&wire[..16], &[0xab; 16]);
        assert_eq!(&wire[16..24], &7u64.to_be_bytes());
        assert_eq!(&wire[24..32], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[32..34], &[0, 2]);
        assert_eq!(&wire[34..36], b"hi");
        assert_eq!(&wire[36..38], &[0, 0]);
        assert_eq!(E2ePacket::decode(&wire), Ok(packet(b"hi")));

        // Padding from the peer is skipped.
        let wire = padded(wire, 3);
        assert_eq!(&wire[36..38], &[0, 3]);
        assert_eq!(E2ePacket::decode(&wire), Ok(packet(b"hi")));
    }

    #[test]
    fn test_oversized_body() {
        let body = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            packet(&body).encode(),
            Err(DecodeError::RecordTooLarge { len: body.len() })
        );
        let body = vec![0u8; u16::MAX as usize];
        let wire = packet(&body).encode().unwrap();
        assert_eq!(E2ePacket::decode(&wire).unwrap().body.len(), body.len());
    }

    #[test]
    fn test_empty_body() {
        let wire = packet(b"").encode().unwrap();
        assert_eq!(wire.len(), E2E_MIN_LEN);
        assert_eq!(E2ePacket::decode(&wire).unwrap().body, Vec::<u8>::new());
    }

    #[test]
    fn test_malformed() {
        let wire = padded(packet(b"hello").encode().unwrap(), 4);
        assert_eq!(
            E2ePacket::decode(&wire[..20]),
            Err(DecodeError::Truncated { len: 20 })
        );
        assert_eq!(
            E2ePacket::decode(&wire[..wire.len() - 1]),
            Err(DecodeError::MalformedPacket)
        );
        let mut trailing = wire.clone();
        trailing.push(0);
        assert_eq!(E2ePacket::decode(&trailing), Err(DecodeError::MalformedPacket));

        let mut long_body = wire;
        long_body[32] = 0xff;
        assert_eq!(E2ePacket::decode(&long_body), Err(DecodeError::MalformedPacket));
    }
}

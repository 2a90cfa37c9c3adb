//! All possible non-I/O transport errors.
//!
//! Packet layers (OBFS, E2E) absorb most of these internally and only count
//! them; stream layers (TSS, cshirt2) surface them and then stay dead.
use core::{
    error,
    fmt::{Display, Formatter},
};
use std::io::{self, ErrorKind};

/// Enumeration of all possible non-I/O transport errors.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Error {
    /// A handshake, packet or record could not be parsed.
    ///
    /// # Suggested error handling strategy
    ///
    /// Packet layers drop the datagram. On a stream layer this is fatal.
    Decode(DecodeError),

    /// Authentication of a handshake, packet or record failed.
    ///
    /// # Suggested error handling strategy
    ///
    /// Packet layers drop the datagram silently. On a stream layer this is
    /// fatal, and the underlying connection should be closed, ideally after a
    /// random delay so the failure is not observable to a prober.
    Auth(AuthError),

    /// A read or write deadline expired. The socket itself stays usable.
    Timeout,

    /// The socket was closed. Every subsequent operation returns this.
    Closed,

    /// A send was addressed to a session or peer with no usable path.
    PathUnknown,
}

/// Errors caused by malformed input.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum DecodeError {
    /// The TinySS handshake did not start with the expected magic string.
    BadMagic {
        /// The eight bytes received in place of the magic string.
        received: [u8; 8],
    },

    /// The input is shorter than the smallest valid encoding.
    Truncated {
        /// The length that was received.
        len: usize,
    },

    /// A record length field exceeds the protocol maximum.
    RecordTooLarge {
        /// The received length field.
        len: usize,
    },

    /// An E2E packet or a record body is internally inconsistent.
    MalformedPacket,

    /// A handshake public key has the wrong encoded length.
    InvalidHandshakeLength {
        /// The received length.
        len: usize,
    },
}

/// Errors caused by failed authentication.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum AuthError {
    /// An AEAD tag did not verify.
    AeadOpenFailed,

    /// The cshirt2 handshake MAC matched none of the accepted epochs.
    BadHandshakeMac,

    /// A cshirt2 record MAC did not verify. Records were reordered, replayed
    /// or tampered with.
    BadRecordMac,

    /// The cshirt2 handshake public key was seen recently. Somebody is
    /// replaying a captured handshake.
    ActiveProbing,

    /// The exit's signature over the TinySS shared secret did not verify
    /// against the pinned exit identity.
    ExitSignatureInvalid,

    /// A ticket's signature did not verify under the binder's key for its
    /// tier, or the ticket was already spent.
    TicketInvalid,
}

impl Error {
    /// Returns true if a stream layer must stop after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Timeout)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Decode(err) => write!(f, "Decode: {}", err),
            Error::Auth(err) => write!(f, "Auth: {}", err),
            Error::Timeout => write!(f, "Timeout"),
            Error::Closed => write!(f, "Closed"),
            Error::PathUnknown => write!(f, "PathUnknown"),
        }
    }
}

impl Display for DecodeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::BadMagic { received } => {
                write!(f, "BadMagic: received {:02x?}", received)
            }
            DecodeError::Truncated { len } => write!(f, "Truncated: received {} bytes", len),
            DecodeError::RecordTooLarge { len } => write!(f, "RecordTooLarge: received {}", len),
            DecodeError::MalformedPacket => write!(f, "MalformedPacket"),
            DecodeError::InvalidHandshakeLength { len } => {
                write!(f, "InvalidHandshakeLength: received {}", len)
            }
        }
    }
}

impl Display for AuthError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            AuthError::AeadOpenFailed => write!(f, "AeadOpenFailed"),
            AuthError::BadHandshakeMac => write!(f, "BadHandshakeMac"),
            AuthError::BadRecordMac => write!(f, "BadRecordMac"),
            AuthError::ActiveProbing => write!(f, "ActiveProbing"),
            AuthError::ExitSignatureInvalid => write!(f, "ExitSignatureInvalid"),
            AuthError::TicketInvalid => write!(f, "TicketInvalid"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Decode(err) => Some(err),
            Error::Auth(err) => Some(err),
            _ => None,
        }
    }
}

impl error::Error for DecodeError {}

impl error::Error for AuthError {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match e {
            Error::Timeout => ErrorKind::TimedOut,
            Error::Closed => ErrorKind::NotConnected,
            Error::PathUnknown => ErrorKind::NotFound,
            _ => ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}

impl From<DecodeError> for io::Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e).into()
    }
}

impl From<AuthError> for io::Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e).into()
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<AuthError> for Error {
    fn from(e: AuthError) -> Self {
        Error::Auth(e)
    }
}

/// Extracts the transport [`Error`] carried by an [`io::Error`], if any.
pub fn downcast(err: &io::Error) -> Option<&Error> {
    err.get_ref().and_then(|e| e.downcast_ref::<Error>())
}

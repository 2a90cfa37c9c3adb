//! Sans-I/O cshirt2 record reader and writer.
use std::io::{self, ErrorKind, Read, Write};

use rand::Rng;

use crate::{
    crypto::{DerivedKey, Keystream, blake2b_128, blake2b_256, blake2b_verify},
    error::{AuthError, DecodeError, Error},
    io_adapter::{RecordRead, RecordWrite},
    specification::{
        CSHIRT2_HDR_LEN, CSHIRT2_INNER_LEN_FIELD, CSHIRT2_MAC_LEN, CSHIRT2_MAX_INNER,
        CSHIRT2_PAD_MAX, CSHIRT2_PAD_THRESHOLD,
    },
};

/// Largest `enc_len` a reader accepts.
const MAX_BODY_LEN: usize = CSHIRT2_INNER_LEN_FIELD + CSHIRT2_MAX_INNER + CSHIRT2_PAD_MAX;

/// Offset of the plaintext inside a record buffer.
const INNER_OFFSET: usize = CSHIRT2_HDR_LEN + CSHIRT2_INNER_LEN_FIELD;

/// `mac_key <- Blake2b-256(mac_key, "")`
fn ratchet(mac_key: &mut DerivedKey) {
    *mac_key = DerivedKey::from(blake2b_256(mac_key.as_bytes(), &[]));
}

/// State Transition Diagram
///
/// ```text
///
///             |
///             V
///  +----> ReadHeader -->----+
///  |          |             |
///  |          V             |
///  |       ReadBody --->----+
///  |          |             |
///  |          V             V
///  +--- PayloadReady       Dead
///
/// ```
///
/// The whole record, MAC and header included, is kept in `buf` so that the
/// MAC can be checked over `enc_len || enc_body` in one pass.
#[derive(Debug)]
pub(crate) struct RecordReader {
    state: ReadState,
    buf: Vec<u8>,
    keystream: Keystream,
    mac_key: DerivedKey,
}

#[derive(Debug, Eq, PartialEq)]
enum ReadState {
    ReadHeader { n: usize },
    ReadBody { n: usize, total: usize },
    PayloadReady { n: usize, payload_len: usize },
    Eof,
    Dead(Error),
}

impl RecordReader {
    pub(crate) fn new(cipher: &DerivedKey, mac: &DerivedKey) -> Self {
        Self {
            state: ReadState::ReadHeader { n: 0 },
            buf: vec![0u8; CSHIRT2_HDR_LEN + MAX_BODY_LEN],
            keystream: Keystream::new(cipher),
            mac_key: mac.clone(),
        }
    }

    fn fail(&mut self, err: Error) -> io::Error {
        self.state = ReadState::Dead(err.clone());
        err.into()
    }

    fn read_record(&mut self, reader: &mut dyn Read) -> io::Result<usize> {
        loop {
            match self.state {
                ReadState::ReadHeader { n } if n < CSHIRT2_HDR_LEN => {
                    self.state = ReadState::ReadHeader {
                        n: n + handle_io_result!(reader.read(&mut self.buf[n..CSHIRT2_HDR_LEN])),
                    };
                }
                ReadState::ReadHeader { .. } => {
                    let mut len = [0u8; 2];
                    len.copy_from_slice(&self.buf[CSHIRT2_MAC_LEN..CSHIRT2_HDR_LEN]);
                    self.keystream.apply(&mut len);
                    let body_len = u16::from_be_bytes(len) as usize;
                    if body_len < CSHIRT2_INNER_LEN_FIELD {
                        return Err(self.fail(DecodeError::Truncated { len: body_len }.into()));
                    }
                    if body_len > MAX_BODY_LEN {
                        return Err(self.fail(DecodeError::RecordTooLarge { len: body_len }.into()));
                    }
                    self.state = ReadState::ReadBody {
                        n: CSHIRT2_HDR_LEN,
                        total: CSHIRT2_HDR_LEN + body_len,
                    };
                }
                ReadState::ReadBody { n, total } if n < total => {
                    self.state = ReadState::ReadBody {
                        n: n + handle_io_result!(reader.read(&mut self.buf[n..total])),
                        total,
                    };
                }
                ReadState::ReadBody { total, .. } => {
                    let (mac, sealed) = self.buf[..total].split_at_mut(CSHIRT2_MAC_LEN);
                    if !blake2b_verify(self.mac_key.as_bytes(), sealed, mac) {
                        return Err(self.fail(AuthError::BadRecordMac.into()));
                    }
                    ratchet(&mut self.mac_key);

                    let body = &mut sealed[CSHIRT2_HDR_LEN - CSHIRT2_MAC_LEN..];
                    self.keystream.apply(body);
                    let inner_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    if INNER_OFFSET + inner_len > total {
                        return Err(self.fail(DecodeError::MalformedPacket.into()));
                    }
                    self.state = ReadState::PayloadReady {
                        n: INNER_OFFSET,
                        payload_len: INNER_OFFSET + inner_len,
                    };
                    return Ok(total);
                }
                ReadState::PayloadReady { .. } => {
                    self.state = ReadState::ReadHeader { n: 0 };
                }
                ReadState::Eof => return Ok(0),
                ReadState::Dead(ref err) => return Err(err.clone().into()),
            }
        }
    }
}

impl RecordRead for RecordReader {
    fn read_wire(&mut self, wire: &mut dyn Read) -> io::Result<usize> {
        let n = self.read_record(wire)?;
        if n == 0 {
            self.state = ReadState::Eof;
        }
        Ok(n)
    }

    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self.state {
            ReadState::PayloadReady { n, payload_len } if n < payload_len => {
                Ok(&self.buf[n..payload_len])
            }
            ReadState::Eof => Ok(&[]),
            ReadState::Dead(ref err) => Err(err.clone().into()),
            _ => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn consume(&mut self, amt: usize) {
        if let ReadState::PayloadReady {
            ref mut n,
            payload_len,
        } = self.state
        {
            *n = core::cmp::min(*n + amt, payload_len);
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum WriteState {
    Wait,
    Write { n: usize, total: usize },
}

/// Frames plaintext as `mac || enc_len || enc_body`.
///
/// Writes of at most 3000 bytes get `uniform[0, 512)` bytes of padding;
/// larger ones go out unpadded, split at 16 KiB.
#[derive(Debug)]
pub(crate) struct RecordWriter {
    state: WriteState,
    buf: Vec<u8>,
    keystream: Keystream,
    mac_key: DerivedKey,
}

impl RecordWriter {
    pub(crate) fn new(cipher: &DerivedKey, mac: &DerivedKey) -> Self {
        Self {
            state: WriteState::Wait,
            buf: Vec::with_capacity(CSHIRT2_HDR_LEN + MAX_BODY_LEN),
            keystream: Keystream::new(cipher),
            mac_key: mac.clone(),
        }
    }
}

impl RecordWrite for RecordWriter {
    fn push(&mut self, plaintext: &[u8]) -> usize {
        if self.state != WriteState::Wait {
            return 0;
        }
        let k = core::cmp::min(plaintext.len(), CSHIRT2_MAX_INNER);
        let padding = if plaintext.len() <= CSHIRT2_PAD_THRESHOLD {
            rand::rng().random_range(0..CSHIRT2_PAD_MAX)
        } else {
            0
        };
        let body_len = CSHIRT2_INNER_LEN_FIELD + k + padding;

        self.buf.clear();
        self.buf.resize(CSHIRT2_MAC_LEN, 0);
        self.buf.extend_from_slice(&(body_len as u16).to_be_bytes());
        self.buf.extend_from_slice(&(k as u16).to_be_bytes());
        self.buf.extend_from_slice(&plaintext[..k]);
        self.buf.resize(CSHIRT2_HDR_LEN + body_len, 0);

        let (mac, sealed) = self.buf.split_at_mut(CSHIRT2_MAC_LEN);
        self.keystream.apply(sealed);
        mac.copy_from_slice(&blake2b_128(self.mac_key.as_bytes(), sealed));
        ratchet(&mut self.mac_key);

        self.state = WriteState::Write {
            n: 0,
            total: self.buf.len(),
        };
        k
    }

    fn write_wire(&mut self, writer: &mut dyn Write) -> io::Result<usize> {
        loop {
            match self.state {
                WriteState::Wait => return Err(ErrorKind::WouldBlock.into()),
                WriteState::Write { n, total } if n < total => {
                    self.state = WriteState::Write {
                        n: n + handle_io_result!(writer.write(&self.buf[n..total])),
                        total,
                    };
                }
                WriteState::Write { total, .. } => {
                    self.state = WriteState::Wait;
                    return Ok(total);
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{error::downcast, test::MockStream};

    fn keys() -> (DerivedKey, DerivedKey) {
        (DerivedKey::from([1u8; 32]), DerivedKey::from([2u8; 32]))
    }

    fn pair() -> (RecordWriter, RecordReader) {
        let (cipher, mac) = keys();
        (
            RecordWriter::new(&cipher, &mac),
            RecordReader::new(&cipher, &mac),
        )
    }

    fn write_record(writer: &mut RecordWriter, wire: &mut MockStream, data: &[u8]) -> usize {
        let k = writer.push(data);
        writer.write_wire(wire).unwrap();
        k
    }

    fn read_record(reader: &mut RecordReader, wire: &mut MockStream) -> io::Result<Vec<u8>> {
        reader.read_wire(wire)?;
        let data = reader.fill_buf()?.to_vec();
        reader.consume(data.len());
        Ok(data)
    }

    #[test]
    fn test_round_trip_and_padding() {
        let (mut writer, mut reader) = pair();
        let mut wire = MockStream::default();

        for data in [&b"hi"[..], &[0x33u8; CSHIRT2_PAD_THRESHOLD][..]] {
            assert_eq!(write_record(&mut writer, &mut wire, data), data.len());
            let min = CSHIRT2_HDR_LEN + CSHIRT2_INNER_LEN_FIELD + data.len();
            assert!(wire.buf.len() >= min);
            assert!(wire.buf.len() < min + CSHIRT2_PAD_MAX);
            assert_eq!(read_record(&mut reader, &mut wire).unwrap(), data);
            assert!(wire.buf.is_empty());
        }

        let big = vec![0x44; CSHIRT2_PAD_THRESHOLD + 1];
        write_record(&mut writer, &mut wire, &big);
        assert_eq!(
            wire.buf.len(),
            CSHIRT2_HDR_LEN + CSHIRT2_INNER_LEN_FIELD + big.len()
        );
        assert_eq!(read_record(&mut reader, &mut wire).unwrap(), big);
    }

    #[test]
    fn test_large_writes_split() {
        let (mut writer, mut reader) = pair();
        let mut wire = MockStream::default();
        let data: Vec<u8> = (0..40_000).map(|i| i as u8).collect();

        let mut rest = &data[..];
        let mut records = 0;
        while !rest.is_empty() {
            let k = write_record(&mut writer, &mut wire, rest);
            assert!(k <= CSHIRT2_MAX_INNER);
            rest = &rest[k..];
            records += 1;
        }
        assert_eq!(records, 3);

        let mut out = Vec::new();
        for _ in 0..records {
            out.extend(read_record(&mut reader, &mut wire).unwrap());
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_mac_key_ratchet() {
        let (mut writer, mut reader) = pair();
        let mut wire = MockStream::default();
        let (_, mut expected) = keys();

        for i in 0..5u8 {
            write_record(&mut writer, &mut wire, &[i; 10]);
            read_record(&mut reader, &mut wire).unwrap();
            expected = DerivedKey::from(blake2b_256(expected.as_bytes(), &[]));
            assert_eq!(writer.mac_key, expected);
            assert_eq!(reader.mac_key, expected);
        }
    }

    #[test]
    fn test_reordered_records_fail() {
        let (mut writer, mut reader) = pair();
        let mut first = MockStream::default();
        let mut second = MockStream::default();
        write_record(&mut writer, &mut first, b"one");
        write_record(&mut writer, &mut second, b"two");

        let err = read_record(&mut reader, &mut second).unwrap_err();
        assert_eq!(
            downcast(&err),
            Some(&Error::Auth(AuthError::BadRecordMac))
        );
    }

    #[test]
    fn test_tampering_is_fatal_and_sticky() {
        let (mut writer, mut reader) = pair();
        let mut wire = MockStream::default();
        write_record(&mut writer, &mut wire, b"payload");
        let last = wire.buf.len() - 1;
        wire.buf[last] ^= 0x80;

        let expected = Some(Error::Auth(AuthError::BadRecordMac));
        let err = read_record(&mut reader, &mut wire).unwrap_err();
        assert_eq!(downcast(&err).cloned(), expected);
        let err = reader.read_wire(&mut wire).unwrap_err();
        assert_eq!(downcast(&err).cloned(), expected);
    }

    #[test]
    fn test_partial_reads() {
        let (mut writer, mut reader) = pair();
        let mut wire = MockStream::default();
        write_record(&mut writer, &mut wire, b"byte by byte");

        let record = core::mem::take(&mut wire.buf);
        let (last, head) = record.split_last().unwrap();
        for byte in head {
            wire.buf.push(*byte);
            let err = reader.read_wire(&mut wire).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::WouldBlock);
        }
        wire.buf.push(*last);
        reader.read_wire(&mut wire).unwrap();
        assert_eq!(reader.fill_buf().unwrap(), b"byte by byte");
    }
}

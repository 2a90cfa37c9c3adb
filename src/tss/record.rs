//! Sans-I/O TinySS record reader and writer.
use std::io::{self, ErrorKind, Read, Write};

use crate::{
    crypto::{CounterCipher, DerivedKey},
    error::{AuthError, DecodeError, Error},
    io_adapter::{RecordRead, RecordWrite},
    specification::{AEAD_TAG_LEN, TSS_LEN_FIELD, TSS_MAX_CIPHERTEXT, TSS_MAX_PLAINTEXT},
};

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
#[derive(Debug)]
pub(crate) struct RecordReader {
    state: ReadState,
    header: [u8; TSS_LEN_FIELD],
    buf: Vec<u8>,
    cipher: CounterCipher,
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
    pub(crate) fn new(key: &DerivedKey) -> Self {
        Self {
            state: ReadState::ReadHeader { n: 0 },
            header: [0u8; TSS_LEN_FIELD],
            buf: vec![0u8; TSS_MAX_CIPHERTEXT],
            cipher: CounterCipher::new(key),
        }
    }

    fn fail(&mut self, err: Error) -> io::Error {
        self.state = ReadState::Dead(err.clone());
        err.into()
    }

    fn read_record(&mut self, reader: &mut dyn Read) -> io::Result<usize> {
        loop {
            match self.state {
                ReadState::ReadHeader { n } if n < TSS_LEN_FIELD => {
                    self.state = ReadState::ReadHeader {
                        n: n + handle_io_result!(reader.read(&mut self.header[n..])),
                    };
                }
                ReadState::ReadHeader { .. } => {
                    let total = u16::from_be_bytes(self.header) as usize;
                    if total < AEAD_TAG_LEN {
                        return Err(self.fail(DecodeError::Truncated { len: total }.into()));
                    }
                    if total > TSS_MAX_CIPHERTEXT {
                        return Err(self.fail(DecodeError::RecordTooLarge { len: total }.into()));
                    }
                    self.state = ReadState::ReadBody { n: 0, total };
                }
                ReadState::ReadBody { n, total } if n < total => {
                    self.state = ReadState::ReadBody {
                        n: n + handle_io_result!(reader.read(&mut self.buf[n..total])),
                        total,
                    };
                }
                ReadState::ReadBody { total, .. } => {
                    if self.cipher.open(&mut self.buf[..total]).is_err() {
                        return Err(self.fail(AuthError::AeadOpenFailed.into()));
                    }
                    self.state = ReadState::PayloadReady {
                        n: 0,
                        payload_len: total - AEAD_TAG_LEN,
                    };
                    return Ok(TSS_LEN_FIELD + total);
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

/// State Transition Diagram
/// ```text
///
///          |
///          V
///   +---> Wait
///   |      |
///   |      V
///   +--- Write
///
/// ```
#[derive(Debug)]
pub(crate) struct RecordWriter {
    state: WriteState,
    buf: Vec<u8>,
    cipher: CounterCipher,
}

#[derive(Debug, Eq, PartialEq)]
enum WriteState {
    Wait,
    Write { n: usize, total: usize },
}

impl RecordWriter {
    pub(crate) fn new(key: &DerivedKey) -> Self {
        Self {
            state: WriteState::Wait,
            buf: Vec::with_capacity(TSS_LEN_FIELD + TSS_MAX_CIPHERTEXT),
            cipher: CounterCipher::new(key),
        }
    }
}

impl RecordWrite for RecordWriter {
    /// Seals up to 32 KiB of `plaintext` into one record.
    fn push(&mut self, plaintext: &[u8]) -> usize {
        if self.state != WriteState::Wait {
            return 0;
        }
        let k = core::cmp::min(plaintext.len(), TSS_MAX_PLAINTEXT);
        let ct_len = k + AEAD_TAG_LEN;

        self.buf.clear();
        self.buf.extend_from_slice(&(ct_len as u16).to_be_bytes());
        self.buf.extend_from_slice(&plaintext[..k]);
        self.buf.resize(TSS_LEN_FIELD + ct_len, 0);
        self.cipher.seal(&mut self.buf[TSS_LEN_FIELD..]);

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

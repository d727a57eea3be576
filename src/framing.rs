// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

//! Length-prefixed framing for security tokens.
//!
//! GSSAPI operates on whole tokens, so token boundaries have to
//! survive the trip across a stream socket exactly.  Each token is
//! sent as a 4-byte big-endian length followed by the raw token
//! bytes.  Nothing here knows anything about the protocol being
//! spoken; [send_token] and [get_token] simply move one opaque
//! [Token] at a time.
//!
//! Both directions loop over short reads and writes, and retry
//! low-level calls that fail with [ErrorKind::Interrupted].  Any
//! other failure is reported to the caller, which is expected to
//! tear down the connection.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::ops::Deref;

use log::trace;

use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Upper bound (exclusive) on the length of a single token.
pub const MAX_TOKEN_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX_SIZE: usize = 4;

/// An owned security token.
///
/// The framing layer refuses to send or receive tokens of
/// [MAX_TOKEN_LEN] bytes or more.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Token(Vec<u8>);

/// Errors that can occur while moving tokens.
#[derive(Debug)]
pub enum FramingError {
    /// Low-level IO error.
    IO {
        /// IO error.
        error: Error
    },
    /// The stream ended partway through a frame.
    Truncated {
        /// Number of bytes that were expected.
        expected: usize,
        /// Number of bytes actually read.
        actual: usize
    },
    /// The token length is at or over [MAX_TOKEN_LEN].
    TooLarge {
        /// The offending length.
        len: usize
    }
}

impl Token {
    /// Take the bytes out of this token.
    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for Token {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for Token {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Token {
    #[inline]
    fn from(val: Vec<u8>) -> Token {
        Token(val)
    }
}

impl From<&'_ [u8]> for Token {
    #[inline]
    fn from(val: &[u8]) -> Token {
        Token(val.to_vec())
    }
}

impl From<Token> for Vec<u8> {
    #[inline]
    fn from(val: Token) -> Vec<u8> {
        val.0
    }
}

/// Read until `buf` is full or the stream ends, retrying interrupted
/// calls.
///
/// Returns the number of bytes read, which is less than the size of
/// `buf` only if the stream ended.
fn read_full<R>(
    stream: &mut R,
    buf: &mut [u8]
) -> Result<usize, Error>
where
    R: Read {
    let mut nread = 0;

    while nread < buf.len() {
        match stream.read(&mut buf[nread..]) {
            Ok(0) => break,
            Ok(n) => nread += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                trace!(target: "bpr-framing",
                       "read interrupted after {} bytes, retrying",
                       nread);
            }
            Err(err) => return Err(err)
        }
    }

    Ok(nread)
}

/// Write all of `buf`, retrying interrupted calls.
fn write_full<W>(
    stream: &mut W,
    buf: &[u8]
) -> Result<(), Error>
where
    W: Write {
    let mut nwritten = 0;

    while nwritten < buf.len() {
        match stream.write(&buf[nwritten..]) {
            Ok(0) => {
                return Err(Error::new(
                    ErrorKind::WriteZero,
                    "stream accepted no bytes"
                ))
            }
            Ok(n) => nwritten += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => {
                trace!(target: "bpr-framing",
                       "write interrupted after {} bytes, retrying",
                       nwritten);
            }
            Err(err) => return Err(err)
        }
    }

    Ok(())
}

/// Send a single token, prefixed by its length.
pub fn send_token<W>(
    stream: &mut W,
    token: &[u8]
) -> Result<(), FramingError>
where
    W: Write {
    let len = token.len();

    if len >= MAX_TOKEN_LEN {
        return Err(FramingError::TooLarge { len: len });
    }

    let mut buf = Vec::with_capacity(len + LEN_PREFIX_SIZE);

    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.extend_from_slice(token);

    trace!(target: "bpr-framing",
           "sending token of {} bytes",
           len);

    write_full(stream, &buf).map_err(|err| FramingError::IO { error: err })?;

    stream.flush().map_err(|err| FramingError::IO { error: err })
}

/// Receive a single token.
///
/// Returns `None` if the stream ended cleanly before any part of a
/// length prefix was read.  A stream that ends anywhere else is a
/// [Truncated](FramingError::Truncated) error.
pub fn get_token<R>(stream: &mut R) -> Result<Option<Token>, FramingError>
where
    R: Read {
    let mut prefix = [0; LEN_PREFIX_SIZE];

    match read_full(stream, &mut prefix)
        .map_err(|err| FramingError::IO { error: err })?
    {
        0 => {
            trace!(target: "bpr-framing",
                   "end of stream while waiting for token");

            return Ok(None);
        }
        LEN_PREFIX_SIZE => {}
        n => {
            return Err(FramingError::Truncated {
                expected: LEN_PREFIX_SIZE,
                actual: n
            })
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;

    if len >= MAX_TOKEN_LEN {
        return Err(FramingError::TooLarge { len: len });
    }

    let mut buf = vec![0; len];
    let n = read_full(stream, &mut buf)
        .map_err(|err| FramingError::IO { error: err })?;

    if n < len {
        return Err(FramingError::Truncated {
            expected: len,
            actual: n
        });
    }

    trace!(target: "bpr-framing",
           "received token of {} bytes",
           len);

    Ok(Some(Token(buf)))
}

impl ScopedError for FramingError {
    fn scope(&self) -> ErrorScope {
        match self {
            FramingError::IO { error } => error.scope(),
            FramingError::Truncated { .. } => ErrorScope::Session,
            FramingError::TooLarge { .. } => ErrorScope::External
        }
    }
}

impl Display for FramingError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            FramingError::IO { error } => error.fmt(f),
            FramingError::Truncated { expected, actual } => write!(
                f,
                "stream ended after {} of {} bytes",
                actual, expected
            ),
            FramingError::TooLarge { len } => write!(
                f,
                "token length {} exceeds limit of {} bytes",
                len, MAX_TOKEN_LEN
            )
        }
    }
}

/// Stream that hands out at most a few bytes per call, and fails
/// every other call with [ErrorKind::Interrupted].
#[cfg(test)]
struct Choppy<S> {
    inner: S,
    chunk: usize,
    interrupt: bool
}

#[cfg(test)]
impl<S> Choppy<S> {
    fn new(inner: S) -> Self {
        Choppy {
            inner: inner,
            chunk: 3,
            interrupt: true
        }
    }
}

#[cfg(test)]
impl<S: Read> Read for Choppy<S> {
    fn read(
        &mut self,
        buf: &mut [u8]
    ) -> Result<usize, Error> {
        self.interrupt = !self.interrupt;

        if self.interrupt {
            Err(Error::new(ErrorKind::Interrupted, "signal"))
        } else {
            let len = buf.len().min(self.chunk);

            self.inner.read(&mut buf[..len])
        }
    }
}

#[cfg(test)]
impl<S: Write> Write for Choppy<S> {
    fn write(
        &mut self,
        buf: &[u8]
    ) -> Result<usize, Error> {
        self.interrupt = !self.interrupt;

        if self.interrupt {
            Err(Error::new(ErrorKind::Interrupted, "signal"))
        } else {
            let len = buf.len().min(self.chunk);

            self.inner.write(&buf[..len])
        }
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.inner.flush()
    }
}

#[cfg(test)]
use std::io::Cursor;

#[cfg(test)]
use crate::init;

#[cfg(test)]
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 7) as u8).collect()
}

#[test]
fn test_round_trip_lengths() {
    init();

    for len in [0, 1, 255, 256, 65535, 65536, 65537, 200000] {
        let data = pattern(len);
        let mut wire = Vec::new();

        send_token(&mut wire, &data).unwrap();

        assert_eq!(len + 4, wire.len());
        assert_eq!(&(len as u32).to_be_bytes(), &wire[..4]);

        let mut reader = Cursor::new(wire);
        let token = get_token(&mut reader).unwrap().unwrap();

        assert_eq!(data, token.into_bytes());
    }
}

#[test]
fn test_round_trip_largest() {
    init();

    let data = pattern(MAX_TOKEN_LEN - 1);
    let mut wire = Vec::new();

    send_token(&mut wire, &data).unwrap();

    let token = get_token(&mut Cursor::new(wire)).unwrap().unwrap();

    assert_eq!(MAX_TOKEN_LEN - 1, token.len());
    assert!(token.as_ref() == &data[..]);
}

#[test]
fn test_sequence_of_tokens() {
    init();

    let first = pattern(17);
    let second = pattern(0);
    let third = pattern(4099);
    let mut wire = Vec::new();

    send_token(&mut wire, &first).unwrap();
    send_token(&mut wire, &second).unwrap();
    send_token(&mut wire, &third).unwrap();

    let mut reader = Cursor::new(wire);

    assert_eq!(first, get_token(&mut reader).unwrap().unwrap().into_bytes());
    assert_eq!(second, get_token(&mut reader).unwrap().unwrap().into_bytes());
    assert_eq!(third, get_token(&mut reader).unwrap().unwrap().into_bytes());
    assert!(get_token(&mut reader).unwrap().is_none());
}

#[test]
fn test_interrupted_io_is_retried() {
    init();

    let data = pattern(1000);
    let mut writer = Choppy::new(Vec::new());

    send_token(&mut writer, &data).unwrap();

    let mut reader = Choppy::new(Cursor::new(writer.inner));
    let token = get_token(&mut reader).unwrap().unwrap();

    assert_eq!(data, token.into_bytes());
}

#[test]
fn test_clean_eof() {
    init();

    let mut reader = Cursor::new(Vec::new());

    assert!(get_token(&mut reader).unwrap().is_none());
}

#[test]
fn test_truncated_prefix() {
    init();

    let mut reader = Cursor::new(vec![0x00, 0x00]);

    match get_token(&mut reader) {
        Err(FramingError::Truncated { expected, actual }) => {
            assert_eq!(4, expected);
            assert_eq!(2, actual);
        }
        other => panic!("expected truncation, got {:?}", other)
    }
}

#[test]
fn test_truncated_body() {
    init();

    let mut wire = Vec::new();

    send_token(&mut wire, &pattern(100)).unwrap();
    wire.truncate(50);

    match get_token(&mut Cursor::new(wire)) {
        Err(FramingError::Truncated { expected, actual }) => {
            assert_eq!(100, expected);
            assert_eq!(46, actual);
        }
        other => panic!("expected truncation, got {:?}", other)
    }
}

#[test]
fn test_reject_oversized_prefix() {
    init();

    // No body follows; an attempt to read one would report
    // truncation rather than the size violation.
    for len in [MAX_TOKEN_LEN as u32, MAX_TOKEN_LEN as u32 + 1, u32::MAX] {
        let mut reader = Cursor::new(len.to_be_bytes().to_vec());

        match get_token(&mut reader) {
            Err(FramingError::TooLarge { len: actual }) => {
                assert_eq!(len as usize, actual);
                assert_eq!(ErrorScope::External, FramingError::TooLarge {
                    len: actual
                }
                .scope());
            }
            other => panic!("expected size rejection, got {:?}", other)
        }
    }
}

#[test]
fn test_reject_oversized_send() {
    init();

    let data = vec![0; MAX_TOKEN_LEN];
    let mut wire = Vec::new();

    assert!(matches!(
        send_token(&mut wire, &data),
        Err(FramingError::TooLarge { .. })
    ));
    assert!(wire.is_empty());
}

#[test]
fn test_upper_length_bytes_are_honored() {
    init();

    // Lengths that need the upper half of the prefix must not be
    // masked down to 16 bits.
    let data = pattern(0x0001_0001);
    let mut wire = Vec::new();

    send_token(&mut wire, &data).unwrap();

    assert_eq!([0x00, 0x01, 0x00, 0x01], wire[..4]);

    let token = get_token(&mut Cursor::new(wire)).unwrap().unwrap();

    assert_eq!(0x0001_0001, token.len());
}

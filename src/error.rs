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

//! Error classification.
//!
//! Every error type in this package implements [ScopedError], which
//! reports how far the damage of an error extends.  The delegation
//! protocol never retries a step; instead, the scope tells the caller
//! whether to drop the current connection and carry on, or to stop
//! the whole process.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;

/// The extent of the damage caused by an error.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorScope {
    /// The error is confined to the current connection.
    ///
    /// The connection should be torn down; other connections are
    /// unaffected.
    Session,
    /// The peer misbehaved or could not be trusted.
    ///
    /// This covers protocol violations and identity mismatches.  As
    /// with [Session](ErrorScope::Session), only the current
    /// connection is affected.
    External,
    /// A local resource (file, socket, credential) could not be used.
    ///
    /// This will likely persist across connections.
    System,
    /// The process cannot safely continue.
    Unrecoverable
}

/// Trait for errors that can report their [ErrorScope].
pub trait ScopedError {
    /// Get the scope of this error.
    fn scope(&self) -> ErrorScope;

    /// Whether the process can continue after this error.
    #[inline]
    fn is_fatal(&self) -> bool {
        self.scope() == ErrorScope::Unrecoverable
    }
}

impl ScopedError for Error {
    fn scope(&self) -> ErrorScope {
        match self.kind() {
            ErrorKind::TimedOut |
            ErrorKind::WouldBlock |
            ErrorKind::ConnectionReset |
            ErrorKind::ConnectionAborted |
            ErrorKind::ConnectionRefused |
            ErrorKind::BrokenPipe |
            ErrorKind::UnexpectedEof |
            ErrorKind::Interrupted => ErrorScope::Session,
            ErrorKind::InvalidData => ErrorScope::External,
            _ => ErrorScope::System
        }
    }
}

impl Display for ErrorScope {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ErrorScope::Session => write!(f, "session"),
            ErrorScope::External => write!(f, "external"),
            ErrorScope::System => write!(f, "system"),
            ErrorScope::Unrecoverable => write!(f, "unrecoverable")
        }
    }
}

#[test]
fn test_io_error_scopes() {
    let timeout = Error::new(ErrorKind::TimedOut, "timed out");
    let eof = Error::new(ErrorKind::UnexpectedEof, "eof");
    let denied = Error::new(ErrorKind::PermissionDenied, "denied");
    let garbage = Error::new(ErrorKind::InvalidData, "garbage");

    assert_eq!(ErrorScope::Session, timeout.scope());
    assert_eq!(ErrorScope::Session, eof.scope());
    assert_eq!(ErrorScope::System, denied.scope());
    assert_eq!(ErrorScope::External, garbage.scope());
    assert!(!denied.is_fatal());
}

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

//! Rendezvous between client and server.
//!
//! Servers do not register anywhere.  Instead, a server binds the
//! first free port in a well-known range, and announces the job it
//! is watching to every connection it accepts.  A client scans the
//! same range on the worker node until it finds a server announcing
//! the job it is looking for.
//!
//! # Wire Format
//!
//! Immediately after accepting, the server sends the job identifier
//! followed by a single NUL byte.  This is the only unframed,
//! unprotected message in the protocol.
//!
//! After that, the client sends an 8-byte [Opcode].  A client that
//! has found the wrong server sends [Opcode::WrongJob] and
//! disconnects.
//!
//! # Job Identifiers
//!
//! Batch systems decorate job identifiers differently depending on
//! who is asking; the same job might be `1234.ce.example.org`,
//! `pbs/20240101/1234.ce.example.org`, or just `1234`.  Identifiers
//! are compared only after [normalize_job_id] reduces them to the
//! bare job number.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpListener;
use std::net::TcpStream;
use std::net::ToSocketAddrs;
use std::time::Duration;

use log::debug;
use log::info;
use log::trace;
use log::warn;
use nix::errno::Errno;
use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;

use crate::config::PortRange;
use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Length of an opcode on the wire.
pub const OPCODE_LEN: usize = 8;

/// Longest job identifier accepted during rendezvous.
pub const MAX_JOB_ID_LEN: usize = 1024;

/// Backlog of the rendezvous listener.
const LISTEN_BACKLOG: i32 = 1;

/// Smallest usable connect timeout.
const MIN_CONNECT_TIMEOUT: Duration = Duration::from_millis(1);

/// Negotiation opcodes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Opcode {
    /// Client will delegate a new proxy (`OP:DELE`).
    Delegate,
    /// Client will send its proxy file directly (`OP:SEND`).
    Send,
    /// Server accepts the requested operation (`OP:OKOK`).
    Ok,
    /// Server refuses the requested operation (`OP:ERRR`).
    Error,
    /// Client was looking for a different job (`OP:WJOB`).
    WrongJob
}

/// Errors that can occur during rendezvous.
#[derive(Debug)]
pub enum RendezvousError {
    /// Low-level IO error.
    IO {
        /// IO error.
        error: Error
    },
    /// The worker node name could not be resolved for any port.
    Resolution {
        /// Worker node name.
        host: String
    },
    /// No server in the range announced the job.
    NotFound {
        /// Job that was being looked for.
        job: String
    },
    /// No port in the range could be bound.
    Bind {
        /// Range that was tried.
        range: PortRange
    },
    /// The announced job identifier was not terminated in time.
    JobIdTooLong,
    /// The announced job identifier was not valid UTF-8.
    BadJobId
}

/// Reduce a job identifier to the form used for matching.
///
/// This drops everything up to and including the last `/`, and then
/// everything from the first `.` onward.  Applying it twice has no
/// further effect.  Identifiers differing only after the first `.`,
/// such as `1234.ce.a.org` and `1234.ce.b.org`, match each other.
pub fn normalize_job_id(id: &str) -> &str {
    let id = match id.rfind('/') {
        Some(pos) => &id[pos + 1..],
        None => id
    };

    match id.find('.') {
        Some(pos) => &id[..pos],
        None => id
    }
}

impl Opcode {
    /// Wire encoding of this opcode.
    pub fn as_bytes(&self) -> &'static [u8; OPCODE_LEN] {
        match self {
            Opcode::Delegate => b"OP:DELE\0",
            Opcode::Send => b"OP:SEND\0",
            Opcode::Ok => b"OP:OKOK\0",
            Opcode::Error => b"OP:ERRR\0",
            Opcode::WrongJob => b"OP:WJOB\0"
        }
    }

    /// Decode an opcode, if it is one.
    pub fn from_bytes(buf: &[u8; OPCODE_LEN]) -> Option<Opcode> {
        [
            Opcode::Delegate,
            Opcode::Send,
            Opcode::Ok,
            Opcode::Error,
            Opcode::WrongJob
        ]
        .iter()
        .copied()
        .find(|op| op.as_bytes() == buf)
    }

    /// Write this opcode to `stream`.
    pub fn write<W>(
        &self,
        stream: &mut W
    ) -> Result<(), Error>
    where
        W: Write {
        trace!(target: "bpr-rendezvous",
               "sending {}",
               self);

        stream.write_all(self.as_bytes())?;
        stream.flush()
    }

    /// Read an opcode from `stream`.
    ///
    /// This produces the raw bytes if they are not a known opcode.
    pub fn read<R>(
        stream: &mut R
    ) -> Result<Result<Opcode, [u8; OPCODE_LEN]>, Error>
    where
        R: Read {
        let mut buf = [0; OPCODE_LEN];

        stream.read_exact(&mut buf)?;

        Ok(Opcode::from_bytes(&buf).ok_or(buf))
    }
}

/// Announce `job_id` on a freshly accepted connection.
pub fn send_job_id<W>(
    stream: &mut W,
    job_id: &str
) -> Result<(), Error>
where
    W: Write {
    let mut buf = Vec::with_capacity(job_id.len() + 1);

    buf.extend_from_slice(job_id.as_bytes());
    buf.push(0);

    stream.write_all(&buf)?;
    stream.flush()
}

/// Read the NUL-terminated job identifier announced by a server.
///
/// This reads one byte at a time, so nothing past the terminator is
/// consumed.
pub fn read_job_id<R>(stream: &mut R) -> Result<String, RendezvousError>
where
    R: Read {
    let mut buf = Vec::new();
    let mut byte = [0; 1];

    loop {
        match stream.read(&mut byte) {
            Ok(0) => {
                return Err(RendezvousError::IO {
                    error: Error::from(ErrorKind::UnexpectedEof)
                })
            }
            Ok(_) if byte[0] == 0 => {
                return String::from_utf8(buf)
                    .map_err(|_| RendezvousError::BadJobId)
            }
            Ok(_) if buf.len() >= MAX_JOB_ID_LEN => {
                return Err(RendezvousError::JobIdTooLong)
            }
            Ok(_) => buf.push(byte[0]),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(RendezvousError::IO { error: err })
        }
    }
}

fn bind_port(addr: SocketAddr) -> Result<TcpListener, Error> {
    let socket =
        Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

/// Address to retry on after `err` binding `addr`, if any.
///
/// Hosts with IPv6 disabled cannot create IPv6 sockets at all; the
/// IPv6 wildcard then falls back to the IPv4 wildcard.
fn ipv4_fallback(
    addr: IpAddr,
    err: &Error
) -> Option<IpAddr> {
    match addr {
        IpAddr::V6(v6)
            if v6.is_unspecified() &&
                err.raw_os_error() == Some(Errno::EAFNOSUPPORT as i32) =>
        {
            Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        }
        _ => None
    }
}

/// Bind the first free port in `range` on `addr`.
pub fn bind_in_range(
    addr: IpAddr,
    range: &PortRange
) -> Result<TcpListener, RendezvousError> {
    for port in range.ports() {
        let sockaddr = SocketAddr::new(addr, port);

        match bind_port(sockaddr) {
            Ok(listener) => {
                info!(target: "bpr-rendezvous",
                      "listening on {}",
                      sockaddr);

                return Ok(listener);
            }
            Err(err) => {
                if let Some(fallback) = ipv4_fallback(addr, &err) {
                    info!(target: "bpr-rendezvous",
                          "IPv6 is unavailable ({}), listening on {}",
                          err, fallback);

                    return bind_in_range(fallback, range);
                }

                trace!(target: "bpr-rendezvous",
                       "could not bind {} ({})",
                       sockaddr, err);
            }
        }
    }

    Err(RendezvousError::Bind {
        range: range.clone()
    })
}

/// Connect to `addr` and read the job it announces.
fn probe(
    addr: SocketAddr,
    timeout: Duration
) -> Result<(TcpStream, String), RendezvousError> {
    let timeout = timeout.max(MIN_CONNECT_TIMEOUT);
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|err| RendezvousError::IO { error: err })?;

    stream
        .set_read_timeout(Some(timeout))
        .map_err(|err| RendezvousError::IO { error: err })?;

    let job_id = read_job_id(&mut stream)?;

    stream
        .set_read_timeout(None)
        .map_err(|err| RendezvousError::IO { error: err })?;

    Ok((stream, job_id))
}

/// Find the server on `host` that is watching `job_id`.
///
/// Every port in `range` is tried in order, and every address `host`
/// resolves to for that port.  Servers announcing some other job are
/// told so with [Opcode::WrongJob] and skipped.
pub fn discover(
    host: &str,
    range: &PortRange,
    job_id: &str,
    timeout: Duration
) -> Result<(TcpStream, SocketAddr), RendezvousError> {
    let target = normalize_job_id(job_id);
    let mut resolved = false;

    debug!(target: "bpr-rendezvous",
           "looking for job {} on {} ports {}",
           target, host, range);

    for port in range.ports() {
        let addrs = match (host, port).to_socket_addrs() {
            Ok(addrs) => {
                resolved = true;

                addrs
            }
            Err(err) => {
                trace!(target: "bpr-rendezvous",
                       "could not resolve {}:{} ({})",
                       host, port, err);

                continue;
            }
        };

        for addr in addrs {
            match probe(addr, timeout) {
                Ok((stream, announced))
                    if normalize_job_id(&announced) == target =>
                {
                    info!(target: "bpr-rendezvous",
                          "found job {} at {}",
                          target, addr);

                    return Ok((stream, addr));
                }
                Ok((mut stream, announced)) => {
                    debug!(target: "bpr-rendezvous",
                           "{} is watching job {}, not {}",
                           addr, announced, target);

                    if let Err(err) = Opcode::WrongJob.write(&mut stream) {
                        trace!(target: "bpr-rendezvous",
                               "could not decline {} ({})",
                               addr, err);
                    }

                    if let Err(err) = stream.shutdown(Shutdown::Both) {
                        trace!(target: "bpr-rendezvous",
                               "error shutting down {} ({})",
                               addr, err);
                    }
                }
                Err(err) => {
                    trace!(target: "bpr-rendezvous",
                           "no usable server at {} ({})",
                           addr, err);
                }
            }
        }
    }

    if resolved {
        warn!(target: "bpr-rendezvous",
              "no server on {} is watching job {}",
              host, target);

        Err(RendezvousError::NotFound {
            job: target.to_string()
        })
    } else {
        Err(RendezvousError::Resolution {
            host: host.to_string()
        })
    }
}

impl ScopedError for RendezvousError {
    fn scope(&self) -> ErrorScope {
        match self {
            RendezvousError::IO { error } => error.scope(),
            RendezvousError::Resolution { .. } |
            RendezvousError::NotFound { .. } => ErrorScope::External,
            RendezvousError::Bind { .. } => ErrorScope::Unrecoverable,
            RendezvousError::JobIdTooLong | RendezvousError::BadJobId => {
                ErrorScope::Session
            }
        }
    }
}

impl Display for Opcode {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        let bytes = self.as_bytes();

        write!(f, "{}", String::from_utf8_lossy(&bytes[..OPCODE_LEN - 1]))
    }
}

impl Display for RendezvousError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            RendezvousError::IO { error } => error.fmt(f),
            RendezvousError::Resolution { host } => {
                write!(f, "could not resolve {}", host)
            }
            RendezvousError::NotFound { job } => {
                write!(f, "no server found for job {}", job)
            }
            RendezvousError::Bind { range } => {
                write!(f, "could not bind any port in {}", range)
            }
            RendezvousError::JobIdTooLong => {
                write!(f, "job identifier is too long")
            }
            RendezvousError::BadJobId => {
                write!(f, "job identifier is not valid UTF-8")
            }
        }
    }
}

#[cfg(test)]
use std::io::Cursor;
#[cfg(test)]
use std::net::Ipv6Addr;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::init;

#[cfg(test)]
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[test]
fn test_normalize_job_id() {
    init();

    assert_eq!("1234", normalize_job_id("1234"));
    assert_eq!("1234", normalize_job_id("1234.ce.example.org"));
    assert_eq!("1234", normalize_job_id("pbs/20240101/1234.ce.example.org"));
    assert_eq!("1234", normalize_job_id("lsf/1234"));
    assert_eq!("", normalize_job_id("lsf/"));
    assert_eq!(
        normalize_job_id("1234.ce.a.org"),
        normalize_job_id("1234.ce.b.org")
    );
}

#[test]
fn test_normalize_job_id_idempotent() {
    init();

    for id in [
        "1234",
        "1234.ce.example.org",
        "pbs/20240101/1234.ce.example.org",
        "sge/dir.with.dots/56.master",
        "a.b/c"
    ] {
        let once = normalize_job_id(id);

        assert_eq!(once, normalize_job_id(once));
    }
}

#[test]
fn test_opcode_wire_format() {
    init();

    assert_eq!(b"OP:DELE\0", Opcode::Delegate.as_bytes());
    assert_eq!(b"OP:WJOB\0", Opcode::WrongJob.as_bytes());
    assert_eq!("OP:OKOK", Opcode::Ok.to_string());

    let mut buf = Vec::new();

    Opcode::Send.write(&mut buf).unwrap();
    buf.extend_from_slice(b"OP:NOPE\0");

    let mut cursor = Cursor::new(buf);

    assert_eq!(Ok(Opcode::Send), Opcode::read(&mut cursor).unwrap());
    assert_eq!(Err(*b"OP:NOPE\0"), Opcode::read(&mut cursor).unwrap());
    assert!(Opcode::read(&mut cursor).is_err());
}

#[test]
fn test_job_id_exchange() {
    init();

    let mut buf = Vec::new();

    send_job_id(&mut buf, "1234.ce.example.org").unwrap();
    buf.extend_from_slice(b"OP:SEND\0");

    let mut cursor = Cursor::new(buf);

    assert_eq!("1234.ce.example.org", read_job_id(&mut cursor).unwrap());
    assert_eq!(Ok(Opcode::Send), Opcode::read(&mut cursor).unwrap());
}

#[test]
fn test_job_id_limits() {
    init();

    let mut long = Cursor::new(vec![b'7'; MAX_JOB_ID_LEN + 1]);
    let mut truncated = Cursor::new(b"1234".to_vec());

    assert!(matches!(
        read_job_id(&mut long),
        Err(RendezvousError::JobIdTooLong)
    ));
    assert!(matches!(
        read_job_id(&mut truncated),
        Err(RendezvousError::IO { .. })
    ));
}

#[test]
fn test_bind_skips_busy_ports() {
    init();

    let range = PortRange::new(42101, 42110);
    let first = bind_in_range(LOCALHOST, &range).unwrap();
    let second = bind_in_range(LOCALHOST, &range).unwrap();
    let first_port = first.local_addr().unwrap().port();
    let second_port = second.local_addr().unwrap().port();

    assert!(range.ports().contains(&first_port));
    assert!(range.ports().contains(&second_port));
    assert!(first_port < second_port);
}

#[test]
fn test_bind_exhausted() {
    init();

    let range = PortRange::new(42121, 42122);
    let _a = bind_in_range(LOCALHOST, &range).unwrap();
    let _b = bind_in_range(LOCALHOST, &range).unwrap();

    assert!(matches!(
        bind_in_range(LOCALHOST, &range),
        Err(RendezvousError::Bind { .. })
    ));
}

#[test]
fn test_ipv4_fallback() {
    init();

    let no_v6 = Error::from_raw_os_error(Errno::EAFNOSUPPORT as i32);
    let busy = Error::from_raw_os_error(Errno::EADDRINUSE as i32);
    let any_v6 = IpAddr::V6(Ipv6Addr::UNSPECIFIED);
    let any_v4 = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

    assert_eq!(Some(any_v4), ipv4_fallback(any_v6, &no_v6));
    assert_eq!(None, ipv4_fallback(any_v6, &busy));
    assert_eq!(None, ipv4_fallback(IpAddr::V6(Ipv6Addr::LOCALHOST), &no_v6));
    assert_eq!(None, ipv4_fallback(any_v4, &no_v6));
}

#[test]
fn test_discover_skips_wrong_job() {
    init();

    let range = PortRange::new(42131, 42140);
    let wrong = bind_in_range(LOCALHOST, &range).unwrap();
    let right = bind_in_range(LOCALHOST, &range).unwrap();
    let right_port = right.local_addr().unwrap().port();

    let wrong_server = spawn(move || {
        let (mut stream, _) = wrong.accept().unwrap();

        send_job_id(&mut stream, "pbs/9999.ce.example.org").unwrap();

        Opcode::read(&mut stream).unwrap()
    });
    let right_server = spawn(move || {
        let (mut stream, _) = right.accept().unwrap();

        send_job_id(&mut stream, "1234.ce.example.org").unwrap();

        Opcode::read(&mut stream).unwrap()
    });

    let (mut stream, addr) =
        discover("127.0.0.1", &range, "pbs/1234", Duration::from_secs(3))
            .unwrap();

    assert_eq!(right_port, addr.port());

    Opcode::Send.write(&mut stream).unwrap();

    assert_eq!(Ok(Opcode::WrongJob), wrong_server.join().unwrap());
    assert_eq!(Ok(Opcode::Send), right_server.join().unwrap());
}

#[test]
fn test_discover_not_found() {
    init();

    // Nothing listens here.
    let range = PortRange::new(42151, 42153);

    assert!(matches!(
        discover("127.0.0.1", &range, "1234", Duration::from_millis(200)),
        Err(RendezvousError::NotFound { .. })
    ));
}

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

//! Driver for the submit-side client.
//!
//! The client acquires its own credential, finds the server watching
//! a job on a worker node, and runs one [ClientSession] against it.
use std::fmt::Display;
use std::fmt::Formatter;
use std::path::Path;
use std::path::PathBuf;

use log::debug;
use log::error;
use log::info;

use crate::config::RendezvousConfig;
use crate::engine::ClientSession;
use crate::engine::EngineError;
use crate::engine::TransferMode;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::gss::GSSProvider;
use crate::rendezvous::discover;
use crate::rendezvous::RendezvousError;

/// Exit code for a successful transfer.
pub const EXIT_OK: i32 = 0;

/// Exit code for bad command-line arguments.
pub const EXIT_USAGE: i32 = 1;

/// Exit code for credential, negotiation, authentication, or transfer
/// failures.
pub const EXIT_FAILURE: i32 = 2;

/// Exit code for resolution failures, or when no server is watching
/// the job.
pub const EXIT_NOT_FOUND: i32 = 4;

/// Prefix of the optional mode argument that selects delegation.
const DELEGATE_PREFIX: &str = "deleg";

/// What the client was asked to do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClientArgs {
    proxy: PathBuf,
    job_id: String,
    worker: String,
    mode: TransferMode
}

/// Errors that end a client run.
#[derive(Debug)]
pub enum ClientError<E> {
    /// The client's own credential could not be acquired.
    Credential {
        /// Provider error.
        error: E
    },
    /// No server for the job could be found.
    Rendezvous {
        /// Rendezvous error.
        error: RendezvousError
    },
    /// The session with the server failed.
    Session {
        /// Session error.
        error: EngineError<E>
    }
}

impl ClientArgs {
    /// Collect client arguments.
    ///
    /// Any `mode` beginning with `deleg` selects delegation; anything
    /// else, or nothing, sends the proxy file as is.
    pub fn new<P>(
        proxy: P,
        job_id: String,
        worker: String,
        mode: Option<&str>
    ) -> Self
    where
        P: Into<PathBuf> {
        let mode = match mode {
            Some(mode) if mode.starts_with(DELEGATE_PREFIX) => {
                TransferMode::Delegate
            }
            _ => TransferMode::Send
        };

        ClientArgs {
            proxy: proxy.into(),
            job_id: job_id,
            worker: worker,
            mode: mode
        }
    }

    #[inline]
    pub fn proxy(&self) -> &Path {
        &self.proxy
    }

    #[inline]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    #[inline]
    pub fn worker(&self) -> &str {
        &self.worker
    }

    #[inline]
    pub fn mode(&self) -> TransferMode {
        self.mode
    }
}

impl<E> ClientError<E> {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Rendezvous { .. } => EXIT_NOT_FOUND,
            ClientError::Credential { .. } | ClientError::Session { .. } => {
                EXIT_FAILURE
            }
        }
    }
}

/// Transfer or delegate a proxy to the server watching a job.
pub fn run_client<P>(
    provider: &P,
    args: &ClientArgs,
    config: &RendezvousConfig
) -> Result<(), ClientError<P::Error>>
where
    P: GSSProvider {
    let cred = provider.acquire_cred().map_err(|err| {
        error!(target: "bpr-client",
               "could not acquire credential ({})",
               err);

        ClientError::Credential { error: err }
    })?;
    let (stream, addr) = discover(
        &args.worker,
        config.port_range(),
        &args.job_id,
        config.connect_timeout()
    )
    .map_err(|err| ClientError::Rendezvous { error: err })?;

    debug!(target: "bpr-client",
           "starting {} session with {}",
           args.mode, addr);

    ClientSession::new(provider, stream, args.mode)
        .run(cred, &args.proxy)
        .map_err(|err| {
            error!(target: "bpr-client",
                   "session with {} failed ({})",
                   addr, err);

            ClientError::Session { error: err }
        })?;

    info!(target: "bpr-client",
          "proxy {} handed to job {} on {}",
          args.proxy.display(), args.job_id, args.worker);

    Ok(())
}

impl<E> ScopedError for ClientError<E>
where
    E: ScopedError
{
    fn scope(&self) -> ErrorScope {
        match self {
            ClientError::Credential { error } => error.scope(),
            ClientError::Rendezvous { error } => error.scope(),
            ClientError::Session { error } => error.scope()
        }
    }
}

impl<E> Display for ClientError<E>
where
    E: Display
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ClientError::Credential { error } => {
                write!(f, "could not acquire credential ({})", error)
            }
            ClientError::Rendezvous { error } => error.fmt(f),
            ClientError::Session { error } => error.fmt(f)
        }
    }
}

#[cfg(test)]
use std::fs;
#[cfg(test)]
use std::net::IpAddr;
#[cfg(test)]
use std::net::Ipv4Addr;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::config::PortRange;
#[cfg(test)]
use crate::engine::ServerOutcome;
#[cfg(test)]
use crate::engine::ServerSession;
#[cfg(test)]
use crate::gss::mock::MockProvider;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::rendezvous::bind_in_range;

#[cfg(test)]
fn test_rendezvous(
    low: u16,
    high: u16
) -> RendezvousConfig {
    let mut config = RendezvousConfig::default();

    config.set_port_range(PortRange::new(low, high));
    config.set_connect_timeout(500);

    config
}

#[test]
fn test_mode_argument() {
    init();

    let send = ClientArgs::new("/tmp/p", "1".to_string(), "w".to_string(), None);
    let other = ClientArgs::new(
        "/tmp/p",
        "1".to_string(),
        "w".to_string(),
        Some("send")
    );
    let short = ClientArgs::new(
        "/tmp/p",
        "1".to_string(),
        "w".to_string(),
        Some("deleg")
    );
    let long = ClientArgs::new(
        "/tmp/p",
        "1".to_string(),
        "w".to_string(),
        Some("delegate")
    );

    assert_eq!(TransferMode::Send, send.mode());
    assert_eq!(TransferMode::Send, other.mode());
    assert_eq!(TransferMode::Delegate, short.mode());
    assert_eq!(TransferMode::Delegate, long.mode());
}

#[test]
fn test_exit_codes() {
    init();

    let not_found: ClientError<std::io::Error> = ClientError::Rendezvous {
        error: RendezvousError::NotFound {
            job: "1234".to_string()
        }
    };
    let unresolved: ClientError<std::io::Error> = ClientError::Rendezvous {
        error: RendezvousError::Resolution {
            host: "nowhere".to_string()
        }
    };
    let refused: ClientError<std::io::Error> = ClientError::Session {
        error: EngineError::Refused
    };

    assert_eq!(EXIT_NOT_FOUND, not_found.exit_code());
    assert_eq!(EXIT_NOT_FOUND, unresolved.exit_code());
    assert_eq!(EXIT_FAILURE, refused.exit_code());
}

#[test]
fn test_client_without_credential() {
    init();

    let provider =
        MockProvider::new("/O=Grid/CN=Alice/CN=proxy").without_credential();
    let args = ClientArgs::new(
        "/nonexistent",
        "1234".to_string(),
        "127.0.0.1".to_string(),
        None
    );
    let res = run_client(&provider, &args, &test_rendezvous(42201, 42202));

    match res {
        Err(err @ ClientError::Credential { .. }) => {
            assert_eq!(EXIT_FAILURE, err.exit_code())
        }
        _ => panic!("expected credential failure")
    }
}

#[test]
fn test_client_not_found() {
    init();

    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let args = ClientArgs::new(
        "/nonexistent",
        "1234".to_string(),
        "127.0.0.1".to_string(),
        Some("delegate")
    );
    let res = run_client(&provider, &args, &test_rendezvous(42211, 42213));

    match res {
        Err(err @ ClientError::Rendezvous { .. }) => {
            assert_eq!(EXIT_NOT_FOUND, err.exit_code())
        }
        _ => panic!("expected rendezvous failure")
    }
}

#[test]
fn test_client_sends_proxy() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let proxy = dir.path().join("x509up_u1000");
    let config = test_rendezvous(42221, 42230);
    let listener =
        bind_in_range(IpAddr::V4(Ipv4Addr::LOCALHOST), config.port_range())
            .unwrap();

    fs::write(&proxy, "client proxy").unwrap();

    let server = spawn(move || {
        let provider = MockProvider::new("/O=Grid/CN=Alice/CN=limited proxy");
        let (stream, _) = listener.accept().unwrap();

        ServerSession::new(&provider, stream, "1234.ce.example.org")
            .run()
            .unwrap()
    });

    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let args = ClientArgs::new(
        proxy.clone(),
        "1234".to_string(),
        "127.0.0.1".to_string(),
        None
    );

    run_client(&provider, &args, &config).unwrap();

    assert_eq!(
        ServerOutcome::Received {
            mode: TransferMode::Send,
            proxy: "client proxy".to_string()
        },
        server.join().unwrap()
    );
}

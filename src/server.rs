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

//! Driver for the worker-side server.
//!
//! The server binds a rendezvous port, then hands control to a
//! [ProxyMonitor] watching the job's process until it exits or its
//! proxy runs out.
use std::fmt::Display;
use std::fmt::Formatter;

use log::error;
use log::info;

use crate::config::BPRConfig;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::gss::GSSProvider;
use crate::monitor::MonitorError;
use crate::monitor::MonitorExit;
use crate::monitor::ProxyMonitor;
use crate::monitor::SignalSupervisor;
use crate::rendezvous::bind_in_range;
use crate::rendezvous::RendezvousError;
use crate::store::ProxyStore;

/// Exit code for a normal shutdown.
pub const EXIT_OK: i32 = 0;

/// Exit code for usage errors and fatal failures.
pub const EXIT_FATAL: i32 = 1;

/// What the server was asked to do.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerArgs {
    pid: i32,
    job_id: String,
    poll_interval: Option<u64>,
    min_lifetime: Option<u64>
}

/// Errors that end a server run.
#[derive(Debug)]
pub enum ServerError {
    /// The command line did not make sense.
    Usage {
        /// What was wrong.
        msg: String
    },
    /// No rendezvous port could be bound.
    Rendezvous {
        /// Rendezvous error.
        error: RendezvousError
    },
    /// The monitor failed.
    Monitor {
        /// Monitor error.
        error: MonitorError
    }
}

fn parse_secs(
    name: &str,
    val: &str
) -> Result<u64, ServerError> {
    val.trim().parse().map_err(|_| ServerError::Usage {
        msg: format!("{} must be a number of seconds, not {:?}", name, val)
    })
}

impl ServerArgs {
    /// Interpret the positional arguments following the process ID.
    ///
    /// The job identifier always comes last.  It may be preceded by
    /// the poll interval, and then by the minimum proxy lifetime, both
    /// in seconds.
    pub fn from_positionals(
        pid: i32,
        mut rest: Vec<String>
    ) -> Result<Self, ServerError> {
        if pid <= 0 {
            return Err(ServerError::Usage {
                msg: format!("bad process ID {}", pid)
            });
        }

        let job_id = match rest.pop() {
            Some(job_id) if !job_id.is_empty() => job_id,
            _ => {
                return Err(ServerError::Usage {
                    msg: "missing job ID".to_string()
                })
            }
        };
        let (poll_interval, min_lifetime) = match rest.as_slice() {
            [] => (None, None),
            [poll] => (Some(parse_secs("poll interval", poll)?), None),
            [poll, min] => (
                Some(parse_secs("poll interval", poll)?),
                Some(parse_secs("minimum lifetime", min)?)
            ),
            _ => {
                return Err(ServerError::Usage {
                    msg: "too many arguments".to_string()
                })
            }
        };

        Ok(ServerArgs {
            pid: pid,
            job_id: job_id,
            poll_interval: poll_interval,
            min_lifetime: min_lifetime
        })
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid
    }

    #[inline]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Apply the command-line overrides to `config`.
    pub fn apply(
        &self,
        config: &mut BPRConfig
    ) {
        if let Some(secs) = self.poll_interval {
            config.monitor_mut().set_poll_interval(secs)
        }

        if let Some(secs) = self.min_lifetime {
            config.monitor_mut().set_min_lifetime(secs)
        }
    }
}

impl ServerError {
    /// Process exit code for this error.
    #[inline]
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }
}

/// Watch a job's process and accept proxies for it until it ends.
///
/// Received proxies are installed into `store`.
pub fn run_server<P>(
    provider: &P,
    args: &ServerArgs,
    mut config: BPRConfig,
    store: ProxyStore
) -> Result<MonitorExit, ServerError>
where
    P: GSSProvider {
    args.apply(&mut config);

    let (rendezvous, session, monitor, _) = config.take();
    let listener =
        bind_in_range(rendezvous.listen_addr(), rendezvous.port_range())
            .map_err(|err| {
                error!(target: "bpr-server",
                       "{}",
                       err);

                ServerError::Rendezvous { error: err }
            })?;

    info!(target: "bpr-server",
          "watching process {} for job {}, proxy at {}",
          args.pid, args.job_id, store.path().display());

    let exit = ProxyMonitor::new(
        provider,
        SignalSupervisor::new(args.pid),
        listener,
        store,
        args.job_id.clone(),
        &monitor,
        &session
    )
    .run()
    .map_err(|err| {
        error!(target: "bpr-server",
               "{}",
               err);

        ServerError::Monitor { error: err }
    })?;

    info!(target: "bpr-server",
          "{}",
          exit);

    Ok(exit)
}

impl ScopedError for ServerError {
    fn scope(&self) -> ErrorScope {
        match self {
            ServerError::Usage { .. } => ErrorScope::Unrecoverable,
            ServerError::Rendezvous { error } => error.scope(),
            ServerError::Monitor { error } => error.scope()
        }
    }
}

impl Display for ServerError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ServerError::Usage { msg } => write!(f, "usage error: {}", msg),
            ServerError::Rendezvous { error } => error.fmt(f),
            ServerError::Monitor { error } => error.fmt(f)
        }
    }
}

#[cfg(test)]
use std::os::unix::process::ExitStatusExt;
#[cfg(test)]
use std::process::Command;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use crate::gss::mock::MockProvider;
#[cfg(test)]
use crate::init;

#[cfg(test)]
fn test_config(
    low: u16,
    high: u16
) -> BPRConfig {
    let yaml = format!(
        concat!(
            "rendezvous:\n",
            "  listen-addr: 127.0.0.1\n",
            "  port-range:\n",
            "    low: {}\n",
            "    high: {}\n",
            "monitor:\n",
            "  kill-grace: 1\n"
        ),
        low, high
    );

    serde_yaml::from_str(&yaml).unwrap()
}

#[cfg(test)]
fn positionals(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[test]
fn test_positionals_job_only() {
    init();

    let args = ServerArgs::from_positionals(42, positionals(&["1234"])).unwrap();
    let mut config = BPRConfig::default();

    args.apply(&mut config);

    assert_eq!(42, args.pid());
    assert_eq!("1234", args.job_id());
    assert_eq!(BPRConfig::default(), config);
}

#[test]
fn test_positionals_all() {
    init();

    let args = ServerArgs::from_positionals(
        42,
        positionals(&["10", "600", "pbs/1234.ce"])
    )
    .unwrap();
    let mut config = BPRConfig::default();

    args.apply(&mut config);

    assert_eq!("pbs/1234.ce", args.job_id());
    assert_eq!(Duration::from_secs(10), config.monitor().poll_interval());
    assert_eq!(Duration::from_secs(600), config.monitor().min_lifetime());
}

#[test]
fn test_positionals_poll_only() {
    init();

    let args =
        ServerArgs::from_positionals(42, positionals(&["5", "1234"])).unwrap();
    let mut config = BPRConfig::default();

    args.apply(&mut config);

    assert_eq!(Duration::from_secs(5), config.monitor().poll_interval());
    assert_eq!(Duration::from_secs(180), config.monitor().min_lifetime());
}

#[test]
fn test_positionals_rejected() {
    init();

    for (pid, rest) in vec![
        (42, positionals(&[])),
        (42, positionals(&[""])),
        (42, positionals(&["soon", "1234"])),
        (42, positionals(&["1", "2", "3", "1234"])),
        (0, positionals(&["1234"]))
    ] {
        match ServerArgs::from_positionals(pid, rest) {
            Err(err @ ServerError::Usage { .. }) => {
                assert_eq!(EXIT_FATAL, err.exit_code())
            }
            res => panic!("expected usage error, got {:?}", res)
        }
    }
}

#[test]
fn test_server_exited_process() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;

    // Reap the child so its PID no longer exists.
    child.wait().unwrap();

    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let args =
        ServerArgs::from_positionals(pid, positionals(&["1", "1234"])).unwrap();
    let exit = run_server(
        &provider,
        &args,
        test_config(42241, 42245),
        ProxyStore::new(dir.path().join("x509up_u1000"))
    )
    .unwrap();

    assert_eq!(MonitorExit::ProcessExited, exit);
}

#[test]
fn test_server_terminates_job() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let mut child = Command::new("sleep").arg("30").spawn().unwrap();
    let pid = child.id() as i32;
    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy")
        .with_lifetime(Duration::from_secs(60));
    let args =
        ServerArgs::from_positionals(pid, positionals(&["1", "120", "1234"]))
            .unwrap();
    let exit = run_server(
        &provider,
        &args,
        test_config(42251, 42255),
        ProxyStore::new(dir.path().join("x509up_u1000"))
    )
    .unwrap();
    let status = child.wait().unwrap();

    assert_eq!(
        MonitorExit::ProxyExpiring {
            remaining: Duration::from_secs(60),
            killed: false
        },
        exit
    );
    assert_eq!(Some(15), status.signal());
}

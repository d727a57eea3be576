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

//! Proxy lifecycle monitor.
//!
//! The server spends its whole life in [ProxyMonitor::run], which
//! waits on two things at once:
//!
//!  - A client connecting to the rendezvous listener.  The connection
//!    is served to completion, and a received proxy is installed
//!    through the [ProxyStore].
//!
//!  - The poll interval elapsing.  The supervised process is checked;
//!    if it has exited, the monitor is done.  Otherwise the proxy's
//!    remaining lifetime is checked, and if it has fallen below the
//!    minimum the process is stopped, since it is about to lose its
//!    credentials anyway.
//!
//! Process control goes through [ProcessSupervisor], so the
//! escalation logic can be exercised without real processes.
use std::convert::TryFrom;
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;
use std::net::TcpListener;
use std::os::fd::AsFd;
use std::thread::sleep;
use std::time::Duration;
use std::time::Instant;

use log::debug;
use log::error;
use log::info;
use log::trace;
use log::warn;
use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use nix::sys::signal::kill;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::config::MonitorConfig;
use crate::config::SessionConfig;
use crate::engine::ServerOutcome;
use crate::engine::ServerSession;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::gss::GSSProvider;
use crate::store::ProxyStore;
use crate::store::StoreError;

/// Control over the supervised process.
pub trait ProcessSupervisor {
    /// Whether the process still exists.
    fn is_alive(&self) -> bool;

    /// Ask the process to stop.
    fn terminate(&self) -> Result<(), Error>;

    /// Force the process to stop.
    fn kill(&self) -> Result<(), Error>;
}

/// [ProcessSupervisor] that signals a process by ID.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SignalSupervisor {
    pid: Pid
}

/// How the monitor finished.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorExit {
    /// The supervised process exited.
    ProcessExited,
    /// The proxy was about to expire, and the process was stopped.
    ProxyExpiring {
        /// Lifetime that was left.
        remaining: Duration,
        /// Whether `SIGKILL` was needed.
        killed: bool
    }
}

/// Errors that stop the monitor.
#[derive(Debug)]
pub enum MonitorError {
    /// Waiting on the listener failed.
    Poll {
        /// Error from `poll`.
        error: Errno
    },
    /// A received proxy could not be installed.
    Store {
        /// Installation error.
        error: StoreError
    }
}

/// The server's event loop.
pub struct ProxyMonitor<'a, P, V> {
    provider: &'a P,
    supervisor: V,
    listener: TcpListener,
    store: ProxyStore,
    job_id: String,
    poll_interval: Duration,
    min_lifetime: Duration,
    kill_grace: Duration,
    handshake_timeout: Duration
}

impl SignalSupervisor {
    #[inline]
    pub fn new(pid: i32) -> Self {
        SignalSupervisor {
            pid: Pid::from_raw(pid)
        }
    }

    #[inline]
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

impl ProcessSupervisor for SignalSupervisor {
    fn is_alive(&self) -> bool {
        // A process owned by someone else still exists.
        match kill(self.pid, None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false
        }
    }

    fn terminate(&self) -> Result<(), Error> {
        kill(self.pid, Signal::SIGTERM).map_err(Error::from)
    }

    fn kill(&self) -> Result<(), Error> {
        kill(self.pid, Signal::SIGKILL).map_err(Error::from)
    }
}

impl<'a, P, V> ProxyMonitor<'a, P, V>
where
    P: GSSProvider,
    V: ProcessSupervisor
{
    /// Create a monitor.
    pub fn new(
        provider: &'a P,
        supervisor: V,
        listener: TcpListener,
        store: ProxyStore,
        job_id: String,
        monitor: &MonitorConfig,
        session: &SessionConfig
    ) -> Self {
        ProxyMonitor {
            provider: provider,
            supervisor: supervisor,
            listener: listener,
            store: store,
            job_id: job_id,
            poll_interval: monitor.poll_interval(),
            min_lifetime: monitor.min_lifetime(),
            kill_grace: monitor.kill_grace(),
            handshake_timeout: session.handshake_timeout()
        }
    }

    /// Wait up to `timeout` for a connection.
    fn wait(
        &self,
        timeout: Duration
    ) -> Result<bool, MonitorError> {
        let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::try_from(timeout).unwrap_or(PollTimeout::MAX);

        match poll(&mut fds, timeout) {
            Ok(0) => Ok(false),
            Ok(_) => Ok(true),
            Err(Errno::EINTR) => Ok(false),
            Err(err) => Err(MonitorError::Poll { error: err })
        }
    }

    /// Serve one connection.
    ///
    /// Only a failure to install a received proxy is an error; any
    /// problem with the connection itself just ends it.
    fn serve(&self) -> Result<(), MonitorError> {
        let (stream, addr) = match self.listener.accept() {
            Ok(conn) => conn,
            Err(err) => {
                warn!(target: "bpr-monitor",
                      "error accepting connection ({})",
                      err);

                return Ok(());
            }
        };

        debug!(target: "bpr-monitor",
               "connection from {}",
               addr);

        if let Err(err) = stream.set_read_timeout(Some(self.handshake_timeout))
        {
            warn!(target: "bpr-monitor",
                  "could not set timeout for {} ({})",
                  addr, err);

            return Ok(());
        }

        match ServerSession::new(self.provider, stream, &self.job_id).run() {
            Ok(ServerOutcome::Received { proxy, .. }) => self
                .store
                .install(proxy.as_bytes())
                .map_err(|err| MonitorError::Store { error: err }),
            Ok(ServerOutcome::Declined) => {
                trace!(target: "bpr-monitor",
                       "{} declined",
                       addr);

                Ok(())
            }
            Err(err) => {
                warn!(target: "bpr-monitor",
                      "session with {} failed ({})",
                      addr, err);

                Ok(())
            }
        }
    }

    /// Stop the supervised process.
    fn escalate(
        &self,
        remaining: Duration
    ) -> MonitorExit {
        match self.supervisor.terminate() {
            Ok(()) => {
                info!(target: "bpr-monitor",
                      "sent SIGTERM to supervised process");

                MonitorExit::ProxyExpiring {
                    remaining: remaining,
                    killed: false
                }
            }
            Err(err) => {
                warn!(target: "bpr-monitor",
                      "could not send SIGTERM ({}), SIGKILL in {}s",
                      err, self.kill_grace.as_secs_f64());

                sleep(self.kill_grace);

                if let Err(err) = self.supervisor.kill() {
                    error!(target: "bpr-monitor",
                           "could not send SIGKILL ({})",
                           err);
                }

                MonitorExit::ProxyExpiring {
                    remaining: remaining,
                    killed: true
                }
            }
        }
    }

    /// Check the supervised process and the proxy.
    fn check(&self) -> Option<MonitorExit> {
        if !self.supervisor.is_alive() {
            info!(target: "bpr-monitor",
                  "supervised process has exited");

            return Some(MonitorExit::ProcessExited);
        }

        let remaining = self.provider.current_lifetime();

        if remaining >= self.min_lifetime {
            debug!(target: "bpr-monitor",
                   "proxy has {}s left",
                   remaining.as_secs());

            None
        } else {
            warn!(target: "bpr-monitor",
                  "proxy has {}s left, less than the {}s minimum",
                  remaining.as_secs(),
                  self.min_lifetime.as_secs());

            Some(self.escalate(remaining))
        }
    }

    /// Run until the supervised process exits or is stopped.
    pub fn run(&self) -> Result<MonitorExit, MonitorError> {
        let mut next_check = Instant::now() + self.poll_interval;

        info!(target: "bpr-monitor",
              "monitoring job {}",
              self.job_id);

        loop {
            let timeout = next_check.saturating_duration_since(Instant::now());

            if self.wait(timeout)? {
                self.serve()?;
            }

            if Instant::now() >= next_check {
                if let Some(exit) = self.check() {
                    return Ok(exit);
                }

                next_check = Instant::now() + self.poll_interval;
            }
        }
    }
}

impl ScopedError for MonitorError {
    fn scope(&self) -> ErrorScope {
        match self {
            MonitorError::Poll { .. } => ErrorScope::System,
            MonitorError::Store { error } => error.scope()
        }
    }
}

impl Display for MonitorExit {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            MonitorExit::ProcessExited => write!(f, "process exited"),
            MonitorExit::ProxyExpiring {
                remaining,
                killed: false
            } => write!(f, "proxy expiring in {}s, process terminated",
                        remaining.as_secs()),
            MonitorExit::ProxyExpiring {
                remaining,
                killed: true
            } => write!(f, "proxy expiring in {}s, process killed",
                        remaining.as_secs())
        }
    }
}

impl Display for MonitorError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            MonitorError::Poll { error } => {
                write!(f, "error waiting for connections ({})", error)
            }
            MonitorError::Store { error } => error.fmt(f)
        }
    }
}

#[cfg(test)]
use std::fs;
#[cfg(test)]
use std::io::ErrorKind;
#[cfg(test)]
use std::io::Read;
#[cfg(test)]
use std::net::TcpStream;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::engine::ClientSession;
#[cfg(test)]
use crate::engine::TransferMode;
#[cfg(test)]
use crate::gss::mock::MockProvider;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::rendezvous::read_job_id;

#[cfg(test)]
#[derive(Debug, Default)]
struct FakeState {
    /// Liveness checks to answer `true` to before answering `false`.
    alive_for: usize,
    fail_terminate: bool,
    checks: usize,
    terms: usize,
    kills: usize
}

#[cfg(test)]
#[derive(Clone, Default)]
struct FakeSupervisor(Arc<Mutex<FakeState>>);

#[cfg(test)]
impl FakeSupervisor {
    fn alive_for(checks: usize) -> Self {
        let fake = FakeSupervisor::default();

        fake.0.lock().unwrap().alive_for = checks;

        fake
    }

    fn failing_terminate(self) -> Self {
        self.0.lock().unwrap().fail_terminate = true;

        self
    }

    fn counts(&self) -> (usize, usize, usize) {
        let state = self.0.lock().unwrap();

        (state.checks, state.terms, state.kills)
    }
}

#[cfg(test)]
impl ProcessSupervisor for FakeSupervisor {
    fn is_alive(&self) -> bool {
        let mut state = self.0.lock().unwrap();

        state.checks += 1;

        state.checks <= state.alive_for
    }

    fn terminate(&self) -> Result<(), Error> {
        let mut state = self.0.lock().unwrap();

        state.terms += 1;

        if state.fail_terminate {
            Err(Error::from(ErrorKind::PermissionDenied))
        } else {
            Ok(())
        }
    }

    fn kill(&self) -> Result<(), Error> {
        self.0.lock().unwrap().kills += 1;

        Ok(())
    }
}

#[cfg(test)]
fn test_listener() -> TcpListener {
    TcpListener::bind("127.0.0.1:0").unwrap()
}

#[cfg(test)]
fn test_config(poll_interval: u64) -> (MonitorConfig, SessionConfig) {
    let mut monitor = MonitorConfig::default();

    monitor.set_poll_interval(poll_interval);
    monitor.set_kill_grace(1);

    (monitor, SessionConfig::default())
}

#[test]
fn test_process_exit_ends_loop() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let fake = FakeSupervisor::alive_for(2);
    let (monitor_config, session_config) = test_config(0);
    let monitor = ProxyMonitor::new(
        &provider,
        fake.clone(),
        test_listener(),
        ProxyStore::new(dir.path().join("proxy")),
        "1234".to_string(),
        &monitor_config,
        &session_config
    );

    assert_eq!(MonitorExit::ProcessExited, monitor.run().unwrap());
    assert_eq!((3, 0, 0), fake.counts());
}

#[test]
fn test_expiring_proxy_terminates() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy")
        .with_lifetime(Duration::from_secs(60));
    let fake = FakeSupervisor::alive_for(usize::MAX);
    let (monitor_config, session_config) = test_config(0);
    let monitor = ProxyMonitor::new(
        &provider,
        fake.clone(),
        test_listener(),
        ProxyStore::new(dir.path().join("proxy")),
        "1234".to_string(),
        &monitor_config,
        &session_config
    );

    assert_eq!(
        MonitorExit::ProxyExpiring {
            remaining: Duration::from_secs(60),
            killed: false
        },
        monitor.run().unwrap()
    );
    assert_eq!((1, 1, 0), fake.counts());
}

#[test]
fn test_failed_terminate_kills_after_grace() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy")
        .with_lifetime(Duration::from_secs(10));
    let fake = FakeSupervisor::alive_for(usize::MAX).failing_terminate();
    let (monitor_config, session_config) = test_config(0);
    let monitor = ProxyMonitor::new(
        &provider,
        fake.clone(),
        test_listener(),
        ProxyStore::new(dir.path().join("proxy")),
        "1234".to_string(),
        &monitor_config,
        &session_config
    );
    let start = Instant::now();

    assert_eq!(
        MonitorExit::ProxyExpiring {
            remaining: Duration::from_secs(10),
            killed: true
        },
        monitor.run().unwrap()
    );
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!((1, 1, 1), fake.counts());
}

#[test]
fn test_unavailable_credential_counts_as_expired() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let provider =
        MockProvider::new("/O=Grid/CN=Alice/CN=proxy").without_credential();
    let fake = FakeSupervisor::alive_for(usize::MAX);
    let (monitor_config, session_config) = test_config(0);
    let monitor = ProxyMonitor::new(
        &provider,
        fake.clone(),
        test_listener(),
        ProxyStore::new(dir.path().join("proxy")),
        "1234".to_string(),
        &monitor_config,
        &session_config
    );

    assert_eq!(
        MonitorExit::ProxyExpiring {
            remaining: Duration::ZERO,
            killed: false
        },
        monitor.run().unwrap()
    );
}

#[test]
fn test_connection_installs_proxy() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("x509up_u1000");
    let source_path = dir.path().join("source");
    let listener = test_listener();
    let addr = listener.local_addr().unwrap();
    let fake = FakeSupervisor::alive_for(0);
    let monitor_fake = fake.clone();
    let store = ProxyStore::new(store_path.clone());

    fs::write(&source_path, "renewed proxy").unwrap();
    fs::write(&store_path, "old proxy").unwrap();

    let monitor_thread = spawn(move || {
        let provider = MockProvider::new("/O=Grid/CN=Alice/CN=limited proxy");
        let (monitor_config, session_config) = test_config(2);
        let monitor = ProxyMonitor::new(
            &provider,
            monitor_fake,
            listener,
            store,
            "1234.ce.example.org".to_string(),
            &monitor_config,
            &session_config
        );

        monitor.run().unwrap()
    });

    let mut stream = TcpStream::connect(addr).unwrap();

    assert_eq!("1234.ce.example.org", read_job_id(&mut stream).unwrap());

    let client = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let cred = client.acquire_cred().unwrap();

    ClientSession::new(&client, stream, TransferMode::Send)
        .run(cred, &source_path)
        .unwrap();

    assert_eq!(MonitorExit::ProcessExited, monitor_thread.join().unwrap());
    assert_eq!("renewed proxy", fs::read_to_string(&store_path).unwrap());
    assert_eq!((1, 0, 0), fake.counts());
}

#[test]
fn test_silent_client_times_out() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("x509up_u1000");
    let listener = test_listener();
    let addr = listener.local_addr().unwrap();
    let fake = FakeSupervisor::alive_for(0);
    let monitor_fake = fake.clone();
    let provider = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let monitor_provider = provider.clone();
    let store = ProxyStore::new(store_path.clone());
    let start = Instant::now();

    let monitor_thread = spawn(move || {
        let (monitor_config, mut session_config) = test_config(3);

        session_config.set_handshake_timeout(1);

        let monitor = ProxyMonitor::new(
            &monitor_provider,
            monitor_fake,
            listener,
            store,
            "1234".to_string(),
            &monitor_config,
            &session_config
        );

        monitor.run().unwrap()
    });

    let mut stream = TcpStream::connect(addr).unwrap();

    assert_eq!("1234", read_job_id(&mut stream).unwrap());

    // Send nothing; the server gives up on this connection.
    let mut buf = [0; 1];

    assert_eq!(0, stream.read(&mut buf).unwrap());
    assert!(start.elapsed() < Duration::from_secs(3));

    assert_eq!(MonitorExit::ProcessExited, monitor_thread.join().unwrap());
    assert!(start.elapsed() < Duration::from_secs(10));
    assert_eq!((1, 0, 0), fake.counts());
    assert_eq!(0, provider.acceptors_created());
    assert!(!store_path.exists());
}

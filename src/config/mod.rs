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

//! Configuration structures.
//!
//! This module contains definitions of types that supply
//! configuration information to the client and server.  Each of
//! these types has a YAML format, which can be parsed using
//! `serde_yaml`, thus allowing configurations to be loaded from text
//! files.  Every field has a default matching the reference
//! deployment, so an empty document is a valid configuration.
//!
//! # YAML Format
//!
//! The top-level [BPRConfig] has four sections, all optional:
//!
//! ```yaml
//! rendezvous:
//!   port-range:
//!     low: 20001
//!     high: 20100
//!   listen-addr: "::"
//!   connect-timeout: 3000
//! session:
//!   handshake-timeout: 15
//! monitor:
//!   poll-interval: 60
//!   min-lifetime: 180
//!   kill-grace: 30
//! delegation:
//!   limited: true
//!   key-bits: 2048
//!   max-lifetime: 43200
//! ```
use std::env;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fs::File;
use std::io::Error;
use std::net::IpAddr;
use std::net::Ipv6Addr;
use std::ops::RangeInclusive;
use std::path::Path;
use std::time::Duration;

use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Environment variable overriding the client's connect poll timeout
/// (in milliseconds).
pub const CONNECT_TIMEOUT_ENV: &str = "BPRCLIENT_CONNECTION_POLL_TIMEOUT";

/// Range of TCP ports scanned during rendezvous.
///
/// # YAML Format
///
/// The YAML format has two fields, both inclusive bounds:
///
///  - `low`: The first port in the range.
///
///  - `high`: The last port in the range.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PortRange {
    low: u16,
    high: u16
}

/// Rendezvous configuration.
///
/// # YAML Format
///
/// The YAML format has three fields, all optional:
///
///  - `port-range`: A [PortRange].  The default is 20001-20100.
///
///  - `listen-addr`: Address the server binds to.  The default is the IPv6
///    unspecified address, which also accepts IPv4 connections where the
///    system allows dual-stack sockets.
///
///  - `connect-timeout`: How long, in milliseconds, the client waits for a
///    candidate port to connect and announce its job.  The default is 3000.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RendezvousConfig {
    #[serde(default)]
    port_range: PortRange,
    #[serde(default = "RendezvousConfig::default_listen_addr")]
    listen_addr: IpAddr,
    #[serde(default = "RendezvousConfig::default_connect_timeout")]
    connect_timeout: u64
}

/// Per-connection session configuration.
///
/// # YAML Format
///
/// The YAML format has two fields, both optional:
///
///  - `handshake-timeout`: Bound, in seconds, on each server-side read during
///    negotiation, authentication, and transfer.  Must be nonzero.  The
///    default is 15.
///
///  - `accept-limited-proxies`: Whether the client accepts a server whose
///    proxy was signed by a limited proxy.  The default is `true`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_handshake_timeout")]
    handshake_timeout: u64,
    #[serde(default = "SessionConfig::default_accept_limited_proxies")]
    accept_limited_proxies: bool
}

/// Lifecycle monitor configuration.
///
/// # YAML Format
///
/// The YAML format has three fields, all in seconds and all optional:
///
///  - `poll-interval`: How often the monitored process and the proxy lifetime
///    are checked.  The default is 60.
///
///  - `min-lifetime`: Minimum remaining proxy lifetime tolerated while the
///    monitored process runs.  The default is 180.
///
///  - `kill-grace`: Delay before `SIGKILL` when `SIGTERM` could not be
///    delivered.  The default is 30.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct MonitorConfig {
    #[serde(default = "MonitorConfig::default_poll_interval")]
    poll_interval: u64,
    #[serde(default = "MonitorConfig::default_min_lifetime")]
    min_lifetime: u64,
    #[serde(default = "MonitorConfig::default_kill_grace")]
    kill_grace: u64
}

/// Delegation policy.
///
/// # YAML Format
///
/// The YAML format has three fields, all optional:
///
///  - `limited`: Whether delegated proxies are limited proxies.  The default
///    is `true`.
///
///  - `key-bits`: Size of the RSA key generated for each delegated proxy.  The
///    default is 2048.
///
///  - `max-lifetime`: Upper bound, in seconds, on the lifetime of a delegated
///    proxy.  The proxy never outlives its issuer regardless.  There is no
///    bound by default.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DelegationConfig {
    #[serde(default = "DelegationConfig::default_limited")]
    limited: bool,
    #[serde(default = "DelegationConfig::default_key_bits")]
    key_bits: u32,
    #[serde(default)]
    max_lifetime: Option<u64>
}

/// Top-level configuration shared by client and server.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BPRConfig {
    #[serde(default)]
    rendezvous: RendezvousConfig,
    #[serde(default)]
    session: SessionConfig,
    #[serde(default)]
    monitor: MonitorConfig,
    #[serde(default)]
    delegation: DelegationConfig
}

/// Errors that can occur loading a configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be opened.
    IO {
        /// IO error.
        error: Error
    },
    /// The file could not be parsed.
    Parse {
        /// Parser error.
        error: serde_yaml::Error
    },
    /// The port range is empty.
    EmptyRange {
        /// Low bound.
        low: u16,
        /// High bound.
        high: u16
    },
    /// The handshake timeout is zero.
    ZeroHandshakeTimeout
}

impl PortRange {
    /// Create a new port range, with inclusive bounds.
    #[inline]
    pub fn new(
        low: u16,
        high: u16
    ) -> Self {
        PortRange {
            low: low,
            high: high
        }
    }

    /// Get the first port in the range.
    #[inline]
    pub fn low(&self) -> u16 {
        self.low
    }

    /// Get the last port in the range.
    #[inline]
    pub fn high(&self) -> u16 {
        self.high
    }

    /// Iterate over every port in the range, in ascending order.
    #[inline]
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.low..=self.high
    }

    /// Number of ports in the range.
    #[inline]
    pub fn len(&self) -> usize {
        if self.high >= self.low {
            (self.high - self.low) as usize + 1
        } else {
            0
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RendezvousConfig {
    #[inline]
    pub fn port_range(&self) -> &PortRange {
        &self.port_range
    }

    #[inline]
    pub fn listen_addr(&self) -> IpAddr {
        self.listen_addr
    }

    /// Connect poll timeout for each candidate port.
    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout)
    }

    #[inline]
    pub fn set_port_range(
        &mut self,
        range: PortRange
    ) {
        self.port_range = range
    }

    #[inline]
    pub fn set_connect_timeout(
        &mut self,
        millis: u64
    ) {
        self.connect_timeout = millis
    }

    /// Decompose this into its components.
    ///
    /// This produces the port range, listen address, and connect
    /// timeout.
    #[inline]
    pub fn take(self) -> (PortRange, IpAddr, Duration) {
        let timeout = self.connect_timeout();

        (self.port_range, self.listen_addr, timeout)
    }

    #[inline]
    fn default_listen_addr() -> IpAddr {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }

    #[inline]
    fn default_connect_timeout() -> u64 {
        3000
    }
}

impl SessionConfig {
    /// Bound on each server-side read once a connection is accepted.
    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Whether proxies signed by limited proxies are acceptable.
    #[inline]
    pub fn accept_limited_proxies(&self) -> bool {
        self.accept_limited_proxies
    }

    #[inline]
    pub fn set_handshake_timeout(
        &mut self,
        secs: u64
    ) {
        self.handshake_timeout = secs
    }

    #[inline]
    pub fn set_accept_limited_proxies(
        &mut self,
        accept: bool
    ) {
        self.accept_limited_proxies = accept
    }

    #[inline]
    fn default_handshake_timeout() -> u64 {
        15
    }

    #[inline]
    fn default_accept_limited_proxies() -> bool {
        true
    }
}

impl MonitorConfig {
    #[inline]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    #[inline]
    pub fn min_lifetime(&self) -> Duration {
        Duration::from_secs(self.min_lifetime)
    }

    #[inline]
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace)
    }

    #[inline]
    pub fn set_poll_interval(
        &mut self,
        secs: u64
    ) {
        self.poll_interval = secs
    }

    #[inline]
    pub fn set_min_lifetime(
        &mut self,
        secs: u64
    ) {
        self.min_lifetime = secs
    }

    #[inline]
    pub fn set_kill_grace(
        &mut self,
        secs: u64
    ) {
        self.kill_grace = secs
    }

    /// Decompose this into its components.
    ///
    /// This produces the poll interval, the minimum lifetime, and the
    /// kill grace period.
    #[inline]
    pub fn take(self) -> (Duration, Duration, Duration) {
        (self.poll_interval(), self.min_lifetime(), self.kill_grace())
    }

    #[inline]
    fn default_poll_interval() -> u64 {
        60
    }

    #[inline]
    fn default_min_lifetime() -> u64 {
        180
    }

    #[inline]
    fn default_kill_grace() -> u64 {
        30
    }
}

impl DelegationConfig {
    #[inline]
    pub fn limited(&self) -> bool {
        self.limited
    }

    #[inline]
    pub fn key_bits(&self) -> u32 {
        self.key_bits
    }

    #[inline]
    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime.map(Duration::from_secs)
    }

    #[inline]
    pub fn set_limited(
        &mut self,
        limited: bool
    ) {
        self.limited = limited
    }

    #[inline]
    pub fn set_key_bits(
        &mut self,
        bits: u32
    ) {
        self.key_bits = bits
    }

    #[inline]
    fn default_limited() -> bool {
        true
    }

    #[inline]
    fn default_key_bits() -> u32 {
        2048
    }
}

impl BPRConfig {
    /// Load a configuration from a YAML file.
    pub fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path> {
        let file =
            File::open(path).map_err(|err| ConfigError::IO { error: err })?;
        let config: BPRConfig = serde_yaml::from_reader(file)
            .map_err(|err| ConfigError::Parse { error: err })?;

        config.check()?;

        Ok(config)
    }

    /// Load the configuration for a command-line tool.
    ///
    /// This reads `path` if one is given, and uses the defaults
    /// otherwise.  Environment overrides are applied either way.
    pub fn for_tool(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => BPRConfig::load(path)?,
            None => BPRConfig::default()
        };

        config.apply_env();

        Ok(config)
    }

    /// Check the configuration for consistency.
    pub fn check(&self) -> Result<(), ConfigError> {
        let range = self.rendezvous.port_range();

        if range.is_empty() {
            Err(ConfigError::EmptyRange {
                low: range.low(),
                high: range.high()
            })
        } else if self.session.handshake_timeout == 0 {
            Err(ConfigError::ZeroHandshakeTimeout)
        } else {
            Ok(())
        }
    }

    /// Apply overrides from the environment.
    ///
    /// Currently this only consults [CONNECT_TIMEOUT_ENV].  Values
    /// that do not parse are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Ok(val) = env::var(CONNECT_TIMEOUT_ENV) {
            match val.trim().parse::<u64>() {
                Ok(millis) => self.rendezvous.set_connect_timeout(millis),
                Err(err) => {
                    warn!(target: "bpr-config",
                          "ignoring bad value {:?} for {} ({})",
                          val, CONNECT_TIMEOUT_ENV, err);
                }
            }
        }
    }

    #[inline]
    pub fn rendezvous(&self) -> &RendezvousConfig {
        &self.rendezvous
    }

    #[inline]
    pub fn rendezvous_mut(&mut self) -> &mut RendezvousConfig {
        &mut self.rendezvous
    }

    #[inline]
    pub fn session(&self) -> &SessionConfig {
        &self.session
    }

    #[inline]
    pub fn monitor(&self) -> &MonitorConfig {
        &self.monitor
    }

    #[inline]
    pub fn monitor_mut(&mut self) -> &mut MonitorConfig {
        &mut self.monitor
    }

    #[inline]
    pub fn delegation(&self) -> &DelegationConfig {
        &self.delegation
    }

    #[inline]
    pub fn delegation_mut(&mut self) -> &mut DelegationConfig {
        &mut self.delegation
    }

    /// Decompose this into its components.
    #[inline]
    pub fn take(
        self
    ) -> (RendezvousConfig, SessionConfig, MonitorConfig, DelegationConfig)
    {
        (self.rendezvous, self.session, self.monitor, self.delegation)
    }
}

impl Default for PortRange {
    #[inline]
    fn default() -> Self {
        PortRange {
            low: 20001,
            high: 20100
        }
    }
}

impl Default for RendezvousConfig {
    #[inline]
    fn default() -> Self {
        RendezvousConfig {
            port_range: PortRange::default(),
            listen_addr: RendezvousConfig::default_listen_addr(),
            connect_timeout: RendezvousConfig::default_connect_timeout()
        }
    }
}

impl Default for SessionConfig {
    #[inline]
    fn default() -> Self {
        SessionConfig {
            handshake_timeout: SessionConfig::default_handshake_timeout(),
            accept_limited_proxies:
                SessionConfig::default_accept_limited_proxies()
        }
    }
}

impl Default for MonitorConfig {
    #[inline]
    fn default() -> Self {
        MonitorConfig {
            poll_interval: MonitorConfig::default_poll_interval(),
            min_lifetime: MonitorConfig::default_min_lifetime(),
            kill_grace: MonitorConfig::default_kill_grace()
        }
    }
}

impl Default for DelegationConfig {
    #[inline]
    fn default() -> Self {
        DelegationConfig {
            limited: DelegationConfig::default_limited(),
            key_bits: DelegationConfig::default_key_bits(),
            max_lifetime: None
        }
    }
}

impl ScopedError for ConfigError {
    fn scope(&self) -> ErrorScope {
        ErrorScope::Unrecoverable
    }
}

impl Display for PortRange {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}-{}", self.low, self.high)
    }
}

impl Display for ConfigError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ConfigError::IO { error } => error.fmt(f),
            ConfigError::Parse { error } => error.fmt(f),
            ConfigError::EmptyRange { low, high } => {
                write!(f, "port range {}-{} is empty", low, high)
            }
            ConfigError::ZeroHandshakeTimeout => {
                write!(f, "handshake timeout must be nonzero")
            }
        }
    }
}

#[cfg(test)]
use std::net::Ipv4Addr;

#[test]
fn test_deserialize_empty() {
    let yaml = concat!("{}\n");
    let expected = BPRConfig::default();
    let actual: BPRConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
    assert_eq!(20001, actual.rendezvous().port_range().low());
    assert_eq!(20100, actual.rendezvous().port_range().high());
    assert_eq!(
        Duration::from_millis(3000),
        actual.rendezvous().connect_timeout()
    );
    assert_eq!(
        Duration::from_secs(15),
        actual.session().handshake_timeout()
    );
    assert_eq!(Duration::from_secs(60), actual.monitor().poll_interval());
    assert_eq!(Duration::from_secs(180), actual.monitor().min_lifetime());
    assert_eq!(Duration::from_secs(30), actual.monitor().kill_grace());
    assert!(actual.delegation().limited());
}

#[test]
fn test_deserialize_rendezvous() {
    let yaml = concat!(
        "port-range:\n",
        "  low: 30000\n",
        "  high: 30010\n",
        "listen-addr: 127.0.0.1\n",
        "connect-timeout: 500"
    );
    let expected = RendezvousConfig {
        port_range: PortRange::new(30000, 30010),
        listen_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        connect_timeout: 500
    };
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_monitor() {
    let yaml = concat!("poll-interval: 10\n", "kill-grace: 5");
    let expected = MonitorConfig {
        poll_interval: 10,
        min_lifetime: 180,
        kill_grace: 5
    };
    let actual = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual)
}

#[test]
fn test_deserialize_delegation() {
    let yaml = concat!("limited: false\n", "max-lifetime: 3600");
    let expected = DelegationConfig {
        limited: false,
        key_bits: 2048,
        max_lifetime: Some(3600)
    };
    let actual: DelegationConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
    assert_eq!(Some(Duration::from_secs(3600)), actual.max_lifetime());
}

#[test]
fn test_empty_range_rejected() {
    let yaml = concat!(
        "rendezvous:\n",
        "  port-range:\n",
        "    low: 20100\n",
        "    high: 20001\n"
    );
    let config: BPRConfig = serde_yaml::from_str(yaml).unwrap();

    assert!(matches!(config.check(), Err(ConfigError::EmptyRange { .. })));
}

#[test]
fn test_deserialize_session() {
    let yaml = concat!("handshake-timeout: 5\n", "accept-limited-proxies: false");
    let expected = SessionConfig {
        handshake_timeout: 5,
        accept_limited_proxies: false
    };
    let actual: SessionConfig = serde_yaml::from_str(yaml).unwrap();

    assert_eq!(expected, actual);
    assert!(SessionConfig::default().accept_limited_proxies());
}

#[test]
fn test_zero_handshake_timeout_rejected() {
    let yaml = concat!("session:\n", "  handshake-timeout: 0\n");
    let config: BPRConfig = serde_yaml::from_str(yaml).unwrap();

    assert!(matches!(
        config.check(),
        Err(ConfigError::ZeroHandshakeTimeout)
    ));
    assert!(BPRConfig::default().check().is_ok());
}

#[test]
fn test_port_range() {
    let range = PortRange::new(20001, 20003);

    assert_eq!(3, range.len());
    assert_eq!(vec![20001, 20002, 20003], range.ports().collect::<Vec<_>>());
    assert_eq!("20001-20003", range.to_string());
}

#[test]
fn test_connect_timeout_env_override() {
    let mut config = BPRConfig::default();

    env::set_var(CONNECT_TIMEOUT_ENV, "1250");
    config.apply_env();
    env::set_var(CONNECT_TIMEOUT_ENV, "soon");

    let mut unchanged = config.clone();

    unchanged.apply_env();
    env::remove_var(CONNECT_TIMEOUT_ENV);

    assert_eq!(
        Duration::from_millis(1250),
        config.rendezvous().connect_timeout()
    );
    assert_eq!(config, unchanged);
}

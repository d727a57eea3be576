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


#![allow(clippy::redundant_field_names)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]
#![allow(clippy::upper_case_acronyms)]

//! Proxy-credential renewal for running batch jobs.
//!
//! Grid jobs authenticate with short-lived X.509 proxy certificates.
//! A job that outlives its proxy fails, so the submit side
//! periodically hands the job a fresh one.  This package provides
//! both ends of that exchange:
//!
//!  - **Server** (`bprserver`): runs beside the job on the worker
//!    node.  It listens on the first free port of a well-known range,
//!    accepts fresh proxies for the job, and stops the job if its
//!    proxy is about to run out.  See [monitor] and [server].
//!
//!  - **Client** (`bprclient`): runs on the submit side.  It scans the
//!    port range on the worker node for the server watching its job,
//!    authenticates, and either sends its proxy file or delegates a
//!    new proxy.  See [client].
//!
//! # Protocol
//!
//! Rendezvous is unauthenticated (see [rendezvous]).  Everything
//! after it is a sequence of length-prefixed GSSAPI tokens (see
//! [framing]), driven by the session state machines in [engine].
//! Both sides authenticate mutually, and each side refuses a peer
//! whose identity differs from its own once proxy markers are
//! stripped.
//!
//! GSSAPI itself is abstracted behind the traits in [gss], with a
//! production binding over `libgssapi` in `gss::gsi`.  Proxy
//! certificates are created and checked with OpenSSL (see [proxy]).
//!
//! # Configuration
//!
//! Both tools work without configuration.  A YAML file can adjust the
//! port range, timeouts, and delegation policy; see [config].
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod framing;
pub mod gss;
pub mod monitor;
pub mod proxy;
pub mod rendezvous;
pub mod server;
pub mod store;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}

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

//! GSSAPI capability interface.
//!
//! The delegation engine never talks to a GSSAPI library directly.
//! Instead, it is written against the traits in this module, which
//! expose exactly the operations it needs:
//!
//!  - Acquiring the process's credential, and asking how long it has
//!    left ([GSSProvider]).
//!
//!  - Establishing a mutually-authenticated context, one token at a
//!    time ([InitiatorContext::step] and [AcceptorContext::step]).
//!
//!  - Protecting messages and naming the two principals
//!    ([SecurityContext]).
//!
//!  - Delegating a fresh proxy across an established context
//!    ([InitiatorContext::init_delegation] and
//!    [AcceptorContext::accept_delegation]).
//!
//! The production binding lives in [gsi] and uses the system GSSAPI
//! library through `libgssapi`.  Tests use an in-process stand-in
//! that needs no credentials.
//!
//! None of the operations here touch the network.  Every token an
//! operation produces must be sent to the peer by the caller, and
//! every token received from the peer must be fed back in.
use std::fmt::Display;
use std::time::Duration;

use log::warn;

use crate::error::ScopedError;
use crate::framing::Token;

#[cfg(feature = "gssapi")]
pub mod gsi;
#[cfg(test)]
pub(crate) mod mock;

/// Result of one step of delegation on the initiating side.
#[derive(Debug)]
pub enum DelegationStep {
    /// Send this token and feed the peer's reply back in.
    Continue(Token),
    /// Send this token; the exchange is complete.
    Complete(Token)
}

/// Result of one step of delegation on the accepting side.
#[derive(Debug)]
pub enum AcceptStep<Cred> {
    /// Send this token and wait for the next one.
    Continue(Token),
    /// The delegated credential is ready.
    Complete(Cred)
}

/// Operations available on any established (or establishing)
/// security context.
pub trait SecurityContext {
    /// Errors produced by this context.
    type Error: Display + ScopedError;

    /// Protect a message with integrity and confidentiality.
    fn wrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, Self::Error>;

    /// Recover a message protected by the peer's [wrap].
    ///
    /// [wrap]: SecurityContext::wrap
    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, Self::Error>;

    /// Name of the principal that initiated the context.
    fn source_name(&mut self) -> Result<String, Self::Error>;

    /// Name of the principal that accepted the context.
    fn target_name(&mut self) -> Result<String, Self::Error>;

    /// Whether context establishment has finished.
    fn is_complete(&self) -> bool;
}

/// Context on the side that starts authentication.
///
/// Initiators always request mutual authentication and
/// confidentiality.
pub trait InitiatorContext: SecurityContext {
    /// Advance context establishment.
    ///
    /// The first call passes `None`; subsequent calls pass the peer's
    /// latest token.  A returned token must be sent to the peer.
    /// Establishment continues until [is_complete] reports `true`.
    ///
    /// [is_complete]: SecurityContext::is_complete
    fn step(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<Option<Token>, Self::Error>;

    /// Advance delegation of this process's credential to the peer.
    ///
    /// The first call passes `None`; subsequent calls pass the
    /// (unwrapped) reply from the peer.
    fn init_delegation(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<DelegationStep, Self::Error>;
}

/// Context on the side that accepts authentication.
pub trait AcceptorContext: SecurityContext {
    /// Credential produced by delegation.
    type Delegated;

    /// Advance context establishment with the peer's latest token.
    fn step(
        &mut self,
        input: &[u8]
    ) -> Result<Option<Token>, Self::Error>;

    /// Advance acceptance of a delegated credential with the peer's
    /// latest (unwrapped) token.
    fn accept_delegation(
        &mut self,
        input: &[u8]
    ) -> Result<AcceptStep<Self::Delegated>, Self::Error>;

    /// Export a delegated credential in the proxy file format.
    fn export_delegated(
        &self,
        cred: Self::Delegated
    ) -> Result<String, Self::Error>;
}

/// Source of credentials and contexts.
pub trait GSSProvider {
    /// Credential handle for this process.
    type Cred;
    /// Errors produced by this provider and its contexts.
    type Error: Display + ScopedError;
    /// Initiating context type.
    type Initiator: InitiatorContext<Error = Self::Error>;
    /// Accepting context type.
    type Acceptor: AcceptorContext<Error = Self::Error>;

    /// Acquire the credential of this process.
    fn acquire_cred(&self) -> Result<Self::Cred, Self::Error>;

    /// Remaining lifetime of a credential.
    fn cred_lifetime(
        &self,
        cred: &Self::Cred
    ) -> Result<Duration, Self::Error>;

    /// Create an initiating context that authenticates with `cred`.
    fn initiator(
        &self,
        cred: Self::Cred
    ) -> Result<Self::Initiator, Self::Error>;

    /// Create an accepting context that authenticates with `cred`.
    fn acceptor(
        &self,
        cred: Self::Cred
    ) -> Result<Self::Acceptor, Self::Error>;

    /// Remaining lifetime of a freshly acquired credential.
    ///
    /// A credential that cannot be acquired, or whose lifetime cannot
    /// be determined, has no lifetime left.
    fn current_lifetime(&self) -> Duration {
        match self
            .acquire_cred()
            .and_then(|cred| self.cred_lifetime(&cred))
        {
            Ok(lifetime) => lifetime,
            Err(err) => {
                warn!(target: "bpr-gsi",
                      "could not determine credential lifetime ({})",
                      err);

                Duration::ZERO
            }
        }
    }
}

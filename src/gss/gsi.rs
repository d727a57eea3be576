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

//! GSSAPI binding through the system library.
//!
//! This provides a [GSSProvider] that uses `libgssapi`, and thus
//! whatever GSSAPI mechanism the system library offers by default.
//! On a grid worker node this is Globus GSI, which picks up the proxy
//! named by `X509_USER_PROXY`.
//!
//! `libgssapi` has no delegation primitives, so delegation runs the
//! X.509 proxy exchange from [proxy](crate::proxy) over the
//! established context.  The delegating side signs with the proxy
//! file this process authenticated with.
use std::fmt::Display;
use std::fmt::Formatter;
use std::time::Duration;

use libgssapi::context::ClientCtx;
use libgssapi::context::CtxFlags;
use libgssapi::context::SecurityContext as _;
use libgssapi::context::ServerCtx;
use libgssapi::credential::Cred;
use libgssapi::credential::CredUsage;
use log::debug;
use log::trace;

use crate::config::DelegationConfig;
use crate::config::SessionConfig;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::framing::Token;
use crate::gss::AcceptStep;
use crate::gss::AcceptorContext;
use crate::gss::DelegationStep;
use crate::gss::GSSProvider;
use crate::gss::InitiatorContext;
use crate::gss::SecurityContext;
use crate::proxy::proxy_filename;
use crate::proxy::DelegatorStep;
use crate::proxy::ProxyCredential;
use crate::proxy::ProxyDelegator;
use crate::proxy::ProxyError;
use crate::proxy::ProxyRequester;
use crate::proxy::RequesterStep;

/// Errors from the system GSSAPI binding.
#[derive(Debug)]
pub enum GSIError {
    /// Error reported by the GSSAPI library.
    GSSAPI {
        /// GSSAPI error.
        error: libgssapi::error::Error
    },
    /// Error handling proxy certificates during delegation.
    Proxy {
        /// Proxy error.
        error: ProxyError
    },
    /// Delegation was attempted before the context was established.
    Incomplete
}

/// Globus extension: accept a peer whose proxy was signed by a
/// limited proxy.
pub const GSS_C_GLOBUS_ACCEPT_PROXY_SIGNED_BY_LIMITED_PROXY_FLAG: u32 = 32768;

/// [GSSProvider] backed by the system GSSAPI library.
#[derive(Clone, Debug)]
pub struct GSIProvider {
    delegation: DelegationConfig,
    accept_limited: bool
}

/// Initiating context from the system GSSAPI library.
pub struct GSIInitiator {
    ctx: ClientCtx,
    policy: DelegationConfig,
    delegator: Option<ProxyDelegator>
}

/// Accepting context from the system GSSAPI library.
pub struct GSIAcceptor {
    ctx: ServerCtx,
    requester: ProxyRequester
}

#[inline]
fn gssapi_err(err: libgssapi::error::Error) -> GSIError {
    GSIError::GSSAPI { error: err }
}

#[inline]
fn proxy_err(err: ProxyError) -> GSIError {
    GSIError::Proxy { error: err }
}

/// Flags requested by an initiating context.
///
/// Mutual authentication and confidentiality are always requested.
fn request_flags(accept_limited: bool) -> CtxFlags {
    let flags = CtxFlags::GSS_C_MUTUAL_FLAG | CtxFlags::GSS_C_CONF_FLAG;

    if accept_limited {
        flags |
            CtxFlags::from_bits_retain(
                GSS_C_GLOBUS_ACCEPT_PROXY_SIGNED_BY_LIMITED_PROXY_FLAG
            )
    } else {
        flags
    }
}

impl GSIProvider {
    /// Create a provider that delegates under `delegation` and
    /// authenticates under `session`.
    #[inline]
    pub fn new(
        delegation: DelegationConfig,
        session: &SessionConfig
    ) -> Self {
        GSIProvider {
            delegation: delegation,
            accept_limited: session.accept_limited_proxies()
        }
    }
}

impl GSSProvider for GSIProvider {
    type Acceptor = GSIAcceptor;
    type Cred = Cred;
    type Error = GSIError;
    type Initiator = GSIInitiator;

    fn acquire_cred(&self) -> Result<Cred, GSIError> {
        trace!(target: "bpr-gsi",
               "acquiring default credential");

        Cred::acquire(None, None, CredUsage::Both, None).map_err(gssapi_err)
    }

    #[inline]
    fn cred_lifetime(
        &self,
        cred: &Cred
    ) -> Result<Duration, GSIError> {
        cred.lifetime().map_err(gssapi_err)
    }

    fn initiator(
        &self,
        cred: Cred
    ) -> Result<GSIInitiator, GSIError> {
        // Server and client run under the same identity, so the
        // expected peer is this process's own principal.
        let target = cred.name().map_err(gssapi_err)?;

        debug!(target: "bpr-gsi",
               "initiating context with {}",
               target);

        let ctx = ClientCtx::new(
            Some(cred),
            target,
            request_flags(self.accept_limited),
            None
        );

        Ok(GSIInitiator {
            ctx: ctx,
            policy: self.delegation.clone(),
            delegator: None
        })
    }

    #[inline]
    fn acceptor(
        &self,
        cred: Cred
    ) -> Result<GSIAcceptor, GSIError> {
        Ok(GSIAcceptor {
            ctx: ServerCtx::new(cred),
            requester: ProxyRequester::new(self.delegation.key_bits())
        })
    }
}

impl SecurityContext for GSIInitiator {
    type Error = GSIError;

    #[inline]
    fn wrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, GSIError> {
        let buf = self.ctx.wrap(true, msg).map_err(gssapi_err)?;

        Ok(Token::from(&buf[..]))
    }

    #[inline]
    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, GSIError> {
        let buf = self.ctx.unwrap(msg).map_err(gssapi_err)?;

        Ok(Token::from(&buf[..]))
    }

    #[inline]
    fn source_name(&mut self) -> Result<String, GSIError> {
        let name = self.ctx.source_name().map_err(gssapi_err)?;

        Ok(name.to_string())
    }

    #[inline]
    fn target_name(&mut self) -> Result<String, GSIError> {
        let name = self.ctx.target_name().map_err(gssapi_err)?;

        Ok(name.to_string())
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.ctx.is_complete()
    }
}

impl InitiatorContext for GSIInitiator {
    fn step(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<Option<Token>, GSIError> {
        let out = self.ctx.step(input, None).map_err(gssapi_err)?;

        Ok(out.map(|buf| Token::from(&buf[..])))
    }

    fn init_delegation(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<DelegationStep, GSIError> {
        if !self.ctx.is_complete() {
            return Err(GSIError::Incomplete);
        }

        let delegator = match self.delegator.take() {
            Some(delegator) => delegator,
            None => {
                let path = proxy_filename();

                debug!(target: "bpr-gsi",
                       "delegating from {}",
                       path.display());

                let issuer = ProxyCredential::load(&path).map_err(proxy_err)?;

                ProxyDelegator::new(issuer, self.policy.clone())
            }
        };
        let delegator = self.delegator.insert(delegator);

        match delegator.step(input).map_err(proxy_err)? {
            DelegatorStep::Continue(token) => {
                Ok(DelegationStep::Continue(Token::from(token)))
            }
            DelegatorStep::Complete(token) => {
                Ok(DelegationStep::Complete(Token::from(token)))
            }
        }
    }
}

impl SecurityContext for GSIAcceptor {
    type Error = GSIError;

    #[inline]
    fn wrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, GSIError> {
        let buf = self.ctx.wrap(true, msg).map_err(gssapi_err)?;

        Ok(Token::from(&buf[..]))
    }

    #[inline]
    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, GSIError> {
        let buf = self.ctx.unwrap(msg).map_err(gssapi_err)?;

        Ok(Token::from(&buf[..]))
    }

    #[inline]
    fn source_name(&mut self) -> Result<String, GSIError> {
        let name = self.ctx.source_name().map_err(gssapi_err)?;

        Ok(name.to_string())
    }

    #[inline]
    fn target_name(&mut self) -> Result<String, GSIError> {
        let name = self.ctx.target_name().map_err(gssapi_err)?;

        Ok(name.to_string())
    }

    #[inline]
    fn is_complete(&self) -> bool {
        self.ctx.is_complete()
    }
}

impl AcceptorContext for GSIAcceptor {
    type Delegated = ProxyCredential;

    fn step(
        &mut self,
        input: &[u8]
    ) -> Result<Option<Token>, GSIError> {
        let out = self.ctx.step(input).map_err(gssapi_err)?;

        Ok(out.map(|buf| Token::from(&buf[..])))
    }

    fn accept_delegation(
        &mut self,
        input: &[u8]
    ) -> Result<AcceptStep<ProxyCredential>, GSIError> {
        if !self.ctx.is_complete() {
            return Err(GSIError::Incomplete);
        }

        match self.requester.step(input).map_err(proxy_err)? {
            RequesterStep::Continue(token) => {
                Ok(AcceptStep::Continue(Token::from(token)))
            }
            RequesterStep::Complete(cred) => Ok(AcceptStep::Complete(cred))
        }
    }

    fn export_delegated(
        &self,
        cred: ProxyCredential
    ) -> Result<String, GSIError> {
        let pem = cred.to_pem().map_err(proxy_err)?;

        // PEM is always ASCII.
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }
}

impl ScopedError for GSIError {
    fn scope(&self) -> ErrorScope {
        match self {
            GSIError::GSSAPI { .. } => ErrorScope::Session,
            GSIError::Proxy { error } => error.scope(),
            GSIError::Incomplete => ErrorScope::Session
        }
    }
}

impl Display for GSIError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            GSIError::GSSAPI { error } => error.fmt(f),
            GSIError::Proxy { error } => error.fmt(f),
            GSIError::Incomplete => {
                write!(f, "security context is not established")
            }
        }
    }
}

#[cfg(test)]
use crate::init;

#[test]
fn test_request_flags() {
    init();

    let limited = CtxFlags::from_bits_retain(
        GSS_C_GLOBUS_ACCEPT_PROXY_SIGNED_BY_LIMITED_PROXY_FLAG
    );
    let accepting = request_flags(true);
    let strict = request_flags(false);

    assert!(accepting.contains(CtxFlags::GSS_C_MUTUAL_FLAG));
    assert!(accepting.contains(CtxFlags::GSS_C_CONF_FLAG));
    assert!(accepting.contains(limited));
    assert!(strict.contains(CtxFlags::GSS_C_MUTUAL_FLAG));
    assert!(strict.contains(CtxFlags::GSS_C_CONF_FLAG));
    assert!(!strict.contains(limited));
}

#[test]
fn test_provider_follows_session() {
    init();

    let mut session = SessionConfig::default();
    let accepting = GSIProvider::new(DelegationConfig::default(), &session);

    session.set_accept_limited_proxies(false);

    let strict = GSIProvider::new(DelegationConfig::default(), &session);

    assert!(accepting.accept_limited);
    assert!(!strict.accept_limited);
}

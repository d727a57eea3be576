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

//! In-process GSSAPI stand-in for tests.
//!
//! Context establishment is a single round trip in which each side
//! announces its principal name.  Wrapping is reversible scrambling
//! with a marker prefix, which is enough to catch unwrapped data on
//! the wire.  Delegation runs the real X.509 proxy exchange, so the
//! delegated credentials it produces are genuine.
use std::fmt::Display;
use std::fmt::Formatter;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DelegationConfig;
use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::framing::Token;
use crate::gss::AcceptStep;
use crate::gss::AcceptorContext;
use crate::gss::DelegationStep;
use crate::gss::GSSProvider;
use crate::gss::InitiatorContext;
use crate::gss::SecurityContext;
use crate::proxy::DelegatorStep;
use crate::proxy::ProxyCredential;
use crate::proxy::ProxyDelegator;
use crate::proxy::ProxyError;
use crate::proxy::ProxyRequester;
use crate::proxy::RequesterStep;

const INIT_PREFIX: &[u8] = b"INIT:";
const ACCEPT_PREFIX: &[u8] = b"ACCEPT:";
const WRAP_PREFIX: &[u8] = b"WRAP";
const SCRAMBLE: u8 = 0x5a;

#[derive(Debug)]
pub(crate) enum MockError {
    Protocol { msg: &'static str },
    Proxy { error: ProxyError },
    NoCredential
}

#[derive(Clone, Debug)]
pub(crate) struct MockCred {
    name: String,
    lifetime: Duration
}

/// Test provider acting as one principal.
#[derive(Clone)]
pub(crate) struct MockProvider {
    name: String,
    lifetime: Duration,
    acquirable: bool,
    issuer: Option<Vec<u8>>,
    delegation: DelegationConfig,
    acceptors: Arc<AtomicUsize>
}

pub(crate) struct MockContext {
    local: String,
    peer: Option<String>,
    initiator: bool,
    started: bool,
    complete: bool,
    issuer: Option<Vec<u8>>,
    policy: DelegationConfig,
    delegator: Option<ProxyDelegator>,
    requester: ProxyRequester
}

impl MockProvider {
    pub(crate) fn new(name: &str) -> Self {
        MockProvider {
            name: name.to_string(),
            lifetime: Duration::from_secs(43200),
            acquirable: true,
            issuer: None,
            delegation: DelegationConfig::default(),
            acceptors: Arc::new(AtomicUsize::new(0))
        }
    }

    pub(crate) fn with_lifetime(
        mut self,
        lifetime: Duration
    ) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub(crate) fn without_credential(mut self) -> Self {
        self.acquirable = false;
        self
    }

    /// Delegate from `issuer` when asked to.
    pub(crate) fn with_issuer(
        mut self,
        issuer: &ProxyCredential
    ) -> Self {
        self.issuer = Some(issuer.to_pem().unwrap());
        self
    }

    /// Number of accepting contexts created so far.
    pub(crate) fn acceptors_created(&self) -> usize {
        self.acceptors.load(Ordering::SeqCst)
    }

    fn context(
        &self,
        cred: MockCred,
        initiator: bool
    ) -> MockContext {
        MockContext {
            local: cred.name,
            peer: None,
            initiator: initiator,
            started: false,
            complete: false,
            issuer: self.issuer.clone(),
            policy: self.delegation.clone(),
            delegator: None,
            requester: ProxyRequester::new(self.delegation.key_bits())
        }
    }
}

impl GSSProvider for MockProvider {
    type Acceptor = MockContext;
    type Cred = MockCred;
    type Error = MockError;
    type Initiator = MockContext;

    fn acquire_cred(&self) -> Result<MockCred, MockError> {
        if self.acquirable {
            Ok(MockCred {
                name: self.name.clone(),
                lifetime: self.lifetime
            })
        } else {
            Err(MockError::NoCredential)
        }
    }

    fn cred_lifetime(
        &self,
        cred: &MockCred
    ) -> Result<Duration, MockError> {
        Ok(cred.lifetime)
    }

    fn initiator(
        &self,
        cred: MockCred
    ) -> Result<MockContext, MockError> {
        Ok(self.context(cred, true))
    }

    fn acceptor(
        &self,
        cred: MockCred
    ) -> Result<MockContext, MockError> {
        self.acceptors.fetch_add(1, Ordering::SeqCst);

        Ok(self.context(cred, false))
    }
}

impl MockContext {
    fn peer(&self) -> Result<String, MockError> {
        self.peer.clone().ok_or(MockError::Protocol {
            msg: "context is not established"
        })
    }

    fn require_complete(&self) -> Result<(), MockError> {
        if self.complete {
            Ok(())
        } else {
            Err(MockError::Protocol {
                msg: "context is not established"
            })
        }
    }

    fn hello(
        prefix: &[u8],
        name: &str
    ) -> Token {
        let mut out = prefix.to_vec();

        out.extend_from_slice(name.as_bytes());

        Token::from(out)
    }

    fn parse_hello(
        prefix: &[u8],
        input: &[u8]
    ) -> Result<String, MockError> {
        input
            .strip_prefix(prefix)
            .and_then(|name| String::from_utf8(name.to_vec()).ok())
            .ok_or(MockError::Protocol {
                msg: "bad context token"
            })
    }
}

impl SecurityContext for MockContext {
    type Error = MockError;

    fn wrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, MockError> {
        self.require_complete()?;

        let mut out = WRAP_PREFIX.to_vec();

        out.extend(msg.iter().map(|b| b ^ SCRAMBLE));

        Ok(Token::from(out))
    }

    fn unwrap(
        &mut self,
        msg: &[u8]
    ) -> Result<Token, MockError> {
        self.require_complete()?;

        let body = msg.strip_prefix(WRAP_PREFIX).ok_or(MockError::Protocol {
            msg: "message was not wrapped"
        })?;

        Ok(Token::from(body.iter().map(|b| b ^ SCRAMBLE).collect::<Vec<u8>>()))
    }

    fn source_name(&mut self) -> Result<String, MockError> {
        if self.initiator {
            Ok(self.local.clone())
        } else {
            self.peer()
        }
    }

    fn target_name(&mut self) -> Result<String, MockError> {
        if self.initiator {
            self.peer()
        } else {
            Ok(self.local.clone())
        }
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

impl InitiatorContext for MockContext {
    fn step(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<Option<Token>, MockError> {
        match (self.started, input) {
            (false, None) => {
                self.started = true;

                Ok(Some(MockContext::hello(INIT_PREFIX, &self.local)))
            }
            (true, Some(input)) if !self.complete => {
                self.peer = Some(MockContext::parse_hello(ACCEPT_PREFIX, input)?);
                self.complete = true;

                Ok(None)
            }
            _ => Err(MockError::Protocol {
                msg: "context token out of sequence"
            })
        }
    }

    fn init_delegation(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<DelegationStep, MockError> {
        self.require_complete()?;

        let delegator = match self.delegator.take() {
            Some(delegator) => delegator,
            None => {
                let pem = self.issuer.as_ref().ok_or(MockError::NoCredential)?;
                let issuer = ProxyCredential::from_pem(pem)
                    .map_err(|err| MockError::Proxy { error: err })?;

                ProxyDelegator::new(issuer, self.policy.clone())
            }
        };
        let delegator = self.delegator.insert(delegator);

        match delegator
            .step(input)
            .map_err(|err| MockError::Proxy { error: err })?
        {
            DelegatorStep::Continue(token) => {
                Ok(DelegationStep::Continue(Token::from(token)))
            }
            DelegatorStep::Complete(token) => {
                Ok(DelegationStep::Complete(Token::from(token)))
            }
        }
    }
}

impl AcceptorContext for MockContext {
    type Delegated = ProxyCredential;

    fn step(
        &mut self,
        input: &[u8]
    ) -> Result<Option<Token>, MockError> {
        if self.complete {
            return Err(MockError::Protocol {
                msg: "context token out of sequence"
            });
        }

        self.peer = Some(MockContext::parse_hello(INIT_PREFIX, input)?);
        self.complete = true;

        Ok(Some(MockContext::hello(ACCEPT_PREFIX, &self.local)))
    }

    fn accept_delegation(
        &mut self,
        input: &[u8]
    ) -> Result<AcceptStep<ProxyCredential>, MockError> {
        self.require_complete()?;

        match self
            .requester
            .step(input)
            .map_err(|err| MockError::Proxy { error: err })?
        {
            RequesterStep::Continue(token) => {
                Ok(AcceptStep::Continue(Token::from(token)))
            }
            RequesterStep::Complete(cred) => Ok(AcceptStep::Complete(cred))
        }
    }

    fn export_delegated(
        &self,
        cred: ProxyCredential
    ) -> Result<String, MockError> {
        let pem = cred
            .to_pem()
            .map_err(|err| MockError::Proxy { error: err })?;

        Ok(String::from_utf8_lossy(&pem).into_owned())
    }
}

impl ScopedError for MockError {
    fn scope(&self) -> ErrorScope {
        match self {
            MockError::Protocol { .. } => ErrorScope::External,
            MockError::Proxy { error } => error.scope(),
            MockError::NoCredential => ErrorScope::System
        }
    }
}

impl Display for MockError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            MockError::Protocol { msg } => write!(f, "{}", msg),
            MockError::Proxy { error } => error.fmt(f),
            MockError::NoCredential => write!(f, "no credential available")
        }
    }
}

#[cfg(test)]
use crate::init;

#[test]
fn test_mock_handshake() {
    init();

    let client = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let server = MockProvider::new("/O=Grid/CN=Alice/CN=limited proxy");
    let mut init_ctx = client.initiator(client.acquire_cred().unwrap()).unwrap();
    let mut accept_ctx =
        server.acceptor(server.acquire_cred().unwrap()).unwrap();
    let hello = InitiatorContext::step(&mut init_ctx, None).unwrap().unwrap();
    let reply = AcceptorContext::step(&mut accept_ctx, &hello)
        .unwrap()
        .unwrap();

    assert!(accept_ctx.is_complete());
    assert!(InitiatorContext::step(&mut init_ctx, Some(&reply))
        .unwrap()
        .is_none());
    assert!(init_ctx.is_complete());
    assert_eq!(
        init_ctx.target_name().unwrap(),
        accept_ctx.target_name().unwrap()
    );
    assert_eq!(
        init_ctx.source_name().unwrap(),
        accept_ctx.source_name().unwrap()
    );

    let wrapped = init_ctx.wrap(b"secret").unwrap();

    assert!(!wrapped.windows(6).any(|w| w == b"secret"));
    assert_eq!(b"secret", &accept_ctx.unwrap(&wrapped).unwrap()[..]);
    assert_eq!(1, server.acceptors_created());
}

#[test]
fn test_mock_wrap_requires_context() {
    init();

    let client = MockProvider::new("/O=Grid/CN=Alice");
    let mut ctx = client.initiator(client.acquire_cred().unwrap()).unwrap();

    assert!(ctx.wrap(b"early").is_err());
    assert!(MockProvider::new("x")
        .without_credential()
        .acquire_cred()
        .is_err());
}

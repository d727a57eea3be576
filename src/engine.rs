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

//! Delegation protocol engine.
//!
//! Each connection is driven by a session object that owns the
//! stream and the security context, and moves through the
//! [SessionState]s in order:
//!
//! 1. **Negotiation**: the client sends an [Opcode] naming the
//!    [TransferMode]; the server answers with [Opcode::Ok], or with
//!    [Opcode::Error] before doing any GSSAPI work.
//!
//! 2. **Authentication**: a mutually-authenticated GSSAPI context is
//!    established, with every context token carried as a framed
//!    [Token].
//!
//! 3. **Verification**: both principal names are reduced to the
//!    identity that issued them (see [strip_proxy_markers]) and must
//!    match.  Nothing is sent if they do not.
//!
//! 4. **Transfer**: the proxy either travels as a single wrapped token
//!    ([TransferMode::Send]), or a new proxy is delegated over wrapped
//!    tokens ([TransferMode::Delegate]).
//!
//! Any error closes the session.  There are no retries; the client
//! simply runs again.
use std::fmt::Display;
use std::fmt::Formatter;
use std::fs;
use std::io::Error;
use std::io::Read;
use std::io::Write;
use std::path::Path;

use log::debug;
use log::info;
use log::trace;
use log::warn;

use crate::error::ErrorScope;
use crate::error::ScopedError;
use crate::framing::get_token;
use crate::framing::send_token;
use crate::framing::FramingError;
use crate::framing::Token;
use crate::gss::AcceptStep;
use crate::gss::AcceptorContext;
use crate::gss::DelegationStep;
use crate::gss::GSSProvider;
use crate::gss::InitiatorContext;
use crate::gss::SecurityContext;
use crate::proxy::strip_proxy_markers;
use crate::rendezvous::send_job_id;
use crate::rendezvous::Opcode;
use crate::rendezvous::OPCODE_LEN;

/// How the proxy reaches the server.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransferMode {
    /// The proxy file itself is sent.
    Send,
    /// A new proxy is delegated; no private key crosses the wire.
    Delegate
}

/// Progress of a session.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SessionState {
    Connected,
    Negotiated,
    Authenticated,
    Verified,
    Transferred,
    Closed
}

/// What a server session ended with.
#[derive(Debug, Eq, PartialEq)]
pub enum ServerOutcome {
    /// The client was looking for another job.
    Declined,
    /// A proxy was received, in proxy file format.
    Received {
        /// How the proxy arrived.
        mode: TransferMode,
        /// Proxy file contents.
        proxy: String
    }
}

/// Errors that can occur during a session.
#[derive(Debug)]
pub enum EngineError<E> {
    /// Low-level IO error.
    IO {
        /// IO error.
        error: Error
    },
    /// Error reading or writing a token.
    Framing {
        /// Framing error.
        error: FramingError
    },
    /// A security context could not be established or used.
    Context {
        /// GSSAPI error.
        error: E
    },
    /// The principals do not represent the same identity.
    Mismatch {
        /// Local principal.
        local: String,
        /// Peer principal.
        peer: String
    },
    /// The server refused the requested operation.
    Refused,
    /// An unknown or unexpected opcode was received.
    BadOpcode {
        /// Raw opcode bytes.
        opcode: [u8; OPCODE_LEN]
    },
    /// The peer closed the connection mid-protocol.
    Closed,
    /// The received proxy was not valid text.
    BadPayload,
    /// A step was attempted in the wrong state.
    OutOfOrder {
        /// State the session was in.
        state: SessionState
    }
}

/// Client end of a session.
pub struct ClientSession<'a, P: GSSProvider, S> {
    provider: &'a P,
    stream: S,
    mode: TransferMode,
    state: SessionState,
    ctx: Option<P::Initiator>
}

/// Server end of a session.
pub struct ServerSession<'a, P: GSSProvider, S> {
    provider: &'a P,
    stream: S,
    job_id: &'a str,
    mode: Option<TransferMode>,
    state: SessionState,
    ctx: Option<P::Acceptor>
}

/// Whether two principal names represent the same identity.
#[inline]
pub fn same_identity(
    a: &str,
    b: &str
) -> bool {
    strip_proxy_markers(a) == strip_proxy_markers(b)
}

fn recv_token<R, E>(stream: &mut R) -> Result<Token, EngineError<E>>
where
    R: Read {
    match get_token(stream) {
        Ok(Some(token)) => Ok(token),
        Ok(None) => Err(EngineError::Closed),
        Err(err) => Err(EngineError::Framing { error: err })
    }
}

#[inline]
fn send<W, E>(
    stream: &mut W,
    token: &[u8]
) -> Result<(), EngineError<E>>
where
    W: Write {
    send_token(stream, token).map_err(|err| EngineError::Framing { error: err })
}

#[inline]
fn ctx_err<E>(err: E) -> EngineError<E> {
    EngineError::Context { error: err }
}

/// Check the names on an established context.
fn verify_names<C>(
    ctx: &mut C,
    local_is_source: bool
) -> Result<String, EngineError<C::Error>>
where
    C: SecurityContext {
    let source = ctx.source_name().map_err(ctx_err)?;
    let target = ctx.target_name().map_err(ctx_err)?;

    trace!(target: "bpr-engine",
           "checking {} against {}",
           source, target);

    if same_identity(&source, &target) {
        Ok(strip_proxy_markers(&source).to_string())
    } else if local_is_source {
        Err(EngineError::Mismatch {
            local: source,
            peer: target
        })
    } else {
        Err(EngineError::Mismatch {
            local: target,
            peer: source
        })
    }
}

impl TransferMode {
    /// Opcode requesting this mode.
    #[inline]
    pub fn opcode(&self) -> Opcode {
        match self {
            TransferMode::Send => Opcode::Send,
            TransferMode::Delegate => Opcode::Delegate
        }
    }

    /// Mode requested by an opcode, if any.
    #[inline]
    pub fn from_opcode(op: Opcode) -> Option<TransferMode> {
        match op {
            Opcode::Send => Some(TransferMode::Send),
            Opcode::Delegate => Some(TransferMode::Delegate),
            _ => None
        }
    }
}

impl<'a, P, S> ClientSession<'a, P, S>
where
    P: GSSProvider,
    S: Read + Write
{
    /// Create a session over a stream that has finished rendezvous.
    #[inline]
    pub fn new(
        provider: &'a P,
        stream: S,
        mode: TransferMode
    ) -> Self {
        ClientSession {
            provider: provider,
            stream: stream,
            mode: mode,
            state: SessionState::Connected,
            ctx: None
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    fn expect(
        &self,
        state: SessionState
    ) -> Result<(), EngineError<P::Error>> {
        if self.state == state {
            Ok(())
        } else {
            Err(EngineError::OutOfOrder { state: self.state })
        }
    }

    fn context(&mut self) -> Result<&mut P::Initiator, EngineError<P::Error>> {
        let state = self.state;

        self.ctx
            .as_mut()
            .ok_or(EngineError::OutOfOrder { state: state })
    }

    /// Request the transfer mode.
    pub fn negotiate(&mut self) -> Result<(), EngineError<P::Error>> {
        self.expect(SessionState::Connected)?;

        debug!(target: "bpr-engine",
               "requesting {:?} transfer",
               self.mode);

        self.mode
            .opcode()
            .write(&mut self.stream)
            .map_err(|err| EngineError::IO { error: err })?;

        match Opcode::read(&mut self.stream)
            .map_err(|err| EngineError::IO { error: err })?
        {
            Ok(Opcode::Ok) => {
                self.state = SessionState::Negotiated;

                Ok(())
            }
            Ok(Opcode::Error) => Err(EngineError::Refused),
            Ok(op) => Err(EngineError::BadOpcode {
                opcode: *op.as_bytes()
            }),
            Err(raw) => Err(EngineError::BadOpcode { opcode: raw })
        }
    }

    /// Establish a security context using `cred`.
    pub fn authenticate(
        &mut self,
        cred: P::Cred
    ) -> Result<(), EngineError<P::Error>> {
        self.expect(SessionState::Negotiated)?;

        let mut ctx = self.provider.initiator(cred).map_err(ctx_err)?;
        let mut input: Option<Token> = None;

        debug!(target: "bpr-engine",
               "beginning context establishment");

        loop {
            let out = ctx.step(input.as_deref()).map_err(ctx_err)?;

            if let Some(token) = out {
                trace!(target: "bpr-engine",
                       "sending {}-byte context token",
                       token.len());

                send(&mut self.stream, &token)?;
            }

            if ctx.is_complete() {
                break;
            }

            input = Some(recv_token(&mut self.stream)?);
        }

        self.ctx = Some(ctx);
        self.state = SessionState::Authenticated;

        Ok(())
    }

    /// Check that the server acts for the same identity as this
    /// process, producing that identity.
    pub fn verify(&mut self) -> Result<String, EngineError<P::Error>> {
        self.expect(SessionState::Authenticated)?;

        let identity = verify_names(self.context()?, true)?;

        debug!(target: "bpr-engine",
               "server verified as {}",
               identity);

        self.state = SessionState::Verified;

        Ok(identity)
    }

    /// Send the proxy at `proxy` to the server.
    ///
    /// In delegation mode the proxy file is only used to sign the
    /// delegated proxy.
    pub fn transfer(
        &mut self,
        proxy: &Path
    ) -> Result<(), EngineError<P::Error>> {
        self.expect(SessionState::Verified)?;

        match self.mode {
            TransferMode::Send => self.send_proxy(proxy)?,
            TransferMode::Delegate => self.delegate()?
        }

        self.state = SessionState::Transferred;

        Ok(())
    }

    fn send_proxy(
        &mut self,
        proxy: &Path
    ) -> Result<(), EngineError<P::Error>> {
        let mut contents =
            fs::read(proxy).map_err(|err| EngineError::IO { error: err })?;

        contents.push(0);

        let token = self.context()?.wrap(&contents).map_err(ctx_err)?;

        debug!(target: "bpr-engine",
               "sending {} ({} bytes)",
               proxy.display(), contents.len());

        send(&mut self.stream, &token)
    }

    fn delegate(&mut self) -> Result<(), EngineError<P::Error>> {
        let mut input: Option<Token> = None;

        debug!(target: "bpr-engine",
               "beginning delegation");

        loop {
            let step = self
                .context()?
                .init_delegation(input.as_deref())
                .map_err(ctx_err)?;

            match step {
                DelegationStep::Continue(token) => {
                    let wrapped = self.context()?.wrap(&token).map_err(ctx_err)?;

                    send(&mut self.stream, &wrapped)?;

                    let reply = recv_token(&mut self.stream)?;

                    input = Some(self.context()?.unwrap(&reply).map_err(ctx_err)?);
                }
                DelegationStep::Complete(token) => {
                    let wrapped = self.context()?.wrap(&token).map_err(ctx_err)?;

                    return send(&mut self.stream, &wrapped);
                }
            }
        }
    }

    /// Drop the context and end the session.
    #[inline]
    pub fn close(&mut self) {
        self.ctx = None;
        self.state = SessionState::Closed;
    }

    fn steps(
        &mut self,
        cred: P::Cred,
        proxy: &Path
    ) -> Result<String, EngineError<P::Error>> {
        self.negotiate()?;
        self.authenticate(cred)?;

        let identity = self.verify()?;

        self.transfer(proxy)?;

        Ok(identity)
    }

    /// Run a whole session, authenticating with `cred` and
    /// transferring `proxy`.
    ///
    /// The session is closed whether or not this succeeds.
    pub fn run(
        mut self,
        cred: P::Cred,
        proxy: &Path
    ) -> Result<(), EngineError<P::Error>> {
        let res = self.steps(cred, proxy);

        self.close();

        match res {
            Ok(identity) => {
                info!(target: "bpr-engine",
                      "transferred proxy for {} ({:?})",
                      identity, self.mode);

                Ok(())
            }
            Err(err) => Err(err)
        }
    }
}

impl<'a, P, S> ServerSession<'a, P, S>
where
    P: GSSProvider,
    S: Read + Write
{
    /// Create a session over a freshly accepted stream.
    #[inline]
    pub fn new(
        provider: &'a P,
        stream: S,
        job_id: &'a str
    ) -> Self {
        ServerSession {
            provider: provider,
            stream: stream,
            job_id: job_id,
            mode: None,
            state: SessionState::Connected,
            ctx: None
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    fn expect(
        &self,
        state: SessionState
    ) -> Result<(), EngineError<P::Error>> {
        if self.state == state {
            Ok(())
        } else {
            Err(EngineError::OutOfOrder { state: self.state })
        }
    }

    fn context(&mut self) -> Result<&mut P::Acceptor, EngineError<P::Error>> {
        let state = self.state;

        self.ctx
            .as_mut()
            .ok_or(EngineError::OutOfOrder { state: state })
    }

    /// Announce the job and read the client's request.
    ///
    /// This produces `None` if the client was looking for another
    /// job.
    pub fn negotiate(
        &mut self
    ) -> Result<Option<TransferMode>, EngineError<P::Error>> {
        self.expect(SessionState::Connected)?;

        send_job_id(&mut self.stream, self.job_id)
            .map_err(|err| EngineError::IO { error: err })?;

        let op = Opcode::read(&mut self.stream)
            .map_err(|err| EngineError::IO { error: err })?;

        match op.map(TransferMode::from_opcode) {
            Ok(Some(mode)) => {
                Opcode::Ok
                    .write(&mut self.stream)
                    .map_err(|err| EngineError::IO { error: err })?;

                debug!(target: "bpr-engine",
                       "client requested {:?} transfer",
                       mode);

                self.mode = Some(mode);
                self.state = SessionState::Negotiated;

                Ok(Some(mode))
            }
            Ok(None) if op == Ok(Opcode::WrongJob) => {
                debug!(target: "bpr-engine",
                       "client was looking for another job");

                Ok(None)
            }
            _ => {
                let raw = match op {
                    Ok(op) => *op.as_bytes(),
                    Err(raw) => raw
                };

                warn!(target: "bpr-engine",
                      "refusing request {:?}",
                      String::from_utf8_lossy(&raw));

                Opcode::Error
                    .write(&mut self.stream)
                    .map_err(|err| EngineError::IO { error: err })?;

                Err(EngineError::BadOpcode { opcode: raw })
            }
        }
    }

    /// Accept a security context using `cred`.
    pub fn authenticate(
        &mut self,
        cred: P::Cred
    ) -> Result<(), EngineError<P::Error>> {
        self.expect(SessionState::Negotiated)?;

        let mut ctx = self.provider.acceptor(cred).map_err(ctx_err)?;

        debug!(target: "bpr-engine",
               "accepting context");

        while !ctx.is_complete() {
            let input = recv_token(&mut self.stream)?;

            if let Some(token) = ctx.step(&input).map_err(ctx_err)? {
                trace!(target: "bpr-engine",
                       "sending {}-byte context token",
                       token.len());

                send(&mut self.stream, &token)?;
            }
        }

        self.ctx = Some(ctx);
        self.state = SessionState::Authenticated;

        Ok(())
    }

    /// Check that the client acts for the same identity as this
    /// process, producing that identity.
    pub fn verify(&mut self) -> Result<String, EngineError<P::Error>> {
        self.expect(SessionState::Authenticated)?;

        let identity = verify_names(self.context()?, false)?;

        debug!(target: "bpr-engine",
               "client verified as {}",
               identity);

        self.state = SessionState::Verified;

        Ok(identity)
    }

    /// Receive the proxy, in proxy file format.
    pub fn receive(&mut self) -> Result<String, EngineError<P::Error>> {
        self.expect(SessionState::Verified)?;

        let proxy = match self.mode {
            Some(TransferMode::Send) => self.receive_proxy()?,
            Some(TransferMode::Delegate) => self.accept_delegation()?,
            None => return Err(EngineError::OutOfOrder { state: self.state })
        };

        self.state = SessionState::Transferred;

        Ok(proxy)
    }

    fn receive_proxy(&mut self) -> Result<String, EngineError<P::Error>> {
        let token = recv_token(&mut self.stream)?;
        let msg = self.context()?.unwrap(&token).map_err(ctx_err)?;
        let mut msg = msg.into_bytes();

        if msg.last() == Some(&0) {
            msg.pop();
        }

        String::from_utf8(msg).map_err(|_| EngineError::BadPayload)
    }

    fn accept_delegation(&mut self) -> Result<String, EngineError<P::Error>> {
        debug!(target: "bpr-engine",
               "accepting delegation");

        loop {
            let token = recv_token(&mut self.stream)?;
            let input = self.context()?.unwrap(&token).map_err(ctx_err)?;

            match self
                .context()?
                .accept_delegation(&input)
                .map_err(ctx_err)?
            {
                AcceptStep::Continue(out) => {
                    let wrapped = self.context()?.wrap(&out).map_err(ctx_err)?;

                    send(&mut self.stream, &wrapped)?;
                }
                AcceptStep::Complete(cred) => {
                    return self
                        .context()?
                        .export_delegated(cred)
                        .map_err(ctx_err)
                }
            }
        }
    }

    /// Drop the context and end the session.
    #[inline]
    pub fn close(&mut self) {
        self.ctx = None;
        self.state = SessionState::Closed;
    }

    fn steps(&mut self) -> Result<ServerOutcome, EngineError<P::Error>> {
        let mode = match self.negotiate()? {
            Some(mode) => mode,
            None => return Ok(ServerOutcome::Declined)
        };
        let cred = self.provider.acquire_cred().map_err(ctx_err)?;

        self.authenticate(cred)?;

        let identity = self.verify()?;
        let proxy = self.receive()?;

        info!(target: "bpr-engine",
              "received proxy for {} ({:?})",
              identity, mode);

        Ok(ServerOutcome::Received {
            mode: mode,
            proxy: proxy
        })
    }

    /// Run a whole session.
    ///
    /// A fresh credential is acquired for every session, and only
    /// after the client has asked for a transfer.  The session is
    /// closed whether or not this succeeds.
    pub fn run(mut self) -> Result<ServerOutcome, EngineError<P::Error>> {
        let res = self.steps();

        self.close();

        res
    }
}

impl<E> EngineError<E> {
    /// Whether this is an identity mismatch, as opposed to a failure
    /// to establish or use a security context.
    #[inline]
    pub fn is_mismatch(&self) -> bool {
        matches!(self, EngineError::Mismatch { .. })
    }
}

impl<E> ScopedError for EngineError<E>
where
    E: ScopedError
{
    fn scope(&self) -> ErrorScope {
        match self {
            EngineError::IO { error } => error.scope(),
            EngineError::Framing { error } => error.scope(),
            EngineError::Context { error } => error.scope(),
            EngineError::Mismatch { .. } |
            EngineError::Refused |
            EngineError::BadOpcode { .. } |
            EngineError::BadPayload => ErrorScope::External,
            EngineError::Closed => ErrorScope::Session,
            EngineError::OutOfOrder { .. } => ErrorScope::Unrecoverable
        }
    }
}

impl Display for TransferMode {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            TransferMode::Send => write!(f, "send"),
            TransferMode::Delegate => write!(f, "delegate")
        }
    }
}

impl<E> Display for EngineError<E>
where
    E: Display
{
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            EngineError::IO { error } => error.fmt(f),
            EngineError::Framing { error } => error.fmt(f),
            EngineError::Context { error } => {
                write!(f, "cannot establish security context ({})", error)
            }
            EngineError::Mismatch { local, peer } => write!(
                f,
                "certificate mismatch (local {}, peer {})",
                local, peer
            ),
            EngineError::Refused => write!(f, "server refused request"),
            EngineError::BadOpcode { opcode } => write!(
                f,
                "unexpected opcode {:?}",
                String::from_utf8_lossy(opcode)
            ),
            EngineError::Closed => write!(f, "peer closed the connection"),
            EngineError::BadPayload => write!(f, "received proxy is not text"),
            EngineError::OutOfOrder { state } => {
                write!(f, "protocol step attempted in state {:?}", state)
            }
        }
    }
}

#[cfg(test)]
use std::net::TcpListener;
#[cfg(test)]
use std::net::TcpStream;
#[cfg(test)]
use std::thread::spawn;

#[cfg(test)]
use crate::config::DelegationConfig;
#[cfg(test)]
use crate::gss::mock::MockError;
#[cfg(test)]
use crate::gss::mock::MockProvider;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::proxy::delegate_in_memory;
#[cfg(test)]
use crate::proxy::test_user;
#[cfg(test)]
use crate::proxy::ProxyCredential;
#[cfg(test)]
use crate::rendezvous::read_job_id;

#[cfg(test)]
fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();

    (client, server)
}

/// Run a server session on a thread, and a client session over the
/// same connection.
#[cfg(test)]
fn run_pair(
    client: MockProvider,
    server: MockProvider,
    mode: TransferMode,
    proxy: &Path
) -> (
    Result<(), EngineError<MockError>>,
    Result<ServerOutcome, EngineError<MockError>>
) {
    let (mut client_stream, server_stream) = tcp_pair();
    let server_thread = spawn(move || {
        ServerSession::new(&server, server_stream, "1234.ce.example.org").run()
    });

    assert_eq!(
        "1234.ce.example.org",
        read_job_id(&mut client_stream).unwrap()
    );

    let cred = client.acquire_cred().unwrap();
    let client_res =
        ClientSession::new(&client, client_stream, mode).run(cred, proxy);
    let server_res = server_thread.join().unwrap();

    (client_res, server_res)
}

#[test]
fn test_identity_equivalence() {
    init();

    assert!(same_identity(
        "/O=Grid/CN=Alice/CN=proxy",
        "/O=Grid/CN=Alice/CN=limited proxy/CN=proxy"
    ));
    assert!(!same_identity(
        "/O=Grid/CN=Alice/CN=proxy",
        "/O=Grid/CN=Bob/CN=proxy"
    ));
}

#[test]
fn test_send_proxy() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("x509up_u1000");
    let contents = "-----BEGIN CERTIFICATE-----\nnot really\n";

    fs::write(&path, contents).unwrap();

    let client = MockProvider::new("/O=Grid/OU=Test/CN=Alice/CN=proxy");
    let server =
        MockProvider::new("/O=Grid/OU=Test/CN=Alice/CN=limited proxy");
    let (client_res, server_res) =
        run_pair(client, server.clone(), TransferMode::Send, &path);

    client_res.unwrap();

    assert_eq!(
        ServerOutcome::Received {
            mode: TransferMode::Send,
            proxy: contents.to_string()
        },
        server_res.unwrap()
    );
    assert_eq!(1, server.acceptors_created());
}

#[test]
fn test_delegate_proxy() {
    init();

    let (ca, user) = test_user("Alice", 86400);
    let user_subject = user.subject().unwrap();
    let issuer = delegate_in_memory(user, DelegationConfig::default()).unwrap();
    let issuer_cert = issuer.certificate().clone();
    let client =
        MockProvider::new(&issuer.subject().unwrap()).with_issuer(&issuer);
    let server = MockProvider::new(&format!("{}/CN=proxy", user_subject));
    let dir = tempfile::tempdir().unwrap();
    let unused = dir.path().join("unused");
    let (client_res, server_res) =
        run_pair(client, server, TransferMode::Delegate, &unused);

    client_res.unwrap();

    let proxy = match server_res.unwrap() {
        ServerOutcome::Received {
            mode: TransferMode::Delegate,
            proxy
        } => proxy,
        other => panic!("unexpected outcome {:?}", other)
    };
    let delegated = ProxyCredential::from_pem(proxy.as_bytes()).unwrap();

    // The new proxy is signed by the client's proxy, and its chain
    // leads back to the authority that issued the user certificate.
    assert_eq!(user_subject, delegated.identity().unwrap());
    assert!(delegated
        .certificate()
        .verify(&issuer_cert.public_key().unwrap())
        .unwrap());
    assert_eq!(
        issuer_cert.to_der().unwrap(),
        delegated.chain()[0].to_der().unwrap()
    );
    assert_eq!(
        ca.to_der().unwrap(),
        delegated.chain().last().unwrap().to_der().unwrap()
    );
}

#[test]
fn test_identity_mismatch() {
    init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("proxy");

    fs::write(&path, "secret").unwrap();

    let client = MockProvider::new("/O=Grid/CN=Alice/CN=proxy");
    let server = MockProvider::new("/O=Grid/CN=Mallory/CN=proxy");
    let (client_res, server_res) =
        run_pair(client, server, TransferMode::Send, &path);
    let err = client_res.unwrap_err();

    assert!(err.is_mismatch());
    assert!(err.to_string().starts_with("certificate mismatch"));
    assert!(server_res.is_err());
}

#[test]
fn test_server_refuses_unknown_opcode() {
    init();

    let (mut client, server_stream) = tcp_pair();
    let server = MockProvider::new("/O=Grid/CN=Alice");
    let provider = server.clone();
    let server_thread = spawn(move || {
        ServerSession::new(&provider, server_stream, "1234").run()
    });

    read_job_id(&mut client).unwrap();
    client.write_all(b"OP:JUNK\0").unwrap();

    assert_eq!(Ok(Opcode::Error), Opcode::read(&mut client).unwrap());
    assert!(matches!(
        server_thread.join().unwrap(),
        Err(EngineError::BadOpcode { .. })
    ));
    assert_eq!(0, server.acceptors_created());
}

#[test]
fn test_server_declines_wrong_job() {
    init();

    let (mut client, server_stream) = tcp_pair();
    let server = MockProvider::new("/O=Grid/CN=Alice");
    let provider = server.clone();
    let server_thread = spawn(move || {
        ServerSession::new(&provider, server_stream, "9999").run()
    });

    read_job_id(&mut client).unwrap();
    Opcode::WrongJob.write(&mut client).unwrap();

    assert_eq!(ServerOutcome::Declined, server_thread.join().unwrap().unwrap());
    assert_eq!(0, server.acceptors_created());
}

#[test]
fn test_client_refused() {
    init();

    let (client_stream, mut server) = tcp_pair();
    let server_thread = spawn(move || {
        let op = Opcode::read(&mut server).unwrap();

        Opcode::Error.write(&mut server).unwrap();

        op
    });
    let provider = MockProvider::new("/O=Grid/CN=Alice");
    let mut session =
        ClientSession::new(&provider, client_stream, TransferMode::Delegate);

    assert!(matches!(session.negotiate(), Err(EngineError::Refused)));
    assert_eq!(SessionState::Connected, session.state());
    assert_eq!(Ok(Opcode::Delegate), server_thread.join().unwrap());
}

#[test]
fn test_steps_out_of_order() {
    init();

    let (client_stream, _server) = tcp_pair();
    let provider = MockProvider::new("/O=Grid/CN=Alice");
    let mut session =
        ClientSession::new(&provider, client_stream, TransferMode::Send);

    assert!(matches!(
        session.verify(),
        Err(EngineError::OutOfOrder {
            state: SessionState::Connected
        })
    ));
}

#[test]
fn test_server_without_credential() {
    init();

    let (mut client, server_stream) = tcp_pair();
    let server = MockProvider::new("/O=Grid/CN=Alice").without_credential();
    let server_thread = spawn(move || {
        ServerSession::new(&server, server_stream, "1234").run()
    });

    read_job_id(&mut client).unwrap();
    Opcode::Send.write(&mut client).unwrap();

    assert_eq!(Ok(Opcode::Ok), Opcode::read(&mut client).unwrap());
    assert!(matches!(
        server_thread.join().unwrap(),
        Err(EngineError::Context { .. })
    ));
}

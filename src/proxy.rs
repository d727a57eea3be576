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

//! X.509 proxy credentials.
//!
//! A proxy credential is a short-lived certificate, signed by a
//! user's long-lived certificate (or by another proxy), together with
//! its private key and the chain of certificates above it.  On disk
//! this is a single PEM file holding the proxy certificate, the
//! private key, and then the rest of the chain.
//!
//! # Delegation
//!
//! Delegation issues a *new* proxy to a peer without ever moving a
//! private key across the wire.  Two state machines run the exchange:
//!
//! 1. [ProxyDelegator] starts by emitting a one-byte start token.
//!
//! 2. [ProxyRequester] answers with a DER-encoded certificate request
//!    for a freshly generated key pair, which it keeps.
//!
//! 3. [ProxyDelegator] signs the request with the issuing credential
//!    and returns the new certificate followed by its own chain, in
//!    PEM form.
//!
//! 4. [ProxyRequester] pairs the certificate with the pending key and
//!    produces a complete [ProxyCredential].
//!
//! The GSSAPI providers in [gss](crate::gss) drive these state
//! machines from their delegation primitives; the tokens exchanged
//! here are wrapped before they reach the network.
//!
//! Proxies issued here use the legacy GSI naming convention: the
//! subject is the issuer's subject with a final `CN=proxy` (or
//! `CN=limited proxy`) component.
use std::env;
use std::ffi::OsString;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fs;
use std::io::Error;
use std::iter::once;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use log::debug;
use log::trace;
use nix::unistd::getuid;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::bn::MsbOption;
use openssl::error::ErrorStack;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use openssl::x509::extension::KeyUsage;
use openssl::x509::X509Builder;
use openssl::x509::X509NameBuilder;
use openssl::x509::X509NameRef;
use openssl::x509::X509Req;
use openssl::x509::X509ReqBuilder;
use openssl::x509::X509;
use time::OffsetDateTime;

use crate::config::DelegationConfig;
use crate::error::ErrorScope;
use crate::error::ScopedError;

/// Environment variable naming the user's proxy file.
pub const PROXY_ENV: &str = "X509_USER_PROXY";

/// Final name component of a full impersonation proxy.
pub const PROXY_CN: &str = "proxy";

/// Final name component of a limited proxy.
pub const LIMITED_PROXY_CN: &str = "limited proxy";

/// Name suffixes removed when computing an identity name.
const PROXY_MARKERS: [&str; 2] = ["/CN=proxy", "/CN=limited proxy"];

/// First token of a delegation exchange.
const DELEGATION_START: &[u8] = b"D";

/// Backdating applied to new proxies to absorb clock skew.
const CLOCK_SKEW_SECS: i64 = 300;

/// A proxy credential: certificate, private key, and issuing chain.
pub struct ProxyCredential {
    /// The proxy certificate itself.
    cert: X509,
    /// Private key matching `cert`.
    key: PKey<Private>,
    /// Issuing certificates, nearest first.
    chain: Vec<X509>
}

/// Errors that can occur handling proxy credentials.
#[derive(Debug)]
pub enum ProxyError {
    /// Low-level IO error.
    IO {
        /// IO error.
        error: Error
    },
    /// Error from OpenSSL.
    OpenSSL {
        /// OpenSSL error.
        error: ErrorStack
    },
    /// No certificate was found.
    NoCertificate,
    /// The certificate does not belong to the private key.
    KeyMismatch,
    /// A certificate request failed its self-signature check.
    BadRequest,
    /// A certificate was not signed by the next one in its chain.
    BadSignature,
    /// The issuing credential has no remaining lifetime.
    Expired,
    /// A delegation token arrived in the wrong state.
    OutOfSequence,
    /// The delegation start token was malformed.
    BadStart
}

/// Result of one step of a [ProxyDelegator].
#[derive(Debug)]
pub enum DelegatorStep {
    /// Send this token and wait for the peer's reply.
    Continue(Vec<u8>),
    /// Send this token; delegation is finished.
    Complete(Vec<u8>)
}

/// Result of one step of a [ProxyRequester].
pub enum RequesterStep {
    /// Send this token and wait for the peer's reply.
    Continue(Vec<u8>),
    /// Delegation is finished.
    Complete(ProxyCredential)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum DelegatorState {
    Start,
    AwaitRequest,
    Done
}

/// Issuing side of a delegation exchange.
pub struct ProxyDelegator {
    issuer: ProxyCredential,
    policy: DelegationConfig,
    state: DelegatorState
}

/// Receiving side of a delegation exchange.
pub struct ProxyRequester {
    key_bits: u32,
    /// Key pair for the request in flight.
    key: Option<PKey<Private>>
}

/// Get the path of the user's proxy file.
///
/// This is the value of [PROXY_ENV] if it is set, and
/// `/tmp/x509up_u<uid>` otherwise.
pub fn proxy_filename() -> PathBuf {
    match env::var_os(PROXY_ENV) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => {
            let mut path = OsString::from("/tmp/x509up_u");

            path.push(getuid().to_string());

            PathBuf::from(path)
        }
    }
}

/// Strip trailing proxy markers from a principal name.
///
/// Markers are removed one at a time until none remains, so an
/// arbitrarily long chain of `/CN=proxy` and `/CN=limited proxy`
/// components reduces to the identity that issued them.
pub fn strip_proxy_markers(name: &str) -> &str {
    let mut name = name;

    while let Some(stripped) = PROXY_MARKERS
        .iter()
        .find_map(|marker| name.strip_suffix(marker))
    {
        name = stripped;
    }

    name
}

/// Render an X.509 name in the slash-separated form used by GSI.
pub fn slash_name(name: &X509NameRef) -> Result<String, ErrorStack> {
    let mut out = String::new();

    for entry in name.entries() {
        let field = entry.object().nid().short_name()?;
        let value = entry.data().as_utf8()?;

        out.push('/');
        out.push_str(field);
        out.push('=');
        out.push_str(&value);
    }

    Ok(out)
}

#[inline]
fn openssl_err(err: ErrorStack) -> ProxyError {
    ProxyError::OpenSSL { error: err }
}

/// Subject of a proxy issued by `issuer`.
fn proxy_subject(
    issuer: &X509NameRef,
    cn: &str
) -> Result<openssl::x509::X509Name, ErrorStack> {
    let mut name = X509NameBuilder::new()?;

    for entry in issuer.entries() {
        let value = entry.data().as_utf8()?;

        name.append_entry_by_nid(entry.object().nid(), &value)?;
    }

    name.append_entry_by_nid(Nid::COMMONNAME, cn)?;

    Ok(name.build())
}

impl ProxyCredential {
    /// Create a credential from its parts.
    pub fn new(
        cert: X509,
        key: PKey<Private>,
        chain: Vec<X509>
    ) -> Result<Self, ProxyError> {
        let public = cert.public_key().map_err(openssl_err)?;

        if public.public_eq(&key) {
            Ok(ProxyCredential {
                cert: cert,
                key: key,
                chain: chain
            })
        } else {
            Err(ProxyError::KeyMismatch)
        }
    }

    /// Parse a credential from PEM.
    ///
    /// The first certificate is taken to be the proxy certificate,
    /// and any others form its chain.
    pub fn from_pem(pem: &[u8]) -> Result<Self, ProxyError> {
        let mut certs = X509::stack_from_pem(pem)
            .map_err(openssl_err)?
            .into_iter();
        let cert = certs.next().ok_or(ProxyError::NoCertificate)?;
        let key = PKey::private_key_from_pem(pem).map_err(openssl_err)?;

        ProxyCredential::new(cert, key, certs.collect())
    }

    /// Load a credential from a proxy file.
    pub fn load<P>(path: P) -> Result<Self, ProxyError>
    where
        P: AsRef<Path> {
        let path = path.as_ref();

        trace!(target: "bpr-proxy",
               "loading proxy from {}",
               path.display());

        let pem = fs::read(path).map_err(|err| ProxyError::IO { error: err })?;

        ProxyCredential::from_pem(&pem)
    }

    /// Encode this credential in the proxy file format.
    pub fn to_pem(&self) -> Result<Vec<u8>, ProxyError> {
        let mut out = self.cert.to_pem().map_err(openssl_err)?;
        let key = match self.key.rsa() {
            Ok(rsa) => rsa.private_key_to_pem(),
            Err(_) => self.key.private_key_to_pem_pkcs8()
        }
        .map_err(openssl_err)?;

        out.extend(key);

        for cert in &self.chain {
            out.extend(cert.to_pem().map_err(openssl_err)?);
        }

        Ok(out)
    }

    #[inline]
    pub fn certificate(&self) -> &X509 {
        &self.cert
    }

    #[inline]
    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    /// Subject of the proxy certificate, in slash form.
    pub fn subject(&self) -> Result<String, ProxyError> {
        slash_name(self.cert.subject_name()).map_err(openssl_err)
    }

    /// Identity on whose behalf this proxy acts.
    pub fn identity(&self) -> Result<String, ProxyError> {
        let subject = self.subject()?;

        Ok(strip_proxy_markers(&subject).to_string())
    }

    /// Time until the first certificate in the chain expires.
    pub fn time_remaining(&self) -> Result<Duration, ProxyError> {
        let now = Asn1Time::days_from_now(0).map_err(openssl_err)?;
        let mut remaining = i64::MAX;

        for cert in once(&self.cert).chain(self.chain.iter()) {
            let diff = now.diff(cert.not_after()).map_err(openssl_err)?;
            let secs = diff.days as i64 * 86400 + diff.secs as i64;

            remaining = remaining.min(secs);
        }

        Ok(Duration::from_secs(remaining.max(0) as u64))
    }

    /// Sign a DER certificate request, producing the PEM chain for
    /// the new proxy.
    fn sign_request(
        &self,
        req: &[u8],
        policy: &DelegationConfig
    ) -> Result<Vec<u8>, ProxyError> {
        let req = X509Req::from_der(req).map_err(openssl_err)?;
        let pubkey = req.public_key().map_err(openssl_err)?;

        if !req.verify(&pubkey).map_err(openssl_err)? {
            return Err(ProxyError::BadRequest);
        }

        let remaining = self.time_remaining()?;

        if remaining.as_secs() == 0 {
            return Err(ProxyError::Expired);
        }

        let lifetime = match policy.max_lifetime() {
            Some(max) => max.min(remaining),
            None => remaining
        };
        let cn = if policy.limited() {
            LIMITED_PROXY_CN
        } else {
            PROXY_CN
        };
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let not_before =
            Asn1Time::from_unix(now - CLOCK_SKEW_SECS).map_err(openssl_err)?;
        let not_after = Asn1Time::from_unix(now + lifetime.as_secs() as i64)
            .map_err(openssl_err)?;
        let subject = proxy_subject(self.cert.subject_name(), cn)
            .map_err(openssl_err)?;
        let serial = {
            let mut serial = BigNum::new().map_err(openssl_err)?;

            serial
                .rand(63, MsbOption::MAYBE_ZERO, false)
                .map_err(openssl_err)?;
            serial.to_asn1_integer().map_err(openssl_err)?
        };
        let usage = KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()
            .map_err(openssl_err)?;
        let mut builder = X509Builder::new().map_err(openssl_err)?;

        builder.set_version(2).map_err(openssl_err)?;
        builder.set_serial_number(&serial).map_err(openssl_err)?;
        builder
            .set_issuer_name(self.cert.subject_name())
            .map_err(openssl_err)?;
        builder.set_subject_name(&subject).map_err(openssl_err)?;
        builder.set_pubkey(&pubkey).map_err(openssl_err)?;
        builder.set_not_before(&not_before).map_err(openssl_err)?;
        builder.set_not_after(&not_after).map_err(openssl_err)?;
        builder.append_extension(usage).map_err(openssl_err)?;
        builder
            .sign(&self.key, MessageDigest::sha256())
            .map_err(openssl_err)?;

        let cert = builder.build();

        debug!(target: "bpr-proxy",
               "issued {} for {} seconds",
               cn, lifetime.as_secs());

        let mut out = cert.to_pem().map_err(openssl_err)?;

        out.extend(self.cert.to_pem().map_err(openssl_err)?);

        for cert in &self.chain {
            out.extend(cert.to_pem().map_err(openssl_err)?);
        }

        Ok(out)
    }
}

impl ProxyDelegator {
    /// Create a delegator that issues proxies from `issuer`.
    #[inline]
    pub fn new(
        issuer: ProxyCredential,
        policy: DelegationConfig
    ) -> Self {
        ProxyDelegator {
            issuer: issuer,
            policy: policy,
            state: DelegatorState::Start
        }
    }

    /// Advance the exchange.
    ///
    /// The first call takes no input; the second takes the peer's
    /// certificate request.
    pub fn step(
        &mut self,
        input: Option<&[u8]>
    ) -> Result<DelegatorStep, ProxyError> {
        match (self.state, input) {
            (DelegatorState::Start, None) => {
                self.state = DelegatorState::AwaitRequest;

                Ok(DelegatorStep::Continue(DELEGATION_START.to_vec()))
            }
            (DelegatorState::AwaitRequest, Some(req)) => {
                let chain = self.issuer.sign_request(req, &self.policy)?;

                self.state = DelegatorState::Done;

                Ok(DelegatorStep::Complete(chain))
            }
            _ => Err(ProxyError::OutOfSequence)
        }
    }
}

impl ProxyRequester {
    /// Create a requester that generates `key_bits`-bit RSA keys.
    #[inline]
    pub fn new(key_bits: u32) -> Self {
        ProxyRequester {
            key_bits: key_bits,
            key: None
        }
    }

    fn create_request(&mut self) -> Result<Vec<u8>, ErrorStack> {
        let rsa = Rsa::generate(self.key_bits)?;
        let key = PKey::from_rsa(rsa)?;
        let mut name = X509NameBuilder::new()?;

        name.append_entry_by_nid(Nid::COMMONNAME, PROXY_CN)?;

        let mut builder = X509ReqBuilder::new()?;

        builder.set_version(0)?;
        builder.set_subject_name(&name.build())?;
        builder.set_pubkey(&key)?;
        builder.sign(&key, MessageDigest::sha256())?;

        let req = builder.build().to_der()?;

        self.key = Some(key);

        Ok(req)
    }

    fn assemble(
        key: PKey<Private>,
        chain: &[u8]
    ) -> Result<ProxyCredential, ProxyError> {
        let mut certs = X509::stack_from_pem(chain)
            .map_err(openssl_err)?
            .into_iter();
        let cert = certs.next().ok_or(ProxyError::NoCertificate)?;
        let chain: Vec<X509> = certs.collect();

        if let Some(issuer) = chain.first() {
            let issuer_key = issuer.public_key().map_err(openssl_err)?;

            if !cert.verify(&issuer_key).map_err(openssl_err)? {
                return Err(ProxyError::BadSignature);
            }
        }

        ProxyCredential::new(cert, key, chain)
    }

    /// Advance the exchange with the peer's latest token.
    pub fn step(
        &mut self,
        input: &[u8]
    ) -> Result<RequesterStep, ProxyError> {
        match self.key.take() {
            None => {
                if input != DELEGATION_START {
                    return Err(ProxyError::BadStart);
                }

                trace!(target: "bpr-proxy",
                       "generating {}-bit proxy request",
                       self.key_bits);

                let req = self.create_request().map_err(openssl_err)?;

                Ok(RequesterStep::Continue(req))
            }
            Some(key) => {
                let cred = ProxyRequester::assemble(key, input)?;

                debug!(target: "bpr-proxy",
                       "assembled delegated proxy with {} issuing certificates",
                       cred.chain.len());

                Ok(RequesterStep::Complete(cred))
            }
        }
    }
}

impl Debug for ProxyCredential {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        let subject = slash_name(self.cert.subject_name())
            .unwrap_or_else(|_| String::from("<unprintable>"));

        f.debug_struct("ProxyCredential")
            .field("subject", &subject)
            .field("chain", &self.chain.len())
            .finish()
    }
}

impl ScopedError for ProxyError {
    fn scope(&self) -> ErrorScope {
        match self {
            ProxyError::IO { error } => error.scope(),
            ProxyError::OpenSSL { .. } | ProxyError::Expired => {
                ErrorScope::System
            }
            ProxyError::NoCertificate |
            ProxyError::KeyMismatch |
            ProxyError::BadRequest |
            ProxyError::BadSignature |
            ProxyError::OutOfSequence |
            ProxyError::BadStart => ErrorScope::External
        }
    }
}

impl Display for ProxyError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            ProxyError::IO { error } => Display::fmt(error, f),
            ProxyError::OpenSSL { error } => Display::fmt(error, f),
            ProxyError::NoCertificate => write!(f, "no certificate found"),
            ProxyError::KeyMismatch => {
                write!(f, "certificate does not match private key")
            }
            ProxyError::BadRequest => {
                write!(f, "certificate request signature is invalid")
            }
            ProxyError::BadSignature => {
                write!(f, "certificate was not signed by its issuer")
            }
            ProxyError::Expired => write!(f, "issuing proxy has expired"),
            ProxyError::OutOfSequence => {
                write!(f, "delegation token out of sequence")
            }
            ProxyError::BadStart => write!(f, "bad delegation start token")
        }
    }
}

/// Issue a certificate for tests.
///
/// With no issuer, the certificate is a self-signed CA.
#[cfg(test)]
pub(crate) fn issue_test_cert(
    cn: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    lifetime_secs: i64
) -> X509 {
    use openssl::x509::extension::BasicConstraints;

    let mut name = X509NameBuilder::new().unwrap();

    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "Grid").unwrap();
    name.append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, "Test")
        .unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();

    let name = name.build();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let mut serial = BigNum::new().unwrap();

    serial.rand(63, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509Builder::new().unwrap();

    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(key).unwrap();
    builder
        .set_not_before(&Asn1Time::from_unix(now - 3600).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::from_unix(now + lifetime_secs).unwrap())
        .unwrap();

    match issuer {
        Some((cert, issuer_key)) => {
            builder.set_issuer_name(cert.subject_name()).unwrap();
            builder.sign(issuer_key, MessageDigest::sha256()).unwrap();
        }
        None => {
            builder
                .append_extension(BasicConstraints::new().ca().build().unwrap())
                .unwrap();
            builder.set_issuer_name(&name).unwrap();
            builder.sign(key, MessageDigest::sha256()).unwrap();
        }
    }

    builder.build()
}

#[cfg(test)]
pub(crate) fn test_key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

/// A certificate authority and a user certificate it signed, with
/// the user certificate good for `lifetime_secs`.
#[cfg(test)]
pub(crate) fn test_user(
    cn: &str,
    lifetime_secs: i64
) -> (X509, ProxyCredential) {
    let ca_key = test_key();
    let ca = issue_test_cert("Test CA", &ca_key, None, 86400 * 30);
    let user_key = test_key();
    let user =
        issue_test_cert(cn, &user_key, Some((&ca, &ca_key)), lifetime_secs);
    let cred = ProxyCredential::new(user, user_key, vec![ca.clone()]).unwrap();

    (ca, cred)
}

/// Run a complete delegation exchange in memory.
#[cfg(test)]
pub(crate) fn delegate_in_memory(
    issuer: ProxyCredential,
    policy: DelegationConfig
) -> Result<ProxyCredential, ProxyError> {
    let mut delegator = ProxyDelegator::new(issuer, policy);
    let mut requester = ProxyRequester::new(2048);
    let mut input = None;

    loop {
        let (token, done) = match delegator.step(input.as_deref())? {
            DelegatorStep::Continue(token) => (token, false),
            DelegatorStep::Complete(token) => (token, true)
        };

        match requester.step(&token)? {
            RequesterStep::Continue(reply) => {
                assert!(!done);
                input = Some(reply);
            }
            RequesterStep::Complete(cred) => {
                assert!(done);

                return Ok(cred);
            }
        }
    }
}

#[cfg(test)]
use crate::init;

#[test]
fn test_strip_proxy_markers() {
    init();

    let base = "/O=Grid/OU=Test/CN=Alice";

    assert_eq!(base, strip_proxy_markers(base));
    assert_eq!(base, strip_proxy_markers("/O=Grid/OU=Test/CN=Alice/CN=proxy"));
    assert_eq!(
        base,
        strip_proxy_markers(concat!(
            "/O=Grid/OU=Test/CN=Alice",
            "/CN=proxy/CN=limited proxy/CN=proxy/CN=limited proxy"
        ))
    );
}

#[test]
fn test_strip_proxy_markers_idempotent() {
    init();

    let name = "/O=Grid/CN=Alice/CN=limited proxy/CN=proxy";
    let once = strip_proxy_markers(name);

    assert_eq!(once, strip_proxy_markers(once));
}

#[test]
fn test_strip_proxy_markers_keeps_other_components() {
    init();

    // Only whole trailing marker components are removed.
    assert_eq!(
        "/O=Grid/CN=proxy user",
        strip_proxy_markers("/O=Grid/CN=proxy user")
    );
    assert_eq!(
        "/O=Grid/CN=proxy/CN=Alice",
        strip_proxy_markers("/O=Grid/CN=proxy/CN=Alice/CN=proxy")
    );
    assert_ne!(
        strip_proxy_markers("/O=Grid/CN=Alice/CN=proxy"),
        strip_proxy_markers("/O=Grid/CN=Mallory/CN=proxy")
    );
}

#[test]
fn test_proxy_filename_from_env() {
    init();

    // Only this test touches the variable.
    env::set_var(PROXY_ENV, "/var/tmp/test-proxy.pem");

    let explicit = proxy_filename();

    env::remove_var(PROXY_ENV);

    let fallback = proxy_filename();

    assert_eq!(PathBuf::from("/var/tmp/test-proxy.pem"), explicit);
    assert_eq!(
        PathBuf::from(format!("/tmp/x509up_u{}", getuid())),
        fallback
    );
}

#[test]
fn test_delegate_limited() {
    init();

    let (ca, user) = test_user("Alice", 86400);
    let user_subject = user.subject().unwrap();
    let user_cert = user.certificate().clone();
    let user_remaining = user.time_remaining().unwrap();
    let proxy = delegate_in_memory(user, DelegationConfig::default()).unwrap();

    assert_eq!(
        format!("{}/CN=limited proxy", user_subject),
        proxy.subject().unwrap()
    );
    assert_eq!(user_subject, proxy.identity().unwrap());
    assert_eq!(2, proxy.chain().len());
    assert!(proxy
        .certificate()
        .verify(&user_cert.public_key().unwrap())
        .unwrap());
    assert!(proxy.chain()[0]
        .verify(&ca.public_key().unwrap())
        .unwrap());
    assert_eq!(
        ca.to_der().unwrap(),
        proxy.chain()[1].to_der().unwrap()
    );
    assert!(proxy.time_remaining().unwrap() <= user_remaining);
}

#[test]
fn test_delegate_full_capped() {
    init();

    let (_, user) = test_user("Bob", 86400);
    let policy: DelegationConfig = serde_yaml::from_str(
        "limited: false\nmax-lifetime: 600\n"
    )
    .unwrap();
    let proxy = delegate_in_memory(user, policy).unwrap();

    assert!(proxy.subject().unwrap().ends_with("/CN=Bob/CN=proxy"));
    assert!(proxy.time_remaining().unwrap() <= Duration::from_secs(600));
    assert!(proxy.time_remaining().unwrap() >= Duration::from_secs(590));
}

#[test]
fn test_redelegate_from_proxy() {
    init();

    let (_, user) = test_user("Carol", 86400);
    let first = delegate_in_memory(user, DelegationConfig::default()).unwrap();
    let second = delegate_in_memory(first, DelegationConfig::default()).unwrap();

    assert!(second
        .subject()
        .unwrap()
        .ends_with("/CN=Carol/CN=limited proxy/CN=limited proxy"));
    assert!(second.identity().unwrap().ends_with("/CN=Carol"));
    assert_eq!(3, second.chain().len());
}

#[test]
fn test_pem_round_trip() {
    init();

    let (_, user) = test_user("Dave", 86400);
    let proxy = delegate_in_memory(user, DelegationConfig::default()).unwrap();
    let pem = proxy.to_pem().unwrap();
    let text = String::from_utf8(pem.clone()).unwrap();

    // Certificate, then key, then chain.
    let cert_pos = text.find("BEGIN CERTIFICATE").unwrap();
    let key_pos = text.find("PRIVATE KEY").unwrap();

    assert!(cert_pos < key_pos);
    assert!(text[key_pos..].contains("BEGIN CERTIFICATE"));

    let parsed = ProxyCredential::from_pem(&pem).unwrap();

    assert_eq!(proxy.subject().unwrap(), parsed.subject().unwrap());
    assert_eq!(proxy.chain().len(), parsed.chain().len());
}

#[test]
fn test_expired_issuer_refuses() {
    init();

    let (_, user) = test_user("Eve", -60);

    assert_eq!(Duration::from_secs(0), user.time_remaining().unwrap());
    assert!(matches!(
        delegate_in_memory(user, DelegationConfig::default()),
        Err(ProxyError::Expired)
    ));
}

#[test]
fn test_out_of_sequence() {
    init();

    let (_, user) = test_user("Frank", 86400);
    let mut delegator = ProxyDelegator::new(user, DelegationConfig::default());
    let mut requester = ProxyRequester::new(2048);

    assert!(matches!(
        delegator.step(Some(b"junk")),
        Err(ProxyError::OutOfSequence)
    ));
    assert!(matches!(requester.step(b"X"), Err(ProxyError::BadStart)));
}

#[test]
fn test_mismatched_chain_rejected() {
    init();

    let (_, user) = test_user("Grace", 86400);
    let mut delegator = ProxyDelegator::new(user, DelegationConfig::default());
    let mut honest = ProxyRequester::new(2048);
    let mut other = ProxyRequester::new(2048);

    let start = match delegator.step(None).unwrap() {
        DelegatorStep::Continue(token) => token,
        DelegatorStep::Complete(_) => panic!("expected continuation")
    };
    let req = match honest.step(&start).unwrap() {
        RequesterStep::Continue(req) => req,
        RequesterStep::Complete(_) => panic!("expected continuation")
    };

    // A different requester has its own pending key.
    assert!(matches!(
        other.step(&start).unwrap(),
        RequesterStep::Continue(_)
    ));

    let chain = match delegator.step(Some(&req)).unwrap() {
        DelegatorStep::Complete(chain) => chain,
        DelegatorStep::Continue(_) => panic!("expected completion")
    };

    assert!(matches!(other.step(&chain), Err(ProxyError::KeyMismatch)));
}

#[test]
fn test_error_messages() {
    init();

    let missing = ProxyCredential::load("/nonexistent/x509up_u0").unwrap_err();
    let garbage = ProxyCredential::from_pem(b"not a proxy").unwrap_err();

    assert!(matches!(missing, ProxyError::IO { .. }));
    assert!(!missing.to_string().is_empty());
    assert!(matches!(
        garbage,
        ProxyError::OpenSSL { .. } | ProxyError::NoCertificate
    ));
    assert!(!garbage.to_string().is_empty());
    assert_eq!("issuing proxy has expired", ProxyError::Expired.to_string());
}

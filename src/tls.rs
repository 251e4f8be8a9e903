//! TLS setup and server certificate verification.
//!
//! Verification is split in two steps. The chain is validated against the
//! trust anchors first; only then is the certificate matched against the
//! configured host and, failing that, against each CNAME alias of the host.
//! A name mismatch is therefore always a distinct failure from an untrusted
//! or malformed chain.
//!
//! # Example
//!
//! ```
//! use slirc_link::tls::{match_identity, Identity};
//!
//! let aliases = vec!["irc.alias.test".to_string()];
//! let identity = match_identity("irc.example.net", &aliases, |name| {
//!     if name == "irc.alias.test" { Ok(()) } else { Err(()) }
//! });
//! assert_eq!(identity.unwrap(), Identity::Alias("irc.alias.test".to_string()));
//! ```

use std::fs::File;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use hickory_resolver::error::ResolveError;
use hickory_resolver::proto::rr::{RData, RecordType};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore};
use tracing::{debug, error, info, warn};

use crate::config::TlsConfig;
use crate::error::TlsError;

/// The name a verified certificate was accepted for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    /// The configured host.
    Host,
    /// A CNAME alias of the configured host.
    Alias(String),
}

/// How the server certificate of an established TLS connection was checked.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Verification {
    /// Chain and name verified against the configured host.
    Host,
    /// Chain verified; the name matched this CNAME alias instead of the host.
    Alias(String),
    /// Verification turned off by configuration; any certificate was accepted.
    Disabled,
}

impl From<Identity> for Verification {
    fn from(identity: Identity) -> Self {
        match identity {
            Identity::Host => Verification::Host,
            Identity::Alias(name) => Verification::Alias(name),
        }
    }
}

/// Match a certificate against `host`, then against each alias in order.
///
/// `matches` reports whether the certificate is valid for a given name.
/// An alias match is logged at warning level.
pub fn match_identity<E>(
    host: &str,
    aliases: &[String],
    mut matches: impl FnMut(&str) -> Result<(), E>,
) -> Result<Identity, TlsError> {
    if matches(host).is_ok() {
        return Ok(Identity::Host);
    }

    error!(host, "Hostname mismatch between configuration and certificate");
    for alias in aliases {
        if matches(alias).is_ok() {
            warn!(host, alias = %alias, "Using alias instead of configured host for TLS connection");
            return Ok(Identity::Alias(alias.clone()));
        }
    }

    error!(host, aliases = ?aliases, "Invalid certificate, no hostname matches");
    Err(TlsError::CertificateMismatch {
        host: host.to_string(),
        aliases: aliases.to_vec(),
    })
}

// =============================================================================
// Alias resolution
// =============================================================================

/// Source of DNS aliases for the certificate name fallback.
pub trait AliasResolver: Send + Sync {
    /// CNAME aliases of `host`, without the trailing dot. Failures yield no aliases.
    fn aliases<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Vec<String>>;
}

/// Resolver that never returns aliases, turning the fallback off.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoAliases;

impl AliasResolver for NoAliases {
    fn aliases<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async { Vec::new() })
    }
}

/// Fixed alias list, for hosts that know their aliases up front.
#[derive(Clone, Debug, Default)]
pub struct StaticAliases(pub Vec<String>);

impl AliasResolver for StaticAliases {
    fn aliases<'a>(&'a self, _host: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move { self.0.clone() })
    }
}

/// CNAME lookup through the system DNS configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct DnsAliasResolver;

impl AliasResolver for DnsAliasResolver {
    fn aliases<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Vec<String>> {
        Box::pin(async move {
            if host.parse::<IpAddr>().is_ok() {
                return Vec::new();
            }
            match lookup_cnames(host).await {
                Ok(aliases) => aliases,
                Err(e) => {
                    debug!(host, error = %e, "CNAME lookup failed");
                    Vec::new()
                }
            }
        })
    }
}

async fn lookup_cnames(host: &str) -> Result<Vec<String>, ResolveError> {
    let resolver = TokioAsyncResolver::tokio_from_system_conf()?;
    let lookup = resolver.lookup(host, RecordType::CNAME).await?;
    Ok(lookup
        .iter()
        .filter_map(|rdata| match rdata {
            RData::CNAME(cname) => Some(cname.0.to_utf8().trim_end_matches('.').to_string()),
            _ => None,
        })
        .collect())
}

// =============================================================================
// Certificate verifiers
// =============================================================================

/// Chain validation against trust anchors plus host/alias name matching.
#[derive(Debug)]
struct HostnameVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    host: String,
    aliases: Vec<String>,
    outcome: Mutex<Option<Result<Identity, TlsError>>>,
}

impl HostnameVerifier {
    fn new(
        roots: Arc<RootCertStore>,
        provider: Arc<CryptoProvider>,
        host: &str,
        aliases: Vec<String>,
    ) -> Self {
        Self {
            roots,
            provider,
            host: host.to_string(),
            aliases,
            outcome: Mutex::new(None),
        }
    }

    /// Name check result of the last handshake, if one got that far.
    fn take_outcome(&self) -> Option<Result<Identity, TlsError>> {
        self.outcome.lock().take()
    }
}

impl ServerCertVerifier for HostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = ParsedCertificate::try_from(end_entity)?;
        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        let outcome = match_identity(&self.host, &self.aliases, |name| {
            let name = ServerName::try_from(name)
                .map_err(|_| rustls::Error::InvalidCertificate(CertificateError::NotValidForName))?;
            rustls::client::verify_server_name(&cert, &name)
        });
        let accepted = outcome.is_ok();
        *self.outcome.lock() = Some(outcome);

        if accepted {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Accepts any certificate. Only reachable through `TlsConfig { verify: false, .. }`.
#[derive(Debug)]
struct NoVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// =============================================================================
// Connector
// =============================================================================

/// Client-side TLS connector for one server.
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
    verifier: Option<Arc<HostnameVerifier>>,
    host: String,
}

impl TlsConnector {
    /// Build a connector for `host` under the given policy.
    ///
    /// `aliases` are only consulted when verification is on and the
    /// certificate does not match `host`.
    pub fn new(config: &TlsConfig, host: &str, aliases: Vec<String>) -> Result<Self, TlsError> {
        let provider = Arc::new(crypto::ring::default_provider());
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous();

        if !config.verify {
            warn!(host, "TLS certificate verification disabled by configuration");
            let client_config = builder
                .with_custom_certificate_verifier(Arc::new(NoVerification { provider }))
                .with_no_client_auth();
            return Ok(Self {
                inner: Arc::new(client_config).into(),
                verifier: None,
                host: host.to_string(),
            });
        }

        let roots = Arc::new(load_roots(config.ca_certs.as_deref())?);
        let verifier = Arc::new(HostnameVerifier::new(roots, provider, host, aliases));
        let client_config = builder
            .with_custom_certificate_verifier(verifier.clone())
            .with_no_client_auth();

        Ok(Self {
            inner: Arc::new(client_config).into(),
            verifier: Some(verifier),
            host: host.to_string(),
        })
    }

    /// Whether certificates are verified.
    pub fn verifies(&self) -> bool {
        self.verifier.is_some()
    }

    /// Run the handshake over an established TCP stream.
    pub async fn connect(
        &self,
        stream: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, Verification), TlsError> {
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|_| TlsError::InvalidServerName(self.host.clone()))?;

        let result = self.inner.connect(server_name, stream).await;
        let outcome = self.verifier.as_ref().and_then(|v| v.take_outcome());

        match (result, outcome) {
            (_, Some(Err(mismatch))) => Err(mismatch),
            (Ok(stream), Some(Ok(identity))) => {
                info!(host = %self.host, "TLS handshake complete");
                Ok((stream, identity.into()))
            }
            (Ok(stream), None) if !self.verifies() => {
                info!(host = %self.host, "TLS handshake complete without verification");
                Ok((stream, Verification::Disabled))
            }
            (Ok(stream), None) => Ok((stream, Verification::Host)),
            (Err(source), _) => Err(TlsError::Handshake {
                host: self.host.clone(),
                source: Arc::new(source),
            }),
        }
    }
}

/// Trust anchors from a PEM bundle, or the bundled Mozilla roots.
pub fn load_roots(ca_certs: Option<&Path>) -> Result<RootCertStore, TlsError> {
    let Some(path) = ca_certs else {
        return Ok(RootCertStore::from_iter(
            webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
        ));
    };

    let ca_error = |source| TlsError::CaCerts {
        path: path.to_path_buf(),
        source: Arc::new(source),
    };
    let file = File::open(path).map_err(ca_error)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(ca_error)?;

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    if ignored > 0 {
        warn!(path = %path.display(), ignored, "Ignored unparsable CA certificates");
    }
    if added == 0 {
        return Err(TlsError::NoTrustAnchors(path.to_path_buf()));
    }

    debug!(path = %path.display(), added, "Loaded CA certificates");
    Ok(roots)
}

//! Error types for the IRC connection backend.
//!
//! Every failure inside the backend ends up in one of the host
//! notifications. These types are what those notifications carry, and what
//! [`Backend::connect`](crate::Backend::connect) returns on failure.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Errors reported to the host through [`Handler::on_error`](crate::Handler::on_error).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection could not be established.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// Reading from an established transport failed.
    #[error("read error: {0}")]
    Read(#[source] std::io::Error),

    /// A heartbeat job failed or panicked; the connection is no longer trusted.
    #[error("heartbeat job {job} failed: {reason}")]
    Job {
        /// Name of the failing job.
        job: &'static str,
        /// Description of the failure.
        reason: String,
    },
}

/// Errors raised while establishing a connection.
///
/// Cloneable, so the same value can be reported to the handler and
/// returned to the caller.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// Name resolution of the server host failed.
    #[error("failed to resolve {host}: {source}")]
    Resolve {
        /// Host being resolved.
        host: String,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Name resolution succeeded but returned no usable address.
    #[error("no usable address for {0}")]
    NoAddress(String),

    /// Every resolved address refused or failed the TCP connection.
    #[error("connection to {addr} failed: {source}")]
    Connect {
        /// Last address tried.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The local socket could not be created or bound to the source address.
    #[error("socket setup failed: {0}")]
    Socket(#[source] Arc<io::Error>),

    /// TLS setup, handshake or certificate verification failed.
    #[error(transparent)]
    Tls(#[from] TlsError),
}

impl ConnectError {
    /// Whether this is the fatal "certificate matches neither host nor alias" case.
    ///
    /// Hosts that used to exit the process on this condition can test for
    /// it here and decide for themselves.
    pub fn is_certificate_mismatch(&self) -> bool {
        matches!(self, ConnectError::Tls(TlsError::CertificateMismatch { .. }))
    }
}

/// TLS-specific failures.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TlsError {
    /// The certificate is valid but issued for neither the host nor any of its aliases.
    #[error("certificate matches neither {host} nor any alias {aliases:?}")]
    CertificateMismatch {
        /// Configured host.
        host: String,
        /// CNAME aliases that were also tried.
        aliases: Vec<String>,
    },

    /// The handshake failed for any other reason (chain validation included).
    #[error("TLS handshake with {host} failed: {source}")]
    Handshake {
        /// Configured host.
        host: String,
        /// The underlying I/O error, wrapping the rustls error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The host is not a valid DNS name or IP address for SNI.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// The CA bundle could not be read.
    #[error("failed to load CA certificates from {path}: {source}")]
    CaCerts {
        /// Path of the bundle.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The CA bundle contained no usable certificate.
    #[error("no usable CA certificates in {0}")]
    NoTrustAnchors(PathBuf),

    /// rustls refused the client configuration.
    #[error("TLS configuration error: {0}")]
    Config(#[from] tokio_rustls::rustls::Error),
}

/// Errors returned by [`Connection::send`](crate::Connection::send).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SendError {
    /// Writing to the transport failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The line contains CR or LF and would split into several protocol lines.
    #[error("line contains a line terminator: {0:?}")]
    InvalidLine(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TlsError::CertificateMismatch {
            host: "irc.example.net".to_string(),
            aliases: vec!["edge.example.org".to_string()],
        };
        assert_eq!(
            format!("{}", err),
            "certificate matches neither irc.example.net nor any alias [\"edge.example.org\"]"
        );

        let err = ConnectError::NoAddress("irc.invalid".to_string());
        assert_eq!(format!("{}", err), "no usable address for irc.invalid");
    }

    #[test]
    fn test_certificate_mismatch_is_distinct() {
        let mismatch = ConnectError::from(TlsError::CertificateMismatch {
            host: "a".to_string(),
            aliases: Vec::new(),
        });
        assert!(mismatch.is_certificate_mismatch());

        let handshake = ConnectError::from(TlsError::Handshake {
            host: "a".to_string(),
            source: Arc::new(io::Error::new(io::ErrorKind::InvalidData, "bad record")),
        });
        assert!(!handshake.is_certificate_mismatch());
    }

    #[test]
    fn test_error_source_chaining() {
        let io_err =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = ConnectError::Connect {
            addr: "127.0.0.1:6667".parse().unwrap(),
            source: Arc::new(io_err),
        };

        let source = std::error::Error::source(&err);
        assert!(source.is_some());
        assert_eq!(source.unwrap().to_string(), "connection refused");

        // Transparent wrapping keeps the inner message
        let outer = Error::from(err);
        assert!(outer.to_string().starts_with("connection to 127.0.0.1:6667 failed"));
    }

    #[test]
    fn test_connect_error_clones_with_source() {
        let err = ConnectError::Resolve {
            host: "irc.invalid".to_string(),
            source: Arc::new(io::Error::new(io::ErrorKind::NotFound, "no such host")),
        };
        // one copy goes to the handler, the other back to the caller
        let reported = Error::Connect(err.clone());

        assert_eq!(reported.to_string(), err.to_string());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "no such host");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe");
        let send_err: SendError = io_err.into();

        match send_err {
            SendError::Io(_) => {} // Expected
            _ => panic!("Expected Io variant"),
        }
    }
}

//! Connection configuration.
//!
//! The backend consumes a handful of named settings. How the host stores
//! them is its own business; with the `serde` feature enabled these structs
//! can be deserialized from whatever format the host uses.

use std::path::PathBuf;
use std::time::Duration;

/// Server timeout used when none (or zero) is configured.
pub const DEFAULT_SERVER_TIMEOUT_SECS: u64 = 120;

/// Ping interval as a percentage of the server timeout.
pub const PING_INTERVAL_PERCENT: u64 = 45;

/// How often the send-ping job runs.
pub const DEFAULT_PING_CHECK_SECS: u64 = 5;

/// How often the check-timeout job runs.
pub const DEFAULT_TIMEOUT_CHECK_SECS: u64 = 10;

/// Size of a single transport read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;

/// Settings shared by every connection a [`Backend`](crate::Backend) opens.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConnectionConfig {
    /// Seconds without any inbound traffic before the connection is dropped.
    /// Zero means "use the default".
    pub server_timeout_secs: u64,
    /// Seconds of silence before a keepalive PING is sent.
    /// `None` (or a non-positive value) means 45% of the server timeout.
    pub ping_interval_secs: Option<f64>,
    /// Heartbeat job periods.
    pub heartbeat: HeartbeatConfig,
    /// Bytes requested per read from the transport.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_timeout_secs: DEFAULT_SERVER_TIMEOUT_SECS,
            ping_interval_secs: None,
            heartbeat: HeartbeatConfig::default(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl ConnectionConfig {
    /// Build a config from the two optional timing settings.
    pub fn with_timeouts(server_timeout_secs: Option<u64>, ping_interval_secs: Option<f64>) -> Self {
        Self {
            server_timeout_secs: server_timeout_secs.unwrap_or(0),
            ping_interval_secs,
            ..Self::default()
        }
    }

    /// Effective server timeout.
    pub fn server_timeout(&self) -> Duration {
        match self.server_timeout_secs {
            0 => Duration::from_secs(DEFAULT_SERVER_TIMEOUT_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    /// Effective ping interval.
    pub fn ping_interval(&self) -> Duration {
        match self.ping_interval_secs {
            Some(secs) if secs > 0.0 && secs.is_finite() => Duration::from_secs_f64(secs),
            _ => {
                // integer math keeps 120s -> exactly 54s
                let millis = self.server_timeout().as_millis() as u64;
                Duration::from_millis(millis * PING_INTERVAL_PERCENT / 100)
            }
        }
    }

    /// Effective read chunk size (never zero).
    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size.max(1)
    }
}

/// Periods of the two built-in heartbeat jobs.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct HeartbeatConfig {
    /// Period of the send-ping job, in seconds.
    pub ping_check_secs: u64,
    /// Period of the check-timeout job, in seconds.
    pub timeout_check_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_check_secs: DEFAULT_PING_CHECK_SECS,
            timeout_check_secs: DEFAULT_TIMEOUT_CHECK_SECS,
        }
    }
}

impl HeartbeatConfig {
    pub(crate) fn ping_check(&self) -> Duration {
        Duration::from_secs(self.ping_check_secs.max(1))
    }

    pub(crate) fn timeout_check(&self) -> Duration {
        Duration::from_secs(self.timeout_check_secs.max(1))
    }
}

/// TLS policy for one connection.
///
/// Verification is on unless explicitly turned off with [`TlsConfig::insecure`]
/// or by setting `verify` to `false`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TlsConfig {
    /// Validate the server certificate chain and name.
    pub verify: bool,
    /// PEM bundle of trusted roots. `None` uses the bundled Mozilla roots.
    pub ca_certs: Option<PathBuf>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            verify: true,
            ca_certs: None,
        }
    }
}

impl TlsConfig {
    /// Verified TLS trusting the roots in `path`.
    pub fn with_ca_certs(path: impl Into<PathBuf>) -> Self {
        Self {
            verify: true,
            ca_certs: Some(path.into()),
        }
    }

    /// TLS without any certificate verification.
    pub fn insecure() -> Self {
        Self {
            verify: false,
            ca_certs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = ConnectionConfig::default();
        assert_eq!(config.server_timeout(), Duration::from_secs(120));
        assert_eq!(config.ping_interval(), Duration::from_secs(54));
    }

    #[test]
    fn test_ping_interval_follows_timeout() {
        let config = ConnectionConfig::with_timeouts(Some(200), None);
        assert_eq!(config.server_timeout(), Duration::from_secs(200));
        assert_eq!(config.ping_interval(), Duration::from_secs(90));
    }

    #[test]
    fn test_zero_means_default() {
        let config = ConnectionConfig::with_timeouts(Some(0), Some(0.0));
        assert_eq!(config.server_timeout(), Duration::from_secs(120));
        assert_eq!(config.ping_interval(), Duration::from_secs(54));
    }

    #[test]
    fn test_explicit_ping_interval() {
        let config = ConnectionConfig::with_timeouts(None, Some(30.5));
        assert_eq!(config.server_timeout(), Duration::from_secs(120));
        assert_eq!(config.ping_interval(), Duration::from_millis(30_500));
    }

    #[test]
    fn test_tls_verifies_by_default() {
        assert!(TlsConfig::default().verify);
        assert!(TlsConfig::with_ca_certs("/etc/ssl/irc.pem").verify);
        assert!(!TlsConfig::insecure().verify);
    }

    #[test]
    fn test_heartbeat_periods_never_zero() {
        let heartbeat = HeartbeatConfig {
            ping_check_secs: 0,
            timeout_check_secs: 0,
        };
        assert_eq!(heartbeat.ping_check(), Duration::from_secs(1));
        assert_eq!(heartbeat.timeout_check(), Duration::from_secs(1));
    }
}

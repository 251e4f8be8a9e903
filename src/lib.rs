//! # slirc-link
//!
//! The connection engine of an IRC client: everything between a socket and
//! a stream of decoded lines.
//!
//! ## Features
//!
//! - TCP connections with optional source-address binding and keepalive
//! - TLS with chain and host name verification, falling back to the
//!   host's DNS CNAME aliases when the certificate name does not match
//! - Line framing that tolerates split reads, bare LF terminators and
//!   non-UTF-8 servers (CP-1252 and Latin-1 fallback)
//! - A heartbeat that sends keepalive PINGs and drops silent connections
//! - Host callbacks through a single [`Handler`] trait

#![deny(clippy::all)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use slirc_link::{Backend, ConnectionConfig, Handler, TlsConfig};
//!
//! struct Printer;
//!
//! impl Handler for Printer {
//!     fn on_message(&self, line: &str) {
//!         println!("{line}");
//!     }
//! }
//!
//! # async fn run() -> Result<(), slirc_link::ConnectError> {
//! let backend = Backend::new(
//!     tokio::runtime::Handle::current(),
//!     ConnectionConfig::default(),
//!     Arc::new(Printer),
//! );
//! let conn = backend
//!     .connect("irc.libera.chat", 6697, None, Some(&TlsConfig::default()))
//!     .await?;
//! conn.send_line("NICK slirc").await.ok();
//! conn.send_line("USER slirc 0 * :slirc").await.ok();
//! conn.closed().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Framing only
//!
//! ```rust
//! use slirc_link::LineFramer;
//!
//! let mut framer = LineFramer::new();
//! assert!(framer.feed(b":irc.example.net NOTICE * :hel").is_empty());
//! assert_eq!(framer.feed(b"lo\r\n"), vec![":irc.example.net NOTICE * :hello"]);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod line;
pub mod tls;
pub mod transport;

pub use self::backend::{Backend, Connection, ConnectionState};
pub use self::config::{ConnectionConfig, HeartbeatConfig, TlsConfig};
pub use self::error::{ConnectError, Error, SendError, TlsError};
pub use self::handler::Handler;
pub use self::heartbeat::{ActivityClock, CheckTimeout, Job, Schedule, SendPing};
pub use self::line::{Charset, LineCodec, LineFramer};
pub use self::tls::{AliasResolver, DnsAliasResolver, NoAliases, StaticAliases, Verification};
pub use self::transport::Transport;

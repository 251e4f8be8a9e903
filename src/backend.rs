//! Connection lifecycle.
//!
//! A [`Backend`] opens [`Connection`]s. Each connection owns its transport,
//! its incoming line buffer and a heartbeat [`Schedule`], and reports every
//! transition to the host's [`Handler`]:
//!
//! ```text
//! connecting --> connected --> closing --> disconnected
//!      \                         ^
//!       `------ (failure) -------'
//! ```
//!
//! Two tasks run per connection: the reader, which feeds the line framer
//! and dispatches `on_message` in order, and the heartbeat scheduler.
//! Writes are serialized by an async mutex around the write half.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ConnectionConfig, TlsConfig};
use crate::error::{ConnectError, Error, SendError};
use crate::handler::Handler;
use crate::heartbeat::{default_jobs, ActivityClock, Job, Schedule};
use crate::line::{encode_line, LineFramer};
use crate::tls::{AliasResolver, DnsAliasResolver, TlsConnector, Verification};
use crate::transport::{connect_tcp, Transport};

/// How long `close` waits for the transport to shut down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle state of a [`Connection`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// Resolving, connecting or running the TLS handshake.
    Connecting,
    /// Transport established; lines flow both ways.
    Connected,
    /// Tearing down.
    Closing,
    /// Final state.
    Disconnected,
}

// =============================================================================
// Connection
// =============================================================================

/// One link to one IRC server. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    host: String,
    port: u16,
    source_address: Option<SocketAddr>,
    config: Arc<ConnectionConfig>,
    handler: Arc<dyn Handler>,
    runtime: Handle,
    state: watch::Sender<ConnectionState>,
    writer: AsyncMutex<Option<Writer>>,
    framer: Mutex<LineFramer>,
    activity: ActivityClock,
    schedule: Schedule,
    shutdown: CancellationToken,
    closed: AtomicBool,
    verification: Mutex<Option<Verification>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    fn new(
        host: &str,
        port: u16,
        source_address: Option<SocketAddr>,
        backend: &Backend,
    ) -> Self {
        let mut jobs = default_jobs(&backend.config.heartbeat);
        jobs.extend(backend.jobs.iter().cloned());

        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(Inner {
                host: host.to_string(),
                port,
                source_address,
                config: backend.config.clone(),
                handler: backend.handler.clone(),
                runtime: backend.runtime.clone(),
                state,
                writer: AsyncMutex::new(None),
                framer: Mutex::new(LineFramer::new()),
                activity: ActivityClock::new(),
                schedule: Schedule::new(jobs),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                verification: Mutex::new(None),
            }),
        }
    }

    /// Take ownership of an established stream and go live.
    async fn start<S>(&self, stream: S, verification: Option<Verification>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let (reader, writer) = tokio::io::split(stream);
        *self.inner.writer.lock().await = Some(Box::new(writer));
        *self.inner.verification.lock() = verification;

        self.inner.activity.touch_event();
        self.inner.state.send_replace(ConnectionState::Connected);
        info!(host = %self.inner.host, port = self.inner.port, "Connection accepted by the server");

        self.inner.schedule.start(self.clone(), &self.inner.runtime);
        self.inner.handler.on_connect();
        self.inner.runtime.spawn(read_loop(self.clone(), reader));
    }

    /// Feed received bytes through the line framer and dispatch every
    /// complete line to the handler, in order.
    pub fn receive(&self, data: &[u8]) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        self.inner.activity.touch_event();
        self.inner.framer.lock().push(data);

        loop {
            // the framer lock must not be held while the handler runs
            let next = self.inner.framer.lock().next_line();
            let Some(line) = next else { break };
            self.inner.activity.touch_event();
            trace!("<< {}", line);
            self.inner.handler.on_message(&line);
        }
    }

    /// Write raw bytes to the server.
    ///
    /// Without an active transport this only logs a warning. A write still
    /// pending when the connection closes is abandoned with
    /// [`io::ErrorKind::ConnectionAborted`].
    pub async fn send(&self, data: &[u8]) -> Result<(), SendError> {
        let mut guard = self.inner.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) if !self.inner.closed.load(Ordering::Acquire) => writer,
            _ => {
                warn!(host = %self.inner.host, "Attempted to send data without a transport");
                return Ok(());
            }
        };

        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        tokio::select! {
            result = write => result?,
            _ = self.inner.shutdown.cancelled() => {
                debug!(host = %self.inner.host, "Send interrupted by close");
                return Err(SendError::Io(io::ErrorKind::ConnectionAborted.into()));
            }
        }

        trace!(">> {}", String::from_utf8_lossy(data).trim_end());
        Ok(())
    }

    /// Send one line, appending CRLF.
    pub async fn send_line(&self, line: &str) -> Result<(), SendError> {
        let mut buf = BytesMut::new();
        encode_line(line, &mut buf).map_err(|_| SendError::InvalidLine(line.to_string()))?;
        self.send(&buf).await
    }

    /// Close the connection. Only the first call has any effect.
    pub async fn close(&self) {
        self.close_with(None).await;
    }

    /// Close, reporting `error` first if this call is the one that closes.
    async fn close_with(&self, error: Option<&Error>) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(error) = error {
            self.inner.handler.on_error(error);
        }

        self.inner.schedule.stop();
        self.inner.state.send_replace(ConnectionState::Closing);
        // aborts any pending send, so the writer lock is released promptly
        self.inner.shutdown.cancel();
        info!(host = %self.inner.host, port = self.inner.port, "Closing connection");

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Error shutting down transport"),
                Err(_) => warn!(host = %self.inner.host, "Timed out shutting down the transport"),
            }
        }

        self.inner.state.send_replace(ConnectionState::Disconnected);
        self.inner.handler.on_close();
    }

    /// Discard any partially received line, then close.
    pub async fn abort(&self) {
        self.inner.framer.lock().clear();
        self.close().await;
    }

    /// Report `error` to the handler and close, unless already closed.
    pub(crate) async fn fail(&self, error: &Error) {
        self.close_with(Some(error)).await;
    }

    /// Resolves once the connection is disconnected.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        // the sender lives as long as `self`
        let _ = state
            .wait_for(|state| *state == ConnectionState::Disconnected)
            .await;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether lines can currently be exchanged.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Server host name as given to [`Backend::connect`].
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Server port.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Local address the socket was bound to, if one was requested.
    pub fn source_address(&self) -> Option<SocketAddr> {
        self.inner.source_address
    }

    /// How the server certificate was checked; `None` for plain connections.
    pub fn tls_verification(&self) -> Option<Verification> {
        self.inner.verification.lock().clone()
    }

    /// Time since the server last sent anything.
    pub fn last_event_elapsed(&self) -> Option<Duration> {
        self.inner.activity.since_last_event()
    }

    /// Settings this connection runs with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }

    /// Activity timestamps, for heartbeat jobs.
    pub fn activity(&self) -> &ActivityClock {
        &self.inner.activity
    }
}

async fn read_loop<R>(conn: Connection, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; conn.config().read_buffer_size()];
    let shutdown = conn.inner.shutdown.clone();

    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                info!(host = %conn.host(), "Connection closed by the server");
                conn.close().await;
                return;
            }
            Ok(n) => conn.receive(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(host = %conn.host(), error = %e, "Read error");
                conn.fail(&Error::Read(e)).await;
                return;
            }
        }
    }
}

// =============================================================================
// Backend
// =============================================================================

/// Opens connections on a runtime with shared settings and a shared handler.
pub struct Backend {
    runtime: Handle,
    config: Arc<ConnectionConfig>,
    handler: Arc<dyn Handler>,
    resolver: Arc<dyn AliasResolver>,
    jobs: Vec<Arc<dyn Job>>,
}

impl Backend {
    /// Backend spawning its tasks on `runtime`.
    ///
    /// Certificate name fallback looks up CNAME aliases in DNS; use
    /// [`with_alias_resolver`](Self::with_alias_resolver) to change that.
    pub fn new(runtime: Handle, config: ConnectionConfig, handler: Arc<dyn Handler>) -> Self {
        Self {
            runtime,
            config: Arc::new(config),
            handler,
            resolver: Arc::new(DnsAliasResolver),
            jobs: Vec::new(),
        }
    }

    /// Replace the alias resolver used for certificate name fallback.
    pub fn with_alias_resolver(mut self, resolver: impl AliasResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Add a periodic job to every connection opened afterwards. It runs
    /// after the built-in ping and timeout checks.
    pub fn register_job(&mut self, job: Arc<dyn Job>) {
        self.jobs.push(job);
    }

    /// Shared connection settings.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connect to `host:port`, over TLS when `tls` is given.
    ///
    /// On failure the handler sees `on_error` then `on_close`, and the same
    /// error is returned.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        source_address: Option<SocketAddr>,
        tls: Option<&TlsConfig>,
    ) -> Result<Connection, ConnectError> {
        let conn = Connection::new(host, port, source_address, self);
        info!(host, port, tls = tls.is_some(), "Connecting");

        match self.open(host, port, source_address, tls).await {
            Ok((transport, verification)) => {
                conn.start(transport, verification).await;
                Ok(conn)
            }
            Err(e) => {
                error!(host, port, error = %e, "Connection failed");
                conn.fail(&Error::Connect(e.clone())).await;
                Err(e)
            }
        }
    }

    async fn open(
        &self,
        host: &str,
        port: u16,
        source_address: Option<SocketAddr>,
        tls: Option<&TlsConfig>,
    ) -> Result<(Transport, Option<Verification>), ConnectError> {
        let stream = connect_tcp(host, port, source_address).await?;
        let Some(tls) = tls else {
            return Ok((Transport::tcp(stream), None));
        };

        let aliases = if tls.verify {
            self.resolver.aliases(host).await
        } else {
            Vec::new()
        };
        let connector = TlsConnector::new(tls, host, aliases)?;
        let (stream, verification) = connector.connect(stream).await?;
        Ok((Transport::tls(stream), Some(verification)))
    }

    /// Run a connection over an already established byte stream.
    pub async fn attach<S>(&self, host: &str, port: u16, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Connection::new(host, port, None, self);
        conn.start(stream, None).await;
        conn
    }
}

//! Keepalive watchdog for a connection.
//!
//! A [`Schedule`] drives a list of periodic [`Job`]s from a single task, so
//! jobs of one connection never run concurrently. Two jobs are always
//! registered:
//!
//! - [`SendPing`] sends `PING <host>` once the link has been quiet for the
//!   ping interval.
//! - [`CheckTimeout`] drops the connection once nothing has been received
//!   for the server timeout.
//!
//! A job that fails or panics closes the connection: if the watchdog itself
//! is broken, the link can no longer be trusted.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tokio::runtime::Handle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::backend::Connection;
use crate::config::HeartbeatConfig;
use crate::error::Error;

// =============================================================================
// ActivityClock
// =============================================================================

/// Last-event and last-ping timestamps of one connection.
///
/// Stored as millisecond offsets from the clock's creation so each update is
/// a single atomic word. Zero means "never".
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_event: AtomicU64,
    last_ping: AtomicU64,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// A clock with no recorded activity.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_event: AtomicU64::new(0),
            last_ping: AtomicU64::new(0),
        }
    }

    fn stamp(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.origin).as_millis() as u64 + 1
    }

    fn instant(&self, stamp: u64) -> Option<Instant> {
        stamp
            .checked_sub(1)
            .map(|millis| self.origin + Duration::from_millis(millis))
    }

    /// Record inbound traffic now. Never moves the timestamp backwards.
    pub fn touch_event(&self) {
        self.last_event
            .fetch_max(self.stamp(Instant::now()), Ordering::AcqRel);
    }

    /// Record an outbound keepalive now.
    pub fn touch_ping(&self) {
        self.last_ping
            .fetch_max(self.stamp(Instant::now()), Ordering::AcqRel);
    }

    /// When traffic was last received.
    pub fn last_event(&self) -> Option<Instant> {
        self.instant(self.last_event.load(Ordering::Acquire))
    }

    /// When a keepalive was last sent.
    pub fn last_ping(&self) -> Option<Instant> {
        self.instant(self.last_ping.load(Ordering::Acquire))
    }

    /// Time since traffic was last received.
    pub fn since_last_event(&self) -> Option<Duration> {
        self.last_event()
            .map(|at| Instant::now().saturating_duration_since(at))
    }

    /// Time since the most recent of last event and last ping.
    pub fn since_last_activity(&self) -> Option<Duration> {
        let latest = self
            .last_event
            .load(Ordering::Acquire)
            .max(self.last_ping.load(Ordering::Acquire));
        self.instant(latest)
            .map(|at| Instant::now().saturating_duration_since(at))
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A periodic check bound to a connection.
pub trait Job: Send + Sync {
    /// Name used in logs and in [`Error::Job`].
    fn name(&self) -> &'static str;

    /// Time between two runs.
    fn interval(&self) -> Duration;

    /// Run once against `conn`.
    fn run<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, anyhow::Result<()>>;
}

/// Sends a keepalive PING when the connection has been idle too long.
#[derive(Clone, Debug)]
pub struct SendPing {
    interval: Duration,
}

impl SendPing {
    /// Job evaluated every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Job for SendPing {
    fn name(&self) -> &'static str {
        "send_ping"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if !conn.is_connected() {
                return Ok(());
            }

            let need_ping = match conn.activity().since_last_activity() {
                Some(elapsed) => elapsed > conn.config().ping_interval(),
                None => true,
            };
            if !need_ping {
                return Ok(());
            }

            // a peer that stops reading must not stall the other jobs
            let line = format!("PING {}", conn.host());
            let ping = conn.send_line(&line);
            match tokio::time::timeout(self.interval, ping).await {
                Ok(Ok(())) => conn.activity().touch_ping(),
                // the timeout check catches a link that is really dead
                Ok(Err(e)) => warn!(error = %e, "Socket error on PING"),
                Err(_) => warn!(timeout = ?self.interval, "PING write timed out"),
            }
            Ok(())
        })
    }
}

/// Closes the connection when the server has been silent past the timeout.
#[derive(Clone, Debug)]
pub struct CheckTimeout {
    interval: Duration,
}

impl CheckTimeout {
    /// Job evaluated every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Job for CheckTimeout {
    fn name(&self) -> &'static str {
        "check_timeout"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn run<'a>(&'a self, conn: &'a Connection) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            if !conn.is_connected() {
                return Ok(());
            }

            let Some(elapsed) = conn.activity().since_last_event() else {
                anyhow::bail!("connected without any recorded event");
            };
            if elapsed > conn.config().server_timeout() {
                error!(
                    elapsed_secs = elapsed.as_secs_f64(),
                    "Server timeout detected; closing"
                );
                debug!("Discard current buffers");
                conn.abort().await;
            }
            Ok(())
        })
    }
}

/// The send-ping and check-timeout jobs, in that order.
pub fn default_jobs(config: &HeartbeatConfig) -> Vec<Arc<dyn Job>> {
    vec![
        Arc::new(SendPing::new(config.ping_check())),
        Arc::new(CheckTimeout::new(config.timeout_check())),
    ]
}

// =============================================================================
// Schedule
// =============================================================================

/// The registered jobs of one connection and the switch that runs them.
pub struct Schedule {
    jobs: Vec<Arc<dyn Job>>,
    enabled: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Schedule {
    /// A stopped schedule holding `jobs`.
    pub fn new(jobs: Vec<Arc<dyn Job>>) -> Self {
        for job in &jobs {
            debug!(job = job.name(), interval = ?job.interval(), "Timeout job registered");
        }
        Self {
            jobs,
            enabled: Arc::new(AtomicBool::new(false)),
            token: CancellationToken::new(),
        }
    }

    /// Names of the registered jobs, in run order.
    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name()).collect()
    }

    /// Whether jobs are currently allowed to run.
    pub fn is_running(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Start running jobs against `conn` on `runtime`.
    ///
    /// A schedule runs at most once; starting a stopped schedule does nothing.
    pub(crate) fn start(&self, conn: Connection, runtime: &Handle) {
        if self.token.is_cancelled() || self.enabled.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Starting job scheduler for connection timeout");
        runtime.spawn(drive(
            conn,
            self.jobs.clone(),
            self.enabled.clone(),
            self.token.clone(),
        ));
    }

    /// Stop running jobs. Takes effect before the next job starts.
    pub fn stop(&self) {
        self.enabled.store(false, Ordering::Release);
        self.token.cancel();
    }
}

async fn drive(
    conn: Connection,
    jobs: Vec<Arc<dyn Job>>,
    enabled: Arc<AtomicBool>,
    token: CancellationToken,
) {
    let start = Instant::now();
    let mut next_runs: Vec<Instant> = jobs.iter().map(|job| start + job.interval()).collect();

    loop {
        let Some(due) = next_runs.iter().min().copied() else {
            return;
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep_until(due) => {}
        }

        let now = Instant::now();
        for (job, next_run) in jobs.iter().zip(next_runs.iter_mut()) {
            if *next_run > now {
                continue;
            }
            if !enabled.load(Ordering::Acquire) {
                return;
            }
            *next_run = now + job.interval();

            let reason = match AssertUnwindSafe(job.run(&conn)).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
            };

            error!(job = job.name(), reason = %reason, "Error with the timeout scheduler");
            conn.fail(&Error::Job {
                job: job.name(),
                reason,
            })
            .await;
            return;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_clock_starts_empty() {
        let clock = ActivityClock::new();
        assert!(clock.last_event().is_none());
        assert!(clock.last_ping().is_none());
        assert!(clock.since_last_activity().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_measures_elapsed_time() {
        let clock = ActivityClock::new();
        clock.touch_event();
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(clock.since_last_event(), Some(Duration::from_secs(30)));

        clock.touch_ping();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(clock.since_last_event(), Some(Duration::from_secs(35)));
        assert_eq!(clock.since_last_activity(), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_event_never_decreases() {
        let clock = ActivityClock::new();
        tokio::time::advance(Duration::from_secs(10)).await;
        clock.touch_event();
        let first = clock.last_event().unwrap();

        // a stale writer racing with a newer one must not win
        clock.last_event.fetch_max(1, Ordering::AcqRel);
        assert_eq!(clock.last_event().unwrap(), first);

        tokio::time::advance(Duration::from_secs(1)).await;
        clock.touch_event();
        assert!(clock.last_event().unwrap() > first);
    }

    #[test]
    fn test_default_jobs_order() {
        let schedule = Schedule::new(default_jobs(&HeartbeatConfig::default()));
        assert_eq!(schedule.job_names(), vec!["send_ping", "check_timeout"]);
        assert!(!schedule.is_running());

        let jobs = default_jobs(&HeartbeatConfig::default());
        assert_eq!(jobs[0].interval(), Duration::from_secs(5));
        assert_eq!(jobs[1].interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_stop_before_start_is_final() {
        let schedule = Schedule::new(Vec::new());
        schedule.stop();
        assert!(!schedule.is_running());
        assert!(schedule.token.is_cancelled());
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(42_u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }
}

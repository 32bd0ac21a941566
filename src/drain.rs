//! Graceful drain coordination.
//!
//! One [`Drain`] is shared by every engine and server of a process. It
//! counts in-flight requests and turns any number of shutdown triggers
//! (OS signal, admin HTTP call, direct call) into a single drain:
//!
//! 1. the phase flips to [`Phase::Draining`], which makes servers stop
//!    accepting new connections;
//! 2. a background task waits for the in-flight count to reach zero, bounded by
//!    the drain timeout (60 s unless configured otherwise);
//! 3. the phase becomes [`Phase::Stopped`] with the [`DrainOutcome`], and
//!    every waiter is released.
//!
//! In-flight requests are never cancelled. A request that is still running
//! when the timeout fires simply loses the race against process exit.

use std::sync::Arc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Config;

/// Default upper bound on how long a drain waits for in-flight requests.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle of the process as seen by the coordinator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Running,
    Draining,
    Stopped(DrainOutcome),
}

/// How a drain ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DrainOutcome {
    /// Every in-flight request finished.
    Drained,
    /// The timeout elapsed first.
    TimedOut,
}

/// Shared drain coordinator. Cloning is cheap and yields the same instance.
#[derive(Clone, Debug)]
pub struct Drain {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    in_flight: AtomicUsize,
    idle: Notify,
    phase: watch::Sender<Phase>,
    timeout: Duration,
    started: AtomicBool,
}

impl Drain {
    pub fn new(timeout: Duration) -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            inner: Arc::new(Inner {
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                phase,
                timeout,
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.drain_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Counts one request as in flight until the returned guard is dropped.
    ///
    /// The guard releases on every exit path, including a panic unwinding
    /// through the request task.
    #[must_use = "the request stops being counted as soon as the guard is dropped"]
    pub fn enter(&self) -> InFlight {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        InFlight { inner: Arc::clone(&self.inner) }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> Phase {
        *self.inner.phase.borrow()
    }

    /// `true` from the moment a drain is triggered, forever after.
    pub fn is_draining(&self) -> bool {
        self.phase() != Phase::Running
    }

    /// Starts the drain and waits for it to end.
    ///
    /// Idempotent: however many callers race here, the drain body runs once
    /// and every caller gets the same outcome. The body runs on its own task,
    /// so dropping a caller's future never stalls the drain.
    pub async fn trigger(&self) -> DrainOutcome {
        let won = self
            .inner
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            info!(in_flight = self.in_flight(), "graceful exiting");
            self.inner.phase.send_replace(Phase::Draining);
            tokio::spawn(self.clone().run());
        }
        self.finished().await
    }

    /// Resolves once a drain has been triggered, without triggering one.
    pub async fn triggered(&self) {
        let mut rx = self.inner.phase.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|phase| *phase != Phase::Running).await;
    }

    /// Resolves with the outcome once a triggered drain has ended.
    pub async fn finished(&self) -> DrainOutcome {
        let mut rx = self.inner.phase.subscribe();
        let outcome = rx
            .wait_for(|phase| matches!(phase, Phase::Stopped(_)))
            .await
            .ok()
            .and_then(|phase| match *phase {
                Phase::Stopped(outcome) => Some(outcome),
                _ => None,
            });
        outcome.unwrap_or(DrainOutcome::TimedOut)
    }

    async fn run(self) {
        let outcome = match tokio::time::timeout(self.inner.timeout, self.wait_idle()).await {
            Ok(()) => {
                info!("graceful exit OK");
                DrainOutcome::Drained
            }
            Err(_) => {
                warn!(
                    in_flight = self.in_flight(),
                    timeout = ?self.inner.timeout,
                    "graceful exit timeout"
                );
                DrainOutcome::TimedOut
            }
        };

        self.inner.phase.send_replace(Phase::Stopped(outcome));
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register before checking so a release between the check and
            // the await is not missed.
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_TIMEOUT)
    }
}

/// In-flight request marker returned by [`Drain::enter`].
#[derive(Debug)]
pub struct InFlight {
    inner: Arc<Inner>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

// ── OS signals ────────────────────────────────────────────────────────────────

/// OS signals that can trigger a drain.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
}

impl Signal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "SIGINT",
            Self::Terminate => "SIGTERM",
            Self::Hangup    => "SIGHUP",
            Self::Quit      => "SIGQUIT",
        }
    }
}

/// Installs handlers for `signals`, then resolves once the first of them
/// arrives and the drain it triggers has ended.
///
/// Handlers are installed when this is called, not when the future is first
/// polled. Signals that cannot be installed are logged and skipped. With
/// nothing installed the future never resolves.
pub fn drain_on_signals(
    drain: Drain,
    signals: &[Signal],
) -> impl Future<Output = DrainOutcome> + Send + 'static {
    let received = forward(signals.iter().map(|&signal| (signal, listen(signal))));
    drain_on(drain, received)
}

async fn drain_on(drain: Drain, mut received: mpsc::Receiver<Signal>) -> DrainOutcome {
    let Some(signal) = received.recv().await else {
        return std::future::pending().await;
    };
    info!(signal = signal.as_str(), "graceful exit action from signal");
    drain.trigger().await
}

/// Funnels every installed listener into one channel. The channel closes
/// only when nothing could be installed.
fn forward(listeners: impl IntoIterator<Item = (Signal, std::io::Result<Listener>)>) -> mpsc::Receiver<Signal> {
    let (tx, rx) = mpsc::channel(1);
    for (signal, listener) in listeners {
        match listener {
            Ok(mut stream) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    if stream.recv().await.is_some() {
                        let _ = tx.send(signal).await;
                    }
                });
            }
            Err(e) => error!(signal = signal.as_str(), "failed to install signal handler: {e}"),
        }
    }
    rx
}

#[cfg(unix)]
type Listener = tokio::signal::unix::Signal;

#[cfg(not(unix))]
type Listener = CtrlC;

#[cfg(unix)]
fn listen(signal: Signal) -> std::io::Result<Listener> {
    use tokio::signal::unix::{SignalKind, signal as unix_signal};

    let kind = match signal {
        Signal::Interrupt => SignalKind::interrupt(),
        Signal::Terminate => SignalKind::terminate(),
        Signal::Hangup    => SignalKind::hangup(),
        Signal::Quit      => SignalKind::quit(),
    };
    unix_signal(kind)
}

/// Only Ctrl-C exists outside Unix; every other signal resolves never.
#[cfg(not(unix))]
fn listen(signal: Signal) -> std::io::Result<Listener> {
    Ok(CtrlC { active: signal == Signal::Interrupt })
}

#[cfg(not(unix))]
struct CtrlC {
    active: bool,
}

#[cfg(not(unix))]
impl CtrlC {
    async fn recv(&mut self) -> Option<()> {
        if !self.active {
            return std::future::pending().await;
        }
        tokio::signal::ctrl_c().await.ok()
    }
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::layer::{self, Layer, SubscriberExt};

    use super::*;

    #[tokio::test]
    async fn guards_balance_the_counter() {
        let drain = Drain::default();
        let a = drain.enter();
        let b = drain.enter();
        assert_eq!(drain.in_flight(), 2);
        drop(a);
        assert_eq!(drain.in_flight(), 1);
        drop(b);
        assert_eq!(drain.in_flight(), 0);
    }

    #[tokio::test]
    async fn guard_releases_when_the_task_panics() {
        let drain = Drain::default();
        let guard = drain.enter();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("handler blew up");
        });
        assert!(task.await.is_err());
        assert_eq!(drain.in_flight(), 0);
    }

    #[tokio::test]
    async fn idle_drain_finishes_immediately() {
        let drain = Drain::default();
        assert_eq!(drain.phase(), Phase::Running);
        assert_eq!(drain.trigger().await, DrainOutcome::Drained);
        assert_eq!(drain.phase(), Phase::Stopped(DrainOutcome::Drained));
        assert!(drain.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_unblocks_when_last_request_leaves() {
        let drain = Drain::default();
        let guards: Vec<_> = (0..3).map(|_| drain.enter()).collect();

        let trigger = tokio::spawn({
            let drain = drain.clone();
            async move { drain.trigger().await }
        });
        drain.triggered().await;
        assert_eq!(drain.phase(), Phase::Draining);

        let started = tokio::time::Instant::now();
        for guard in guards {
            tokio::time::sleep(Duration::from_secs(1)).await;
            drop(guard);
        }

        assert_eq!(trigger.await.unwrap(), DrainOutcome::Drained);
        assert!(started.elapsed() < DEFAULT_DRAIN_TIMEOUT);
        assert_eq!(drain.finished().await, DrainOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_request_hits_the_timeout() {
        let drain = Drain::new(Duration::from_secs(5));
        let _stuck = drain.enter();

        let started = tokio::time::Instant::now();
        assert_eq!(drain.trigger().await, DrainOutcome::TimedOut);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
        assert_eq!(drain.in_flight(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_share_one_outcome() {
        let drain = Drain::default();
        let guard = drain.enter();

        let triggers: Vec<_> = (0..32)
            .map(|_| {
                let drain = drain.clone();
                tokio::spawn(async move { drain.trigger().await })
            })
            .collect();

        drain.triggered().await;
        drop(guard);
        for t in triggers {
            assert_eq!(t.await.unwrap(), DrainOutcome::Drained);
        }

        // Once over, the outcome is sticky: a late trigger does not drain
        // again even with new requests in flight.
        let _late = drain.enter();
        assert_eq!(drain.trigger().await, DrainOutcome::Drained);
    }

    /// Counts "graceful exiting" events, one per execution of the drain body.
    struct DrainStarts(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> Layer<S> for DrainStarts {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: layer::Context<'_, S>) {
            let meta = event.metadata();
            if meta.target() == "tsu::drain"
                && *meta.level() == tracing::Level::INFO
                && meta.fields().field("in_flight").is_some()
            {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_trigger_does_not_stall_the_drain() {
        let starts = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(DrainStarts(Arc::clone(&starts)));
        let _default = tracing::subscriber::set_default(subscriber);

        let drain = Drain::new(Duration::from_secs(30));
        let guard = drain.enter();

        let cancelled = tokio::time::timeout(Duration::from_secs(1), drain.trigger()).await;
        assert!(cancelled.is_err());
        assert_eq!(drain.phase(), Phase::Draining);

        drop(guard);
        let outcome = tokio::time::timeout(Duration::from_secs(5), drain.finished()).await;
        assert_eq!(outcome, Ok(DrainOutcome::Drained));

        assert_eq!(drain.trigger().await, DrainOutcome::Drained);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn drain_body_runs_once_for_many_triggers() {
        let starts = Arc::new(AtomicUsize::new(0));
        let subscriber = tracing_subscriber::registry().with(DrainStarts(Arc::clone(&starts)));
        let _default = tracing::subscriber::set_default(subscriber);

        let drain = Drain::default();
        let guard = drain.enter();
        let triggers: Vec<_> = (0..16)
            .map(|_| {
                let drain = drain.clone();
                tokio::spawn(async move { drain.trigger().await })
            })
            .collect();

        drain.triggered().await;
        drop(guard);
        for t in triggers {
            t.await.unwrap();
        }
        drain.trigger().await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hangup_signal_triggers_the_drain() {
        let drain = Drain::default();
        let waiter = tokio::spawn(drain_on_signals(drain.clone(), &[Signal::Hangup]));

        let status = std::process::Command::new("kill")
            .args(["-HUP", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let outcome = tokio::time::timeout(Duration::from_secs(5), drain.finished()).await;
        assert_eq!(outcome, Ok(DrainOutcome::Drained));
        assert_eq!(drain.phase(), Phase::Stopped(DrainOutcome::Drained));
        assert_eq!(waiter.await.unwrap(), DrainOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_that_cannot_be_installed_is_skipped() {
        let drain = Drain::default();
        let unsupported = std::io::Error::other("signal not supported");
        let received = forward([(Signal::Quit, Err(unsupported))]);

        let waited = tokio::time::timeout(Duration::from_secs(60), drain_on(drain.clone(), received)).await;
        assert!(waited.is_err());
        assert_eq!(drain.phase(), Phase::Running);
    }
}

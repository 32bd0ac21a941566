//! HTTP server and graceful shutdown.
//!
//! # Graceful shutdown
//!
//! The server does not decide when to stop; the shared [`Drain`] does. Any
//! trigger (a configured OS signal, the admin `gracefulexit` endpoint, a
//! direct [`Drain::trigger`] call) makes the server:
//!
//! 1. stop `listener.accept()` immediately, so no new connections are made;
//! 2. ask every open connection to close once its current response is done;
//! 3. wait until the drain ends (all in-flight requests finished, or the
//!    drain timeout elapsed);
//! 4. return from [`Server::serve`], which lets `main` exit cleanly.
//!
//! Requests that arrive on an already open connection while draining are
//! still routed normally.
//!
//! When running under Kubernetes, set `terminationGracePeriodSeconds` above
//! the drain timeout so SIGKILL never cuts a drain short.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::drain::{Drain, Signal, drain_on_signals};
use crate::engine::Engine;
use crate::error::Error;

/// Upper bound on waiting for connections to close after the drain ended.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

enum Bind {
    Addr(SocketAddr),
    Listener(TcpListener),
}

/// The HTTP server.
pub struct Server {
    bind: Bind,
    signals: Vec<Signal>,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called. Listens for SIGINT and SIGTERM by default.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use tsu::Server;
    /// let server = Server::bind("0.0.0.0:3000")?;
    /// # Ok::<(), tsu::Error>(())
    /// ```
    pub fn bind(addr: &str) -> Result<Self, Error> {
        let parsed: SocketAddr = addr.parse().map_err(|source| Error::InvalidAddr {
            addr: addr.to_owned(),
            source,
        })?;
        Ok(Self { bind: Bind::Addr(parsed), signals: Config::default().signals })
    }

    /// Serves on an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { bind: Bind::Listener(listener), signals: Config::default().signals }
    }

    /// Replaces the OS signals that trigger a drain. Empty disables signal
    /// handling, which suits a secondary server sharing the same drain.
    pub fn signals(mut self, signals: Vec<Signal>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_config(self, config: &Config) -> Self {
        self.signals(config.signals.clone())
    }

    /// Starts accepting connections and dispatching them through `engine`.
    ///
    /// Returns only after the engine's drain has been triggered and has
    /// finished.
    pub async fn serve(self, engine: Engine) -> Result<(), Error> {
        let listener = match self.bind {
            Bind::Addr(addr) => TcpListener::bind(addr).await?,
            Bind::Listener(listener) => listener,
        };
        let local = listener.local_addr()?;

        // Shared across concurrent connection tasks without copying the
        // routing table.
        let engine = Arc::new(engine);
        let drain = engine.drain().clone();

        if !self.signals.is_empty() {
            tokio::spawn(drain_on_signals(drain.clone(), &self.signals));
        }

        info!(addr = %local, "tsu listening");

        // JoinSet tracks every spawned connection task so we can wait for
        // them during shutdown.
        let mut tasks = tokio::task::JoinSet::new();

        let triggered = drain.triggered();
        tokio::pin!(triggered);

        loop {
            tokio::select! {
                // Check the drain first so a trigger immediately stops
                // accepting new connections, even if more are queued.
                biased;

                () = &mut triggered => {
                    info!(in_flight = drain.in_flight(), "drain triggered, no longer accepting connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    tasks.spawn(connection(Arc::clone(&engine), drain.clone(), stream, remote_addr));
                }

                // Reap finished connection tasks so the JoinSet does not grow
                // without bound on long-running servers.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }
        drop(listener);

        let outcome = drain.finished().await;

        let closed = tokio::time::timeout(CLOSE_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if closed.is_err() {
            warn!(open = tasks.len(), "connections still open after drain, dropping them");
        }

        info!(?outcome, "tsu stopped");
        Ok(())
    }
}

/// Serves one connection until the peer closes it or the drain asks it to.
async fn connection(
    engine: Arc<Engine>,
    drain: Drain,
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
) {
    // `service_fn` is called once per request on the connection.
    let svc = service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
        let engine = Arc::clone(&engine);
        req.extensions_mut().insert(remote_addr);
        async move { Ok::<_, std::convert::Infallible>(engine.handle(req).await) }
    });

    // `auto::Builder` handles both HTTP/1.1 and HTTP/2, whatever the client
    // negotiates.
    let builder = ConnBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), svc);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = drain.triggered() => {
            debug!(peer = %remote_addr, "closing connection after its current response");
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        error!(peer = %remote_addr, "connection error: {e}");
    }
}

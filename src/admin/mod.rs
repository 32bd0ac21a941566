//! Administrative control plane.
//!
//! A small [`Engine`] of its own, usually bound to a private port:
//!
//! | Method | Path | Effect |
//! |---|---|---|
//! | GET  | `/admin/show_log_level` | list every registered logger's levels |
//! | POST | `/admin/set_log_level`  | form `name`, `level`, optional `module` (default `*`) |
//! | GET  | `/admin/gracefulexit`   | acknowledge, then drain and exit the process |
//!
//! Every answer is HTTP 200 with a `{Status, Data, Description}` envelope;
//! client mistakes are reported as `Status: "Error"`.

mod levels;

pub use levels::{ALL_MODULES, LevelControl, LoggerInfo, TargetsControl, level_name, parse_level};

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::context::Context;
use crate::drain::{Drain, DrainOutcome};
use crate::engine::{Engine, HandlerInfo};
use crate::error::Error;
use crate::handler::BoxFuture;
use crate::server::Server;

type ExitHook = Arc<dyn Fn(DrainOutcome) + Send + Sync>;

/// What the admin handlers reach through `c.engine().state()`.
#[derive(Clone)]
struct AdminState {
    loggers: Arc<[LoggerInfo]>,
    drain: Drain,
    exit_grace: Duration,
    exit: ExitHook,
}

/// Builder for the admin engine and its server.
pub struct AdminServer {
    engine: Engine,
    state: AdminState,
}

impl AdminServer {
    /// Admin routes over `loggers`, sharing `drain` with the main server.
    pub fn new(config: &Config, drain: Drain, loggers: Vec<LoggerInfo>) -> Self {
        let mut engine = Engine::with_config(config).with_drain(drain.clone());
        engine
            .group("/admin")
            .get("/show_log_level", show_log_level)
            .post("/set_log_level", set_log_level)
            .get("/gracefulexit", graceful_exit);

        let state = AdminState {
            loggers: loggers.into(),
            drain,
            exit_grace: config.exit_grace(),
            exit: Arc::new(|outcome| {
                info!(?outcome, "bye");
                std::process::exit(0);
            }),
        };
        Self { engine, state }
    }

    /// Replaces what happens once a drain started by `gracefulexit` ends.
    /// The default exits the process with status 0.
    pub fn on_exit(mut self, hook: impl Fn(DrainOutcome) + Send + Sync + 'static) -> Self {
        self.state.exit = Arc::new(hook);
        self
    }

    /// Registers an extra route next to the admin ones.
    pub fn handler(mut self, info: HandlerInfo) -> Self {
        self.engine.register(info);
        self
    }

    pub fn into_engine(self) -> Engine {
        let Self { mut engine, state } = self;
        engine.insert_state(state);
        engine
    }

    /// Serves the admin engine on `addr` in the background.
    ///
    /// The admin server leaves OS signals to the main server; both stop when
    /// the shared drain ends.
    pub fn spawn(self, addr: &str) -> Result<JoinHandle<Result<(), Error>>, Error> {
        let server = Server::bind(addr)?.signals(Vec::new());
        Ok(tokio::spawn(server.serve(self.into_engine())))
    }
}

// ── Wire format ───────────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct Envelope<T: Serialize> {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    description: &'static str,
}

#[derive(Debug, Serialize)]
struct LoggerLevels {
    name: String,
    levels: Vec<ModuleLevel>,
}

#[derive(Debug, Serialize)]
struct ModuleLevel {
    module: String,
    level: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogLevelReq {
    name: String,
    module: String,
    level: String,
}

fn respond<T: Serialize>(c: &mut Context, status: &'static str, data: Option<T>, description: &'static str) {
    c.json(StatusCode::OK, &Envelope { status, data, description });
}

fn state(c: &mut Context) -> Option<AdminState> {
    let state = c.engine().state::<AdminState>().cloned();
    if state.is_none() {
        error!("admin route served by an engine without admin state");
        c.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
    }
    state
}

fn snapshot(loggers: &[LoggerInfo]) -> Vec<LoggerLevels> {
    loggers
        .iter()
        .map(|l| LoggerLevels {
            name: l.name.clone(),
            levels: l
                .control
                .levels()
                .into_iter()
                .map(|(module, level)| ModuleLevel { module, level: level_name(level) })
                .collect(),
        })
        .collect()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

fn show_log_level(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        let Some(state) = state(c) else { return };
        respond(c, "OK", Some(snapshot(&state.loggers)), "");
    })
}

fn set_log_level(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        let Some(state) = state(c) else { return };

        let req: LogLevelReq = match c.bind_form() {
            Ok(req) => req,
            Err(e) => {
                debug!("unreadable set_log_level form: {e}");
                LogLevelReq::default()
            }
        };
        if req.name.is_empty() || req.level.is_empty() {
            respond::<()>(c, "Error", None, "missing params");
            return;
        }
        let Some(level) = parse_level(&req.level) else {
            respond::<()>(c, "Error", None, "invalid level");
            return;
        };
        let module = if req.module.is_empty() { ALL_MODULES } else { req.module.as_str() };

        for logger in state.loggers.iter().filter(|l| l.name == req.name) {
            logger.control.set_level(level, module);
            info!(logger = %logger.name, module, level = level_name(level), "log level changed");
        }

        respond(c, "OK", Some(snapshot(&state.loggers)), "");
    })
}

fn graceful_exit(c: &mut Context) -> BoxFuture<'_> {
    Box::pin(async move {
        let Some(state) = state(c) else { return };

        let client = c.client_ip();
        info!(client = client.as_deref().unwrap_or("-"), "graceful exit action from http api");

        let AdminState { drain, exit, exit_grace, .. } = state;
        tokio::spawn(async move {
            let outcome = drain.trigger().await;
            exit(outcome);
        });

        respond::<()>(c, "OK", None, "graceful exiting");
        c.flush();
        // Keep the request open so the acknowledgement reaches the client
        // before the drain can finish.
        tokio::time::sleep(exit_grace).await;
    })
}

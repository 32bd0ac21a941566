//! Live, per-module log verbosity.
//!
//! The admin endpoints only see the [`LevelControl`] capability. The
//! provided backend, [`TargetsControl`], drives a `tracing-subscriber`
//! reload layer wrapping a [`Targets`] filter:
//!
//! ```rust,no_run
//! use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*};
//! use tsu::admin::{LoggerInfo, TargetsControl};
//!
//! let (filter, control) = TargetsControl::layer(LevelFilter::INFO);
//! tracing_subscriber::registry().with(filter).with(fmt::layer()).init();
//! let loggers = vec![LoggerInfo::new("app", control)];
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{Subscriber, warn};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::reload;

/// Module pattern standing for "every module": the default level.
pub const ALL_MODULES: &str = "*";

/// Read/write access to a live logging backend's levels.
pub trait LevelControl: Send + Sync {
    /// Current level per module, including [`ALL_MODULES`].
    fn levels(&self) -> BTreeMap<String, LevelFilter>;

    /// Sets the level of `module`, or the default level for [`ALL_MODULES`].
    fn set_level(&self, level: LevelFilter, module: &str);
}

/// A named logging backend registered with the admin server.
#[derive(Clone)]
pub struct LoggerInfo {
    pub name: String,
    pub control: Arc<dyn LevelControl>,
}

impl LoggerInfo {
    pub fn new(name: impl Into<String>, control: impl LevelControl + 'static) -> Self {
        Self { name: name.into(), control: Arc::new(control) }
    }
}

/// Upper-case name of a level, as shown by the admin API.
pub fn level_name(level: LevelFilter) -> &'static str {
    if level == LevelFilter::OFF {
        "OFF"
    } else if level == LevelFilter::ERROR {
        "ERROR"
    } else if level == LevelFilter::WARN {
        "WARN"
    } else if level == LevelFilter::INFO {
        "INFO"
    } else if level == LevelFilter::DEBUG {
        "DEBUG"
    } else {
        "TRACE"
    }
}

/// Parses a level name, ignoring case.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_uppercase().as_str() {
        "OFF" => Some(LevelFilter::OFF),
        "ERROR" => Some(LevelFilter::ERROR),
        "WARN" | "WARNING" => Some(LevelFilter::WARN),
        "INFO" => Some(LevelFilter::INFO),
        "DEBUG" => Some(LevelFilter::DEBUG),
        "TRACE" => Some(LevelFilter::TRACE),
        _ => None,
    }
}

type Apply = Box<dyn Fn(Targets) -> Result<(), reload::Error> + Send + Sync>;

/// [`LevelControl`] over a reloadable [`Targets`] filter.
///
/// Module names are `tracing` targets (`my_app::db`), `*` is the default.
pub struct TargetsControl {
    levels: Mutex<BTreeMap<String, LevelFilter>>,
    apply: Apply,
}

impl TargetsControl {
    /// Builds the reloadable filter layer and its control.
    pub fn layer<S>(default: LevelFilter) -> (reload::Layer<Targets, S>, Self)
    where
        S: Subscriber + 'static,
    {
        let (layer, handle) = reload::Layer::new(Targets::new().with_default(default));
        (layer, Self::from_handle(handle, default))
    }

    /// Wraps an existing reload handle whose filter currently has only a
    /// default level.
    pub fn from_handle<S>(handle: reload::Handle<Targets, S>, default: LevelFilter) -> Self
    where
        S: Subscriber + 'static,
    {
        Self {
            levels: Mutex::new(BTreeMap::from([(ALL_MODULES.to_owned(), default)])),
            apply: Box::new(move |targets| handle.reload(targets)),
        }
    }
}

impl LevelControl for TargetsControl {
    fn levels(&self) -> BTreeMap<String, LevelFilter> {
        self.levels.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_level(&self, level: LevelFilter, module: &str) {
        let mut levels = self.levels.lock().unwrap_or_else(PoisonError::into_inner);
        levels.insert(module.to_owned(), level);

        let default = levels.get(ALL_MODULES).copied().unwrap_or(LevelFilter::INFO);
        let targets = Targets::new().with_default(default).with_targets(
            levels
                .iter()
                .filter(|(m, _)| m.as_str() != ALL_MODULES)
                .map(|(m, l)| (m.clone(), *l)),
        );
        if let Err(e) = (self.apply)(targets) {
            warn!(module, "log level change not applied: {e}");
        }
    }
}

//! Runtime configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! drain_timeout_secs = 60
//! exit_grace_ms = 1000
//! signals = ["interrupt", "terminate"]
//! not_found_body = "404 page not found"
//! method_not_allowed_body = "405 method not allowed"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::drain::{DEFAULT_DRAIN_TIMEOUT, Signal};
use crate::error::Error;

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Upper bound on waiting for in-flight requests once a drain starts.
    pub drain_timeout_secs: u64,
    /// How long the admin exit handler holds its response open after flushing.
    pub exit_grace_ms: u64,
    /// OS signals that trigger a drain.
    pub signals: Vec<Signal>,
    /// Body sent when no route matched and no handler wrote anything.
    pub not_found_body: String,
    /// Body sent when only other methods matched and no handler wrote anything.
    pub method_not_allowed_body: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT.as_secs(),
            exit_grace_ms: 1000,
            signals: vec![Signal::Interrupt, Signal::Terminate],
            not_found_body: "404 page not found".to_owned(),
            method_not_allowed_body: "405 method not allowed".to_owned(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, Error> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }
}

//! Unified error type.

use std::net::AddrParseError;

/// The error type returned by tsu's fallible operations.
///
/// Application-level errors (404, missing admin parameters, etc.) are
/// expressed as HTTP responses, not as `Error`s. This type surfaces
/// infrastructure failures: reading configuration, binding a port or
/// accepting a connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid socket address `{addr}`: {source}")]
    InvalidAddr {
        addr: String,
        #[source]
        source: AddrParseError,
    },

    #[error("config: {0}")]
    Config(#[from] toml::de::Error),

    /// A streamed response body was cut off before its request finished,
    /// usually because the handler panicked after flushing.
    #[error("response aborted before completion")]
    ResponseAborted,
}

//! Built-in middleware.
//!
//! Middleware is an ordinary [`Handler`](crate::Handler) that calls
//! [`Context::next`] to wrap the rest of the chain. It is the right place
//! for cross-cutting concerns such as structured tracing or request ids.
//!
//! - [`trace`]: one log line per request with its final status and latency

use std::time::Instant;

use tracing::{Instrument, info, info_span};

use crate::context::Context;
use crate::handler::BoxFuture;

/// Logs every request once the rest of the chain has run.
///
/// The status is read after the chain, so fallback requests report the
/// preset 404/405 even when no handler wrote a body.
pub fn trace(c: &mut Context) -> BoxFuture<'_> {
    let span = info_span!(
        "request",
        method = %c.request().method(),
        path = c.request().path(),
    );
    Box::pin(
        async move {
            let started = Instant::now();
            c.next().await;
            let client = c.client_ip();
            info!(
                status = c.writer().status().as_u16(),
                bytes = c.writer().size().unwrap_or(0) as u64,
                latency_us = started.elapsed().as_micros() as u64,
                client = client.as_deref().unwrap_or("-"),
                aborted = c.is_aborted(),
                "served"
            );
        }
        .instrument(span),
    )
}

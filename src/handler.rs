//! Handler trait and handler chains.
//!
//! # How a chain runs
//!
//! A route resolves to a [`HandlersChain`]: the engine's global middleware
//! followed by the route's own handlers. Every step has the same shape,
//! whether it is a logger, an auth check or the final endpoint:
//!
//! ```text
//! fn step(c: &mut Context) -> BoxFuture<'_> {
//!     Box::pin(async move {
//!         // before the rest of the chain
//!         c.next().await;   // runs every remaining step, then returns here
//!         // after the rest of the chain
//!     })
//! }
//! ```
//!
//! `c.next()` is a plain nested call. There is no scheduler involved: the
//! remaining steps run to completion on the same task before control comes
//! back. A step that never calls `next` simply lets the executor move on to
//! the following step once it returns.
//!
//! The only runtime cost per step is **one Arc clone** + **one boxed future**.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::Context;

/// A heap-allocated future borrowing the request [`Context`] for `'a`.
///
/// `Send` lets tokio move the request task across worker threads.
pub type BoxFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// One step of a handler chain.
///
/// Implemented automatically for every function with the signature
///
/// ```text
/// fn name(c: &mut Context) -> BoxFuture<'_>
/// ```
///
/// Implement it by hand on a struct when a step needs its own state.
pub trait Handler: Send + Sync + 'static {
    fn call<'a>(&'a self, c: &'a mut Context) -> BoxFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, c: &'a mut Context) -> BoxFuture<'a> {
        (self)(c)
    }
}

/// A type-erased handler shared by every request that runs it.
pub type BoxedHandler = Arc<dyn Handler>;

/// The ordered steps resolved for one request.
///
/// Shared rather than copied: a context only holds a reference-counted view
/// of the chain the router stored at registration time.
pub type HandlersChain = Arc<[BoxedHandler]>;

/// Erases a handler so it can be stored in a chain.
pub fn boxed(handler: impl Handler) -> BoxedHandler {
    Arc::new(handler)
}

/// Pins a closure's signature so it can be used as a [`Handler`].
///
/// Closures do not infer higher-ranked lifetimes on their own; passing one
/// through this function gives the compiler the signature it needs.
///
/// ```rust
/// use tsu::{Context, handler_fn};
///
/// let hello = handler_fn(|c: &mut Context| Box::pin(async move {
///     c.string(http::StatusCode::OK, "hello");
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> F
where
    F: for<'a> Fn(&'a mut Context) -> BoxFuture<'a> + Send + Sync + 'static,
{
    f
}

/// Appends `extra` to `base`, producing a new chain.
///
/// # Panics
///
/// Panics if the combined chain would reach the abort sentinel. That can
/// only happen through a setup bug, never at request time.
pub(crate) fn combine(base: &[BoxedHandler], extra: &[BoxedHandler]) -> HandlersChain {
    let len = base.len() + extra.len();
    assert!(len < crate::context::ABORT_INDEX, "too many handlers: {len}");
    base.iter().chain(extra).cloned().collect()
}

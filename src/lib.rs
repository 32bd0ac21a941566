//! # tsu
//!
//! A small HTTP framework for Rust services behind a reverse proxy, built
//! around a middleware chain and a process-wide graceful drain.
//!
//! ## The model
//!
//! - **Handlers chain.** Every route resolves to an ordered list of
//!   [`Handler`]s: engine middleware, group middleware, then the endpoint.
//!   Each step receives the per-request [`Context`] and decides whether the
//!   rest runs: [`Context::next`] runs it now, [`Context::abort`] skips it,
//!   returning lets the chain continue.
//! - **Response writer.** Handlers write through the [`ResponseWriter`]. The
//!   status line goes out once; [`Context::flush`] sends what is buffered so
//!   far and streams the rest.
//! - **Fallbacks.** Unknown paths run the `no_route` chain with 404 preset,
//!   known paths with the wrong method run the `no_method` chain with 405
//!   preset. Untouched, the default text body is sent.
//! - **Drain.** One [`Drain`] counts in-flight requests for the whole
//!   process. A signal, the admin `gracefulexit` endpoint or a direct call
//!   triggers it; servers stop accepting and return once it ends.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::StatusCode;
//! use tsu::{BoxFuture, Context, Engine, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tsu::Error> {
//!     let mut app = Engine::traced();
//!     app.get("/users/{id}", get_user);
//!
//!     Server::bind("0.0.0.0:3000")?.serve(app).await
//! }
//!
//! fn get_user(c: &mut Context) -> BoxFuture<'_> {
//!     Box::pin(async move {
//!         let id = c.param("id").unwrap_or("unknown").to_owned();
//!         c.json(StatusCode::OK, &serde_json::json!({ "id": id }));
//!     })
//! }
//! ```

mod config;
mod context;
mod drain;
mod engine;
mod error;
mod handler;
mod request;
mod router;
mod server;
mod writer;

pub mod admin;
pub mod middleware;

pub use config::Config;
pub use context::{Context, Pool};
pub use drain::{DEFAULT_DRAIN_TIMEOUT, Drain, DrainOutcome, InFlight, Phase, Signal, drain_on_signals};
pub use engine::{Engine, Group, HandlerInfo};
pub use error::Error;
pub use handler::{BoxFuture, BoxedHandler, Handler, HandlersChain, boxed, handler_fn};
pub use request::Request;
pub use router::{Lookup, Router};
pub use server::Server;
pub use writer::{ContentType, HttpResponse, ResponseBody, ResponseWriter};

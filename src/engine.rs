//! The engine: routes, middleware, fallbacks and per-request dispatch.
//!
//! # Request lifecycle
//!
//! ```text
//! hyper request
//!   → drain.enter()                     in-flight +1, released on every exit path
//!   → router.lookup(method, path)
//!       Found     → middleware + route handlers
//!       NoRoute   → middleware + no-route handlers     (status preset to 404)
//!       NoMethod  → middleware + no-method handlers    (status preset to 405)
//!   → pool.acquire() → run chain on its own task → writer.finish() → pool.release()
//! ```
//!
//! The chain runs on a spawned task so that a handler can flush its response
//! and keep running afterwards, and so that a panicking handler cannot take
//! the connection down with it.
//!
//! Setup (`middleware`, `get`, `no_route`, ...) takes `&mut self` and must be
//! finished before the engine is handed to a [`Server`](crate::Server).

use std::fmt::Display;
use std::sync::Arc;

use bytes::Bytes;
use http::{Extensions, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Body;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::config::Config;
use crate::context::{Context, Pool};
use crate::drain::Drain;
use crate::handler::{BoxedHandler, Handler, HandlersChain, boxed, combine};
use crate::request::Request;
use crate::router::{Lookup, Router, join_paths};
use crate::writer::{ContentType, HttpResponse, ResponseBody};

/// A handler registration described as data.
///
/// `GET`, `POST`, `PUT` and `DELETE` are honoured; any other method is
/// registered as `GET`.
pub struct HandlerInfo {
    pub method: Method,
    pub path: String,
    pub handler: BoxedHandler,
}

impl HandlerInfo {
    pub fn new(method: Method, path: impl Into<String>, handler: impl Handler) -> Self {
        Self { method, path: path.into(), handler: boxed(handler) }
    }
}

/// Routing table, middleware, fallback chains and the context pool.
pub struct Engine {
    router: Router,
    middleware: Vec<BoxedHandler>,
    no_route: Vec<BoxedHandler>,
    no_method: Vec<BoxedHandler>,
    all_no_route: HandlersChain,
    all_no_method: HandlersChain,
    not_found_body: Bytes,
    method_not_allowed_body: Bytes,
    pool: Pool,
    drain: Drain,
    state: Extensions,
}

impl Engine {
    /// A blank engine: no middleware, default bodies, its own drain.
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    /// A blank engine using the configured fallback bodies and drain timeout.
    pub fn with_config(config: &Config) -> Self {
        Self {
            router: Router::new(),
            middleware: Vec::new(),
            no_route: Vec::new(),
            no_method: Vec::new(),
            all_no_route: Arc::new([]),
            all_no_method: Arc::new([]),
            not_found_body: Bytes::from(config.not_found_body.clone()),
            method_not_allowed_body: Bytes::from(config.method_not_allowed_body.clone()),
            pool: Pool::new(),
            drain: Drain::from_config(config),
            state: Extensions::new(),
        }
    }

    /// An engine with the request tracing middleware already attached.
    pub fn traced() -> Self {
        let mut engine = Self::new();
        engine.middleware(crate::middleware::trace);
        engine
    }

    /// Shares `drain` with this engine. Every request served is counted on it.
    pub fn with_drain(mut self, drain: Drain) -> Self {
        self.drain = drain;
        self
    }

    pub fn drain(&self) -> &Drain {
        &self.drain
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    /// Appends a global middleware.
    ///
    /// It applies to routes registered afterwards and to both fallback chains.
    pub fn middleware(&mut self, handler: impl Handler) -> &mut Self {
        self.middleware.push(boxed(handler));
        self.rebuild_fallbacks();
        self
    }

    /// Handlers run when no route matches. The response defaults to 404.
    pub fn no_route(&mut self, handlers: Vec<BoxedHandler>) -> &mut Self {
        self.no_route = handlers;
        self.rebuild_fallbacks();
        self
    }

    /// Handlers run when the path matches under other methods only.
    /// The response defaults to 405.
    pub fn no_method(&mut self, handlers: Vec<BoxedHandler>) -> &mut Self {
        self.no_method = handlers;
        self.rebuild_fallbacks();
        self
    }

    pub fn set_not_found_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.not_found_body = body.into();
        self
    }

    pub fn set_method_not_allowed_body(&mut self, body: impl Into<Bytes>) -> &mut Self {
        self.method_not_allowed_body = body.into();
        self
    }

    // Each fallback chain is rebuilt from its own list; they never share.
    fn rebuild_fallbacks(&mut self) {
        self.all_no_route = combine(&self.middleware, &self.no_route);
        self.all_no_method = combine(&self.middleware, &self.no_method);
    }

    /// Registers a route served by global middleware followed by `handlers`.
    ///
    /// # Panics
    ///
    /// Panics if the path is invalid or already registered for `method`.
    pub fn route(&mut self, method: Method, path: &str, handlers: Vec<BoxedHandler>) -> &mut Self {
        let chain = combine(&self.middleware, &handlers);
        self.router.add(method, path, chain);
        self
    }

    /// Registers a single-handler route.
    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.route(method, path, vec![boxed(handler)])
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::DELETE, path, handler)
    }

    /// Registers a handler described by a [`HandlerInfo`].
    pub fn register(&mut self, info: HandlerInfo) -> &mut Self {
        let known = [Method::GET, Method::POST, Method::PUT, Method::DELETE];
        let method = if known.contains(&info.method) { info.method } else { Method::GET };
        self.route(method, &info.path, vec![info.handler])
    }

    /// Starts a route group under `prefix`.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group { engine: self, prefix: join_paths("/", prefix), handlers: Vec::new() }
    }

    /// Stores engine-wide state, readable from handlers via
    /// `c.engine().state::<T>()`.
    pub fn insert_state<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.state.insert(value);
        self
    }

    pub fn state<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.state.get::<T>()
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    // ── Dispatch ──────────────────────────────────────────────────────────────

    /// Serves one request and returns its response head.
    ///
    /// The returned response may still be streaming when this resolves: a
    /// handler that flushed early keeps running until its chain returns.
    pub async fn handle<B>(self: &Arc<Self>, req: http::Request<B>) -> HttpResponse
    where
        B: Body + Send,
        B::Data: Send,
        B::Error: Display,
    {
        let guard = self.drain.enter();

        let (parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(method = %parts.method, path = parts.uri.path(), "failed to read request body: {e}");
                return bare(StatusCode::BAD_REQUEST);
            }
        };

        let (chain, params, fallback) = match self.router.lookup(&parts.method, parts.uri.path()) {
            Lookup::Found(chain, params) => (chain, params, None),
            Lookup::NoRoute => (Arc::clone(&self.all_no_route), Vec::new(), Some(Fallback::NotFound)),
            Lookup::NoMethod => (Arc::clone(&self.all_no_method), Vec::new(), Some(Fallback::MethodNotAllowed)),
        };
        let method = parts.method.clone();
        let path = parts.uri.path().to_owned();

        let (tx, rx) = oneshot::channel();
        let mut ctx = self.pool.acquire();
        ctx.prepare(Arc::clone(self), Request::new(parts, body, params), chain, tx);

        let engine = Arc::clone(self);
        let task = tokio::spawn(async move {
            let _guard = guard;
            match fallback {
                None => ctx.next().await,
                Some(kind) => engine.run_fallback(&mut ctx, kind).await,
            }
            ctx.finish();
            engine.pool.release(ctx);
        });

        match rx.await {
            Ok(response) => response,
            // The sender only disappears without a response if the task died.
            Err(_) => {
                if let Err(e) = task.await {
                    error!(%method, path = %path, "handler panicked: {e}");
                }
                bare(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Runs a fallback chain with its default status preset.
    ///
    /// The status is set before the chain runs so that middleware observes
    /// the final code even when no handler writes anything. Afterwards:
    /// untouched status → default body; changed status → headers only.
    async fn run_fallback(&self, c: &mut Context, kind: Fallback) {
        let (status, body) = match kind {
            Fallback::NotFound => (StatusCode::NOT_FOUND, &self.not_found_body),
            Fallback::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, &self.method_not_allowed_body),
        };

        c.status(status);
        c.next().await;

        if !c.writer().written() {
            if c.writer().status() == status {
                let writer = c.writer_mut();
                writer.default_content_type(ContentType::Text);
                writer.write(body);
            } else {
                c.writer_mut().write_header_now();
            }
        }
    }
}

impl Default for Engine {
    fn default() -> Self { Self::new() }
}

#[derive(Clone, Copy)]
enum Fallback {
    NotFound,
    MethodNotAllowed,
}

fn bare(status: StatusCode) -> HttpResponse {
    let mut response = http::Response::new(ResponseBody::empty());
    *response.status_mut() = status;
    response
}

// ── Groups ────────────────────────────────────────────────────────────────────

/// Routes sharing a path prefix and group middleware.
///
/// Group routes run: engine middleware, group middleware, route handlers.
pub struct Group<'e> {
    engine: &'e mut Engine,
    prefix: String,
    handlers: Vec<BoxedHandler>,
}

impl Group<'_> {
    pub fn middleware(&mut self, handler: impl Handler) -> &mut Self {
        self.handlers.push(boxed(handler));
        self
    }

    pub fn route(&mut self, method: Method, path: &str, handlers: Vec<BoxedHandler>) -> &mut Self {
        let path = join_paths(&self.prefix, path);
        let chain = combine(&self.handlers, &handlers);
        self.engine.route(method, &path, chain.to_vec());
        self
    }

    pub fn on(&mut self, method: Method, path: &str, handler: impl Handler) -> &mut Self {
        self.route(method, path, vec![boxed(handler)])
    }

    pub fn get(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::GET, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::POST, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::PUT, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl Handler) -> &mut Self {
        self.on(Method::DELETE, path, handler)
    }

    /// A nested group. Inherits this group's prefix and middleware.
    pub fn group(&mut self, prefix: &str) -> Group<'_> {
        Group {
            prefix: join_paths(&self.prefix, prefix),
            handlers: self.handlers.clone(),
            engine: &mut *self.engine,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use http_body_util::Empty;

    use super::*;
    use crate::handler::{BoxFuture, handler_fn};

    fn request(method: Method, path: &str) -> http::Request<Empty<Bytes>> {
        http::Request::builder().method(method).uri(path).body(Empty::new()).unwrap()
    }

    async fn send(engine: &Arc<Engine>, method: Method, path: &str) -> (StatusCode, http::HeaderMap, Bytes) {
        let response = engine.handle(request(method, path)).await;
        let (parts, body) = response.into_parts();
        (parts.status, parts.headers, body.collect().await.unwrap().to_bytes())
    }

    fn hello(c: &mut Context) -> BoxFuture<'_> {
        Box::pin(async move { c.string(StatusCode::OK, "hello") })
    }

    fn aborter(c: &mut Context) -> BoxFuture<'_> {
        Box::pin(async move { c.abort() })
    }

    fn teapot(c: &mut Context) -> BoxFuture<'_> {
        Box::pin(async move { c.status(StatusCode::IM_A_TEAPOT) })
    }

    fn panics(_c: &mut Context) -> BoxFuture<'_> {
        Box::pin(async move { panic!("boom") })
    }

    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<u16>>>);

    /// Middleware that records the final status after the rest of the chain.
    fn status_recorder(c: &mut Context) -> BoxFuture<'_> {
        Box::pin(async move {
            c.next().await;
            let status = c.writer().status().as_u16();
            if let Some(seen) = c.engine().state::<Seen>() {
                seen.0.lock().unwrap().push(status);
            }
        })
    }

    #[tokio::test]
    async fn matched_route_runs_its_chain() {
        let mut engine = Engine::new();
        engine.get("/hello", hello);
        let engine = Arc::new(engine);

        let (status, headers, body) = send(&engine, Method::GET, "/hello").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn path_params_reach_the_handler() {
        let mut engine = Engine::new();
        engine.get("/users/{id}", handler_fn(|c: &mut Context| Box::pin(async move {
            let id = c.param("id").unwrap_or_default().to_owned();
            c.string(StatusCode::OK, id);
        })));
        let engine = Arc::new(engine);

        let (_, _, body) = send(&engine, Method::GET, "/users/42").await;
        assert_eq!(body, "42");
    }

    #[tokio::test]
    async fn no_route_and_no_method_defaults() {
        let mut engine = Engine::new();
        engine.post("/only-post", hello);
        let engine = Arc::new(engine);

        let (status, headers, body) = send(&engine, Method::GET, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers["content-type"], "text/plain; charset=utf-8");
        assert_eq!(body, "404 page not found");

        let (status, _, body) = send(&engine, Method::GET, "/only-post").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "405 method not allowed");
    }

    #[tokio::test]
    async fn aborting_fallback_keeps_default_status_and_body() {
        let mut engine = Engine::new();
        engine.post("/only-post", hello);
        engine.no_route(vec![boxed(aborter), boxed(hello)]);
        engine.no_method(vec![boxed(aborter), boxed(hello)]);
        engine.set_not_found_body("gone fishing");
        let engine = Arc::new(engine);

        let (status, _, body) = send(&engine, Method::GET, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "gone fishing");

        let (status, _, body) = send(&engine, Method::GET, "/only-post").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "405 method not allowed");
    }

    #[tokio::test]
    async fn default_body_keeps_a_content_type_set_by_the_fallback() {
        let mut engine = Engine::new();
        engine.no_route(vec![boxed(handler_fn(|c: &mut Context| Box::pin(async move {
            c.header("content-type", "text/html; charset=utf-8");
        })))]);
        let engine = Arc::new(engine);

        let (status, headers, body) = send(&engine, Method::GET, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers["content-type"], "text/html; charset=utf-8");
        assert_eq!(body, "404 page not found");
    }

    #[tokio::test]
    async fn changed_fallback_status_sends_headers_only() {
        let mut engine = Engine::new();
        engine.no_route(vec![boxed(teapot)]);
        let engine = Arc::new(engine);

        let (status, headers, body) = send(&engine, Method::GET, "/missing").await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert!(headers.get("content-type").is_none());
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn fallback_chains_are_independent() {
        let mut engine = Engine::new();
        engine.post("/only-post", hello);
        engine.no_route(vec![boxed(teapot)]);
        engine.no_method(vec![boxed(hello)]);
        let engine = Arc::new(engine);

        let (status, _, _) = send(&engine, Method::GET, "/missing").await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);

        let (status, _, body) = send(&engine, Method::GET, "/only-post").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "hello");
    }

    #[tokio::test]
    async fn middleware_observes_preset_fallback_status() {
        let seen = Seen::default();
        let mut engine = Engine::new();
        engine.insert_state(seen.clone());
        engine.middleware(status_recorder);
        engine.get("/hello", hello);
        let engine = Arc::new(engine);

        send(&engine, Method::GET, "/hello").await;
        send(&engine, Method::GET, "/missing").await;
        send(&engine, Method::POST, "/hello").await;

        assert_eq!(*seen.0.lock().unwrap(), [200, 404, 405]);
    }

    #[tokio::test]
    async fn groups_prefix_paths_and_stack_middleware() {
        let seen = Seen::default();
        let mut engine = Engine::new();
        engine.insert_state(seen.clone());
        {
            let mut admin = engine.group("/admin");
            admin.middleware(status_recorder);
            admin.get("/ping", hello);
            admin.group("/v2").get("/ping", teapot);
        }
        let engine = Arc::new(engine);

        let (status, _, body) = send(&engine, Method::GET, "/admin/ping").await;
        assert_eq!((status, body.as_ref()), (StatusCode::OK, &b"hello"[..]));
        let (status, _, _) = send(&engine, Method::GET, "/admin/v2/ping").await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        let (status, _, _) = send(&engine, Method::GET, "/ping").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert_eq!(*seen.0.lock().unwrap(), [200, 418]);
    }

    #[tokio::test]
    async fn register_maps_unknown_methods_to_get() {
        let mut engine = Engine::new();
        engine.register(HandlerInfo::new(Method::PATCH, "/patched", hello));
        engine.register(HandlerInfo::new(Method::DELETE, "/deleted", hello));
        let engine = Arc::new(engine);

        assert_eq!(send(&engine, Method::GET, "/patched").await.0, StatusCode::OK);
        assert_eq!(send(&engine, Method::DELETE, "/deleted").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn panicking_handler_yields_500_and_releases_the_request() {
        let mut engine = Engine::new();
        engine.get("/boom", panics);
        let engine = Arc::new(engine);

        let (status, _, _) = send(&engine, Method::GET, "/boom").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(engine.drain().in_flight(), 0);
    }

    #[tokio::test]
    async fn panic_after_flush_cuts_the_streamed_body() {
        let mut engine = Engine::new();
        engine.get("/half", handler_fn(|c: &mut Context| Box::pin(async move {
            c.string(StatusCode::OK, "half");
            c.flush();
            tokio::task::yield_now().await;
            panic!("after flush");
        })));
        let engine = Arc::new(engine);

        let response = engine.handle(request(Method::GET, "/half")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
        assert_eq!(engine.drain().in_flight(), 0);
    }

    #[tokio::test]
    async fn contexts_are_reused_across_requests() {
        let mut engine = Engine::new();
        engine.get("/hello", hello);
        let engine = Arc::new(engine);

        send(&engine, Method::GET, "/hello").await;
        // Release happens on the request task right after the response.
        tokio::task::yield_now().await;
        for _ in 0..10 {
            send(&engine, Method::GET, "/hello").await;
        }
        assert!(engine.pool().idle() <= 1);
        assert_eq!(engine.drain().in_flight(), 0);
    }
}

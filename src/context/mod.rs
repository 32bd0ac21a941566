//! Per-request execution context.
//!
//! A [`Context`] carries everything one request needs while its handler
//! chain runs: the request, the resolved chain with a cursor into it, the
//! response writer and a small typed key/value store. Contexts are pooled by
//! the [`Engine`] and reused across unrelated requests, so none of that state
//! is allowed to survive a trip through the [`Pool`].
//!
//! # Chain control
//!
//! - [`Context::next`] runs every remaining step before returning, which is
//!   what lets a middleware wrap the rest of the chain.
//! - [`Context::abort`] moves the cursor past the end of the chain. Steps
//!   after the current one never start; steps that are already waiting on
//!   their own `next()` still finish their post-processing.

mod pool;

pub use pool::Pool;

use std::sync::Arc;

use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{Extensions, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::engine::Engine;
use crate::handler::{BoxFuture, HandlersChain};
use crate::request::Request;
use crate::writer::{ContentType, HttpResponse, ResponseWriter};

/// Cursor value meaning "the chain was aborted".
///
/// Far beyond any real chain length, so `index < len` is false for good.
pub(crate) const ABORT_INDEX: usize = usize::MAX / 2;

/// Request state threaded through a handler chain.
pub struct Context {
    engine: Option<Arc<Engine>>,
    request: Request,
    handlers: HandlersChain,
    index: usize,
    writer: ResponseWriter,
    keys: Extensions,
}

impl Default for Context {
    fn default() -> Self {
        Self {
            engine: None,
            request: Request::default(),
            handlers: Arc::new([]),
            index: 0,
            writer: ResponseWriter::default(),
            keys: Extensions::new(),
        }
    }
}

impl Context {
    /// Returns the context to its pristine, unbound state.
    pub(crate) fn reset(&mut self) {
        self.engine = None;
        self.request.clear();
        self.handlers = Arc::new([]);
        self.index = 0;
        self.writer.reset(None);
        self.keys.clear();
    }

    /// Binds a freshly acquired context to one request.
    pub(crate) fn prepare(
        &mut self,
        engine: Arc<Engine>,
        request: Request,
        handlers: HandlersChain,
        response: tokio::sync::oneshot::Sender<HttpResponse>,
    ) {
        self.engine = Some(engine);
        self.request = request;
        self.handlers = handlers;
        self.index = 0;
        self.writer.reset(Some(response));
    }

    // ── Chain control ─────────────────────────────────────────────────────────

    /// Runs the remaining handlers of the chain, then returns.
    ///
    /// Call it from a middleware to execute the rest of the chain and regain
    /// control afterwards. An empty or already finished chain is a no-op.
    pub fn next(&mut self) -> BoxFuture<'_> {
        Box::pin(async move {
            let handlers = Arc::clone(&self.handlers);
            while self.index < handlers.len() {
                let handler = &handlers[self.index];
                self.index += 1;
                handler.call(self).await;
            }
        })
    }

    /// Prevents every later handler from starting.
    ///
    /// Does not stop the current handler, and does not unwind handlers that
    /// are waiting on their own `next()`.
    pub fn abort(&mut self) {
        self.index = ABORT_INDEX;
    }

    pub fn is_aborted(&self) -> bool {
        self.index >= ABORT_INDEX
    }

    /// Sets the status, writes the headers and aborts the chain.
    pub fn abort_with_status(&mut self, status: StatusCode) {
        self.writer.write_header(status);
        self.writer.write_header_now();
        self.abort();
    }

    /// Number of handlers in the resolved chain.
    pub fn chain_len(&self) -> usize {
        self.handlers.len()
    }

    // ── Request ───────────────────────────────────────────────────────────────

    /// The engine serving this request.
    ///
    /// # Panics
    ///
    /// Panics when called on a context that is not bound to a request, which
    /// cannot happen from inside a handler.
    pub fn engine(&self) -> &Arc<Engine> {
        self.engine.as_ref().expect("context is not bound to a request")
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.request.param(key)
    }

    /// First value of `key` in the query string.
    pub fn query(&self, key: &str) -> Option<String> {
        first(self.request.query_pairs(), key)
    }

    /// First value of `key` in an urlencoded request body.
    pub fn post_form(&self, key: &str) -> Option<String> {
        first(self.request.form_pairs(), key)
    }

    /// Deserialises the urlencoded body and the query string into `T`.
    ///
    /// Body fields win over query fields of the same name.
    pub fn bind_form<T: DeserializeOwned>(&self) -> Result<T, serde_urlencoded::de::Error> {
        let mut pairs = self.request.form_pairs();
        for (k, v) in self.request.query_pairs() {
            if !pairs.iter().any(|(seen, _)| *seen == k) {
                pairs.push((k, v));
            }
        }
        let encoded = serde_urlencoded::to_string(&pairs)
            .map_err(<serde_urlencoded::de::Error as serde::de::Error>::custom)?;
        serde_urlencoded::from_str(&encoded)
    }

    /// Best guess at the client address: `X-Real-IP`, then the first
    /// `X-Forwarded-For` hop, then the peer address.
    pub fn client_ip(&self) -> Option<String> {
        if let Some(ip) = self.request.header("x-real-ip").map(str::trim).filter(|s| !s.is_empty()) {
            return Some(ip.to_owned());
        }
        let forwarded = self
            .request
            .header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_owned());
        }
        self.request.remote_addr().map(|addr| addr.ip().to_string())
    }

    // ── Per-request keys ──────────────────────────────────────────────────────

    /// Stores a value for later handlers of the same request.
    pub fn set<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.keys.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.keys.get::<T>()
    }

    // ── Response ──────────────────────────────────────────────────────────────

    pub fn writer(&self) -> &ResponseWriter {
        &self.writer
    }

    pub fn writer_mut(&mut self) -> &mut ResponseWriter {
        &mut self.writer
    }

    /// Sets the response status without writing anything.
    pub fn status(&mut self, status: StatusCode) {
        self.writer.write_header(status);
    }

    /// Sets a response header. Invalid names or values are logged and skipped.
    pub fn header(&mut self, name: &str, value: &str) {
        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => self.writer.set_header(name, value),
            _ => error!(header = name, "invalid response header"),
        }
    }

    /// Writes `body` with `content_type`, keeping the current status.
    pub fn render(&mut self, content_type: ContentType, body: &[u8]) {
        self.writer
            .set_header(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        self.writer.write(body);
    }

    /// Writes `body` with the given status and content type.
    pub fn data(&mut self, status: StatusCode, content_type: ContentType, body: &[u8]) {
        self.writer.write_header(status);
        self.render(content_type, body);
    }

    /// Writes a plain-text body.
    pub fn string(&mut self, status: StatusCode, body: impl Into<String>) {
        self.data(status, ContentType::Text, body.into().as_bytes());
    }

    /// Serialises `value` as the JSON body.
    ///
    /// A value that cannot be serialised turns into a bare `500`.
    pub fn json<T: Serialize + ?Sized>(&mut self, status: StatusCode, value: &T) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.data(status, ContentType::Json, &bytes),
            Err(e) => {
                error!("json encoding failed: {e}");
                self.abort_with_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    /// Sends everything written so far to the client right away.
    pub fn flush(&mut self) {
        self.writer.flush();
    }

    pub(crate) fn finish(&mut self) {
        self.writer.finish();
    }
}

fn first(pairs: Vec<(String, String)>, key: &str) -> Option<String> {
    pairs.into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use http_body_util::BodyExt;
    use tokio::sync::oneshot;

    use super::*;
    use crate::handler::{Handler, boxed};

    /// A step that records its position and optionally aborts or wraps.
    struct Step {
        id: usize,
        log: Arc<Mutex<Vec<String>>>,
        abort: bool,
        wrap: bool,
    }

    impl Handler for Step {
        fn call<'a>(&'a self, c: &'a mut Context) -> BoxFuture<'a> {
            Box::pin(async move {
                self.log.lock().unwrap().push(format!("enter {}", self.id));
                if self.abort {
                    c.abort();
                }
                if self.wrap {
                    c.next().await;
                    self.log.lock().unwrap().push(format!("leave {}", self.id));
                }
            })
        }
    }

    fn chain(log: &Arc<Mutex<Vec<String>>>, steps: &[(bool, bool)]) -> HandlersChain {
        steps
            .iter()
            .enumerate()
            .map(|(id, &(abort, wrap))| boxed(Step { id, log: Arc::clone(log), abort, wrap }))
            .collect()
    }

    fn bound(handlers: HandlersChain) -> (Context, oneshot::Receiver<HttpResponse>) {
        let (tx, rx) = oneshot::channel();
        let mut c = Context::default();
        c.prepare(Arc::new(Engine::new()), Request::default(), handlers, tx);
        (c, rx)
    }

    fn entries(log: &Arc<Mutex<Vec<String>>>) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn runs_every_step_in_order() {
        let log = Arc::default();
        let (mut c, _rx) = bound(chain(&log, &[(false, false); 3]));
        c.next().await;
        assert_eq!(entries(&log), ["enter 0", "enter 1", "enter 2"]);
    }

    #[tokio::test]
    async fn wrapping_step_resumes_after_the_rest() {
        let log = Arc::default();
        let (mut c, _rx) = bound(chain(&log, &[(false, true), (false, true), (false, false)]));
        c.next().await;
        assert_eq!(
            entries(&log),
            ["enter 0", "enter 1", "enter 2", "leave 1", "leave 0"]
        );
    }

    #[tokio::test]
    async fn abort_stops_later_steps_at_any_position() {
        for len in 1..6 {
            for at in 0..len {
                let log = Arc::default();
                let steps: Vec<_> = (0..len).map(|i| (i == at, false)).collect();
                let (mut c, _rx) = bound(chain(&log, &steps));
                c.next().await;

                let expected: Vec<String> = (0..=at).map(|i| format!("enter {i}")).collect();
                assert_eq!(entries(&log), expected, "len {len}, abort at {at}");
                assert!(c.is_aborted());
            }
        }
    }

    #[tokio::test]
    async fn abort_does_not_unwind_wrapping_steps() {
        let log = Arc::default();
        let (mut c, _rx) = bound(chain(&log, &[(false, true), (true, false), (false, false)]));
        c.next().await;
        assert_eq!(entries(&log), ["enter 0", "enter 1", "leave 0"]);
    }

    #[tokio::test]
    async fn empty_chain_is_a_no_op() {
        let (mut c, _rx) = bound(Arc::new([]));
        c.next().await;
        assert!(!c.is_aborted());
        assert!(!c.writer().written());
    }

    #[tokio::test]
    async fn json_helper_writes_body_and_type() {
        let (mut c, rx) = bound(Arc::new([]));
        c.json(StatusCode::OK, &serde_json::json!({ "ok": true }));
        c.finish();

        let response = rx.await.unwrap();
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");
        let body: Bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, r#"{"ok":true}"#);
    }

    #[test]
    fn client_ip_prefers_proxy_headers() {
        let (parts, ()) = http::Request::builder()
            .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
            .body(())
            .unwrap()
            .into_parts();
        let mut c = Context::default();
        c.request = Request::new(parts, Bytes::new(), Vec::new());
        assert_eq!(c.client_ip().as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn keys_are_typed() {
        #[derive(Clone, Debug, PartialEq)]
        struct UserId(u64);

        let mut c = Context::default();
        c.set(UserId(7));
        assert_eq!(c.get::<UserId>(), Some(&UserId(7)));
        c.reset();
        assert_eq!(c.get::<UserId>(), None);
    }
}

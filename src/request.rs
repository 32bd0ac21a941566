//! Incoming HTTP request view.
//!
//! The body is collected before the chain runs, so every handler sees the
//! same bytes no matter how many of them read it.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, Uri};

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// An incoming HTTP request, owned by a pooled [`Context`](crate::Context).
#[derive(Debug, Default)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) remote_addr: Option<SocketAddr>,
}

impl Request {
    pub(crate) fn new(
        parts: http::request::Parts,
        body: Bytes,
        params: Vec<(String, String)>,
    ) -> Self {
        let remote_addr = parts.extensions.get::<SocketAddr>().copied();
        Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            params,
            remote_addr,
        }
    }

    /// Drops everything a previous request left behind.
    pub(crate) fn clear(&mut self) {
        self.method = Method::GET;
        self.uri = Uri::default();
        self.headers.clear();
        self.body = Bytes::new();
        self.params.clear();
        self.remote_addr = None;
    }

    pub fn method(&self) -> &Method { &self.method }
    pub fn path(&self) -> &str { self.uri.path() }
    pub fn uri(&self) -> &Uri { &self.uri }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }

    /// Header lookup. Values that are not visible ASCII are treated as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// Decoded query-string pairs, in order of appearance.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        self.uri
            .query()
            .and_then(|q| serde_urlencoded::from_str(q).ok())
            .unwrap_or_default()
    }

    /// Decoded `application/x-www-form-urlencoded` body pairs.
    ///
    /// Empty for any other content type.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        let is_form = self
            .header(CONTENT_TYPE.as_str())
            .is_some_and(|ct| ct.starts_with(FORM_URLENCODED));
        if !is_form {
            return Vec::new();
        }
        serde_urlencoded::from_bytes(&self.body).unwrap_or_default()
    }
}

//! Per-request response writer.
//!
//! Handlers never build an `http::Response` themselves. They write into the
//! [`ResponseWriter`] held by their [`Context`](crate::Context), which tracks
//! two pieces of state the fallback dispatcher and middleware depend on:
//!
//! - the **status** that will be sent, which stays mutable until the headers
//!   are written;
//! - whether anything has been **written** at all (headers committed, with
//!   or without a body).
//!
//! Until [`ResponseWriter::flush`] is called the whole response is buffered
//! and sent with an exact `content-length` when the chain returns. After a
//! flush the head goes out immediately and every later write is streamed. A
//! streamed body that is dropped without being finished (the request task
//! died) ends in an error, so the client sees a reset instead of a short
//! body that looks complete.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::error::Error;

/// The response handed back to hyper.
pub type HttpResponse = http::Response<ResponseBody>;

// ── ContentType ───────────────────────────────────────────────────────────────

/// Content-type values used by the [`Context`](crate::Context) helpers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentType {
    Html,        // text/html; charset=utf-8
    Json,        // application/json
    OctetStream, // application/octet-stream
    Text,        // text/plain; charset=utf-8
}

impl ContentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html        => "text/html; charset=utf-8",
            Self::Json        => "application/json",
            Self::OctetStream => "application/octet-stream",
            Self::Text        => "text/plain; charset=utf-8",
        }
    }
}

// ── ResponseWriter ────────────────────────────────────────────────────────────

/// Where the response goes once the request is done with it.
///
/// `Idle` only exists inside the pool: a writer is bound to a request's
/// response channel when its context is handed out.
#[derive(Debug, Default)]
enum Sink {
    #[default]
    Idle,
    /// Nothing sent yet. The head (and possibly the full body) goes here.
    Pending(oneshot::Sender<HttpResponse>),
    /// Head already sent; body bytes are streamed.
    Streaming(mpsc::UnboundedSender<Chunk>),
    /// Response finalised.
    Closed,
}

/// Buffered, flushable response state for one request.
#[derive(Debug)]
pub struct ResponseWriter {
    status: StatusCode,
    headers: HeaderMap,
    buf: BytesMut,
    // `None` until the headers are written, then the number of body bytes.
    size: Option<usize>,
    sink: Sink,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            buf: BytesMut::new(),
            size: None,
            sink: Sink::Idle,
        }
    }
}

impl ResponseWriter {
    /// Clears every trace of the previous request and binds the writer to a
    /// new response channel.
    pub(crate) fn reset(&mut self, target: Option<oneshot::Sender<HttpResponse>>) {
        self.status = StatusCode::OK;
        self.headers.clear();
        self.buf.clear();
        self.size = None;
        self.sink = match target {
            Some(tx) => Sink::Pending(tx),
            None => Sink::Idle,
        };
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Number of body bytes written so far, `None` if nothing was written.
    pub fn size(&self) -> Option<usize> {
        self.size
    }

    /// Whether the headers have been written (with or without a body).
    pub fn written(&self) -> bool {
        self.size.is_some()
    }

    /// Whether the head has already been sent to the client.
    pub fn flushed(&self) -> bool {
        matches!(self.sink, Sink::Streaming(_) | Sink::Closed)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Sets a response header. Ignored once the head has been flushed.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        if self.flushed() {
            warn!(header = %name, "headers were already written, header ignored");
            return;
        }
        self.headers.insert(name, value);
    }

    /// Sets the status to send. Has no effect once the headers were written.
    pub fn write_header(&mut self, status: StatusCode) {
        if self.written() {
            if status != self.status {
                warn!(
                    current = self.status.as_u16(),
                    ignored = status.as_u16(),
                    "headers were already written"
                );
            }
            return;
        }
        self.status = status;
    }

    /// Marks the headers as written without writing a body.
    pub fn write_header_now(&mut self) {
        if self.size.is_none() {
            self.size = Some(0);
        }
    }

    /// Appends body bytes, writing the headers first if needed.
    pub fn write(&mut self, data: &[u8]) {
        self.write_header_now();
        self.size = self.size.map(|n| n + data.len());
        match &self.sink {
            Sink::Streaming(tx) => {
                // A closed receiver means the client went away; nothing to do.
                let _ = tx.send(Chunk::Data(Bytes::copy_from_slice(data)));
            }
            _ => self.buf.extend_from_slice(data),
        }
    }

    /// Sets the content type unless the handler already chose one.
    pub(crate) fn default_content_type(&mut self, content_type: ContentType) {
        if !self.headers.contains_key(CONTENT_TYPE) && !self.flushed() {
            self.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        }
    }

    /// Sends the head and everything buffered so far to the client.
    ///
    /// Further writes are streamed. The response is completed when the
    /// request's chain returns.
    pub fn flush(&mut self) {
        self.write_header_now();
        let head_tx = match std::mem::take(&mut self.sink) {
            Sink::Pending(tx) => tx,
            other => {
                self.sink = other;
                return;
            }
        };

        let (body_tx, body_rx) = mpsc::unbounded_channel();
        if !self.buf.is_empty() {
            let _ = body_tx.send(Chunk::Data(self.buf.split().freeze()));
        }
        let _ = head_tx.send(self.head(ResponseBody::stream(body_rx)));
        self.sink = Sink::Streaming(body_tx);
    }

    /// Completes the response.
    pub(crate) fn finish(&mut self) {
        match std::mem::replace(&mut self.sink, Sink::Closed) {
            Sink::Pending(head_tx) => {
                let body = self.buf.split().freeze();
                let _ = head_tx.send(self.head(ResponseBody::full(body)));
            }
            Sink::Streaming(body_tx) => {
                let _ = body_tx.send(Chunk::End);
            }
            Sink::Closed | Sink::Idle => {}
        }
    }

    fn head(&self, body: ResponseBody) -> HttpResponse {
        let mut response = http::Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        response
    }
}

// ── ResponseBody ──────────────────────────────────────────────────────────────

/// One message on a streamed body. `End` is only sent by `finish`.
#[derive(Debug)]
enum Chunk {
    Data(Bytes),
    End,
}

/// Body type returned to hyper: either one buffered chunk or a live stream.
#[derive(Debug)]
pub struct ResponseBody {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Full(Option<Bytes>),
    Stream(mpsc::UnboundedReceiver<Chunk>),
}

impl ResponseBody {
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let chunk = if bytes.is_empty() { None } else { Some(bytes) };
        Self { kind: Kind::Full(chunk) }
    }

    pub fn empty() -> Self {
        Self { kind: Kind::Full(None) }
    }

    fn stream(rx: mpsc::UnboundedReceiver<Chunk>) -> Self {
        Self { kind: Kind::Stream(rx) }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let next = match &mut self.kind {
            Kind::Full(chunk) => return Poll::Ready(chunk.take().map(|b| Ok(Frame::data(b)))),
            Kind::Stream(rx) => match rx.poll_recv(cx) {
                Poll::Ready(next) => next,
                Poll::Pending => return Poll::Pending,
            },
        };
        match next {
            Some(Chunk::Data(b)) => Poll::Ready(Some(Ok(Frame::data(b)))),
            Some(Chunk::End) => {
                self.kind = Kind::Full(None);
                Poll::Ready(None)
            }
            None => {
                self.kind = Kind::Full(None);
                Poll::Ready(Some(Err(Error::ResponseAborted)))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        matches!(self.kind, Kind::Full(None))
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Full(Some(b)) => SizeHint::with_exact(b.len() as u64),
            Kind::Full(None) => SizeHint::with_exact(0),
            Kind::Stream(_) => SizeHint::default(),
        }
    }
}

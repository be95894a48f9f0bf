//! The outbound response sink and its optional capabilities.
//!
//! A [`ResponseSink`] is the write-once channel a response goes out on: a
//! status line, headers that can change until the first write, and a byte
//! stream. Some sinks can do more: flush buffered bytes, hand over the raw
//! connection, or report that the client went away. Those extras are
//! separate traits, discovered through the `as_*` methods on the base trait:
//!
//! ```text
//! ResponseSink ── as_flush()        → Option<&mut dyn Flush>
//!              ├─ as_hijack()       → Option<&mut dyn Hijack>
//!              └─ as_close_notify() → Option<&mut dyn CloseNotify>
//! ```
//!
//! A sink that has a capability overrides the matching method to return
//! `Some(self)`. Wrappers (see [`ResponseWriter`](crate::ResponseWriter))
//! forward the lookups, so nesting never hides what the real sink can do.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body_util::Full;

/// Base interface every response sink implements.
pub trait ResponseSink {
    /// Live header map. Changes after the status is written are not sent.
    fn headers(&self) -> &HeaderMap;
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sends the status line and the current headers. Later calls are ignored.
    fn write_status(&mut self, status: StatusCode);

    /// Appends body bytes, sending `200 OK` first if no status was written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn as_flush(&mut self) -> Option<&mut dyn Flush> { None }
    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> { None }
    fn as_close_notify(&mut self) -> Option<&mut dyn CloseNotify> { None }
}

/// Sinks that buffer and can push pending bytes to the client on demand.
pub trait Flush {
    fn flush(&mut self) -> io::Result<()>;
}

/// A raw, bidirectional connection taken over from the HTTP layer.
pub trait Connection: io::Read + io::Write + Send {}

impl<T: io::Read + io::Write + Send> Connection for T {}

/// Sinks that can hand the underlying connection to the caller.
///
/// After a successful hijack the HTTP layer no longer owns the connection;
/// nothing written to the sink afterwards reaches the client.
pub trait Hijack {
    fn hijack(&mut self) -> io::Result<Box<dyn Connection>>;
}

/// Sinks that can report the client disconnecting mid-request.
pub trait CloseNotify {
    fn close_notify(&mut self) -> CloseSignal;
}

/// Shared flag raised once the client connection is gone.
#[derive(Clone, Debug, Default)]
pub struct CloseSignal(Arc<AtomicBool>);

impl CloseSignal {
    pub fn new() -> Self { Self::default() }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

/// In-memory sink that records everything written to it.
///
/// The transport layer runs chains against a `Recorder` and converts it into
/// an `http::Response` afterwards; tests use it to inspect what a chain
/// produced. Supports [`Flush`] (counted) and [`CloseNotify`].
#[derive(Debug, Default)]
pub struct Recorder {
    status: Option<StatusCode>,
    headers: HeaderMap,
    committed: Option<HeaderMap>,
    body: BytesMut,
    flushes: usize,
    closed: CloseSignal,
}

impl Recorder {
    pub fn new() -> Self { Self::default() }

    /// A recorder whose close notification is driven by `signal`.
    pub fn with_close_signal(signal: CloseSignal) -> Self {
        Self { closed: signal, ..Self::default() }
    }

    /// Status sent so far; `None` if nothing has been written.
    pub fn status(&self) -> Option<StatusCode> { self.status }

    /// Headers as sent with the status line, or the live map if the status
    /// has not been written yet.
    pub fn sent_headers(&self) -> &HeaderMap {
        self.committed.as_ref().unwrap_or(&self.headers)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.sent_headers().get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &[u8] { &self.body }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }

    pub fn flushes(&self) -> usize { self.flushes }

    /// Converts the recording into a transport response. An untouched
    /// recorder becomes an empty `200 OK`.
    pub fn into_response(self) -> http::Response<Full<Bytes>> {
        let status = self.status.unwrap_or(StatusCode::OK);
        let headers = self.committed.unwrap_or(self.headers);
        let mut res = http::Response::new(Full::new(self.body.freeze()));
        *res.status_mut() = status;
        *res.headers_mut() = headers;
        res
    }
}

impl ResponseSink for Recorder {
    fn headers(&self) -> &HeaderMap { &self.headers }
    fn headers_mut(&mut self) -> &mut HeaderMap { &mut self.headers }

    fn write_status(&mut self, status: StatusCode) {
        if self.status.is_some() {
            return;
        }
        self.status = Some(status);
        self.committed = Some(self.headers.clone());
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.status.is_none() {
            self.write_status(StatusCode::OK);
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> { Some(self) }
    fn as_close_notify(&mut self) -> Option<&mut dyn CloseNotify> { Some(self) }
}

impl Flush for Recorder {
    fn flush(&mut self) -> io::Result<()> {
        self.flushes += 1;
        Ok(())
    }
}

impl CloseNotify for Recorder {
    fn close_notify(&mut self) -> CloseSignal {
        self.closed.clone()
    }
}

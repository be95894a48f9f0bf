//! Response tracking over a [`ResponseSink`].
//!
//! A plain sink is write-once and opaque: once the status line is out you
//! cannot ask what it was, or how many bytes followed. [`ResponseWriter`]
//! wraps the sink for the lifetime of one request and records exactly that,
//! so outer units (loggers, the recovery boundary) can inspect what inner
//! units did after the continuation returns.
//!
//! # Commit point
//!
//! [`set_status`] only records a status; nothing reaches the sink until the
//! response head is committed by the first [`write`] or [`flush`], or by
//! [`finish`] once the chain is done. Callbacks registered with [`before`]
//! run right before that commit, newest first, and may still change headers.
//! After the commit the status is final and `set_status` is a no-op.
//!
//! [`set_status`]: ResponseWriter::set_status
//! [`write`]: ResponseWriter::write
//! [`flush`]: ResponseWriter::flush
//! [`finish`]: ResponseWriter::finish
//! [`before`]: ResponseWriter::before

use std::fmt;
use std::io;

use http::{HeaderMap, StatusCode};
use tracing::debug;

use crate::error::{Capability, Error};
use crate::sink::{CloseNotify, CloseSignal, Connection, Flush, Hijack, ResponseSink};

type BeforeFn = Box<dyn FnOnce(StatusCode, &mut HeaderMap) + Send>;

/// The tracked output handed to every chain unit.
pub struct ResponseWriter<'a> {
    sink: &'a mut dyn ResponseSink,
    status: Option<StatusCode>,
    committed: bool,
    size: usize,
    before: Vec<BeforeFn>,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(sink: &'a mut dyn ResponseSink) -> Self {
        Self { sink, status: None, committed: false, size: 0, before: Vec::new() }
    }

    /// The status recorded so far, or `None` if neither a status nor any
    /// bytes have been written.
    pub fn status(&self) -> Option<StatusCode> { self.status }

    /// Whether the response head has gone out to the sink.
    pub fn written(&self) -> bool { self.committed }

    /// Body bytes accepted by the sink so far.
    pub fn size(&self) -> usize { self.size }

    pub fn headers(&self) -> &HeaderMap { self.sink.headers() }
    pub fn headers_mut(&mut self) -> &mut HeaderMap { self.sink.headers_mut() }

    /// Records the response status. Ignored once the head is committed.
    pub fn set_status(&mut self, status: StatusCode) {
        if self.committed {
            debug!(current = ?self.status, ignored = %status, "response status already written");
            return;
        }
        self.status = Some(status);
    }

    /// Writes body bytes, committing the head (`200 OK` unless a status was
    /// set) on the first call.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        self.commit();
        let n = self.sink.write(buf).map_err(Error::Sink)?;
        self.size += n;
        Ok(n)
    }

    pub fn write_str(&mut self, s: &str) -> Result<usize, Error> {
        self.write(s.as_bytes())
    }

    /// Backs the `write!` macro: `write!(rw, "{n} items")?`.
    pub fn write_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), Error> {
        match args.as_str() {
            Some(s) => self.write(s.as_bytes()),
            None => self.write(args.to_string().as_bytes()),
        }
        .map(|_| ())
    }

    /// Registers a callback to run just before the response head is
    /// committed. Callbacks run once, in reverse registration order, and
    /// never run if the response is never committed.
    pub fn before(&mut self, callback: impl FnOnce(StatusCode, &mut HeaderMap) + Send + 'static) {
        self.before.push(Box::new(callback));
    }

    /// Sends the head if a status was set but nothing was written. Called
    /// when a chain finishes; a response with no status and no body is left
    /// for the transport to default.
    pub fn finish(&mut self) {
        if self.status.is_some() {
            self.commit();
        }
    }

    fn commit(&mut self) {
        if self.committed {
            return;
        }
        let status = *self.status.get_or_insert(StatusCode::OK);
        for callback in std::mem::take(&mut self.before).into_iter().rev() {
            callback(status, self.sink.headers_mut());
        }
        self.committed = true;
        self.sink.write_status(status);
    }

    /// Flushes buffered bytes, committing the head first.
    pub fn flush(&mut self) -> Result<(), Error> {
        if self.sink.as_flush().is_none() {
            return Err(Error::Unsupported(Capability::Flush));
        }
        self.commit();
        match self.sink.as_flush() {
            Some(sink) => sink.flush().map_err(Error::Sink),
            None => Err(Error::Unsupported(Capability::Flush)),
        }
    }

    /// Takes over the underlying connection.
    pub fn hijack(&mut self) -> Result<Box<dyn Connection>, Error> {
        self.sink
            .as_hijack()
            .ok_or(Error::Unsupported(Capability::Hijack))?
            .hijack()
            .map_err(Error::Sink)
    }

    /// A flag raised when the client disconnects before the response is done.
    pub fn close_notify(&mut self) -> Result<CloseSignal, Error> {
        self.sink
            .as_close_notify()
            .map(|sink| sink.close_notify())
            .ok_or(Error::Unsupported(Capability::CloseNotify))
    }
}

fn into_io(e: Error) -> io::Error {
    match e {
        Error::Sink(e) | Error::Io(e) => e,
        other => io::Error::other(other),
    }
}

// A writer is itself a sink, so a chain can run inside another chain's
// output. Capabilities are offered exactly when the wrapped sink has them.
impl ResponseSink for ResponseWriter<'_> {
    fn headers(&self) -> &HeaderMap { self.sink.headers() }
    fn headers_mut(&mut self) -> &mut HeaderMap { self.sink.headers_mut() }

    fn write_status(&mut self, status: StatusCode) {
        self.set_status(status);
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        ResponseWriter::write(self, buf).map_err(into_io)
    }

    fn as_flush(&mut self) -> Option<&mut dyn Flush> {
        if self.sink.as_flush().is_some() { Some(self) } else { None }
    }

    fn as_hijack(&mut self) -> Option<&mut dyn Hijack> {
        if self.sink.as_hijack().is_some() { Some(self) } else { None }
    }

    fn as_close_notify(&mut self) -> Option<&mut dyn CloseNotify> {
        if self.sink.as_close_notify().is_some() { Some(self) } else { None }
    }
}

impl Flush for ResponseWriter<'_> {
    fn flush(&mut self) -> io::Result<()> {
        ResponseWriter::flush(self).map_err(into_io)
    }
}

impl Hijack for ResponseWriter<'_> {
    fn hijack(&mut self) -> io::Result<Box<dyn Connection>> {
        ResponseWriter::hijack(self).map_err(into_io)
    }
}

impl CloseNotify for ResponseWriter<'_> {
    fn close_notify(&mut self) -> CloseSignal {
        // Only reachable through `as_close_notify`, which checked support.
        ResponseWriter::close_notify(self).unwrap_or_default()
    }
}

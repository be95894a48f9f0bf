//! Chain units and endpoints.
//!
//! # Two shapes of handler
//!
//! - A **unit** ([`Handler`]) is one stage of a [`Chain`](crate::Chain). It
//!   receives the tracked output, the request, and a [`Next`] continuation.
//!   Calling `next.run(rw, req)` proceeds down the chain; returning without
//!   calling it stops the chain right there.
//! - An **endpoint** ([`Endpoint`]) is the outer contract the transport layer
//!   sees: given a sink and a request, produce a response. A `Chain` is an
//!   endpoint; so is anything built with [`endpoint_fn`].
//!
//! # How units are stored
//!
//! A chain holds units of *different* concrete types in one list, so each is
//! type-erased behind `Arc<dyn Handler>`:
//!
//! ```text
//! fn auth(rw, req, next) -> Outcome { … }     ← user writes this
//!        ↓ chain.with(auth)
//! auth.boxed()                                ← Handler blanket impl
//!        ↓  stored as BoxedHandler = Arc<dyn Handler>
//! unit.handle(rw, req, next) at request time  ← one vtable dispatch
//! ```
//!
//! Closures need a nudge: Rust only infers the higher-ranked signature a unit
//! needs when the closure is passed straight to an `Fn` bound, which is what
//! [`from_fn`] provides.

use std::sync::Arc;

use crate::chain::Next;
use crate::error::Outcome;
use crate::request::Request;
use crate::sink::ResponseSink;
use crate::writer::ResponseWriter;

/// One stage of a middleware chain.
///
/// Implemented automatically for functions with the signature
///
/// ```text
/// fn name(rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome
/// ```
///
/// and by hand for configurable units such as [`Recovery`](crate::Recovery).
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome;

    /// Short name for logs and chain introspection.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Erases the concrete type so units of different types can share one
    /// list. Sized is required because only a concrete type can be moved into
    /// the `Arc`.
    fn boxed(self) -> BoxedHandler
    where
        Self: Sized,
    {
        Arc::new(self)
    }
}

/// A type-erased unit shared across concurrent requests.
pub type BoxedHandler = Arc<dyn Handler>;

// Blanket impl: any `fn` item with the unit signature is a unit, so
// `chain.with(auth)` works without a wrapper.
impl<F> Handler for F
where
    F: Fn(&mut ResponseWriter<'_>, &Request, Next<'_>) -> Outcome + Send + Sync + 'static,
{
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        self(rw, req, next)
    }
}

/// Newtype that pins a closure to the unit signature.
pub struct HandlerFn<F>(F);

/// Turns a closure into a unit.
///
/// ```rust
/// use braid::{Chain, from_fn};
///
/// let chain = Chain::default().with(from_fn(|rw, req, next| {
///     rw.headers_mut().insert("x-path", req.path().parse().unwrap());
///     next.run(rw, req)
/// }));
/// ```
pub fn from_fn<F>(f: F) -> HandlerFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request, Next<'_>) -> Outcome + Send + Sync + 'static,
{
    HandlerFn(f)
}

impl<F> Handler for HandlerFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request, Next<'_>) -> Outcome + Send + Sync + 'static,
{
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        (self.0)(rw, req, next)
    }

    fn name(&self) -> &'static str {
        "from_fn"
    }
}

// ── Endpoints ─────────────────────────────────────────────────────────────────

/// Something that turns a request into a response on a sink.
pub trait Endpoint: Send + Sync + 'static {
    fn serve(&self, sink: &mut dyn ResponseSink, req: &Request) -> Outcome;
}

// Lets the server hand each connection a clone of an `Arc<E>`. `?Sized`
// covers `Arc<dyn Endpoint>` as well.
impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn serve(&self, sink: &mut dyn ResponseSink, req: &Request) -> Outcome {
        (**self).serve(sink, req)
    }
}

/// Newtype that makes a closure an [`Endpoint`].
pub struct EndpointFn<F>(F);

/// Turns a plain request handler into an endpoint. The handler gets a fresh
/// [`ResponseWriter`] over the sink.
pub fn endpoint_fn<F>(f: F) -> EndpointFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request) -> Outcome + Send + Sync + 'static,
{
    EndpointFn(f)
}

impl<F> Endpoint for EndpointFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request) -> Outcome + Send + Sync + 'static,
{
    fn serve(&self, sink: &mut dyn ResponseSink, req: &Request) -> Outcome {
        let mut rw = ResponseWriter::new(sink);
        (self.0)(&mut rw, req)?;
        // A handler that only set a status still has to send the head.
        rw.finish();
        Ok(())
    }
}

// ── Adapters ──────────────────────────────────────────────────────────────────

/// A unit that serves an endpoint and then always continues.
pub struct Wrap<E>(E);

/// Adapts an endpoint into a unit. The endpoint runs on the tracked output,
/// then the chain continues regardless of what it wrote.
pub fn wrap<E: Endpoint>(endpoint: E) -> Wrap<E> {
    Wrap(endpoint)
}

impl<E: Endpoint> Handler for Wrap<E> {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        // The writer is itself a sink, so the endpoint writes through the
        // same tracking as the rest of the chain.
        self.0.serve(rw, req)?;
        next.run(rw, req)
    }
}

/// A unit that runs a plain handler and then always continues.
pub struct WrapFn<F>(F);

pub fn wrap_fn<F>(f: F) -> WrapFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request) -> Outcome + Send + Sync + 'static,
{
    WrapFn(f)
}

impl<F> Handler for WrapFn<F>
where
    F: Fn(&mut ResponseWriter<'_>, &Request) -> Outcome + Send + Sync + 'static,
{
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        (self.0)(rw, req)?;
        next.run(rw, req)
    }

    fn name(&self) -> &'static str {
        "wrap_fn"
    }
}

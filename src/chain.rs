//! The middleware chain.
//!
//! A [`Chain`] is an ordered list of units plus a compiled, executable form
//! of that list. Units run in insertion order; each one decides whether the
//! rest of the chain runs by calling (or not calling) its [`Next`].
//!
//! # Compiled form
//!
//! The unit list is compiled into an arena of links, walking from the last
//! unit back to the first. Each link holds a unit and the arena index of the
//! link that follows it; the arena starts with a terminal link that ends the
//! chain:
//!
//! ```text
//! units:  [A, B, C]
//! arena:  0: terminal      next: none
//!         1: C             next: 0
//!         2: B             next: 1
//!         3: A  ← head     next: 2
//! ```
//!
//! The arena is immutable once built. [`Chain::append`] compiles a whole new
//! one and swaps it in; requests already running keep the snapshot they
//! started with, so they never see a half-built chain.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Outcome};
use crate::handler::{BoxedHandler, Endpoint, Handler};
use crate::logger::Logger;
use crate::recovery::Recovery;
use crate::request::Request;
use crate::sink::ResponseSink;
use crate::static_files::{FileSystem, Static};
use crate::writer::ResponseWriter;

// ── Continuation ──────────────────────────────────────────────────────────────

/// The rest of the chain, handed to every unit.
///
/// Consumed by [`run`](Next::run), so a unit can proceed at most once.
pub struct Next<'a> {
    links: &'a [Link],
    index: Option<usize>,
    tail: Option<Box<Next<'a>>>,
}

impl<'a> Next<'a> {
    /// Runs the remaining units.
    pub fn run(self, rw: &mut ResponseWriter<'_>, req: &Request) -> Outcome {
        match self.index {
            Some(i) => {
                let link = &self.links[i];
                let next = Next { links: self.links, index: link.next, tail: self.tail };
                link.unit.handle(rw, req, next)
            }
            None => match self.tail {
                Some(tail) => tail.run(rw, req),
                None => Ok(()),
            },
        }
    }

    /// A continuation that does nothing.
    pub fn empty() -> Self {
        Next { links: &[], index: None, tail: None }
    }
}

// ── Compiled chain ────────────────────────────────────────────────────────────

struct Link {
    unit: BoxedHandler,
    next: Option<usize>,
}

/// Caps every chain. From inside the chain it is a no-op; when the chain is
/// nested in another, it hands over to the outer continuation.
struct Terminal;

impl Handler for Terminal {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        next.run(rw, req)
    }
}

struct Snapshot {
    units: Vec<BoxedHandler>,
    links: Vec<Link>,
}

impl Snapshot {
    fn compile(units: Vec<BoxedHandler>) -> Self {
        let mut links = Vec::with_capacity(units.len() + 1);
        links.push(Link { unit: Arc::new(Terminal), next: None });
        for unit in units.iter().rev() {
            let next = links.len() - 1;
            links.push(Link { unit: Arc::clone(unit), next: Some(next) });
        }
        Self { units, links }
    }

    /// Continuation that starts at the head link.
    fn entry<'a>(&'a self, tail: Option<Box<Next<'a>>>) -> Next<'a> {
        Next { links: &self.links, index: Some(self.links.len() - 1), tail }
    }
}

// ── Chain ─────────────────────────────────────────────────────────────────────

/// An ordered middleware chain.
///
/// ```rust
/// use braid::{Chain, Next, Outcome, Recorder, Request, ResponseWriter};
/// use http::{Method, StatusCode};
///
/// fn deny(rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
///     if req.header("authorization").is_none() {
///         rw.set_status(StatusCode::UNAUTHORIZED);
///         return Ok(());
///     }
///     next.run(rw, req)
/// }
///
/// fn hello(rw: &mut ResponseWriter<'_>, _req: &Request, _next: Next<'_>) -> Outcome {
///     rw.write_str("hello")?;
///     Ok(())
/// }
///
/// let chain = Chain::default().with(deny).with(hello);
/// let mut rec = Recorder::new();
/// chain.execute(&mut rec, &Request::new(Method::GET, "/")).unwrap();
/// assert_eq!(rec.status(), Some(StatusCode::UNAUTHORIZED));
/// ```
pub struct Chain {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Chain {
    pub fn new(units: Vec<BoxedHandler>) -> Self {
        Self { snapshot: RwLock::new(Arc::new(Snapshot::compile(units))) }
    }

    /// The usual front of an application: [`Recovery`], then [`Logger`],
    /// then [`Static`] over `fs`.
    pub fn classic<F: FileSystem>(fs: F) -> Self {
        Chain::default()
            .with(Recovery::new())
            .with(Logger::new())
            .with(Static::new(fs))
    }

    /// Adds `handler` to the end. Builder form of [`append`](Chain::append).
    pub fn with(mut self, handler: impl Handler) -> Self {
        let snapshot = self.snapshot.get_mut();
        let mut units = snapshot.units.clone();
        units.push(handler.boxed());
        *snapshot = Arc::new(Snapshot::compile(units));
        self
    }

    /// Adds a unit to the end and publishes the rebuilt chain.
    ///
    /// Requests already executing finish on the chain they started with.
    /// Fails with [`Error::InvalidUnit`] when `unit` is `None`.
    pub fn append(&self, unit: impl Into<Option<BoxedHandler>>) -> Result<(), Error> {
        let unit = unit.into().ok_or(Error::InvalidUnit)?;
        let mut snapshot = self.snapshot.write();
        let mut units = snapshot.units.clone();
        units.push(unit);
        *snapshot = Arc::new(Snapshot::compile(units));
        Ok(())
    }

    /// Returns a new chain running this chain's units followed by `units`.
    /// `self` is left untouched.
    pub fn extend(&self, units: impl IntoIterator<Item = BoxedHandler>) -> Chain {
        let mut all = self.current().units.clone();
        all.extend(units);
        Chain::new(all)
    }

    /// The registered units, in execution order.
    pub fn units(&self) -> Vec<BoxedHandler> {
        self.current().units.clone()
    }

    pub fn len(&self) -> usize {
        self.current().units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the chain for one request, tracking everything written to `sink`.
    ///
    /// A status set without a body is sent once the chain completes. On a
    /// fault nothing further is committed, leaving the caller free to answer
    /// with an error of its own.
    pub fn execute(&self, sink: &mut dyn ResponseSink, req: &Request) -> Outcome {
        let snapshot = self.current();
        let mut rw = ResponseWriter::new(sink);
        snapshot.entry(None).run(&mut rw, req)?;
        rw.finish();
        Ok(())
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }
}

impl Default for Chain {
    fn default() -> Self { Self::new(Vec::new()) }
}

impl Clone for Chain {
    fn clone(&self) -> Self {
        Self { snapshot: RwLock::new(self.current()) }
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.current();
        let names: Vec<&str> = snapshot.units.iter().map(|u| u.name()).collect();
        f.debug_struct("Chain").field("units", &names).finish()
    }
}

impl Endpoint for Chain {
    fn serve(&self, sink: &mut dyn ResponseSink, req: &Request) -> Outcome {
        self.execute(sink, req)
    }
}

/// A chain nested as a unit runs on the caller's tracked output. If it runs
/// to completion, the outer chain continues; any inner unit that stops
/// stops the outer chain too.
impl Handler for Chain {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        let snapshot = self.current();
        snapshot.entry(Some(Box::new(next))).run(rw, req)
    }

    fn name(&self) -> &'static str {
        "Chain"
    }
}

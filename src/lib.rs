//! # braid
//!
//! Composable HTTP middleware chains.
//!
//! An application is a [`Chain`] of small, independently written units. Each
//! unit sees the tracked response, the request, and a continuation; it can
//! write a response and stop, or hand the request on.
//!
//! What ships with the chain:
//!
//! - [`ResponseWriter`]: tracks status, bytes written and whether the head was
//!   sent, and runs callbacks just before headers go out
//! - [`Recovery`]: turns panics and faults from the rest of the chain into a
//!   500 response, with a pluggable formatter and logger
//! - [`Store`]: request-scoped key/value bags for passing data between units
//! - [`Static`] and [`Logger`]: file serving and request logging units
//! - [`Server`]: a hyper transport that runs any [`Endpoint`], with graceful
//!   shutdown
//!
//! Routing is out of scope; a router is just another unit.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use braid::{Chain, ClearOnExit, Logger, Recovery, Server, Store, Value};
//! use http::StatusCode;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(Store::<Value>::new());
//!     let users = Arc::clone(&store);
//!
//!     let app = Chain::default()
//!         .with(Recovery::new())
//!         .with(Logger::new())
//!         .with(ClearOnExit::new(Arc::clone(&store)))
//!         .with(braid::from_fn(move |rw, req, next| {
//!             match req.header("x-user") {
//!                 Some(user) => users.set(req.id(), "user", user),
//!                 None => {
//!                     rw.set_status(StatusCode::UNAUTHORIZED);
//!                     return Ok(());
//!                 }
//!             }
//!             next.run(rw, req)
//!         }))
//!         .with(braid::from_fn(move |rw, req, _next| {
//!             let user = store.get(req.id(), "user");
//!             let name = user.as_ref().and_then(|v| v.as_str()).unwrap_or("stranger");
//!             write!(rw, "hello, {name}")?;
//!             Ok(())
//!         }));
//!
//!     Server::bind("127.0.0.1:3000").serve(app).await.unwrap();
//! }
//! ```

mod chain;
mod error;
mod handler;
mod logger;
mod recovery;
mod request;
mod server;
mod sink;
mod static_files;
mod store;
mod writer;

pub use chain::{Chain, Next};
pub use error::{Capability, Error, Fault, Outcome};
pub use handler::{
    BoxedHandler, Endpoint, EndpointFn, Handler, HandlerFn, Wrap, WrapFn, endpoint_fn, from_fn, wrap,
    wrap_fn,
};
pub use logger::Logger;
pub use recovery::{
    HtmlFormatter, NO_PRINT_STACK_BODY, PanicCapture, PanicFormatter, PanicLog, Recovery, TextFormatter,
    TracingLog,
};
pub use request::{Request, RequestId};
pub use server::Server;
pub use sink::{CloseNotify, CloseSignal, Connection, Flush, Hijack, Recorder, ResponseSink};
pub use static_files::{Dir, EntryKind, FileSystem, MemoryFs, Metadata, Static};
pub use store::{Cleanup, ClearOnExit, Store, Value};
pub use writer::ResponseWriter;

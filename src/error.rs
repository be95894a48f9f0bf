//! Unified error type and the fault descriptor carried through a chain.
//!
//! Two different things can go wrong while serving a request:
//!
//! - **[`Error`]**: an operation refused to do what was asked: the sink would
//!   not take bytes, a capability is missing, a unit was absent. These are
//!   ordinary `Result` errors returned by the call that failed.
//! - **[`Fault`]**: a handler gave up on the request. Handlers return
//!   [`Outcome`], and a `Fault` travels back up through every continuation
//!   until a [`Recovery`](crate::Recovery) unit turns it into a 500 response.
//!   Panics raised inside a recovery scope become `Fault`s too.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::io;

/// The result of running a chain unit.
pub type Outcome = Result<(), Fault>;

/// Optional response-sink capabilities.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Capability {
    Flush,
    Hijack,
    CloseNotify,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flush       => "flush",
            Self::Hijack      => "hijack",
            Self::CloseNotify => "close-notify",
        })
    }
}

/// The error type returned by braid's fallible operations.
///
/// Application-level failures (404, 422, etc.) are expressed as responses
/// written by handlers, not as `Error`s.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An absent unit was passed to [`Chain::append`](crate::Chain::append).
    #[error("invalid unit: a chain unit must be present")]
    InvalidUnit,

    /// The underlying response sink did not accept the bytes.
    #[error("response sink: {0}")]
    Sink(#[source] io::Error),

    /// The underlying response sink does not support the capability.
    #[error("response sink does not support {0}")]
    Unsupported(Capability),

    /// Binding to a port or accepting a connection failed.
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// A handler's failure, carried back through the chain.
///
/// The backtrace is captured where the fault was raised: at construction for
/// faults created with [`Fault::new`] or converted from an [`Error`], and at
/// the panic site for faults recovered from a panic.
pub struct Fault {
    message: String,
    backtrace: Backtrace,
}

impl Fault {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), backtrace: Backtrace::force_capture() }
    }

    /// Builds a fault from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>, backtrace: Option<Backtrace>) -> Self {
        Self {
            message: panic_message(payload.as_ref()),
            backtrace: backtrace.unwrap_or_else(Backtrace::disabled),
        }
    }

    pub fn message(&self) -> &str { &self.message }
    pub fn backtrace(&self) -> &Backtrace { &self.backtrace }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fault").field("message", &self.message).finish_non_exhaustive()
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<io::Error> for Fault {
    fn from(e: io::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<&str> for Fault {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Fault {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Extracts the message from a panic payload (`&str` or `String`, as produced
/// by `panic!`).
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

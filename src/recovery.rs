//! Panic recovery boundary.
//!
//! [`Recovery`] runs the rest of the chain inside a fault-catching scope.
//! Whatever escapes, whether an `Err(Fault)` returned up the continuations or
//! a panic unwinding out of a unit, ends the request with a single 500
//! response instead of tearing down the worker:
//!
//! ```text
//! running ──fault──▶ recovering ──▶ formatting ──▶ logged + responded
//! ```
//!
//! There is no retry. Put `Recovery` first in the chain so everything after
//! it is covered; it only catches faults from its own continuation.
//!
//! # Backtraces
//!
//! By the time `catch_unwind` returns, the panicking frames are gone. To keep
//! them, a process-wide panic hook records a backtrace whenever the panicking
//! thread is inside a recovery scope, and stays silent for those panics.
//! Panics elsewhere go to whichever hook was installed before.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Once};

use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue};
use tracing::error;

use crate::chain::Next;
use crate::error::{Error, Fault, Outcome};
use crate::handler::Handler;
use crate::request::Request;
use crate::writer::ResponseWriter;

/// Body sent when stack printing is disabled.
pub const NO_PRINT_STACK_BODY: &str = "500 Internal Server Error";

const NIL_REQUEST_MESSAGE: &str = "request is nil";
const DEFAULT_STACK_SIZE: usize = 8 * 1024;

// ── Panic capture ─────────────────────────────────────────────────────────────

/// Everything known about a recovered fault.
pub struct PanicCapture<'a> {
    fault: Fault,
    stack: String,
    request: Option<&'a Request>,
}

impl<'a> PanicCapture<'a> {
    pub fn new(fault: Fault, stack: impl Into<String>, request: Option<&'a Request>) -> Self {
        Self { fault, stack: stack.into(), request }
    }

    pub fn fault(&self) -> &Fault { &self.fault }

    /// The captured stack; empty when stack printing is disabled.
    pub fn stack(&self) -> &str { &self.stack }

    pub fn request(&self) -> Option<&'a Request> { self.request }

    /// `METHOD /path?query`, or a fixed message when there is no request.
    pub fn request_description(&self) -> String {
        match self.request {
            None => NIL_REQUEST_MESSAGE.to_owned(),
            Some(req) => match req.query() {
                Some(query) => format!("{} {}?{}", req.method(), req.path(), query),
                None => format!("{} {}", req.method(), req.path()),
            },
        }
    }
}

// ── Formatters ────────────────────────────────────────────────────────────────

/// Renders a recovered fault into the response.
///
/// The status is already set when a formatter runs. Formatters should only
/// default the content type, never override one a unit chose.
pub trait PanicFormatter: Send + Sync + 'static {
    fn format(&self, rw: &mut ResponseWriter<'_>, capture: &PanicCapture<'_>) -> Result<(), Error>;
}

/// `PANIC: <fault>\n<stack>` as `text/plain`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TextFormatter;

impl PanicFormatter for TextFormatter {
    fn format(&self, rw: &mut ResponseWriter<'_>, capture: &PanicCapture<'_>) -> Result<(), Error> {
        default_content_type(rw, "text/plain; charset=utf-8");
        write!(rw, "PANIC: {}\n{}", capture.fault(), capture.stack())
    }
}

/// A small HTML error page with the request, the fault and the stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct HtmlFormatter;

impl PanicFormatter for HtmlFormatter {
    fn format(&self, rw: &mut ResponseWriter<'_>, capture: &PanicCapture<'_>) -> Result<(), Error> {
        default_content_type(rw, "text/html; charset=utf-8");

        let fault = html_escape::encode_text(capture.fault().message());
        let description = capture.request_description();
        let description = html_escape::encode_text(&description);
        let stack = if capture.stack().is_empty() {
            Cow::Borrowed("")
        } else {
            Cow::Owned(format!(
                "<div class=\"block stack\">\n<h3>Stack</h3>\n<pre>{}</pre>\n</div>\n",
                html_escape::encode_text(capture.stack()),
            ))
        };

        write!(
            rw,
            "<!DOCTYPE html>\n\
             <html>\n\
             <head>\n\
             <title>PANIC: {fault}</title>\n\
             <style>\n\
             body {{ font-family: Helvetica, Arial, sans-serif; color: #333; margin: 0; }}\n\
             h1 {{ color: #fff; background: #c0392b; padding: 20px; margin: 0; }}\n\
             .block {{ margin: 2em; }}\n\
             .label {{ font-weight: bold; }}\n\
             .stack pre {{ padding: 1em; background: #f6f8fa; border: 1px dashed #999; }}\n\
             </style>\n\
             </head>\n\
             <body>\n\
             <h1>PANIC</h1>\n\
             <div class=\"block\">\n\
             <h3>{description}</h3>\n\
             <span class=\"label\">Runtime error:</span> <span>{fault}</span>\n\
             </div>\n\
             {stack}\
             </body>\n\
             </html>\n"
        )
    }
}

fn default_content_type(rw: &mut ResponseWriter<'_>, value: &'static str) {
    if !rw.headers().contains_key(CONTENT_TYPE) {
        rw.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(value));
    }
}

// ── Logging ───────────────────────────────────────────────────────────────────

/// Where the boundary reports faults.
pub trait PanicLog: Send + Sync + 'static {
    /// A fault recovered from the chain. `stack` is empty when stack logging
    /// is disabled.
    fn recovered(&self, request: &str, fault: &Fault, stack: &str);

    /// A fault raised while handling another one: by the formatter, a
    /// `before` callback, the panic handler, or this log itself. It is
    /// dropped after this call.
    fn secondary(&self, origin: &'static str, fault: &Fault);
}

/// Default [`PanicLog`]: `tracing` events at error level.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLog;

impl PanicLog for TracingLog {
    fn recovered(&self, request: &str, fault: &Fault, stack: &str) {
        if stack.is_empty() {
            error!(target: "braid::recovery", request, "PANIC: {fault}");
        } else {
            error!(target: "braid::recovery", request, "PANIC: {fault}\n{stack}");
        }
    }

    fn secondary(&self, origin: &'static str, fault: &Fault) {
        error!(
            target: "braid::recovery",
            origin,
            "{origin} panicked while handling a panic: {fault}\n{}",
            fault.backtrace(),
        );
    }
}

// ── Recovery ──────────────────────────────────────────────────────────────────

type PanicHandlerFn = Box<dyn Fn(&PanicCapture<'_>) + Send + Sync>;

/// Chain unit that turns faults from the rest of the chain into a 500.
///
/// ```rust
/// use braid::{Chain, HtmlFormatter, Recovery};
///
/// let chain = Chain::default().with(
///     Recovery::new()
///         .formatter(HtmlFormatter)
///         .stack_size(4 * 1024)
///         .on_panic(|capture| eprintln!("reporting {}", capture.fault())),
/// );
/// ```
pub struct Recovery {
    print_stack: bool,
    log_stack: bool,
    stack_all: bool,
    stack_size: usize,
    formatter: Box<dyn PanicFormatter>,
    logger: Arc<dyn PanicLog>,
    on_panic: Option<PanicHandlerFn>,
}

impl Recovery {
    /// Prints and logs an 8 KiB stack with [`TextFormatter`] and [`TracingLog`].
    pub fn new() -> Self {
        hook::install();
        Self {
            print_stack: true,
            log_stack: true,
            stack_all: false,
            stack_size: DEFAULT_STACK_SIZE,
            formatter: Box::new(TextFormatter),
            logger: Arc::new(TracingLog),
            on_panic: None,
        }
    }

    /// Render the fault with the formatter. When off, the body is always
    /// [`NO_PRINT_STACK_BODY`].
    pub fn print_stack(mut self, enabled: bool) -> Self {
        self.print_stack = enabled;
        self
    }

    pub fn log_stack(mut self, enabled: bool) -> Self {
        self.log_stack = enabled;
        self
    }

    /// Prefix the capture with the faulting thread's name and id. Only the
    /// faulting thread's stack is ever walked.
    pub fn stack_all(mut self, enabled: bool) -> Self {
        self.stack_all = enabled;
        self
    }

    /// Upper bound, in bytes, on the captured stack text.
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn formatter(mut self, formatter: impl PanicFormatter) -> Self {
        self.formatter = Box::new(formatter);
        self
    }

    pub fn logger(mut self, logger: impl PanicLog) -> Self {
        self.logger = Arc::new(logger);
        self
    }

    /// Called with every recovered fault after the response is written. A
    /// panic inside the callback is logged and dropped.
    pub fn on_panic(mut self, handler: impl Fn(&PanicCapture<'_>) + Send + Sync + 'static) -> Self {
        self.on_panic = Some(Box::new(handler));
        self
    }

    fn recover(&self, rw: &mut ResponseWriter<'_>, req: &Request, fault: Fault) {
        if !rw.written() {
            rw.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        }

        let stack = self.capture_stack(&fault);
        let capture = PanicCapture::new(
            fault,
            if self.print_stack { stack.as_str() } else { "" },
            Some(req),
        );

        if self.print_stack {
            self.render(rw, &capture);
        } else {
            self.write_fallback(rw);
        }

        if self.log_stack {
            let description = capture.request_description();
            let logged = guarded(|| {
                self.logger.recovered(&description, capture.fault(), &stack);
                Ok(())
            });
            if let Err(fault) = logged {
                self.report_secondary("panic log", &fault);
                TracingLog.recovered(&description, capture.fault(), &stack);
            }
        }

        if let Some(handler) = &self.on_panic {
            if let Err(fault) = guarded(|| {
                handler(&capture);
                Ok(())
            }) {
                self.report_secondary("panic handler", &fault);
            }
        }
    }

    /// Writes [`NO_PRINT_STACK_BODY`]. The write commits the head, which runs
    /// pending `before` callbacks; those are taken before they run, so one
    /// retry after a panicking callback commits without them.
    fn write_fallback(&self, rw: &mut ResponseWriter<'_>) {
        for _ in 0..2 {
            match guarded(|| {
                write_generic_body(rw);
                Ok(())
            }) {
                Ok(()) => return,
                Err(fault) => self.report_secondary("before callback", &fault),
            }
        }
    }

    /// Reports through the injected log, or through [`TracingLog`] if that
    /// panics too.
    fn report_secondary(&self, origin: &'static str, fault: &Fault) {
        let reported = guarded(|| {
            self.logger.secondary(origin, fault);
            Ok(())
        });
        if reported.is_err() {
            TracingLog.secondary(origin, fault);
        }
    }

    fn render(&self, rw: &mut ResponseWriter<'_>, capture: &PanicCapture<'_>) {
        let before = rw.size();
        match guarded(|| Ok(self.formatter.format(rw, capture))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(target: "braid::recovery", error = %e, "failed to write panic response");
            }
            Err(fault) => {
                self.report_secondary("formatter", &fault);
                if rw.size() == before {
                    self.write_fallback(rw);
                }
            }
        }
    }

    fn capture_stack(&self, fault: &Fault) -> String {
        let trace = match fault.backtrace().status() {
            BacktraceStatus::Captured => fault.backtrace().to_string(),
            _ => Backtrace::force_capture().to_string(),
        };
        let mut stack = if self.stack_all {
            let thread = std::thread::current();
            format!("thread '{}' ({:?}):\n{trace}", thread.name().unwrap_or("<unnamed>"), thread.id())
        } else {
            trace
        };
        truncate_at_boundary(&mut stack, self.stack_size);
        stack
    }
}

impl Default for Recovery {
    fn default() -> Self { Self::new() }
}

impl Handler for Recovery {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        if let Err(fault) = guarded(|| next.run(rw, req)) {
            self.recover(rw, req, fault);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Recovery"
    }
}

fn write_generic_body(rw: &mut ResponseWriter<'_>) {
    default_content_type(rw, "text/plain; charset=utf-8");
    if let Err(e) = rw.write_str(NO_PRINT_STACK_BODY) {
        error!(target: "braid::recovery", error = %e, "failed to write panic response");
    }
}

fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}

/// Runs `f`, turning both a returned fault and a panic into `Err(Fault)`.
fn guarded<T>(f: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
    let _scope = hook::Scope::enter();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(Fault::from_panic(payload, hook::take_backtrace())),
    }
}

mod hook {
    use super::*;

    thread_local! {
        static DEPTH: Cell<usize> = const { Cell::new(0) };
        static CAPTURED: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
    }

    static INSTALL: Once = Once::new();

    pub(super) fn install() {
        INSTALL.call_once(|| {
            let previous = panic::take_hook();
            panic::set_hook(Box::new(move |info| {
                if DEPTH.with(Cell::get) > 0 {
                    CAPTURED.with(|slot| *slot.borrow_mut() = Some(Backtrace::force_capture()));
                } else {
                    previous(info);
                }
            }));
        });
    }

    pub(super) fn take_backtrace() -> Option<Backtrace> {
        CAPTURED.with(|slot| slot.borrow_mut().take())
    }

    /// Marks the current thread as inside a recovery scope.
    pub(super) struct Scope;

    impl Scope {
        pub(super) fn enter() -> Self {
            install();
            DEPTH.with(|depth| depth.set(depth.get() + 1));
            Scope
        }
    }

    impl Drop for Scope {
        fn drop(&mut self) {
            DEPTH.with(|depth| depth.set(depth.get() - 1));
        }
    }
}

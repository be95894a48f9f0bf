//! Request logging unit.

use std::time::Instant;

use chrono::{SecondsFormat, Utc};
use http::StatusCode;
use http::header::HOST;
use tracing::{debug, error, info, warn};

use crate::chain::Next;
use crate::error::Outcome;
use crate::handler::Handler;
use crate::request::Request;
use crate::writer::ResponseWriter;

/// Logs one `tracing` event per request once the rest of the chain returns.
///
/// The level follows the status: `info` below 400, `warn` for 4xx, `error`
/// for 5xx and for faults that escape the chain.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logger {
    headers: bool,
}

impl Logger {
    pub fn new() -> Self { Self::default() }

    /// Also dump the request headers at `debug` level.
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.headers = enabled;
        self
    }
}

impl Handler for Logger {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        let started = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let timer = Instant::now();
        if self.headers {
            debug!(target: "braid::logger", id = %req.id(), headers = ?req.headers(), "request headers");
        }

        let outcome = next.run(rw, req);

        let latency = timer.elapsed();
        let status = match &outcome {
            Ok(()) => rw.status().unwrap_or(StatusCode::OK),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let host = req.headers().get(HOST).and_then(|v| v.to_str().ok()).unwrap_or("");

        macro_rules! emit {
            ($level:ident) => {
                $level!(
                    target: "braid::logger",
                    id = %req.id(),
                    method = %req.method(),
                    path = req.path(),
                    host,
                    status = status.as_u16(),
                    size = rw.size(),
                    ?latency,
                    started = %started,
                    "{} {} {}", req.method(), req.path(), status.as_u16(),
                )
            };
        }

        if let Err(fault) = &outcome {
            error!(target: "braid::logger", id = %req.id(), "request failed: {fault}");
        }
        match status.as_u16() {
            500.. => emit!(error),
            400..=499 => emit!(warn),
            _ => emit!(info),
        }

        outcome
    }

    fn name(&self) -> &'static str {
        "Logger"
    }
}

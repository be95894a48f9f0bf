//! HTTP transport and graceful shutdown.
//!
//! The chain is synchronous, so every request runs on tokio's blocking pool:
//!
//! ```text
//! hyper request ──collect body──▶ Request ──spawn_blocking──▶ endpoint.serve(Recorder)
//!                                                                   │
//! hyper response ◀──────────────── Recorder::into_response ◀────────┘
//! ```
//!
//! # Graceful shutdown
//!
//! On SIGTERM or Ctrl-C the server:
//! 1. Stops calling `listener.accept()`, so no new connections are made.
//! 2. Lets every in-flight connection task run to completion.
//! 3. Returns from [`Server::serve`], which lets `main` exit cleanly.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::error::Error;
use crate::handler::Endpoint;
use crate::request::Request;
use crate::sink::{CloseSignal, Recorder};

enum Listen {
    Addr(SocketAddr),
    Listener(TcpListener),
}

/// Serves an [`Endpoint`] over HTTP/1.1 and HTTP/2.
pub struct Server {
    listen: Listen,
}

impl Server {
    /// Configures the server to bind to `addr` when [`serve`](Server::serve)
    /// is called.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is not a valid `host:port` string.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use braid::Server;
    /// let server = Server::bind("0.0.0.0:3000");
    /// ```
    pub fn bind(addr: &str) -> Self {
        let addr: SocketAddr = addr.parse().expect("invalid socket address");
        Self { listen: Listen::Addr(addr) }
    }

    /// Serves on a listener that is already bound.
    pub fn from_listener(listener: TcpListener) -> Self {
        Self { listen: Listen::Listener(listener) }
    }

    /// Serves `endpoint` until SIGTERM or Ctrl-C, then drains in-flight
    /// connections.
    pub async fn serve<E: Endpoint>(self, endpoint: E) -> Result<(), Error> {
        self.serve_with_shutdown(endpoint, shutdown_signal()).await
    }

    /// Serves `endpoint` until `signal` resolves, then drains in-flight
    /// connections.
    pub async fn serve_with_shutdown<E, S>(self, endpoint: E, signal: S) -> Result<(), Error>
    where
        E: Endpoint,
        S: Future<Output = ()>,
    {
        let listener = match self.listen {
            Listen::Addr(addr) => TcpListener::bind(addr).await?,
            Listen::Listener(listener) => listener,
        };
        // Every connection task gets its own handle on the endpoint.
        let endpoint = Arc::new(endpoint);

        info!(addr = %listener.local_addr()?, "braid listening");

        // Tracks every spawned connection task so shutdown can wait on them.
        let mut tasks = tokio::task::JoinSet::new();

        // The signal future is polled once per loop iteration, so it has to
        // stay at one address.
        tokio::pin!(signal);

        loop {
            tokio::select! {
                // `biased` polls the arms top to bottom instead of at random.
                // Shutdown is checked first so a signal stops accepts even
                // while connections are queued.
                biased;

                () = &mut signal => {
                    info!(in_flight = tasks.len(), "shutdown signal received, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };

                    let endpoint = Arc::clone(&endpoint);
                    // TokioIo adapts tokio's AsyncRead/AsyncWrite to hyper's
                    // own IO traits.
                    let io = TokioIo::new(stream);

                    tasks.spawn(async move {
                        // `service_fn` turns the closure into a hyper Service.
                        // It is called once per request on this connection.
                        let svc = service_fn(move |req| {
                            let endpoint = Arc::clone(&endpoint);
                            async move { dispatch(endpoint, req, remote_addr).await }
                        });

                        // The auto builder speaks HTTP/1.1 or HTTP/2, whichever
                        // the client negotiates.
                        if let Err(e) = ConnBuilder::new(TokioExecutor::new())
                            .serve_connection(io, svc)
                            .await
                        {
                            error!(peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }

                // Reap finished connection tasks so the set does not grow
                // without bound.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        // Accepting has stopped; wait for the connections already open.
        while tasks.join_next().await.is_some() {}

        info!("braid stopped");
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Raises the request's close signal if the response future is dropped
/// before the endpoint finished, i.e. the client went away.
struct CloseOnDrop(Option<CloseSignal>);

impl CloseOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Some(signal) = self.0.take() {
            signal.close();
        }
    }
}

/// Runs one request through the endpoint and produces one response. Hyper
/// never sees an error: faults and panics that escape the endpoint become a
/// bare 500.
async fn dispatch<E: Endpoint>(
    endpoint: Arc<E>,
    req: hyper::Request<Incoming>,
    peer: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(peer = %peer, "failed to read request body: {e}");
            return Ok(bare(StatusCode::BAD_REQUEST));
        }
    };
    let req = Request::from_http(http::Request::from_parts(parts, body));

    let closed = CloseSignal::new();
    let guard = CloseOnDrop(Some(closed.clone()));

    // The chain blocks, so it runs off the async worker threads. A panic
    // that escapes the endpoint comes back as a JoinError below.
    let task = tokio::task::spawn_blocking(move || {
        let mut rec = Recorder::with_close_signal(closed);
        match endpoint.serve(&mut rec, &req) {
            Ok(()) => rec.into_response(),
            Err(fault) => {
                error!(peer = %peer, id = %req.id(), "unrecovered fault: {fault}");
                bare(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    });

    let res = match task.await {
        Ok(res) => res,
        Err(e) => {
            error!(peer = %peer, "endpoint panicked: {e}");
            bare(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };
    // The endpoint finished, so a later drop is not a client disconnect.
    guard.disarm();
    Ok(res)
}

fn bare(status: StatusCode) -> http::Response<Full<Bytes>> {
    let mut res = http::Response::new(Full::new(Bytes::new()));
    *res.status_mut() = status;
    res
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on SIGTERM or Ctrl-C. A handler that cannot be installed is
/// logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c  => info!("received Ctrl-C"),
        () = sigterm => info!("received SIGTERM"),
    }
}

//! A small braid application: recovery, logging, static files, a
//! request-scoped store and a couple of hand-written units.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:3000/hello
//!   curl -i -H 'x-user: ada' http://localhost:3000/hello
//!   curl -i http://localhost:3000/panic
//!   curl -i http://localhost:3000/static/

use std::sync::Arc;

use braid::{
    Chain, ClearOnExit, HtmlFormatter, Logger, MemoryFs, Next, Outcome, Recovery, Request, ResponseWriter,
    Server, Static, Store, Value,
};
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::var("BRAID_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_owned());

    let store = Arc::new(Store::<Value>::new());
    let assets = MemoryFs::new()
        .file("/index.html", "<h1>braid</h1>")
        .file("/app.js", "console.log('braid');");

    let app = Chain::default()
        .with(Recovery::new().formatter(HtmlFormatter))
        .with(Logger::new())
        .with(ClearOnExit::new(Arc::clone(&store)))
        .with(Static::new(assets).prefix("/static"))
        .with(identify(Arc::clone(&store)))
        .with(panic_route)
        .with(greet(store));

    Server::bind(&addr).serve(app).await.expect("server error");
}

// Stashes the caller's name for later units.
fn identify(store: Arc<Store>) -> impl braid::Handler {
    braid::from_fn(move |rw, req, next| {
        let user = req.header("x-user").map(str::to_owned);
        store.set(req.id(), "user", user);
        rw.before(|status, headers| {
            if status.is_success() {
                headers.insert("x-powered-by", HeaderValue::from_static("braid"));
            }
        });
        next.run(rw, req)
    })
}

fn panic_route(rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
    if req.path() == "/panic" {
        panic!("you asked for it");
    }
    next.run(rw, req)
}

fn greet(store: Arc<Store>) -> impl braid::Handler {
    braid::from_fn(move |rw, req, _next| {
        if req.path() != "/hello" {
            rw.set_status(StatusCode::NOT_FOUND);
            rw.write_str("not found\n")?;
            return Ok(());
        }
        rw.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        match store.get(req.id(), "user").as_ref().and_then(Value::as_str) {
            Some(user) => writeln!(rw, "hello, {user}")?,
            None => rw.write_str("hello, stranger\n").map(drop)?,
        }
        Ok(())
    })
}

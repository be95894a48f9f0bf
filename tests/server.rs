//! Integration tests for the hyper transport and graceful shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use braid::{Chain, Endpoint, Recovery, Server, Store, Value, endpoint_fn, from_fn};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

async fn start(endpoint: impl Endpoint) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        Server::from_listener(listener)
            .serve_with_shutdown(endpoint, async {
                let _ = shutdown_rx.await;
            })
            .await
            .unwrap();
    });

    (addr, shutdown_tx, handle)
}

async fn send(addr: SocketAddr, raw: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8(buf).unwrap()
}

fn get(path: &str) -> String {
    format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
}

#[tokio::test]
async fn serves_a_chain() {
    let chain = Chain::default().with(from_fn(|rw, req, _next| {
        rw.set_status(StatusCode::CREATED);
        rw.headers_mut().insert("x-query", req.query().unwrap_or("-").parse().unwrap());
        rw.write_str("made")?;
        Ok(())
    }));
    let (addr, shutdown, handle) = start(chain).await;

    let res = send(addr, &get("/things?kind=box")).await;
    assert!(res.starts_with("HTTP/1.1 201 Created\r\n"), "{res}");
    assert!(res.contains("x-query: kind=box\r\n"), "{res}");
    assert!(res.ends_with("\r\n\r\nmade"), "{res}");

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn request_body_reaches_the_endpoint() {
    let echo = endpoint_fn(|rw, req| {
        rw.write(req.body())?;
        Ok(())
    });
    let (addr, shutdown, handle) = start(echo).await;

    let res = send(
        addr,
        "POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    )
    .await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");
    assert!(res.ends_with("hello"), "{res}");

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn recovered_panics_become_500_pages() {
    let chain = Chain::default()
        .with(Recovery::new().print_stack(false).log_stack(false))
        .with(from_fn(|_rw, _req, _next| panic!("kaboom")));
    let (addr, shutdown, handle) = start(chain).await;

    let res = send(addr, &get("/")).await;
    assert!(res.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{res}");
    assert!(res.ends_with("500 Internal Server Error"), "{res}");

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn unrecovered_faults_and_panics_become_bare_500s() {
    let (addr, shutdown, handle) = start(endpoint_fn(|_rw, req| {
        if req.path() == "/fault" {
            return Err("gave up".into());
        }
        panic!("no boundary here");
    }))
    .await;

    for path in ["/fault", "/panic"] {
        let res = send(addr, &get(path)).await;
        assert!(res.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{path}: {res}");
    }

    // The server is still up after both.
    let res = send(addr, &get("/fault")).await;
    assert!(res.starts_with("HTTP/1.1 500"), "{res}");

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn store_is_cleaned_up_per_request() {
    let store = Arc::new(Store::<Value>::new());
    let writer = Arc::clone(&store);
    let endpoint = store.wrap_with_cleanup(endpoint_fn(move |rw, req| {
        writer.set(req.id(), "seen", true);
        write!(rw, "{}", writer.len())?;
        Ok(())
    }));
    let (addr, shutdown, handle) = start(endpoint).await;

    let res = send(addr, &get("/")).await;
    assert!(res.ends_with("\r\n\r\n1"), "{res}");
    assert!(store.is_empty());

    shutdown.send(()).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn shutdown_stops_accepting() {
    let (addr, shutdown, handle) = start(Chain::default()).await;

    let res = send(addr, &get("/")).await;
    assert!(res.starts_with("HTTP/1.1 200 OK\r\n"), "{res}");

    shutdown.send(()).unwrap();
    handle.await.unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}

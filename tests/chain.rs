//! End-to-end chain behaviour through the public API.

use std::sync::{Arc, Mutex};
use std::thread;

use braid::{
    BoxedHandler, Chain, Endpoint, Error, Handler, Recorder, Request, Store, Value, endpoint_fn, from_fn,
    wrap, wrap_fn,
};
use http::header::HeaderValue;
use http::{Method, StatusCode};

fn get(path: &str) -> Request {
    Request::new(Method::GET, path)
}

#[test]
fn units_share_data_through_the_store() {
    let store = Arc::new(Store::<Value>::new());
    let log = Arc::new(Mutex::new(Vec::<String>::new()));

    let chain = Chain::default();
    {
        let store = Arc::clone(&store);
        let log = Arc::clone(&log);
        chain
            .append(
                from_fn(move |rw, req, next| {
                    store.set(req.id(), "user", "ada");
                    log.lock().unwrap().push("set user".into());
                    next.run(rw, req)
                })
                .boxed(),
            )
            .unwrap();
    }
    {
        let store = Arc::clone(&store);
        let log = Arc::clone(&log);
        chain
            .append(
                from_fn(move |rw, req, next| {
                    let user = store.get(req.id(), "user").unwrap();
                    log.lock().unwrap().push(format!("read {}", user.as_str().unwrap()));
                    next.run(rw, req)
                })
                .boxed(),
            )
            .unwrap();
    }
    chain
        .append(
            from_fn(|rw, _req, _next| {
                rw.set_status(StatusCode::BAD_REQUEST);
                Ok(())
            })
            .boxed(),
        )
        .unwrap();
    {
        let log = Arc::clone(&log);
        chain
            .append(
                from_fn(move |rw, req, next| {
                    log.lock().unwrap().push("never".into());
                    next.run(rw, req)
                })
                .boxed(),
            )
            .unwrap();
    }

    let mut rec = Recorder::new();
    let req = get("/");
    chain.execute(&mut rec, &req).unwrap();

    assert_eq!(*log.lock().unwrap(), ["set user", "read ada"]);
    assert_eq!(rec.status(), Some(StatusCode::BAD_REQUEST));
    assert_eq!(store.get(req.id(), "user"), Some(Value::from("ada")));
}

#[test]
fn before_callbacks_see_the_final_status() {
    let chain = Chain::default()
        .with(from_fn(|rw, req, next| {
            rw.before(|status, headers| {
                headers.insert("x-status", HeaderValue::from(status.as_u16()));
            });
            next.run(rw, req)
        }))
        .with(from_fn(|rw, _req, _next| {
            rw.set_status(StatusCode::ACCEPTED);
            rw.write_str("queued")?;
            Ok(())
        }));

    let mut rec = Recorder::new();
    chain.execute(&mut rec, &get("/jobs")).unwrap();
    assert_eq!(rec.header("x-status"), Some("202"));
    assert_eq!(rec.body_str(), "queued");
}

#[test]
fn status_only_responses_are_sent_when_the_chain_returns() {
    let chain = Chain::default().with(from_fn(|rw, _req, _next| {
        rw.set_status(StatusCode::NO_CONTENT);
        Ok(())
    }));

    let mut rec = Recorder::new();
    chain.execute(&mut rec, &get("/")).unwrap();
    assert_eq!(rec.status(), Some(StatusCode::NO_CONTENT));
    assert!(rec.body().is_empty());
}

#[test]
fn wrapped_endpoints_are_middleware() {
    let chain = Chain::default()
        .with(wrap(endpoint_fn(|rw, _req| {
            rw.headers_mut().insert("x-a", HeaderValue::from_static("1"));
            Ok(())
        })))
        .with(wrap_fn(|rw, _req| {
            rw.headers_mut().insert("x-b", HeaderValue::from_static("2"));
            Ok(())
        }))
        .with(from_fn(|rw, _req, _next| {
            rw.write_str("done")?;
            Ok(())
        }));

    let mut rec = Recorder::new();
    chain.serve(&mut rec, &get("/")).unwrap();
    assert_eq!(rec.header("x-a"), Some("1"));
    assert_eq!(rec.header("x-b"), Some("2"));
    assert_eq!(rec.body_str(), "done");
}

#[test]
fn absent_units_are_rejected() {
    let chain = Chain::default();
    let missing: Option<BoxedHandler> = None;
    assert!(matches!(chain.append(missing), Err(Error::InvalidUnit)));
}

#[test]
fn concurrent_execution_while_appending() {
    let hits = Arc::new(Mutex::new(0_usize));
    let chain = Arc::new(Chain::default().with({
        let hits = Arc::clone(&hits);
        from_fn(move |rw, req, next| {
            *hits.lock().unwrap() += 1;
            next.run(rw, req)
        })
    }));

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let chain = Arc::clone(&chain);
            thread::spawn(move || {
                for _ in 0..50 {
                    let mut rec = Recorder::new();
                    chain.execute(&mut rec, &get("/")).unwrap();
                }
                if i % 2 == 0 {
                    chain.append(from_fn(|rw, req, next| next.run(rw, req)).boxed()).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(*hits.lock().unwrap(), 400);
    assert_eq!(chain.len(), 5);
}

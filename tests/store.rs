//! Request store behaviour across threads and chains.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use braid::{Chain, ClearOnExit, Endpoint, Recorder, Request, RequestId, Store, Value, from_fn};
use http::Method;

#[test]
fn requests_do_not_see_each_other() {
    let store = Arc::new(Store::<Value>::new());

    let workers: Vec<_> = (0..8_i64)
        .map(|n| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                let id = RequestId::new();
                for k in 0..100 {
                    store.set(id, format!("k{k}"), n);
                }
                let all = store.get_all(id).unwrap();
                assert_eq!(all.len(), 100);
                assert!(all.values().all(|v| *v == Value::Int(n)));
                store.clear(id);
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(store.is_empty());
}

#[test]
fn purge_reports_what_it_removed() {
    let store = Store::<Value>::new();
    let ids: Vec<_> = (0..4).map(|_| RequestId::new()).collect();
    for id in &ids {
        store.set(*id, "k", Value::Null);
    }

    assert_eq!(store.purge(Duration::from_secs(60 * 60)), 0);
    assert_eq!(store.len(), 4);
    assert_eq!(store.purge(Duration::ZERO), 4);
    assert_eq!(store.purge(Duration::ZERO), 0);
}

#[test]
fn clear_on_exit_empties_the_store_after_each_request() {
    let store = Arc::new(Store::<Value>::new());
    let seen = Arc::new(std::sync::Mutex::new(HashMap::new()));
    let chain = Chain::default()
        .with(ClearOnExit::new(Arc::clone(&store)))
        .with({
            let store = Arc::clone(&store);
            from_fn(move |rw, req, next| {
                store.set(req.id(), "path", req.path());
                next.run(rw, req)
            })
        })
        .with({
            let store = Arc::clone(&store);
            let seen = Arc::clone(&seen);
            from_fn(move |_rw, req, _next| {
                let (bag, ok) = store.get_all_ok(req.id());
                assert!(ok);
                seen.lock().unwrap().extend(bag);
                Ok(())
            })
        });

    let mut rec = Recorder::new();
    chain.execute(&mut rec, &Request::new(Method::GET, "/a")).unwrap();

    assert!(store.is_empty());
    assert_eq!(seen.lock().unwrap().get("path"), Some(&Value::from("/a")));
}

#[test]
fn wrap_with_cleanup_clears_after_a_fault() {
    let store = Arc::new(Store::<Value>::new());
    let chain = Chain::default().with({
        let store = Arc::clone(&store);
        from_fn(move |_rw, req, _next| {
            store.set(req.id(), "tmp", 1);
            Err("aborted".into())
        })
    });
    let endpoint = store.wrap_with_cleanup(chain);

    let mut rec = Recorder::new();
    let fault = endpoint.serve(&mut rec, &Request::new(Method::GET, "/")).unwrap_err();
    assert_eq!(fault.message(), "aborted");
    assert!(store.is_empty());
}

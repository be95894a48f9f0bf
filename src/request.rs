//! Inbound HTTP request, as seen by chain units.
//!
//! Units only ever read a request. Each one carries a [`RequestId`] minted at
//! construction, which is how the [`Store`](crate::Store) tells in-flight
//! requests apart.

use std::fmt;

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use uuid::Uuid;

/// Identity of one in-flight request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self { Self(Uuid::new_v4()) }
}

impl Default for RequestId {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An inbound HTTP request.
#[derive(Debug)]
pub struct Request {
    id: RequestId,
    method: Method,
    path: String,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
}

impl Request {
    /// Builds a request from a method and a request target such as
    /// `/users?page=2`. The target is split at the first `?`; an empty query
    /// is treated as no query.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, (!query.is_empty()).then(|| query.to_owned())),
            None => (target, None),
        };
        Self {
            id: RequestId::new(),
            method,
            path: path.to_owned(),
            query,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Converts a fully-buffered transport request.
    pub fn from_http(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self {
            id: RequestId::new(),
            method: parts.method,
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().filter(|q| !q.is_empty()).map(str::to_owned),
            headers: parts.headers,
            body,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn id(&self) -> RequestId { self.id }
    pub fn method(&self) -> &Method { &self.method }
    pub fn path(&self) -> &str { &self.path }
    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> { self.query.as_deref() }
    pub fn headers(&self) -> &HeaderMap { &self.headers }
    pub fn body(&self) -> &[u8] { &self.body }

    /// Header lookup; `None` if missing or not valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_split_into_path_and_query() {
        let req = Request::new(Method::GET, "/users?page=2&sort=asc");
        assert_eq!(req.path(), "/users");
        assert_eq!(req.query(), Some("page=2&sort=asc"));

        let req = Request::new(Method::GET, "/users?");
        assert_eq!(req.path(), "/users");
        assert_eq!(req.query(), None);
    }

    #[test]
    fn from_http_keeps_headers_and_body() {
        let req = http::Request::builder()
            .method(Method::POST)
            .uri("http://example.com/items?x=1")
            .header("content-type", "application/json")
            .body(Bytes::from_static(b"{}"))
            .unwrap();
        let req = Request::from_http(req);

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.path(), "/items");
        assert_eq!(req.query(), Some("x=1"));
        assert_eq!(req.header("Content-Type"), Some("application/json"));
        assert_eq!(req.body(), b"{}");
    }

    #[test]
    fn every_request_gets_its_own_id() {
        let a = Request::new(Method::GET, "/");
        let b = Request::new(Method::GET, "/");
        assert_ne!(a.id(), b.id());
    }
}

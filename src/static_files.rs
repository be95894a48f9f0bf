//! Static asset unit.
//!
//! [`Static`] serves files from a [`FileSystem`] when the request names one,
//! and otherwise hands the request to the next unit. It is not a file server:
//! a missing file never produces a 404 here, so it composes with whatever
//! comes after it.

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, LAST_MODIFIED, LOCATION};
use http::{Method, StatusCode};
use tracing::debug;

use crate::chain::Next;
use crate::error::Outcome;
use crate::handler::Handler;
use crate::request::Request;
use crate::writer::ResponseWriter;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Dir,
}

/// What a [`FileSystem`] knows about a path.
#[derive(Clone, Copy, Debug)]
pub struct Metadata {
    pub kind: EntryKind,
    pub len: u64,
    pub modified: Option<SystemTime>,
}

impl Metadata {
    pub fn is_dir(&self) -> bool { self.kind == EntryKind::Dir }
}

/// Read-only view of a tree of files addressed by `/`-separated paths.
pub trait FileSystem: Send + Sync + 'static {
    fn metadata(&self, path: &str) -> io::Result<Metadata>;
    fn read(&self, path: &str) -> io::Result<Bytes>;
}

// ── Dir ───────────────────────────────────────────────────────────────────────

/// A directory on the local disk.
///
/// Every segment must name a plain entry under the root. `..`, drive
/// prefixes such as `C:` and anything else the platform reads as more than a
/// single normal component is refused with `PermissionDenied`.
#[derive(Clone, Debug)]
pub struct Dir {
    root: PathBuf,
}

impl Dir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path { &self.root }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut full = self.root.clone();
        for segment in path.split(['/', '\\']) {
            if segment.is_empty() || segment == "." {
                continue;
            }
            let mut parts = Path::new(segment).components();
            match (parts.next(), parts.next()) {
                (Some(Component::Normal(name)), None) => full.push(name),
                _ => return Err(io::Error::new(io::ErrorKind::PermissionDenied, "path escapes root")),
            }
        }
        Ok(full)
    }
}

impl FileSystem for Dir {
    fn metadata(&self, path: &str) -> io::Result<Metadata> {
        let meta = std::fs::metadata(self.resolve(path)?)?;
        Ok(Metadata {
            kind: if meta.is_dir() { EntryKind::Dir } else { EntryKind::File },
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    fn read(&self, path: &str) -> io::Result<Bytes> {
        std::fs::read(self.resolve(path)?).map(Bytes::from)
    }
}

// ── MemoryFs ──────────────────────────────────────────────────────────────────

/// An in-memory tree. Directories exist implicitly above every file.
#[derive(Clone, Debug, Default)]
pub struct MemoryFs {
    files: HashMap<String, (Bytes, Option<SystemTime>)>,
}

impl MemoryFs {
    pub fn new() -> Self { Self::default() }

    pub fn file(mut self, path: &str, contents: impl Into<Bytes>) -> Self {
        self.files.insert(normalize(path), (contents.into(), None));
        self
    }

    pub fn file_modified_at(mut self, path: &str, contents: impl Into<Bytes>, modified: SystemTime) -> Self {
        self.files.insert(normalize(path), (contents.into(), Some(modified)));
        self
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{trimmed}")
}

fn not_found() -> io::Error {
    io::Error::from(io::ErrorKind::NotFound)
}

impl FileSystem for MemoryFs {
    fn metadata(&self, path: &str) -> io::Result<Metadata> {
        let path = normalize(path);
        if let Some((contents, modified)) = self.files.get(&path) {
            return Ok(Metadata { kind: EntryKind::File, len: contents.len() as u64, modified: *modified });
        }
        let dir = if path == "/" { path } else { format!("{path}/") };
        if self.files.keys().any(|k| k.starts_with(&dir)) {
            Ok(Metadata { kind: EntryKind::Dir, len: 0, modified: None })
        } else {
            Err(not_found())
        }
    }

    fn read(&self, path: &str) -> io::Result<Bytes> {
        self.files.get(&normalize(path)).map(|(c, _)| c.clone()).ok_or_else(not_found)
    }
}

// ── Static ────────────────────────────────────────────────────────────────────

/// Chain unit that serves files from `fs` for `GET` and `HEAD` requests.
///
/// ```rust
/// use braid::{Chain, Dir, Static};
///
/// let chain = Chain::default().with(Static::new(Dir::new("public")).prefix("/assets"));
/// ```
pub struct Static<F> {
    fs: F,
    prefix: String,
    index_file: String,
}

impl<F: FileSystem> Static<F> {
    pub fn new(fs: F) -> Self {
        Self { fs, prefix: String::new(), index_file: "index.html".to_owned() }
    }

    /// Only serve paths under `prefix`, with the prefix stripped.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// File served for directory paths ending in `/`.
    pub fn index_file(mut self, name: impl Into<String>) -> Self {
        self.index_file = name.into();
        self
    }

    /// The file path inside `fs`, or `None` if the request is not ours.
    fn file_path<'r>(&self, req: &'r Request) -> Option<&'r str> {
        let path = req.path();
        if self.prefix.is_empty() {
            return Some(path);
        }
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        Some(rest)
    }
}

impl<F: FileSystem> Handler for Static<F> {
    fn handle(&self, rw: &mut ResponseWriter<'_>, req: &Request, next: Next<'_>) -> Outcome {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return next.run(rw, req);
        }
        let Some(file) = self.file_path(req) else {
            return next.run(rw, req);
        };
        let Ok(mut meta) = self.fs.metadata(file) else {
            return next.run(rw, req);
        };

        let mut file = file.to_owned();
        if meta.is_dir() {
            if !req.path().ends_with('/') {
                return redirect(rw, req, &format!("{}/", req.path()));
            }
            file = format!("{}/{}", file.trim_end_matches('/'), self.index_file);
            match self.fs.metadata(&file) {
                Ok(index) if !index.is_dir() => meta = index,
                _ => return next.run(rw, req),
            }
        }

        let contents = match self.fs.read(&file) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path = %file, error = %e, "static file unreadable, deferring");
                return next.run(rw, req);
            }
        };

        let headers = rw.headers_mut();
        if !headers.contains_key(CONTENT_TYPE) {
            let mime = mime_guess::from_path(&file).first_or_octet_stream();
            if let Ok(value) = HeaderValue::from_str(mime.essence_str()) {
                headers.insert(CONTENT_TYPE, value);
            }
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(contents.len()));
        if let Some(modified) = meta.modified {
            if let Ok(value) = HeaderValue::from_str(&http_date(modified)) {
                headers.insert(LAST_MODIFIED, value);
            }
        }

        rw.set_status(StatusCode::OK);
        if req.method() == Method::GET {
            rw.write(&contents)?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Static"
    }
}

fn redirect(rw: &mut ResponseWriter<'_>, req: &Request, location: &str) -> Outcome {
    let value = HeaderValue::from_str(location).map_err(|e| e.to_string())?;
    rw.headers_mut().insert(LOCATION, value);
    rw.set_status(StatusCode::FOUND);
    if req.method() == Method::GET {
        if !rw.headers().contains_key(CONTENT_TYPE) {
            rw.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        }
        writeln!(rw, "<a href=\"{}\">Found</a>.", html_escape::encode_double_quoted_attribute(location))?;
    }
    Ok(())
}

/// IMF-fixdate, as used by `Last-Modified`.
fn http_date(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::chain::Chain;
    use crate::handler::from_fn;
    use crate::sink::Recorder;

    fn fallback(rw: &mut ResponseWriter<'_>, _req: &Request, _next: Next<'_>) -> Outcome {
        rw.set_status(StatusCode::NOT_FOUND);
        rw.write_str("fallback")?;
        Ok(())
    }

    fn site() -> MemoryFs {
        MemoryFs::new()
            .file("/index.html", "<h1>home</h1>")
            .file("/css/site.css", "body{}")
            .file("/docs/index.html", "docs")
            .file("/empty/readme.txt", "nothing")
            .file_modified_at("/robots.txt", "User-agent: *", SystemTime::UNIX_EPOCH + Duration::from_secs(784_111_777))
    }

    fn serve(unit: Static<MemoryFs>, method: Method, target: &str) -> Recorder {
        let chain = Chain::default().with(unit).with(fallback);
        let mut rec = Recorder::new();
        chain.execute(&mut rec, &Request::new(method, target)).unwrap();
        rec
    }

    #[test]
    fn serves_files_with_type_and_length() {
        let rec = serve(Static::new(site()), Method::GET, "/css/site.css");
        assert_eq!(rec.status(), Some(StatusCode::OK));
        assert_eq!(rec.header("content-type"), Some("text/css"));
        assert_eq!(rec.header("content-length"), Some("6"));
        assert_eq!(rec.body_str(), "body{}");
    }

    #[test]
    fn last_modified_is_an_http_date() {
        let rec = serve(Static::new(site()), Method::GET, "/robots.txt");
        assert_eq!(rec.header("last-modified"), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
    }

    #[test]
    fn head_has_headers_but_no_body() {
        let rec = serve(Static::new(site()), Method::HEAD, "/css/site.css");
        assert_eq!(rec.status(), Some(StatusCode::OK));
        assert_eq!(rec.header("content-length"), Some("6"));
        assert!(rec.body().is_empty());
    }

    #[test]
    fn other_methods_defer() {
        let rec = serve(Static::new(site()), Method::POST, "/css/site.css");
        assert_eq!(rec.body_str(), "fallback");
    }

    #[test]
    fn missing_files_defer() {
        let rec = serve(Static::new(site()), Method::GET, "/nope.js");
        assert_eq!(rec.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(rec.body_str(), "fallback");
    }

    #[test]
    fn directories_redirect_to_trailing_slash() {
        let rec = serve(Static::new(site()), Method::GET, "/docs");
        assert_eq!(rec.status(), Some(StatusCode::FOUND));
        assert_eq!(rec.header("location"), Some("/docs/"));
    }

    #[test]
    fn directories_serve_their_index() {
        let rec = serve(Static::new(site()), Method::GET, "/docs/");
        assert_eq!(rec.body_str(), "docs");

        let rec = serve(Static::new(site()), Method::GET, "/");
        assert_eq!(rec.body_str(), "<h1>home</h1>");
        assert_eq!(rec.header("content-type"), Some("text/html"));
    }

    #[test]
    fn directories_without_index_defer() {
        let rec = serve(Static::new(site()), Method::GET, "/empty/");
        assert_eq!(rec.body_str(), "fallback");
    }

    #[test]
    fn custom_index_file() {
        let unit = Static::new(site()).index_file("readme.txt");
        let rec = serve(unit, Method::GET, "/empty/");
        assert_eq!(rec.body_str(), "nothing");
    }

    #[test]
    fn prefix_is_stripped() {
        let rec = serve(Static::new(site()).prefix("/assets"), Method::GET, "/assets/css/site.css");
        assert_eq!(rec.body_str(), "body{}");

        let rec = serve(Static::new(site()).prefix("/assets"), Method::GET, "/css/site.css");
        assert_eq!(rec.body_str(), "fallback");

        // `/assetsfoo` is not under `/assets`.
        let rec = serve(Static::new(site()).prefix("/assets"), Method::GET, "/assetscss/site.css");
        assert_eq!(rec.body_str(), "fallback");
    }

    #[test]
    fn existing_content_type_is_kept() {
        let chain = Chain::default()
            .with(from_fn(|rw, req, next| {
                rw.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("text/x-custom"));
                next.run(rw, req)
            }))
            .with(Static::new(site()));
        let mut rec = Recorder::new();
        chain.execute(&mut rec, &Request::new(Method::GET, "/css/site.css")).unwrap();
        assert_eq!(rec.header("content-type"), Some("text/x-custom"));
    }

    #[test]
    fn dir_serves_from_disk_and_refuses_traversal() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("hello.txt"), "hi from disk").unwrap();
        let dir = Dir::new(root.path());

        assert_eq!(dir.read("/hello.txt").unwrap(), Bytes::from_static(b"hi from disk"));
        assert!(dir.metadata("/").unwrap().is_dir());
        assert_eq!(
            dir.metadata("/../etc/passwd").unwrap_err().kind(),
            io::ErrorKind::PermissionDenied,
        );

        let chain = Chain::default().with(Static::new(dir)).with(fallback);
        let mut rec = Recorder::new();
        chain.execute(&mut rec, &Request::new(Method::GET, "/hello.txt")).unwrap();
        assert_eq!(rec.body_str(), "hi from disk");
        assert_eq!(rec.header("content-type"), Some("text/plain"));
        assert!(rec.header("last-modified").is_some());
    }

    #[test]
    fn dir_ignores_empty_and_current_segments() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("css")).unwrap();
        std::fs::write(root.path().join("css").join("site.css"), "body{}").unwrap();
        let dir = Dir::new(root.path());

        assert_eq!(dir.read("//./css/./site.css").unwrap(), Bytes::from_static(b"body{}"));
        assert_eq!(dir.read("/css/../css/site.css").unwrap_err().kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(dir.read("/css\\..\\..\\secret").unwrap_err().kind(), io::ErrorKind::PermissionDenied);
    }

    #[cfg(windows)]
    #[test]
    fn dir_refuses_drive_prefixes() {
        let root = tempfile::tempdir().unwrap();
        let dir = Dir::new(root.path());

        for path in ["/C:/Windows/win.ini", "/C:", "/c:secret.txt"] {
            assert_eq!(dir.metadata(path).unwrap_err().kind(), io::ErrorKind::PermissionDenied, "{path}");
        }
    }
}

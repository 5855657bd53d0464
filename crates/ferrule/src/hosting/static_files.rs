use std::{
    collections::HashMap,
    fs::{self, File},
    io,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use http::StatusCode;
use memmap2::Mmap;
use tracing::{debug, trace, warn};

use super::{mime_type, HostingError, RequestHandler};
use crate::{ContentRange, Method, Request, Response};

/// Serves files below a document root. Only GET and HEAD are answered;
/// other methods on an existing file get a 405.
pub struct StaticHosting {
    root: PathBuf,
    cache: MappedFileCache,
}

impl StaticHosting {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, HostingError> {
        let root = root.as_ref();
        if root.as_os_str().is_empty() || root == Path::new("/") {
            return Err(HostingError::UnsafeRoot);
        }

        let root = fs::canonicalize(root).map_err(|source| HostingError::Root {
            path: root.to_path_buf(),
            source,
        })?;
        if root == Path::new("/") {
            return Err(HostingError::UnsafeRoot);
        }
        if !root.is_dir() {
            return Err(HostingError::NotADirectory(root));
        }

        debug!(root = %root.display(), "serving static files");
        Ok(Self {
            root,
            cache: MappedFileCache::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &MappedFileCache {
        &self.cache
    }

    /// Maps a URL path onto a regular file strictly inside the root.
    /// Directories resolve to their `index.html`.
    fn resolve(&self, url_path: &str) -> Option<PathBuf> {
        if !url_path.starts_with('/') {
            return None;
        }

        let candidate = self.root.join(url_path.trim_start_matches('/'));
        let mut full = fs::canonicalize(candidate).ok()?;
        if full.is_dir() {
            full = fs::canonicalize(full.join("index.html")).ok()?;
        }

        if full == self.root || !full.starts_with(&self.root) {
            debug!(%url_path, resolved = %full.display(), "path escapes the document root");
            return None;
        }
        full.is_file().then_some(full)
    }

    fn respond_with(&self, request: &Request, path: &Path, file: &MappedFile) -> Response {
        let len = file.len();
        let mut res = Response {
            status: StatusCode::OK,
            accept_ranges: true,
            content_type: Some(mime_type(path).into()),
            etag: Some(file.etag()),
            last_modified: file.modified(),
            ..Default::default()
        };

        let body = match request.ranges.as_slice() {
            [range] => match range.resolve(len) {
                Some((start, end)) => {
                    res.status = StatusCode::PARTIAL_CONTENT;
                    res.content_range = Some(ContentRange::Bytes {
                        start,
                        end,
                        size: len,
                    });
                    file.bytes().slice(start as usize..=end as usize)
                }
                None => {
                    let mut res = Response::error(StatusCode::RANGE_NOT_SATISFIABLE);
                    res.content_range = Some(ContentRange::Unsatisfied { size: len });
                    return res;
                }
            },
            // several ranges: we don't do multipart, send everything
            _ => file.bytes().clone(),
        };

        res.content_length = Some(body.len() as u64);
        if request.method != Method::Head {
            res.body = body;
        }
        res
    }
}

impl RequestHandler for StaticHosting {
    fn handle(&self, request: &Request) -> Option<Response> {
        let path = self.resolve(request.path_only())?;

        if !matches!(request.method, Method::Get | Method::Head) {
            return Some(Response::error(StatusCode::METHOD_NOT_ALLOWED));
        }

        match self.cache.get(&path) {
            Ok(file) => Some(self.respond_with(request, &path, &file)),
            Err(e) => {
                warn!(path = %path.display(), "could not map file: {e}");
                Some(Response::error(StatusCode::INTERNAL_SERVER_ERROR))
            }
        }
    }
}

/// A whole file, mapped read-only.
pub struct MappedFile {
    bytes: Bytes,
    modified: Option<SystemTime>,
}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let meta = file.metadata()?;

        let bytes = if meta.len() == 0 {
            // zero-length mappings are rejected by the kernel
            Bytes::new()
        } else {
            // SAFETY: the mapping is read-only. Files are assumed not to be
            // truncated while they are being served.
            let map = unsafe { Mmap::map(&file)? };
            Bytes::from_owner(map)
        };

        Ok(Self {
            bytes,
            modified: meta.modified().ok(),
        })
    }

    /// The file contents. Slices of it share the mapping.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn modified(&self) -> Option<SystemTime> {
        self.modified
    }

    /// Strong validator built from length and modification time.
    pub fn etag(&self) -> String {
        let mtime = self
            .modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        format!("\"{:x}-{:x}\"", self.len(), mtime)
    }
}

/// Mapped files by canonical path, shared by every acceptor thread. Files
/// stay mapped for the life of the process; there is no eviction.
#[derive(Default)]
pub struct MappedFileCache {
    files: RwLock<HashMap<PathBuf, Arc<MappedFile>>>,
}

impl MappedFileCache {
    pub fn get(&self, path: &Path) -> io::Result<Arc<MappedFile>> {
        {
            let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(file) = files.get(path) {
                return Ok(file.clone());
            }
        }

        let mapped = Arc::new(MappedFile::open(path)?);
        trace!(path = %path.display(), len = mapped.len(), "mapped file");

        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        // another thread may have mapped it meanwhile; keep the first one
        Ok(files.entry(path.to_path_buf()).or_insert(mapped).clone())
    }

    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use http::StatusCode;
    use pretty_assertions::assert_eq;

    use super::StaticHosting;
    use crate::{
        hosting::{HostingError, RequestHandler},
        ByteRange, ContentRange, Method, Request,
    };

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "hello world").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();
        fs::write(dir.path().join("docs/index.html"), "<h1>docs</h1>").unwrap();
        fs::write(dir.path().join("docs/data.json"), "{}").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        dir
    }

    fn get(path: &str) -> Request {
        Request {
            method: Method::Get,
            path: path.into(),
            ..Default::default()
        }
    }

    #[test]
    fn root_must_be_a_real_directory() {
        assert!(matches!(StaticHosting::new(""), Err(HostingError::UnsafeRoot)));
        assert!(matches!(StaticHosting::new("/"), Err(HostingError::UnsafeRoot)));

        let dir = site();
        assert!(matches!(
            StaticHosting::new(dir.path().join("index.html")),
            Err(HostingError::NotADirectory(_))
        ));
        assert!(matches!(
            StaticHosting::new(dir.path().join("missing")),
            Err(HostingError::Root { .. })
        ));
    }

    #[test]
    fn directories_serve_their_index() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();

        let res = hosting.handle(&get("/")).unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.content_type.as_deref(), Some("text/html"));
        assert_eq!(res.content_length, Some(11));
        assert_eq!(&res.body[..], b"hello world");
        assert!(res.accept_ranges);
        assert!(res.etag.is_some());

        let res = hosting.handle(&get("/docs")).unwrap();
        assert_eq!(&res.body[..], b"<h1>docs</h1>");

        let res = hosting.handle(&get("/docs/data.json?v=2")).unwrap();
        assert_eq!(res.content_type.as_deref(), Some("application/json"));
    }

    #[test]
    fn missing_files_fall_through() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();
        assert!(hosting.handle(&get("/nope.html")).is_none());
        assert!(hosting.handle(&get("/index.html/")).is_none());
        assert!(hosting.handle(&get("*")).is_none());
    }

    #[test]
    fn paths_cannot_escape_the_root() {
        let outer = tempfile::tempdir().unwrap();
        fs::write(outer.path().join("secret.txt"), "secret").unwrap();
        let root = outer.path().join("www");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("index.html"), "public").unwrap();
        std::os::unix::fs::symlink(outer.path().join("secret.txt"), root.join("link.txt"))
            .unwrap();

        let hosting = StaticHosting::new(&root).unwrap();
        assert!(hosting.handle(&get("/../secret.txt")).is_none());
        assert!(hosting.handle(&get("/./../www/../secret.txt")).is_none());
        assert!(hosting.handle(&get("/link.txt")).is_none());
        assert!(hosting.handle(&get("/index.html")).is_some());
    }

    #[test]
    fn head_keeps_the_length_but_not_the_body() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();
        let req = Request {
            method: Method::Head,
            ..get("/index.html")
        };
        let res = hosting.handle(&req).unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.content_length, Some(11));
        assert!(res.body.is_empty());
    }

    #[test]
    fn other_methods_are_not_allowed() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();
        for method in [Method::Unknown, Method::Post, Method::Options] {
            let req = Request {
                method,
                ..get("/index.html")
            };
            let res = hosting.handle(&req).unwrap();
            assert_eq!(res.status, StatusCode::METHOD_NOT_ALLOWED);
        }
    }

    #[test]
    fn single_ranges_are_honoured() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();

        let req = Request {
            ranges: vec![ByteRange::FromTo(0, 4)],
            ..get("/index.html")
        };
        let res = hosting.handle(&req).unwrap();
        assert_eq!(res.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(&res.body[..], b"hello");
        assert_eq!(res.content_length, Some(5));
        assert_eq!(
            res.content_range,
            Some(ContentRange::Bytes {
                start: 0,
                end: 4,
                size: 11
            })
        );

        let req = Request {
            ranges: vec![ByteRange::Suffix(5)],
            ..get("/index.html")
        };
        assert_eq!(&hosting.handle(&req).unwrap().body[..], b"world");

        let req = Request {
            ranges: vec![ByteRange::From(100)],
            ..get("/index.html")
        };
        let res = hosting.handle(&req).unwrap();
        assert_eq!(res.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(res.content_range, Some(ContentRange::Unsatisfied { size: 11 }));
    }

    #[test]
    fn files_are_mapped_once() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();
        hosting.handle(&get("/")).unwrap();
        hosting.handle(&get("/index.html")).unwrap();
        assert_eq!(hosting.cache().len(), 1);

        let path = hosting.root().join("index.html");
        let a = hosting.cache().get(&path).unwrap();
        let b = hosting.cache().get(&path).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn empty_files_are_served() {
        let dir = site();
        let hosting = StaticHosting::new(dir.path()).unwrap();
        let res = hosting.handle(&get("/empty.txt")).unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.content_length, Some(0));
        assert_eq!(res.content_type.as_deref(), Some("text/plain"));
    }
}

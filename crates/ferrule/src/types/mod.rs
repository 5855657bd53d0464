use std::{borrow::Cow, fmt, time::SystemTime};

use bytes::Bytes;
use http::{StatusCode, Version};
use tracing::debug;

mod headers;
pub use headers::*;

mod method;
pub use method::*;

/// What the peer (or the handler) wants done with the connection once the
/// current exchange is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionPref {
    /// Nothing was said either way
    #[default]
    None,
    KeepAlive,
    Close,
    /// A `Connection` header carrying neither token
    Unknown,
}

impl ConnectionPref {
    /// Parses a `Connection` header value, which is a comma-separated token
    /// list.
    pub fn parse(value: &str) -> Self {
        let mut pref = ConnectionPref::Unknown;
        for token in value.split(',').map(str::trim) {
            if token.eq_ignore_ascii_case("close") {
                return ConnectionPref::Close;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                pref = ConnectionPref::KeepAlive;
            }
        }
        pref
    }
}

/// One entry of a `Range: bytes=...` request header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// `first-last`, both inclusive
    FromTo(u64, u64),
    /// `first-`
    From(u64),
    /// `-len`: the last `len` bytes
    Suffix(u64),
}

impl ByteRange {
    /// Clamps the range to an entity of `len` bytes, returning inclusive
    /// bounds, or `None` if no byte of the entity is selected.
    pub fn resolve(&self, len: u64) -> Option<(u64, u64)> {
        if len == 0 {
            return None;
        }
        match *self {
            ByteRange::FromTo(first, last) if first <= last && first < len => {
                Some((first, last.min(len - 1)))
            }
            ByteRange::From(first) if first < len => Some((first, len - 1)),
            ByteRange::Suffix(n) if n > 0 => Some((len - n.min(len), len - 1)),
            _ => None,
        }
    }
}

/// An HTTP request, reduced to the fields the hosting layer looks at.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,

    /// Path and query, as sent
    pub path: String,

    pub version: Version,

    pub host: String,
    pub connection: ConnectionPref,
    pub user_agent: String,
    pub accept: String,
    pub accept_charset: String,
    pub accept_encoding: String,
    pub cookie: String,
    pub referer: String,
    pub dnt: bool,
    pub upgrade_insecure: bool,
    pub ranges: Vec<ByteRange>,

    /// HTTP/2 stream the request arrived on, 0 over HTTP/1.x
    pub stream_id: u32,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            method: Method::Unknown,
            path: String::new(),
            version: Version::HTTP_11,
            host: String::new(),
            connection: ConnectionPref::None,
            user_agent: String::new(),
            accept: String::new(),
            accept_charset: String::new(),
            accept_encoding: String::new(),
            cookie: String::new(),
            referer: String::new(),
            dnt: false,
            upgrade_insecure: false,
            ranges: Vec::new(),
            stream_id: 0,
        }
    }
}

impl Request {
    /// The path without its query string or fragment.
    pub fn path_only(&self) -> &str {
        let end = self.path.find(['?', '#']).unwrap_or(self.path.len());
        &self.path[..end]
    }

    /// Whether the connection stays open after this exchange.
    pub fn wants_keep_alive(&self) -> bool {
        match self.connection {
            ConnectionPref::Close => false,
            ConnectionPref::KeepAlive => true,
            _ => self.version != Version::HTTP_10,
        }
    }
}

/// `Content-Range` of a partial (206) or unsatisfiable (416) response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRange {
    /// `bytes start-end/size`, bounds inclusive
    Bytes { start: u64, end: u64, size: u64 },
    /// `bytes */size`
    Unsatisfied { size: u64 },
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentRange::Bytes { start, end, size } => write!(f, "bytes {start}-{end}/{size}"),
            ContentRange::Unsatisfied { size } => write!(f, "bytes */{size}"),
        }
    }
}

/// An HTTP response. Optional fields are only serialized when set.
#[derive(Clone)]
pub struct Response {
    pub status: StatusCode,

    /// Overrides the canonical reason phrase of `status`
    pub reason: Option<Cow<'static, str>>,

    pub connection: ConnectionPref,
    pub accept_ranges: bool,
    pub content_encoding: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<Cow<'static, str>>,
    pub content_range: Option<ContentRange>,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub location: Option<String>,
    pub set_cookie: Option<String>,

    /// Tracking status value (`Tk`), a single character
    pub tk: Option<char>,

    /// Shared view of the payload: static text, a slice of a mapped file,
    /// or owned bytes. Cloning never copies.
    pub body: Bytes,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            reason: None,
            connection: ConnectionPref::None,
            accept_ranges: false,
            content_encoding: None,
            content_length: None,
            content_type: None,
            content_range: None,
            etag: None,
            last_modified: None,
            location: None,
            set_cookie: None,
            tk: None,
            body: Bytes::new(),
        }
    }
}

impl Response {
    /// A response carrying `body`, with a matching content-length.
    pub fn with_body(
        status: StatusCode,
        content_type: impl Into<Cow<'static, str>>,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            content_type: Some(content_type.into()),
            content_length: Some(body.len() as u64),
            body,
            ..Default::default()
        }
    }

    /// One of the fixed plain-text error responses.
    pub fn error(status: StatusCode) -> Self {
        let text: &'static str = match status {
            StatusCode::BAD_REQUEST => "Bad Request",
            StatusCode::NOT_FOUND => "Not Found",
            StatusCode::METHOD_NOT_ALLOWED => "Method Not Allowed",
            StatusCode::RANGE_NOT_SATISFIABLE => "Range Not Satisfiable",
            _ => "Internal Server Error",
        };
        let status = if status.is_client_error() || status.is_server_error() {
            status
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        Self::with_body(status, "text/plain", Bytes::from_static(text.as_bytes()))
    }

    pub fn not_found() -> Self {
        Self::error(StatusCode::NOT_FOUND)
    }

    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => self.status.canonical_reason().unwrap_or("Unknown"),
        }
    }

    pub(crate) fn debug_print(&self) {
        debug!(status = %self.status, body_len = self.body.len(), "sending response");
        for (field, value) in self.fields() {
            debug!(name = field.title(), %value, "response header");
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("body_len", &self.body.len())
            .finish_non_exhaustive()
    }
}

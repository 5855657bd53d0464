use std::borrow::Cow;

use smallvec::SmallVec;
use tracing::trace;

use super::{ByteRange, ConnectionPref, Request, Response};

impl Request {
    /// Records one request header. Both protocol versions go through here;
    /// names match case-insensitively and headers we don't use are dropped.
    pub fn apply_header(&mut self, name: &[u8], value: &[u8]) {
        let value = String::from_utf8_lossy(value);
        let value = value.trim();

        let Ok(name) = std::str::from_utf8(name) else {
            return;
        };
        let is = |known: &str| name.eq_ignore_ascii_case(known);

        if is("host") {
            self.host = value.to_owned();
        } else if is("connection") {
            self.connection = ConnectionPref::parse(value);
        } else if is("user-agent") {
            self.user_agent = value.to_owned();
        } else if is("accept") {
            self.accept = value.to_owned();
        } else if is("accept-charset") {
            self.accept_charset = value.to_owned();
        } else if is("accept-encoding") {
            self.accept_encoding = value.to_owned();
        } else if is("cookie") {
            // HTTP/2 peers may split cookies over several fields
            if !self.cookie.is_empty() {
                self.cookie.push_str("; ");
            }
            self.cookie.push_str(value);
        } else if is("dnt") {
            self.dnt = value == "1";
        } else if is("upgrade-insecure-requests") {
            self.upgrade_insecure = value == "1";
        } else if is("referer") {
            self.referer = value.to_owned();
        } else if is("range") {
            self.ranges = parse_ranges(value);
        } else {
            trace!(%name, "ignoring header");
        }
    }
}

/// Parses `bytes=a-b, c-, -n`. Any malformed entry voids the whole header,
/// which then behaves as if it were absent.
pub fn parse_ranges(value: &str) -> Vec<ByteRange> {
    let Some((unit, spec)) = value.split_once('=') else {
        return Vec::new();
    };
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Vec::new();
    }

    let mut ranges = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((first, last)) = part.split_once('-') else {
            return Vec::new();
        };
        let range = match (first.trim(), last.trim()) {
            ("", "") => return Vec::new(),
            ("", n) => match n.parse() {
                Ok(n) => ByteRange::Suffix(n),
                Err(_) => return Vec::new(),
            },
            (first, "") => match first.parse() {
                Ok(first) => ByteRange::From(first),
                Err(_) => return Vec::new(),
            },
            (first, last) => match (first.parse(), last.parse()) {
                (Ok(first), Ok(last)) => ByteRange::FromTo(first, last),
                _ => return Vec::new(),
            },
        };
        ranges.push(range);
    }
    ranges
}

/// Response header fields, in the order they are serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    AcceptRanges,
    Connection,
    ContentEncoding,
    ContentLength,
    ContentType,
    ContentRange,
    ETag,
    LastModified,
    Location,
    SetCookie,
    Tk,
}

impl Field {
    /// Name as written on an HTTP/1.1 wire
    pub(crate) fn title(self) -> &'static str {
        match self {
            Field::AcceptRanges => "Accept-Ranges",
            Field::Connection => "Connection",
            Field::ContentEncoding => "Content-Encoding",
            Field::ContentLength => "Content-Length",
            Field::ContentType => "Content-Type",
            Field::ContentRange => "Content-Range",
            Field::ETag => "ETag",
            Field::LastModified => "Last-Modified",
            Field::Location => "Location",
            Field::SetCookie => "Set-Cookie",
            Field::Tk => "Tk",
        }
    }

    /// Name as HTTP/2 requires it
    pub(crate) fn lower(self) -> &'static str {
        match self {
            Field::AcceptRanges => "accept-ranges",
            Field::Connection => "connection",
            Field::ContentEncoding => "content-encoding",
            Field::ContentLength => "content-length",
            Field::ContentType => "content-type",
            Field::ContentRange => "content-range",
            Field::ETag => "etag",
            Field::LastModified => "last-modified",
            Field::Location => "location",
            Field::SetCookie => "set-cookie",
            Field::Tk => "tk",
        }
    }
}

pub(crate) type Fields<'a> = SmallVec<[(Field, Cow<'a, str>); 11]>;

impl Response {
    /// The header fields that are set, in wire order.
    pub(crate) fn fields(&self) -> Fields<'_> {
        let mut fields = Fields::new();

        if self.accept_ranges {
            fields.push((Field::AcceptRanges, "bytes".into()));
        }
        match self.connection {
            ConnectionPref::KeepAlive => fields.push((Field::Connection, "keep-alive".into())),
            ConnectionPref::Close => fields.push((Field::Connection, "close".into())),
            ConnectionPref::None | ConnectionPref::Unknown => {}
        }
        if let Some(encoding) = &self.content_encoding {
            fields.push((Field::ContentEncoding, encoding.as_str().into()));
        }
        if let Some(len) = self.content_length {
            let mut buf = itoa::Buffer::new();
            fields.push((Field::ContentLength, buf.format(len).to_owned().into()));
        }
        if let Some(content_type) = &self.content_type {
            fields.push((Field::ContentType, content_type.as_ref().into()));
        }
        if let Some(range) = &self.content_range {
            fields.push((Field::ContentRange, range.to_string().into()));
        }
        if let Some(etag) = &self.etag {
            fields.push((Field::ETag, etag.as_str().into()));
        }
        if let Some(modified) = self.last_modified {
            fields.push((Field::LastModified, httpdate::fmt_http_date(modified).into()));
        }
        if let Some(location) = &self.location {
            fields.push((Field::Location, location.as_str().into()));
        }
        if let Some(cookie) = &self.set_cookie {
            fields.push((Field::SetCookie, cookie.as_str().into()));
        }
        if let Some(tk) = self.tk {
            fields.push((Field::Tk, tk.to_string().into()));
        }

        fields
    }
}

use http::Version;

use crate::Response;

/// Serializes the status line and the set header fields, up to and
/// including the blank line that ends the head.
pub(crate) fn encode_response_head(res: &Response, version: Version, out: &mut Vec<u8>) {
    match version {
        Version::HTTP_10 => out.extend_from_slice(b"HTTP/1.0 "),
        _ => out.extend_from_slice(b"HTTP/1.1 "),
    }
    out.extend_from_slice(res.status.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(res.reason_phrase().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (field, value) in res.fields() {
        out.extend_from_slice(field.title().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
}

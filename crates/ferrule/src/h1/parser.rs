//! Incremental HTTP/1.1 request parser.
//!
//! Heads are parsed with `httparse`; bodies are framed by `Content-Length`
//! or chunked transfer-encoding so that pipelined requests after a body are
//! found. Bytes are pushed in with [H1Parser::feed] as they arrive and
//! surface through [ParserEvents].

use http::Version;
use memchr::memmem;
use pretty_hex::PrettyHex;
use tracing::trace;

pub trait ParserEvents {
    fn on_url(&mut self, method: &str, url: &str, version: Version);
    fn on_header(&mut self, name: &str, value: &[u8]);
    fn on_headers_complete(&mut self);
    fn on_body(&mut self, chunk: &[u8]);
    fn on_message_complete(&mut self);
}

#[derive(Debug, thiserror::Error)]
pub enum H1ParseError {
    #[error("malformed request head: {0}")]
    Head(#[from] httparse::Error),

    #[error("request head exceeds {max} bytes")]
    HeadTooLarge { max: usize },

    #[error("invalid content-length header")]
    InvalidContentLength,

    #[error("unsupported transfer-encoding")]
    UnsupportedTransferEncoding,

    #[error("invalid chunk size line")]
    InvalidChunkSize,

    #[error("chunk data not followed by CRLF")]
    InvalidChunkTerminator,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Head,
    Body { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    Failed,
}

enum Step {
    /// consumed this many bytes; `true` if a message just completed
    Advanced(usize, bool),
    NeedMore,
}

/// Longest chunk-size or trailer line we are willing to buffer
const MAX_LINE_LEN: usize = 4096;

pub struct H1Parser {
    buf: Vec<u8>,
    state: State,
    max_head_len: usize,
    max_headers: usize,
    error: Option<H1ParseError>,
}

impl H1Parser {
    pub fn new(max_head_len: usize, max_headers: usize) -> Self {
        Self {
            buf: Vec::new(),
            state: State::Head,
            max_head_len,
            max_headers,
            error: None,
        }
    }

    /// Parses as much as possible, buffering any incomplete tail.
    ///
    /// Returns `data.len()` on success. On a protocol error the parser
    /// stops for good and returns fewer bytes than it was given: the count
    /// of bytes of `data` that belonged to fully parsed messages.
    pub fn feed(&mut self, data: &[u8], events: &mut impl ParserEvents) -> usize {
        if matches!(self.state, State::Failed) {
            return 0;
        }

        let carried = self.buf.len();
        self.buf.extend_from_slice(data);

        let mut pos = 0;
        let mut message_start = 0;
        loop {
            match self.step(pos, events) {
                Ok(Step::Advanced(n, complete)) => {
                    pos += n;
                    if complete {
                        message_start = pos;
                    }
                }
                Ok(Step::NeedMore) => break,
                Err(e) => {
                    let rest = &self.buf[message_start..];
                    trace!(
                        "parse error: {e}, input was:\n{}",
                        &rest[..rest.len().min(128)].hex_dump()
                    );
                    self.state = State::Failed;
                    self.error = Some(e);
                    self.buf.clear();
                    return message_start.saturating_sub(carried);
                }
            }
        }

        self.buf.drain(..pos);
        data.len()
    }

    pub fn error(&self) -> Option<&H1ParseError> {
        self.error.as_ref()
    }

    /// True between messages, with nothing buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::Head) && self.buf.is_empty()
    }

    fn step(&mut self, pos: usize, events: &mut impl ParserEvents) -> Result<Step, H1ParseError> {
        let input = &self.buf[pos..];
        if input.is_empty() {
            return Ok(Step::NeedMore);
        }

        match self.state {
            State::Head => {
                let mut headers = vec![httparse::EMPTY_HEADER; self.max_headers];
                let mut req = httparse::Request::new(&mut headers);
                let len = match req.parse(input)? {
                    httparse::Status::Complete(len) => len,
                    httparse::Status::Partial => {
                        if input.len() > self.max_head_len {
                            return Err(H1ParseError::HeadTooLarge {
                                max: self.max_head_len,
                            });
                        }
                        return Ok(Step::NeedMore);
                    }
                };
                if len > self.max_head_len {
                    return Err(H1ParseError::HeadTooLarge {
                        max: self.max_head_len,
                    });
                }

                let version = match req.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                events.on_url(req.method.unwrap_or(""), req.path.unwrap_or(""), version);

                let mut content_length: Option<u64> = None;
                let mut chunked = false;
                for header in req.headers.iter() {
                    events.on_header(header.name, header.value);

                    if header.name.eq_ignore_ascii_case("content-length") {
                        let len = std::str::from_utf8(header.value)
                            .ok()
                            .and_then(|v| v.trim().parse::<u64>().ok())
                            .ok_or(H1ParseError::InvalidContentLength)?;
                        if content_length.is_some_and(|prev| prev != len) {
                            return Err(H1ParseError::InvalidContentLength);
                        }
                        content_length = Some(len);
                    } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                        let value = String::from_utf8_lossy(header.value);
                        let last = value.rsplit(',').next().unwrap_or("").trim();
                        if !last.eq_ignore_ascii_case("chunked") {
                            return Err(H1ParseError::UnsupportedTransferEncoding);
                        }
                        chunked = true;
                    }
                }
                events.on_headers_complete();

                // transfer-encoding wins over content-length
                self.state = match (chunked, content_length) {
                    (true, _) => State::ChunkSize,
                    (false, Some(n)) if n > 0 => State::Body { remaining: n },
                    _ => {
                        events.on_message_complete();
                        return Ok(Step::Advanced(len, true));
                    }
                };
                Ok(Step::Advanced(len, false))
            }
            State::Body { remaining } => {
                let n = (remaining.min(input.len() as u64)) as usize;
                events.on_body(&input[..n]);
                let remaining = remaining - n as u64;
                if remaining == 0 {
                    self.state = State::Head;
                    events.on_message_complete();
                    return Ok(Step::Advanced(n, true));
                }
                self.state = State::Body { remaining };
                Ok(Step::Advanced(n, false))
            }
            State::ChunkSize => match httparse::parse_chunk_size(input) {
                Ok(httparse::Status::Complete((len, 0))) => {
                    self.state = State::Trailers;
                    Ok(Step::Advanced(len, false))
                }
                Ok(httparse::Status::Complete((len, size))) => {
                    self.state = State::ChunkData { remaining: size };
                    Ok(Step::Advanced(len, false))
                }
                Ok(httparse::Status::Partial) if input.len() <= MAX_LINE_LEN => Ok(Step::NeedMore),
                _ => Err(H1ParseError::InvalidChunkSize),
            },
            State::ChunkData { remaining } => {
                let n = (remaining.min(input.len() as u64)) as usize;
                events.on_body(&input[..n]);
                let remaining = remaining - n as u64;
                self.state = if remaining == 0 {
                    State::ChunkDataEnd
                } else {
                    State::ChunkData { remaining }
                };
                Ok(Step::Advanced(n, false))
            }
            State::ChunkDataEnd => {
                if input.len() < 2 {
                    return Ok(Step::NeedMore);
                }
                if &input[..2] != b"\r\n" {
                    return Err(H1ParseError::InvalidChunkTerminator);
                }
                self.state = State::ChunkSize;
                Ok(Step::Advanced(2, false))
            }
            State::Trailers => match memmem::find(input, b"\r\n") {
                Some(0) => {
                    self.state = State::Head;
                    events.on_message_complete();
                    Ok(Step::Advanced(2, true))
                }
                // trailer fields are read past, not reported
                Some(end) => Ok(Step::Advanced(end + 2, false)),
                None if input.len() <= MAX_LINE_LEN => Ok(Step::NeedMore),
                None => Err(H1ParseError::HeadTooLarge { max: MAX_LINE_LEN }),
            },
            State::Failed => Ok(Step::NeedMore),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::Version;
    use pretty_assertions::assert_eq;

    use super::{H1ParseError, H1Parser, ParserEvents};

    #[derive(Default)]
    struct Log(Vec<String>);

    impl ParserEvents for Log {
        fn on_url(&mut self, method: &str, url: &str, version: Version) {
            self.0.push(format!("url {method} {url} {version:?}"));
        }

        fn on_header(&mut self, name: &str, value: &[u8]) {
            self.0
                .push(format!("header {name}={}", String::from_utf8_lossy(value)));
        }

        fn on_headers_complete(&mut self) {
            self.0.push("headers done".into());
        }

        fn on_body(&mut self, chunk: &[u8]) {
            self.0.push(format!("body {}", String::from_utf8_lossy(chunk)));
        }

        fn on_message_complete(&mut self) {
            self.0.push("complete".into());
        }
    }

    fn parser() -> H1Parser {
        H1Parser::new(64 * 1024, 32)
    }

    #[test]
    fn pipelined_requests_in_one_read() {
        let mut log = Log::default();
        let input = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nHEAD /b HTTP/1.0\r\n\r\n";
        assert_eq!(parser().feed(input, &mut log), input.len());
        assert_eq!(
            log.0,
            vec![
                "url GET /a HTTP/1.1",
                "header Host=x",
                "headers done",
                "complete",
                "url HEAD /b HTTP/1.0",
                "headers done",
                "complete",
            ]
        );
    }

    #[test]
    fn heads_split_over_reads() {
        let mut log = Log::default();
        let mut p = parser();
        let input = b"GET /split HTTP/1.1\r\nHost: example.com\r\n\r\n";
        for chunk in input.chunks(5) {
            assert_eq!(p.feed(chunk, &mut log), chunk.len());
        }
        assert_eq!(log.0.first().unwrap(), "url GET /split HTTP/1.1");
        assert_eq!(log.0.last().unwrap(), "complete");
        assert!(p.is_idle());
    }

    #[test]
    fn content_length_body_then_next_request() {
        let mut log = Log::default();
        let mut p = parser();
        p.feed(b"POST /form HTTP/1.1\r\nContent-Length: 5\r\n\r\nhel", &mut log);
        p.feed(b"loGET / HTTP/1.1\r\n\r\n", &mut log);
        assert_eq!(
            log.0,
            vec![
                "url POST /form HTTP/1.1",
                "header Content-Length=5",
                "headers done",
                "body hel",
                "body lo",
                "complete",
                "url GET / HTTP/1.1",
                "headers done",
                "complete",
            ]
        );
    }

    #[test]
    fn chunked_body_with_trailer() {
        let mut log = Log::default();
        let input = b"PUT /up HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                      4\r\nWiki\r\n5\r\npedia\r\n0\r\nX-Trailer: 1\r\n\r\n";
        assert_eq!(parser().feed(input, &mut log), input.len());
        assert_eq!(
            log.0,
            vec![
                "url PUT /up HTTP/1.1",
                "header Transfer-Encoding=chunked",
                "headers done",
                "body Wiki",
                "body pedia",
                "complete",
            ]
        );
    }

    #[test]
    fn garbage_is_rejected_and_sticks() {
        let mut log = Log::default();
        let mut p = parser();
        let good = b"GET / HTTP/1.1\r\n\r\n";
        let mut input = good.to_vec();
        input.extend_from_slice(b"\x01\x02 nonsense\r\n\r\n");

        let consumed = p.feed(&input, &mut log);
        assert_eq!(consumed, good.len());
        assert!(matches!(p.error(), Some(H1ParseError::Head(_))));
        assert_eq!(p.feed(b"GET / HTTP/1.1\r\n\r\n", &mut log), 0);
    }

    #[test]
    fn oversized_heads_are_rejected() {
        let mut log = Log::default();
        let mut p = H1Parser::new(32, 8);
        let consumed = p.feed(b"GET /a-very-long-path-that-keeps-going HTTP/1.1\r\n", &mut log);
        assert_eq!(consumed, 0);
        assert!(matches!(p.error(), Some(H1ParseError::HeadTooLarge { .. })));
    }

    #[test]
    fn conflicting_lengths_are_rejected() {
        let mut log = Log::default();
        let consumed = parser().feed(
            b"POST / HTTP/1.1\r\nContent-Length: 1\r\nContent-Length: 2\r\n\r\nab",
            &mut log,
        );
        assert_eq!(consumed, 0);
    }
}

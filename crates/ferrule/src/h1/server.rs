use std::{collections::VecDeque, io, sync::Arc};

use b_x::BX;
use bytes::Bytes;
use http::{StatusCode, Version};
use tracing::{debug, trace};

use super::{encode::encode_response_head, H1Parser, ParserEvents};
use crate::{
    error::ServeError,
    event::{ConnectionFactory, Receiver},
    hosting::HostingChain,
    socket::{SharedSocket, Socket},
    ConnectionPref, Method, Request, Response,
};

pub struct ServerConf {
    /// Size of the buffer each read goes into
    pub read_buf_len: usize,

    /// Max length of the request line + HTTP headers
    pub max_http_header_len: usize,

    /// Max number of header records
    pub max_header_records: usize,

    /// Responses that may wait on a slow reader before we stop reading
    /// further pipelined requests
    pub max_pipelined: usize,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            read_buf_len: 4 * 1024,
            max_http_header_len: 64 * 1024,
            max_header_records: 128,
            max_pipelined: 16,
        }
    }
}

/// Builds an [H1Handler] for every connection.
pub fn connection_factory(
    hosting: Arc<HostingChain>,
    conf: Arc<ServerConf>,
) -> impl ConnectionFactory {
    move |socket: SharedSocket| -> Result<Box<dyn Receiver>, BX> {
        Ok(Box::new(H1Handler::new(socket, hosting.clone(), &conf)))
    }
}

/// Serves one HTTP/1.x connection. Requests are answered in the order they
/// were parsed; a response is only started once the previous one has been
/// fully written.
pub struct H1Handler {
    socket: SharedSocket,
    parser: H1Parser,
    exchange: Exchange,
    read_buf: Box<[u8]>,
    max_pipelined: usize,

    /// Reading stopped because `max_pipelined` responses were waiting
    read_paused: bool,

    /// No more reading: the peer left, or we decided to close
    done: bool,
}

impl H1Handler {
    pub fn new(socket: SharedSocket, hosting: Arc<HostingChain>, conf: &ServerConf) -> Self {
        Self {
            socket,
            parser: H1Parser::new(conf.max_http_header_len, conf.max_header_records),
            exchange: Exchange {
                hosting,
                request: Request::default(),
                queue: VecDeque::new(),
                closing: false,
            },
            read_buf: vec![0u8; conf.read_buf_len.max(1)].into_boxed_slice(),
            max_pipelined: conf.max_pipelined.max(1),
            read_paused: false,
            done: false,
        }
    }

    /// Number of responses parsed but not fully written yet.
    pub fn queued(&self) -> usize {
        self.exchange.queue.len()
    }

    /// Writes queued responses head to tail until the socket would block.
    fn drain(&mut self) -> Result<(), ServeError> {
        while let Some(pending) = self.exchange.queue.front_mut() {
            let finished = pending.write_to(&mut *self.socket.borrow_mut())?;
            if !finished {
                return Ok(());
            }

            let close_after = pending.close_after;
            self.exchange.queue.pop_front();
            if close_after {
                trace!("response sent, closing as agreed");
                self.shutdown();
                return Ok(());
            }
        }

        if self.done {
            self.shutdown();
        }
        Ok(())
    }

    /// Reads and parses until the socket would block or too many responses
    /// are waiting, writing out what it can after each pass.
    fn read_and_drain(&mut self) -> Result<(), ServeError> {
        loop {
            self.read_paused = false;
            while !self.done {
                if self.exchange.queue.len() >= self.max_pipelined {
                    trace!(queued = self.exchange.queue.len(), "pausing reads");
                    self.read_paused = true;
                    break;
                }

                let res = self.socket.borrow_mut().read(&mut self.read_buf);
                match res {
                    Ok(0) => {
                        debug!(dropped = self.exchange.queue.len(), "peer closed the connection");
                        self.shutdown();
                        return Ok(());
                    }
                    Ok(n) => {
                        let consumed = self.parser.feed(&self.read_buf[..n], &mut self.exchange);
                        if consumed < n {
                            if let Some(e) = self.parser.error() {
                                debug!("bad request: {e}");
                            }
                            self.exchange.reject();
                            self.done = true;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return Err(ServeError::Io(e)),
                }
            }

            // the socket may well be writable already, and that edge won't repeat
            self.drain()?;

            if !self.read_paused || self.done || self.exchange.queue.len() >= self.max_pipelined {
                return Ok(());
            }
        }
    }

    fn shutdown(&mut self) {
        self.done = true;
        self.exchange.queue.clear();
        self.socket.borrow_mut().close();
    }
}

impl Receiver for H1Handler {
    fn read_avail(&mut self) -> Result<(), BX> {
        self.read_and_drain()?;
        Ok(())
    }

    fn write_avail(&mut self) -> Result<(), BX> {
        self.drain()?;
        // paused input won't be announced again
        if self.read_paused && !self.done && self.exchange.queue.len() < self.max_pipelined {
            trace!("queue drained, resuming reads");
            self.read_and_drain()?;
        }
        Ok(())
    }

    fn closed(&mut self) {
        self.done = true;
        self.exchange.queue.clear();
    }
}

/// The parser's view of the connection: builds requests and queues their
/// responses.
struct Exchange {
    hosting: Arc<HostingChain>,
    request: Request,
    queue: VecDeque<PendingResponse>,

    /// A response that closes the connection has been queued; later
    /// pipelined requests are not answered.
    closing: bool,
}

impl Exchange {
    fn enqueue(&mut self, res: Response, version: Version, close_after: bool) {
        if self.closing {
            return;
        }
        self.closing = close_after;

        res.debug_print();
        let mut head = Vec::with_capacity(256);
        encode_response_head(&res, version, &mut head);
        self.queue.push_back(PendingResponse {
            head,
            head_pos: 0,
            body: res.body,
            body_pos: 0,
            close_after,
        });
    }

    /// Answers an unparseable request and arranges for the connection to
    /// close after it.
    fn reject(&mut self) {
        let mut res = Response::error(StatusCode::BAD_REQUEST);
        res.connection = ConnectionPref::Close;
        self.enqueue(res, Version::HTTP_11, true);
    }
}

impl ParserEvents for Exchange {
    fn on_url(&mut self, method: &str, url: &str, version: Version) {
        self.request = Request {
            method: Method::parse(method),
            path: url.to_owned(),
            version,
            ..Default::default()
        };
    }

    fn on_header(&mut self, name: &str, value: &[u8]) {
        self.request.apply_header(name.as_bytes(), value);
    }

    fn on_headers_complete(&mut self) {
        trace!(method = %self.request.method, path = %self.request.path, "request head parsed");
    }

    fn on_body(&mut self, chunk: &[u8]) {
        trace!(len = chunk.len(), "discarding request body bytes");
    }

    fn on_message_complete(&mut self) {
        let req = std::mem::take(&mut self.request);
        debug!(method = %req.method, path = %req.path, host = %req.host, "request");

        let mut res = self.hosting.respond(&req);
        let close_after = res.connection == ConnectionPref::Close || !req.wants_keep_alive();
        res.connection = if close_after {
            ConnectionPref::Close
        } else if req.connection == ConnectionPref::KeepAlive {
            ConnectionPref::KeepAlive
        } else {
            ConnectionPref::None
        };
        if req.method == Method::Head {
            res.body = Bytes::new();
        }

        self.enqueue(res, req.version, close_after);
    }
}

/// A serialized response head plus a shared view of its body, each with a
/// cursor so writes can resume after a would-block.
struct PendingResponse {
    head: Vec<u8>,
    head_pos: usize,
    body: Bytes,
    body_pos: usize,
    close_after: bool,
}

impl PendingResponse {
    /// Returns `true` once everything has been written.
    fn write_to(&mut self, socket: &mut dyn Socket) -> io::Result<bool> {
        if !write_from(socket, &self.head, &mut self.head_pos)? {
            return Ok(false);
        }
        write_from(socket, &self.body, &mut self.body_pos)
    }
}

fn write_from(socket: &mut dyn Socket, buf: &[u8], pos: &mut usize) -> io::Result<bool> {
    while *pos < buf.len() {
        match socket.write(&buf[*pos..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => *pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

use std::{collections::HashMap, io, sync::Arc};

use b_x::BX;
use bytes::{Buf, Bytes};
use http::Version;
use tracing::{debug, trace};

use super::{
    frame::{ErrorCode, FrameHeader, Setting, StreamId},
    session::{CallbackError, DataSource, Session, SessionCallbacks, SessionError},
};
use crate::{
    error::ServeError,
    event::{ConnectionFactory, Receiver},
    hosting::HostingChain,
    socket::{BufferedSocket, SharedSocket, Socket},
    types::Field,
    Method, Request,
};

pub struct ServerConf {
    /// Streams a client may have open at once
    pub max_concurrent_streams: u32,

    /// Largest compressed header block, CONTINUATIONs included
    pub max_header_block_len: usize,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            max_concurrent_streams: 100,
            max_header_block_len: 64 * 1024,
        }
    }
}

/// Builds an [H2Handler] for every connection.
pub fn connection_factory(
    hosting: Arc<HostingChain>,
    conf: Arc<ServerConf>,
) -> impl ConnectionFactory {
    move |socket: SharedSocket| -> Result<Box<dyn Receiver>, BX> {
        Ok(Box::new(H2Handler::new(socket, hosting.clone(), &conf)?))
    }
}

/// Serves one HTTP/2 connection: every stream the peer opens gets its own
/// [Request], answered through the hosting chain once the peer ends it.
pub struct H2Handler {
    session: Session,
    conn: H2Conn,
}

impl H2Handler {
    pub fn new(
        socket: SharedSocket,
        hosting: Arc<HostingChain>,
        conf: &ServerConf,
    ) -> Result<Self, ServeError> {
        let mut session = Session::new();
        session.set_max_header_block_len(conf.max_header_block_len);
        session.submit_settings(&[(Setting::MaxConcurrentStreams, conf.max_concurrent_streams)])?;

        Ok(Self {
            session,
            conn: H2Conn {
                socket: BufferedSocket::new(socket),
                hosting,
                streams: HashMap::new(),
                ready: Vec::new(),
            },
        })
    }

    /// Number of streams that have started and not closed yet.
    pub fn open_streams(&self) -> usize {
        self.conn.streams.len()
    }

    /// Answers every stream the peer finished sending.
    fn respond_ready(&mut self) -> Result<(), SessionError> {
        for stream_id in std::mem::take(&mut self.conn.ready) {
            let Some(req) = self.conn.streams.get(&stream_id) else {
                continue;
            };
            debug!(%stream_id, method = %req.method, path = %req.path, host = %req.host, "request");

            let res = self.conn.hosting.respond(req);
            res.debug_print();

            let fields = res.fields();
            let mut headers: Vec<(&[u8], &[u8])> = Vec::with_capacity(fields.len() + 1);
            headers.push((b":status", res.status.as_str().as_bytes()));
            for (field, value) in fields.iter() {
                // connection-specific fields are forbidden in h2
                if *field == Field::Connection {
                    continue;
                }
                headers.push((field.lower().as_bytes(), value.as_bytes()));
            }

            let source: Option<Box<dyn DataSource>> =
                if req.method == Method::Head || res.body.is_empty() {
                    None
                } else {
                    Some(Box::new(BodySource {
                        remain: res.body.clone(),
                    }))
                };

            match self.session.submit_response(stream_id, &headers, source) {
                Ok(()) => {}
                Err(SessionError::InvalidStream(stream_id)) => {
                    debug!(%stream_id, "stream went away before its response");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn send(&mut self) -> Result<(), ServeError> {
        match self.session.send(&mut self.conn) {
            Ok(()) => {}
            Err(SessionError::Eof) => {
                debug!("peer went away while we were writing");
                self.shutdown();
                return Ok(());
            }
            Err(e) => {
                self.shutdown();
                return Err(e.into());
            }
        }

        if !self.session.want_read() && !self.session.want_write() && !self.conn.socket.has_pending()
        {
            trace!("session is over");
            self.shutdown();
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.conn.streams.clear();
        self.conn.ready.clear();
        self.conn.socket.close();
    }
}

impl Receiver for H2Handler {
    fn read_avail(&mut self) -> Result<(), BX> {
        loop {
            if self.conn.socket.is_closed() {
                return Ok(());
            }

            match self.session.recv(&mut self.conn) {
                Ok(()) => {}
                Err(SessionError::Eof) => {
                    debug!(open = self.conn.streams.len(), "peer closed the connection");
                    self.shutdown();
                    return Ok(());
                }
                Err(e) => {
                    // flush the GOAWAY if the socket takes it, then give up
                    let _ = self.session.send(&mut self.conn);
                    let _ = self.conn.socket.flush_pending();
                    self.shutdown();
                    return Err(ServeError::from(e).into());
                }
            }

            if let Err(e) = self.respond_ready() {
                self.shutdown();
                return Err(ServeError::from(e).into());
            }
            self.send()?;

            // readiness is edge-triggered: input left behind by a paused
            // recv won't be announced again
            if !self.session.read_resumable() {
                return Ok(());
            }
            trace!("output drained, resuming reads");
        }
    }

    fn write_avail(&mut self) -> Result<(), BX> {
        if self.conn.socket.is_closed() {
            return Ok(());
        }
        if let Err(e) = self.conn.socket.flush_pending() {
            self.shutdown();
            return Err(ServeError::Io(e).into());
        }
        self.send()?;
        if self.session.read_resumable() {
            return self.read_avail();
        }
        Ok(())
    }

    fn closed(&mut self) {
        self.conn.streams.clear();
        self.conn.ready.clear();
    }
}

/// The session's view of the connection.
struct H2Conn {
    socket: BufferedSocket,
    hosting: Arc<HostingChain>,
    streams: HashMap<StreamId, Request>,

    /// Streams the peer has finished sending, in the order they finished
    ready: Vec<StreamId>,
}

impl SessionCallbacks for H2Conn {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, CallbackError> {
        match self.socket.read(buf) {
            Ok(0) => Err(CallbackError::Eof),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CallbackError::WouldBlock),
            Err(e) => {
                debug!("read error: {e}");
                Err(CallbackError::Eof)
            }
        }
    }

    /// Takes everything or nothing: while the socket still has a backlog,
    /// the session keeps its frames and stops producing new ones.
    fn send(&mut self, data: &[u8]) -> Result<usize, CallbackError> {
        let res = self.socket.flush_pending().and_then(|_| {
            if self.socket.has_pending() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.socket.buffered_write(data)
        });
        match res {
            Ok(_) => Ok(data.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(CallbackError::WouldBlock),
            Err(e) => {
                debug!("write error: {e}");
                Err(CallbackError::Eof)
            }
        }
    }

    fn on_frame_recv(&mut self, frame: &FrameHeader) -> Result<(), CallbackError> {
        if frame.ends_stream() && self.streams.contains_key(&frame.stream_id) {
            self.ready.push(frame.stream_id);
        }
        Ok(())
    }

    fn on_begin_headers(&mut self, stream_id: StreamId) -> Result<(), CallbackError> {
        trace!(%stream_id, "stream opened");
        self.streams.insert(
            stream_id,
            Request {
                version: Version::HTTP_2,
                stream_id: stream_id.0,
                ..Default::default()
            },
        );
        Ok(())
    }

    fn on_header(
        &mut self,
        stream_id: StreamId,
        name: &[u8],
        value: &[u8],
    ) -> Result<(), CallbackError> {
        let Some(req) = self.streams.get_mut(&stream_id) else {
            return Err(CallbackError::RejectStream);
        };

        match name {
            b":method" => req.method = Method::parse(&String::from_utf8_lossy(value)),
            b":path" => req.path = String::from_utf8_lossy(value).into_owned(),
            b":authority" => req.host = String::from_utf8_lossy(value).into_owned(),
            _ if name.starts_with(b":") => {
                trace!(%stream_id, name = %String::from_utf8_lossy(name), "ignoring pseudo-header");
            }
            _ => req.apply_header(name, value),
        }
        Ok(())
    }

    fn on_data_chunk(&mut self, stream_id: StreamId, data: &[u8]) -> Result<(), CallbackError> {
        if !self.streams.contains_key(&stream_id) {
            return Err(CallbackError::RejectStream);
        }
        trace!(%stream_id, len = data.len(), "discarding request body bytes");
        Ok(())
    }

    fn on_stream_close(
        &mut self,
        stream_id: StreamId,
        error_code: ErrorCode,
    ) -> Result<(), CallbackError> {
        trace!(%stream_id, ?error_code, "stream closed");
        if self.streams.remove(&stream_id).is_none() {
            return Err(CallbackError::RejectStream);
        }
        Ok(())
    }
}

/// Hands out a response body as flow control allows.
struct BodySource {
    remain: Bytes,
}

impl DataSource for BodySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CallbackError> {
        let n = buf.len().min(self.remain.len());
        buf[..n].copy_from_slice(&self.remain[..n]);
        self.remain.advance(n);
        Ok((n, self.remain.is_empty()))
    }
}

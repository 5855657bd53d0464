use std::{collections::BTreeMap, fmt, io, mem};

use byteorder::{BigEndian, ByteOrder};
use loona_hpack::decoder::DecoderError;
use pretty_hex::PrettyHex;
use tracing::{debug, trace};

use super::frame::{
    encode_goaway, encode_settings, parse_goaway, parse_rst_stream, parse_window_update,
    settings_entries, window_update, ErrorCode, Flag, Flags, FrameHeader, Kind, Setting, Settings,
    SettingsError, StreamId, FRAME_HEADER_LEN, PREFACE,
};

/// Returned by [SessionCallbacks] and [DataSource] implementations to steer
/// the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackError {
    /// Nothing can be done right now, try again on the next readiness edge
    WouldBlock,
    /// The transport is gone
    Eof,
    /// Reset this stream, the connection carries on
    RejectStream,
    /// Abort the whole connection
    Fatal,
}

/// How a [Session] talks to the transport and reports what it decoded.
pub trait SessionCallbacks {
    /// Reads transport bytes into `buf`.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, CallbackError>;

    /// Hands serialized frames to the transport, returning how many bytes
    /// were taken.
    fn send(&mut self, data: &[u8]) -> Result<usize, CallbackError>;

    /// A frame was fully received. For header blocks split over
    /// CONTINUATION frames, this is the HEADERS frame, reported once the
    /// block is complete.
    fn on_frame_recv(&mut self, frame: &FrameHeader) -> Result<(), CallbackError> {
        let _ = frame;
        Ok(())
    }

    /// A new stream was opened by the peer.
    fn on_begin_headers(&mut self, stream_id: StreamId) -> Result<(), CallbackError>;

    /// One decoded header field, pseudo-headers included.
    fn on_header(
        &mut self,
        stream_id: StreamId,
        name: &[u8],
        value: &[u8],
    ) -> Result<(), CallbackError>;

    fn on_data_chunk(&mut self, stream_id: StreamId, data: &[u8]) -> Result<(), CallbackError> {
        let _ = (stream_id, data);
        Ok(())
    }

    /// The stream is gone, either because both sides ended it or because
    /// it was reset.
    fn on_stream_close(
        &mut self,
        stream_id: StreamId,
        error_code: ErrorCode,
    ) -> Result<(), CallbackError>;
}

/// Pull-based response body. The session asks for at most `buf.len()` bytes
/// at a time, as flow control allows.
pub trait DataSource {
    /// Fills a prefix of `buf`, returning its length and whether the body
    /// ends with it.
    fn read(&mut self, buf: &mut [u8]) -> Result<(usize, bool), CallbackError>;
}

/// Errors that end the session. Once one is returned, the connection
/// should be torn down (after flushing, if a GOAWAY was queued).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SessionError {
    #[error("peer closed the connection")]
    Eof,

    #[error("connection error: {0}")]
    Connection(#[from] H2Error),

    #[error("a session callback failed")]
    CallbackFailure,

    #[error("stream {0} cannot take a response")]
    InvalidStream(StreamId),

    #[error("error encoding headers: {0}")]
    Io(#[from] io::Error),
}

/// Peer misbehavior that aborts the connection with a GOAWAY.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum H2Error {
    #[error("invalid connection preface")]
    InvalidPreface,

    #[error("{kind:?} frame of {frame_size} bytes exceeds the max frame size of {max_frame_size}")]
    FrameTooLarge {
        kind: Kind,
        frame_size: u32,
        max_frame_size: u32,
    },

    #[error("header block for stream {stream_id} grew past {max} bytes")]
    HeaderBlockTooLarge { stream_id: StreamId, max: usize },

    #[error("client tried to initiate an even-numbered stream")]
    ClientSidShouldBeOdd,

    #[error("client stream IDs should be numerically increasing")]
    ClientSidShouldBeNumericallyIncreasing {
        stream_id: StreamId,
        last_stream_id: StreamId,
    },

    #[error("received {kind:?} frame with Padded flag but empty payload")]
    PaddedFrameEmpty { kind: Kind },

    #[error("received {kind:?} with Padded flag but payload was shorter than padding")]
    PaddedFrameTooShort {
        kind: Kind,
        padding_length: usize,
        frame_size: u32,
    },

    #[error("received {kind:?} with Priority flag but payload was too short")]
    PriorityTooShort { kind: Kind },

    #[error("headers frame had invalid priority: stream {stream_id} depends on itself")]
    HeadersInvalidPriority { stream_id: StreamId },

    #[error("on stream {stream_id}, expected continuation frame, but got {kind:?}")]
    ExpectedContinuationFrame { stream_id: StreamId, kind: Kind },

    #[error("expected continuation from for stream {stream_id}, but got continuation for stream {continuation_stream_id}")]
    ExpectedContinuationForStream {
        stream_id: StreamId,
        continuation_stream_id: StreamId,
    },

    #[error("on stream {stream_id}, received unexpected continuation frame")]
    UnexpectedContinuationFrame { stream_id: StreamId },

    #[error("hpack decoding error: {0:?}")]
    HpackDecodingError(#[from] DecoderError),

    #[error("client sent a push promise frame, clients aren't allowed to do that, cf. RFC9113 section 8.4")]
    ClientSentPushPromise,

    #[error("stream-specific frame {kind:?} sent to stream ID 0 (connection-wide)")]
    StreamSpecificFrameToConnection { kind: Kind },

    #[error("connection-wide frame {kind:?} sent to stream {stream_id}")]
    ConnectionFrameToStream { kind: Kind, stream_id: StreamId },

    #[error("received {kind:?} for idle stream {stream_id}")]
    FrameForIdleStream { kind: Kind, stream_id: StreamId },

    #[error("received frame for closed stream {stream_id}")]
    StreamClosed { stream_id: StreamId },

    #[error("received ping frame with invalid length {len}")]
    PingFrameInvalidLength { len: u32 },

    #[error("received settings frame with invalid length {len}")]
    SettingsInvalidLength { len: u32 },

    #[error("received rst_stream frame with invalid length {len}")]
    RstStreamInvalidLength { len: u32 },

    #[error("received window update frame with invalid length {len}")]
    WindowUpdateInvalidLength { len: u32 },

    #[error("zero increment in window update frame for the connection")]
    WindowUpdateZeroIncrement,

    #[error("received window update that made the window size overflow")]
    WindowUpdateOverflow,

    #[error("received initial window size settings update that made the window of stream {stream_id} overflow")]
    StreamWindowSizeOverflowDueToSettings { stream_id: StreamId },

    #[error("bad setting value: {0}")]
    BadSettingValue(#[from] SettingsError),
}

impl H2Error {
    /// The code sent along with the GOAWAY.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            H2Error::FrameTooLarge { .. }
            | H2Error::PaddedFrameEmpty { .. }
            | H2Error::PingFrameInvalidLength { .. }
            | H2Error::SettingsInvalidLength { .. }
            | H2Error::RstStreamInvalidLength { .. }
            | H2Error::WindowUpdateInvalidLength { .. } => ErrorCode::FRAME_SIZE_ERROR,
            H2Error::WindowUpdateOverflow
            | H2Error::StreamWindowSizeOverflowDueToSettings { .. }
            | H2Error::BadSettingValue(SettingsError::InitialWindowSize(_)) => {
                ErrorCode::FLOW_CONTROL_ERROR
            }
            H2Error::HeaderBlockTooLarge { .. } => ErrorCode::ENHANCE_YOUR_CALM,
            H2Error::HpackDecodingError(_) => ErrorCode::COMPRESSION_ERROR,
            H2Error::StreamClosed { .. } => ErrorCode::STREAM_CLOSED,
            _ => ErrorCode::PROTOCOL_ERROR,
        }
    }
}

// cf. https://httpwg.org/specs/rfc9113.html#StreamStates
//
// Idle streams have no entry, and neither do closed ones: `last_stream_id`
// tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    /// The peer sent END_STREAM, we may still send
    HalfClosedRemote,
    /// We sent END_STREAM, the peer may still send
    HalfClosedLocal,
}

struct Stream {
    state: StreamState,

    /// How many bytes we can send on this stream before the peer grants
    /// more. May go negative after a SETTINGS change.
    send_window: i64,

    /// Set once a response was submitted
    responded: bool,

    source: Option<Box<dyn DataSource>>,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("state", &self.state)
            .field("send_window", &self.send_window)
            .field("responded", &self.responded)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

enum BlockKind {
    /// Opens a stream; `accepted` is false for refused streams, whose block
    /// is still decoded to keep the HPACK state in sync
    Request { accepted: bool },
    Trailers,
}

/// A header block whose CONTINUATION frames are still coming in.
struct HeaderBlock {
    frame: FrameHeader,
    kind: BlockKind,
    end_stream: bool,
    fragment: Vec<u8>,
}

/// Largest DATA payload queued per stream per pass, and the point at which
/// the output buffer is flushed before producing more.
const MAX_OUTBUF_FILL: usize = 64 * 1024;

/// Unsent output past which `recv` stops pulling from the transport. Every
/// PING or SETTINGS the peer sends queues a reply, so a peer that never
/// reads would otherwise grow the output buffer forever.
const MAX_OUTBUF_BACKLOG: usize = 256 * 1024;

const DEFAULT_MAX_HEADER_BLOCK_LEN: usize = 64 * 1024;

const READ_CHUNK_LEN: usize = 16 * 1024;

/// A server-side HTTP/2 connection, without any i/o of its own: bytes come
/// in and go out through [SessionCallbacks].
pub struct Session {
    /// What we advertised
    local: Settings,
    peer: Settings,

    preface_received: bool,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    out_pos: usize,

    hpack_dec: loona_hpack::Decoder<'static>,
    hpack_enc: loona_hpack::Encoder<'static>,

    streams: BTreeMap<StreamId, Stream>,
    last_stream_id: StreamId,
    continuation: Option<HeaderBlock>,

    /// Compressed size cap for a HEADERS frame and its CONTINUATIONs
    max_header_block_len: usize,

    /// Connection-level send window. SETTINGS never change it.
    conn_send_window: i64,

    /// Set when `recv` stopped early because of unsent output
    read_paused: bool,

    goaway_sent: bool,
    goaway_received: bool,

    /// Streams that ended outside of a callback, reported on the next
    /// `recv` or `send`
    pending_closes: Vec<(StreamId, ErrorCode)>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let local = Settings::default();
        let mut hpack_dec = loona_hpack::Decoder::new();
        hpack_dec.set_max_allowed_table_size(local.header_table_size as usize);

        Self {
            local,
            peer: Settings::default(),
            preface_received: false,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            out_pos: 0,
            hpack_dec,
            hpack_enc: loona_hpack::Encoder::new(),
            streams: BTreeMap::new(),
            last_stream_id: StreamId(0),
            continuation: None,
            max_header_block_len: DEFAULT_MAX_HEADER_BLOCK_LEN,
            conn_send_window: Settings::default().initial_window_size as i64,
            read_paused: false,
            goaway_sent: false,
            goaway_received: false,
            pending_closes: Vec::new(),
        }
    }

    /// Caps the size of a header block, CONTINUATIONs included. Going past
    /// it is a connection error.
    pub fn set_max_header_block_len(&mut self, len: usize) {
        self.max_header_block_len = len;
    }

    /// Queues a SETTINGS frame and starts enforcing those settings.
    pub fn submit_settings(&mut self, pairs: &[(Setting, u32)]) -> Result<(), SessionError> {
        for &(setting, value) in pairs {
            self.local.apply(setting, value).map_err(H2Error::from)?;
            if setting == Setting::HeaderTableSize {
                self.hpack_dec.set_max_allowed_table_size(value as usize);
            }
        }

        let mut payload = Vec::with_capacity(pairs.len() * 6);
        encode_settings(pairs, &mut payload);
        self.queue_frame(
            FrameHeader::new(Kind::Settings, Flags::empty(), StreamId::CONNECTION),
            &payload,
        );
        Ok(())
    }

    /// Queues the response head for `stream_id`. With no data source, the
    /// HEADERS frame ends the stream; otherwise the body is pulled from
    /// `source` by later calls to [Session::send].
    pub fn submit_response(
        &mut self,
        stream_id: StreamId,
        headers: &[(&[u8], &[u8])],
        source: Option<Box<dyn DataSource>>,
    ) -> Result<(), SessionError> {
        match self.streams.get(&stream_id) {
            Some(stream) if !stream.responded && stream.state != StreamState::HalfClosedLocal => {}
            _ => return Err(SessionError::InvalidStream(stream_id)),
        }

        let mut block = Vec::with_capacity(128);
        self.hpack_enc.encode_into(headers.to_vec(), &mut block)?;

        let end_stream = source.is_none();
        let max_frame_size = self.peer.max_frame_size as usize;
        let mut chunks = block.chunks(max_frame_size).peekable();
        let mut kind = Kind::Headers;
        loop {
            let chunk = chunks.next().unwrap_or_default();
            let last = chunks.peek().is_none();

            let mut flags = Flags::empty();
            if last {
                flags |= Flag::EndHeaders;
            }
            if end_stream && kind == Kind::Headers {
                flags |= Flag::EndStream;
            }
            self.queue_frame(FrameHeader::new(kind, flags, stream_id), chunk);
            kind = Kind::Continuation;

            if last {
                break;
            }
        }

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.responded = true;
            stream.source = source;
        }
        if end_stream {
            self.end_local(stream_id);
        }
        Ok(())
    }

    /// Whether the session still expects bytes from the peer.
    pub fn want_read(&self) -> bool {
        !self.goaway_sent && !(self.goaway_received && self.streams.is_empty())
    }

    /// Whether the session has something to send, or will have once a
    /// stream's body can make progress.
    pub fn want_write(&self) -> bool {
        if self.out_pos < self.outbuf.len() {
            return true;
        }
        if self.goaway_sent {
            return false;
        }
        self.conn_send_window > 0
            && self
                .streams
                .values()
                .any(|s| s.source.is_some() && s.send_window > 0)
    }

    /// Serialized bytes the transport has not taken yet.
    pub fn pending_output(&self) -> usize {
        self.outbuf.len() - self.out_pos
    }

    /// Whether the last `recv` left input in the transport because too much
    /// output was waiting.
    pub fn read_paused(&self) -> bool {
        self.read_paused
    }

    /// Whether a paused `recv` should be driven again, now that the output
    /// has drained enough.
    pub fn read_resumable(&self) -> bool {
        self.read_paused && self.pending_output() < MAX_OUTBUF_BACKLOG / 2
    }

    /// Reads from the transport until it would block, processing every
    /// complete frame. A connection error queues a GOAWAY before being
    /// returned; call [Session::send] to flush it.
    ///
    /// Stops early, leaving input in the transport, while more than
    /// a bounded amount of output is waiting to be sent.
    pub fn recv(&mut self, cb: &mut impl SessionCallbacks) -> Result<(), SessionError> {
        self.read_paused = false;
        let mut chunk = [0u8; READ_CHUNK_LEN];
        while !self.goaway_sent {
            if self.pending_output() >= MAX_OUTBUF_BACKLOG {
                trace!(pending = self.pending_output(), "output backed up, pausing reads");
                self.read_paused = true;
                break;
            }

            let n = match cb.recv(&mut chunk) {
                Ok(0) | Err(CallbackError::Eof) => return Err(SessionError::Eof),
                Ok(n) => n,
                Err(CallbackError::WouldBlock) => break,
                Err(_) => return Err(SessionError::CallbackFailure),
            };
            trace!(%n, "read from transport");
            self.inbuf.extend_from_slice(&chunk[..n]);

            if let Err(e) = self.process_inbuf(cb) {
                if let SessionError::Connection(e) = &e {
                    debug!("connection error: {e}");
                    self.go_away(e.error_code(), e.to_string().as_bytes());
                }
                return Err(e);
            }
        }

        self.notify_closes(cb)
    }

    /// Writes queued frames, then produces DATA frames from the streams'
    /// sources while windows allow, until the transport would block.
    pub fn send(&mut self, cb: &mut impl SessionCallbacks) -> Result<(), SessionError> {
        loop {
            while self.out_pos < self.outbuf.len() {
                match cb.send(&self.outbuf[self.out_pos..]) {
                    Ok(0) | Err(CallbackError::WouldBlock) => return self.notify_closes(cb),
                    Ok(n) => self.out_pos += n,
                    Err(CallbackError::Eof) => return Err(SessionError::Eof),
                    Err(_) => return Err(SessionError::CallbackFailure),
                }
            }
            self.outbuf.clear();
            self.out_pos = 0;

            if self.goaway_sent || !self.fill_data() {
                break;
            }
        }

        self.notify_closes(cb)
    }

    fn process_inbuf(&mut self, cb: &mut impl SessionCallbacks) -> Result<(), SessionError> {
        let inbuf = mem::take(&mut self.inbuf);
        let mut pos = 0;
        let res = self.process_frames(&inbuf, &mut pos, cb);
        self.inbuf = inbuf;
        self.inbuf.drain(..pos);
        res
    }

    fn process_frames(
        &mut self,
        inbuf: &[u8],
        pos: &mut usize,
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        if !self.preface_received {
            let avail = &inbuf[*pos..];
            if avail.len() < PREFACE.len() {
                if !PREFACE.starts_with(avail) {
                    return Err(H2Error::InvalidPreface.into());
                }
                return Ok(());
            }
            if &avail[..PREFACE.len()] != PREFACE {
                debug!("bad preface: {:?}", avail[..PREFACE.len()].hex_dump());
                return Err(H2Error::InvalidPreface.into());
            }
            *pos += PREFACE.len();
            self.preface_received = true;
        }

        while !self.goaway_sent {
            let avail = &inbuf[*pos..];
            let frame = match FrameHeader::parse(avail) {
                Ok((_, frame)) => frame,
                Err(_) => break,
            };
            if frame.len > self.local.max_frame_size {
                return Err(H2Error::FrameTooLarge {
                    kind: frame.kind,
                    frame_size: frame.len,
                    max_frame_size: self.local.max_frame_size,
                }
                .into());
            }

            let total = FRAME_HEADER_LEN + frame.len as usize;
            if avail.len() < total {
                break;
            }
            *pos += total;

            trace!(?frame, "received");
            self.handle_frame(frame, &avail[FRAME_HEADER_LEN..total], cb)?;
        }
        Ok(())
    }

    fn handle_frame(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        if let Some(block) = &self.continuation {
            if frame.kind != Kind::Continuation {
                return Err(H2Error::ExpectedContinuationFrame {
                    stream_id: block.frame.stream_id,
                    kind: frame.kind,
                }
                .into());
            }
        }

        match frame.kind {
            Kind::Data => self.on_data(frame, payload, cb),
            Kind::Headers => self.on_headers(frame, payload, cb),
            Kind::Continuation => self.on_continuation(frame, payload, cb),
            Kind::Priority => {
                self.expect_stream_frame(&frame)?;
                Ok(())
            }
            Kind::RstStream => self.on_rst_stream(frame, payload, cb),
            Kind::Settings => self.on_settings(frame, payload, cb),
            Kind::PushPromise => Err(H2Error::ClientSentPushPromise.into()),
            Kind::Ping => {
                self.expect_connection_frame(&frame)?;
                if frame.len != 8 {
                    return Err(H2Error::PingFrameInvalidLength { len: frame.len }.into());
                }
                if !frame.has(Flag::ACK) {
                    self.queue_frame(
                        FrameHeader::new(Kind::Ping, Flag::ACK, StreamId::CONNECTION),
                        payload,
                    );
                }
                self.frame_recv(&frame, cb)
            }
            Kind::GoAway => {
                self.expect_connection_frame(&frame)?;
                if let Ok((_, (last_stream_id, error_code))) = parse_goaway(payload) {
                    debug!(%last_stream_id, ?error_code, "peer is going away");
                }
                self.goaway_received = true;
                self.frame_recv(&frame, cb)
            }
            Kind::WindowUpdate => self.on_window_update(frame, payload, cb),
            Kind::Unknown(ty) => {
                trace!(%ty, "ignoring unknown frame");
                Ok(())
            }
        }
    }

    fn expect_connection_frame(&self, frame: &FrameHeader) -> Result<(), H2Error> {
        if frame.stream_id != StreamId::CONNECTION {
            return Err(H2Error::ConnectionFrameToStream {
                kind: frame.kind,
                stream_id: frame.stream_id,
            });
        }
        Ok(())
    }

    fn expect_stream_frame(&self, frame: &FrameHeader) -> Result<(), H2Error> {
        if frame.stream_id == StreamId::CONNECTION {
            return Err(H2Error::StreamSpecificFrameToConnection { kind: frame.kind });
        }
        Ok(())
    }

    fn on_data(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        self.expect_stream_frame(&frame)?;
        let data = strip_padding(&frame, payload)?;
        let stream_id = frame.stream_id;

        // the peer's window is credited right away: bodies are consumed as
        // they arrive
        if frame.len > 0 {
            self.queue_window_update(StreamId::CONNECTION, frame.len);
        }

        let state = match self.streams.get(&stream_id) {
            Some(stream) => stream.state,
            None if stream_id > self.last_stream_id => {
                return Err(H2Error::FrameForIdleStream {
                    kind: frame.kind,
                    stream_id,
                }
                .into())
            }
            None => {
                self.queue_rst_stream(stream_id, ErrorCode::STREAM_CLOSED);
                return Ok(());
            }
        };
        if state == StreamState::HalfClosedRemote {
            self.reset_stream(stream_id, ErrorCode::STREAM_CLOSED);
            return Ok(());
        }

        let end_stream = frame.has(Flag::EndStream);
        if frame.len > 0 && !end_stream {
            self.queue_window_update(stream_id, frame.len);
        }

        if !data.is_empty() {
            match cb.on_data_chunk(stream_id, data) {
                Ok(()) => {}
                Err(CallbackError::RejectStream) => {
                    self.reset_stream(stream_id, ErrorCode::INTERNAL_ERROR);
                    return Ok(());
                }
                Err(_) => return Err(SessionError::CallbackFailure),
            }
        }

        if end_stream {
            self.end_remote(stream_id);
        }
        self.frame_recv(&frame, cb)
    }

    fn on_headers(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        self.expect_stream_frame(&frame)?;
        let stream_id = frame.stream_id;

        let mut fragment = strip_padding(&frame, payload)?;
        if frame.has(Flag::Priority) {
            if fragment.len() < 5 {
                return Err(H2Error::PriorityTooShort { kind: frame.kind }.into());
            }
            let dependency = BigEndian::read_u32(&fragment[..4]) & 0x7FFF_FFFF;
            if dependency == stream_id.0 {
                return Err(H2Error::HeadersInvalidPriority { stream_id }.into());
            }
            fragment = &fragment[5..];
        }
        self.check_header_block_len(stream_id, fragment.len())?;

        let end_stream = frame.has(Flag::EndStream);
        let kind = match self.streams.get(&stream_id) {
            Some(stream) => match stream.state {
                StreamState::Open | StreamState::HalfClosedLocal => BlockKind::Trailers,
                StreamState::HalfClosedRemote => {
                    return Err(H2Error::StreamClosed { stream_id }.into())
                }
            },
            None => {
                if !stream_id.is_client_initiated() {
                    return Err(H2Error::ClientSidShouldBeOdd.into());
                }
                if stream_id <= self.last_stream_id {
                    return Err(H2Error::ClientSidShouldBeNumericallyIncreasing {
                        stream_id,
                        last_stream_id: self.last_stream_id,
                    }
                    .into());
                }
                self.last_stream_id = stream_id;

                let limit = self.local.max_concurrent_streams.unwrap_or(u32::MAX) as usize;
                let accepted = self.streams.len() < limit;
                if !accepted {
                    debug!(%stream_id, %limit, "refusing stream");
                    self.queue_rst_stream(stream_id, ErrorCode::REFUSED_STREAM);
                }
                BlockKind::Request { accepted }
            }
        };

        let block = HeaderBlock {
            frame,
            kind,
            end_stream,
            fragment: fragment.to_vec(),
        };
        if frame.has(Flag::EndHeaders) {
            self.complete_block(block, cb)
        } else {
            self.continuation = Some(block);
            Ok(())
        }
    }

    fn on_continuation(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        let Some(mut block) = self.continuation.take() else {
            return Err(H2Error::UnexpectedContinuationFrame {
                stream_id: frame.stream_id,
            }
            .into());
        };
        if block.frame.stream_id != frame.stream_id {
            return Err(H2Error::ExpectedContinuationForStream {
                stream_id: block.frame.stream_id,
                continuation_stream_id: frame.stream_id,
            }
            .into());
        }
        self.check_header_block_len(frame.stream_id, block.fragment.len() + payload.len())?;

        block.fragment.extend_from_slice(payload);
        if frame.has(Flag::EndHeaders) {
            self.complete_block(block, cb)
        } else {
            self.continuation = Some(block);
            Ok(())
        }
    }

    fn check_header_block_len(&self, stream_id: StreamId, len: usize) -> Result<(), H2Error> {
        if len > self.max_header_block_len {
            return Err(H2Error::HeaderBlockTooLarge {
                stream_id,
                max: self.max_header_block_len,
            });
        }
        Ok(())
    }

    fn complete_block(
        &mut self,
        block: HeaderBlock,
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        let stream_id = block.frame.stream_id;

        let mut fields: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        self.hpack_dec
            .decode_with_cb(&block.fragment, |name, value| {
                fields.push((name.into_owned(), value.into_owned()))
            })
            .map_err(H2Error::from)?;

        match block.kind {
            BlockKind::Request { accepted: false } => return Ok(()),
            BlockKind::Request { accepted: true } => {
                if self.goaway_sent {
                    return Ok(());
                }
                match cb.on_begin_headers(stream_id) {
                    Ok(()) => {}
                    Err(CallbackError::RejectStream) => {
                        self.queue_rst_stream(stream_id, ErrorCode::REFUSED_STREAM);
                        return Ok(());
                    }
                    Err(_) => return Err(SessionError::CallbackFailure),
                }
                self.streams.insert(
                    stream_id,
                    Stream {
                        state: StreamState::Open,
                        send_window: self.peer.initial_window_size as i64,
                        responded: false,
                        source: None,
                    },
                );

                for (name, value) in &fields {
                    match cb.on_header(stream_id, name, value) {
                        Ok(()) => {}
                        Err(CallbackError::RejectStream) => {
                            self.reset_stream(stream_id, ErrorCode::INTERNAL_ERROR);
                            return Ok(());
                        }
                        Err(_) => return Err(SessionError::CallbackFailure),
                    }
                }
            }
            BlockKind::Trailers => {
                if !block.end_stream {
                    // trailers must end the stream
                    self.reset_stream(stream_id, ErrorCode::PROTOCOL_ERROR);
                    return Ok(());
                }
                trace!(%stream_id, count = fields.len(), "ignoring trailers");
            }
        }

        if block.end_stream {
            self.end_remote(stream_id);
        }

        // reported as a single HEADERS frame, whatever the CONTINUATIONs
        let mut frame = block.frame;
        frame.flags |= Flag::EndHeaders;
        self.frame_recv(&frame, cb)
    }

    fn on_rst_stream(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        self.expect_stream_frame(&frame)?;
        if frame.len != 4 {
            return Err(H2Error::RstStreamInvalidLength { len: frame.len }.into());
        }
        let stream_id = frame.stream_id;
        if !self.streams.contains_key(&stream_id) {
            if stream_id > self.last_stream_id {
                return Err(H2Error::FrameForIdleStream {
                    kind: frame.kind,
                    stream_id,
                }
                .into());
            }
            return Ok(());
        }

        let error_code = match parse_rst_stream(payload) {
            Ok((_, code)) => code,
            Err(_) => ErrorCode::PROTOCOL_ERROR,
        };
        debug!(%stream_id, ?error_code, "stream reset by peer");
        self.streams.remove(&stream_id);
        self.pending_closes.push((stream_id, error_code));
        self.frame_recv(&frame, cb)
    }

    fn on_settings(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        self.expect_connection_frame(&frame)?;
        if frame.has(Flag::ACK) {
            if frame.len != 0 {
                return Err(H2Error::SettingsInvalidLength { len: frame.len }.into());
            }
            trace!("peer acknowledged our settings");
            return self.frame_recv(&frame, cb);
        }
        if frame.len % 6 != 0 {
            return Err(H2Error::SettingsInvalidLength { len: frame.len }.into());
        }

        let old_initial_window_size = self.peer.initial_window_size;
        for (setting, value) in settings_entries(payload) {
            self.peer.apply(setting, value).map_err(H2Error::from)?;
            if setting == Setting::HeaderTableSize {
                self.hpack_enc.set_max_table_size(value as usize);
            }
        }
        trace!(settings = ?self.peer, "peer settings applied");

        let delta = self.peer.initial_window_size as i64 - old_initial_window_size as i64;
        if delta != 0 {
            for (id, stream) in self.streams.iter_mut() {
                let next = stream.send_window + delta;
                if next > Settings::MAX_WINDOW_SIZE as i64 {
                    return Err(H2Error::StreamWindowSizeOverflowDueToSettings { stream_id: *id }
                        .into());
                }
                stream.send_window = next;
            }
        }

        self.queue_frame(
            FrameHeader::new(Kind::Settings, Flag::ACK, StreamId::CONNECTION),
            &[],
        );
        self.frame_recv(&frame, cb)
    }

    fn on_window_update(
        &mut self,
        frame: FrameHeader,
        payload: &[u8],
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        if frame.len != 4 {
            return Err(H2Error::WindowUpdateInvalidLength { len: frame.len }.into());
        }
        let increment = match parse_window_update(payload) {
            Ok((_, increment)) => increment as i64,
            Err(_) => return Err(H2Error::WindowUpdateInvalidLength { len: frame.len }.into()),
        };
        let max = Settings::MAX_WINDOW_SIZE as i64;

        let stream_id = frame.stream_id;
        if stream_id == StreamId::CONNECTION {
            if increment == 0 {
                return Err(H2Error::WindowUpdateZeroIncrement.into());
            }
            if self.conn_send_window + increment > max {
                return Err(H2Error::WindowUpdateOverflow.into());
            }
            self.conn_send_window += increment;
            return self.frame_recv(&frame, cb);
        }

        let Some(stream) = self.streams.get_mut(&stream_id) else {
            if stream_id > self.last_stream_id {
                return Err(H2Error::FrameForIdleStream {
                    kind: frame.kind,
                    stream_id,
                }
                .into());
            }
            return Ok(());
        };
        if increment == 0 {
            self.reset_stream(stream_id, ErrorCode::PROTOCOL_ERROR);
            return Ok(());
        }
        if stream.send_window + increment > max {
            self.reset_stream(stream_id, ErrorCode::FLOW_CONTROL_ERROR);
            return Ok(());
        }
        stream.send_window += increment;
        self.frame_recv(&frame, cb)
    }

    fn frame_recv(
        &mut self,
        frame: &FrameHeader,
        cb: &mut impl SessionCallbacks,
    ) -> Result<(), SessionError> {
        match cb.on_frame_recv(frame) {
            Ok(()) => Ok(()),
            Err(CallbackError::RejectStream) if frame.stream_id != StreamId::CONNECTION => {
                self.reset_stream(frame.stream_id, ErrorCode::INTERNAL_ERROR);
                Ok(())
            }
            Err(_) => Err(SessionError::CallbackFailure),
        }
    }

    /// Produces at most one DATA frame per stream that can send. Returns
    /// whether anything was queued.
    fn fill_data(&mut self) -> bool {
        let ids: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, s)| s.source.is_some())
            .map(|(id, _)| *id)
            .collect();

        let mut produced = false;
        for stream_id in ids {
            if self.conn_send_window <= 0 || self.outbuf.len() >= MAX_OUTBUF_FILL {
                break;
            }
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            if stream.send_window <= 0 {
                continue;
            }
            let Some(source) = stream.source.as_mut() else {
                continue;
            };

            let max = (self.peer.max_frame_size as i64)
                .min(stream.send_window)
                .min(self.conn_send_window) as usize;

            let start = self.outbuf.len();
            self.outbuf.resize(start + FRAME_HEADER_LEN + max, 0);
            let res = source.read(&mut self.outbuf[start + FRAME_HEADER_LEN..]);
            let (n, eof) = match res {
                Ok((n, eof)) => (n.min(max), eof),
                Err(CallbackError::WouldBlock) => {
                    self.outbuf.truncate(start);
                    continue;
                }
                Err(e) => {
                    debug!(%stream_id, ?e, "data source failed");
                    self.outbuf.truncate(start);
                    self.reset_stream(stream_id, ErrorCode::INTERNAL_ERROR);
                    produced = true;
                    continue;
                }
            };
            if n == 0 && !eof {
                self.outbuf.truncate(start);
                continue;
            }

            self.outbuf.truncate(start + FRAME_HEADER_LEN + n);
            let flags = if eof {
                Flags::from(Flag::EndStream)
            } else {
                Flags::empty()
            };
            let header = FrameHeader::new(Kind::Data, flags, stream_id).with_len(n as u32);
            self.outbuf[start..start + FRAME_HEADER_LEN].copy_from_slice(&header.encode());

            stream.send_window -= n as i64;
            self.conn_send_window -= n as i64;
            produced = true;

            if eof {
                stream.source = None;
                self.end_local(stream_id);
            }
        }
        produced
    }

    fn end_remote(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match stream.state {
            StreamState::Open => stream.state = StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => self.close_stream(stream_id, ErrorCode::NO_ERROR),
            StreamState::HalfClosedRemote => {}
        }
    }

    fn end_local(&mut self, stream_id: StreamId) {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return;
        };
        match stream.state {
            StreamState::Open => stream.state = StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => self.close_stream(stream_id, ErrorCode::NO_ERROR),
            StreamState::HalfClosedLocal => {}
        }
    }

    fn close_stream(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        if self.streams.remove(&stream_id).is_some() {
            trace!(%stream_id, ?error_code, "stream closed");
            self.pending_closes.push((stream_id, error_code));
        }
    }

    fn reset_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        debug!(%stream_id, ?code, "resetting stream");
        self.queue_rst_stream(stream_id, code);
        self.close_stream(stream_id, code);
    }

    fn notify_closes(&mut self, cb: &mut impl SessionCallbacks) -> Result<(), SessionError> {
        for (stream_id, error_code) in mem::take(&mut self.pending_closes) {
            match cb.on_stream_close(stream_id, error_code) {
                Ok(()) | Err(CallbackError::RejectStream) => {}
                Err(_) => return Err(SessionError::CallbackFailure),
            }
        }
        Ok(())
    }

    fn go_away(&mut self, code: ErrorCode, debug_data: &[u8]) {
        if self.goaway_sent {
            return;
        }
        self.goaway_sent = true;

        let mut payload = Vec::with_capacity(8 + debug_data.len());
        encode_goaway(self.last_stream_id, code, debug_data, &mut payload);
        self.queue_frame(
            FrameHeader::new(Kind::GoAway, Flags::empty(), StreamId::CONNECTION),
            &payload,
        );
    }

    fn queue_rst_stream(&mut self, stream_id: StreamId, code: ErrorCode) {
        self.queue_frame(
            FrameHeader::new(Kind::RstStream, Flags::empty(), stream_id),
            &code.0.to_be_bytes(),
        );
    }

    fn queue_window_update(&mut self, stream_id: StreamId, increment: u32) {
        self.queue_frame(
            FrameHeader::new(Kind::WindowUpdate, Flags::empty(), stream_id),
            &window_update(increment),
        );
    }

    fn queue_frame(&mut self, frame: FrameHeader, payload: &[u8]) {
        let frame = frame.with_len(payload.len() as u32);
        trace!(?frame, "queueing");
        self.outbuf.extend_from_slice(&frame.encode());
        self.outbuf.extend_from_slice(payload);
    }
}

fn strip_padding<'a>(frame: &FrameHeader, payload: &'a [u8]) -> Result<&'a [u8], H2Error> {
    if !frame.has(Flag::Padded) {
        return Ok(payload);
    }
    let Some((&padding_length, rest)) = payload.split_first() else {
        return Err(H2Error::PaddedFrameEmpty { kind: frame.kind });
    };
    let padding_length = padding_length as usize;
    if padding_length > rest.len() {
        return Err(H2Error::PaddedFrameTooShort {
            kind: frame.kind,
            padding_length,
            frame_size: frame.len,
        });
    }
    Ok(&rest[..rest.len() - padding_length])
}

use std::io::{Read, Write};

use eyre::bail;
use ferrule::h2::frame::{
    parse_goaway, window_update, Flag, Flags, FrameHeader, Kind, StreamId, PREFACE,
};

/// Just enough of an HTTP/2 client to issue requests and collect the
/// responses, crediting flow-control windows as DATA comes in.
pub(crate) struct H2Client<S> {
    stream: S,
    buf: Vec<u8>,
    enc: loona_hpack::Encoder<'static>,
    dec: loona_hpack::Decoder<'static>,
    next_stream_id: u32,
}

pub(crate) struct H2Reply {
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Vec<u8>,
}

impl H2Reply {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub(crate) fn status(&self) -> Option<&str> {
        self.header(":status")
    }
}

impl<S: Read + Write> H2Client<S> {
    /// Sends the preface and an empty SETTINGS frame.
    pub(crate) fn handshake(mut stream: S) -> eyre::Result<Self> {
        let mut out = PREFACE.to_vec();
        out.extend_from_slice(
            &FrameHeader::new(Kind::Settings, Flags::empty(), StreamId::CONNECTION).encode(),
        );
        stream.write_all(&out)?;

        Ok(Self {
            stream,
            buf: Vec::new(),
            enc: loona_hpack::Encoder::new(),
            dec: loona_hpack::Decoder::new(),
            next_stream_id: 1,
        })
    }

    fn write_frame(
        &mut self,
        kind: Kind,
        flags: impl Into<Flags>,
        stream_id: u32,
        payload: &[u8],
    ) -> eyre::Result<()> {
        let header = FrameHeader::new(kind, flags, StreamId(stream_id)).with_len(payload.len() as u32);
        let mut out = header.encode().to_vec();
        out.extend_from_slice(payload);
        self.stream.write_all(&out)?;
        Ok(())
    }

    fn read_frame(&mut self) -> eyre::Result<(FrameHeader, Vec<u8>)> {
        loop {
            if let Ok((rest, frame)) = FrameHeader::parse(&self.buf) {
                let len = frame.len as usize;
                if rest.len() >= len {
                    let payload = rest[..len].to_vec();
                    let consumed = self.buf.len() - rest.len() + len;
                    self.buf.drain(..consumed);
                    return Ok((frame, payload));
                }
            }

            let mut chunk = [0u8; 16 * 1024];
            let n = self.stream.read(&mut chunk)?;
            if n == 0 {
                bail!("connection closed by the server");
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Sends a request without a body and returns its stream id.
    pub(crate) fn request(&mut self, method: &str, path: &str) -> eyre::Result<u32> {
        let headers: [(&[u8], &[u8]); 4] = [
            (b":method", method.as_bytes()),
            (b":scheme", b"https"),
            (b":path", path.as_bytes()),
            (b":authority", b"localhost"),
        ];
        let mut block = Vec::new();
        self.enc.encode_into(headers, &mut block)?;

        let stream_id = self.next_stream_id;
        self.next_stream_id += 2;
        self.write_frame(
            Kind::Headers,
            Flag::EndHeaders | Flag::EndStream,
            stream_id,
            &block,
        )?;
        Ok(stream_id)
    }

    pub(crate) fn get(&mut self, path: &str) -> eyre::Result<H2Reply> {
        let stream_id = self.request("GET", path)?;
        self.response(stream_id)
    }

    /// Reads frames until `stream_id` ends, answering what the connection
    /// requires along the way. Frames of other streams are dropped.
    pub(crate) fn response(&mut self, stream_id: u32) -> eyre::Result<H2Reply> {
        let mut reply = H2Reply {
            headers: Vec::new(),
            body: Vec::new(),
        };
        loop {
            let (frame, payload) = self.read_frame()?;
            match frame.kind {
                Kind::Settings if !frame.has(Flag::ACK) => {
                    self.write_frame(Kind::Settings, Flag::ACK, 0, &[])?;
                }
                Kind::GoAway => {
                    let (_, (_, error_code)) =
                        parse_goaway(&payload).map_err(|e| eyre::eyre!("bad goaway: {e:?}"))?;
                    bail!("server sent goaway: {error_code:?}");
                }
                Kind::RstStream if frame.stream_id.0 == stream_id => {
                    bail!("stream {stream_id} was reset");
                }
                Kind::Headers if frame.stream_id.0 == stream_id => {
                    let headers = &mut reply.headers;
                    self.dec.decode_with_cb(&payload, |k, v| {
                        headers.push((
                            String::from_utf8_lossy(&k).into_owned(),
                            String::from_utf8_lossy(&v).into_owned(),
                        ));
                    })?;
                    if frame.ends_stream() {
                        return Ok(reply);
                    }
                }
                Kind::Data if frame.stream_id.0 == stream_id => {
                    reply.body.extend_from_slice(&payload);
                    if !payload.is_empty() {
                        let credit = window_update(payload.len() as u32);
                        self.write_frame(Kind::WindowUpdate, Flags::empty(), 0, &credit)?;
                        if !frame.ends_stream() {
                            self.write_frame(Kind::WindowUpdate, Flags::empty(), stream_id, &credit)?;
                        }
                    }
                    if frame.ends_stream() {
                        return Ok(reply);
                    }
                }
                _ => {}
            }
        }
    }
}

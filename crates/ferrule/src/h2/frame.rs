//! Wire layout of HTTP/2 frames: the 9-byte header, its flag bits, and the
//! fixed-shape payloads the session reads and writes.
//!
//! <https://httpwg.org/specs/rfc9113.html#FramingLayer>

use std::{fmt, ops::RangeInclusive};

use byteorder::{BigEndian, ByteOrder};
use enumflags2::{bitflags, BitFlags};
use nom::{
    number::streaming::{be_u24, be_u32, be_u8},
    IResult,
};

/// Sent by clients before their first frame.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;

const U31: u32 = 0x7FFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Data,
    Headers,
    Priority,
    RstStream,
    Settings,
    PushPromise,
    Ping,
    GoAway,
    WindowUpdate,
    Continuation,
    /// Extension frames, skipped on receipt
    Unknown(u8),
}

/// Indexed by type code
const KINDS: [Kind; 10] = [
    Kind::Data,
    Kind::Headers,
    Kind::Priority,
    Kind::RstStream,
    Kind::Settings,
    Kind::PushPromise,
    Kind::Ping,
    Kind::GoAway,
    Kind::WindowUpdate,
    Kind::Continuation,
];

impl Kind {
    pub fn from_u8(ty: u8) -> Self {
        KINDS.get(ty as usize).copied().unwrap_or(Kind::Unknown(ty))
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Kind::Data => 0x0,
            Kind::Headers => 0x1,
            Kind::Priority => 0x2,
            Kind::RstStream => 0x3,
            Kind::Settings => 0x4,
            Kind::PushPromise => 0x5,
            Kind::Ping => 0x6,
            Kind::GoAway => 0x7,
            Kind::WindowUpdate => 0x8,
            Kind::Continuation => 0x9,
            Kind::Unknown(ty) => ty,
        }
    }
}

/// Flag bits. Which ones mean anything depends on the frame kind.
#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    EndStream = 0x01,
    EndHeaders = 0x04,
    Padded = 0x08,
    Priority = 0x20,
}

impl Flag {
    /// SETTINGS and PING reuse the END_STREAM bit
    pub const ACK: Self = Self::EndStream;
}

pub type Flags = BitFlags<Flag>;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct StreamId(pub u32);

impl StreamId {
    /// Carries connection control frames
    pub const CONNECTION: Self = Self(0);

    pub fn is_client_initiated(self) -> bool {
        self.0 % 2 == 1
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: Kind,
    pub flags: Flags,
    pub stream_id: StreamId,
    /// Payload length
    pub len: u32,
}

impl FrameHeader {
    pub fn new(kind: Kind, flags: impl Into<Flags>, stream_id: StreamId) -> Self {
        Self {
            kind,
            flags: flags.into(),
            stream_id,
            len: 0,
        }
    }

    pub fn with_len(mut self, len: u32) -> Self {
        self.len = len;
        self
    }

    pub fn has(&self, flag: Flag) -> bool {
        self.flags.contains(flag)
    }

    /// Whether this DATA or HEADERS frame ends its stream.
    pub fn ends_stream(&self) -> bool {
        matches!(self.kind, Kind::Data | Kind::Headers) && self.has(Flag::EndStream)
    }

    pub fn parse(i: &[u8]) -> IResult<&[u8], Self> {
        let (i, len) = be_u24(i)?;
        let (i, ty) = be_u8(i)?;
        let (i, flags) = be_u8(i)?;
        let (i, stream_id) = u31(i)?;
        Ok((
            i,
            Self {
                kind: Kind::from_u8(ty),
                flags: Flags::from_bits_truncate(flags),
                stream_id: StreamId(stream_id),
                len,
            },
        ))
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut out = [0u8; FRAME_HEADER_LEN];
        BigEndian::write_u24(&mut out[..3], self.len);
        out[3] = self.kind.as_u8();
        out[4] = self.flags.bits();
        BigEndian::write_u32(&mut out[5..], self.stream_id.0 & U31);
        out
    }
}

impl fmt::Debug for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stream_id == StreamId::CONNECTION {
            write!(f, "conn:")?;
        } else {
            write!(f, "#{}:", self.stream_id)?;
        }
        write!(f, "{:?}(len={}", self.kind, self.len)?;
        for flag in self.flags.iter() {
            write!(f, ", {flag:?}")?;
        }
        write!(f, ")")
    }
}

/// A 31-bit value behind a reserved bit, which is dropped.
fn u31(i: &[u8]) -> IResult<&[u8], u32> {
    let (i, v) = be_u32(i)?;
    Ok((i, v & U31))
}

/// Carried by RST_STREAM and GOAWAY. Codes this crate has no name for are
/// kept as they came.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const NO_ERROR: Self = Self(0x0);
    pub const PROTOCOL_ERROR: Self = Self(0x1);
    pub const INTERNAL_ERROR: Self = Self(0x2);
    pub const FLOW_CONTROL_ERROR: Self = Self(0x3);
    pub const STREAM_CLOSED: Self = Self(0x5);
    pub const FRAME_SIZE_ERROR: Self = Self(0x6);
    pub const REFUSED_STREAM: Self = Self(0x7);
    pub const CANCEL: Self = Self(0x8);
    pub const COMPRESSION_ERROR: Self = Self(0x9);
    pub const ENHANCE_YOUR_CALM: Self = Self(0xb);

    pub fn name(self) -> Option<&'static str> {
        ERROR_NAMES.get(self.0 as usize).copied()
    }
}

const ERROR_NAMES: [&str; 14] = [
    "NO_ERROR",
    "PROTOCOL_ERROR",
    "INTERNAL_ERROR",
    "FLOW_CONTROL_ERROR",
    "SETTINGS_TIMEOUT",
    "STREAM_CLOSED",
    "FRAME_SIZE_ERROR",
    "REFUSED_STREAM",
    "CANCEL",
    "COMPRESSION_ERROR",
    "CONNECT_ERROR",
    "ENHANCE_YOUR_CALM",
    "INADEQUATE_SECURITY",
    "HTTP_1_1_REQUIRED",
];

impl fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "ErrorCode({:#x})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Setting {
    HeaderTableSize = 0x1,
    EnablePush = 0x2,
    MaxConcurrentStreams = 0x3,
    InitialWindowSize = 0x4,
    MaxFrameSize = 0x5,
    MaxHeaderListSize = 0x6,
}

impl Setting {
    fn from_id(id: u16) -> Option<Self> {
        Some(match id {
            0x1 => Self::HeaderTableSize,
            0x2 => Self::EnablePush,
            0x3 => Self::MaxConcurrentStreams,
            0x4 => Self::InitialWindowSize,
            0x5 => Self::MaxFrameSize,
            0x6 => Self::MaxHeaderListSize,
            _ => return None,
        })
    }
}

/// What one side has announced so far. Push is never used and the header
/// list size is advisory, so neither is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            max_concurrent_streams: None,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
        }
    }
}

impl Settings {
    /// Largest flow-control window, for settings and WINDOW_UPDATE alike
    pub const MAX_WINDOW_SIZE: u32 = U31;

    const FRAME_SIZES: RangeInclusive<u32> = (1 << 14)..=((1 << 24) - 1);

    pub fn apply(&mut self, setting: Setting, value: u32) -> Result<(), SettingsError> {
        match setting {
            Setting::HeaderTableSize => self.header_table_size = value,
            Setting::EnablePush if value > 1 => return Err(SettingsError::EnablePush(value)),
            Setting::MaxConcurrentStreams => self.max_concurrent_streams = Some(value),
            Setting::InitialWindowSize if value > Self::MAX_WINDOW_SIZE => {
                return Err(SettingsError::InitialWindowSize(value))
            }
            Setting::InitialWindowSize => self.initial_window_size = value,
            Setting::MaxFrameSize if !Self::FRAME_SIZES.contains(&value) => {
                return Err(SettingsError::MaxFrameSize(value))
            }
            Setting::MaxFrameSize => self.max_frame_size = value,
            Setting::EnablePush | Setting::MaxHeaderListSize => {}
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("ENABLE_PUSH must be 0 or 1, got {0}")]
    EnablePush(u32),

    #[error("INITIAL_WINDOW_SIZE {0} is above 2^31-1")]
    InitialWindowSize(u32),

    #[error("MAX_FRAME_SIZE {0} is outside 2^14..=2^24-1")]
    MaxFrameSize(u32),
}

/// Walks the entries of a SETTINGS payload, skipping unknown identifiers.
/// A trailing partial entry is ignored; callers check the length.
pub fn settings_entries(payload: &[u8]) -> impl Iterator<Item = (Setting, u32)> + '_ {
    payload.chunks_exact(6).filter_map(|entry| {
        let setting = Setting::from_id(BigEndian::read_u16(&entry[..2]))?;
        Some((setting, BigEndian::read_u32(&entry[2..])))
    })
}

pub fn encode_settings(entries: &[(Setting, u32)], out: &mut Vec<u8>) {
    for &(setting, value) in entries {
        out.extend_from_slice(&(setting as u16).to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
}

pub fn parse_window_update(payload: &[u8]) -> IResult<&[u8], u32> {
    u31(payload)
}

pub fn window_update(increment: u32) -> [u8; 4] {
    (increment & U31).to_be_bytes()
}

pub fn parse_rst_stream(payload: &[u8]) -> IResult<&[u8], ErrorCode> {
    let (rest, code) = be_u32(payload)?;
    Ok((rest, ErrorCode(code)))
}

/// Last stream id and error code; the remainder is opaque debug data.
pub fn parse_goaway(payload: &[u8]) -> IResult<&[u8], (StreamId, ErrorCode)> {
    let (rest, last_stream_id) = u31(payload)?;
    let (rest, code) = be_u32(rest)?;
    Ok((rest, (StreamId(last_stream_id), ErrorCode(code))))
}

pub fn encode_goaway(last_stream_id: StreamId, code: ErrorCode, debug_data: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(&(last_stream_id.0 & U31).to_be_bytes());
    out.extend_from_slice(&code.0.to_be_bytes());
    out.extend_from_slice(debug_data);
}

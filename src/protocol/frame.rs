//! Bridge frame encoding and decoding.
//!
//! A frame on the wire is:
//! ```text
//! ┌──────────────┬───────────────────────────────┐
//! │ payload len  │ TxFrame (FlatBuffers table)    │
//! │ u32 LE       │ `payload len` bytes            │
//! └──────────────┴───────────────────────────────┘
//! ```
//!
//! `TxFrame` slots: 0 frametype, 1 version, 2 channel, 3 stream, 4 headers,
//! 5 body_total_length, 6 body_offset, 7 body, 8 flags.
//! `TxHeaderLine` slots: 0 key, 1 value, 2 id.
//!
//! Decoding borrows from the payload; nothing is copied.

use std::fmt;

use super::flatbuf::{Builder, Field, Table};
use crate::error::DecodeError;

/// Size of the length prefix in front of every frame.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Largest payload accepted from the front-end before the connection is
/// treated as abusive and closed (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

mod slot {
    pub const FRAMETYPE: usize = 0;
    pub const VERSION: usize = 1;
    pub const CHANNEL: usize = 2;
    pub const STREAM: usize = 3;
    pub const HEADERS: usize = 4;
    pub const BODY_TOTAL_LENGTH: usize = 5;
    pub const BODY_OFFSET: usize = 6;
    pub const BODY: usize = 7;
    pub const FLAGS: usize = 8;

    pub const LINE_KEY: usize = 0;
    pub const LINE_VALUE: usize = 1;
    pub const LINE_ID: usize = 2;
}

/// Frame flag bits.
pub mod flags {
    /// Last frame of this direction for the stream.
    pub const FINAL: u8 = 0b0000_0001;

    /// Check if a specific flag is set.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// Identifies one request/response exchange on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub channel: u64,
    pub stream: u64,
}

impl StreamKey {
    pub fn new(channel: u64, stream: u64) -> Self {
        Self { channel, stream }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel, self.stream)
    }
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    /// Starts a stream: request line, headers, and possibly the first body bytes.
    Header,
    /// More body bytes for a stream.
    Body,
    /// The client went away; the stream will never complete.
    Abort,
}

impl FrameType {
    fn to_wire(self) -> i8 {
        match self {
            FrameType::Header => 0,
            FrameType::Body => 1,
            FrameType::Abort => 2,
        }
    }
}

impl TryFrom<i8> for FrameType {
    type Error = DecodeError;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(FrameType::Header),
            1 => Ok(FrameType::Body),
            2 => Ok(FrameType::Abort),
            other => Err(DecodeError::UnknownFrameType(other)),
        }
    }
}

/// HTTP version of the request as seen by the front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
    Http2,
}

impl HttpVersion {
    /// Version as it appears on an HTTP/1 request line.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpVersion::Http10 => "HTTP/1.0",
            HttpVersion::Http11 => "HTTP/1.1",
            HttpVersion::Http2 => "HTTP/2",
        }
    }

    fn to_wire(self) -> i8 {
        match self {
            HttpVersion::Http10 => 0,
            HttpVersion::Http11 => 1,
            HttpVersion::Http2 => 2,
        }
    }
}

impl TryFrom<i8> for HttpVersion {
    type Error = DecodeError;

    fn try_from(v: i8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(HttpVersion::Http10),
            1 => Ok(HttpVersion::Http11),
            2 => Ok(HttpVersion::Http2),
            other => Err(DecodeError::UnknownVersion(other)),
        }
    }
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One header line as carried by a frame.
///
/// `id == 0` is a literal pair. A non-zero id refers to the receiver's header
/// dictionary; if `key` is non-empty the pair is stored under that id first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLine<'a> {
    pub id: u16,
    pub key: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> HeaderLine<'a> {
    pub fn literal(key: &'a [u8], value: &'a [u8]) -> Self {
        Self { id: 0, key, value }
    }
}

/// A decoded (or to-be-encoded) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub frame_type: FrameType,
    pub version: HttpVersion,
    pub flags: u8,
    pub channel: u64,
    pub stream: u64,
    pub headers: Vec<HeaderLine<'a>>,
    pub body: &'a [u8],
    pub body_offset: u64,
    pub body_total_length: u64,
}

impl<'a> Frame<'a> {
    /// Decode a payload (the bytes after the length prefix).
    ///
    /// Unknown frame types and versions are errors; a peer sending them is
    /// speaking a protocol we cannot follow.
    pub fn decode(payload: &'a [u8]) -> Result<Self, DecodeError> {
        let root = Table::root(payload)?;

        let frame_type = FrameType::try_from(root.i8_field(slot::FRAMETYPE, 0)?)?;
        let version = HttpVersion::try_from(root.i8_field(slot::VERSION, 0)?)?;

        let headers = root
            .tables_field(slot::HEADERS)?
            .into_iter()
            .map(|line| {
                Ok(HeaderLine {
                    id: line.u16_field(slot::LINE_ID, 0)?,
                    key: line.bytes_field(slot::LINE_KEY)?,
                    value: line.bytes_field(slot::LINE_VALUE)?,
                })
            })
            .collect::<Result<Vec<_>, DecodeError>>()?;

        Ok(Self {
            frame_type,
            version,
            flags: root.u8_field(slot::FLAGS, 0)?,
            channel: root.u64_field(slot::CHANNEL, 0)?,
            stream: root.u64_field(slot::STREAM, 0)?,
            headers,
            body: root.bytes_field(slot::BODY)?,
            body_offset: root.u64_field(slot::BODY_OFFSET, 0)?,
            body_total_length: root.u64_field(slot::BODY_TOTAL_LENGTH, 0)?,
        })
    }

    /// Encode to one contiguous buffer, length prefix included.
    pub fn encode(&self) -> Vec<u8> {
        let header_bytes: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + h.value.len() + 40)
            .sum();
        let mut builder = Builder::framed(96 + header_bytes + self.body.len());

        let (root, fields) = builder.table(&[
            Field::I8(self.frame_type.to_wire()),
            Field::I8(self.version.to_wire()),
            Field::U64(self.channel),
            Field::U64(self.stream),
            Field::Offset,
            Field::U64(self.body_total_length),
            Field::U64(self.body_offset),
            Field::Offset,
            Field::U8(self.flags),
        ]);

        let (lines, slots) = builder.offset_vector(self.headers.len());
        builder.patch_offset(fields[slot::HEADERS], lines);

        for (line, elem) in self.headers.iter().zip(slots) {
            let (table, line_fields) =
                builder.table(&[Field::Offset, Field::Offset, Field::U16(line.id)]);
            builder.patch_offset(elem, table);
            let key = builder.bytes_vector(line.key);
            builder.patch_offset(line_fields[slot::LINE_KEY], key);
            let value = builder.bytes_vector(line.value);
            builder.patch_offset(line_fields[slot::LINE_VALUE], value);
        }

        let body = builder.bytes_vector(self.body);
        builder.patch_offset(fields[slot::BODY], body);

        builder.finish(root)
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.channel, self.stream)
    }

    /// Check if this is the last frame of its direction.
    #[inline]
    pub fn is_final(&self) -> bool {
        flags::has_flag(self.flags, flags::FINAL)
    }
}

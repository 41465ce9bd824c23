//! Frame encoding and decoding (RFC 7540 Section 4 and 6).
//!
//! Every frame starts with the same 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+---------------+
//! |R|             Stream Identifier (31)          |
//! +-+---------------------------------------------+
//! ```

use crate::error::{Error, ErrorCode};
use crate::settings::Settings;

pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// A decoded frame. Priority information is parsed and discarded; a client
/// never needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Vec<u8>,
        end_stream: bool,
    },
    /// A header block fragment. The block is complete when `end_headers` is
    /// set, otherwise CONTINUATION frames follow.
    Headers {
        stream_id: u32,
        block: Vec<u8>,
        end_stream: bool,
        end_headers: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    /// Raw SETTINGS parameters; see [`Settings::apply`].
    Settings {
        ack: bool,
        payload: Vec<u8>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
    },
    Ping {
        ack: bool,
        opaque_data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Vec<u8>,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Vec<u8>,
        end_headers: bool,
    },
    /// Frame types this endpoint does not understand. They must be ignored.
    Unknown {
        frame_type: u8,
        stream_id: u32,
    },
}

/// The fixed 9-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.length.to_be_bytes()[1..]);
        buf.push(self.frame_type);
        buf.push(self.flags);
        buf.extend_from_slice(&(self.stream_id & STREAM_ID_MASK).to_be_bytes());
    }

    /// Parse the header at the start of `buf`; `None` if fewer than 9 bytes.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        let head = buf.get(..FRAME_HEADER_LEN)?;
        Some(Self {
            length: u32::from_be_bytes([0, head[0], head[1], head[2]]),
            frame_type: head[3],
            flags: head[4],
            stream_id: read_u32(&head[5..]) & STREAM_ID_MASK,
        })
    }
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

fn put_header(buf: &mut Vec<u8>, length: usize, frame_type: u8, flags: u8, stream_id: u32) {
    FrameHeader {
        length: length as u32,
        frame_type,
        flags,
        stream_id,
    }
    .encode(buf);
}

fn flag(set: bool, bit: u8) -> u8 {
    if set { bit } else { 0 }
}

impl Frame {
    /// SETTINGS frame announcing `settings`.
    pub fn settings(settings: &Settings) -> Self {
        let mut payload = Vec::with_capacity(36);
        settings.encode(&mut payload);
        Self::Settings {
            ack: false,
            payload,
        }
    }

    /// Empty SETTINGS frame with the ACK flag.
    pub fn settings_ack() -> Self {
        Self::Settings {
            ack: true,
            payload: Vec::new(),
        }
    }

    /// Append the wire form of this frame to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
            } => {
                let flags = flag(*end_stream, FLAG_END_STREAM);
                put_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
            } => {
                let flags =
                    flag(*end_stream, FLAG_END_STREAM) | flag(*end_headers, FLAG_END_HEADERS);
                put_header(buf, block.len(), FRAME_HEADERS, flags, *stream_id);
                buf.extend_from_slice(block);
            }
            Frame::Priority { stream_id } => {
                put_header(buf, 5, FRAME_PRIORITY, 0, *stream_id);
                // Default dependency on stream 0 with weight 16.
                buf.extend_from_slice(&[0, 0, 0, 0, 15]);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                put_header(buf, 4, FRAME_RST_STREAM, 0, *stream_id);
                buf.extend_from_slice(&error_code.as_u32().to_be_bytes());
            }
            Frame::Settings { ack, payload } => {
                put_header(buf, payload.len(), FRAME_SETTINGS, flag(*ack, FLAG_ACK), 0);
                buf.extend_from_slice(payload);
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
            } => {
                put_header(buf, 4, FRAME_PUSH_PROMISE, FLAG_END_HEADERS, *stream_id);
                buf.extend_from_slice(&(promised_stream_id & STREAM_ID_MASK).to_be_bytes());
            }
            Frame::Ping { ack, opaque_data } => {
                put_header(buf, 8, FRAME_PING, flag(*ack, FLAG_ACK), 0);
                buf.extend_from_slice(opaque_data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                put_header(buf, 8 + debug_data.len(), FRAME_GOAWAY, 0, 0);
                buf.extend_from_slice(&(last_stream_id & STREAM_ID_MASK).to_be_bytes());
                buf.extend_from_slice(&error_code.as_u32().to_be_bytes());
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                put_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                buf.extend_from_slice(&(increment & STREAM_ID_MASK).to_be_bytes());
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let flags = flag(*end_headers, FLAG_END_HEADERS);
                put_header(buf, block.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.extend_from_slice(block);
            }
            Frame::Unknown {
                frame_type,
                stream_id,
            } => {
                put_header(buf, 0, *frame_type, 0, *stream_id);
            }
        }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a whole frame is buffered, otherwise the
    /// frame and the number of bytes it occupied.
    pub fn decode(buf: &[u8], max_frame_size: u32) -> Result<Option<(Frame, usize)>, Error> {
        let Some(header) = FrameHeader::decode(buf) else {
            return Ok(None);
        };
        if header.length > max_frame_size {
            return Err(Error::FrameSize);
        }
        let total = FRAME_HEADER_LEN + header.length as usize;
        let Some(payload) = buf.get(FRAME_HEADER_LEN..total) else {
            return Ok(None);
        };
        let frame = decode_payload(&header, payload)?;
        Ok(Some((frame, total)))
    }
}

fn require_stream(header: &FrameHeader, name: &str) -> Result<u32, Error> {
    if header.stream_id == 0 {
        return Err(Error::Protocol(format!("{name} on stream 0")));
    }
    Ok(header.stream_id)
}

fn require_connection(header: &FrameHeader, name: &str) -> Result<(), Error> {
    if header.stream_id != 0 {
        return Err(Error::Protocol(format!("{name} on stream {}", header.stream_id)));
    }
    Ok(())
}

fn decode_payload(header: &FrameHeader, payload: &[u8]) -> Result<Frame, Error> {
    let flags = header.flags;
    let frame = match header.frame_type {
        FRAME_DATA => Frame::Data {
            stream_id: require_stream(header, "DATA")?,
            payload: strip_padding(payload, flags)?.to_vec(),
            end_stream: flags & FLAG_END_STREAM != 0,
        },
        FRAME_HEADERS => {
            let stream_id = require_stream(header, "HEADERS")?;
            let mut block = strip_padding(payload, flags)?;
            if flags & FLAG_PRIORITY != 0 {
                block = block.get(5..).ok_or(Error::FrameSize)?;
            }
            Frame::Headers {
                stream_id,
                block: block.to_vec(),
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PRIORITY => {
            let stream_id = require_stream(header, "PRIORITY")?;
            if payload.len() != 5 {
                return Err(Error::FrameSize);
            }
            Frame::Priority { stream_id }
        }
        FRAME_RST_STREAM => {
            let stream_id = require_stream(header, "RST_STREAM")?;
            if payload.len() != 4 {
                return Err(Error::FrameSize);
            }
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(read_u32(payload)),
            }
        }
        FRAME_SETTINGS => {
            require_connection(header, "SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if (ack && !payload.is_empty()) || payload.len() % 6 != 0 {
                return Err(Error::FrameSize);
            }
            Frame::Settings {
                ack,
                payload: payload.to_vec(),
            }
        }
        FRAME_PUSH_PROMISE => {
            let stream_id = require_stream(header, "PUSH_PROMISE")?;
            let body = strip_padding(payload, flags)?;
            if body.len() < 4 {
                return Err(Error::FrameSize);
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id: read_u32(body) & STREAM_ID_MASK,
            }
        }
        FRAME_PING => {
            require_connection(header, "PING")?;
            let opaque_data: [u8; 8] = payload.try_into().map_err(|_| Error::FrameSize)?;
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_GOAWAY => {
            require_connection(header, "GOAWAY")?;
            if payload.len() < 8 {
                return Err(Error::FrameSize);
            }
            Frame::GoAway {
                last_stream_id: read_u32(payload) & STREAM_ID_MASK,
                error_code: ErrorCode::from_u32(read_u32(&payload[4..])),
                debug_data: payload[8..].to_vec(),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(Error::FrameSize);
            }
            let increment = read_u32(payload) & STREAM_ID_MASK;
            if increment == 0 {
                return Err(Error::Protocol("WINDOW_UPDATE with zero increment".into()));
            }
            Frame::WindowUpdate {
                stream_id: header.stream_id,
                increment,
            }
        }
        FRAME_CONTINUATION => Frame::Continuation {
            stream_id: require_stream(header, "CONTINUATION")?,
            block: payload.to_vec(),
            end_headers: flags & FLAG_END_HEADERS != 0,
        },
        frame_type => Frame::Unknown {
            frame_type,
            stream_id: header.stream_id,
        },
    };
    Ok(frame)
}

/// Remove the pad length octet and trailing padding when PADDED is set.
fn strip_padding(payload: &[u8], flags: u8) -> Result<&[u8], Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    let (&pad_len, rest) = payload
        .split_first()
        .ok_or(Error::Frame("PADDED frame without pad length"))?;
    let pad_len = usize::from(pad_len);
    if pad_len > rest.len() {
        return Err(Error::Protocol("padding exceeds payload".into()));
    }
    Ok(&rest[..rest.len() - pad_len])
}

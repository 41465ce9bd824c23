/// HTTP/2 error codes carried by RST_STREAM and GOAWAY (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Map a wire value to a code. Unknown values are treated as
    /// `InternalError` (RFC 7540 Section 7).
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            _ => Self::InternalError,
        }
    }

    /// Wire value of this code.
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Errors produced by the HTTP/2 framing layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A frame could not be parsed (bad padding, truncated fields).
    #[error("malformed frame: {0}")]
    Frame(&'static str),

    /// The peer violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// HPACK decoding failed. The connection cannot continue.
    #[error("HPACK compression error")]
    Compression,

    /// A flow control window was exceeded or overflowed.
    #[error("flow control error")]
    FlowControl,

    /// A frame exceeded the negotiated maximum size.
    #[error("frame size error")]
    FrameSize,

    /// The connection is no longer usable.
    #[error("connection error: {0:?}")]
    Connection(ErrorCode),

    /// An operation targeted a stream that cannot accept it.
    #[error("stream {0} error: {1:?}")]
    Stream(u32, ErrorCode),
}

impl Error {
    /// The code to report in GOAWAY when this error tears the connection down.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Frame(_) | Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Compression => ErrorCode::CompressionError,
            Self::FlowControl => ErrorCode::FlowControlError,
            Self::FrameSize => ErrorCode::FrameSizeError,
            Self::Connection(code) | Self::Stream(_, code) => *code,
        }
    }
}

//! Error types for the gRPC client.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use questwire_h2::ErrorCode;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// gRPC status codes (<https://grpc.github.io/grpc/core/md_doc_statuscodes.html>).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum GrpcStatus {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl GrpcStatus {
    /// Name a numeric status. Codes outside the canonical set are `Unknown`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::Cancelled,
            3 => Self::InvalidArgument,
            4 => Self::DeadlineExceeded,
            5 => Self::NotFound,
            6 => Self::AlreadyExists,
            7 => Self::PermissionDenied,
            8 => Self::ResourceExhausted,
            9 => Self::FailedPrecondition,
            10 => Self::Aborted,
            11 => Self::OutOfRange,
            12 => Self::Unimplemented,
            13 => Self::Internal,
            14 => Self::Unavailable,
            15 => Self::DataLoss,
            16 => Self::Unauthenticated,
            _ => Self::Unknown,
        }
    }

    /// Status implied by an HTTP response that carried no `grpc-status`
    /// (<https://github.com/grpc/grpc/blob/master/doc/http-grpc-status-mapping.md>).
    pub fn from_http(status: u16) -> Self {
        match status {
            400 => Self::Internal,
            401 => Self::Unauthenticated,
            403 => Self::PermissionDenied,
            404 => Self::Unimplemented,
            429 | 502 | 503 | 504 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }

    pub fn code(self) -> u32 {
        self as u32
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::DataLoss => "DATA_LOSS",
            Self::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl std::fmt::Display for GrpcStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Network-level failure of a connection or of one stream on it.
///
/// `Clone` because a single dead connection fails every call in flight on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// TCP connect, TLS handshake or name resolution failed.
    #[error("connect to {authority} failed: {reason}")]
    Connect { authority: String, reason: String },

    /// The server never completed the HTTP/2 SETTINGS exchange.
    #[error("HTTP/2 handshake with {0} timed out")]
    HandshakeTimeout(String),

    /// The TLS session negotiated something other than `h2`.
    #[error("server did not negotiate h2 via ALPN")]
    AlpnMismatch,

    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    /// The HTTP/2 layer failed; the connection is unusable.
    #[error("h2 error: {0}")]
    H2(#[from] questwire_h2::Error),

    /// The server reset this call's stream.
    #[error("stream reset by server: {0:?}")]
    StreamReset(ErrorCode),

    /// The server sent GOAWAY without processing this call's stream, or
    /// before the call could be given one. Safe to retry.
    #[error("connection going away: {0:?}")]
    GoAway(ErrorCode),

    /// The connection closed before the stream completed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Malformed wire data in a response.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Declared frame length disagrees with the bytes that follow.
    #[error("frame declares {declared} payload bytes but {actual} follow")]
    Frame { declared: usize, actual: usize },

    /// Fewer than the 5 bytes of a frame header.
    #[error("frame header truncated at {0} bytes")]
    ShortHeader(usize),

    #[error("gzip decompression failed: {0}")]
    Decompression(#[source] io::Error),

    /// Payload bytes do not parse as the expected message type.
    #[error("response does not decode as {type_name}: {source}")]
    Decode {
        type_name: String,
        source: prost::DecodeError,
    },

    /// The decoded message could not be rendered as JSON.
    #[error("response could not be rendered: {0}")]
    Render(#[source] serde_json::Error),
}

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A schema source was unreadable or not a valid descriptor set.
    #[error("failed to load schema from {source_name}: {reason}")]
    SchemaLoad { source_name: String, reason: String },

    /// The message type name is not in the loaded schema.
    #[error("unknown message type `{0}`")]
    UnknownType(String),

    /// The request value does not fit the request message type.
    #[error("payload does not fit {type_name}: {reason}")]
    InvalidPayload { type_name: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server reported a non-OK status. `code` is kept verbatim.
    #[error("grpc status {code}: {message}")]
    Status { code: u32, message: String },

    /// The call deadline elapsed and its stream was aborted.
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    /// The named status for `Error::Status`.
    pub fn status(&self) -> Option<GrpcStatus> {
        match self {
            Self::Status { code, .. } => Some(GrpcStatus::from_code(*code)),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

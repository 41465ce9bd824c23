//! gRPC length-prefixed message framing.
//!
//! Format: 1 byte compression flag + 4 byte big-endian length + payload.
//! Requests always go out uncompressed. Responses are gunzipped when the
//! flag says so, or when the payload carries the gzip magic anyway.

use std::borrow::Cow;
use std::io::{self, Read};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::GzDecoder;
use prost::Message;
use prost_reflect::{DeserializeOptions, DynamicMessage, MessageDescriptor, SerializeOptions};
use serde_json::Value;

use crate::error::{Error, ProtocolError, Result};

pub const HEADER_LEN: usize = 5;
pub const FLAG_COMPRESSED: u8 = 1;
/// Upper bound on a decompressed response message.
pub const MAX_DECOMPRESSED_LEN: usize = 64 * 1024 * 1024;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Build a `desc` message from a JSON value and frame it.
///
/// Fields missing from `value` take their defaults; unknown fields are
/// ignored.
pub fn encode(desc: &MessageDescriptor, value: &Value) -> Result<Bytes> {
    let options = DeserializeOptions::new().deny_unknown_fields(false);
    let message = DynamicMessage::deserialize_with_options(desc.clone(), value, &options)
        .map_err(|e| Error::InvalidPayload {
            type_name: desc.full_name().to_string(),
            reason: e.to_string(),
        })?;
    let payload = message.encode_to_vec();
    let len = frame_len(desc, payload.len())?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.put_u8(0);
    out.put_u32(len);
    out.put_slice(&payload);
    Ok(out.freeze())
}

/// The length prefix for a `len`-byte message, which must fit in 32 bits.
fn frame_len(desc: &MessageDescriptor, len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| Error::InvalidPayload {
        type_name: desc.full_name().to_string(),
        reason: format!("encoded message is {len} bytes, over the 4 GiB frame limit"),
    })
}

/// Extract the payload of the single frame in `body`.
///
/// `Ok(None)` for an empty body, which is how a response without a message
/// looks. The declared length must account for every remaining byte.
pub fn decode(body: &[u8]) -> std::result::Result<Option<Cow<'_, [u8]>>, ProtocolError> {
    if body.is_empty() {
        return Ok(None);
    }
    if body.len() < HEADER_LEN {
        return Err(ProtocolError::ShortHeader(body.len()));
    }
    let flag = body[0];
    let declared = u32::from_be_bytes([body[1], body[2], body[3], body[4]]) as usize;
    let payload = &body[HEADER_LEN..];
    if declared != payload.len() {
        return Err(ProtocolError::Frame {
            declared,
            actual: payload.len(),
        });
    }

    // 0x1f cannot start a protobuf message (wire type 7), so the magic is
    // never a false positive on an uncompressed payload.
    let magic = payload.starts_with(&GZIP_MAGIC);
    if flag == FLAG_COMPRESSED || magic {
        if flag != FLAG_COMPRESSED {
            tracing::debug!(flag, len = declared, "gzip payload without compression flag");
        }
        return gunzip(payload, MAX_DECOMPRESSED_LEN).map(|p| Some(Cow::Owned(p)));
    }
    Ok(Some(Cow::Borrowed(payload)))
}

fn gunzip(payload: &[u8], limit: usize) -> std::result::Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(payload.len().saturating_mul(2).min(limit));
    GzDecoder::new(payload)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(ProtocolError::Decompression)?;
    if out.len() > limit {
        return Err(ProtocolError::Decompression(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("decompressed message exceeds {limit} bytes"),
        )));
    }
    Ok(out)
}

/// Decode `payload` as a `desc` message and render it with the proto3 JSON
/// mapping. Default-valued fields are included.
pub fn to_json(
    desc: &MessageDescriptor,
    payload: &[u8],
) -> std::result::Result<Value, ProtocolError> {
    let message = DynamicMessage::decode(desc.clone(), payload).map_err(|source| {
        ProtocolError::Decode {
            type_name: desc.full_name().to_string(),
            source,
        }
    })?;
    let options = SerializeOptions::new().skip_default_fields(false);
    message
        .serialize_with_options(serde_json::value::Serializer, &options)
        .map_err(ProtocolError::Render)
}

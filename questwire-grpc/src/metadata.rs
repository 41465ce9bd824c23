//! gRPC-over-HTTP/2 request headers and response status.

use std::time::Duration;

use questwire_h2::HeaderField;
use questwire_h2::hpack::find;

use crate::config::ClientConfig;
use crate::error::GrpcStatus;

pub const CONTENT_TYPE: &str = "application/grpc";

/// `:path` of a unary call.
pub fn method_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

/// Headers for one call, pseudo-headers first.
pub fn request_headers(config: &ClientConfig, path: &str, timeout: Duration) -> Vec<HeaderField> {
    let mut headers = vec![
        HeaderField::new(":method", "POST"),
        HeaderField::new(":scheme", config.scheme.as_str()),
        HeaderField::new(":path", path),
        HeaderField::new(":authority", config.authority.as_str()),
        HeaderField::new("content-type", CONTENT_TYPE),
        HeaderField::new("te", "trailers"),
        HeaderField::new("grpc-accept-encoding", config.accept_encoding.as_str()),
        HeaderField::new("user-agent", config.user_agent.as_str()),
        HeaderField::new("grpc-timeout", encode_timeout(timeout)),
    ];
    for (name, value) in &config.metadata {
        headers.push(HeaderField::new(name.as_str(), value.as_str()));
    }
    if let Some(credential) = &config.credential {
        headers.push(HeaderField::sensitive("authorization", credential.header_value()));
    }
    headers
}

/// `grpc-timeout` value: at most 8 digits in the finest unit that fits,
/// rounded up so the server never sees a shorter deadline.
pub fn encode_timeout(timeout: Duration) -> String {
    const MAX: u128 = 99_999_999;
    const UNITS: [(u128, char); 6] = [
        (1, 'n'),
        (1_000, 'u'),
        (1_000_000, 'm'),
        (1_000_000_000, 'S'),
        (60_000_000_000, 'M'),
        (3_600_000_000_000, 'H'),
    ];
    let nanos = timeout.as_nanos();
    for (scale, unit) in UNITS {
        let value = nanos.div_ceil(scale);
        if value <= MAX {
            return format!("{value}{unit}");
        }
    }
    format!("{MAX}H")
}

/// `grpc-status` and the percent-decoded `grpc-message`, if a status is
/// present. An unparsable status is reported as `Unknown`.
pub fn grpc_status(headers: &[HeaderField]) -> Option<(u32, String)> {
    let raw = find(headers, "grpc-status")?;
    let code = std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(GrpcStatus::Unknown.code());
    let message = find(headers, "grpc-message")
        .map(percent_decode)
        .unwrap_or_default();
    Some((code, message))
}

/// `:status` of a response header block.
pub fn http_status(headers: &[HeaderField]) -> Option<u16> {
    find(headers, ":status")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|s| s.parse().ok())
}

/// Failure carried by a response header block, if any: a non-zero
/// `grpc-status`, or a non-200 `:status` when no `grpc-status` is given.
pub fn header_failure(headers: &[HeaderField]) -> Option<(u32, String)> {
    if let Some((code, message)) = grpc_status(headers) {
        return (code != GrpcStatus::Ok.code()).then_some((code, message));
    }
    match http_status(headers) {
        Some(200) | None => None,
        Some(status) => Some((
            GrpcStatus::from_http(status).code(),
            format!("HTTP status {status}"),
        )),
    }
}

/// Decode `%XX` escapes (gRPC `grpc-message` encoding). Malformed escapes
/// are kept verbatim; invalid UTF-8 is replaced.
pub fn percent_decode(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%'
            && let Some(byte) = raw.get(i + 1..i + 3).and_then(hex_pair)
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(raw[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_pair(pair: &[u8]) -> Option<u8> {
    let hi = (pair[0] as char).to_digit(16)?;
    let lo = (pair[1] as char).to_digit(16)?;
    Some((hi * 16 + lo) as u8)
}

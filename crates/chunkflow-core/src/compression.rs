// ABOUTME: Encoding of catalog payloads as JSON text
// ABOUTME: zstd-compressed and Base64 wrapped once a payload passes the threshold

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;

/// Payloads whose JSON text is shorter than this are stored as is.
pub const COMPRESSION_THRESHOLD: usize = 1024;

const COMPRESSION_LEVEL: i32 = 3;

const COMPRESSED_PREFIX: &str = "zstd:";

/// JSON text of `payload`, or `zstd:<base64>` when it is large.
pub fn encode_payload(payload: &Value) -> String {
    let text = payload.to_string();
    if text.len() < COMPRESSION_THRESHOLD {
        return text;
    }
    match zstd::encode_all(text.as_bytes(), COMPRESSION_LEVEL) {
        Ok(frame) => format!("{}{}", COMPRESSED_PREFIX, BASE64.encode(frame)),
        Err(e) => {
            tracing::warn!("Payload compression failed, storing raw JSON: {}", e);
            text
        }
    }
}

pub fn is_compressed(encoded: &str) -> bool {
    encoded.starts_with(COMPRESSED_PREFIX)
}

pub fn decode_payload(encoded: &str) -> Result<Value> {
    let text = match encoded.strip_prefix(COMPRESSED_PREFIX) {
        Some(b64) => {
            let frame = BASE64.decode(b64).context("payload is not valid base64")?;
            let bytes = zstd::decode_all(frame.as_slice()).context("payload is not a zstd frame")?;
            String::from_utf8(bytes).context("payload is not utf-8")?
        }
        None => encoded.to_string(),
    };
    serde_json::from_str(&text).context("payload is not JSON")
}

//! Incremental decoder for `application/vnd.amazon.eventstream`.
//!
//! Each frame:
//!   [4B total_length][4B headers_length][4B prelude_CRC32]
//!   [headers: typed key-value pairs]
//!   [payload: JSON bytes]
//!   [4B message_CRC32]
//!
//! Chunks from the network rarely line up with frames, so partial frames are
//! held in the buffer until the rest arrives.

use bytes::{Buf, BytesMut};
use serde_json::Value;

const PRELUDE_LEN: usize = 12;
const MIN_FRAME_LEN: usize = PRELUDE_LEN + 4;

#[derive(Debug, thiserror::Error)]
pub enum EventStreamError {
    #[error("event stream prelude CRC mismatch (expected {expected:#010x}, got {actual:#010x})")]
    PreludeCrc { expected: u32, actual: u32 },
    #[error("event stream frame length {0} is invalid")]
    InvalidLength(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    pub event_type: String,
    pub message_type: String,
    pub payload: Value,
}

impl EventFrame {
    pub fn is_exception(&self) -> bool {
        self.message_type == "exception" || self.message_type == "error"
    }
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buf: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet forming a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `chunk` and return every frame it completes.
    ///
    /// A corrupt prelude leaves no way to find the next frame boundary, so it
    /// is an error; a frame whose message CRC fails is dropped.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<EventFrame>, EventStreamError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while self.buf.len() >= PRELUDE_LEN {
            let total_length = read_u32(&self.buf[0..4]) as usize;
            let headers_length = read_u32(&self.buf[4..8]) as usize;
            let prelude_expected = read_u32(&self.buf[8..12]);
            let prelude_actual = crc32_checksum(&self.buf[0..8]);
            if prelude_expected != prelude_actual {
                self.buf.clear();
                return Err(EventStreamError::PreludeCrc {
                    expected: prelude_expected,
                    actual: prelude_actual,
                });
            }
            if total_length < MIN_FRAME_LEN || PRELUDE_LEN + headers_length > total_length - 4 {
                self.buf.clear();
                return Err(EventStreamError::InvalidLength(total_length));
            }
            if self.buf.len() < total_length {
                break;
            }

            let frame = self.buf.split_to(total_length);
            let crc_offset = total_length - 4;
            let msg_expected = read_u32(&frame[crc_offset..]);
            let msg_actual = crc32_checksum(&frame[..crc_offset]);
            if msg_expected != msg_actual {
                tracing::warn!(
                    expected = msg_expected,
                    actual = msg_actual,
                    "bedrock event stream: message CRC mismatch, skipping frame"
                );
                continue;
            }

            let headers_end = PRELUDE_LEN + headers_length;
            let (event_type, message_type) = parse_headers(&frame[PRELUDE_LEN..headers_end]);

            let payload_bytes = &frame[headers_end..crc_offset];
            let payload = if payload_bytes.is_empty() {
                Value::Null
            } else {
                match serde_json::from_slice::<Value>(payload_bytes) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(event_type = %event_type, error = %e, "bedrock event stream: non-JSON payload");
                        Value::String(String::from_utf8_lossy(payload_bytes).into_owned())
                    }
                }
            };

            if message_type == "exception" {
                tracing::warn!(event_type = %event_type, payload = %payload, "bedrock stream exception received");
            }

            frames.push(EventFrame {
                event_type,
                message_type,
                payload,
            });
        }

        Ok(frames)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut b = bytes;
    b.get_u32()
}

/// Returns `(:event-type or :exception-type, :message-type)`.
fn parse_headers(mut data: &[u8]) -> (String, String) {
    let mut event_type = String::new();
    let mut message_type = String::new();
    while !data.is_empty() {
        let Some((name, value, consumed)) = parse_header(data) else {
            break;
        };
        match name.as_str() {
            ":event-type" | ":exception-type" => event_type = value.unwrap_or_default(),
            ":message-type" => message_type = value.unwrap_or_default(),
            _ => {}
        }
        data = &data[consumed..];
    }
    (event_type, message_type)
}

/// One header: `(name, string value if the header is a string, bytes consumed)`.
fn parse_header(data: &[u8]) -> Option<(String, Option<String>, usize)> {
    let name_len = *data.first()? as usize;
    if data.len() < 1 + name_len + 1 {
        return None;
    }
    let name = std::str::from_utf8(&data[1..1 + name_len]).ok()?.to_string();
    let value_type = data[1 + name_len];
    let rest = &data[1 + name_len + 1..];
    let head = 1 + name_len + 1;

    let fixed = |size: usize| (rest.len() >= size).then_some((name.clone(), None, head + size));
    match value_type {
        0 | 1 => fixed(0), // bool true / false carry no value bytes
        2 => fixed(1),
        3 => fixed(2),
        4 => fixed(4),
        5 | 8 => fixed(8),
        9 => fixed(16),
        6 | 7 => {
            if rest.len() < 2 {
                return None;
            }
            let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
            if rest.len() < 2 + len {
                return None;
            }
            let value = (value_type == 7)
                .then(|| String::from_utf8_lossy(&rest[2..2 + len]).into_owned());
            Some((name.clone(), value, head + 2 + len))
        }
        _ => None,
    }
}

/// Encode one frame with string headers and valid checksums. Used to build
/// fake Bedrock streams.
pub fn encode_event_frame(event_type: &str, message_type: &str, payload: &Value) -> Vec<u8> {
    let payload_bytes = serde_json::to_vec(payload).unwrap_or_default();
    let type_header = if message_type == "exception" {
        ":exception-type"
    } else {
        ":event-type"
    };

    let mut headers = Vec::new();
    for (name, value) in [
        (type_header, event_type),
        (":content-type", "application/json"),
        (":message-type", message_type),
    ] {
        headers.push(name.len() as u8);
        headers.extend_from_slice(name.as_bytes());
        headers.push(7u8);
        headers.extend_from_slice(&(value.len() as u16).to_be_bytes());
        headers.extend_from_slice(value.as_bytes());
    }

    let total_length = PRELUDE_LEN + headers.len() + payload_bytes.len() + 4;
    let mut message = Vec::with_capacity(total_length);
    message.extend_from_slice(&(total_length as u32).to_be_bytes());
    message.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    let prelude_crc = crc32_checksum(&message[0..8]);
    message.extend_from_slice(&prelude_crc.to_be_bytes());
    message.extend_from_slice(&headers);
    message.extend_from_slice(&payload_bytes);
    let msg_crc = crc32_checksum(&message);
    message.extend_from_slice(&msg_crc.to_be_bytes());
    message
}

/// CRC-32/ISO-HDLC (zlib/gzip polynomial).
fn crc32_checksum(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }
    !crc
}

// ── Tests ───────────────────────────────────────────────────────

//! Binary framing for the supervisor <-> script worker channel.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte type][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (type + payload)
//! - **type**: u8 message type
//! - **payload**: type-specific binary data
//!
//! ## Message Types
//!
//! | Type | Direction | Name    | Payload |
//! |------|-----------|---------|---------|
//! | 0x01 | S→W       | request | `[4B source_len][source][4B stdin_len][stdin]` |
//! | 0x02 | W→S       | stdout  | UTF-8 text |
//! | 0x03 | W→S       | stderr  | UTF-8 text |
//! | 0x04 | W→S       | outcome | `[1B status][1B has_value][4B value_len][value][4B error_len][error]` |
//!
//! The worker streams any number of `stdout`/`stderr` frames and finishes
//! with exactly one `outcome`. A frame cut short by a kill is left in the
//! [`Decoder`] buffer and never surfaces, so everything decoded before it
//! stays intact.

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Minimum body size: type (1).
pub const MIN_BODY_SIZE: usize = 1;

/// Largest text slice carried by a single stdout/stderr frame.
pub const MAX_TEXT_CHUNK: usize = 64 * 1024;

// Message type constants.
pub const MSG_REQUEST: u8 = 0x01;
pub const MSG_STDOUT: u8 = 0x02;
pub const MSG_STDERR: u8 = 0x03;
pub const MSG_OUTCOME: u8 = 0x04;

// Outcome status codes.
pub const STATUS_OK: u8 = 0x00;
pub const STATUS_RUNTIME_FAULT: u8 = 0x01;
pub const STATUS_CAPABILITY_DENIED: u8 = 0x02;

/// Protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(&'static str),
    UnexpectedMessage(u8),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::MessageTooSmall(size) => write!(f, "message too small: {size}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::UnexpectedMessage(t) => write!(f, "unexpected message type: 0x{t:02x}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Read a `u8` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u8_at(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

/// Read a `u32` from `data` at `offset`. Returns `None` if out of bounds.
fn read_u32_at(data: &[u8], offset: usize) -> Option<u32> {
    let bytes: [u8; 4] = data.get(offset..offset + 4)?.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}

/// Read a `[4B len][bytes]` field at `offset` as UTF-8.
/// Returns the string and the offset just past it.
fn read_str_at<'a>(
    data: &'a [u8],
    offset: usize,
    what: &'static str,
) -> Result<(&'a str, usize), ProtocolError> {
    let len = read_u32_at(data, offset).ok_or(ProtocolError::InvalidPayload(what))? as usize;
    let start = offset + 4;
    let bytes = data
        .get(start..start + len)
        .ok_or(ProtocolError::InvalidPayload(what))?;
    let s = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidPayload(what))?;
    Ok((s, start + len))
}

/// A raw decoded message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

/// Decoded request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request<'a> {
    pub source: &'a str,
    pub stdin: &'a str,
}

/// Decoded outcome payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome<'a> {
    pub status: u8,
    /// JSON text of the entry point's return value, if one ran.
    pub value: Option<&'a str>,
    pub error: &'a str,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a raw message: `[4-byte length][1-byte type][payload]`.
pub fn encode(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = 1 + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(msg_type);
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn push_str(p: &mut Vec<u8>, s: &str) {
    p.extend_from_slice(&(s.len() as u32).to_be_bytes());
    p.extend_from_slice(s.as_bytes());
}

/// Encode request payload: `[4B source_len][source][4B stdin_len][stdin]`.
pub fn encode_request(source: &str, stdin: &str) -> Vec<u8> {
    let mut p = Vec::with_capacity(8 + source.len() + stdin.len());
    push_str(&mut p, source);
    push_str(&mut p, stdin);
    p
}

/// Encode outcome payload:
/// `[1B status][1B has_value][4B value_len][value][4B error_len][error]`.
pub fn encode_outcome(status: u8, value: Option<&str>, error: &str) -> Vec<u8> {
    let value_str = value.unwrap_or_default();
    let mut p = Vec::with_capacity(10 + value_str.len() + error.len());
    p.push(status);
    p.push(u8::from(value.is_some()));
    push_str(&mut p, value_str);
    push_str(&mut p, error);
    p
}

/// Split `text` into slices of at most [`MAX_TEXT_CHUNK`] bytes, never
/// cutting through a UTF-8 sequence.
pub fn text_chunks(text: &str) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > MAX_TEXT_CHUNK {
        let mut end = MAX_TEXT_CHUNK;
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode request payload.
pub fn decode_request(payload: &[u8]) -> Result<Request<'_>, ProtocolError> {
    let (source, next) = read_str_at(payload, 0, "request source truncated")?;
    let (stdin, _) = read_str_at(payload, next, "request stdin truncated")?;
    Ok(Request { source, stdin })
}

/// Decode stdout/stderr payload.
pub fn decode_text(payload: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in text"))
}

/// Decode outcome payload.
pub fn decode_outcome(payload: &[u8]) -> Result<Outcome<'_>, ProtocolError> {
    let status =
        read_u8_at(payload, 0).ok_or(ProtocolError::InvalidPayload("outcome too short"))?;
    let has_value =
        read_u8_at(payload, 1).ok_or(ProtocolError::InvalidPayload("outcome too short"))? == 1;
    let (value, next) = read_str_at(payload, 2, "outcome value truncated")?;
    let (error, _) = read_str_at(payload, next, "outcome error truncated")?;
    Ok(Outcome {
        status,
        value: has_value.then_some(value),
        error,
    })
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Buffered message decoder for streaming data.
#[derive(Debug)]
pub struct Decoder {
    buf: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64 * 1024),
        }
    }

    /// Bytes of an incomplete trailing frame still waiting for more data.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Feed data and extract complete messages.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        self.buf.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut offset = 0;

        while offset + HEADER_SIZE <= self.buf.len() {
            let length = match read_u32_at(&self.buf, offset) {
                Some(v) => v as usize,
                None => break,
            };

            if length > MAX_MESSAGE_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooLarge(length));
            }
            if length < MIN_BODY_SIZE {
                self.buf.clear();
                return Err(ProtocolError::MessageTooSmall(length));
            }

            let total = HEADER_SIZE + length;
            if offset + total > self.buf.len() {
                break;
            }

            let msg_type = match read_u8_at(&self.buf, offset + HEADER_SIZE) {
                Some(v) => v,
                None => break,
            };
            let payload = self
                .buf
                .get(offset + HEADER_SIZE + MIN_BODY_SIZE..offset + total)
                .unwrap_or_default()
                .to_vec();

            messages.push(RawMessage { msg_type, payload });
            offset += total;
        }

        // Compact: remove consumed bytes once at the end
        if offset > 0 {
            self.buf.drain(..offset);
        }

        Ok(messages)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_survives_framing() {
        let payload = encode_request("print(\"hi\");", "a\nb\n");
        let msg = encode(MSG_REQUEST, &payload).unwrap();

        let mut dec = Decoder::new();
        let msgs = dec.decode(&msg).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].msg_type, MSG_REQUEST);

        let req = decode_request(&msgs[0].payload).unwrap();
        assert_eq!(req.source, "print(\"hi\");");
        assert_eq!(req.stdin, "a\nb\n");
    }

    #[test]
    fn outcome_without_value() {
        let payload = encode_outcome(STATUS_RUNTIME_FAULT, None, "boom");
        let outcome = decode_outcome(&payload).unwrap();
        assert_eq!(outcome.status, STATUS_RUNTIME_FAULT);
        assert_eq!(outcome.value, None);
        assert_eq!(outcome.error, "boom");
    }

    #[test]
    fn outcome_with_null_value_is_distinct_from_none() {
        let payload = encode_outcome(STATUS_OK, Some("null"), "");
        let outcome = decode_outcome(&payload).unwrap();
        assert_eq!(outcome.value, Some("null"));
        assert!(outcome.error.is_empty());
    }

    #[test]
    fn decoder_keeps_partial_frame_pending() {
        let mut data = encode(MSG_STDOUT, b"first\n").unwrap();
        let second = encode(MSG_STDOUT, b"second\n").unwrap();
        data.extend_from_slice(&second[..5]);

        let mut dec = Decoder::new();
        let msgs = dec.decode(&data).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(decode_text(&msgs[0].payload).unwrap(), "first\n");
        assert_eq!(dec.pending(), 5);
    }

    #[test]
    fn decoder_handles_interleaved_streams() {
        let mut data = encode(MSG_STDOUT, b"out").unwrap();
        data.extend_from_slice(&encode(MSG_STDERR, b"err").unwrap());
        data.extend_from_slice(&encode(MSG_OUTCOME, &encode_outcome(STATUS_OK, None, "")).unwrap());

        let mut dec = Decoder::new();
        let types: Vec<u8> = dec
            .decode(&data)
            .unwrap()
            .iter()
            .map(|m| m.msg_type)
            .collect();
        assert_eq!(types, vec![MSG_STDOUT, MSG_STDERR, MSG_OUTCOME]);
    }

    #[test]
    fn decoder_byte_by_byte() {
        let data = encode(MSG_STDERR, b"x").unwrap();
        let mut dec = Decoder::new();

        for (i, &byte) in data.iter().enumerate() {
            let msgs = dec.decode(&[byte]).unwrap();
            if i < data.len() - 1 {
                assert!(msgs.is_empty());
            } else {
                assert_eq!(msgs.len(), 1);
                assert_eq!(msgs[0].msg_type, MSG_STDERR);
            }
        }
    }

    #[test]
    fn decoder_rejects_too_large() {
        let bad = (17 * 1024 * 1024_u32).to_be_bytes();
        let err = Decoder::new().decode(&bad).unwrap_err();
        assert!(matches!(err, ProtocolError::MessageTooLarge(_)));
    }

    #[test]
    fn decoder_rejects_empty_body() {
        let bad = 0_u32.to_be_bytes();
        let err = Decoder::new().decode(&bad).unwrap_err();
        assert_eq!(err, ProtocolError::MessageTooSmall(0));
    }

    #[test]
    fn decode_request_too_short() {
        assert!(decode_request(&[0, 0, 0]).is_err());
        assert!(decode_request(&[0, 0, 0, 5, b'a']).is_err());
    }

    #[test]
    fn text_chunks_respect_char_boundaries() {
        let text = "é".repeat(MAX_TEXT_CHUNK);
        let chunks = text_chunks(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().all(|c| c.len() <= MAX_TEXT_CHUNK));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn text_chunks_of_empty_text() {
        assert!(text_chunks("").is_empty());
    }
}

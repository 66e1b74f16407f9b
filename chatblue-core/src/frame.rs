//! Framing: 1-byte type tag + 4-byte BE length + payload. No padding, no checksum.

use serde::{Deserialize, Serialize};

/// Header size: type tag + length.
pub const HEADER_LEN: usize = 5;
/// Default ceiling for a single frame payload.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024; // 64 MiB

const TAG_TEXT: u8 = 1;
const TAG_BINARY: u8 = 2;

/// Payload kind carried in the type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameKind {
    Text,
    #[serde(rename = "bytes")]
    Binary,
}

impl FrameKind {
    pub fn tag(self) -> u8 {
        match self {
            FrameKind::Text => TAG_TEXT,
            FrameKind::Binary => TAG_BINARY,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            TAG_TEXT => Some(FrameKind::Text),
            TAG_BINARY => Some(FrameKind::Binary),
            _ => None,
        }
    }

    /// Label used in upward events ("text" / "bytes").
    pub fn label(self) -> &'static str {
        match self {
            FrameKind::Text => "text",
            FrameKind::Binary => "bytes",
        }
    }
}

/// One decoded frame. Text payloads are guaranteed valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(s: impl Into<String>) -> Self {
        Frame {
            kind: FrameKind::Text,
            payload: s.into().into_bytes(),
        }
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Frame {
            kind: FrameKind::Binary,
            payload: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as text, for Text frames.
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            FrameKind::Text => std::str::from_utf8(&self.payload).ok(),
            FrameKind::Binary => None,
        }
    }
}

/// Encode a frame header. Pure and total.
pub fn encode_header(kind: FrameKind, len: u32) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[0] = kind.tag();
    out[1..].copy_from_slice(&len.to_be_bytes());
    out
}

/// Encode a whole frame (header + payload) into one buffer.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Result<Vec<u8>, FrameEncodeError> {
    let len = checked_len(payload.len(), MAX_FRAME_LEN)?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(kind, len));
    out.extend_from_slice(payload);
    Ok(out)
}

/// Validate an outbound payload length against `max`.
pub fn checked_len(len: usize, max: u32) -> Result<u32, FrameEncodeError> {
    match u32::try_from(len) {
        Ok(n) if n <= max => Ok(n),
        _ => Err(FrameEncodeError::TooLarge(len)),
    }
}

/// Error encoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("payload of {0} bytes exceeds frame limit")]
    TooLarge(usize),
}

/// Error decoding one frame. The stream stays aligned after any of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("unknown frame type: {0}")]
    UnknownType(u8),
    #[error("failed to decode text payload")]
    InvalidUtf8,
    #[error("frame length {0} exceeds limit")]
    TooLarge(u32),
}

fn read_header(bytes: &[u8]) -> Option<(u8, u32)> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
    Some((bytes[0], len))
}

/// Decode one frame from the front of `bytes`.
///
/// Returns `None` when more data is needed; partial frames are never consumed.
/// Otherwise returns the decode outcome and how many bytes to drop from the front.
/// An oversized header consumes only the header, since its length can't be trusted;
/// an unknown tag consumes the whole declared frame.
pub fn try_decode_next(
    bytes: &[u8],
    max_len: u32,
) -> Option<(Result<Frame, FrameDecodeError>, usize)> {
    let (tag, len) = read_header(bytes)?;
    if len > max_len {
        return Some((Err(FrameDecodeError::TooLarge(len)), HEADER_LEN));
    }
    let total = HEADER_LEN + len as usize;
    if bytes.len() < total {
        return None;
    }
    let payload = &bytes[HEADER_LEN..total];
    let decoded = match FrameKind::from_tag(tag) {
        Some(FrameKind::Text) => match std::str::from_utf8(payload) {
            Ok(_) => Ok(Frame {
                kind: FrameKind::Text,
                payload: payload.to_vec(),
            }),
            Err(_) => Err(FrameDecodeError::InvalidUtf8),
        },
        Some(FrameKind::Binary) => Ok(Frame {
            kind: FrameKind::Binary,
            payload: payload.to_vec(),
        }),
        None => Err(FrameDecodeError::UnknownType(tag)),
    };
    Some((decoded, total))
}

/// Growable receive buffer with a consumed-prefix cursor.
/// Compaction happens lazily so large transfers stay amortized O(n).
#[derive(Debug, Default)]
pub struct ReceiveAccumulator {
    buf: Vec<u8>,
    start: usize,
}

impl ReceiveAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        if self.start > 0 && self.start >= self.buf.len() / 2 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    /// Drop `n` bytes from the front. Clamped to what is buffered.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.buf.len());
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Progress of the frame at the head of the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlight {
    pub kind: FrameKind,
    pub current: u32,
    pub total: u32,
}

/// Incremental decoder: feed arbitrary chunks, drain complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    acc: ReceiveAccumulator,
    max_len: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_len: u32) -> Self {
        Self {
            acc: ReceiveAccumulator::new(),
            max_len,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.acc.extend(bytes);
    }

    /// Next complete frame (or decode error), or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> Option<Result<Frame, FrameDecodeError>> {
        let (decoded, consumed) = try_decode_next(self.acc.as_slice(), self.max_len)?;
        self.acc.consume(consumed);
        Some(decoded)
    }

    /// Bytes received so far of the head frame. `None` when nothing is buffered.
    /// Before a full header is buffered, reports 0 of 0.
    pub fn in_flight(&self) -> Option<InFlight> {
        let bytes = self.acc.as_slice();
        let first = *bytes.first()?;
        let kind = FrameKind::from_tag(first).unwrap_or(FrameKind::Binary);
        match read_header(bytes) {
            Some((_, len)) => {
                let body = (bytes.len() - HEADER_LEN).min(len as usize) as u32;
                Some(InFlight {
                    kind,
                    current: body,
                    total: len,
                })
            }
            None => Some(InFlight {
                kind,
                current: 0,
                total: 0,
            }),
        }
    }

    pub fn buffered(&self) -> usize {
        self.acc.len()
    }
}

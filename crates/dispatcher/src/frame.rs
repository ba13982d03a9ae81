//! Wire framing for the local messaging transport (`spec.md §6`).
//!
//! `{u32 message_id; u8 priority; u8 reserved[3]; u32 payload_len; u32
//! source_tag}`, little-endian, followed by exactly `payload_len` payload
//! bytes. A fixed 16-byte header needs no serialization crate — raw
//! `to_le_bytes`/`from_le_bytes` mirrors the original's packed C struct.

pub const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: u32,
    pub priority: u8,
    pub payload_len: u32,
    pub source_tag: u32,
}

impl FrameHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.message_id.to_le_bytes());
        buf[4] = self.priority;
        // buf[5..8] reserved, left zeroed.
        buf[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        buf[12..16].copy_from_slice(&self.source_tag.to_le_bytes());
        buf
    }

    /// Decode a header from the first `HEADER_LEN` bytes of `buf`.
    /// Returns `None` if `buf` is shorter than a header
    /// (`DispatcherError::Corrupted` is raised by the caller, which knows
    /// the full declared length for a better error message).
    #[must_use]
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            message_id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            priority: buf[4],
            payload_len: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            source_tag: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// A complete frame: header plus exactly `header.payload_len` payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(message_id: u32, priority: u8, source_tag: u32, payload: Vec<u8>) -> Self {
        Self {
            header: FrameHeader {
                message_id,
                priority,
                payload_len: payload.len() as u32,
                source_tag,
            },
            payload,
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Try to pull one complete frame off the front of `buf`. Returns
    /// `(frame, bytes_consumed)`, or `None` if `buf` doesn't yet hold a
    /// full frame (wait for more bytes — this is not `Corrupted`, just
    /// incomplete; `Corrupted` is reserved for a header whose declared
    /// length the transport can never satisfy, which callers check
    /// against `max_msg_size` before calling this).
    #[must_use]
    pub fn try_decode(buf: &[u8]) -> Option<(Self, usize)> {
        let header = FrameHeader::decode(buf)?;
        let total = HEADER_LEN + header.payload_len as usize;
        if buf.len() < total {
            return None;
        }
        let payload = buf[HEADER_LEN..total].to_vec();
        Some((Self { header, payload }, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_via_try_decode() {
        let frame = Frame::new(101, 5, 42, b"hello".to_vec());
        let encoded = frame.encode();
        let (decoded, consumed) = Frame::try_decode(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let frame = Frame::new(101, 5, 42, b"hello".to_vec());
        let encoded = frame.encode();
        assert!(Frame::try_decode(&encoded[..encoded.len() - 1]).is_none());
    }
}

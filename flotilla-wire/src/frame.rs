//! Length-prefixed frame codec for the underlying byte stream.
//!
//! Every multipart envelope (see [`crate::protocol`]) is carried as a
//! sequence of these frames, one per message part, the last one of each
//! envelope having `more() == false`. The framing itself is
//! transport-agnostic: it runs unmodified over TCP or a Unix-domain IPC
//! stream.

use bytes::{Buf, Bytes, BytesMut};
use flotilla_core::buffer::SegmentedBuffer;
use std::io;
use thiserror::Error;

use crate::config::STAGING_BUF_INITIAL_CAP;

/// Wire framing errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("incomplete frame")]
    Incomplete,

    #[error("protocol violation: reserved bits set")]
    ReservedBits,

    #[error("protocol violation: frame size too large")]
    SizeTooLarge,

    #[error("protocol violation")]
    Protocol,
}

impl From<WireError> for io::Error {
    fn from(err: WireError) -> Self {
        Self::new(io::ErrorKind::InvalidData, err)
    }
}

impl From<io::Error> for WireError {
    fn from(_err: io::Error) -> Self {
        Self::Protocol
    }
}

pub type Result<T> = std::result::Result<T, WireError>;

/// A decoded wire frame.
#[derive(Debug, Clone)]
pub struct WireFrame {
    pub flags: u8,
    pub payload: Bytes,
}

impl WireFrame {
    #[inline]
    #[must_use]
    pub const fn more(&self) -> bool {
        (self.flags & 0x01) != 0
    }

    /// Create a data frame. `more` signals that further frames belong to
    /// the same envelope.
    #[must_use]
    pub const fn data(payload: Bytes, more: bool) -> Self {
        let mut flags = 0;
        if more {
            flags |= 0x01;
        }
        if payload.len() > 255 {
            flags |= 0x02;
        }
        Self { flags, payload }
    }

    /// Encode this frame to bytes.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let is_long = (self.flags & 0x02) != 0;
        let body_len = self.payload.len();

        let mut out = BytesMut::with_capacity(if is_long { 9 } else { 2 } + body_len);
        out.extend_from_slice(&[self.flags]);

        if is_long {
            out.extend_from_slice(&(body_len as u64).to_be_bytes());
        } else {
            out.extend_from_slice(&[body_len as u8]);
        }

        out.extend_from_slice(&self.payload);
        out.freeze()
    }
}

/// Stateful frame decoder.
///
/// Fast path: the entire frame is already present -> zero-copy slice.
/// Slow path: the frame is fragmented across reads -> reassembled into a
/// `BytesMut` staging buffer.
pub struct WireDecoder {
    pending_flags: Option<u8>,
    expected_body_len: usize,
    staging: BytesMut,
}

impl Default for WireDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl WireDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending_flags: None,
            expected_body_len: 0,
            staging: BytesMut::with_capacity(STAGING_BUF_INITIAL_CAP),
        }
    }

    /// True while reassembling a fragmented frame.
    #[inline]
    #[must_use]
    pub const fn has_pending(&self) -> bool {
        self.pending_flags.is_some()
    }

    /// Decode a single frame from `src`.
    ///
    /// - `Ok(Some(frame))` — frame decoded
    /// - `Ok(None)` — need more data
    /// - `Err` — protocol violation
    pub fn decode(&mut self, src: &mut SegmentedBuffer) -> Result<Option<WireFrame>> {
        if let Some(flags) = self.pending_flags {
            let needed = self.expected_body_len - self.staging.len();
            let take = needed.min(src.len());
            if let Some(bytes) = src.take_bytes(take) {
                self.staging.extend_from_slice(&bytes);
            }

            if self.staging.len() < self.expected_body_len {
                return Ok(None);
            }

            let payload = self.staging.split().freeze();
            self.pending_flags = None;
            self.expected_body_len = 0;

            return Ok(Some(WireFrame { flags, payload }));
        }

        if src.len() < 2 {
            return Ok(None);
        }

        let mut hdr = [0u8; 9];
        if !src.copy_prefix(2, &mut hdr) {
            return Ok(None);
        }

        let flags = hdr[0];

        // Reserved bits must be zero.
        if (flags & 0xF8) != 0 {
            return Err(WireError::ReservedBits);
        }

        let is_long = (flags & 0x02) != 0;
        let header_len = if is_long { 9 } else { 2 };

        if src.len() < header_len {
            return Ok(None);
        }

        let body_len = if is_long {
            if !src.copy_prefix(9, &mut hdr) {
                return Ok(None);
            }
            let mut buf = &hdr[1..9];
            let size = buf.get_u64();

            if size > 0x7FFF_FFFF_FFFF_FFFF {
                return Err(WireError::SizeTooLarge);
            }

            size as usize
        } else {
            hdr[1] as usize
        };

        let total_len = header_len + body_len;

        if src.len() >= total_len {
            src.advance(header_len);
            let payload = src
                .take_bytes(body_len)
                .expect("len check ensures body is available");
            return Ok(Some(WireFrame { flags, payload }));
        }

        src.advance(header_len);
        self.pending_flags = Some(flags);
        self.expected_body_len = body_len;
        self.staging.clear();

        let available = src.len().min(body_len);
        if let Some(bytes) = src.take_bytes(available) {
            self.staging.extend_from_slice(&bytes);
        }

        Ok(None)
    }
}

/// Encode a full multipart envelope directly into a buffer.
///
/// Zero-allocation helper avoiding intermediate `WireFrame` objects on the
/// hot path.
pub fn encode_multipart(msg: &[Bytes], buf: &mut BytesMut) {
    if msg.is_empty() {
        return;
    }

    for (i, part) in msg.iter().enumerate() {
        let more = i < msg.len() - 1;
        let is_long = part.len() >= 256;

        let mut flags = 0u8;
        if more {
            flags |= 0x01;
        }
        if is_long {
            flags |= 0x02;
        }

        buf.reserve(if is_long { 9 } else { 2 } + part.len());
        buf.extend_from_slice(&[flags]);

        if is_long {
            buf.extend_from_slice(&(part.len() as u64).to_be_bytes());
        } else {
            buf.extend_from_slice(&[part.len() as u8]);
        }

        buf.extend_from_slice(part);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_single_frame() {
        let mut buf = BytesMut::new();
        encode_multipart(&[Bytes::from_static(b"hello")], &mut buf);

        let mut seg = SegmentedBuffer::new();
        seg.push(buf.freeze());

        let mut dec = WireDecoder::new();
        let frame = dec.decode(&mut seg).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"hello"));
        assert!(!frame.more());
    }

    #[test]
    fn round_trip_multipart() {
        let parts = vec![
            Bytes::from_static(b"id-1"),
            Bytes::new(),
            Bytes::from_static(b"body"),
        ];
        let mut buf = BytesMut::new();
        encode_multipart(&parts, &mut buf);

        let mut seg = SegmentedBuffer::new();
        seg.push(buf.freeze());

        let mut dec = WireDecoder::new();
        let mut decoded = Vec::new();
        loop {
            match dec.decode(&mut seg).unwrap() {
                Some(frame) => {
                    let more = frame.more();
                    decoded.push(frame.payload);
                    if !more {
                        break;
                    }
                }
                None => break,
            }
        }
        assert_eq!(decoded, parts);
    }

    #[test]
    fn rejects_reserved_bits() {
        let mut seg = SegmentedBuffer::new();
        seg.push(Bytes::from_static(&[0xF8, 0x00]));
        let mut dec = WireDecoder::new();
        assert!(matches!(dec.decode(&mut seg), Err(WireError::ReservedBits)));
    }

    #[test]
    fn handles_fragmented_frame() {
        let mut buf = BytesMut::new();
        encode_multipart(&[Bytes::from_static(b"0123456789")], &mut buf);
        let whole = buf.freeze();

        let mut seg = SegmentedBuffer::new();
        seg.push(whole.slice(0..3));
        let mut dec = WireDecoder::new();
        assert!(dec.decode(&mut seg).unwrap().is_none());

        seg.push(whole.slice(3..));
        let frame = dec.decode(&mut seg).unwrap().unwrap();
        assert_eq!(frame.payload, Bytes::from_static(b"0123456789"));
    }
}

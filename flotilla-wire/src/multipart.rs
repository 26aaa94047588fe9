use crate::frame::WireFrame;
use bytes::Bytes;

/// Errors produced by [`FrameAssembler`].
#[derive(Debug)]
pub enum MultipartError {
    /// Envelope exceeded the configured frame count.
    TooManyFrames,
    /// Envelope exceeded the configured byte size.
    TooLarge,
}

/// Collects wire frames until a complete multipart envelope is formed.
///
/// Invariants:
/// - Frames are appended in order.
/// - An envelope completes when `more() == false`.
/// - Limits are enforced eagerly to bound memory use from a misbehaving peer.
///
/// Not thread-safe by design; owned by a single connection's read loop.
pub struct FrameAssembler {
    frames: Vec<Bytes>,
    frame_count: usize,
    byte_count: usize,

    max_frames: usize,
    max_bytes: usize,
}

impl FrameAssembler {
    /// `max_frames`/`max_bytes` bound a single envelope; the broker/client
    /// protocol's longest envelope (a worker REQUEST frame) has 6 parts,
    /// so the defaults leave ample headroom.
    #[must_use]
    pub const fn new(max_frames: usize, max_bytes: usize) -> Self {
        Self {
            frames: Vec::new(),
            frame_count: 0,
            byte_count: 0,
            max_frames,
            max_bytes,
        }
    }

    /// Push a frame into the buffer.
    ///
    /// - `Ok(None)` — the envelope is not complete yet.
    /// - `Ok(Some(frames))` — a full envelope was assembled.
    /// - `Err` — protocol or resource violation; the assembler resets.
    pub fn push_frame(&mut self, frame: WireFrame) -> Result<Option<Vec<Bytes>>, MultipartError> {
        let payload = frame.payload.clone();

        self.frame_count += 1;
        if self.frame_count > self.max_frames {
            self.reset();
            return Err(MultipartError::TooManyFrames);
        }

        self.byte_count += payload.len();
        if self.byte_count > self.max_bytes {
            self.reset();
            return Err(MultipartError::TooLarge);
        }

        self.frames.push(payload);

        if frame.more() {
            Ok(None)
        } else {
            let msg = std::mem::take(&mut self.frames);
            self.reset();
            Ok(Some(msg))
        }
    }

    #[inline]
    fn reset(&mut self) {
        self.frames.clear();
        self.frame_count = 0;
        self.byte_count = 0;
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new(128, 8 * 1024 * 1024)
    }
}

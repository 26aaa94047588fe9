//! Fluent builder for multipart envelopes.

use bytes::Bytes;
use std::io;

/// A multipart envelope builder with ergonomic frame construction.
///
/// # Examples
///
/// ```
/// use flotilla_wire::message::Message;
///
/// let msg = Message::new()
///     .push_str("echo")
///     .push(b"data")
///     .into_frames();
/// assert_eq!(msg.len(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Message {
    frames: Vec<Bytes>,
}

impl Message {
    #[must_use]
    pub const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    #[must_use]
    pub const fn from_frames(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }

    /// Add a frame from anything convertible to `Bytes`.
    #[must_use]
    pub fn push(mut self, frame: impl Into<Bytes>) -> Self {
        self.frames.push(frame.into());
        self
    }

    /// Add a UTF-8 string frame.
    #[must_use]
    pub fn push_str(mut self, s: &str) -> Self {
        self.frames.push(Bytes::copy_from_slice(s.as_bytes()));
        self
    }

    /// Add a frame with JSON-serialized data.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn push_json<T: serde::Serialize>(mut self, value: &T) -> io::Result<Self> {
        let json = serde_json::to_vec(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.frames.push(Bytes::from(json));
        Ok(self)
    }

    /// Add an empty frame (envelope delimiter).
    #[must_use]
    pub fn push_empty(mut self) -> Self {
        self.frames.push(Bytes::new());
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    #[must_use]
    pub fn into_frames(self) -> Vec<Bytes> {
        self.frames
    }

    /// Parse a frame as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame doesn't exist or isn't valid JSON.
    pub fn parse_frame_json<T: serde::de::DeserializeOwned>(&self, index: usize) -> io::Result<T> {
        let frame = self
            .frames
            .get(index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame index out of bounds"))?;

        serde_json::from_slice(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Parse a frame as a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame doesn't exist or isn't valid UTF-8.
    pub fn parse_frame_str(&self, index: usize) -> io::Result<&str> {
        let frame = self
            .frames
            .get(index)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame index out of bounds"))?;

        std::str::from_utf8(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl From<Vec<Bytes>> for Message {
    fn from(frames: Vec<Bytes>) -> Self {
        Self { frames }
    }
}

impl From<Message> for Vec<Bytes> {
    fn from(msg: Message) -> Self {
        msg.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_builder() {
        let msg = Message::new()
            .push(&b"frame1"[..])
            .push_str("frame2")
            .push_empty()
            .push(vec![1, 2, 3]);

        assert_eq!(msg.len(), 4);
        assert_eq!(msg.frames()[0], b"frame1"[..]);
        assert_eq!(msg.frames()[1], b"frame2"[..]);
        assert_eq!(msg.frames()[2], b""[..]);
        assert_eq!(msg.frames()[3], &[1, 2, 3][..]);
    }

    #[test]
    fn test_json_round_trip() {
        #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
        struct Data {
            value: u32,
        }

        let msg = Message::new()
            .push_str("echo")
            .push_json(&Data { value: 42 })
            .unwrap();

        assert_eq!(msg.len(), 2);
        let parsed: Data = msg.parse_frame_json(1).unwrap();
        assert_eq!(parsed, Data { value: 42 });
    }
}

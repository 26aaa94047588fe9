//! Flotilla wire
//!
//! The framed, Majordomo-like protocol spoken between clients, the
//! broker, and workers:
//! - Length-prefixed frame codec (`frame`)
//! - Multipart envelope reassembly (`multipart`)
//! - Fluent envelope builder (`message`)
//! - Protocol constants and envelope parsing (`protocol`)
//! - JSON request/reply body shapes (`payload`)
//! - Buffer sizing knobs (`config`)

#![deny(unsafe_code)]

pub mod config;
pub mod frame;
pub mod message;
pub mod multipart;
pub mod payload;
pub mod protocol;

pub mod prelude {
    pub use crate::config::BufferConfig;
    pub use crate::frame::{encode_multipart, WireDecoder, WireError, WireFrame};
    pub use crate::message::Message;
    pub use crate::multipart::{FrameAssembler, MultipartError};
    pub use crate::payload::{LocalizedString, ReplyBody, RequestBody, StatusPayload};
    pub use crate::protocol::{self, Frame};
}

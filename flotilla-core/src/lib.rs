//! Flotilla core
//!
//! Runtime-agnostic building blocks shared by the broker, the worker
//! runtime, and procman:
//! - Pinned / io_uring-safe allocation (`alloc`)
//! - Split-pump socket actor (`actor`)
//! - ROUTER hub + peer map (`router`)
//! - Named event bus, private/joint scope (`events`)
//! - Byte-based backpressure (`backpressure`)
//! - Zero-copy segmented buffer (`buffer`)
//! - Transport endpoint addressing (`endpoint`)
//! - Error types and wire reply taxonomy (`error`)

#![deny(unsafe_code)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::needless_pass_by_ref_mut)]
#![allow(clippy::match_same_arms)]

pub mod actor;
pub mod alloc;
pub mod backpressure;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod router;

/// A small prelude for downstream crates.
pub mod prelude {
    pub use crate::actor::{SocketActor, SocketEvent, UserCmd};
    pub use crate::alloc::{IoArena, SlabMut};
    pub use crate::backpressure::{BytePermits, NoOpPermits, Permit};
    pub use crate::buffer::SegmentedBuffer;
    pub use crate::endpoint::{Endpoint, EndpointError};
    pub use crate::error::{FlotillaError, ReplyStatus, Result};
    pub use crate::events::{Event, EventScope, EventsCmd, EventsHub, EventsHubEvent};
    pub use crate::router::{HubEvent, PeerCmd, RouterBehavior, RouterCmd, RouterHub};
}
